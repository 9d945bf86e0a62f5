//! Byte transport under the frame codecs.
//!
//! A [`Link`] is owned by exactly one device worker thread. All calls are
//! blocking and bounded by the port's per-frame timeout. A short read is not an
//! I/O error: it comes back as fewer bytes and the codec rejects the frame.

use std::io;
use std::thread;
use std::time::Duration;

use tracing::trace;

/// Blocking byte transport.
pub trait Link: Send {
    /// Write a whole request frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Read up to `len` bytes, stopping early when the frame timeout expires.
    fn read_frame(&mut self, len: usize) -> io::Result<Vec<u8>>;

    /// Discard stale input before a new request.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One request/response round trip: clear, write, wait `settle`, single read.
pub fn transact(
    link: &mut dyn Link,
    request: &[u8],
    response_len: usize,
    settle: Duration,
) -> io::Result<Vec<u8>> {
    link.clear_input()?;
    link.write_frame(request)?;
    if !settle.is_zero() {
        thread::sleep(settle);
    }
    let response = link.read_frame(response_len)?;
    trace!(request = ?request, response = ?response, "serial round trip");
    Ok(response)
}

/// Character framing, fixed per protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// 8 data bits, no parity, 1 stop bit (sum-checksum family)
    EightNoneOne,
    /// 8 data bits, no parity, 2 stop bits (CRC16 family)
    EightNoneTwo,
}

#[cfg(feature = "instrument_serial")]
pub use serial::SerialLink;

#[cfg(feature = "instrument_serial")]
mod serial {
    use std::io::{self, Read, Write};
    use std::time::{Duration, Instant};

    use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
    use tracing::info;

    use super::{Framing, Link};
    use crate::config::PortConfig;
    use crate::error::AppResult;

    /// A real serial port.
    pub struct SerialLink {
        port: Box<dyn SerialPort>,
        timeout: Duration,
    }

    impl SerialLink {
        /// Open `config.port` with the framing of the device's protocol family.
        pub fn open(config: &PortConfig, framing: Framing) -> AppResult<Self> {
            let stop_bits = match framing {
                Framing::EightNoneOne => StopBits::One,
                Framing::EightNoneTwo => StopBits::Two,
            };
            let timeout = Duration::from_millis(config.timeout_ms);
            let port = serialport::new(&config.port, config.baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(stop_bits)
                .timeout(timeout)
                .open()?;
            info!(port = %config.port, baud = config.baud_rate, ?framing, "Opened serial link");
            Ok(Self { port, timeout })
        }
    }

    impl Link for SerialLink {
        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.port.write_all(frame)?;
            self.port.flush()
        }

        fn read_frame(&mut self, len: usize) -> io::Result<Vec<u8>> {
            let deadline = Instant::now() + self.timeout;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len && Instant::now() < deadline {
                match self.port.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        last: Vec<u8>,
        cleared: usize,
    }

    impl Link for Echo {
        fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.last = frame.to_vec();
            Ok(())
        }

        fn read_frame(&mut self, len: usize) -> io::Result<Vec<u8>> {
            Ok(self.last.iter().copied().take(len).collect())
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.cleared += 1;
            Ok(())
        }
    }

    #[test]
    fn transact_clears_then_reads_back() {
        let mut link = Echo {
            last: Vec::new(),
            cleared: 0,
        };
        let reply = transact(&mut link, &[1, 2, 3, 4], 2, Duration::ZERO).unwrap();
        assert_eq!(reply, vec![1, 2]);
        assert_eq!(link.cleared, 1);
    }
}
