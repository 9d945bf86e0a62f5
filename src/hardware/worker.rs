//! Device worker: one OS thread per serial link.
//!
//! Each worker owns its [`Link`] exclusively and runs a fixed-period loop:
//!
//! ```text
//! ┌─ drain every queued command (FIFO) ── write frames
//! │  poll every channel ───────────────── read frames into the private cache
//! │  publish a clone of the cache ─────── watch channel
//! └─ sleep in short slices until the period ends or stop is requested
//! ```
//!
//! Other threads talk to it through two narrow channels: an unbounded
//! `tokio::sync::mpsc` command queue and a `tokio::sync::watch` snapshot. Readers
//! always receive a full copy, never a view into the live cache.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::link::Link;

const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Protocol-family specific half of a worker: how to apply one command and how
/// to refresh the channel cache.
pub trait DevicePoller: Send + 'static {
    /// Pending write request
    type Command: Send + fmt::Debug + 'static;
    /// Copy of all channel caches
    type Snapshot: Clone + Default + Send + Sync + fmt::Debug + 'static;

    /// Transmit one command. An `Err` is a link error; the command is dropped.
    fn write(&mut self, link: &mut dyn Link, command: &Self::Command) -> io::Result<()>;

    /// Read every channel into `cache`. Undecodable replies clear the affected
    /// field; link errors leave the last known value in place.
    fn poll(&mut self, link: &mut dyn Link, cache: &mut Self::Snapshot);
}

/// Handle-side view of a running device worker.
pub trait DeviceWorker: Send + Sync {
    /// Pending write request
    type Command;
    /// Published state
    type Snapshot;

    /// Queue a command for the next drain. Never blocks.
    fn enqueue(&self, command: Self::Command);

    /// Most recently published snapshot.
    fn latest_snapshot(&self) -> Self::Snapshot;

    /// Request termination and wait for the worker thread to release its link.
    fn stop(&self);
}

/// The loop body, separate from the thread so a single cycle can be driven
/// directly.
pub struct DeviceLoop<P: DevicePoller> {
    name: String,
    link: Box<dyn Link>,
    poller: P,
    cache: P::Snapshot,
}

impl<P: DevicePoller> DeviceLoop<P> {
    /// Wrap a link and a poller.
    pub fn new(name: impl Into<String>, link: Box<dyn Link>, poller: P) -> Self {
        Self {
            name: name.into(),
            link,
            poller,
            cache: P::Snapshot::default(),
        }
    }

    /// Worker name used in logs and the thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// One iteration: drain all queued commands, then poll. Returns the new
    /// snapshot.
    pub fn cycle(&mut self, commands: &mut mpsc::UnboundedReceiver<P::Command>) -> P::Snapshot {
        while let Ok(command) = commands.try_recv() {
            debug!(worker = %self.name, ?command, "applying command");
            if let Err(e) = self.poller.write(self.link.as_mut(), &command) {
                warn!(worker = %self.name, ?command, error = %e, "command write failed");
            }
        }
        self.poller.poll(self.link.as_mut(), &mut self.cache);
        self.cache.clone()
    }
}

/// Owning handle to a worker thread.
pub struct WorkerHandle<C, S> {
    name: String,
    commands: mpsc::UnboundedSender<C>,
    snapshots: watch::Receiver<S>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Start a worker thread running `device` every `period`.
pub fn spawn_worker<P: DevicePoller>(
    device: DeviceLoop<P>,
    period: Duration,
) -> io::Result<WorkerHandle<P::Command, P::Snapshot>> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(P::Snapshot::default());
    let stop = Arc::new(AtomicBool::new(false));
    let name = device.name().to_string();

    let thread = thread::Builder::new().name(format!("worker-{name}")).spawn({
        let stop = stop.clone();
        move || run_loop(device, command_rx, snapshot_tx, stop, period)
    })?;

    Ok(WorkerHandle {
        name,
        commands: command_tx,
        snapshots: snapshot_rx,
        stop,
        thread: Mutex::new(Some(thread)),
    })
}

fn run_loop<P: DevicePoller>(
    mut device: DeviceLoop<P>,
    mut commands: mpsc::UnboundedReceiver<P::Command>,
    snapshots: watch::Sender<P::Snapshot>,
    stop: Arc<AtomicBool>,
    period: Duration,
) {
    info!(worker = %device.name, period_ms = period.as_millis() as u64, "device worker started");
    while !stop.load(Ordering::Acquire) {
        let deadline = Instant::now() + period;
        let snapshot = device.cycle(&mut commands);
        snapshots.send_replace(snapshot);

        while !stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
    let name = device.name.clone();
    // Releases the serial handle on this thread.
    drop(device);
    info!(worker = %name, "device worker stopped");
}

impl<C, S: Clone> WorkerHandle<C, S> {
    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receiver for display collaborators that want change notification.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.snapshots.clone()
    }

    /// True once the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        match self.thread.lock() {
            Ok(guard) => guard.as_ref().map_or(true, JoinHandle::is_finished),
            Err(_) => true,
        }
    }

    fn join(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(worker = %self.name, "device worker panicked");
            }
        }
    }
}

impl<C, S> DeviceWorker for WorkerHandle<C, S>
where
    C: Send + fmt::Debug,
    S: Clone + Send + Sync,
{
    type Command = C;
    type Snapshot = S;

    fn enqueue(&self, command: C) {
        if let Err(e) = self.commands.send(command) {
            warn!(worker = %self.name, command = ?e.0, "worker stopped, command dropped");
        }
    }

    fn latest_snapshot(&self) -> S {
        self.snapshots.borrow().clone()
    }

    fn stop(&self) {
        self.join();
    }
}

impl<C, S> Drop for WorkerHandle<C, S> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullLink;

    impl Link for NullLink {
        fn write_frame(&mut self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn read_frame(&mut self, _len: usize) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    /// Counts polls and sums written values.
    #[derive(Default)]
    struct Counter {
        written: u32,
    }

    impl DevicePoller for Counter {
        type Command = u32;
        type Snapshot = (u32, u32);

        fn write(&mut self, _link: &mut dyn Link, command: &u32) -> io::Result<()> {
            self.written += command;
            Ok(())
        }

        fn poll(&mut self, _link: &mut dyn Link, cache: &mut (u32, u32)) {
            cache.0 += 1;
            cache.1 = self.written;
        }
    }

    #[test]
    fn cycle_drains_queue_before_poll() {
        let mut device = DeviceLoop::new("counter", Box::new(NullLink), Counter::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 1..=3 {
            tx.send(i).unwrap();
        }
        // All three writes land before the poll copies the total.
        assert_eq!(device.cycle(&mut rx), (1, 6));
        assert!(rx.try_recv().is_err());
        assert_eq!(device.cycle(&mut rx), (2, 6));
    }

    #[test]
    fn worker_publishes_and_stops() {
        let device = DeviceLoop::new("counter", Box::new(NullLink), Counter::default());
        let handle = spawn_worker(device, Duration::from_millis(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.latest_snapshot().0 < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.latest_snapshot().0 >= 3);
        handle.stop();
        assert!(handle.is_finished());
        // enqueue after stop only logs
        handle.enqueue(7);
    }
}
