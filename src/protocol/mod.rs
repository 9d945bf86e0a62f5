//! Frame codecs for the two serial protocol families spoken on the rig.
//!
//! - [`modbus_rtu`]: CRC16-checked frames used by the mass-flow controllers and
//!   the PLC interlock.
//! - [`aibus`]: sum-checksum frames used by the dual-zone temperature controller.
//!
//! Both codecs are pure: they build request bytes and decode response bytes.
//! A malformed, short or checksum-failing response decodes to `None`; callers
//! treat that as "no value this cycle". Moving bytes over a port is the job of
//! [`crate::hardware::link`].

pub mod aibus;
pub mod modbus_rtu;

/// Raw counts spanning a flow controller's full scale (12-bit converter).
pub const FULL_SCALE_COUNTS: f64 = 4095.0;

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Conversion between a flow controller's raw register counts and physical flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowScale {
    full_scale: f64,
}

impl FlowScale {
    /// Scale for a channel whose full scale reads `full_scale`. Returns `None`
    /// for a zero, negative or non-finite full scale.
    pub fn new(full_scale: f64) -> Option<Self> {
        (full_scale.is_finite() && full_scale > 0.0).then_some(Self { full_scale })
    }

    /// Full scale in physical units.
    pub fn full_scale(&self) -> f64 {
        self.full_scale
    }

    /// Physical units per raw count.
    pub fn factor(&self) -> f64 {
        self.full_scale / FULL_SCALE_COUNTS
    }

    /// Encode a physical value, rounded to the nearest count and clamped to the
    /// converter span.
    pub fn to_raw(&self, value: f64) -> u16 {
        let counts = (value / self.factor()).round().clamp(0.0, FULL_SCALE_COUNTS);
        counts as u16
    }

    /// Decode raw counts without rounding.
    pub fn to_physical(&self, raw: u16) -> f64 {
        f64::from(raw) * self.factor()
    }

    /// Decode raw counts for display, rounded to one decimal.
    pub fn to_display(&self, raw: u16) -> f64 {
        round1(self.to_physical(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round1_rounds_half_away_from_zero() {
        assert_eq!(round1(1.25), 1.3);
        assert_eq!(round1(-0.04), -0.0);
        assert_eq!(round1(12.0), 12.0);
    }

    #[test]
    fn scale_rejects_degenerate_full_scale() {
        assert!(FlowScale::new(0.0).is_none());
        assert!(FlowScale::new(f64::NAN).is_none());
        assert!(FlowScale::new(500.0).is_some());
    }

    #[test]
    fn quantization_is_within_half_a_count() {
        let scale = FlowScale::new(500.0).unwrap();
        let bound = 0.5 * (500.0 / 4095.0) + 1e-9;
        let mut v = 0.0;
        while v <= 500.0 {
            let back = scale.to_physical(scale.to_raw(v));
            assert!((back - v).abs() <= bound, "{v} -> {back}");
            v += 0.37;
        }
    }

    #[test]
    fn out_of_span_values_clamp() {
        let scale = FlowScale::new(200.0).unwrap();
        assert_eq!(scale.to_raw(-3.0), 0);
        assert_eq!(scale.to_raw(1000.0), 4095);
        assert_eq!(scale.to_display(4095), 200.0);
    }
}
