//! Virtual time
//!
//! Simulation time is a plain `f64` in model units. The clock never moves
//! backwards; only the scheduler advances it, and only between time strata.

use super::error::{SimError, SimResult};

/// A point in virtual time
pub type SimTime = f64;

/// Monotonic virtual clock
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    now: SimTime,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self { now: 0.0 }
    }

    /// Current virtual time
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Advance to `time`.
    ///
    /// Returns true if the clock moved. Moving backwards is a kernel fault.
    pub fn advance_to(&mut self, time: SimTime) -> SimResult<bool> {
        if !time.is_finite() || time < self.now {
            return Err(SimError::KernelFault {
                time: self.now,
                detail: format!("attempt to move time backwards to {time}"),
                queue: String::new(),
            });
        }
        if time > self.now {
            self.now = time;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_zero() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), 0.0);
    }

    #[test]
    fn test_advance_forward() {
        let mut clock = VirtualClock::new();
        assert_eq!(clock.advance_to(5.0), Ok(true));
        assert_eq!(clock.now(), 5.0);

        // Same time is not an advance
        assert_eq!(clock.advance_to(5.0), Ok(false));
        assert_eq!(clock.now(), 5.0);
    }

    #[test]
    fn test_advance_backwards_is_fault() {
        let mut clock = VirtualClock::new();
        clock.advance_to(10.0).unwrap();
        let err = clock.advance_to(9.0).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(clock.now(), 10.0);
    }

    #[test]
    fn test_advance_to_nan_is_fault() {
        let mut clock = VirtualClock::new();
        assert!(clock.advance_to(f64::NAN).is_err());
    }
}
