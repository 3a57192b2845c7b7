//! The Card Presence Monitor: wraps the active-low card-detect (`PPN`) pin.

use crate::error::Error;

/// Thin wrapper around the card-detect GPIO, active low (pin level low == card present).
pub struct PresenceMonitor<PPN> {
    pin: PPN,
}

impl<PPN> PresenceMonitor<PPN>
where
    PPN: embedded_hal::digital::InputPin + embedded_hal_async::digital::Wait,
{
    pub fn new(pin: PPN) -> Self {
        Self { pin }
    }

    /// Current presence, read synchronously.
    pub fn is_present(&mut self) -> Result<bool, Error> {
        self.pin.is_low().map_err(|_| Error::Wire)
    }

    /// Suspend until the card-detect line changes level, then report the new presence.
    ///
    /// A caller that only acts on a genuine state change (as opposed to every edge the GPIO
    /// peripheral happens to report) naturally avoids re-running init on a spurious
    /// same-state edge, since the reported presence is compared against the last known
    /// value by the caller.
    pub async fn wait_for_change(&mut self) -> Result<bool, Error> {
        self.pin.wait_for_any_edge().await.map_err(|_| Error::Wire)?;
        self.is_present()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::convert::Infallible;

    struct MockPin {
        low: bool,
    }

    impl embedded_hal::digital::ErrorType for MockPin {
        type Error = Infallible;
    }

    impl embedded_hal::digital::InputPin for MockPin {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(!self.low)
        }
        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(self.low)
        }
    }

    impl embedded_hal_async::digital::Wait for MockPin {
        async fn wait_for_high(&mut self) -> Result<(), Infallible> {
            self.low = false;
            Ok(())
        }
        async fn wait_for_low(&mut self) -> Result<(), Infallible> {
            self.low = true;
            Ok(())
        }
        async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
            self.low = false;
            Ok(())
        }
        async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
            self.low = true;
            Ok(())
        }
        async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
            self.low = !self.low;
            Ok(())
        }
    }

    #[test]
    fn is_present_reflects_active_low_pin() {
        let mut monitor = PresenceMonitor::new(MockPin { low: true });
        assert!(monitor.is_present().unwrap());

        let mut monitor = PresenceMonitor::new(MockPin { low: false });
        assert!(!monitor.is_present().unwrap());
    }

    #[test]
    fn wait_for_change_reports_level_after_the_edge() {
        let mut monitor = PresenceMonitor::new(MockPin { low: false });
        let present = pollster::block_on(monitor.wait_for_change()).unwrap();
        assert!(present);
    }
}
