//! The SPI Bus Gateway and the Transaction Serializer that guards it.
//!
//! `BusState` is the "locked-SPI token" from the spec: whoever holds `&mut BusState` is the
//! only party allowed to touch the wire right now. [`TransactionSerializer`] is the sole
//! owner of the lock that hands that token out -- nothing outside this module ever reaches
//! into `spi`/`cs` directly, which is what keeps "is CSN low" and "who holds the token"
//! from drifting out of sync the way a hand-rolled boolean flag could.

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;

use crate::error::Error;

/// The SPI Bus Gateway: raw transfer/receive primitives plus CSN control.
///
/// Every method here assumes exclusive access -- it is only ever reached through a
/// [`TransactionSerializer`] guard or a nested call that was handed one.
pub struct BusState<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI, CS> BusState<SPI, CS>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    pub(crate) fn new(spi: SPI, cs: CS) -> Self {
        Self { spi, cs }
    }

    /// Write bytes to the bus, discarding whatever comes back on MISO.
    pub(crate) async fn transfer(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.spi.write(bytes).await.map_err(|_| Error::Wire)
    }

    /// Read one byte, clocking out 0xFF.
    pub(crate) async fn read_byte(&mut self) -> Result<u8, Error> {
        let mut buf = [0xFFu8];
        self.spi.transfer_in_place(&mut buf).await.map_err(|_| Error::Wire)?;
        Ok(buf[0])
    }

    /// Fill `buf` by clocking out 0xFF for each byte.
    pub(crate) async fn receive_into(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        buf.fill(0xFF);
        self.spi.transfer_in_place(buf).await.map_err(|_| Error::Wire)
    }

    /// The CMD55 -> ACMD response-alignment dance: deassert CSN, clock one 0xFF byte,
    /// reassert CSN. Load-bearing on some cards even though it looks redundant.
    pub(crate) async fn cycle_csn(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Wire)?;
        self.spi.write(&[0xFF]).await.map_err(|_| Error::Wire)?;
        self.cs.set_low().map_err(|_| Error::Wire)
    }

    async fn assert_csn(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Wire)
    }

    /// Deassert CSN and clock one trailing 0xFF byte so the card can finish whatever it
    /// was doing. Must run on every exit path, success or error.
    async fn release_csn(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Wire)?;
        self.spi.write(&[0xFF]).await.map_err(|_| Error::Wire)
    }

    pub(crate) fn spi_mut(&mut self) -> &mut SPI {
        &mut self.spi
    }
}

/// FIFO-fair queue of pending bus-using operations.
///
/// Backed by an `embassy-sync` mutex: on a single-threaded executor its waiter list already
/// gives the strict FIFO wakeup order the spec asks for, so there is no separate queue data
/// structure to keep in sync with it.
pub struct TransactionSerializer<SPI, CS> {
    bus: Mutex<NoopRawMutex, BusState<SPI, CS>>,
}

impl<SPI, CS> TransactionSerializer<SPI, CS>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    pub(crate) fn new(spi: SPI, cs: CS) -> Self {
        Self { bus: Mutex::new(BusState::new(spi, cs)) }
    }

    /// Run `body` with exclusive ownership of the bus: `postAcquire` (lock + CSN low) runs
    /// first, `body` runs with the token, and `preRelease` (CSN high + trailing clock byte)
    /// runs unconditionally afterwards, even if `body` returned `Err`.
    ///
    /// `body` may issue further calls against the same `&mut BusState` -- those are the
    /// "nested" operations from the spec, sharing this one token instead of re-enqueuing.
    ///
    /// `body` is taken as `AsyncFnOnce` rather than a plain closure returning a named
    /// `Future` type: a closure's returned future borrows from its `&mut BusState` argument,
    /// and the elided lifetime on that argument makes the bound higher-ranked, so a single
    /// named `Fut` type could never be valid for every possible borrow. `AsyncFnOnce` avoids
    /// naming that type at all.
    pub async fn transaction<F, T>(&self, body: F) -> Result<T, Error>
    where
        F: AsyncFnOnce(&mut BusState<SPI, CS>) -> Result<T, Error>,
    {
        let mut guard = self.bus.lock().await;
        guard.assert_csn().await?;
        let result = body(&mut guard).await;
        // preRelease must run on every exit path, so it is not gated on `result` being Ok.
        // If `body` already failed that error takes priority; a release failure on top of
        // it would just be the card not caring about the trailing clock byte post-fault.
        let release = guard.release_csn().await;
        result.and_then(|t| release.map(|_| t))
    }

    /// Access the bus outside of a transaction, for operations (like reconfiguring the
    /// clock) that don't involve CSN at all.
    pub(crate) async fn with_bus<F, T>(&self, body: F) -> T
    where
        F: AsyncFnOnce(&mut BusState<SPI, CS>) -> T,
    {
        let mut guard = self.bus.lock().await;
        body(&mut guard).await
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::cell::RefCell;
    use std::convert::Infallible;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Clone)]
    struct MockCs(Rc<RefCell<Vec<bool>>>);

    impl embedded_hal::digital::ErrorType for MockCs {
        type Error = Infallible;
    }

    impl embedded_hal::digital::OutputPin for MockCs {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(false);
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(true);
            Ok(())
        }
    }

    struct MockSpi;

    impl embedded_hal::spi::ErrorType for MockSpi {
        type Error = Infallible;
    }

    impl embedded_hal_async::spi::SpiBus for MockSpi {
        async fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            self.transfer_in_place(words).await
        }
        async fn write(&mut self, _words: &[u8]) -> Result<(), Infallible> {
            Ok(())
        }
        async fn transfer(&mut self, read: &mut [u8], _write: &[u8]) -> Result<(), Infallible> {
            self.transfer_in_place(read).await
        }
        async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            words.fill(0xFF);
            Ok(())
        }
        async fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    #[test]
    fn transaction_releases_csn_even_when_body_fails() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let bus = TransactionSerializer::new(MockSpi, MockCs(log.clone()));

        let result: Result<(), Error> =
            pollster::block_on(bus.transaction(async move |_b| Err(Error::Wire)));

        assert!(result.is_err());
        assert_eq!(&*log.borrow(), &[false, true]);
    }

    #[test]
    fn transaction_cycles_csn_low_then_high_on_success() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let bus = TransactionSerializer::new(MockSpi, MockCs(log.clone()));

        let result = pollster::block_on(bus.transaction(async move |_b| Ok(())));

        assert!(result.is_ok());
        assert_eq!(&*log.borrow(), &[false, true]);
    }
}
