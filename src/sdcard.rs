//! Ties the Transaction Serializer, Command/Init Controllers, Block I/O Engine, and Card
//! Presence Monitor together into the single public handle, [`SdCard`].

use crate::block::{self, BLOCK_SIZE};
use crate::clock::ClockControl;
use crate::error::Error;
use crate::event::Event;
use crate::fmt::{debug, warn_log};
use crate::init::{self, CardType};
use crate::monitor::PresenceMonitor;
use crate::transaction::TransactionSerializer;

/// Settle time the spec asks for between observing a card-detect edge and starting the
/// handshake.
const POWER_UP_SETTLE_MS: u32 = 1;

/// A bound SD/MMC card, in the `absent -> present -> initializing -> ready` lifecycle of
/// §3. One `SdCard` owns exactly one card slot; it is not meant to be shared across tasks
/// (the internal [`TransactionSerializer`] exists to order *nested* bus operations within
/// one call, not to arbitrate multiple independent owners).
pub struct SdCard<SPI, CS, D, CLK, PPN> {
    bus: TransactionSerializer<SPI, CS>,
    delay: D,
    clock: CLK,
    monitor: PresenceMonitor<PPN>,
    present: bool,
    ready: bool,
    waiting: bool,
    card_type: CardType,
}

impl<SPI, CS, D, CLK, PPN> SdCard<SPI, CS, D, CLK, PPN>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
    D: embedded_hal_async::delay::DelayNs,
    CLK: ClockControl,
    PPN: embedded_hal::digital::InputPin + embedded_hal_async::digital::Wait,
{
    /// Bind a card slot to its SPI bus, chip select, delay source, clock control, and
    /// card-detect pin. No bus traffic happens until presence is observed.
    pub fn bind(spi: SPI, cs: CS, delay: D, clock: CLK, detect: PPN) -> Self {
        Self {
            bus: TransactionSerializer::new(spi, cs),
            delay,
            clock,
            monitor: PresenceMonitor::new(detect),
            present: false,
            ready: false,
            waiting: false,
            card_type: CardType::Unknown,
        }
    }

    /// Last observed card-detect level.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Whether the card has completed initialization and `read_block`/`write_block` may be
    /// used.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Request re-initialization. Takes effect on the next observed insertion, per the
    /// spec's `waiting` flag semantics; it does not itself touch the bus.
    pub fn restart(&mut self) {
        self.waiting = true;
    }

    /// Wait for the next card-detect edge and react to it: emit `inserted`/`removed`, and
    /// run the Initialization Controller when an insertion should (re)bring the card to
    /// `ready`. A spurious edge that doesn't change presence is a no-op.
    ///
    /// Call this from the same task/loop that issues `read_block`/`write_block`, e.g. in a
    /// `select` against the next client request -- `&mut self` here intentionally prevents
    /// it from being spawned as an independent background task, since the spec's
    /// concurrency model is a single cooperative execution context, not one task per
    /// component.
    pub async fn poll<F: FnMut(Event)>(&mut self, mut on_event: F) -> Result<(), Error> {
        let now_present = self.monitor.wait_for_change().await?;
        if now_present == self.present {
            return Ok(());
        }
        self.present = now_present;

        if !now_present {
            self.ready = false;
            on_event(Event::Removed);
            return Ok(());
        }

        on_event(Event::Inserted);
        if self.ready && !self.waiting {
            return Ok(());
        }
        self.waiting = false;

        self.delay.delay_ms(POWER_UP_SETTLE_MS).await;
        match init::initialize(&self.bus, &mut self.clock).await {
            Ok(card_type) => {
                self.card_type = card_type;
                self.ready = true;
                debug!("card ready: {:?}", card_type);
                on_event(Event::Ready);
            }
            Err(e) => {
                self.ready = false;
                warn_log!("card init failed");
                on_event(Event::Error(e));
            }
        }

        Ok(())
    }

    /// Read one 512-byte block. Fails with [`Error::State`] without touching the bus if
    /// the card isn't `ready`.
    pub async fn read_block(&self, block: u32) -> Result<[u8; BLOCK_SIZE], Error> {
        block::read_block(&self.bus, self.ready, self.card_type, block).await
    }

    /// Write one 512-byte block. `data` must be exactly [`BLOCK_SIZE`] bytes.
    pub async fn write_block(&self, block: u32, data: &[u8]) -> Result<(), Error> {
        block::write_block(&self.bus, self.ready, self.card_type, block, data).await
    }

    /// Read-modify-write one block as a single held transaction.
    pub async fn modify_block<F: FnOnce(&mut [u8; BLOCK_SIZE])>(
        &self,
        block: u32,
        f: F,
    ) -> Result<(), Error> {
        block::modify_block(&self.bus, self.ready, self.card_type, block, f).await
    }
}
