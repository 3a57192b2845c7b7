//! The Initialization Controller: the cold-start state machine from §4.5.
//!
//! The original driver this was distilled from threaded this as a chain of nested
//! callbacks; here it's a single `async fn` that walks an explicit [`InitState`], which is
//! what makes the per-step timeouts and the final "did we reach `Fast`" check uniform.

use crate::clock::ClockControl;
use crate::command::{
    self, r1, ACMD41_HCS_ARG, ANY_ERROR, APP_SEND_OP_COND, CRC_ON_OFF, GO_IDLE_STATE, READ_OCR,
    SEND_IF_COND, SEND_IF_COND_ARG, SET_BLOCKLEN,
};
use crate::error::{Error, ProtocolError, TimeoutStage};
use crate::fmt::debug;
use crate::transaction::TransactionSerializer;

/// Card version/addressing mode, discovered during initialization.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardType {
    /// Not yet discovered.
    #[default]
    Unknown,
    /// Version 1 card (or an MMCv3 card -- the two are not distinguished over SPI).
    SDv1,
    /// Version 2 card, byte-addressed (`SDSC`). Needs `SET_BLOCKLEN`.
    SDv2,
    /// Version 2 card, block-addressed (`SDHC`/`SDXC`). Block numbers go on the wire as-is.
    SDv2Block,
}

impl CardType {
    /// Translate a block index to the address word a command frame carries on the wire.
    pub fn wire_address(self, block: u32) -> u32 {
        match self {
            CardType::SDv2Block => block,
            _ => block.saturating_mul(512),
        }
    }
}

/// Named states of the cold-start dance, in the order they're entered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitState {
    PulseSent,
    IdleAcked,
    VoltageChecked,
    Ready41,
    CrcOn,
    OcrRead,
    Fast,
}

const ACMD41_TRIES: u32 = 100;

/// Run the full cold-start handshake and return the card type the card identified as.
///
/// The caller is responsible for the 1ms power-up settle before calling this; everything
/// from here on times out on bounded retry counts rather than wall-clock delays.
pub async fn initialize<SPI, CS, CLK>(
    bus: &TransactionSerializer<SPI, CS>,
    clock: &mut CLK,
) -> Result<CardType, Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
    CLK: ClockControl,
{
    clock.set_slow().await.map_err(|_| Error::Wire)?;

    // Native-mode pulse: CSN stays high for at least 74 clocks (10 bytes) so the card
    // switches into SPI mode instead of staying in its native bus mode.
    bus.with_bus(async move |b| b.spi_mut().write(&[0xFF; 10]).await.map_err(|_| Error::Wire)).await?;
    let state = InitState::PulseSent;
    debug!("init: {:?}", state);

    // GO_IDLE_STATE must report idle; anything else means there's no card to talk to.
    let (status, _) = bus
        .transaction(async move |b| command::send_locked(b, GO_IDLE_STATE, 0).await)
        .await?;
    if status != r1::IDLE {
        return Err(Error::Protocol(ProtocolError::NoCard));
    }
    let state = InitState::IdleAcked;
    debug!("init: {:?}", state);

    // SEND_IF_COND tells us whether this is a v1 card (ILLEGAL_CMD, nothing else) or a v2
    // card that needs its voltage echo checked.
    let mut card_type = CardType::Unknown;
    let send_if_cond = bus
        .transaction(async move |b| command::send_locked(b, SEND_IF_COND, SEND_IF_COND_ARG).await)
        .await;
    match send_if_cond {
        Ok((_, Some(tail))) => {
            if tail[2] != 0x01 || tail[3] != 0xAA {
                return Err(Error::Protocol(ProtocolError::BadVoltageResponse));
            }
        }
        // Only the illegal-command error bit set (the idle bit is not an error and may or
        // may not accompany it) means this is a v1 card that doesn't know CMD8 at all.
        Err(Error::Protocol(ProtocolError::R1Error(r))) if r & ANY_ERROR == r1::ILLEGAL_CMD => {
            card_type = CardType::SDv1;
        }
        Ok((_, None)) => unreachable!("SEND_IF_COND is R7"),
        Err(e) => return Err(e),
    }
    let state = InitState::VoltageChecked;
    debug!("init: {:?} card_type={:?}", state, card_type);

    // ACMD41 loop: retry with HCS set until the idle flag clears, capped at 100 tries.
    let mut acked = false;
    for _ in 0..ACMD41_TRIES {
        let (status, _) = bus
            .transaction(async move |b| command::send_locked(b, APP_SEND_OP_COND, ACMD41_HCS_ARG).await)
            .await?;
        if status & r1::IDLE == 0 {
            acked = true;
            break;
        }
        // A cooperative yield, not a timed delay: give other work on this executor a turn
        // between tries instead of burning the bus with back-to-back ACMD41s.
        embassy_futures::yield_now().await;
    }
    if !acked {
        return Err(Error::Timeout(TimeoutStage::CardReady));
    }
    let state = InitState::Ready41;
    debug!("init: {:?}", state);

    // Turn CRC checking on for the rest of the session.
    bus.transaction(async move |b| command::send_locked(b, CRC_ON_OFF, 1).await).await?;
    let state = InitState::CrcOn;
    debug!("init: {:?}", state);

    if card_type == CardType::Unknown {
        let (_, tail) = bus
            .transaction(async move |b| command::send_locked(b, READ_OCR, 0).await)
            .await?;
        let ocr = tail.ok_or(Error::Protocol(ProtocolError::BadOcrResponse))?;
        card_type = if ocr[0] & 0x40 != 0 { CardType::SDv2Block } else { CardType::SDv2 };
        if card_type == CardType::SDv2 {
            bus.transaction(async move |b| command::send_locked(b, SET_BLOCKLEN, 512).await).await?;
        }
    }
    let state = InitState::OcrRead;
    debug!("init: {:?} card_type={:?}", state, card_type);

    clock.set_fast().await.map_err(|_| Error::Wire)?;
    let state = InitState::Fast;
    debug!("init: {:?}", state);

    Ok(card_type)
}
