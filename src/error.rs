/// Everything that can go wrong talking to a card over SPI.
///
/// Grouped along the taxonomy the protocol layer reasons about: a [`Error::Protocol`]
/// means the card answered but with a status we can't proceed from, a [`Error::Timeout`]
/// means it never answered within the bounded retry budget for that step, and so on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The card reported one or more R1 error flags, or an OCR/voltage field didn't match
    /// what we asked for.
    Protocol(ProtocolError),
    /// A bounded retry loop ran out of tries.
    Timeout(TimeoutStage),
    /// A CRC check failed, or the card rejected written data.
    Data(DataError),
    /// An operation was attempted that isn't legal for the card's current state.
    State(StateError),
    /// The underlying SPI/GPIO transfer itself failed.
    Wire,
}

/// Sub-taxonomy for [`Error::Protocol`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ProtocolError {
    /// `R1` carried one or more bits of [`crate::command::ANY_ERROR`]; the raw byte is kept
    /// for diagnostics.
    R1Error(u8),
    /// `CMD8`'s echoed voltage pattern didn't match `0x1AA`.
    BadVoltageResponse,
    /// `READ_OCR`/`CMD58` didn't return a ready status.
    BadOcrResponse,
    /// No card responded to `GO_IDLE_STATE` at all.
    NoCard,
}

/// Which bounded polling loop ran out its retry budget.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum TimeoutStage {
    /// Waiting for the R1 response bit after a command frame (8 tries).
    R1Response,
    /// Waiting for the 0xFE data start token (100 tries).
    DataToken,
    /// Waiting for ACMD41 to report ready (100 tries).
    CardReady,
    /// Waiting for the card to stop driving the busy line after a write (100 tries).
    PostWriteIdle,
}

/// Sub-taxonomy for [`Error::Data`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum DataError {
    /// The 16-bit CRC appended to a read payload didn't check out.
    Checksum,
    /// The card sent an explicit read-error token instead of `0xFE`.
    ReadToken(u8),
    /// The data response byte after a write wasn't `0x05` (accepted).
    WriteRejected(u8),
}

/// Sub-taxonomy for [`Error::State`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum StateError {
    /// `read_block`/`write_block`/`modify_block` was called before `ready` was observed.
    NotReady,
    /// `write_block` was handed a buffer that isn't exactly [`crate::BLOCK_SIZE`] bytes.
    BadBufferLength,
}
