//! Command frame encoding, the static command descriptor table, and R1 decoding.

use crate::crc::crc7;
use crate::error::{Error, ProtocolError, TimeoutStage};
use crate::fmt::{error, trace};
use crate::transaction::BusState;

/// `R1` flag bits, per the SD Simplified Spec.
pub mod r1 {
    pub const IDLE: u8 = 0x01;
    pub const ERASE_RESET: u8 = 0x02;
    pub const ILLEGAL_CMD: u8 = 0x04;
    pub const CRC_ERROR: u8 = 0x08;
    pub const ERASE_SEQ: u8 = 0x10;
    pub const ADDR_ERROR: u8 = 0x20;
    pub const PARAM_ERROR: u8 = 0x40;
}

/// Mask of bits in `R1` that indicate a genuine error rather than plain "still idle".
pub const ANY_ERROR: u8 = r1::ILLEGAL_CMD | r1::CRC_ERROR | r1::ERASE_SEQ | r1::ADDR_ERROR | r1::PARAM_ERROR;

/// How many bytes of response tail follow the `R1` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Just the status byte.
    R1,
    /// Status byte plus 4 bytes (OCR contents, for `READ_OCR`).
    R3,
    /// Status byte plus 4 bytes (echoed voltage/check pattern, for `SEND_IF_COND`).
    R7,
}

/// A command, as described by the static descriptor table in the spec's data model.
#[derive(Copy, Clone, Debug)]
pub struct Command {
    pub index: u8,
    pub response_format: ResponseFormat,
    pub is_app_cmd: bool,
}

pub const GO_IDLE_STATE: Command = Command { index: 0, response_format: ResponseFormat::R1, is_app_cmd: false };
pub const SEND_IF_COND: Command = Command { index: 8, response_format: ResponseFormat::R7, is_app_cmd: false };
pub const SET_BLOCKLEN: Command = Command { index: 16, response_format: ResponseFormat::R1, is_app_cmd: false };
pub const READ_SINGLE_BLOCK: Command = Command { index: 17, response_format: ResponseFormat::R1, is_app_cmd: false };
pub const WRITE_BLOCK: Command = Command { index: 24, response_format: ResponseFormat::R1, is_app_cmd: false };
pub const APP_CMD: Command = Command { index: 55, response_format: ResponseFormat::R1, is_app_cmd: false };
pub const READ_OCR: Command = Command { index: 58, response_format: ResponseFormat::R3, is_app_cmd: false };
pub const CRC_ON_OFF: Command = Command { index: 59, response_format: ResponseFormat::R1, is_app_cmd: false };
pub const APP_SEND_OP_COND: Command = Command { index: 41, response_format: ResponseFormat::R1, is_app_cmd: true };

/// `SEND_IF_COND`'s check pattern argument: voltage supply 2.7-3.6V (`0x1`), check pattern `0xAA`.
pub const SEND_IF_COND_ARG: u32 = 0x0000_01AA;
/// `APP_SEND_OP_COND`'s HCS (host capacity support) bit.
pub const ACMD41_HCS_ARG: u32 = 1 << 30;

const R1_POLL_TRIES: u32 = 8;

fn encode_frame(cmd: &Command, arg: u32) -> [u8; 6] {
    let mut buf = [
        0x40 | (cmd.index & 0x3F),
        (arg >> 24) as u8,
        (arg >> 16) as u8,
        (arg >> 8) as u8,
        arg as u8,
        0,
    ];
    buf[5] = (crc7(&buf[0..5]) << 1) | 0x01;
    buf
}

/// Send one command frame and decode its response.
///
/// This is the "locked" half of the Command Engine: it assumes `bus` already holds the
/// transaction token (CSN low) and never enqueues through the serializer itself. If
/// `cmd.is_app_cmd`, `APP_CMD` is sent first, followed by the CSN deassert/clock/reassert
/// dance that keeps the two responses from lining up on the wrong byte boundary.
pub async fn send_locked<SPI, CS>(
    bus: &mut BusState<SPI, CS>,
    cmd: Command,
    arg: u32,
) -> Result<(u8, Option<[u8; 4]>), Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    if cmd.is_app_cmd {
        // send_raw already turns any R1 error bit into `Err`, so reaching here means
        // APP_CMD was accepted.
        send_raw(bus, APP_CMD, 0).await?;
        bus.cycle_csn().await?;
    }

    send_raw(bus, cmd, arg).await
}

async fn send_raw<SPI, CS>(
    bus: &mut BusState<SPI, CS>,
    cmd: Command,
    arg: u32,
) -> Result<(u8, Option<[u8; 4]>), Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    let frame = encode_frame(&cmd, arg);
    trace!("cmd{} arg={:08x}", cmd.index, arg);
    bus.transfer(&frame).await?;

    let mut tries = 0;
    let status = loop {
        if tries >= R1_POLL_TRIES {
            return Err(Error::Timeout(TimeoutStage::R1Response));
        }
        let byte = bus.read_byte().await?;
        tries += 1;
        if byte & 0x80 == 0 {
            break byte;
        }
    };

    if status & ANY_ERROR != 0 {
        error!("cmd{} r1={:02x}", cmd.index, status);
        return Err(Error::Protocol(ProtocolError::R1Error(status)));
    }

    let tail = match cmd.response_format {
        ResponseFormat::R1 => None,
        ResponseFormat::R3 | ResponseFormat::R7 => {
            let mut tail = [0u8; 4];
            bus.receive_into(&mut tail).await?;
            Some(tail)
        }
    };

    Ok((status, tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd0_frame_matches_known_bytes() {
        let frame = encode_frame(&GO_IDLE_STATE, 0);
        assert_eq!(frame, [0x40, 0x00, 0x00, 0x00, 0x00, 0x95]);
    }

    #[test]
    fn cmd8_frame_matches_known_bytes() {
        let frame = encode_frame(&SEND_IF_COND, SEND_IF_COND_ARG);
        assert_eq!(frame, [0x48, 0x00, 0x00, 0x01, 0xAA, 0x87]);
    }

    #[test]
    fn frame_byte5_always_matches_crc7_formula() {
        for (cmd, arg) in [
            (GO_IDLE_STATE, 0u32),
            (SEND_IF_COND, SEND_IF_COND_ARG),
            (READ_OCR, 0),
            (SET_BLOCKLEN, 512),
            (READ_SINGLE_BLOCK, 0xDEAD_BEEF),
        ] {
            let frame = encode_frame(&cmd, arg);
            assert_eq!(frame[5], (crc7(&frame[0..5]) << 1) | 1);
        }
    }

    #[test]
    fn any_error_mask_matches_spec() {
        assert_eq!(ANY_ERROR, 0x7C);
    }
}
