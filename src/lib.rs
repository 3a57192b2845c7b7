//! An SD/MMC card block device driver that speaks the SD card protocol over SPI.
//!
//! This crate covers the card lifecycle -- detection, the power-up handshake, version and
//! capacity discovery, command framing with CRC protection, and block I/O -- down to the
//! `embedded-hal`/`embedded-hal-async` traits for the SPI bus, chip select, card-detect pin,
//! and delay source. It does not parse partition tables or file systems; those are expected
//! to be built on top of [`SdCard::read_block`]/[`SdCard::write_block`].

#![no_std]

// MUST be the first module listed
mod fmt;

mod block;
mod clock;
mod command;
mod crc;
mod error;
mod event;
mod init;
mod monitor;
mod sdcard;
mod transaction;

pub use block::BLOCK_SIZE;
pub use clock::{ClockControl, FAST_HZ, SLOW_HZ};
pub use command::{r1, ANY_ERROR};
pub use error::{DataError, Error, ProtocolError, StateError, TimeoutStage};
pub use event::Event;
pub use init::CardType;
pub use sdcard::SdCard;
