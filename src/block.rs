//! The Block I/O Engine: `read_block`, `write_block`, `modify_block`.

use crate::command::{self, READ_SINGLE_BLOCK, WRITE_BLOCK};
use crate::crc::crc16;
use crate::error::{DataError, Error, StateError, TimeoutStage};
use crate::init::CardType;
use crate::transaction::{BusState, TransactionSerializer};

/// Bytes in one block. Immutable; the whole protocol engine assumes it.
pub const BLOCK_SIZE: usize = 512;

const DATA_START_BLOCK: u8 = 0xFE;
const DATA_TOKEN_TRIES: u32 = 100;
const DATA_RES_MASK: u8 = 0x1F;
const DATA_RES_ACCEPTED: u8 = 0x05;
const IDLE_POLL_TRIES: u32 = 100;

/// Read one 512-byte block, already holding the bus token.
///
/// This is the "locked" half: `read_block` below is the top-level entry point that acquires
/// the token through the serializer before calling this.
pub async fn read_block_locked<SPI, CS>(
    bus: &mut BusState<SPI, CS>,
    card_type: CardType,
    block: u32,
) -> Result<[u8; BLOCK_SIZE], Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    let addr = card_type.wire_address(block);
    command::send_locked(bus, READ_SINGLE_BLOCK, addr).await?;

    let mut tries = 0;
    loop {
        if tries >= DATA_TOKEN_TRIES {
            return Err(Error::Timeout(TimeoutStage::DataToken));
        }
        let token = bus.read_byte().await?;
        tries += 1;
        if token == DATA_START_BLOCK {
            break;
        }
        if token & 0x80 == 0 {
            return Err(Error::Data(DataError::ReadToken(token)));
        }
    }

    let mut payload = [0xFFu8; BLOCK_SIZE + 2];
    bus.receive_into(&mut payload).await?;
    if crc16(&payload) != 0 {
        return Err(Error::Data(DataError::Checksum));
    }

    let mut data = [0u8; BLOCK_SIZE];
    data.copy_from_slice(&payload[..BLOCK_SIZE]);
    Ok(data)
}

/// Write one 512-byte block, already holding the bus token.
pub async fn write_block_locked<SPI, CS>(
    bus: &mut BusState<SPI, CS>,
    card_type: CardType,
    block: u32,
    data: &[u8; BLOCK_SIZE],
) -> Result<(), Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    let addr = card_type.wire_address(block);
    command::send_locked(bus, WRITE_BLOCK, addr).await?;

    bus.transfer(&[0xFF, DATA_START_BLOCK]).await?;
    bus.transfer(data).await?;
    let crc = crc16(data).to_be_bytes();
    bus.transfer(&crc).await?;

    let status = bus.read_byte().await?;
    if status & DATA_RES_MASK != DATA_RES_ACCEPTED {
        return Err(Error::Data(DataError::WriteRejected(status)));
    }

    let mut tries = 0;
    loop {
        if tries >= IDLE_POLL_TRIES {
            return Err(Error::Timeout(TimeoutStage::PostWriteIdle));
        }
        let byte = bus.read_byte().await?;
        tries += 1;
        if byte == 0xFF {
            break;
        }
    }

    Ok(())
}

/// Read one 512-byte block.
pub async fn read_block<SPI, CS>(
    bus: &TransactionSerializer<SPI, CS>,
    ready: bool,
    card_type: CardType,
    block: u32,
) -> Result<[u8; BLOCK_SIZE], Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    if !ready {
        return Err(Error::State(StateError::NotReady));
    }
    bus.transaction(async move |b| read_block_locked(b, card_type, block).await).await
}

/// Write one 512-byte block.
pub async fn write_block<SPI, CS>(
    bus: &TransactionSerializer<SPI, CS>,
    ready: bool,
    card_type: CardType,
    block: u32,
    data: &[u8],
) -> Result<(), Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
{
    if !ready {
        return Err(Error::State(StateError::NotReady));
    }
    let data: &[u8; BLOCK_SIZE] = data.try_into().map_err(|_| Error::State(StateError::BadBufferLength))?;
    bus.transaction(async move |b| write_block_locked(b, card_type, block, data).await).await
}

/// Read, mutate, and write back one block within a single held transaction.
///
/// `f` runs synchronously inside the transaction -- it has no way to itself await the bus,
/// which is exactly what keeps the read and the write atomic with respect to any other
/// queued transaction.
pub async fn modify_block<SPI, CS, F>(
    bus: &TransactionSerializer<SPI, CS>,
    ready: bool,
    card_type: CardType,
    block: u32,
    f: F,
) -> Result<(), Error>
where
    SPI: embedded_hal_async::spi::SpiBus,
    CS: embedded_hal::digital::OutputPin,
    F: FnOnce(&mut [u8; BLOCK_SIZE]),
{
    if !ready {
        return Err(Error::State(StateError::NotReady));
    }
    bus.transaction(async move |b| {
        let mut data = read_block_locked(b, card_type, block).await?;
        f(&mut data);
        write_block_locked(b, card_type, block, &data).await
    })
    .await
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::collections::VecDeque;
    use std::convert::Infallible;

    struct MockSpi(VecDeque<u8>);

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
            for w in words.iter_mut() {
                *w = self.0.pop_front().unwrap_or(0xFF);
            }
            Ok(())
        }
        async fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    struct MockCs;

    impl embedded_hal::digital::ErrorType for MockCs {
        type Error = Infallible;
    }

    impl embedded_hal::digital::OutputPin for MockCs {
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    #[test]
    fn modify_block_reads_mutates_and_writes_back_in_one_transaction() {
        let mut bytes = VecDeque::new();
        bytes.push_back(0x00); // CMD17 -> R1 ready
        bytes.push_back(0xFE); // data start token
        bytes.extend(core::iter::repeat(0u8).take(BLOCK_SIZE + 2)); // zero payload, zero CRC16
        bytes.push_back(0x00); // CMD24 -> R1 ready
        bytes.push_back(0x05); // data response: accepted
        bytes.push_back(0xFF); // idle immediately

        let bus = TransactionSerializer::new(MockSpi(bytes), MockCs);
        let result = pollster::block_on(modify_block(&bus, true, CardType::SDv2Block, 7, |data| {
            data[0] = 0xAB;
        }));
        assert!(result.is_ok());
    }

    #[test]
    fn read_block_rejects_explicit_error_token() {
        let mut bytes = VecDeque::new();
        bytes.push_back(0x00); // CMD17 -> R1 ready
        bytes.push_back(0x09); // error token: card ECC failed, top bit clear
        let bus = TransactionSerializer::new(MockSpi(bytes), MockCs);

        let err = pollster::block_on(read_block(&bus, true, CardType::SDv2Block, 0)).unwrap_err();
        assert_eq!(err, Error::Data(DataError::ReadToken(0x09)));
    }

    #[test]
    fn write_block_reports_rejection_status() {
        let mut bytes = VecDeque::new();
        bytes.push_back(0x00); // CMD24 -> R1 ready
        bytes.push_back(0x0D); // data response: CRC rejected (low 5 bits != 0x05)
        let bus = TransactionSerializer::new(MockSpi(bytes), MockCs);

        let err =
            pollster::block_on(write_block(&bus, true, CardType::SDv2Block, 0, &[0u8; BLOCK_SIZE]))
                .unwrap_err();
        assert_eq!(err, Error::Data(DataError::WriteRejected(0x0D)));
    }
}
