//! Two-stage firmware upload.
//!
//! The boot ROM accepts the first-stage ("A-Speed") image as fixed-size
//! packets written to increasing addresses, each verified by a checksum
//! readback. The first stage then accepts the main firmware as one bulk
//! transfer at high clock speed, verified once.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::protocol::checksum;
use crate::protocol::constants::*;
use crate::transport::{SpiSettings, SpiTransport, TransportError};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Verification failed type bytes, got {got:02X?}, expected checksum 0x{checksum:X}")]
    AckMismatch { got: [u8; 4], checksum: u32 },
    #[error("Verification failed upper checksum: got 0x{actual:02X}, expected 0x{expected:02X}")]
    UpperChecksum { expected: u8, actual: u8 },
    #[error("Verification failed lower checksum: got 0x{actual:02X}, expected 0x{expected:02X}")]
    LowerChecksum { expected: u8, actual: u8 },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum BootloaderError {
    #[error("Chunk at 0x{address:08X} failed verification after {attempts} attempts")]
    ChunkVerifyFailed { address: u32, attempts: usize },
    #[error("Main firmware failed verification after {attempts} attempts")]
    MainVerifyFailed { attempts: usize },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// One first-stage packet, ready to transmit.
///
/// Layout: opcode, 4-byte big-endian destination, reserved byte, up to
/// 1016 data bytes zero-padded, 2-byte big-endian checksum at the end.
pub struct BootloaderPacket {
    bytes: Box<[u8; BOOTLOADER_PACKET_SIZE]>,
    checksum: u32,
    data_len: usize,
}

impl BootloaderPacket {
    /// Build a packet for `data`, truncated to one chunk.
    pub fn new(address: u32, data: &[u8]) -> Self {
        let data = &data[..data.len().min(BOOTLOADER_CHUNK_SIZE)];
        let mut bytes = Box::new([0u8; BOOTLOADER_PACKET_SIZE]);

        bytes[0] = OPCODE_BOOTLOADER_DATA;
        bytes[1..5].copy_from_slice(&address.to_be_bytes());
        bytes[5] = 0;
        bytes[BOOTLOADER_HEADER_LEN..BOOTLOADER_HEADER_LEN + data.len()].copy_from_slice(data);

        let checksum = checksum::upload(data, &bytes[..BOOTLOADER_HEADER_LEN]);
        bytes[BOOTLOADER_PACKET_SIZE - 2] = (checksum >> 8) as u8;
        bytes[BOOTLOADER_PACKET_SIZE - 1] = checksum as u8;

        Self {
            bytes,
            checksum,
            data_len: data.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    /// Running checksum the device is expected to read back.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }
}

/// A slice of the first-stage image bound for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

/// Iterator over first-stage chunks with increasing destination addresses.
#[derive(Debug)]
pub struct ChunkIterator<'a> {
    data: &'a [u8],
    offset: usize,
    address: u32,
}

impl<'a> ChunkIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            address: BOOTLOADER_BASE_ADDRESS,
        }
    }

    /// Total number of chunks (including partial).
    pub fn total(&self) -> usize {
        self.data.len().div_ceil(BOOTLOADER_CHUNK_SIZE)
    }
}

impl<'a> Iterator for ChunkIterator<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let len = (self.data.len() - self.offset).min(BOOTLOADER_CHUNK_SIZE);
        let chunk = Chunk {
            address: self.address,
            data: &self.data[self.offset..self.offset + len],
        };
        self.offset += len;
        self.address = self.address.wrapping_add(len as u32);

        Some(chunk)
    }
}

/// Planned upload of one chunk, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub address: u32,
    pub len: usize,
    pub checksum: u32,
}

/// Compute the first-stage upload plan without touching the transport.
pub fn chunk_plan(image: &[u8]) -> Vec<ChunkPlan> {
    ChunkIterator::new(image)
        .map(|chunk| ChunkPlan {
            address: chunk.address,
            len: chunk.data.len(),
            checksum: BootloaderPacket::new(chunk.address, chunk.data).checksum(),
        })
        .collect()
}

/// Checksum the first stage verifies the main image against.
pub fn main_image_checksum(image: &[u8]) -> u32 {
    checksum::upload(image, &[])
}

/// Drives both upload stages over a transport.
pub struct Bootloader<'a, T: SpiTransport> {
    transport: &'a T,
}

impl<'a, T: SpiTransport> Bootloader<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Upload the first-stage image chunk by chunk and execute it.
    ///
    /// Returns the number of chunks uploaded.
    #[instrument(skip_all, fields(len = image.len()))]
    pub fn load_first_stage(&self, image: &[u8]) -> Result<usize, BootloaderError> {
        let chunks = ChunkIterator::new(image);
        let total = chunks.total();
        let mut uploaded = 0;

        for chunk in chunks {
            let packet = BootloaderPacket::new(chunk.address, chunk.data);
            self.upload_chunk(&packet, chunk.address)?;
            uploaded += 1;
            debug!(
                address = %format!("0x{:08X}", chunk.address),
                len = chunk.data.len(),
                "Chunk {}/{} verified",
                uploaded,
                total
            );
        }

        self.send_execute()?;
        info!(chunks = uploaded, "First-stage firmware loaded");
        Ok(uploaded)
    }

    fn upload_chunk(&self, packet: &BootloaderPacket, address: u32) -> Result<(), BootloaderError> {
        for attempt in 1..=UPLOAD_ATTEMPTS {
            if let Err(e) = self
                .transport
                .transmit(&SpiSettings::NORMAL, packet.as_bytes())
            {
                warn!(attempt, error = %e, "Chunk transmit failed");
                continue;
            }

            self.transport.delay(CHUNK_SETTLE_DELAY);

            match self.verify_upload(packet.checksum()) {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    attempt,
                    address = %format!("0x{:08X}", address),
                    error = %e,
                    "Chunk verification failed"
                ),
            }
        }

        Err(BootloaderError::ChunkVerifyFailed {
            address,
            attempts: UPLOAD_ATTEMPTS,
        })
    }

    /// Upload the main image in one fast transfer and execute it.
    #[instrument(skip_all, fields(len = image.len()))]
    pub fn load_main_firmware(&self, image: &[u8]) -> Result<(), BootloaderError> {
        let checksum = main_image_checksum(image);

        let verified = (1..=UPLOAD_ATTEMPTS).any(|attempt| {
            if let Err(e) = self.send_blank_data() {
                warn!(attempt, error = %e, "Blank data command failed");
                return false;
            }

            debug!(attempt, "Uploading main firmware");
            if let Err(e) = self.transport.transmit(&SpiSettings::FAST, image) {
                warn!(attempt, error = %e, "Main firmware transmit failed");
                return false;
            }

            match self.verify_upload(checksum) {
                Ok(()) => true,
                Err(e) => {
                    warn!(attempt, error = %e, "Main firmware verification failed");
                    false
                }
            }
        });

        if !verified {
            return Err(BootloaderError::MainVerifyFailed {
                attempts: UPLOAD_ATTEMPTS,
            });
        }

        self.send_execute()?;
        info!("Main firmware loaded");
        Ok(())
    }

    /// Ask the device for the checksum of the data just uploaded.
    pub fn verify_upload(&self, checksum: u32) -> Result<(), VerifyError> {
        let mut rx = [0u8; 4];
        self.transport
            .transceive(&SpiSettings::NORMAL, &CMD_VERIFY, &mut rx)?;

        if rx[..2] != VERIFY_ACK {
            return Err(VerifyError::AckMismatch { got: rx, checksum });
        }

        let expected = (checksum >> 8) as u8;
        if rx[2] != expected {
            return Err(VerifyError::UpperChecksum {
                expected,
                actual: rx[2],
            });
        }

        let expected = checksum as u8;
        if rx[3] != expected {
            return Err(VerifyError::LowerChecksum {
                expected,
                actual: rx[3],
            });
        }

        debug!("Data verification successful");
        Ok(())
    }

    pub fn send_execute(&self) -> Result<(), TransportError> {
        let mut rx = [0u8; 4];
        self.transport
            .transceive(&SpiSettings::NORMAL, &CMD_EXECUTE, &mut rx)?;
        debug!("Execute packet sent");
        Ok(())
    }

    pub fn send_blank_data(&self) -> Result<(), TransportError> {
        let mut rx = [0u8; 4];
        self.transport
            .transceive(&SpiSettings::NORMAL, &CMD_BLANK_DATA, &mut rx)?;
        debug!("Blank data packet sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, TransferKind};

    fn verify_response(checksum: u32) -> [u8; 4] {
        [0xD0, 0x00, (checksum >> 8) as u8, checksum as u8]
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_chunking_three_full_and_one_partial() {
        let data = image(BOOTLOADER_CHUNK_SIZE * 3 + 10);
        let iter = ChunkIterator::new(&data);
        assert_eq!(iter.total(), 4);

        let chunks: Vec<_> = ChunkIterator::new(&data).collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].data.len(), 10);
        assert_eq!(chunks[0].address, 0x4000_0000);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].address, pair[0].address + pair[0].data.len() as u32);
        }
    }

    #[test]
    fn test_packet_layout() {
        let data = [0x11u8, 0x22, 0x33];
        let packet = BootloaderPacket::new(0x4000_03F8, &data);
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[..6], &[0xC2, 0x40, 0x00, 0x03, 0xF8, 0x00]);
        assert_eq!(&bytes[6..9], &data);
        assert!(bytes[9..1022].iter().all(|&b| b == 0));

        let expected = 0x11 + 0x22 + 0x33 + 0xC2 + 0x40 + 0x03 + 0xF8;
        assert_eq!(packet.checksum(), expected);
        assert_eq!(&bytes[1022..], &[(expected >> 8) as u8, expected as u8]);
    }

    #[test]
    fn test_packet_truncates_oversized_data() {
        let data = image(BOOTLOADER_CHUNK_SIZE + 100);
        let packet = BootloaderPacket::new(BOOTLOADER_BASE_ADDRESS, &data);
        assert_eq!(packet.data_len(), BOOTLOADER_CHUNK_SIZE);
    }

    #[test]
    fn test_chunk_plan_matches_packets() {
        let data = image(BOOTLOADER_CHUNK_SIZE + 1);
        let plan = chunk_plan(&data);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].address, 0x4000_0000 + BOOTLOADER_CHUNK_SIZE as u32);
        assert_eq!(plan[1].len, 1);
        assert_eq!(
            plan[1].checksum,
            BootloaderPacket::new(plan[1].address, &data[BOOTLOADER_CHUNK_SIZE..]).checksum()
        );
    }

    #[test]
    fn test_first_stage_upload_sequence() {
        let mock = MockTransport::new();
        let data = image(BOOTLOADER_CHUNK_SIZE + 20);
        for plan in chunk_plan(&data) {
            mock.queue_response(&verify_response(plan.checksum));
        }

        let chunks = Bootloader::new(&mock).load_first_stage(&data).unwrap();
        assert_eq!(chunks, 2);

        let transfers = mock.transfers();
        let kinds: Vec<_> = transfers.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransferKind::Transmit,
                TransferKind::Transceive,
                TransferKind::Transmit,
                TransferKind::Transceive,
                TransferKind::Transceive,
            ]
        );
        assert_eq!(transfers[0].settings, SpiSettings::NORMAL);
        assert_eq!(transfers[1].tx, CMD_VERIFY);
        assert_eq!(&transfers[2].tx[1..5], &[0x40, 0x00, 0x03, 0xF8]);
        assert_eq!(transfers[4].tx, CMD_EXECUTE);
        assert_eq!(mock.delays(), vec![CHUNK_SETTLE_DELAY; 2]);
    }

    #[test]
    fn test_chunk_retried_until_verified() {
        let mock = MockTransport::new();
        let data = image(10);
        let plan = chunk_plan(&data);
        mock.queue_response(&[0x00, 0x00, 0x00, 0x00]);
        mock.queue_response(&verify_response(plan[0].checksum + 1));
        mock.queue_response(&verify_response(plan[0].checksum));

        Bootloader::new(&mock).load_first_stage(&data).unwrap();
        let transmits = mock
            .transfers()
            .iter()
            .filter(|t| t.kind == TransferKind::Transmit)
            .count();
        assert_eq!(transmits, 3);
    }

    #[test]
    fn test_chunk_verification_gives_up_after_five_attempts() {
        let mock = MockTransport::new();
        mock.set_fallback(&[0x55, 0x00, 0x00, 0x00]);
        let data = image(BOOTLOADER_CHUNK_SIZE * 2);

        let err = Bootloader::new(&mock).load_first_stage(&data).unwrap_err();
        assert!(matches!(
            err,
            BootloaderError::ChunkVerifyFailed {
                address: 0x4000_0000,
                attempts: 5
            }
        ));

        let verifies = mock.transceived();
        assert_eq!(verifies.len(), 5);
        assert!(verifies.iter().all(|tx| tx == &CMD_VERIFY));
    }

    #[test]
    fn test_main_firmware_upload_sequence() {
        let mock = MockTransport::new();
        let data = image(5000);
        let checksum = main_image_checksum(&data);
        mock.queue_response(&[0xFF; 4]); // blank data
        mock.queue_response(&verify_response(checksum));

        Bootloader::new(&mock).load_main_firmware(&data).unwrap();

        let transfers = mock.transfers();
        assert_eq!(transfers.len(), 4);
        assert_eq!(transfers[0].tx, CMD_BLANK_DATA);
        assert_eq!(transfers[1].kind, TransferKind::Transmit);
        assert_eq!(transfers[1].settings, SpiSettings::FAST);
        assert_eq!(transfers[1].tx, data);
        assert_eq!(transfers[2].tx, CMD_VERIFY);
        assert_eq!(transfers[3].tx, CMD_EXECUTE);
    }

    #[test]
    fn test_main_firmware_gives_up_after_five_attempts() {
        let mock = MockTransport::new();
        mock.set_fallback(&[0xAA, 0x00, 0x00, 0x00]);

        let err = Bootloader::new(&mock)
            .load_main_firmware(&image(64))
            .unwrap_err();
        assert!(matches!(
            err,
            BootloaderError::MainVerifyFailed { attempts: 5 }
        ));

        let verifies = mock
            .transceived()
            .into_iter()
            .filter(|tx| tx == &CMD_VERIFY)
            .count();
        assert_eq!(verifies, 5);
        assert!(!mock.transceived().contains(&CMD_EXECUTE.to_vec()));
    }

    #[test]
    fn test_verify_reports_which_byte_mismatched() {
        let mock = MockTransport::new();
        let loader = Bootloader::new(&mock);

        mock.queue_response(&[0xD0, 0x00, 0x13, 0x00]);
        assert!(matches!(
            loader.verify_upload(0x1234),
            Err(VerifyError::UpperChecksum {
                expected: 0x12,
                actual: 0x13
            })
        ));

        mock.queue_response(&[0xD0, 0x00, 0x12, 0x35]);
        assert!(matches!(
            loader.verify_upload(0x1234),
            Err(VerifyError::LowerChecksum {
                expected: 0x34,
                actual: 0x35
            })
        ));

        mock.queue_response(&[0xD0, 0x00, 0x12, 0x34]);
        assert!(loader.verify_upload(0x1234).is_ok());
    }
}
