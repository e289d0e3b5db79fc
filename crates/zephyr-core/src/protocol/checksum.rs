//! Checksum shapes used on the wire.
//!
//! Three 16-bit checksums protect main-firmware responses and one running
//! byte sum protects firmware uploads. Every 16-bit checksum is carried
//! big-endian in the two bytes that follow the data it covers.

use byteorder::{BigEndian, ByteOrder};

/// Offset of the 16-bit checksum inside an 8-byte control frame.
const CONTROL_CHECKSUM_OFFSET: usize = 6;

/// A computed checksum that disagrees with the one on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub expected: u16,
    pub actual: u16,
}

fn sum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

fn compare(expected: u16, actual: u16) -> Result<(), Mismatch> {
    if expected == actual {
        Ok(())
    } else {
        Err(Mismatch { expected, actual })
    }
}

/// Big-endian 16-bit value at `offset`, if the buffer is long enough.
pub fn read_be16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2).map(BigEndian::read_u16)
}

// ============================================================================
// Header-pair checksum (frame-length responses)
// ============================================================================

/// `(frame[4] + frame[5]) & 0xFFFF`.
pub fn header_pair(frame: &[u8]) -> u16 {
    (u32::from(frame[4]) + u32::from(frame[5])) as u16
}

/// Write the header-pair checksum into bytes 6..8 of a control frame.
pub fn seal_header_pair(frame: &mut [u8]) {
    let ck = header_pair(frame);
    BigEndian::write_u16(&mut frame[CONTROL_CHECKSUM_OFFSET..], ck);
}

pub fn check_header_pair(frame: &[u8]) -> Result<(), Mismatch> {
    compare(header_pair(frame), BigEndian::read_u16(&frame[CONTROL_CHECKSUM_OFFSET..]))
}

// ============================================================================
// Report-info checksum (header pair folded with the report id)
// ============================================================================

/// `(id + frame[4] + frame[5]) & 0xFFFF`.
pub fn report_info(id: u8, frame: &[u8]) -> u16 {
    (u32::from(id) + u32::from(frame[4]) + u32::from(frame[5])) as u16
}

pub fn seal_report_info(id: u8, frame: &mut [u8]) {
    let ck = report_info(id, frame);
    BigEndian::write_u16(&mut frame[CONTROL_CHECKSUM_OFFSET..], ck);
}

pub fn check_report_info(id: u8, frame: &[u8]) -> Result<(), Mismatch> {
    compare(
        report_info(id, frame),
        BigEndian::read_u16(&frame[CONTROL_CHECKSUM_OFFSET..]),
    )
}

// ============================================================================
// Report payload checksum
// ============================================================================

/// `id + sum(payload)`, wrapped to 16 bits.
pub fn report_payload(id: u8, payload: &[u8]) -> u16 {
    sum(payload).wrapping_add(u32::from(id)) as u16
}

/// Seal a report-data response of `len + 6` bytes whose payload sits at 4..4+len.
pub fn seal_report_payload(id: u8, response: &mut [u8]) {
    let len = response.len() - 6;
    let ck = report_payload(id, &response[4..4 + len]);
    BigEndian::write_u16(&mut response[4 + len..], ck);
}

pub fn check_report_payload(id: u8, response: &[u8], len: usize) -> Result<(), Mismatch> {
    compare(
        report_payload(id, &response[4..4 + len]),
        BigEndian::read_u16(&response[4 + len..]),
    )
}

// ============================================================================
// Frame payload checksum
// ============================================================================

/// `sum(response[1 .. n-2))`, wrapped to 16 bits.
pub fn frame_payload(response: &[u8]) -> u16 {
    sum(&response[1..response.len() - 2]) as u16
}

/// Seal a frame-data response: checksum goes in the last two bytes.
pub fn seal_frame_payload(response: &mut [u8]) {
    let n = response.len();
    let ck = frame_payload(response);
    BigEndian::write_u16(&mut response[n - 2..], ck);
}

pub fn check_frame_payload(response: &[u8]) -> Result<(), Mismatch> {
    let n = response.len();
    compare(frame_payload(response), BigEndian::read_u16(&response[n - 2..]))
}

// ============================================================================
// Upload checksum
// ============================================================================

/// Running byte sum over the uploaded data followed by its packet header.
///
/// The sum is not folded; only its low 16 bits are compared against the
/// device readback.
pub fn upload(data: &[u8], header: &[u8]) -> u32 {
    sum(data).wrapping_add(sum(header))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_frame(len: u16) -> [u8; 8] {
        let mut frame = [0xAA, 0, 0, 0, (len >> 8) as u8, len as u8, 0, 0];
        seal_header_pair(&mut frame);
        frame
    }

    #[test]
    fn test_header_pair_seal_and_check() {
        let frame = length_frame(0x01F4);
        assert_eq!(&frame[6..], &[0x00, 0x01 + 0xF4]);
        assert!(check_header_pair(&frame).is_ok());
        assert_eq!(read_be16(&frame, 4), Some(0x01F4));
    }

    #[test]
    fn test_header_pair_is_not_folded_into_one_byte() {
        let frame = length_frame(0xFFFF);
        assert_eq!(read_be16(&frame, 6), Some(0x01FE));
    }

    #[test]
    fn test_report_info_folds_id() {
        let mut frame = [0xAA, 0, 0, 0, 0x10, 0x20, 0, 0];
        seal_report_info(0xD3, &mut frame);
        assert_eq!(read_be16(&frame, 6), Some(0xD3 + 0x10 + 0x20));
        assert!(check_report_info(0xD3, &frame).is_ok());
        assert!(check_report_info(0xD1, &frame).is_err());
    }

    #[test]
    fn test_report_payload_detects_single_byte_corruption() {
        let payload = [0x01u8, 0x7F, 0xFF, 0x00, 0x42];
        let mut response = vec![0xAA, 0, 0, 0];
        response.extend_from_slice(&payload);
        response.extend_from_slice(&[0, 0]);
        seal_report_payload(0xD9, &mut response);
        assert!(check_report_payload(0xD9, &response, payload.len()).is_ok());

        for i in 4..response.len() {
            let mut corrupted = response.clone();
            corrupted[i] ^= 0x01;
            assert!(
                check_report_payload(0xD9, &corrupted, payload.len()).is_err(),
                "corruption at byte {i} not detected"
            );
        }
    }

    #[test]
    fn test_frame_payload_detects_single_byte_corruption() {
        let mut response = vec![0xAA, 0x44, 0x01, 0x18, 0x00, 0x9C, 0xFE, 0, 0];
        seal_frame_payload(&mut response);
        assert!(check_frame_payload(&response).is_ok());

        for i in 1..response.len() {
            let mut corrupted = response.clone();
            corrupted[i] = corrupted[i].wrapping_add(1);
            assert!(check_frame_payload(&corrupted).is_err());
        }
    }

    #[test]
    fn test_frame_payload_excludes_sync_byte() {
        let mut a = vec![0xAA, 1, 2, 3, 0, 0];
        let mut b = vec![0x00, 1, 2, 3, 0, 0];
        seal_frame_payload(&mut a);
        seal_frame_payload(&mut b);
        assert_eq!(&a[4..], &b[4..]);
        assert_eq!(read_be16(&a, 4), Some(6));
    }

    #[test]
    fn test_upload_sums_data_and_header() {
        let header = [0xC2, 0x40, 0x00, 0x00, 0x00, 0x00];
        let data = [0xFFu8; 1016];
        assert_eq!(upload(&data, &header), 1016 * 0xFF + 0xC2 + 0x40);
    }

    #[test]
    fn test_read_be16_bounds() {
        assert_eq!(read_be16(&[0x12, 0x34], 0), Some(0x1234));
        assert_eq!(read_be16(&[0x12, 0x34], 1), None);
    }
}
