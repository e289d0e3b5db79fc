//! Touch frame structures.
//!
//! Frames are little-endian. Fields are read by offset so that a
//! protocol-supplied header length or record stride never has to match the
//! sizes declared here.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{FRAME_TYPE_0X43, FRAME_TYPE_0X44};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame header truncated: expected {expected} bytes, got {actual}")]
    HeaderTruncated { expected: usize, actual: usize },
    #[error("Finger record at offset {offset} truncated: expected {expected} bytes, got {actual}")]
    FingerTruncated {
        offset: usize,
        expected: usize,
        actual: usize,
    },
}

/// Frame header (24 bytes / 0x18).
///
/// | off | field |
/// |-----|-------|
/// | 0 | type |
/// | 1 | frame number |
/// | 2 | header length |
/// | 4 | timestamp (u32) |
/// | 14 | is-image (u16) |
/// | 16 | finger count |
/// | 17 | finger record stride |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: u8,
    pub frame_num: u8,
    pub header_len: u8,
    pub timestamp: u32,
    pub is_image: u16,
    pub num_fingers: u8,
    pub finger_data_len: u8,
}

impl FrameHeader {
    pub const SIZE: usize = 24;

    /// Bytes needed to read every field this decoder uses.
    pub const MIN_LEN: usize = 18;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < Self::MIN_LEN {
            return Err(FrameError::HeaderTruncated {
                expected: Self::MIN_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            frame_type: data[0],
            frame_num: data[1],
            header_len: data[2],
            timestamp: LittleEndian::read_u32(&data[4..8]),
            is_image: LittleEndian::read_u16(&data[14..16]),
            num_fingers: data[16],
            finger_data_len: data[17],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.frame_type);
        buf.push(self.frame_num);
        buf.push(self.header_len);
        buf.push(0);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&[0; 6]);
        buf.extend_from_slice(&self.is_image.to_le_bytes());
        buf.push(self.num_fingers);
        buf.push(self.finger_data_len);
        buf.extend_from_slice(&[0; 6]);
        buf
    }

    /// Whether the type tag is one the main firmware is known to send.
    pub fn is_known_type(&self) -> bool {
        matches!(self.frame_type, FRAME_TYPE_0X43 | FRAME_TYPE_0X44)
    }
}

/// Per-contact record (28 bytes / 0x1C).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerRecord {
    pub id: u8,
    pub event: u8,
    pub x: i16,
    pub y: i16,
    pub rel_x: i16,
    pub rel_y: i16,
    pub size_major: u16,
    pub size_minor: u16,
    pub orientation: u16,
    pub force_major: u16,
    pub force_minor: u16,
}

impl FingerRecord {
    pub const SIZE: usize = 28;

    /// Bytes up to and including `force_minor`.
    pub const MIN_LEN: usize = 22;

    /// Parse the record starting at `offset` inside `data`.
    pub fn from_bytes_at(data: &[u8], offset: usize) -> Result<Self, FrameError> {
        let actual = data.len().saturating_sub(offset);
        let rec = data
            .get(offset..offset + Self::MIN_LEN)
            .ok_or(FrameError::FingerTruncated {
                offset,
                expected: Self::MIN_LEN,
                actual,
            })?;
        Ok(Self {
            id: rec[0],
            event: rec[1],
            x: LittleEndian::read_i16(&rec[4..6]),
            y: LittleEndian::read_i16(&rec[6..8]),
            rel_x: LittleEndian::read_i16(&rec[8..10]),
            rel_y: LittleEndian::read_i16(&rec[10..12]),
            size_major: LittleEndian::read_u16(&rec[12..14]),
            size_minor: LittleEndian::read_u16(&rec[14..16]),
            orientation: LittleEndian::read_u16(&rec[16..18]),
            force_major: LittleEndian::read_u16(&rec[18..20]),
            force_minor: LittleEndian::read_u16(&rec[20..22]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(self.id);
        buf.push(self.event);
        buf.extend_from_slice(&[0; 2]);
        buf.extend_from_slice(&self.x.to_le_bytes());
        buf.extend_from_slice(&self.y.to_le_bytes());
        buf.extend_from_slice(&self.rel_x.to_le_bytes());
        buf.extend_from_slice(&self.rel_y.to_le_bytes());
        buf.extend_from_slice(&self.size_major.to_le_bytes());
        buf.extend_from_slice(&self.size_minor.to_le_bytes());
        buf.extend_from_slice(&self.orientation.to_le_bytes());
        buf.extend_from_slice(&self.force_major.to_le_bytes());
        buf.extend_from_slice(&self.force_minor.to_le_bytes());
        buf.extend_from_slice(&[0; 6]);
        buf
    }

    /// Subtract the pressure floor from both force readings, clamping at zero.
    pub fn apply_pressure_floor(&mut self, floor: u8) {
        self.force_major = self.force_major.saturating_sub(u16::from(floor));
        self.force_minor = self.force_minor.saturating_sub(u16::from(floor));
    }

    /// A contact is live while either force reading is positive.
    pub fn is_live(&self) -> bool {
        self.force_major > 0 || self.force_minor > 0
    }
}
