//! Touch frame decoder.
//!
//! Turns one frame payload into touch events. Protocol anomalies (unknown
//! type tag, short header) are logged and decoding continues; a record that
//! runs past the end of the buffer ends the finger loop.

use tracing::{trace, warn};

use crate::events::{TouchEvent, TouchObservation, TouchSink};
use crate::protocol::constants::{DEFAULT_MIN_PRESSURE, MAX_FINGER_ORIENTATION, MIN_FINGER_HEADER_LEN};
use crate::protocol::{FingerRecord, FrameHeader};

/// What a decode pass saw, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub header: Option<FrameHeader>,
    /// Finger records actually read from the buffer.
    pub fingers: usize,
    /// Positional observations emitted.
    pub contacts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecoder {
    pub sensor_height: i32,
    pub min_pressure: u8,
}

impl FrameDecoder {
    pub fn new(sensor_height: i32) -> Self {
        Self {
            sensor_height,
            min_pressure: DEFAULT_MIN_PRESSURE,
        }
    }

    pub fn with_min_pressure(mut self, min_pressure: u8) -> Self {
        self.min_pressure = min_pressure;
        self
    }

    /// Decode `data` and emit its events to `sink`.
    ///
    /// A sync event is always emitted last, even for an undecodable frame.
    pub fn decode<S: TouchSink + ?Sized>(&self, data: &[u8], sink: &S) -> DecodeSummary {
        let mut summary = DecodeSummary::default();

        let header = match FrameHeader::from_bytes(data) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                sink.on_event(&TouchEvent::Sync);
                return summary;
            }
        };
        summary.header = Some(header);

        if !header.is_known_type() {
            warn!(frame_type = %format!("0x{:02X}", header.frame_type), "Unknown frame type");
        }
        if header.header_len < MIN_FINGER_HEADER_LEN {
            warn!(header_len = header.header_len, "No finger data in frame");
        }

        trace!(
            frame_num = header.frame_num,
            timestamp = header.timestamp,
            fingers = header.num_fingers,
            "Decoding frame"
        );

        let stride = usize::from(header.finger_data_len);
        let mut offset = usize::from(header.header_len);
        let mut first = None;

        for slot in 0..header.num_fingers {
            let mut finger = match FingerRecord::from_bytes_at(data, offset) {
                Ok(f) => f,
                Err(e) => {
                    warn!(slot, error = %e, "Finger data runs past end of frame");
                    break;
                }
            };
            summary.fingers += 1;

            finger.apply_pressure_floor(self.min_pressure);
            if finger.is_live() {
                sink.on_event(&TouchEvent::Contact(self.observe(&finger)));
                summary.contacts += 1;
            }
            sink.on_event(&TouchEvent::ContactEnd);

            if first.is_none() {
                first = Some(finger);
            }
            offset += stride;
        }

        if let Some(finger) = first {
            if finger.force_minor > 0 {
                sink.on_event(&TouchEvent::SingleTouch {
                    x: i32::from(finger.x),
                    y: self.sensor_height - i32::from(finger.y),
                });
                sink.on_event(&TouchEvent::Button {
                    touching: finger.size_minor > 0,
                });
            } else {
                sink.on_event(&TouchEvent::Button { touching: false });
            }
        } else if header.num_fingers > 0 {
            // First record was cut off; still release the legacy contact
            sink.on_event(&TouchEvent::Button { touching: false });
        }

        sink.on_event(&TouchEvent::Sync);
        summary
    }

    fn observe(&self, finger: &FingerRecord) -> TouchObservation {
        TouchObservation {
            tracking_id: finger.id,
            x: i32::from(finger.x),
            y: self.sensor_height - i32::from(finger.y),
            touch_major: finger.force_major,
            touch_minor: finger.force_minor,
            width_major: finger.size_major,
            width_minor: finger.size_minor,
            orientation: MAX_FINGER_ORIENTATION - i32::from(finger.orientation),
        }
    }
}
