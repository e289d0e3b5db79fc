//! Protocol constants for the Zephyr multitouch controller.
//!
//! Values are fixed by the controller's boot ROM and main firmware and must
//! be reproduced bit-exact.

use std::time::Duration;

// ============================================================================
// Response sentinels
// ============================================================================

/// Leading byte of every well-formed response from the main firmware.
pub const SYNC_BYTE: u8 = 0xAA;

/// Acknowledgement pair returned by the boot ROM to a verify command.
pub const VERIFY_ACK: [u8; 2] = [0xD0, 0x00];

// ============================================================================
// Poll tokens
// ============================================================================

/// First poll token; a fresh session starts here.
pub const POLL_TOKEN_A: u8 = 0x64;
/// Second poll token.
pub const POLL_TOKEN_B: u8 = 0x65;

// ============================================================================
// Commands (Host -> Device)
// ============================================================================

/// Interface version probe (all four bytes identical).
pub const CMD_INTERFACE_PROBE: [u8; 4] = [0xD0; 4];

/// Verify the checksum of the data just uploaded.
pub const CMD_VERIFY: [u8; 4] = [0x05, 0x00, 0x00, 0x06];

/// Execute the uploaded image.
pub const CMD_EXECUTE: [u8; 4] = [0xC4, 0x00, 0x00, 0xC4];

/// Prime the boot stage for a bulk main firmware transfer.
pub const CMD_BLANK_DATA: [u8; 4] = [0xC2, 0x00, 0x00, 0x00];

/// Opcode leading each first-stage data packet.
pub const OPCODE_BOOTLOADER_DATA: u8 = 0xC2;

/// Fill byte of the 8-byte report-info request.
pub const REPORT_INFO_FILL: u8 = 0x8F;

/// Fill byte of the report-data request template.
pub const REPORT_DATA_FILL: u8 = 0x82;

/// Fill byte of the frame-data request template.
pub const FRAME_DATA_FILL: u8 = 0x68;

/// Offset of the report id inside report requests.
pub const REPORT_ID_OFFSET: usize = 1;

// ============================================================================
// Report ids
// ============================================================================

pub const REPORT_FAMILY_ID: u8 = 0xD1;
pub const REPORT_SENSOR_INFO: u8 = 0xD3;
pub const REPORT_SENSOR_REGION_DESC: u8 = 0xD0;
pub const REPORT_SENSOR_REGION_PARAM: u8 = 0xA1;
pub const REPORT_SENSOR_DIM: u8 = 0xD9;

// ============================================================================
// Sizes
// ============================================================================

/// Size of the control frames used by report-info and frame-length queries.
pub const CONTROL_FRAME_LEN: usize = 8;

/// Bytes surrounding a report payload: sync + 3 header bytes + 2 checksum bytes.
pub const REPORT_OVERHEAD: usize = 6;

/// Offset of the report payload inside a report-data response.
pub const REPORT_PAYLOAD_OFFSET: usize = 4;

/// Initial capacity of the request templates and scratch buffers.
pub const PACKET_BUFFER_SIZE: usize = 0x400;

/// Max packet size assumed when the interface probe never succeeds.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 1000;

/// Destination of the first first-stage chunk.
pub const BOOTLOADER_BASE_ADDRESS: u32 = 0x4000_0000;

/// Data bytes carried by one first-stage packet.
pub const BOOTLOADER_CHUNK_SIZE: usize = 0x3F8;

/// Header bytes of a first-stage packet: opcode + 4-byte address + reserved.
pub const BOOTLOADER_HEADER_LEN: usize = 6;

/// Total size of one first-stage packet (header + data + checksum).
pub const BOOTLOADER_PACKET_SIZE: usize = 0x400;

// ============================================================================
// Retry discipline
// ============================================================================

/// Attempts made by every transaction-engine query.
pub const TRANSACTION_ATTEMPTS: usize = 4;

/// Attempts made per upload before the load is abandoned.
pub const UPLOAD_ATTEMPTS: usize = 5;

/// Pause between transaction retries.
pub const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Pause between interface probe retries.
pub const PROBE_RETRY_DELAY: Duration = Duration::from_millis(3);

/// Settle time between a first-stage packet and its verify command.
pub const CHUNK_SETTLE_DELAY: Duration = Duration::from_micros(300);

/// Settle time after each firmware stage.
pub const STAGE_SETTLE_DELAY: Duration = Duration::from_millis(1);

// ============================================================================
// Frame decoding
// ============================================================================

/// Frame type tags emitted by the main firmware.
pub const FRAME_TYPE_0X43: u8 = 0x43;
pub const FRAME_TYPE_0X44: u8 = 0x44;

/// Header lengths below this carry no finger data.
pub const MIN_FINGER_HEADER_LEN: u8 = 12;

/// Orientation is reported relative to this value.
pub const MAX_FINGER_ORIENTATION: i32 = 16384;

/// Highest tracking id advertised to the sink.
pub const MAX_TRACKING_ID: i32 = 32;

/// Pressure floor applied when nothing else is configured.
pub const DEFAULT_MIN_PRESSURE: u8 = 100;

// ============================================================================
// Sensor geometry
// ============================================================================

/// Raw width field origin of the sensor-dimension report.
pub const SENSOR_WIDTH_ORIGIN: i64 = 9000;
/// Raw height field origin of the sensor-dimension report.
pub const SENSOR_HEIGHT_ORIGIN: i64 = 13850;
/// Scale applied to raw dimension fields, as numerator / denominator.
pub const SENSOR_SCALE_NUM: i64 = 84;
pub const SENSOR_SCALE_DEN: i64 = 73;
