//! Request/response transactions with the main firmware.
//!
//! Every query is retried up to [`TRANSACTION_ATTEMPTS`] times. A response
//! is accepted only when its first byte is the sync byte and its checksum
//! matches; anything else is a transient failure.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::protocol::checksum::{self, Mismatch};
use crate::protocol::constants::*;
use crate::transport::{SpiSettings, SpiTransport, TransportError};

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Bad sync byte: got 0x{actual:02X}")]
    BadSync { actual: u8 },

    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Device requested a {len} byte packet, max is {max}")]
    Oversized { len: usize, max: usize },

    #[error("Response too short: {len} bytes")]
    ShortResponse { len: usize },

    #[error("Report 0x{id:02X} returned error code {code}")]
    ReportError { id: u8, code: u8 },

    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: usize,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<Mismatch> for TransactionError {
    fn from(m: Mismatch) -> Self {
        TransactionError::ChecksumMismatch {
            expected: m.expected,
            actual: m.actual,
        }
    }
}

/// Alternating byte carried by frame-length queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollToken {
    #[default]
    A,
    B,
}

impl PollToken {
    pub fn byte(self) -> u8 {
        match self {
            PollToken::A => POLL_TOKEN_A,
            PollToken::B => POLL_TOKEN_B,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            PollToken::A => PollToken::B,
            PollToken::B => PollToken::A,
        }
    }
}

/// Parameters negotiated by the interface probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub version: u8,
    pub max_packet_size: u16,
}

impl Default for InterfaceInfo {
    fn default() -> Self {
        Self {
            version: 0,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Report-info response fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportInfo {
    /// 4-bit device error code; nonzero means the report is unavailable.
    pub error: u8,
    /// 12-bit payload length.
    pub len: u16,
}

/// Outcome of one successful frame read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    /// The device had nothing to send.
    Empty,
    /// Frame payload, header first.
    Data(Vec<u8>),
}

/// Request buffer pre-filled with an opcode byte.
///
/// Only the patch bytes change between requests; the buffer grows with the
/// same fill byte when a request needs more than its current capacity.
#[derive(Debug, Clone)]
pub struct PacketTemplate {
    fill: u8,
    buf: Vec<u8>,
}

impl PacketTemplate {
    pub fn new(fill: u8) -> Self {
        Self {
            fill,
            buf: vec![fill; PACKET_BUFFER_SIZE],
        }
    }

    pub fn patch(&mut self, offset: usize, byte: u8) {
        if self.buf.len() <= offset {
            self.buf.resize(offset + 1, self.fill);
        }
        self.buf[offset] = byte;
    }

    /// The first `len` bytes of the template.
    pub fn request(&mut self, len: usize) -> &[u8] {
        if self.buf.len() < len {
            self.buf.resize(len, self.fill);
        }
        &self.buf[..len]
    }
}

fn expect_sync(rx: &[u8]) -> Result<(), TransactionError> {
    match rx.first() {
        Some(&SYNC_BYTE) => Ok(()),
        Some(&actual) => Err(TransactionError::BadSync { actual }),
        None => Err(TransactionError::ShortResponse { len: 0 }),
    }
}

/// Run `attempt` up to [`TRANSACTION_ATTEMPTS`] times, pausing after each failure.
fn with_retries<T, R>(
    transport: &T,
    operation: &'static str,
    delay: Duration,
    mut attempt: impl FnMut() -> Result<R, TransactionError>,
) -> Result<R, TransactionError>
where
    T: SpiTransport,
{
    for n in 1..=TRANSACTION_ATTEMPTS {
        match attempt() {
            Ok(r) => return Ok(r),
            Err(e) => {
                debug!(operation, attempt = n, error = %e, "Transaction attempt failed");
                transport.delay(delay);
            }
        }
    }

    Err(TransactionError::RetriesExhausted {
        operation,
        attempts: TRANSACTION_ATTEMPTS,
    })
}

/// Protocol state shared by every transaction with the main firmware.
#[derive(Debug, Clone)]
pub struct TransactionEngine {
    poll_token: PollToken,
    interface: InterfaceInfo,
    report_template: PacketTemplate,
    frame_template: PacketTemplate,
}

impl Default for TransactionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionEngine {
    pub fn new() -> Self {
        Self {
            poll_token: PollToken::A,
            interface: InterfaceInfo::default(),
            report_template: PacketTemplate::new(REPORT_DATA_FILL),
            frame_template: PacketTemplate::new(FRAME_DATA_FILL),
        }
    }

    pub fn poll_token(&self) -> PollToken {
        self.poll_token
    }

    pub fn interface(&self) -> InterfaceInfo {
        self.interface
    }

    /// Probe the interface version and max packet size.
    ///
    /// On failure the engine falls back to version 0 and the default max
    /// packet size, and the error is still returned.
    pub fn query_interface<T: SpiTransport>(
        &mut self,
        transport: &T,
    ) -> Result<InterfaceInfo, TransactionError> {
        let result = with_retries(
            transport,
            "interface version query",
            PROBE_RETRY_DELAY,
            || {
                let mut rx = [0u8; 4];
                transport.transceive(&SpiSettings::NORMAL, &CMD_INTERFACE_PROBE, &mut rx)?;
                expect_sync(&rx)?;
                Ok(InterfaceInfo {
                    version: rx[1],
                    max_packet_size: u16::from_be_bytes([rx[2], rx[3]]),
                })
            },
        );

        match result {
            Ok(iface) => {
                info!(
                    version = iface.version,
                    max_packet_size = iface.max_packet_size,
                    "Interface negotiated"
                );
                self.interface = iface;
                Ok(iface)
            }
            Err(e) => {
                self.interface = InterfaceInfo::default();
                Err(e)
            }
        }
    }

    /// Ask for the error code and length of report `id`.
    pub fn report_info<T: SpiTransport>(
        &mut self,
        transport: &T,
        id: u8,
    ) -> Result<ReportInfo, TransactionError> {
        with_retries(transport, "report info query", RETRY_DELAY, || {
            let mut tx = [REPORT_INFO_FILL; CONTROL_FRAME_LEN];
            tx[REPORT_ID_OFFSET] = id;
            let mut rx = [0u8; CONTROL_FRAME_LEN];

            transport.transceive(&SpiSettings::NORMAL, &tx, &mut rx)?;
            expect_sync(&rx)?;
            checksum::check_report_info(id, &rx)?;

            Ok(ReportInfo {
                error: (rx[4] >> 4) & 0x0F,
                len: (u16::from(rx[4] & 0x0F) << 8) | u16::from(rx[5]),
            })
        })
    }

    /// Fetch the payload of report `id`.
    pub fn report<T: SpiTransport>(
        &mut self,
        transport: &T,
        id: u8,
    ) -> Result<Vec<u8>, TransactionError> {
        let info = self.report_info(transport, id)?;
        if info.error != 0 {
            return Err(TransactionError::ReportError {
                id,
                code: info.error,
            });
        }

        let len = usize::from(info.len);
        let n = len + REPORT_OVERHEAD;
        let mut rx = vec![0u8; n];
        let template = &mut self.report_template;

        let payload = with_retries(transport, "report query", RETRY_DELAY, || {
            template.patch(REPORT_ID_OFFSET, id);
            transport.transceive(&SpiSettings::NORMAL, template.request(n), &mut rx)?;
            expect_sync(&rx)?;
            checksum::check_report_payload(id, &rx, len)?;
            Ok(rx[REPORT_PAYLOAD_OFFSET..REPORT_PAYLOAD_OFFSET + len].to_vec())
        })?;

        trace!(id = %format!("0x{:02X}", id), len, "Report received");
        Ok(payload)
    }

    /// Ask how many bytes the next frame holds.
    pub fn frame_length<T: SpiTransport>(&mut self, transport: &T) -> Result<usize, TransactionError> {
        let tx = [self.poll_token.byte(); CONTROL_FRAME_LEN];
        let max = usize::from(self.interface.max_packet_size);

        with_retries(transport, "frame length query", RETRY_DELAY, || {
            let mut rx = [0u8; CONTROL_FRAME_LEN];
            transport.transceive(&SpiSettings::NORMAL, &tx, &mut rx)?;
            expect_sync(&rx)?;
            checksum::check_header_pair(&rx)?;

            let len = usize::from(u16::from_be_bytes([rx[4], rx[5]]));
            if len > max {
                warn!(len, max, "Device unexpectedly requested an oversized packet");
                return Err(TransactionError::Oversized { len, max });
            }
            Ok(len)
        })
    }

    /// Read a frame of `len` bytes and return its payload.
    ///
    /// The request is `len + 1` bytes; the payload sits between the sync
    /// byte and the trailing checksum.
    pub fn frame_data<T: SpiTransport>(
        &mut self,
        transport: &T,
        len: usize,
    ) -> Result<Vec<u8>, TransactionError> {
        let n = len + 1;
        if n < 3 {
            return Err(TransactionError::ShortResponse { len: n });
        }

        let mut rx = vec![0u8; n];
        let template = &mut self.frame_template;

        with_retries(transport, "frame data query", RETRY_DELAY, || {
            transport.transceive(&SpiSettings::NORMAL, template.request(n), &mut rx)?;
            expect_sync(&rx)?;
            checksum::check_frame_payload(&rx)?;
            Ok(rx[1..n - 2].to_vec())
        })
    }

    /// Read one frame: length first, then data if there is any.
    ///
    /// The poll token flips only after a nonempty frame is delivered.
    pub fn read_frame<T: SpiTransport>(&mut self, transport: &T) -> Result<FrameRead, TransactionError> {
        for attempt in 1..=TRANSACTION_ATTEMPTS {
            let len = match self.frame_length(transport) {
                Ok(len) => len,
                Err(e) => {
                    warn!(attempt, error = %e, "Error getting frame length");
                    transport.delay(RETRY_DELAY);
                    continue;
                }
            };

            if len == 0 {
                return Ok(FrameRead::Empty);
            }

            match self.frame_data(transport, len) {
                Ok(payload) => {
                    self.poll_token = self.poll_token.flipped();
                    return Ok(FrameRead::Data(payload));
                }
                Err(e) => {
                    warn!(attempt, len, error = %e, "Error getting frame data");
                    transport.delay(RETRY_DELAY);
                }
            }
        }

        Err(TransactionError::RetriesExhausted {
            operation: "frame read",
            attempts: TRANSACTION_ATTEMPTS,
        })
    }
}
