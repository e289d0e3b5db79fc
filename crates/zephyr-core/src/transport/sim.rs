//! Simulated Zephyr controller.
//!
//! Models the device side of every exchange the protocol engine performs:
//! boot ROM upload readback, first-stage bulk load, interface probe, report
//! queries and touch frame polling. Responses can be corrupted on demand to
//! exercise the retry paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::mock::IDLE_BYTE;
use super::traits::{PowerControl, SpiSettings, SpiTransport, TransportError};
use crate::protocol::checksum;
use crate::protocol::constants::*;
use crate::protocol::header::{FingerRecord, FrameHeader};

/// Which image the simulated controller is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStage {
    /// Power rail off.
    Off,
    /// Boot ROM waiting for first-stage packets.
    BootRom,
    /// First stage running, waiting for the main image.
    FirstStage,
    /// Main firmware running.
    Running,
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub chunks_received: usize,
    pub main_images_received: usize,
    pub frames_delivered: usize,
    pub corrupted_responses: usize,
}

#[derive(Debug)]
struct SimState {
    stage: SimStage,
    last_upload_checksum: Option<u32>,
    awaiting_image: bool,
    main_loaded: bool,
    interface_version: u8,
    max_packet_size: u16,
    reports: BTreeMap<u8, Vec<u8>>,
    report_errors: BTreeMap<u8, u8>,
    frames: VecDeque<Vec<u8>>,
    corrupt_next: usize,
    last_token: Option<u8>,
    stats: SimStats,
}

/// Simulated controller implementing both transport and power ports.
pub struct SimulatedController {
    state: Mutex<SimState>,
}

impl SimulatedController {
    /// Raw sensor-dimension fields reporting a 4200 x 6300 surface.
    pub const DEFAULT_RAW_WIDTH: u32 = 5350;
    pub const DEFAULT_RAW_HEIGHT: u32 = 8375;

    pub fn new() -> Self {
        let mut dims = [0u8; 8];
        LittleEndian::write_u32(&mut dims[0..4], Self::DEFAULT_RAW_WIDTH);
        LittleEndian::write_u32(&mut dims[4..8], Self::DEFAULT_RAW_HEIGHT);

        let mut reports = BTreeMap::new();
        reports.insert(REPORT_FAMILY_ID, vec![0x5A]);
        reports.insert(REPORT_SENSOR_INFO, vec![0x01, 15, 10, 0x02, 0x31]);
        reports.insert(REPORT_SENSOR_REGION_DESC, vec![0x01, 0x00, 0x0F, 0x0A]);
        reports.insert(REPORT_SENSOR_REGION_PARAM, vec![0x10, 0x20, 0x30]);
        reports.insert(REPORT_SENSOR_DIM, dims.to_vec());

        Self {
            state: Mutex::new(SimState {
                stage: SimStage::Off,
                last_upload_checksum: None,
                awaiting_image: false,
                main_loaded: false,
                interface_version: 1,
                max_packet_size: DEFAULT_MAX_PACKET_SIZE,
                reports,
                report_errors: BTreeMap::new(),
                frames: VecDeque::new(),
                corrupt_next: 0,
                last_token: None,
                stats: SimStats::default(),
            }),
        }
    }

    /// Replace the contents of a report.
    pub fn set_report(&self, id: u8, data: &[u8]) {
        self.state.lock().unwrap().reports.insert(id, data.to_vec());
    }

    /// Make a report answer with a nonzero error code.
    pub fn set_report_error(&self, id: u8, code: u8) {
        self.state.lock().unwrap().report_errors.insert(id, code & 0x0F);
    }

    pub fn set_interface(&self, version: u8, max_packet_size: u16) {
        let mut state = self.state.lock().unwrap();
        state.interface_version = version;
        state.max_packet_size = max_packet_size;
    }

    /// Queue a raw frame payload (header + finger records).
    pub fn queue_frame(&self, payload: Vec<u8>) {
        self.state.lock().unwrap().frames.push_back(payload);
    }

    /// Queue a well-formed touch frame carrying `fingers`.
    pub fn queue_touch_frame(&self, frame_num: u8, timestamp: u32, fingers: &[FingerRecord]) {
        let header = FrameHeader {
            frame_type: FRAME_TYPE_0X44,
            frame_num,
            header_len: FrameHeader::SIZE as u8,
            timestamp,
            is_image: 0,
            num_fingers: fingers.len() as u8,
            finger_data_len: FingerRecord::SIZE as u8,
        };
        let mut payload = header.to_bytes();
        for finger in fingers {
            payload.extend_from_slice(&finger.to_bytes());
        }
        self.queue_frame(payload);
    }

    /// Invert the first byte of the next `count` non-idle responses.
    pub fn corrupt_next(&self, count: usize) {
        self.state.lock().unwrap().corrupt_next = count;
    }

    pub fn stage(&self) -> SimStage {
        self.state.lock().unwrap().stage
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().unwrap().stats
    }

    pub fn pending_frames(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    /// Poll token carried by the most recent frame-length query.
    pub fn last_token(&self) -> Option<u8> {
        self.state.lock().unwrap().last_token
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn respond(&mut self, tx: &[u8]) -> Option<Vec<u8>> {
        if tx == CMD_VERIFY {
            let ck = self.last_upload_checksum?;
            return Some(vec![VERIFY_ACK[0], VERIFY_ACK[1], (ck >> 8) as u8, ck as u8]);
        }
        if tx == CMD_EXECUTE {
            self.execute();
            return None;
        }

        match self.stage {
            SimStage::Off | SimStage::BootRom => None,
            SimStage::FirstStage => {
                if tx == CMD_BLANK_DATA {
                    self.awaiting_image = true;
                }
                None
            }
            SimStage::Running => self.respond_running(tx),
        }
    }

    fn execute(&mut self) {
        match self.stage {
            SimStage::BootRom if self.stats.chunks_received > 0 => {
                debug!("sim: first stage executing");
                self.stage = SimStage::FirstStage;
                self.last_upload_checksum = None;
            }
            SimStage::FirstStage if self.main_loaded => {
                debug!("sim: main firmware executing");
                self.stage = SimStage::Running;
            }
            _ => trace!(stage = ?self.stage, "sim: execute ignored"),
        }
    }

    fn respond_running(&mut self, tx: &[u8]) -> Option<Vec<u8>> {
        if tx == CMD_INTERFACE_PROBE {
            let mps = self.max_packet_size;
            return Some(vec![SYNC_BYTE, self.interface_version, (mps >> 8) as u8, mps as u8]);
        }

        let first = *tx.first()?;
        let uniform = tx.iter().all(|&b| b == first);

        if tx.len() == CONTROL_FRAME_LEN && first == REPORT_INFO_FILL {
            return Some(self.report_info(tx[REPORT_ID_OFFSET]));
        }
        if first == REPORT_DATA_FILL && tx.len() >= REPORT_OVERHEAD {
            return Some(self.report_data(tx[REPORT_ID_OFFSET], tx.len() - REPORT_OVERHEAD));
        }
        if tx.len() == CONTROL_FRAME_LEN && uniform && (first == POLL_TOKEN_A || first == POLL_TOKEN_B) {
            self.last_token = Some(first);
            return Some(self.frame_length());
        }
        if uniform && first == FRAME_DATA_FILL {
            return Some(self.frame_data(tx.len()));
        }
        None
    }

    fn report_info(&self, id: u8) -> Vec<u8> {
        let (err, len) = match (self.report_errors.get(&id), self.reports.get(&id)) {
            (Some(&err), _) => (err, 0),
            (None, Some(data)) => (0, data.len() as u16 & 0x0FFF),
            (None, None) => (0x0F, 0),
        };
        let mut frame = vec![SYNC_BYTE, 0, 0, 0, (err << 4) | (len >> 8) as u8, len as u8, 0, 0];
        checksum::seal_report_info(id, &mut frame);
        frame
    }

    fn report_data(&self, id: u8, len: usize) -> Vec<u8> {
        let mut response = vec![0u8; len + REPORT_OVERHEAD];
        response[0] = SYNC_BYTE;
        response[1] = id;
        if let Some(data) = self.reports.get(&id) {
            let n = data.len().min(len);
            response[REPORT_PAYLOAD_OFFSET..REPORT_PAYLOAD_OFFSET + n].copy_from_slice(&data[..n]);
        }
        checksum::seal_report_payload(id, &mut response);
        response
    }

    fn frame_length(&self) -> Vec<u8> {
        let len = self.frames.front().map_or(0, |f| f.len() + 2) as u16;
        let mut frame = vec![SYNC_BYTE, 0, 0, 0, (len >> 8) as u8, len as u8, 0, 0];
        checksum::seal_header_pair(&mut frame);
        frame
    }

    fn frame_data(&self, n: usize) -> Vec<u8> {
        let mut response = vec![0u8; n.max(3)];
        response[0] = SYNC_BYTE;
        if let Some(payload) = self.frames.front() {
            let m = payload.len().min(response.len() - 3);
            response[1..1 + m].copy_from_slice(&payload[..m]);
        }
        checksum::seal_frame_payload(&mut response);
        response.truncate(n);
        response
    }
}

impl SpiTransport for SimulatedController {
    fn transceive(
        &self,
        _settings: &SpiSettings,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.stage == SimStage::Off {
            return Err(TransportError::Bus("controller not powered".into()));
        }

        rx.fill(IDLE_BYTE);
        let Some(mut response) = state.respond(tx) else {
            return Ok(());
        };

        let corrupted = state.corrupt_next > 0;
        if corrupted {
            state.corrupt_next -= 1;
            state.stats.corrupted_responses += 1;
            response[0] = !response[0];
        } else if tx.first() == Some(&FRAME_DATA_FILL) && state.frames.pop_front().is_some() {
            state.stats.frames_delivered += 1;
        }

        let n = response.len().min(rx.len());
        rx[..n].copy_from_slice(&response[..n]);
        Ok(())
    }

    fn transmit(&self, settings: &SpiSettings, tx: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let stage = state.stage;
        match stage {
            SimStage::Off => Err(TransportError::Bus("controller not powered".into())),
            SimStage::BootRom
                if tx.len() == BOOTLOADER_PACKET_SIZE && tx[0] == OPCODE_BOOTLOADER_DATA =>
            {
                let ck = checksum::upload(
                    &tx[BOOTLOADER_HEADER_LEN..BOOTLOADER_PACKET_SIZE - 2],
                    &tx[..BOOTLOADER_HEADER_LEN],
                );
                state.last_upload_checksum = Some(ck);
                state.stats.chunks_received += 1;
                Ok(())
            }
            SimStage::FirstStage if state.awaiting_image => {
                debug!(len = tx.len(), speed_hz = settings.speed_hz, "sim: main image received");
                state.last_upload_checksum = Some(checksum::upload(tx, &[]));
                state.awaiting_image = false;
                state.main_loaded = true;
                state.stats.main_images_received += 1;
                Ok(())
            }
            _ => {
                trace!(len = tx.len(), "sim: transmit ignored");
                Ok(())
            }
        }
    }

    fn delay(&self, _duration: Duration) {}
}

impl PowerControl for SimulatedController {
    fn set_power(&self, on: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if on {
            if state.stage == SimStage::Off {
                state.stage = SimStage::BootRom;
                state.last_upload_checksum = None;
                state.awaiting_image = false;
                state.main_loaded = false;
                state.last_token = None;
            }
        } else {
            state.stage = SimStage::Off;
        }
        Ok(())
    }
}
