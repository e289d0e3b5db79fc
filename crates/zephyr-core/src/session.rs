//! Zephyr session: bring-up orchestration and steady-state frame reads.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::bootloader::{Bootloader, BootloaderError};
use crate::events::{Axis, AxisRange, SetupPhase, TouchSink};
use crate::frame::{DecodeSummary, FrameDecoder};
use crate::irq::AttentionGate;
use crate::protocol::constants::*;
use crate::transaction::{FrameRead, InterfaceInfo, TransactionEngine, TransactionError};
use crate::transport::{PowerControl, SpiTransport, TransportError};

/// Configuration for a Zephyr session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the first-stage (A-Speed) image.
    pub aspeed_firmware_path: Option<String>,
    /// Path to the main firmware image.
    pub main_firmware_path: Option<String>,
    /// Pressure floor subtracted from force readings (0-254).
    pub min_pressure: u32,
    pub power_off_settle_ms: u64,
    pub power_on_settle_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aspeed_firmware_path: Some("zephyr_aspeed.bin".to_string()),
            main_firmware_path: Some("zephyr_main.bin".to_string()),
            min_pressure: u32::from(DEFAULT_MIN_PRESSURE),
            power_off_settle_ms: 200,
            power_on_settle_ms: 15,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("No path configured for the {0} image")]
    MissingPath(&'static str),

    #[error("Failed to read {name} image from {path}: {source}")]
    Read {
        name: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("The {0} image is empty")]
    Empty(&'static str),
}

/// The two firmware blobs needed for bring-up. Contents are opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImages {
    pub aspeed: Vec<u8>,
    pub main: Vec<u8>,
}

impl FirmwareImages {
    pub fn new(aspeed: Vec<u8>, main: Vec<u8>) -> Result<Self, FirmwareError> {
        if aspeed.is_empty() {
            return Err(FirmwareError::Empty("A-Speed"));
        }
        if main.is_empty() {
            return Err(FirmwareError::Empty("main"));
        }
        Ok(Self { aspeed, main })
    }

    /// Read both images from the paths in `config`.
    pub fn load(config: &SessionConfig) -> Result<Self, FirmwareError> {
        let aspeed = read_image("A-Speed", config.aspeed_firmware_path.as_deref())?;
        let main = read_image("main", config.main_firmware_path.as_deref())?;
        Self::new(aspeed, main)
    }
}

fn read_image(name: &'static str, path: Option<&str>) -> Result<Vec<u8>, FirmwareError> {
    let path = path.ok_or(FirmwareError::MissingPath(name))?;
    info!(path = %path, "Loading {} firmware", name);
    std::fs::read(path).map_err(|source| FirmwareError::Read {
        name,
        path: path.to_string(),
        source,
    })
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Power sequencing failed")]
    Power(#[source] TransportError),

    #[error("A-Speed firmware load failed")]
    AspeedFirmware(#[source] BootloaderError),

    #[error("Main firmware load failed")]
    MainFirmware(#[source] BootloaderError),

    #[error("Interface version query failed")]
    InterfaceVersion(#[source] TransactionError),

    #[error("Failed to read report 0x{id:02X}")]
    Report {
        id: u8,
        #[source]
        source: TransactionError,
    },

    #[error("Report 0x{id:02X} too short: expected {expected} bytes, got {actual}")]
    ReportTooShort {
        id: u8,
        expected: usize,
        actual: usize,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunableError {
    #[error("Pressure floor {0} out of range (0-254)")]
    OutOfRange(u32),
}

/// Geometry and capabilities discovered during bring-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub interface: InterfaceInfo,
    pub family_id: u8,
    pub endianness: u8,
    pub sensor_rows: u8,
    pub sensor_columns: u8,
    /// BCD firmware version.
    pub bcd_version: u16,
    pub sensor_width: i32,
    pub sensor_height: i32,
    pub region_descriptor: Vec<u8>,
    pub region_param: Vec<u8>,
}

impl DeviceInfo {
    /// Axis ranges announced to the touch sink.
    pub fn axis_ranges(&self) -> Vec<AxisRange> {
        let w = self.sensor_width;
        let h = self.sensor_height;
        let extent = w.max(h);
        vec![
            AxisRange::new(Axis::X, 0, w),
            AxisRange::new(Axis::Y, 0, h),
            AxisRange::new(Axis::TouchMajor, 0, extent),
            AxisRange::new(Axis::TouchMinor, 0, extent),
            AxisRange::new(Axis::WidthMajor, 0, extent),
            AxisRange::new(Axis::WidthMinor, 0, extent),
            AxisRange::new(Axis::Orientation, -MAX_FINGER_ORIENTATION, MAX_FINGER_ORIENTATION),
            AxisRange::new(Axis::PositionX, 0, w),
            AxisRange::new(Axis::PositionY, 0, h),
            AxisRange::new(Axis::TrackingId, 0, MAX_TRACKING_ID),
        ]
    }
}

/// Convert a raw sensor-dimension field to surface units.
///
/// `(origin - raw) * 84 / 73`; a raw value past the origin yields 0.
pub fn scale_dimension(raw: u32, origin: i64) -> i32 {
    let scaled = (origin - i64::from(raw)) * SENSOR_SCALE_NUM / SENSOR_SCALE_DEN;
    if scaled < 0 {
        warn!(raw, origin, "Sensor dimension past origin, clamping to 0");
        return 0;
    }
    i32::try_from(scaled).unwrap_or(i32::MAX)
}

/// Result of one steady-state frame read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Bring-up has not completed.
    NotReady,
    /// The device had no frame.
    Empty,
    Decoded(DecodeSummary),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Zephyr session - owns the transport for one controller.
pub struct ZephyrSession<T, S>
where
    T: SpiTransport + PowerControl,
    S: TouchSink,
{
    transport: T,
    sink: S,
    config: SessionConfig,
    min_pressure: AtomicU8,
    phase: Mutex<SetupPhase>,
    /// Present only while the device is up; dropping it releases the packet templates.
    engine: Mutex<Option<TransactionEngine>>,
    info: Mutex<Option<DeviceInfo>>,
    gate: AttentionGate,
    /// Held for a whole bring-up and for each frame read.
    bus: Mutex<()>,
}

impl<T, S> ZephyrSession<T, S>
where
    T: SpiTransport + PowerControl,
    S: TouchSink,
{
    pub fn new(transport: T, sink: S, config: SessionConfig) -> Self {
        let session = Self {
            transport,
            sink,
            min_pressure: AtomicU8::new(DEFAULT_MIN_PRESSURE),
            config,
            phase: Mutex::new(SetupPhase::Detached),
            engine: Mutex::new(None),
            info: Mutex::new(None),
            gate: AttentionGate::new(),
            bus: Mutex::new(()),
        };
        if let Err(e) = session.set_min_pressure(session.config.min_pressure) {
            warn!(error = %e, "Ignoring configured pressure floor");
        }
        session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn setup_phase(&self) -> SetupPhase {
        *lock(&self.phase)
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    /// Snapshot of the discovered device, if bring-up completed.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        lock(&self.info).clone()
    }

    pub fn min_pressure(&self) -> u8 {
        self.min_pressure.load(Ordering::Relaxed)
    }

    /// Change the pressure floor. Values of 255 and above are rejected.
    pub fn set_min_pressure(&self, value: u32) -> Result<(), TunableError> {
        let floor = u8::try_from(value)
            .ok()
            .filter(|&v| v < u8::MAX)
            .ok_or(TunableError::OutOfRange(value))?;
        self.min_pressure.store(floor, Ordering::Relaxed);
        debug!(min_pressure = floor, "Pressure floor updated");
        Ok(())
    }

    /// Bring the controller up and perform the first frame read.
    ///
    /// Any failure tears the session down; the caller may retry with fresh
    /// images. A read already in flight finishes before the power cycle
    /// starts.
    #[instrument(skip_all)]
    pub fn setup(&self, images: &FirmwareImages) -> Result<DeviceInfo, SetupError> {
        self.gate.set_ready(false);

        let info = {
            let _bus = lock(&self.bus);
            self.teardown();
            match self.bring_up(images) {
                Ok(info) => info,
                Err(e) => {
                    error!(error = %e, "Bring-up failed");
                    self.teardown();
                    self.set_phase(SetupPhase::Failed);
                    return Err(e);
                }
            }
        };

        self.set_phase(SetupPhase::Ready);
        self.gate.set_ready(true);
        self.handle_attention();
        Ok(info)
    }

    fn bring_up(&self, images: &FirmwareImages) -> Result<DeviceInfo, SetupError> {
        self.set_phase(SetupPhase::PowerCycle);
        self.power_cycle().map_err(SetupError::Power)?;

        let loader = Bootloader::new(&self.transport);

        self.set_phase(SetupPhase::AspeedFirmware);
        loader
            .load_first_stage(&images.aspeed)
            .map_err(SetupError::AspeedFirmware)?;
        self.transport.delay(STAGE_SETTLE_DELAY);

        self.set_phase(SetupPhase::MainFirmware);
        loader
            .load_main_firmware(&images.main)
            .map_err(SetupError::MainFirmware)?;
        self.transport.delay(STAGE_SETTLE_DELAY);

        self.set_phase(SetupPhase::InterfaceVersion);
        let mut engine = TransactionEngine::new();
        let interface = engine
            .query_interface(&self.transport)
            .map_err(SetupError::InterfaceVersion)?;

        self.set_phase(SetupPhase::Discovery);
        let info = self.discover(&mut engine, interface)?;

        self.sink.register_axes(&info.axis_ranges());

        *lock(&self.engine) = Some(engine);
        *lock(&self.info) = Some(info.clone());
        Ok(info)
    }

    fn power_cycle(&self) -> Result<(), TransportError> {
        info!("Powering on");
        self.transport.set_power(false)?;
        self.transport
            .delay(Duration::from_millis(self.config.power_off_settle_ms));
        self.transport.set_power(true)?;
        self.transport
            .delay(Duration::from_millis(self.config.power_on_settle_ms));
        Ok(())
    }

    fn discover(
        &self,
        engine: &mut TransactionEngine,
        interface: InterfaceInfo,
    ) -> Result<DeviceInfo, SetupError> {
        let family = self.fetch_report(engine, REPORT_FAMILY_ID, 1)?;
        let sensor = self.fetch_report(engine, REPORT_SENSOR_INFO, 5)?;
        let region_descriptor = self.fetch_report(engine, REPORT_SENSOR_REGION_DESC, 0)?;
        let region_param = self.fetch_report(engine, REPORT_SENSOR_REGION_PARAM, 0)?;
        let dims = self.fetch_report(engine, REPORT_SENSOR_DIM, 8)?;

        let info = DeviceInfo {
            interface,
            family_id: family[0],
            endianness: sensor[0],
            sensor_rows: sensor[1],
            sensor_columns: sensor[2],
            bcd_version: u16::from_be_bytes([sensor[3], sensor[4]]),
            sensor_width: scale_dimension(LittleEndian::read_u32(&dims[0..4]), SENSOR_WIDTH_ORIGIN),
            sensor_height: scale_dimension(LittleEndian::read_u32(&dims[4..8]), SENSOR_HEIGHT_ORIGIN),
            region_descriptor,
            region_param,
        };

        info!(
            family_id = %format!("0x{:02X}", info.family_id),
            rows = info.sensor_rows,
            columns = info.sensor_columns,
            width = info.sensor_width,
            height = info.sensor_height,
            version = %format!("0x{:04X}", info.bcd_version),
            endianness = info.endianness,
            "Sensor discovered"
        );
        debug!(
            region_descriptor = hex::encode(&info.region_descriptor),
            region_param = hex::encode(&info.region_param),
            "Sensor regions"
        );
        Ok(info)
    }

    fn fetch_report(
        &self,
        engine: &mut TransactionEngine,
        id: u8,
        min_len: usize,
    ) -> Result<Vec<u8>, SetupError> {
        let data = engine
            .report(&self.transport, id)
            .map_err(|source| SetupError::Report { id, source })?;
        if data.len() < min_len {
            return Err(SetupError::ReportTooShort {
                id,
                expected: min_len,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Handle a device attention signal.
    ///
    /// Returns the number of frame reads this call performed; triggers that
    /// arrive before bring-up completes, or while another thread is reading,
    /// return 0.
    pub fn handle_attention(&self) -> usize {
        self.gate.trigger(|| {
            if let Err(e) = self.read_frame() {
                warn!(error = %e, "No frame this cycle");
            }
        })
    }

    /// Read and decode one frame.
    pub fn read_frame(&self) -> Result<FrameOutcome, TransactionError> {
        let _bus = lock(&self.bus);
        let mut engine = lock(&self.engine);
        let Some(engine) = engine.as_mut() else {
            return Ok(FrameOutcome::NotReady);
        };
        let Some(height) = lock(&self.info).as_ref().map(|i| i.sensor_height) else {
            return Ok(FrameOutcome::NotReady);
        };

        match engine.read_frame(&self.transport)? {
            FrameRead::Empty => Ok(FrameOutcome::Empty),
            FrameRead::Data(payload) => {
                let decoder = FrameDecoder::new(height).with_min_pressure(self.min_pressure());
                Ok(FrameOutcome::Decoded(decoder.decode(&payload, &self.sink)))
            }
        }
    }

    /// Stop frame reads and release everything bring-up allocated.
    pub fn detach(&self) {
        self.gate.set_ready(false);
        self.teardown();
        self.set_phase(SetupPhase::Detached);
    }

    fn teardown(&self) {
        *lock(&self.engine) = None;
        *lock(&self.info) = None;
    }

    fn set_phase(&self, to: SetupPhase) {
        let mut phase = lock(&self.phase);
        let from = *phase;
        if from != to {
            info!(from = %from, to = %to, "Setup phase changed");
            *phase = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::{chunk_plan, main_image_checksum};
    use crate::events::{RecordingSink, TouchEvent};
    use crate::protocol::checksum;
    use crate::protocol::{FingerRecord, FrameHeader};
    use crate::transaction::PollToken;
    use crate::transport::{MockTransport, SimStage, SimulatedController};
    use std::sync::Arc;

    fn images() -> FirmwareImages {
        let aspeed: Vec<u8> = (0..2100u32).map(|i| (i * 7) as u8).collect();
        let main: Vec<u8> = (0..5000u32).map(|i| (i * 13) as u8).collect();
        FirmwareImages::new(aspeed, main).unwrap()
    }

    fn session() -> ZephyrSession<Arc<SimulatedController>, Arc<RecordingSink>> {
        ZephyrSession::new(
            Arc::new(SimulatedController::new()),
            Arc::new(RecordingSink::new()),
            SessionConfig::default(),
        )
    }

    fn touch(id: u8, force_minor: u16) -> FingerRecord {
        FingerRecord {
            id,
            x: 1000,
            y: 1500,
            size_major: 20,
            size_minor: 10,
            orientation: 384,
            force_major: 300,
            force_minor,
            ..Default::default()
        }
    }

    #[test]
    fn test_geometry_formula() {
        assert_eq!(scale_dimension(9000, SENSOR_WIDTH_ORIGIN), 0);
        assert_eq!(scale_dimension(13850, SENSOR_HEIGHT_ORIGIN), 0);
        assert_eq!(scale_dimension(0, SENSOR_WIDTH_ORIGIN), 10356);
        assert_eq!(scale_dimension(9500, SENSOR_WIDTH_ORIGIN), 0);
        assert_eq!(
            scale_dimension(SimulatedController::DEFAULT_RAW_WIDTH, SENSOR_WIDTH_ORIGIN),
            4200
        );
    }

    #[test]
    fn test_setup_against_simulator() {
        let session = session();
        let info = session.setup(&images()).unwrap();

        assert_eq!(session.setup_phase(), SetupPhase::Ready);
        assert!(session.is_ready());
        assert_eq!(session.transport().stage(), SimStage::Running);
        assert_eq!(session.transport().stats().chunks_received, 3);

        assert_eq!(info.family_id, 0x5A);
        assert_eq!((info.sensor_rows, info.sensor_columns), (15, 10));
        assert_eq!(info.bcd_version, 0x0231);
        assert_eq!(info.endianness, 1);
        assert_eq!((info.sensor_width, info.sensor_height), (4200, 6300));
        assert_eq!(info.region_descriptor, vec![0x01, 0x00, 0x0F, 0x0A]);
        assert_eq!(info.region_param, vec![0x10, 0x20, 0x30]);
        assert_eq!(session.device_info(), Some(info));

        let sink = session.sink();
        assert_eq!(sink.axes().len(), 10);
        assert_eq!(sink.axis(Axis::PositionY).map(|r| r.max), Some(6300));
        assert_eq!(sink.axis(Axis::TouchMajor).map(|r| r.max), Some(6300));
        assert_eq!(
            sink.axis(Axis::Orientation).map(|r| (r.min, r.max)),
            Some((-16384, 16384))
        );
        assert_eq!(sink.axis(Axis::TrackingId).map(|r| r.max), Some(32));

        // The initial read found no frame
        assert!(sink.events().is_empty());
        assert_eq!(session.transport().last_token(), Some(POLL_TOKEN_A));
    }

    #[test]
    fn test_frames_after_setup() {
        let session = session();
        session.setup(&images()).unwrap();
        let sim = session.transport();

        sim.queue_touch_frame(1, 100, &[touch(4, 150)]);
        assert_eq!(session.handle_attention(), 1);

        let contacts = session.sink().contacts();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].touch_minor, 50);
        assert_eq!(contacts[0].touch_major, 200);
        assert_eq!(contacts[0].y, 6300 - 1500);
        assert_eq!(contacts[0].orientation, 16000);
        assert_eq!(sim.stats().frames_delivered, 1);

        session.sink().take_events();
        sim.queue_touch_frame(2, 200, &[touch(4, 150)]);
        sim.corrupt_next(2);
        assert!(matches!(session.read_frame(), Ok(FrameOutcome::Decoded(_))));
        assert_eq!(sim.last_token(), Some(POLL_TOKEN_B));
        assert_eq!(session.sink().contacts().len(), 1);

        assert_eq!(session.read_frame().unwrap(), FrameOutcome::Empty);
        assert_eq!(sim.last_token(), Some(POLL_TOKEN_A));
    }

    #[test]
    fn test_pressure_floor_tunable() {
        let session = session();
        assert_eq!(session.min_pressure(), 100);
        assert_eq!(session.set_min_pressure(255), Err(TunableError::OutOfRange(255)));
        assert_eq!(session.set_min_pressure(1000), Err(TunableError::OutOfRange(1000)));
        assert_eq!(session.min_pressure(), 100);
        session.set_min_pressure(254).unwrap();
        assert_eq!(session.min_pressure(), 254);

        let config = SessionConfig {
            min_pressure: 300,
            ..Default::default()
        };
        let session = ZephyrSession::new(MockTransport::new(), RecordingSink::new(), config);
        assert_eq!(session.min_pressure(), 100);
    }

    #[test]
    fn test_attention_before_setup_is_dropped() {
        let session = session();
        session.transport().queue_touch_frame(1, 0, &[touch(1, 150)]);
        assert_eq!(session.handle_attention(), 0);
        assert_eq!(session.read_frame().unwrap(), FrameOutcome::NotReady);
        assert_eq!(session.transport().pending_frames(), 1);
    }

    #[test]
    fn test_report_failure_tears_down() {
        let session = session();
        session.transport().set_report_error(REPORT_SENSOR_DIM, 2);

        let err = session.setup(&images()).unwrap_err();
        assert!(matches!(err, SetupError::Report { id: REPORT_SENSOR_DIM, .. }));
        assert_eq!(session.setup_phase(), SetupPhase::Failed);
        assert!(!session.is_ready());
        assert!(session.device_info().is_none());
        assert!(session.sink().axes().is_empty());
        assert_eq!(session.read_frame().unwrap(), FrameOutcome::NotReady);
    }

    #[test]
    fn test_short_report_is_fatal() {
        let session = session();
        session.transport().set_report(REPORT_SENSOR_INFO, &[1, 2]);
        assert!(matches!(
            session.setup(&images()),
            Err(SetupError::ReportTooShort { id: REPORT_SENSOR_INFO, expected: 5, actual: 2 })
        ));
    }

    #[test]
    fn test_first_stage_failure_aborts() {
        let mock = MockTransport::new();
        mock.set_fallback(&[0xAA; 4]);
        let session = ZephyrSession::new(mock, RecordingSink::new(), SessionConfig::default());

        let err = session.setup(&images()).unwrap_err();
        assert!(matches!(err, SetupError::AspeedFirmware(_)));
        assert_eq!(session.setup_phase(), SetupPhase::Failed);

        let transport = session.transport();
        assert_eq!(transport.power_log(), vec![false, true]);
        assert_eq!(transport.delays()[..2], [Duration::from_millis(200), Duration::from_millis(15)]);
        // Five verify attempts for the first chunk, nothing after it
        assert_eq!(transport.transceived().len(), 5);
    }

    #[test]
    fn test_interface_failure_is_fatal() {
        // Both uploads verify, then the probe only ever sees idle bytes
        let images = images();
        let mock = MockTransport::new();
        for plan in chunk_plan(&images.aspeed) {
            mock.queue_response(&[0xD0, 0x00, (plan.checksum >> 8) as u8, plan.checksum as u8]);
        }
        mock.queue_response(&[0xFF; 4]); // execute
        mock.queue_response(&[0xFF; 4]); // blank data
        let main_ck = main_image_checksum(&images.main);
        mock.queue_response(&[0xD0, 0x00, (main_ck >> 8) as u8, main_ck as u8]);

        let session = ZephyrSession::new(mock, RecordingSink::new(), SessionConfig::default());
        let err = session.setup(&images).unwrap_err();
        assert!(matches!(err, SetupError::InterfaceVersion(_)));
        assert_eq!(session.setup_phase(), SetupPhase::Failed);

        let probes = session
            .transport()
            .transceived()
            .into_iter()
            .filter(|tx| tx == &CMD_INTERFACE_PROBE)
            .count();
        assert_eq!(probes, 4);
    }

    #[test]
    fn test_detach_releases_state() {
        let session = session();
        session.setup(&images()).unwrap();
        session.detach();

        assert_eq!(session.setup_phase(), SetupPhase::Detached);
        assert!(session.device_info().is_none());
        session.transport().queue_touch_frame(1, 0, &[touch(1, 150)]);
        assert_eq!(session.handle_attention(), 0);

        // A fresh bring-up starts again from poll token A
        session.setup(&images()).unwrap();
        assert_eq!(session.sink().contacts().len(), 1);
        assert_eq!(session.transport().last_token(), Some(POLL_TOKEN_A));
    }

    /// Simulator behind a slow bus that counts transfers started while
    /// another one is still on the wire.
    struct SlowBus {
        inner: Arc<SimulatedController>,
        busy: std::sync::atomic::AtomicBool,
        overlaps: std::sync::atomic::AtomicUsize,
    }

    impl SlowBus {
        fn access<R>(&self, f: impl FnOnce() -> R) -> R {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(1));
            let r = f();
            self.busy.store(false, Ordering::SeqCst);
            r
        }
    }

    impl SpiTransport for SlowBus {
        fn transceive(
            &self,
            settings: &crate::transport::SpiSettings,
            tx: &[u8],
            rx: &mut [u8],
        ) -> Result<(), TransportError> {
            self.access(|| self.inner.transceive(settings, tx, rx))
        }

        fn transmit(
            &self,
            settings: &crate::transport::SpiSettings,
            tx: &[u8],
        ) -> Result<(), TransportError> {
            self.access(|| self.inner.transmit(settings, tx))
        }

        fn delay(&self, duration: Duration) {
            self.inner.delay(duration)
        }
    }

    impl PowerControl for SlowBus {
        fn set_power(&self, on: bool) -> Result<(), TransportError> {
            self.access(|| self.inner.set_power(on))
        }
    }

    #[test]
    fn test_resetup_waits_for_inflight_reads() {
        let sim = Arc::new(SimulatedController::new());
        let bus = Arc::new(SlowBus {
            inner: Arc::clone(&sim),
            busy: Default::default(),
            overlaps: Default::default(),
        });
        let session = Arc::new(ZephyrSession::new(
            Arc::clone(&bus),
            Arc::new(RecordingSink::new()),
            SessionConfig::default(),
        ));
        let images = images();
        session.setup(&images).unwrap();

        for n in 0..6 {
            sim.queue_touch_frame(n, u32::from(n) * 100, &[touch(1, 150)]);
        }
        let spawn_trigger = || {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.handle_attention())
        };
        let mut handles = vec![spawn_trigger()];
        std::thread::sleep(Duration::from_millis(3));
        handles.extend((0..5).map(|_| spawn_trigger()));

        session.setup(&images).unwrap();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(bus.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(session.setup_phase(), SetupPhase::Ready);
        assert!(session.is_ready());
        assert!(session.device_info().is_some());
    }

    /// Length response then a one-finger frame with the record at offset 12.
    #[test]
    fn test_end_to_end_single_finger_frame() {
        let mut finger = FingerRecord {
            id: 1,
            y: 500,
            size_minor: 8,
            force_minor: 150,
            ..Default::default()
        };
        finger.x = i16::from_le_bytes([1, 28]);
        let header = FrameHeader {
            frame_type: 0x44,
            header_len: 12,
            num_fingers: 1,
            finger_data_len: 28,
            ..Default::default()
        };
        let mut payload = header.to_bytes()[..12].to_vec();
        payload.extend_from_slice(&finger.to_bytes());
        let len = payload.len() + 2;

        let mock = MockTransport::new();
        let mut length = vec![0xAA, 0, 0, 0, 0, len as u8, 0, 0];
        checksum::seal_header_pair(&mut length);
        mock.queue_response(&length);
        let mut data = vec![0xAA];
        data.extend_from_slice(&payload);
        data.extend_from_slice(&[0, 0]);
        checksum::seal_frame_payload(&mut data);
        mock.queue_response(&data);

        let mut engine = TransactionEngine::new();
        let FrameRead::Data(read) = engine.read_frame(&mock).unwrap() else {
            panic!("expected frame data");
        };
        assert_eq!(read, payload);
        assert_eq!(engine.poll_token(), PollToken::B);

        let sink = RecordingSink::new();
        FrameDecoder::new(6300).with_min_pressure(100).decode(&read, &sink);
        let events = sink.events();

        let contacts = sink.contacts();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].touch_minor, 50);
        assert_eq!(contacts[0].touch_major, 0);
        assert_eq!(events.iter().filter(|e| **e == TouchEvent::ContactEnd).count(), 1);
        assert_eq!(events.iter().filter(|e| **e == TouchEvent::Button { touching: true }).count(), 1);
        assert_eq!(events.iter().filter(|e| **e == TouchEvent::Sync).count(), 1);
        assert_eq!(events.last(), Some(&TouchEvent::Sync));
    }

    #[test]
    fn test_firmware_images() {
        assert!(matches!(
            FirmwareImages::new(Vec::new(), vec![1]),
            Err(FirmwareError::Empty(_))
        ));

        let config = SessionConfig {
            aspeed_firmware_path: None,
            ..Default::default()
        };
        assert!(matches!(
            FirmwareImages::load(&config),
            Err(FirmwareError::MissingPath(_))
        ));

        let dir = std::env::temp_dir().join(format!("zephyr-fw-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let aspeed = dir.join("aspeed.bin");
        let main = dir.join("main.bin");
        std::fs::write(&aspeed, [1, 2, 3]).unwrap();
        std::fs::write(&main, [4, 5]).unwrap();

        let config = SessionConfig {
            aspeed_firmware_path: Some(aspeed.display().to_string()),
            main_firmware_path: Some(main.display().to_string()),
            ..Default::default()
        };
        let images = FirmwareImages::load(&config).unwrap();
        assert_eq!(images.aspeed, vec![1, 2, 3]);
        assert_eq!(images.main, vec![4, 5]);

        std::fs::remove_file(&main).unwrap();
        assert!(matches!(
            FirmwareImages::load(&config),
            Err(FirmwareError::Read { name: "main", .. })
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_config_roundtrip() {
        let path = std::env::temp_dir().join(format!("zephyr-config-{}.toml", std::process::id()));
        let config = SessionConfig {
            min_pressure: 80,
            power_off_settle_ms: 250,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);

        std::fs::write(&path, "min_pressure = 42\n").unwrap();
        let partial = SessionConfig::load_from_file(&path).unwrap();
        assert_eq!(partial.min_pressure, 42);
        assert_eq!(partial.power_on_settle_ms, 15);
        assert_eq!(partial.main_firmware_path.as_deref(), Some("zephyr_main.bin"));
        std::fs::remove_file(&path).unwrap();
    }
}
