//! Zephyr-Core: protocol engine for the Zephyr multitouch controller.
//!
//! This crate drives a Zephyr touch controller over a half-duplex SPI
//! link: it uploads the two firmware stages, negotiates the interface,
//! discovers the sensor geometry and decodes touch frames into events.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, checksums, frame and finger layouts
//! - **Transport**: SPI and power port abstraction (mock, simulator)
//! - **Bootloader**: Two-stage firmware upload with readback verification
//! - **Transaction**: Interface, report and frame queries with retries
//! - **Frame**: Touch frame decoder
//! - **Events**: Touch events and sinks
//! - **IRQ**: Attention-signal coalescing
//! - **Session**: Bring-up sequencer and steady-state reads
//!
//! # Example
//!
//! ```no_run
//! use zephyr_core::session::{FirmwareImages, SessionConfig, ZephyrSession};
//! use zephyr_core::{SimulatedController, TracingSink};
//!
//! let config = SessionConfig::default();
//! let images = FirmwareImages::load(&config).expect("firmware missing");
//!
//! let session = ZephyrSession::new(SimulatedController::new(), TracingSink, config);
//! session.setup(&images).expect("bring-up failed");
//! session.handle_attention();
//! ```

pub mod bootloader;
pub mod events;
pub mod frame;
pub mod irq;
pub mod protocol;
pub mod session;
pub mod transaction;
pub mod transport;

// Re-exports for convenience
pub use bootloader::{Bootloader, BootloaderError, ChunkPlan, VerifyError, chunk_plan};
pub use events::{
    Axis, AxisRange, NullSink, RecordingSink, SetupPhase, TouchEvent, TouchObservation, TouchSink,
    TracingSink,
};
pub use frame::{DecodeSummary, FrameDecoder};
pub use irq::AttentionGate;
pub use protocol::{FingerRecord, FrameError, FrameHeader};
pub use session::{
    DeviceInfo, FirmwareError, FirmwareImages, FrameOutcome, SessionConfig, SetupError,
    TunableError, ZephyrSession,
};
pub use transaction::{FrameRead, PollToken, TransactionEngine, TransactionError};
pub use transport::{
    MockTransport, PowerControl, SimulatedController, SpiSettings, SpiTransport, TransportError,
};
