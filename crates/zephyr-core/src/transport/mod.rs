//! Transport layer module.

pub mod mock;
pub mod sim;
pub mod traits;

pub use mock::{IDLE_BYTE, MockTransport, Transfer, TransferKind};
pub use sim::{SimStage, SimStats, SimulatedController};
pub use traits::{PowerControl, SpiSettings, SpiTransport, TransportError};
