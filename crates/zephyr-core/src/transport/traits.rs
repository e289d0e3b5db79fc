//! SPI transport layer abstraction.
//!
//! Defines the `SpiTransport` and `PowerControl` traits the protocol engine
//! drives, allowing different implementations (board glue, mock, simulator).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("SPI transfer failed: {0}")]
    Bus(String),

    #[error("Power control failed: {0}")]
    Power(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Clock and delay profile for one transfer.
///
/// Delays are in the units the bus driver expects (milliseconds on the
/// reference board).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiSettings {
    pub speed_hz: u32,
    pub tx_delay: u32,
    pub rx_delay: u32,
}

impl SpiSettings {
    /// Profile used for every control exchange.
    pub const NORMAL: SpiSettings = SpiSettings {
        speed_hz: 83_000,
        tx_delay: 5,
        rx_delay: 10,
    };

    /// Profile used for the bulk main firmware transfer.
    pub const FAST: SpiSettings = SpiSettings {
        speed_hz: 4_500_000,
        tx_delay: 0,
        rx_delay: 10,
    };
}

/// Abstract synchronous SPI transport.
///
/// This trait enables:
/// - Board-specific implementations over a real SPI controller
/// - Mock implementation for unit testing
/// - A simulated controller for end-to-end runs
pub trait SpiTransport: Send + Sync {
    /// Full-duplex exchange. The bus clocks `max(tx.len(), rx.len())` bytes;
    /// missing tx bytes are sent as zero and surplus rx bytes are discarded.
    fn transceive(
        &self,
        settings: &SpiSettings,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), TransportError>;

    /// Send-only transfer.
    fn transmit(&self, settings: &SpiSettings, tx: &[u8]) -> Result<(), TransportError>;

    /// Block for a hardware pacing delay.
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Controller power rail.
pub trait PowerControl: Send + Sync {
    fn set_power(&self, on: bool) -> Result<(), TransportError>;
}

impl<T: SpiTransport + ?Sized> SpiTransport for std::sync::Arc<T> {
    fn transceive(
        &self,
        settings: &SpiSettings,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), TransportError> {
        (**self).transceive(settings, tx, rx)
    }

    fn transmit(&self, settings: &SpiSettings, tx: &[u8]) -> Result<(), TransportError> {
        (**self).transmit(settings, tx)
    }

    fn delay(&self, duration: Duration) {
        (**self).delay(duration)
    }
}

impl<T: PowerControl + ?Sized> PowerControl for std::sync::Arc<T> {
    fn set_power(&self, on: bool) -> Result<(), TransportError> {
        (**self).set_power(on)
    }
}
