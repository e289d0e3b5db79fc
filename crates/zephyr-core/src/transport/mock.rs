//! Mock SPI transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{PowerControl, SpiSettings, SpiTransport, TransportError};

/// Byte clocked in while the controller drives nothing.
pub const IDLE_BYTE: u8 = 0xFF;

/// Direction of a captured transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Transceive,
    Transmit,
}

/// A transfer captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub kind: TransferKind,
    pub settings: SpiSettings,
    pub tx: Vec<u8>,
}

/// Mock transport for unit testing protocol logic.
pub struct MockTransport {
    /// Queued responses, one per transceive.
    responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Response used once the queue is empty.
    fallback: Arc<Mutex<Option<Vec<u8>>>>,
    /// Captured transfers.
    transfers: Arc<Mutex<Vec<Transfer>>>,
    /// Recorded pacing delays (never slept).
    delays: Arc<Mutex<Vec<Duration>>>,
    /// Recorded power rail changes.
    power: Arc<Mutex<Vec<bool>>>,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(None)),
            transfers: Arc::new(Mutex::new(Vec::new())),
            delays: Arc::new(Mutex::new(Vec::new())),
            power: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue a response to be clocked in on the next transceive.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.responses.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Respond with `bytes` whenever the queue is empty.
    pub fn set_fallback(&self, bytes: &[u8]) {
        *self.fallback.lock().unwrap() = Some(bytes.to_vec());
    }

    /// Get all captured transfers.
    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers.lock().unwrap().clone()
    }

    /// Captured transceive payloads only.
    pub fn transceived(&self) -> Vec<Vec<u8>> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.kind == TransferKind::Transceive)
            .map(|t| t.tx.clone())
            .collect()
    }

    /// Clear captured transfers and delays.
    pub fn clear_transfers(&self) {
        self.transfers.lock().unwrap().clear();
        self.delays.lock().unwrap().clear();
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }

    pub fn power_log(&self) -> Vec<bool> {
        self.power.lock().unwrap().clone()
    }

    /// Number of responses still queued.
    pub fn pending_responses(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    fn record(&self, kind: TransferKind, settings: &SpiSettings, tx: &[u8]) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.transfers.lock().unwrap().push(Transfer {
            kind,
            settings: *settings,
            tx: tx.to_vec(),
        });
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiTransport for MockTransport {
    fn transceive(
        &self,
        settings: &SpiSettings,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), TransportError> {
        self.record(TransferKind::Transceive, settings, tx)?;

        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.lock().unwrap().clone())
            .unwrap_or_default();

        rx.fill(IDLE_BYTE);
        let n = response.len().min(rx.len());
        rx[..n].copy_from_slice(&response[..n]);
        Ok(())
    }

    fn transmit(&self, settings: &SpiSettings, tx: &[u8]) -> Result<(), TransportError> {
        self.record(TransferKind::Transmit, settings, tx)
    }

    fn delay(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

impl PowerControl for MockTransport {
    fn set_power(&self, on: bool) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.power.lock().unwrap().push(on);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_response_queue() {
        let mock = MockTransport::new();
        mock.queue_response(&[0xAA, 0x01]);

        let mut rx = [0u8; 4];
        mock.transceive(&SpiSettings::NORMAL, &[0xD0; 4], &mut rx)
            .unwrap();
        assert_eq!(rx, [0xAA, 0x01, IDLE_BYTE, IDLE_BYTE]);

        // Queue is empty now, the line idles
        mock.transceive(&SpiSettings::NORMAL, &[0xD0; 4], &mut rx)
            .unwrap();
        assert_eq!(rx, [IDLE_BYTE; 4]);
    }

    #[test]
    fn test_mock_fallback() {
        let mock = MockTransport::new();
        mock.set_fallback(&[0x55]);
        mock.queue_response(&[0xAA]);

        let mut rx = [0u8; 1];
        mock.transceive(&SpiSettings::NORMAL, &[0], &mut rx).unwrap();
        assert_eq!(rx[0], 0xAA);
        mock.transceive(&SpiSettings::NORMAL, &[0], &mut rx).unwrap();
        assert_eq!(rx[0], 0x55);
    }

    #[test]
    fn test_mock_transfer_capture() {
        let mock = MockTransport::new();
        mock.transmit(&SpiSettings::FAST, b"image").unwrap();
        let mut rx = [0u8; 4];
        mock.transceive(&SpiSettings::NORMAL, &[5, 0, 0, 6], &mut rx)
            .unwrap();
        mock.delay(Duration::from_millis(1));

        let transfers = mock.transfers();
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].kind, TransferKind::Transmit);
        assert_eq!(transfers[0].settings, SpiSettings::FAST);
        assert_eq!(transfers[0].tx, b"image");
        assert_eq!(mock.transceived(), vec![vec![5, 0, 0, 6]]);
        assert_eq!(mock.delays(), vec![Duration::from_millis(1)]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(mock.transmit(&SpiSettings::NORMAL, b"test").is_err());
        assert!(mock.set_power(true).is_err());

        mock.reconnect();
        assert!(mock.set_power(true).is_ok());
        assert_eq!(mock.power_log(), vec![true]);
    }
}
