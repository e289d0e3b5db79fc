//! Touch events and the sinks that consume them.
//!
//! The decoder and the setup sequencer talk to the outside world only
//! through [`TouchSink`], so a CLI, a test or an input-subsystem bridge can
//! receive touch reports without coupling to the protocol code.

use std::fmt;
use std::sync::Mutex;

/// Bring-up phases of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetupPhase {
    /// No bring-up has run, or the device was detached.
    #[default]
    Detached,
    /// Cycling the controller power rail.
    PowerCycle,
    /// Uploading the first-stage image.
    AspeedFirmware,
    /// Uploading the main firmware.
    MainFirmware,
    /// Negotiating the interface version.
    InterfaceVersion,
    /// Reading capability reports.
    Discovery,
    /// Frames may be read.
    Ready,
    /// Bring-up aborted.
    Failed,
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupPhase::Detached => write!(f, "Detached"),
            SetupPhase::PowerCycle => write!(f, "Power Cycle"),
            SetupPhase::AspeedFirmware => write!(f, "Aspeed Firmware"),
            SetupPhase::MainFirmware => write!(f, "Main Firmware"),
            SetupPhase::InterfaceVersion => write!(f, "Interface Version"),
            SetupPhase::Discovery => write!(f, "Discovery"),
            SetupPhase::Ready => write!(f, "Ready"),
            SetupPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Absolute axes registered with the sink during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Legacy single-touch X.
    X,
    /// Legacy single-touch Y.
    Y,
    TouchMajor,
    TouchMinor,
    WidthMajor,
    WidthMinor,
    Orientation,
    PositionX,
    PositionY,
    TrackingId,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::TouchMajor => "touch_major",
            Axis::TouchMinor => "touch_minor",
            Axis::WidthMajor => "width_major",
            Axis::WidthMinor => "width_minor",
            Axis::Orientation => "orientation",
            Axis::PositionX => "position_x",
            Axis::PositionY => "position_y",
            Axis::TrackingId => "tracking_id",
        };
        f.write_str(name)
    }
}

/// Inclusive range of an absolute axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisRange {
    pub axis: Axis,
    pub min: i32,
    pub max: i32,
}

impl AxisRange {
    pub fn new(axis: Axis, min: i32, max: i32) -> Self {
        Self { axis, min, max }
    }
}

/// One live contact, already transformed into the sink's coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchObservation {
    pub tracking_id: u8,
    pub x: i32,
    pub y: i32,
    pub touch_major: u16,
    pub touch_minor: u16,
    pub width_major: u16,
    pub width_minor: u16,
    pub orientation: i32,
}

/// Events emitted while decoding a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchEvent {
    /// Position report for a live contact.
    Contact(TouchObservation),
    /// Closes the report group of one finger slot.
    ContactEnd,
    /// Legacy single-touch position of the first finger.
    SingleTouch { x: i32, y: i32 },
    /// Legacy contact-active flag.
    Button { touching: bool },
    /// Closes the frame.
    Sync,
}

/// Consumer of decoded touch data.
///
/// Implement this trait in the input layer to receive touch reports.
pub trait TouchSink: Send + Sync {
    /// Called once per bring-up with the absolute axis ranges.
    fn register_axes(&self, ranges: &[AxisRange]);

    /// Called for every decoded event, in emission order.
    fn on_event(&self, event: &TouchEvent);
}

impl<S: TouchSink + ?Sized> TouchSink for std::sync::Arc<S> {
    fn register_axes(&self, ranges: &[AxisRange]) {
        (**self).register_axes(ranges)
    }

    fn on_event(&self, event: &TouchEvent) {
        (**self).on_event(event)
    }
}

/// No-op sink that discards all events.
pub struct NullSink;

impl TouchSink for NullSink {
    fn register_axes(&self, _ranges: &[AxisRange]) {}

    fn on_event(&self, _event: &TouchEvent) {}
}

/// Sink that logs events using tracing.
pub struct TracingSink;

impl TouchSink for TracingSink {
    fn register_axes(&self, ranges: &[AxisRange]) {
        for range in ranges {
            tracing::debug!(axis = %range.axis, min = range.min, max = range.max, "Axis registered");
        }
    }

    fn on_event(&self, event: &TouchEvent) {
        match event {
            TouchEvent::Contact(obs) => {
                tracing::info!(
                    id = obs.tracking_id,
                    x = obs.x,
                    y = obs.y,
                    touch_major = obs.touch_major,
                    touch_minor = obs.touch_minor,
                    orientation = obs.orientation,
                    "Contact"
                );
            }
            TouchEvent::ContactEnd => tracing::trace!("Contact end"),
            TouchEvent::SingleTouch { x, y } => {
                tracing::debug!(x = x, y = y, "Single touch");
            }
            TouchEvent::Button { touching } => {
                tracing::debug!(touching = touching, "Touch button");
            }
            TouchEvent::Sync => tracing::trace!("Sync"),
        }
    }
}

/// Sink that keeps every event and axis range it receives.
#[derive(Default)]
pub struct RecordingSink {
    axes: Mutex<Vec<AxisRange>>,
    events: Mutex<Vec<TouchEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axes(&self) -> Vec<AxisRange> {
        self.axes.lock().unwrap().clone()
    }

    pub fn axis(&self, axis: Axis) -> Option<AxisRange> {
        self.axes.lock().unwrap().iter().copied().find(|r| r.axis == axis)
    }

    pub fn events(&self) -> Vec<TouchEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Remove and return the recorded events.
    pub fn take_events(&self) -> Vec<TouchEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn contacts(&self) -> Vec<TouchObservation> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                TouchEvent::Contact(obs) => Some(*obs),
                _ => None,
            })
            .collect()
    }
}

impl TouchSink for RecordingSink {
    fn register_axes(&self, ranges: &[AxisRange]) {
        self.axes.lock().unwrap().extend_from_slice(ranges);
    }

    fn on_event(&self, event: &TouchEvent) {
        self.events.lock().unwrap().push(*event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_phase_display() {
        assert_eq!(SetupPhase::AspeedFirmware.to_string(), "Aspeed Firmware");
        assert_eq!(SetupPhase::default(), SetupPhase::Detached);
    }

    #[test]
    fn test_recording_sink() {
        let sink = Arc::new(RecordingSink::new());
        sink.register_axes(&[AxisRange::new(Axis::TrackingId, 0, 32)]);
        sink.on_event(&TouchEvent::Button { touching: true });
        sink.on_event(&TouchEvent::Sync);

        assert_eq!(sink.axis(Axis::TrackingId).map(|r| r.max), Some(32));
        assert!(sink.axis(Axis::X).is_none());
        assert_eq!(sink.take_events().len(), 2);
        assert!(sink.events().is_empty());
    }
}
