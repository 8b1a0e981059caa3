//! Control mapping: filtered motion values to normalized control slots.
//!
//! Each of the three slots can be routed to one device address. A filtered value
//! for a routed address is normalized with `clamp((value - offset) / span, 0, 1)`
//! and forwarded to a [`ControlSink`]. One address may drive several slots.

use serde::{Deserialize, Serialize};

use crate::pipeline::{FilterOutput, FilteredValueConsumer};

/// Number of control slots.
pub const SLOT_COUNT: u8 = 3;

/// Which device drives which slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRouting {
    /// Device address driving slot 1.
    pub slot_1: Option<String>,
    /// Device address driving slot 2.
    pub slot_2: Option<String>,
    /// Device address driving slot 3.
    pub slot_3: Option<String>,
}

impl ControlRouting {
    /// Every slot has a device assigned.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slot_1.is_some() && self.slot_2.is_some() && self.slot_3.is_some()
    }

    /// Slots (1-based) routed to `address`.
    pub fn slots_for<'a>(&'a self, address: &'a str) -> impl Iterator<Item = u8> + 'a {
        [&self.slot_1, &self.slot_2, &self.slot_3]
            .into_iter()
            .zip(1..=SLOT_COUNT)
            .filter_map(move |(routed, slot)| (routed.as_deref() == Some(address)).then_some(slot))
    }

    /// Route `slot` (1-based) to `address`, or clear it with `None`.
    pub fn set(&mut self, slot: u8, address: Option<String>) -> bool {
        let target = match slot {
            1 => &mut self.slot_1,
            2 => &mut self.slot_2,
            3 => &mut self.slot_3,
            _ => return false,
        };
        *target = address;
        true
    }
}

/// Linear normalization of filtered values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlScale {
    /// Filtered value that maps to 0.0.
    pub offset: f64,
    /// Distance above `offset` that maps to 1.0.
    pub span: f64,
}

impl Default for ControlScale {
    fn default() -> Self {
        Self {
            offset: 500.0,
            span: 2500.0,
        }
    }
}

impl ControlScale {
    /// Map a filtered value into `[0, 1]`.
    #[must_use]
    pub fn normalize(&self, value: f64) -> f64 {
        ((value - self.offset) / self.span).clamp(0.0, 1.0)
    }
}

/// Output side of the control mapping.
///
/// Implementations provide [`write_control`](Self::write_control); callers go through
/// [`send_control`](Self::send_control), which enforces the value range.
pub trait ControlSink: Send + 'static {
    /// Deliver one update. `slot` is 1-based and `value` is already checked.
    fn write_control(&mut self, slot: u8, value: f64);

    /// Send `value` to `slot`.
    ///
    /// # Panics
    /// If `value` is not within `[0, 1]` (NaN included).
    fn send_control(&mut self, slot: u8, value: f64) {
        assert!(
            (0.0..=1.0).contains(&value),
            "control value {value} outside [0, 1]"
        );
        self.write_control(slot, value);
    }
}

/// Sink that writes every control update to the log.
#[derive(Debug, Default)]
pub struct LoggingControlSink;

impl ControlSink for LoggingControlSink {
    fn write_control(&mut self, slot: u8, value: f64) {
        tracing::debug!(slot, value, "Control update");
    }
}

/// Consumer of the orchestrator's fan-in stream that drives a [`ControlSink`].
pub struct ControlMapper<S> {
    routing: ControlRouting,
    scale: ControlScale,
    sink: S,
}

impl<S: ControlSink> ControlMapper<S> {
    /// Drive `sink` from the devices named in `routing`.
    pub fn new(routing: ControlRouting, scale: ControlScale, sink: S) -> Self {
        Self {
            routing,
            scale,
            sink,
        }
    }

    /// Current slot assignments.
    pub fn routing(&self) -> &ControlRouting {
        &self.routing
    }

    /// The wrapped sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: ControlSink> FilteredValueConsumer for ControlMapper<S> {
    fn on_filtered_value(&mut self, address: &str, output: FilterOutput) -> anyhow::Result<()> {
        let normalized = self.scale.normalize(output.value);
        for slot in self.routing.slots_for(address) {
            self.sink.send_control(slot, normalized);
        }
        Ok(())
    }

    fn on_device_fault(&mut self, address: &str, reason: &str) {
        let slots: Vec<u8> = self.routing.slots_for(address).collect();
        tracing::error!(address, reason, ?slots, "Control source lost");
    }
}
