//! Hardware layer: ring wire protocol and link transports.

pub mod link;
pub mod mock;
pub mod protocol;

#[cfg(feature = "ble")]
pub mod ble;

pub use link::{FrameStream, Link, LinkTransport};
pub use mock::MockTransport;
pub use protocol::{AccelerometerSample, CommandPacket, DeviceCommand};
