//! Link capability traits.
//!
//! The connection manager never talks to a radio stack directly. It goes through two
//! small capabilities:
//!
//! - [`LinkTransport`] establishes a link to a device address.
//! - [`Link`] is one established link: notification subscription, command writes,
//!   link-layer disconnect notification and graceful teardown.
//!
//! # Design Philosophy
//!
//! Same rules as the rest of the hardware layer:
//! - async via `#[async_trait]`
//! - `Send + Sync`
//! - `anyhow::Result` so drivers can attach context
//! - one concern per trait
//!
//! The real BLE implementation lives in `hardware::ble` (feature `ble`); the
//! in-process mock in `hardware::mock` backs tests and the `--mock` CLI mode.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::hardware::protocol::CommandPacket;

/// Raw notification payloads from the telemetry characteristic, in arrival order.
pub type FrameStream = BoxStream<'static, Vec<u8>>;

/// Capability: establishing links.
///
/// # Contract
/// - `connect` either returns a fully connected link or an error describing why not
/// - dropping the returned future abandons the attempt; implementations must not
///   leave a half-open link behind
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Connect to the device at `address`.
    async fn connect(&self, address: &str) -> Result<Box<dyn Link>>;
}

/// Capability: one live link to a device.
///
/// # Contract
/// - `subscribe` is called once, right after connecting
/// - `disconnected` resolves when the link layer reports the link is gone; it is
///   pushed by the transport, never polled against the device
/// - `disconnect` is graceful and idempotent
#[async_trait]
pub trait Link: Send + Sync {
    /// Subscribe to the telemetry notification characteristic.
    async fn subscribe(&mut self) -> Result<FrameStream>;

    /// Write a framed command to the command characteristic.
    async fn write_command(&self, packet: &CommandPacket) -> Result<()>;

    /// Resolve once the transport signals that the link dropped.
    async fn disconnected(&self);

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;
}
