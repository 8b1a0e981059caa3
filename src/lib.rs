//! # Motion DAQ Core Library
//!
//! Acquisition core for wearable motion-sensor rings. It manages one wireless link per
//! ring, decodes the ring's telemetry frames into accelerometer samples and turns each
//! ring's samples into a regular, smoothed motion-intensity signal for downstream
//! control mapping.
//!
//! ## Data flow
//!
//! ```text
//! link frames ─▶ ConnectionManager ─▶ AccelerometerSample ─▶ MotionFilter (per ring)
//!             ─▶ FilterOrchestrator (fan-in) ─▶ FilteredValueConsumer (e.g. ControlMapper)
//! ```
//!
//! ## Crate Structure
//!
//! - **`hardware`**: Wire protocol (frame decoding, command framing) and link transports:
//!   capability traits, an in-process mock and the BLE transport (feature `ble`).
//! - **`connection`**: Per-device connection manager with its reconnect loop.
//! - **`pipeline`**: Per-device filters and the orchestrator that fans their outputs in.
//! - **`registry`**: Owner of all devices; wires connection managers to filters.
//! - **`control`**: Maps filtered values onto normalized control slots.
//! - **`config`**: Layered configuration via `figment`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The crate-wide `MotionError` type.

pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod pipeline;
pub mod registry;

pub use connection::{ConnectionManager, ConnectionObserver, DeviceStatus, LinkSettings};
pub use error::{AppResult, MotionError};
pub use registry::DeviceRegistry;
