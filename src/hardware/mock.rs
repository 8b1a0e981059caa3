//! Mock Link Transport
//!
//! Provides a simulated radio for testing without physical rings.
//! All timing uses `tokio::time`, so tests running with a paused clock stay
//! deterministic.
//!
//! # What can be simulated
//!
//! - Scripted connect failures (`fail_next_connects`) and unavailable devices
//! - Connect latency (`with_connect_delay`)
//! - Link-layer drops (`drop_link`)
//! - Telemetry frames pushed into the notification stream (`send_frame`)
//! - Continuous synthetic motion while streaming is enabled (`spawn_motion_simulator`)
//!
//! Every command written by the connection manager is recorded per device and can be
//! inspected with `written_commands`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::hardware::link::{FrameStream, Link, LinkTransport};
use crate::hardware::protocol::{encode_accelerometer_frame, CommandPacket, DeviceCommand};

struct MockSession {
    id: u64,
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    dropped_tx: watch::Sender<bool>,
}

struct MockDevice {
    available: bool,
    scripted_failures: VecDeque<String>,
    connect_attempts: usize,
    graceful_disconnects: usize,
    written: Vec<CommandPacket>,
    streaming: bool,
    session: Option<MockSession>,
}

impl MockDevice {
    fn new() -> Self {
        Self {
            available: true,
            scripted_failures: VecDeque::new(),
            connect_attempts: 0,
            graceful_disconnects: 0,
            written: Vec::new(),
            streaming: false,
            session: None,
        }
    }

    fn end_session(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                session.dropped_tx.send_replace(true);
                self.streaming = false;
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct MockState {
    devices: HashMap<String, MockDevice>,
    next_session_id: u64,
}

impl MockState {
    fn device(&mut self, address: &str) -> &mut MockDevice {
        self.devices
            .entry(address.to_string())
            .or_insert_with(MockDevice::new)
    }
}

/// In-process transport. Cloning shares the same simulated radio.
///
/// Every address is reachable unless told otherwise.
///
/// # Example
///
/// ```rust,ignore
/// let transport = MockTransport::new();
/// transport.fail_next_connects("AA:BB", 2, "Device with address AA:BB was not found").await;
/// let link = transport.connect("AA:BB").await; // fails
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    connect_delay: Duration,
}

impl MockTransport {
    /// Create a mock radio where every device connects immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate connection latency.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make the next `count` connection attempts to `address` fail with `message`.
    pub async fn fail_next_connects(&self, address: &str, count: usize, message: &str) {
        let mut state = self.state.lock().await;
        let device = state.device(address);
        for _ in 0..count {
            device.scripted_failures.push_back(message.to_string());
        }
    }

    /// Mark a device as in range (or not).
    pub async fn set_available(&self, address: &str, available: bool) {
        self.state.lock().await.device(address).available = available;
    }

    /// Simulate a link-layer disconnect. Returns `false` if no link was up.
    pub async fn drop_link(&self, address: &str) -> bool {
        let dropped = self.state.lock().await.device(address).end_session();
        if dropped {
            tracing::debug!(address, "MockTransport: link dropped");
        }
        dropped
    }

    /// Push one notification frame. Returns `true` if a live link accepted it.
    pub async fn send_frame(&self, address: &str, frame: &[u8]) -> bool {
        let mut state = self.state.lock().await;
        state
            .device(address)
            .session
            .as_ref()
            .is_some_and(|session| session.frame_tx.send(frame.to_vec()).is_ok())
    }

    /// Commands written to `address`, oldest first.
    pub async fn written_commands(&self, address: &str) -> Vec<CommandPacket> {
        self.state.lock().await.device(address).written.clone()
    }

    /// Number of connection attempts made to `address`.
    pub async fn connect_attempts(&self, address: &str) -> usize {
        self.state.lock().await.device(address).connect_attempts
    }

    /// Number of graceful `disconnect()` calls that closed a live link.
    pub async fn graceful_disconnects(&self, address: &str) -> usize {
        self.state.lock().await.device(address).graceful_disconnects
    }

    /// Whether a link to `address` is currently up.
    pub async fn is_connected(&self, address: &str) -> bool {
        self.state.lock().await.device(address).session.is_some()
    }

    /// Whether the device has been told to stream raw sensor data.
    pub async fn is_streaming(&self, address: &str) -> bool {
        self.state.lock().await.device(address).streaming
    }

    /// Wait until a link to `address` is up.
    pub async fn wait_for_connection(&self, address: &str) {
        while !self.is_connected(address).await {
            sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stream synthetic accelerometer frames to `address` every `period` while
    /// streaming is enabled. Stops when `stop` is cancelled.
    pub fn spawn_motion_simulator(
        &self,
        address: &str,
        period: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let transport = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if !transport.is_streaming(&address).await {
                            continue;
                        }
                        let frame = {
                            // resting ring: ~1 g on one axis (512 counts) plus motion noise
                            let mut rng = rand::thread_rng();
                            encode_accelerometer_frame(
                                rng.gen_range(-400..400),
                                rng.gen_range(-400..400),
                                512 + rng.gen_range(-600..600),
                            )
                        };
                        transport.send_frame(&address, &frame).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl LinkTransport for MockTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn Link>> {
        if !self.connect_delay.is_zero() {
            sleep(self.connect_delay).await;
        }

        let mut state = self.state.lock().await;
        state.next_session_id += 1;
        let session_id = state.next_session_id;
        let device = state.device(address);
        device.connect_attempts += 1;

        if let Some(message) = device.scripted_failures.pop_front() {
            bail!(message);
        }
        if !device.available {
            bail!("Device with address {address} was not found");
        }
        if device.session.is_some() {
            bail!("Device {address} already has an open link");
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = watch::channel(false);
        device.session = Some(MockSession {
            id: session_id,
            frame_tx,
            dropped_tx,
        });
        device.streaming = false;
        tracing::debug!(address, session_id, "MockTransport: connected");

        Ok(Box::new(MockLink {
            address: address.to_string(),
            session_id,
            state: Arc::clone(&self.state),
            frame_rx: Some(frame_rx),
            dropped_rx,
        }))
    }
}

/// A link handed out by [`MockTransport`].
pub struct MockLink {
    address: String,
    session_id: u64,
    state: Arc<Mutex<MockState>>,
    frame_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    dropped_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&mut self) -> Result<FrameStream> {
        let rx = self
            .frame_rx
            .take()
            .ok_or_else(|| anyhow!("Notifications already subscribed on {}", self.address))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn write_command(&self, packet: &CommandPacket) -> Result<()> {
        let mut state = self.state.lock().await;
        let device = state.device(&self.address);
        if device.session.as_ref().map(|s| s.id) != Some(self.session_id) {
            bail!("Link to {} is closed", self.address);
        }

        device.written.push(*packet);
        if *packet == DeviceCommand::EnableStreaming.packet() {
            device.streaming = true;
        } else if *packet == DeviceCommand::DisableStreaming.packet() {
            device.streaming = false;
        }
        Ok(())
    }

    async fn disconnected(&self) {
        let mut rx = self.dropped_rx.clone();
        // a dropped sender means the session is gone as well
        let _ = rx.wait_for(|dropped| *dropped).await;
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let device = state.device(&self.address);
        if device.session.as_ref().map(|s| s.id) == Some(self.session_id) {
            device.end_session();
            device.graceful_disconnects += 1;
            tracing::debug!(address = %self.address, "MockTransport: disconnected");
        }
        Ok(())
    }
}
