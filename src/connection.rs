//! Per-device connection manager.
//!
//! One [`ConnectionManager`] owns the link to one ring and runs its lifecycle in a
//! dedicated task:
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──ok──▶ Connected ──link dropped──▶ Disconnected
//!      ▲                      │                                              │
//!      └──── connect failed ──┘                                              │
//!      └───────────────────────── backoff, retry ◀───────────────────────────┘
//! ```
//!
//! Retries never give up; only [`ConnectionManager::close`] ends the loop. The stop
//! token is checked at every suspension point (connect, subscribe, pump, backoff).
//!
//! Observer callbacks run synchronously on the manager's task, so a blocking observer
//! stalls reconnection for that device.

use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AppResult, MotionError};
use crate::hardware::link::{FrameStream, Link, LinkTransport};
use crate::hardware::protocol::{decode_frame, AccelerometerSample, DeviceCommand};

const COMMAND_QUEUE_DEPTH: usize = 8;

/// Connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    /// No link; the manager is backing off, stopped or not yet started
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Link up and subscribed to telemetry
    Connected,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Lifecycle events of a device link.
///
/// One observer may serve many devices; every call carries the device address.
pub trait ConnectionObserver: Send + Sync {
    /// A connect attempt is starting.
    fn on_connecting(&self, address: &str);
    /// The link is up and telemetry is subscribed.
    fn on_connect(&self, address: &str);
    /// An established link went away, or was closed.
    fn on_disconnect(&self, address: &str);
    /// The connection attempt itself failed; `message` is human readable.
    fn on_connect_fail(&self, address: &str, message: &str);
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_connecting(&self, address: &str) {
        tracing::info!(address, "Connecting");
    }

    fn on_connect(&self, address: &str) {
        tracing::info!(address, "Connected");
    }

    fn on_disconnect(&self, address: &str) {
        tracing::info!(address, "Disconnected");
    }

    fn on_connect_fail(&self, address: &str, message: &str) {
        tracing::warn!(address, message, "Connection failed");
    }
}

/// Destination for decoded samples. Must not block.
pub trait SampleSink: Send + Sync {
    /// Called on the manager's task for every decoded sample.
    fn on_sample(&self, sample: AccelerometerSample);
}

/// Timing of the link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Wait between a disconnect (or failed attempt) and the next attempt.
    pub reconnect_backoff: Duration,
    /// Upper bound on one command write or graceful disconnect.
    pub command_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
        }
    }
}

struct CommandRequest {
    command: DeviceCommand,
    reply: oneshot::Sender<AppResult<()>>,
}

impl CommandRequest {
    fn reject(self, address: &str) {
        let _ = self
            .reply
            .send(Err(MotionError::NotConnected(address.to_string())));
    }
}

enum Lifecycle {
    Idle(Box<Worker>),
    Running(JoinHandle<()>),
    Closed,
}

/// Owner of one device's link.
pub struct ConnectionManager {
    address: String,
    name: String,
    status: Arc<watch::Sender<DeviceStatus>>,
    commands: mpsc::Sender<CommandRequest>,
    stop: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state. Nothing happens until
    /// [`start`](Self::start).
    pub fn new(
        address: impl Into<String>,
        name: impl Into<String>,
        transport: Arc<dyn LinkTransport>,
        observer: Arc<dyn ConnectionObserver>,
        sink: Arc<dyn SampleSink>,
        settings: LinkSettings,
    ) -> Self {
        let address = address.into();
        let (status_tx, _) = watch::channel(DeviceStatus::Disconnected);
        let status = Arc::new(status_tx);
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let stop = CancellationToken::new();

        let worker = Worker {
            address: address.clone(),
            transport,
            observer,
            sink,
            settings,
            status: Arc::clone(&status),
            commands: command_rx,
            stop: stop.clone(),
        };

        Self {
            address,
            name: name.into(),
            status,
            commands,
            stop,
            lifecycle: Mutex::new(Lifecycle::Idle(Box::new(worker))),
        }
    }

    /// Device address this manager connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        *self.status.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    /// Spawn the connect/reconnect loop.
    pub async fn start(&self) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Idle(worker) => {
                tracing::debug!(address = %self.address, name = %self.name, "Starting connection manager");
                *lifecycle = Lifecycle::Running(tokio::spawn(worker.run()));
                Ok(())
            }
            running @ Lifecycle::Running(_) => {
                *lifecycle = running;
                Err(MotionError::AlreadyRunning(self.address.clone()))
            }
            Lifecycle::Closed => Err(MotionError::Closed(self.address.clone())),
        }
    }

    /// Send a command to the connected device through the manager's loop.
    pub async fn send_command(&self, command: DeviceCommand) -> AppResult<()> {
        if self.status() != DeviceStatus::Connected {
            return Err(MotionError::NotConnected(self.address.clone()));
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(CommandRequest { command, reply })
            .await
            .map_err(|_| MotionError::NotConnected(self.address.clone()))?;
        response
            .await
            .map_err(|_| MotionError::NotConnected(self.address.clone()))?
    }

    /// Stop the loop and wait for teardown.
    ///
    /// A connected device is told to stop streaming and its link is closed gracefully
    /// before this returns. Safe to call repeatedly and concurrently with a connection
    /// attempt.
    pub async fn close(&self) {
        self.stop.cancel();
        // held across the join so concurrent closers also wait for teardown
        let mut lifecycle = self.lifecycle.lock().await;
        if let Lifecycle::Running(task) = std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            if let Err(e) = task.await {
                tracing::error!(address = %self.address, error = ?e, "Connection task failed");
            }
            tracing::debug!(address = %self.address, "Connection manager closed");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // an unclosed worker still tears its link down on its own
        self.stop.cancel();
    }
}

/// Run `fut` until it completes or `stop` fires, rejecting commands meanwhile.
async fn until_stopped<F: Future>(
    stop: &CancellationToken,
    commands: &mut mpsc::Receiver<CommandRequest>,
    address: &str,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return None,
            output = &mut fut => return Some(output),
            Some(request) = commands.recv() => request.reject(address),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    Stopped,
    Dropped,
}

enum PumpEvent {
    Stop,
    Frame(Vec<u8>),
    Dropped,
    Command(CommandRequest),
}

struct Worker {
    address: String,
    transport: Arc<dyn LinkTransport>,
    observer: Arc<dyn ConnectionObserver>,
    sink: Arc<dyn SampleSink>,
    settings: LinkSettings,
    status: Arc<watch::Sender<DeviceStatus>>,
    commands: mpsc::Receiver<CommandRequest>,
    stop: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        while !self.stop.is_cancelled() {
            self.set_status(DeviceStatus::Connecting);
            self.observer.on_connecting(&self.address);

            // the attempt runs on its own task so a stop never drops it half way
            let mut connecting = tokio::spawn({
                let transport = Arc::clone(&self.transport);
                let address = self.address.clone();
                async move { transport.connect(&address).await }
            });
            let attempt = until_stopped(
                &self.stop,
                &mut self.commands,
                &self.address,
                &mut connecting,
            )
            .await;

            let failure = match attempt {
                None => {
                    self.abandon_connect(connecting).await;
                    break;
                }
                Some(Ok(Ok(link))) => {
                    self.session(link).await;
                    None
                }
                Some(Ok(Err(e))) => Some(format!("{e:#}")),
                Some(Err(e)) => Some(format!("Connect task failed: {e}")),
            };

            if let Some(message) = failure {
                tracing::warn!(address = %self.address, error = %message, "Connect attempt failed");
                self.set_status(DeviceStatus::Disconnected);
                self.observer.on_connect_fail(&self.address, &message);
            }

            let backoff = tokio::time::sleep(self.settings.reconnect_backoff);
            if until_stopped(&self.stop, &mut self.commands, &self.address, backoff)
                .await
                .is_none()
            {
                break;
            }
            tracing::debug!(address = %self.address, "Retrying connection");
        }

        self.set_status(DeviceStatus::Disconnected);
        tracing::debug!(address = %self.address, "Connection loop exited");
    }

    /// Drive one established link until it drops or the manager stops.
    async fn session(&mut self, mut link: Box<dyn Link>) {
        let subscribed = until_stopped(
            &self.stop,
            &mut self.commands,
            &self.address,
            link.subscribe(),
        )
        .await;

        let frames = match subscribed {
            Some(Ok(frames)) => frames,
            Some(Err(e)) => {
                let message = format!("{e:#}");
                tracing::warn!(address = %self.address, error = %message, "Subscribe failed");
                self.close_link(&*link).await;
                self.set_status(DeviceStatus::Disconnected);
                self.observer.on_connect_fail(&self.address, &message);
                return;
            }
            None => {
                self.close_link(&*link).await;
                return;
            }
        };

        self.set_status(DeviceStatus::Connected);
        self.observer.on_connect(&self.address);
        tracing::info!(address = %self.address, "Link established");

        if let Err(e) = self.write(&*link, DeviceCommand::EnableStreaming).await {
            tracing::warn!(address = %self.address, error = %e, "Failed to enable streaming");
        }

        let end = self.pump(&*link, frames).await;
        if end == PumpEnd::Stopped {
            if let Err(e) = self.write(&*link, DeviceCommand::DisableStreaming).await {
                tracing::debug!(address = %self.address, error = %e, "Failed to disable streaming");
            }
            self.close_link(&*link).await;
        } else {
            tracing::warn!(address = %self.address, "Link dropped");
        }

        self.set_status(DeviceStatus::Disconnected);
        self.observer.on_disconnect(&self.address);
    }

    async fn pump(&mut self, link: &dyn Link, mut frames: FrameStream) -> PumpEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => PumpEvent::Stop,
                frame = frames.next() => match frame {
                    Some(frame) => PumpEvent::Frame(frame),
                    None => PumpEvent::Dropped,
                },
                _ = link.disconnected() => PumpEvent::Dropped,
                Some(request) = self.commands.recv() => PumpEvent::Command(request),
            };

            match event {
                PumpEvent::Stop => return PumpEnd::Stopped,
                PumpEvent::Dropped => return PumpEnd::Dropped,
                PumpEvent::Frame(frame) => {
                    // other report types share the channel
                    if let Some(sample) = decode_frame(&frame) {
                        self.sink.on_sample(sample);
                    }
                }
                PumpEvent::Command(request) => {
                    let result = self.write(link, request.command).await;
                    let _ = request.reply.send(result);
                }
            }
        }
    }

    async fn write(&self, link: &dyn Link, command: DeviceCommand) -> AppResult<()> {
        let packet = command.packet();
        match tokio::time::timeout(self.settings.command_timeout, link.write_command(&packet)).await
        {
            Ok(Ok(())) => {
                tracing::debug!(address = %self.address, command = command.name(), %packet, "Command sent");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(MotionError::Link(format!(
                "Timed out sending {} to {}",
                command.name(),
                self.address
            ))),
        }
    }

    /// Wait for a connect attempt cut short by a stop, bounded by the command
    /// timeout, and close whatever link it produced.
    async fn abandon_connect(&self, mut connecting: JoinHandle<anyhow::Result<Box<dyn Link>>>) {
        match tokio::time::timeout(self.settings.command_timeout, &mut connecting).await {
            Ok(Ok(Ok(link))) => {
                tracing::debug!(address = %self.address, "Closing link that came up during shutdown");
                self.close_link(&*link).await;
            }
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(address = %self.address, "Connect attempt still pending at shutdown, aborting");
                connecting.abort();
            }
        }
    }

    async fn close_link(&self, link: &dyn Link) {
        match tokio::time::timeout(self.settings.command_timeout, link.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(address = %self.address, error = ?e, "Graceful disconnect failed")
            }
            Err(_) => tracing::warn!(address = %self.address, "Graceful disconnect timed out"),
        }
    }

    fn set_status(&self, status: DeviceStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!(address = %self.address, from = %previous, to = %status, "Status changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;

    struct NullSink;

    impl SampleSink for NullSink {
        fn on_sample(&self, _sample: AccelerometerSample) {}
    }

    fn manager(transport: &MockTransport) -> ConnectionManager {
        ConnectionManager::new(
            "AA",
            "ring",
            Arc::new(transport.clone()),
            Arc::new(LoggingObserver),
            Arc::new(NullSink),
            LinkSettings::default(),
        )
    }

    #[test]
    fn status_display() {
        assert_eq!(DeviceStatus::Connecting.to_string(), "connecting");
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(MotionError::AlreadyRunning(_))
        ));
        manager.close().await;
        assert!(matches!(manager.start().await, Err(MotionError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_require_a_link() {
        let transport = MockTransport::new();
        transport.set_available("AA", false).await;
        let manager = manager(&transport);
        manager.start().await.unwrap();

        let err = manager.send_command(DeviceCommand::BlinkTwice).await;
        assert!(matches!(err, Err(MotionError::NotConnected(_))));
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_before_start_is_noop() {
        let transport = MockTransport::new();
        let manager = manager(&transport);
        manager.close().await;
        manager.close().await;
        assert_eq!(manager.status(), DeviceStatus::Disconnected);
        assert_eq!(transport.connect_attempts("AA").await, 0);
    }
}
