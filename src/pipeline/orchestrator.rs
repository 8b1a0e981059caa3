//! Filter orchestrator: fan-in of per-device filter outputs.
//!
//! The orchestrator owns the dynamic set of active filters and multiplexes their
//! periodic outputs into one ordered stream of `(address, FilterOutput)` deliveries for
//! a single [`FilteredValueConsumer`].
//!
//! ## Structure
//!
//! [`FilterOrchestrator`] is a cheap handle; the fan-in loop runs in its own task and
//! owns all per-device state:
//!
//! - a record per device (its filter's stop token and delivery count)
//! - a `StreamMap` holding each device's output sequence. Each entry is that device's
//!   single outstanding pull; once it yields, the same stream is polled again on the
//!   next loop iteration, so a pull is re-issued immediately after every delivery.
//!
//! The loop waits on the first of: the stop token, a device-set change, or any pull
//! completing. Device-set changes travel as individual messages on a command channel,
//! so two changes arriving back to back are two wake-ups; nothing is coalesced or lost.
//!
//! ## Fault containment
//!
//! Each pull is polled behind a panic guard. A panic while computing one device's
//! output, or an `Err` from the consumer for that device, removes only that device
//! (its filter is closed and its pull dropped) and is reported through
//! [`FilteredValueConsumer::on_device_fault`]. Every other device keeps delivering.

use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;

use crate::error::{AppResult, MotionError};
use crate::pipeline::filter::{run_filter, FilterInput, FilterOutput, FilterStream};
use crate::pipeline::FilterBlueprint;

/// Receiver of the fan-in stream.
///
/// Called from the orchestrator's own task, one delivery at a time, so
/// implementations need no internal locking.
pub trait FilteredValueConsumer: Send + 'static {
    /// One filtered value for `address`.
    ///
    /// Returning `Err` marks the device as faulty: it is detached and reported via
    /// [`on_device_fault`](Self::on_device_fault).
    fn on_filtered_value(&mut self, address: &str, output: FilterOutput) -> anyhow::Result<()>;

    /// `address` was detached because of a processing fault.
    fn on_device_fault(&mut self, address: &str, reason: &str) {
        tracing::warn!(address, reason, "Device filter faulted");
    }
}

enum OrchestratorCommand {
    Attach {
        address: String,
        outputs: FilterStream,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Detach {
        address: String,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Devices {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to a running fan-in loop.
pub struct FilterOrchestrator {
    blueprint: FilterBlueprint,
    commands: mpsc::UnboundedSender<OrchestratorCommand>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FilterOrchestrator {
    /// Start the fan-in loop. New devices get filters built from `blueprint`.
    pub fn spawn<C: FilteredValueConsumer>(blueprint: FilterBlueprint, consumer: C) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let fan_in = FanIn {
            consumer,
            records: HashMap::new(),
            pulls: StreamMap::new(),
            commands: command_rx,
            stop: stop.clone(),
        };
        let task = tokio::spawn(fan_in.run());

        Self {
            blueprint,
            commands,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    /// Build a filter for `address`, start its output sequence and add it to the wait set.
    ///
    /// Returns the filter's ingestion handle, to be wired to the device's sample source.
    pub async fn add_device(&self, address: &str) -> AppResult<FilterInput> {
        let (input, outputs) = run_filter(self.blueprint.build());
        self.attach(address, outputs).await?;
        Ok(input)
    }

    /// Add an already running output sequence for `address`.
    pub async fn attach(&self, address: &str, outputs: FilterStream) -> AppResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(OrchestratorCommand::Attach {
            address: address.to_string(),
            outputs,
            reply,
        })?;
        response.await.map_err(|_| MotionError::OrchestratorStopped)?
    }

    /// Cancel the device's pending pull, close its filter and drop it from the wait set.
    pub async fn remove_device(&self, address: &str) -> AppResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(OrchestratorCommand::Detach {
            address: address.to_string(),
            reply,
        })?;
        response.await.map_err(|_| MotionError::OrchestratorStopped)?
    }

    /// Addresses currently in the wait set, sorted.
    pub async fn devices(&self) -> AppResult<Vec<String>> {
        let (reply, response) = oneshot::channel();
        self.send(OrchestratorCommand::Devices { reply })?;
        response.await.map_err(|_| MotionError::OrchestratorStopped)
    }

    /// Whether the fan-in loop is still accepting devices.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled() && !self.commands.is_closed()
    }

    /// Stop the loop, close every filter and wait for the loop to exit.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.stop.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "Filter orchestrator task failed");
            }
        }
    }

    fn send(&self, command: OrchestratorCommand) -> AppResult<()> {
        if self.stop.is_cancelled() {
            return Err(MotionError::OrchestratorStopped);
        }
        self.commands
            .send(command)
            .map_err(|_| MotionError::OrchestratorStopped)
    }
}

enum PullEvent {
    Output(FilterOutput),
    Fault(String),
    Ended,
}

/// One device's output sequence, polled behind a panic guard.
struct GuardedPull {
    outputs: Option<FilterStream>,
}

impl Stream for GuardedPull {
    type Item = PullEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PullEvent>> {
        let Some(outputs) = self.outputs.as_mut() else {
            return Poll::Ready(None);
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| outputs.poll_next_unpin(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(Some(output))) => Poll::Ready(Some(PullEvent::Output(output))),
            Ok(Poll::Ready(None)) => {
                self.outputs = None;
                Poll::Ready(Some(PullEvent::Ended))
            }
            Err(payload) => {
                self.outputs = None;
                Poll::Ready(Some(PullEvent::Fault(panic_message(payload.as_ref()))))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("filter panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("filter panicked: {msg}")
    } else {
        "filter panicked".to_string()
    }
}

struct DeviceRecord {
    stop: CancellationToken,
    delivered: u64,
}

enum LoopEvent {
    Stop,
    Command(OrchestratorCommand),
    Pull(String, PullEvent),
}

struct FanIn<C> {
    consumer: C,
    records: HashMap<String, DeviceRecord>,
    pulls: StreamMap<String, GuardedPull>,
    commands: mpsc::UnboundedReceiver<OrchestratorCommand>,
    stop: CancellationToken,
}

impl<C: FilteredValueConsumer> FanIn<C> {
    async fn run(mut self) {
        tracing::debug!("Filter orchestrator started");
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => LoopEvent::Stop,
                command = self.commands.recv() => match command {
                    Some(command) => LoopEvent::Command(command),
                    // every handle is gone
                    None => LoopEvent::Stop,
                },
                Some((address, pull)) = self.pulls.next(), if !self.pulls.is_empty() => {
                    LoopEvent::Pull(address, pull)
                }
            };

            match event {
                LoopEvent::Stop => break,
                LoopEvent::Command(command) => self.handle_command(command),
                LoopEvent::Pull(address, pull) => self.handle_pull(address, pull),
            }
            debug_assert_eq!(self.records.len(), self.pulls.len());
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::Attach {
                address,
                outputs,
                reply,
            } => {
                let result = if self.records.contains_key(&address) {
                    outputs.close();
                    Err(MotionError::DuplicateDevice(address))
                } else {
                    tracing::info!(address = %address, "Filter attached");
                    self.records.insert(
                        address.clone(),
                        DeviceRecord {
                            stop: outputs.stop_token(),
                            delivered: 0,
                        },
                    );
                    self.pulls.insert(
                        address,
                        GuardedPull {
                            outputs: Some(outputs),
                        },
                    );
                    Ok(())
                };
                let _ = reply.send(result);
            }
            OrchestratorCommand::Detach { address, reply } => {
                let result = if self.detach(&address) {
                    tracing::info!(address = %address, "Filter detached");
                    Ok(())
                } else {
                    Err(MotionError::UnknownDevice(address))
                };
                let _ = reply.send(result);
            }
            OrchestratorCommand::Devices { reply } => {
                let mut devices: Vec<String> = self.records.keys().cloned().collect();
                devices.sort();
                let _ = reply.send(devices);
            }
        }
    }

    fn handle_pull(&mut self, address: String, pull: PullEvent) {
        match pull {
            PullEvent::Output(output) => {
                if let Some(record) = self.records.get_mut(&address) {
                    record.delivered += 1;
                }
                if let Err(e) = self.consumer.on_filtered_value(&address, output) {
                    let reason = format!("consumer rejected value: {e:#}");
                    self.isolate(&address, &reason);
                }
            }
            PullEvent::Fault(reason) => self.isolate(&address, &reason),
            PullEvent::Ended => {
                tracing::debug!(address = %address, "Filter output sequence ended");
                self.detach(&address);
            }
        }
    }

    fn isolate(&mut self, address: &str, reason: &str) {
        let delivered = self.records.get(address).map_or(0, |r| r.delivered);
        tracing::error!(address, reason, delivered, "Isolating faulty device filter");
        self.detach(address);
        self.consumer.on_device_fault(address, reason);
    }

    /// Close the filter and drop its pending pull.
    fn detach(&mut self, address: &str) -> bool {
        let record = self.records.remove(address);
        if let Some(record) = &record {
            record.stop.cancel();
        }
        self.pulls.remove(address);
        record.is_some()
    }

    fn shutdown(&mut self) {
        for (_, record) in self.records.drain() {
            record.stop.cancel();
        }
        self.pulls.clear();
        self.commands.close();
        tracing::debug!("Filter orchestrator stopped");
    }
}
