//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use motion_daq::connection::{ConnectionObserver, SampleSink};
use motion_daq::hardware::protocol::AccelerometerSample;
use motion_daq::pipeline::{FilterOutput, FilteredValueConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connecting,
    Connect,
    Disconnect,
    ConnectFail(String),
}

/// Observer that forwards every callback to a channel.
pub struct RecordingObserver {
    tx: mpsc::UnboundedSender<(String, LinkEvent)>,
}

impl RecordingObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, LinkEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn emit(&self, address: &str, event: LinkEvent) {
        let _ = self.tx.send((address.to_string(), event));
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_connecting(&self, address: &str) {
        self.emit(address, LinkEvent::Connecting);
    }

    fn on_connect(&self, address: &str) {
        self.emit(address, LinkEvent::Connect);
    }

    fn on_disconnect(&self, address: &str) {
        self.emit(address, LinkEvent::Disconnect);
    }

    fn on_connect_fail(&self, address: &str, message: &str) {
        self.emit(address, LinkEvent::ConnectFail(message.to_string()));
    }
}

/// Sample sink that forwards decoded samples to a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AccelerometerSample>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AccelerometerSample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SampleSink for ChannelSink {
    fn on_sample(&self, sample: AccelerometerSample) {
        let _ = self.tx.send(sample);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Value(String, FilterOutput),
    Fault(String, String),
}

/// Fan-in consumer that forwards deliveries to a channel.
///
/// Values for `reject` are answered with an error, which the orchestrator treats
/// as a fault of that device.
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<Delivery>,
    reject: Option<String>,
}

impl ChannelConsumer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, reject: None }, rx)
    }

    pub fn rejecting(address: &str) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (mut consumer, rx) = Self::new();
        consumer.reject = Some(address.to_string());
        (consumer, rx)
    }
}

impl FilteredValueConsumer for ChannelConsumer {
    fn on_filtered_value(&mut self, address: &str, output: FilterOutput) -> anyhow::Result<()> {
        if self.reject.as_deref() == Some(address) {
            anyhow::bail!("value for {address} rejected");
        }
        let _ = self.tx.send(Delivery::Value(address.to_string(), output));
        Ok(())
    }

    fn on_device_fault(&mut self, address: &str, reason: &str) {
        let _ = self
            .tx
            .send(Delivery::Fault(address.to_string(), reason.to_string()));
    }
}

/// Next event from a channel, failing the test instead of hanging.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..10_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}
