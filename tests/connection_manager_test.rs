//! Integration tests for the per-device connection lifecycle.

mod common;

use common::{eventually, next, ChannelSink, LinkEvent, RecordingObserver};
use motion_daq::connection::{ConnectionManager, DeviceStatus, LinkSettings};
use motion_daq::hardware::protocol::{encode_accelerometer_frame, DeviceCommand};
use motion_daq::hardware::MockTransport;
use motion_daq::MotionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const ADDRESS: &str = "C0:FF:EE:00:00:01";

fn manager_for(
    transport: &MockTransport,
    observer: Arc<RecordingObserver>,
    sink: Arc<ChannelSink>,
) -> ConnectionManager {
    ConnectionManager::new(
        ADDRESS,
        "left ring",
        Arc::new(transport.clone()),
        observer,
        sink,
        LinkSettings::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_connected() {
    let transport = MockTransport::new();
    let not_found = format!("Device with address {ADDRESS} was not found");
    transport.fail_next_connects(ADDRESS, 2, &not_found).await;

    let (observer, mut events) = RecordingObserver::new();
    let (sink, _samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);

    let started = Instant::now();
    manager.start().await.expect("start");

    let mut sequence = Vec::new();
    loop {
        let (address, event) = next(&mut events).await;
        assert_eq!(address, ADDRESS);
        let done = event == LinkEvent::Connect;
        sequence.push(event);
        if done {
            break;
        }
    }

    assert_eq!(
        sequence,
        vec![
            LinkEvent::Connecting,
            LinkEvent::ConnectFail(not_found.clone()),
            LinkEvent::Connecting,
            LinkEvent::ConnectFail(not_found),
            LinkEvent::Connecting,
            LinkEvent::Connect,
        ]
    );
    // two fixed backoffs
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    assert_eq!(manager.status(), DeviceStatus::Connected);
    assert_eq!(transport.connect_attempts(ADDRESS).await, 3);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_enables_streaming_and_forwards_samples_in_order() {
    let transport = MockTransport::new();
    let (observer, _events) = RecordingObserver::new();
    let (sink, mut samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);
    manager.start().await.expect("start");

    eventually(|| transport.is_streaming(ADDRESS)).await;
    assert_eq!(
        transport.written_commands(ADDRESS).await,
        vec![DeviceCommand::EnableStreaming.packet()]
    );

    // PPG report on the same channel is ignored
    let mut ppg = encode_accelerometer_frame(9, 9, 9);
    ppg[1] = 0x01;
    assert!(transport.send_frame(ADDRESS, &ppg).await);

    for x in 1..=3 {
        assert!(
            transport
                .send_frame(ADDRESS, &encode_accelerometer_frame(x, 0, 0))
                .await
        );
    }

    for x in 1..=3 {
        let sample = next(&mut samples).await;
        assert_eq!((sample.x, sample.y, sample.z), (x, 0, 0));
    }

    manager.close().await;
    assert!(samples.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_link_drop_triggers_backoff_and_reconnect() {
    let transport = MockTransport::new();
    let (observer, mut events) = RecordingObserver::new();
    let (sink, _samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);
    manager.start().await.expect("start");

    assert_eq!(next(&mut events).await.1, LinkEvent::Connecting);
    assert_eq!(next(&mut events).await.1, LinkEvent::Connect);

    assert!(transport.drop_link(ADDRESS).await);
    assert_eq!(next(&mut events).await.1, LinkEvent::Disconnect);
    let dropped_at = Instant::now();
    assert_eq!(manager.status(), DeviceStatus::Disconnected);

    assert_eq!(next(&mut events).await.1, LinkEvent::Connecting);
    assert_eq!(dropped_at.elapsed(), Duration::from_secs(2));
    assert_eq!(next(&mut events).await.1, LinkEvent::Connect);
    assert_eq!(transport.connect_attempts(ADDRESS).await, 2);

    // a dropped link is not closed gracefully
    assert_eq!(transport.graceful_disconnects(ADDRESS).await, 0);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_disables_streaming_and_disconnects() {
    let transport = MockTransport::new();
    let (observer, mut events) = RecordingObserver::new();
    let (sink, _samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);
    manager.start().await.expect("start");
    eventually(|| transport.is_streaming(ADDRESS)).await;

    manager.close().await;

    let written = transport.written_commands(ADDRESS).await;
    assert_eq!(written.last(), Some(&DeviceCommand::DisableStreaming.packet()));
    assert_eq!(transport.graceful_disconnects(ADDRESS).await, 1);
    assert!(!transport.is_connected(ADDRESS).await);
    assert_eq!(manager.status(), DeviceStatus::Disconnected);

    let mut tail = Vec::new();
    while let Ok((_, event)) = events.try_recv() {
        tail.push(event);
    }
    assert_eq!(tail.last(), Some(&LinkEvent::Disconnect));

    // no reconnect after close
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.connect_attempts(ADDRESS).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_multiple_close_calls() {
    let transport = MockTransport::new();
    let (observer, _events) = RecordingObserver::new();
    let (sink, _samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);
    manager.start().await.expect("start");
    eventually(|| transport.is_connected(ADDRESS)).await;

    tokio::join!(manager.close(), manager.close());
    manager.close().await;

    assert_eq!(transport.graceful_disconnects(ADDRESS).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_slow_connect() {
    let transport = MockTransport::new().with_connect_delay(Duration::from_secs(30));
    let (observer, mut events) = RecordingObserver::new();
    let (sink, _samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);
    manager.start().await.expect("start");
    assert_eq!(next(&mut events).await.1, LinkEvent::Connecting);

    let started = Instant::now();
    manager.close().await;

    // a hung attempt is given one command timeout, then aborted
    assert!(started.elapsed() <= LinkSettings::default().command_timeout);
    assert_eq!(manager.status(), DeviceStatus::Disconnected);
    assert!(!transport.is_connected(ADDRESS).await);
    assert_eq!(transport.connect_attempts(ADDRESS).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_late_link_and_closes_it() {
    let transport = MockTransport::new().with_connect_delay(Duration::from_secs(1));
    let (observer, mut events) = RecordingObserver::new();
    let (sink, _samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);
    manager.start().await.expect("start");
    assert_eq!(next(&mut events).await.1, LinkEvent::Connecting);

    let started = Instant::now();
    manager.close().await;

    // the attempt finished during close and its link was torn down before returning
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(transport.connect_attempts(ADDRESS).await, 1);
    assert!(!transport.is_connected(ADDRESS).await);
    assert_eq!(transport.graceful_disconnects(ADDRESS).await, 1);
    assert_eq!(manager.status(), DeviceStatus::Disconnected);
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_runtime_commands() {
    let transport = MockTransport::new();
    transport.set_available(ADDRESS, false).await;
    let (observer, _events) = RecordingObserver::new();
    let (sink, _samples) = ChannelSink::new();
    let manager = manager_for(&transport, observer, sink);
    let mut status = manager.subscribe_status();
    manager.start().await.expect("start");

    assert!(matches!(
        manager.send_command(DeviceCommand::BlinkTwice).await,
        Err(MotionError::NotConnected(_))
    ));

    transport.set_available(ADDRESS, true).await;
    status
        .wait_for(|s| *s == DeviceStatus::Connected)
        .await
        .expect("status channel");

    manager
        .send_command(DeviceCommand::BlinkTwice)
        .await
        .expect("blink");
    assert!(transport
        .written_commands(ADDRESS)
        .await
        .contains(&DeviceCommand::BlinkTwice.packet()));

    manager.close().await;
}
