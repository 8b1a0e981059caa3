//! Bluetooth Low Energy transport built on `btleplug`.
//!
//! Rings expose the Nordic UART service: commands are written to
//! [`UART_RX_CHAR_UUID`] and telemetry arrives as notifications on
//! [`UART_TX_CHAR_UUID`]. Disconnects are detected from the adapter's
//! `CentralEvent::DeviceDisconnected` events rather than by polling the device.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::hardware::link::{FrameStream, Link, LinkTransport};
use crate::hardware::protocol::{CommandPacket, UART_RX_CHAR_UUID, UART_TX_CHAR_UUID};

/// How long to scan for a device that the adapter has not seen yet.
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// BLE transport bound to the first available adapter.
pub struct BleTransport {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BleTransport {
    /// Open the first Bluetooth adapter on the system.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to initialise Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        Ok(Self {
            adapter,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        })
    }

    /// Override how long `connect` scans for an unseen device.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.known_peripheral(address).await? {
            return Ok(peripheral);
        }

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .context("Failed to start BLE scan")?;

        let mut scan = ScanGuard::new(self.adapter.clone());
        let deadline = Instant::now() + self.scan_timeout;
        let found = loop {
            if let Some(peripheral) = self.known_peripheral(address).await? {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        scan.armed = false;
        if let Err(e) = self.adapter.stop_scan().await {
            tracing::debug!(error = ?e, "Failed to stop BLE scan");
        }

        found.ok_or_else(|| anyhow!("Device with address {address} was not found"))
    }

    async fn known_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        let peripherals = self.adapter.peripherals().await?;
        // Some platforms hide the MAC and only expose an opaque id
        Ok(peripherals.into_iter().find(|p| {
            p.address().to_string().eq_ignore_ascii_case(address)
                || p.id().to_string().eq_ignore_ascii_case(address)
        }))
    }
}

/// Stops an adapter scan if the scanning future is dropped part way.
struct ScanGuard {
    adapter: Adapter,
    armed: bool,
}

impl ScanGuard {
    fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            armed: true,
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let adapter = self.adapter.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    tracing::debug!(error = ?e, "Failed to stop abandoned BLE scan");
                }
            });
        }
    }
}

/// Disconnects a peripheral if link setup is dropped before a [`BleLink`] owns it.
struct ConnectGuard {
    peripheral: Peripheral,
    armed: bool,
}

impl ConnectGuard {
    fn new(peripheral: &Peripheral) -> Self {
        Self {
            peripheral: peripheral.clone(),
            armed: true,
        }
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let peripheral = self.peripheral.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    tracing::debug!(error = ?e, "Failed to disconnect abandoned peripheral");
                }
            });
        }
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| anyhow!("Characteristic {uuid} not found"))
}

#[async_trait]
impl LinkTransport for BleTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn Link>> {
        let peripheral = self.find_peripheral(address).await?;

        // Subscribe to adapter events before connecting so an early drop is not missed
        let mut events = self.adapter.events().await?;
        peripheral
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {address}"))?;
        let mut guard = ConnectGuard::new(&peripheral);

        let characteristics = async {
            peripheral.discover_services().await?;
            let write_char = find_characteristic(&peripheral, UART_RX_CHAR_UUID)?;
            let notify_char = find_characteristic(&peripheral, UART_TX_CHAR_UUID)?;
            anyhow::Ok((write_char, notify_char))
        }
        .await;

        let (write_char, notify_char) = match characteristics {
            Ok(chars) => chars,
            Err(e) => {
                guard.armed = false;
                if let Err(close_err) = peripheral.disconnect().await {
                    tracing::debug!(address, error = ?close_err, "Disconnect after failed setup");
                }
                return Err(e.context(format!("Failed to set up {address}")));
            }
        };

        guard.armed = false;
        let (dropped_tx, dropped_rx) = watch::channel(false);
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        dropped_tx.send_replace(true);
                        break;
                    }
                }
            }
        });

        Ok(Box::new(BleLink {
            peripheral,
            write_char,
            notify_char,
            dropped_rx,
            watcher,
        }))
    }
}

/// One connected ring.
pub struct BleLink {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
    dropped_rx: watch::Receiver<bool>,
    watcher: JoinHandle<()>,
}

#[async_trait]
impl Link for BleLink {
    async fn subscribe(&mut self) -> Result<FrameStream> {
        self.peripheral
            .subscribe(&self.notify_char)
            .await
            .context("Failed to subscribe to telemetry notifications")?;
        let notifications = self.peripheral.notifications().await?;

        Ok(notifications
            .filter_map(|n| async move { (n.uuid == UART_TX_CHAR_UUID).then_some(n.value) })
            .boxed())
    }

    async fn write_command(&self, packet: &CommandPacket) -> Result<()> {
        self.peripheral
            .write(&self.write_char, packet.as_bytes(), WriteType::WithoutResponse)
            .await
            .context("Failed to write command")
    }

    async fn disconnected(&self) {
        let mut rx = self.dropped_rx.clone();
        let _ = rx.wait_for(|dropped| *dropped).await;
    }

    async fn disconnect(&self) -> Result<()> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
