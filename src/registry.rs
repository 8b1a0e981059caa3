//! Device registry: owns every connection manager and keeps the filter
//! orchestrator's device set in step with it.
//!
//! Adding a device creates its filter first, then a [`ConnectionManager`] whose
//! sample sink is that filter's input. Removing a device tears down in the opposite
//! order: the link is closed before the filter is dropped.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::connection::{ConnectionManager, ConnectionObserver, DeviceStatus, LinkSettings};
use crate::error::{AppResult, MotionError};
use crate::hardware::link::LinkTransport;
use crate::hardware::protocol::DeviceCommand;
use crate::pipeline::FilterOrchestrator;

/// Summary over all devices: any `Disconnected` wins, then any `Connecting`.
///
/// `None` when there are no devices.
pub fn aggregate_status<I>(statuses: I) -> Option<DeviceStatus>
where
    I: IntoIterator<Item = DeviceStatus>,
{
    let mut summary = None;
    for status in statuses {
        summary = Some(match (summary, status) {
            (_, DeviceStatus::Disconnected) | (Some(DeviceStatus::Disconnected), _) => {
                DeviceStatus::Disconnected
            }
            (_, DeviceStatus::Connecting) | (Some(DeviceStatus::Connecting), _) => {
                DeviceStatus::Connecting
            }
            _ => DeviceStatus::Connected,
        });
    }
    summary
}

enum Entry {
    Active(Arc<ConnectionManager>),
    // address stays reserved until its link and filter are gone
    Removing,
}

impl Entry {
    fn manager(&self) -> Option<&Arc<ConnectionManager>> {
        match self {
            Entry::Active(manager) => Some(manager),
            Entry::Removing => None,
        }
    }
}

/// Owner of every attached device.
///
/// Each address maps to one [`ConnectionManager`] and one filter in the
/// [`FilterOrchestrator`]. An address being removed stays reserved until both are
/// torn down, so a concurrent add for it is rejected as a duplicate.
pub struct DeviceRegistry {
    transport: Arc<dyn LinkTransport>,
    observer: Arc<dyn ConnectionObserver>,
    orchestrator: FilterOrchestrator,
    settings: LinkSettings,
    devices: Mutex<BTreeMap<String, Entry>>,
}

impl DeviceRegistry {
    /// Create an empty registry whose devices share `transport` and `observer`.
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        observer: Arc<dyn ConnectionObserver>,
        orchestrator: FilterOrchestrator,
        settings: LinkSettings,
    ) -> Self {
        Self {
            transport,
            observer,
            orchestrator,
            settings,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Attach a device: start its filter and its connection loop.
    pub async fn add_device(&self, address: &str, name: &str) -> AppResult<()> {
        let address = address.trim();
        if address.is_empty() {
            return Err(MotionError::InvalidAddress);
        }

        let mut devices = self.devices.lock().await;
        if devices.contains_key(address) {
            return Err(MotionError::DuplicateDevice(address.to_string()));
        }

        let input = self.orchestrator.add_device(address).await?;
        let manager = Arc::new(ConnectionManager::new(
            address,
            name,
            Arc::clone(&self.transport),
            Arc::clone(&self.observer),
            Arc::new(input),
            self.settings,
        ));
        if let Err(e) = manager.start().await {
            self.detach_filter(address).await;
            return Err(e);
        }

        tracing::info!(address, name, "Device added");
        devices.insert(address.to_string(), Entry::Active(manager));
        Ok(())
    }

    /// Detach a device: close its link, then drop its filter.
    pub async fn remove_device(&self, address: &str) -> AppResult<()> {
        let manager = {
            let mut devices = self.devices.lock().await;
            let entry = devices
                .get_mut(address)
                .ok_or_else(|| MotionError::UnknownDevice(address.to_string()))?;
            match std::mem::replace(entry, Entry::Removing) {
                Entry::Active(manager) => manager,
                Entry::Removing => return Err(MotionError::UnknownDevice(address.to_string())),
            }
        };

        manager.close().await;
        self.detach_filter(address).await;

        let mut devices = self.devices.lock().await;
        if matches!(devices.get(address), Some(Entry::Removing)) {
            devices.remove(address);
        }
        tracing::info!(address, "Device removed");
        Ok(())
    }

    /// Send a command to one connected device.
    pub async fn send_command(&self, address: &str, command: DeviceCommand) -> AppResult<()> {
        let manager = self
            .device(address)
            .await
            .ok_or_else(|| MotionError::UnknownDevice(address.to_string()))?;
        manager.send_command(command).await
    }

    /// Manager for `address`, unless it is absent or being removed.
    pub async fn device(&self, address: &str) -> Option<Arc<ConnectionManager>> {
        self.devices
            .lock()
            .await
            .get(address)
            .and_then(Entry::manager)
            .cloned()
    }

    /// Registered addresses, sorted.
    pub async fn addresses(&self) -> Vec<String> {
        self.devices
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.manager().is_some())
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Current status of each registered device, sorted by address.
    pub async fn statuses(&self) -> Vec<(String, DeviceStatus)> {
        self.devices
            .lock()
            .await
            .iter()
            .filter_map(|(address, entry)| {
                entry
                    .manager()
                    .map(|manager| (address.clone(), manager.status()))
            })
            .collect()
    }

    /// See [`aggregate_status`].
    pub async fn aggregate_status(&self) -> Option<DeviceStatus> {
        aggregate_status(
            self.devices
                .lock()
                .await
                .values()
                .filter_map(Entry::manager)
                .map(|manager| manager.status()),
        )
    }

    /// The fan-in the registry's filters feed.
    pub fn orchestrator(&self) -> &FilterOrchestrator {
        &self.orchestrator
    }

    /// Close every device, then the orchestrator. Safe to call more than once.
    pub async fn close(&self) {
        let managers: Vec<Arc<ConnectionManager>> = {
            let mut devices = self.devices.lock().await;
            std::mem::take(&mut *devices)
                .into_values()
                .filter_map(|entry| match entry {
                    Entry::Active(manager) => Some(manager),
                    Entry::Removing => None,
                })
                .collect()
        };

        if !managers.is_empty() {
            tracing::info!(count = managers.len(), "Closing devices");
        }
        join_all(managers.iter().map(|manager| manager.close())).await;
        self.orchestrator.close().await;
    }

    async fn detach_filter(&self, address: &str) {
        match self.orchestrator.remove_device(address).await {
            Ok(()) => {}
            // already isolated after a fault, or the orchestrator is shutting down
            Err(e) => tracing::debug!(address, error = %e, "Filter already detached"),
        }
    }
}
