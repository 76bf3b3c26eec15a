//! btleplug-backed [`Transport`].
//!
//! Interactive selection scans for [`LinkConfig::scan_duration`], filters
//! the results by name prefix and advertised services, and hands the
//! candidates to a [`PeripheralChooser`]. Enumeration lists the peripherals
//! the adapter already knows. Link losses are reported from the adapter's
//! `DeviceDisconnected` events.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use blelink_types::PeripheralRef;

use crate::config::{LinkConfig, SelectionFilter};
use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::guard::Unregister;
use crate::traits::{
    CharacteristicHandle, DisconnectCallback, PayloadCallback, ServerHandle, ServiceHandle,
    Transport,
};

/// A peripheral offered during interactive selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The peripheral.
    pub peripheral: PeripheralRef,
    /// Signal strength when last seen.
    pub rssi: Option<i16>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rssi {
            Some(rssi) => write!(f, "{} [{} dBm]", self.peripheral, rssi),
            None => write!(f, "{}", self.peripheral),
        }
    }
}

/// The user-facing half of interactive selection.
///
/// Returning [`Error::Cancelled`] marks the selection as cancelled by the
/// user.
#[async_trait]
pub trait PeripheralChooser: Send + Sync {
    /// Pick one of `candidates`, which is never empty.
    async fn choose(&self, candidates: Vec<Candidate>) -> Result<PeripheralRef>;
}

/// Picks the candidate with the strongest signal without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrongestSignal;

#[async_trait]
impl PeripheralChooser for StrongestSignal {
    async fn choose(&self, candidates: Vec<Candidate>) -> Result<PeripheralRef> {
        candidates
            .into_iter()
            .max_by_key(|c| c.rssi.unwrap_or(i16::MIN))
            .map(|c| c.peripheral)
            .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoDevicesInRange))
    }
}

type Observers = HashMap<String, Vec<(u64, DisconnectCallback)>>;

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Transport over the first local Bluetooth adapter.
pub struct BtleTransport {
    adapter: Adapter,
    config: LinkConfig,
    chooser: Arc<dyn PeripheralChooser>,
    known: Arc<Mutex<HashMap<String, Peripheral>>>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    observers: Arc<Mutex<Observers>>,
    next_token: AtomicU64,
    event_task: JoinHandle<()>,
}

impl BtleTransport {
    /// Open the first adapter and start listening for link losses.
    pub async fn new(config: LinkConfig, chooser: Arc<dyn PeripheralChooser>) -> Result<Self> {
        config.validate()?;
        let adapter = get_adapter().await?;
        let known = Arc::new(Mutex::new(HashMap::new()));
        let observers = Arc::new(Mutex::new(Observers::new()));

        let mut events = adapter.events().await?;
        let event_task = {
            let known = Arc::clone(&known);
            let observers = Arc::clone(&observers);
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        dispatch_disconnect(&known, &observers, &id);
                    }
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            config,
            chooser,
            known,
            pumps: Mutex::new(HashMap::new()),
            observers,
            next_token: AtomicU64::new(1),
            event_task,
        })
    }

    /// The link profile this transport was opened with.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Describe every peripheral the adapter currently knows and cache it.
    async fn refresh(&self) -> Result<Vec<(PeripheralRef, Option<PeripheralProperties>)>> {
        let peripherals = self.adapter.peripherals().await?;
        let mut found = Vec::with_capacity(peripherals.len());

        for peripheral in peripherals {
            let properties = peripheral.properties().await.unwrap_or_else(|e| {
                debug!("Reading properties failed: {}", e);
                None
            });
            let reference = describe(&peripheral, properties.as_ref());
            lock(&self.known).insert(reference.id.clone(), peripheral);
            found.push((reference, properties));
        }

        Ok(found)
    }

    async fn peripheral(&self, reference: &PeripheralRef) -> Result<Peripheral> {
        if let Some(peripheral) = lock(&self.known).get(&reference.id).cloned() {
            return Ok(peripheral);
        }
        self.refresh().await?;
        lock(&self.known)
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| Error::device_not_found(&reference.id))
    }

    async fn characteristic(
        &self,
        handle: &CharacteristicHandle,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(&handle.peripheral).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == handle.service && c.uuid == handle.uuid)
            .ok_or_else(|| Error::characteristic_not_found(handle.uuid, handle.service))?;
        Ok((peripheral, characteristic))
    }

    fn stop_pump(&self, key: &str) {
        if let Some(pump) = lock(&self.pumps).remove(key) {
            pump.abort();
        }
    }

    fn stop_pumps_for(&self, peripheral: &PeripheralRef) {
        let prefix = format!("{}/", peripheral.id);
        lock(&self.pumps).retain(|key, pump| {
            if key.starts_with(&prefix) {
                pump.abort();
                false
            } else {
                true
            }
        });
    }
}

#[async_trait]
impl Transport for BtleTransport {
    fn supports_enumeration(&self) -> bool {
        true
    }

    #[tracing::instrument(level = "info", skip_all, fields(scan = ?self.config.scan_duration))]
    async fn request_interactive(&self, filter: &SelectionFilter) -> Result<PeripheralRef> {
        info!("Scanning for peripherals...");
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(self.config.scan_duration).await;
        self.adapter.stop_scan().await?;

        let candidates: Vec<Candidate> = self
            .refresh()
            .await?
            .into_iter()
            .filter_map(|(peripheral, properties)| {
                let properties = properties?;
                let offered = filter.matches_name(peripheral.name.as_deref())
                    && filter.matches_services(&properties.services);
                offered.then_some(Candidate {
                    peripheral,
                    rssi: properties.rssi,
                })
            })
            .collect();
        debug!("Found {} matching peripherals", candidates.len());

        if candidates.is_empty() {
            return Err(Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
                duration: self.config.scan_duration,
            }));
        }
        self.chooser.choose(candidates).await
    }

    async fn enumerate_granted(&self) -> Result<Vec<PeripheralRef>> {
        Ok(self
            .refresh()
            .await?
            .into_iter()
            .map(|(peripheral, _)| peripheral)
            .collect())
    }

    #[tracing::instrument(level = "info", skip_all, fields(peripheral = %reference.id))]
    async fn connect(&self, reference: &PeripheralRef) -> Result<ServerHandle> {
        let peripheral = self.peripheral(reference).await?;
        let budget = self.config.connect_timeout;

        if !peripheral.is_connected().await? {
            info!("Connecting to peripheral...");
            timeout(budget, peripheral.connect())
                .await
                .map_err(|_| Error::timeout("connect to peripheral", budget))??;
        }

        debug!("Discovering services...");
        timeout(budget, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", budget))??;
        debug!("Found {} services", peripheral.services().len());

        Ok(ServerHandle {
            peripheral: reference.clone(),
        })
    }

    async fn resolve_service(&self, server: &ServerHandle, service: Uuid) -> Result<ServiceHandle> {
        let peripheral = self.peripheral(&server.peripheral).await?;
        if !peripheral.services().iter().any(|s| s.uuid == service) {
            return Err(Error::service_not_found(service));
        }
        Ok(ServiceHandle {
            peripheral: server.peripheral.clone(),
            uuid: service,
        })
    }

    async fn resolve_characteristic(
        &self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle> {
        let peripheral = self.peripheral(&service.peripheral).await?;
        let found = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .is_some_and(|s| s.characteristics.iter().any(|c| c.uuid == characteristic));
        if !found {
            return Err(Error::characteristic_not_found(characteristic, service.uuid));
        }
        Ok(CharacteristicHandle {
            peripheral: service.peripheral.clone(),
            service: service.uuid,
            uuid: characteristic,
        })
    }

    async fn subscribe(
        &self,
        handle: &CharacteristicHandle,
        on_payload: PayloadCallback,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(handle).await?;
        peripheral.subscribe(&characteristic).await?;

        let mut stream = peripheral.notifications().await?;
        let uuid = characteristic.uuid;
        let pump = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == uuid {
                    on_payload(&notification.value);
                }
            }
        });

        let key = handle.to_string();
        if let Some(previous) = lock(&self.pumps).insert(key, pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        self.stop_pump(&handle.to_string());
        let (peripheral, characteristic) = self.characteristic(handle).await?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self, reference: &PeripheralRef) -> Result<()> {
        self.stop_pumps_for(reference);
        let peripheral = self.peripheral(reference).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    fn on_disconnect(&self, peripheral: &PeripheralRef, callback: DisconnectCallback) -> Unregister {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        lock(&self.observers)
            .entry(peripheral.id.clone())
            .or_default()
            .push((token, callback));

        let observers = Arc::clone(&self.observers);
        let id = peripheral.id.clone();
        Unregister::new(move || {
            if let Some(entries) = lock(&observers).get_mut(&id) {
                entries.retain(|(t, _)| *t != token);
            }
        })
    }
}

impl fmt::Debug for BtleTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleTransport")
            .field("config", &self.config)
            .field("known", &lock(&self.known).len())
            .finish_non_exhaustive()
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.event_task.abort();
        for (_, pump) in lock(&self.pumps).drain() {
            pump.abort();
        }
    }
}

fn dispatch_disconnect(
    known: &Mutex<HashMap<String, Peripheral>>,
    observers: &Mutex<Observers>,
    id: &PeripheralId,
) {
    let key = lock(known)
        .iter()
        .find(|(_, peripheral)| peripheral.id() == *id)
        .map(|(key, _)| key.clone())
        .unwrap_or_else(|| format_peripheral_id(id));

    // Callbacks may drop their own registration; never call them under the lock.
    let callbacks: Vec<DisconnectCallback> = lock(observers)
        .get(&key)
        .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
        .unwrap_or_default();

    if callbacks.is_empty() {
        debug!(peripheral = %key, "Disconnect event without observers");
        return;
    }
    warn!(peripheral = %key, "Peripheral disconnected");
    for callback in callbacks {
        callback();
    }
}

/// Build a [`PeripheralRef`] from a btleplug peripheral.
///
/// The Bluetooth address is the identifier where the platform exposes one;
/// macOS reports `00:00:00:00:00:00` and gets the peripheral UUID instead.
fn describe(peripheral: &Peripheral, properties: Option<&PeripheralProperties>) -> PeripheralRef {
    let address = properties.map(|p| p.address.to_string());
    let id = match address {
        Some(address) if address != "00:00:00:00:00:00" => address,
        _ => format_peripheral_id(&peripheral.id()),
    };
    PeripheralRef {
        id,
        name: properties.and_then(|p| p.local_name.clone()),
    }
}

/// Format a peripheral ID without the `PeripheralId(...)` wrapper.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, rssi: Option<i16>) -> Candidate {
        Candidate {
            peripheral: PeripheralRef::new(id),
            rssi,
        }
    }

    #[tokio::test]
    async fn test_strongest_signal_chooser() {
        let chosen = StrongestSignal
            .choose(vec![
                candidate("far", Some(-90)),
                candidate("unknown", None),
                candidate("near", Some(-40)),
            ])
            .await
            .unwrap();
        assert_eq!(chosen.id, "near");
    }

    #[tokio::test]
    async fn test_strongest_signal_with_no_candidates() {
        assert!(matches!(
            StrongestSignal.choose(Vec::new()).await,
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_candidate_display() {
        let c = Candidate {
            peripheral: PeripheralRef::with_name("AA:BB", "Tag"),
            rssi: Some(-60),
        };
        assert_eq!(c.to_string(), "Tag (AA:BB) [-60 dBm]");
        assert_eq!(candidate("AA:BB", None).to_string(), "AA:BB");
    }
}
