//! Discovery merge.
//!
//! Each transport reports its own snapshot of visible devices. The merge keeps
//! the latest snapshot per transport and folds them into one record per device
//! id: transports, capabilities and addresses are unioned, signal and last-seen
//! take the maximum, and a device is online if any source says so.
//!
//! Every observe or prune publishes the full merged set on a watch channel.
//! Subscribers only ever see the latest set; intermediate sets may be skipped.

use hybridmesh_core::{clamp_signal, Device, DeviceId, TransportType};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Merged device set, sorted by id.
pub type DeviceSnapshot = Arc<Vec<Device>>;

/// Pure merge state: the last snapshot reported by every transport.
#[derive(Debug, Default)]
pub struct DiscoveryMerge {
    sources: BTreeMap<TransportType, BTreeMap<DeviceId, Device>>,
}

impl DiscoveryMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot reported by `transport`.
    ///
    /// Entries with an empty id, or whose key disagrees with the device id,
    /// are dropped. Signal strengths are clamped to the representable range.
    pub fn observe(&mut self, transport: TransportType, snapshot: HashMap<DeviceId, Device>) {
        let mut accepted = BTreeMap::new();
        for (key, mut device) in snapshot {
            if device.id.trim().is_empty() || key != device.id {
                warn!(
                    transport = %transport,
                    key = %key,
                    device_id = %device.id,
                    "Dropping malformed discovery entry"
                );
                continue;
            }
            let signal = clamp_signal(device.signal_strength);
            if signal != device.signal_strength {
                debug!(
                    transport = %transport,
                    device_id = %device.id,
                    reported = device.signal_strength,
                    "Clamped out-of-range signal"
                );
                device.signal_strength = signal;
            }
            accepted.insert(key, device);
        }
        debug!(transport = %transport, devices = accepted.len(), "Discovery snapshot");
        self.sources.insert(transport, accepted);
    }

    /// Remove devices whose merged last-seen is older than `now_ms - staleness_ms`.
    ///
    /// Returns the pruned ids.
    pub fn prune(&mut self, now_ms: u64, staleness_ms: u64) -> Vec<DeviceId> {
        let cutoff = now_ms.saturating_sub(staleness_ms);
        let stale: Vec<DeviceId> = self
            .merged()
            .into_iter()
            .filter(|device| device.last_seen < cutoff)
            .map(|device| device.id)
            .collect();

        if !stale.is_empty() {
            for devices in self.sources.values_mut() {
                for id in &stale {
                    devices.remove(id);
                }
            }
            info!(count = stale.len(), "Pruned stale devices");
        }
        stale
    }

    /// One record per device id.
    pub fn merged(&self) -> Vec<Device> {
        let mut merged: BTreeMap<DeviceId, Device> = BTreeMap::new();
        for devices in self.sources.values() {
            for device in devices.values() {
                match merged.get_mut(&device.id) {
                    Some(existing) => merge_into(existing, device),
                    None => {
                        merged.insert(device.id.clone(), device.clone());
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }
}

fn merge_into(existing: &mut Device, other: &Device) {
    // Descriptive fields follow the freshest observation.
    if other.last_seen > existing.last_seen {
        if !other.name.is_empty() {
            existing.name = other.name.clone();
        }
        if other.public_key.is_some() {
            existing.public_key = other.public_key.clone();
        }
        existing.last_seen = other.last_seen;
    } else if existing.public_key.is_none() {
        existing.public_key = other.public_key.clone();
    }

    existing.signal_strength = existing.signal_strength.max(other.signal_strength);
    existing.is_online |= other.is_online;
    existing.transports.extend(other.transports.iter().copied());
    existing.capabilities.extend(other.capabilities.iter().copied());
    for (transport, address) in &other.addresses {
        existing
            .addresses
            .entry(*transport)
            .or_insert_with(|| address.clone());
    }
}

/// Shared discovery front-end publishing merged snapshots.
#[derive(Debug)]
pub struct Discovery {
    merge: Mutex<DiscoveryMerge>,
    tx: watch::Sender<DeviceSnapshot>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(Vec::new()));
        Self {
            merge: Mutex::new(DiscoveryMerge::new()),
            tx,
        }
    }

    /// Record a transport snapshot and publish the merged set.
    pub fn observe(&self, transport: TransportType, snapshot: HashMap<DeviceId, Device>) -> DeviceSnapshot {
        let merged = {
            let mut merge = self.lock();
            merge.observe(transport, snapshot);
            Arc::new(merge.merged())
        };
        self.tx.send_replace(Arc::clone(&merged));
        merged
    }

    /// Prune stale devices; publishes only if something was removed.
    pub fn prune(&self, now_ms: u64, staleness_ms: u64) -> Vec<DeviceId> {
        let (pruned, merged) = {
            let mut merge = self.lock();
            let pruned = merge.prune(now_ms, staleness_ms);
            (pruned, Arc::new(merge.merged()))
        };
        if !pruned.is_empty() {
            self.tx.send_replace(merged);
        }
        pruned
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.tx.send_replace(Arc::new(Vec::new()));
    }

    /// Latest merged set.
    pub fn current(&self) -> DeviceSnapshot {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.tx.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DiscoveryMerge> {
        match self.merge.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridmesh_core::DeviceCapability;
    use std::collections::BTreeSet;

    fn snapshot(devices: Vec<Device>) -> HashMap<DeviceId, Device> {
        devices.into_iter().map(|d| (d.id.clone(), d)).collect()
    }

    #[test]
    fn test_merge_unions_and_takes_max() {
        let mut merge = DiscoveryMerge::new();

        let ble = Device::new("phone-a", "Phone A", TransportType::Bluetooth)
            .with_signal(-70)
            .with_last_seen(1_000)
            .with_online(false)
            .with_capability(DeviceCapability::BluetoothLe);
        let wfd = Device::new("phone-a", "Phone A (P2P)", TransportType::WifiDirect)
            .with_signal(-50)
            .with_last_seen(2_000)
            .with_capability(DeviceCapability::WifiDirect)
            .with_capability(DeviceCapability::BluetoothLe);

        merge.observe(TransportType::Bluetooth, snapshot(vec![ble]));
        merge.observe(TransportType::WifiDirect, snapshot(vec![wfd]));

        let merged = merge.merged();
        assert_eq!(merged.len(), 1);
        let device = &merged[0];
        assert_eq!(device.signal_strength, -50);
        assert_eq!(device.last_seen, 2_000);
        assert!(device.is_online);
        assert_eq!(device.name, "Phone A (P2P)");
        assert_eq!(
            device.transports,
            BTreeSet::from([TransportType::Bluetooth, TransportType::WifiDirect])
        );
        assert_eq!(
            device.capabilities,
            BTreeSet::from([DeviceCapability::BluetoothLe, DeviceCapability::WifiDirect])
        );
    }

    #[test]
    fn test_one_record_per_id() {
        let mut merge = DiscoveryMerge::new();
        merge.observe(
            TransportType::Bluetooth,
            snapshot(vec![
                Device::new("a", "A", TransportType::Bluetooth),
                Device::new("b", "B", TransportType::Bluetooth),
            ]),
        );
        merge.observe(
            TransportType::Hotspot,
            snapshot(vec![
                Device::new("b", "B", TransportType::Hotspot),
                Device::new("c", "C", TransportType::Hotspot),
            ]),
        );

        let ids: Vec<_> = merge.merged().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_new_snapshot_replaces_source() {
        let mut merge = DiscoveryMerge::new();
        merge.observe(
            TransportType::Bluetooth,
            snapshot(vec![Device::new("a", "A", TransportType::Bluetooth)]),
        );
        merge.observe(TransportType::Bluetooth, HashMap::new());
        assert!(merge.merged().is_empty());
    }

    #[test]
    fn test_malformed_entries_dropped() {
        let mut merge = DiscoveryMerge::new();
        let mut entries = HashMap::new();
        entries.insert("".to_string(), Device::new("", "nameless", TransportType::Bluetooth));
        entries.insert("alias".to_string(), Device::new("real", "R", TransportType::Bluetooth));
        entries.insert("ok".to_string(), Device::new("ok", "OK", TransportType::Bluetooth));

        merge.observe(TransportType::Bluetooth, entries);
        let ids: Vec<_> = merge.merged().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["ok"]);
    }

    #[test]
    fn test_out_of_range_signal_clamped() {
        let mut merge = DiscoveryMerge::new();
        merge.observe(
            TransportType::WifiDirect,
            snapshot(vec![
                Device::new("loud", "Loud", TransportType::WifiDirect).with_signal(i32::MAX),
                Device::new("faint", "Faint", TransportType::WifiDirect).with_signal(i32::MIN),
            ]),
        );
        let signals: Vec<_> = merge
            .merged()
            .into_iter()
            .map(|d| (d.id, d.signal_strength))
            .collect();
        assert_eq!(
            signals,
            vec![("faint".to_string(), -127), ("loud".to_string(), 0)]
        );
    }

    #[test]
    fn test_prune_uses_merged_last_seen() {
        let mut merge = DiscoveryMerge::new();
        merge.observe(
            TransportType::Bluetooth,
            snapshot(vec![
                Device::new("old", "Old", TransportType::Bluetooth).with_last_seen(1_000),
                Device::new("split", "Split", TransportType::Bluetooth).with_last_seen(1_000),
            ]),
        );
        merge.observe(
            TransportType::WifiDirect,
            snapshot(vec![
                Device::new("split", "Split", TransportType::WifiDirect).with_last_seen(95_000)
            ]),
        );

        let pruned = merge.prune(100_000, 60_000);
        assert_eq!(pruned, vec!["old".to_string()]);

        let ids: Vec<_> = merge.merged().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["split"]);
    }

    #[tokio::test]
    async fn test_discovery_publishes_snapshots() {
        let discovery = Discovery::new();
        let mut rx = discovery.subscribe();

        discovery.observe(
            TransportType::Bluetooth,
            snapshot(vec![Device::new("a", "A", TransportType::Bluetooth).with_last_seen(10)]),
        );
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        assert!(discovery.prune(10, 60_000).is_empty());
        assert!(!rx.has_changed().unwrap());

        discovery.prune(100_000, 60_000);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }
}
