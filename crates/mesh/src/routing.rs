//! Routing engine.
//!
//! `update_topology` turns a device set into a directed connection graph and
//! precomputes single-source shortest paths from every device. Lookups are pure
//! reads against the last computed snapshot; a new snapshot is built off to the
//! side and swapped in whole.
//!
//! # Costs
//!
//! Connections carry a link cost (base transport cost plus signal and
//! availability penalties) used for reporting. Path search weighs each edge as
//! `100 - signal`, with the signal clamped to `[-127, 0]`, so that stronger
//! links are cheaper; a route's total cost is the sum of those edge weights.
//! Edge weights stay within `[100, 227]`; distance sums saturate.
//!
//! # Tie-break
//!
//! Dijkstra pops the smallest `(distance, device id)` pair and only relaxes on a
//! strict improvement. Among equal-cost paths the one whose frontier reached the
//! lexicographically smaller device first wins, independent of input order.

use hybridmesh_core::{clamp_signal, Device, DeviceId, TransportType, MAX_SIGNAL_STRENGTH};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Base weight of every edge during path search.
const EDGE_BASE_WEIGHT: u32 = 100;

/// Signal assumed for transports with no signal-derived estimate.
const DEFAULT_CONNECTION_SIGNAL: i32 = -70;

/// Directed link between two devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: DeviceId,
    pub to: DeviceId,
    pub transport: TransportType,
    /// Transport-specific signal estimate for the link
    pub signal_strength: i32,
    /// Both endpoints online
    pub is_active: bool,
    /// Latest observation of either endpoint (Unix epoch milliseconds)
    pub last_probe: u64,
    /// Link cost: base transport cost plus penalties
    pub cost: u32,
}

impl Connection {
    /// Build the connection from `a` to `b`, or `None` if they share no transport.
    pub fn between(a: &Device, b: &Device) -> Option<Self> {
        let transport = select_transport(a, b)?;
        let signal_strength = connection_signal(transport, a, b);
        Some(Self {
            from: a.id.clone(),
            to: b.id.clone(),
            transport,
            signal_strength,
            is_active: a.is_online && b.is_online,
            last_probe: a.last_seen.max(b.last_seen),
            cost: connection_cost(transport, signal_strength, a.is_online && b.is_online),
        })
    }

    /// Edge weight used by path search.
    pub fn weight(&self) -> u32 {
        EDGE_BASE_WEIGHT + (MAX_SIGNAL_STRENGTH - clamp_signal(self.signal_strength)).unsigned_abs()
    }
}

/// Transport for a link: Bluetooth when both ends are strong, then Wi-Fi
/// Direct, then hotspot, then the first shared transport.
pub fn select_transport(a: &Device, b: &Device) -> Option<TransportType> {
    let common = a.common_transports(b);
    let weakest = a.signal_strength.min(b.signal_strength);

    if common.contains(&TransportType::Bluetooth) && weakest > -60 {
        return Some(TransportType::Bluetooth);
    }
    if common.contains(&TransportType::WifiDirect) && weakest > -70 {
        return Some(TransportType::WifiDirect);
    }
    if common.contains(&TransportType::Hotspot) {
        return Some(TransportType::Hotspot);
    }
    common.into_iter().next()
}

/// Bluetooth is limited by the weaker end, Wi-Fi Direct averages both ends
/// and a hotspot is as good as the stronger end.
pub fn connection_signal(transport: TransportType, a: &Device, b: &Device) -> i32 {
    let (a, b) = (clamp_signal(a.signal_strength), clamp_signal(b.signal_strength));
    match transport {
        TransportType::Bluetooth => a.min(b),
        TransportType::WifiDirect => ((i64::from(a) + i64::from(b)) / 2) as i32,
        TransportType::Hotspot => a.max(b),
        TransportType::Internet => DEFAULT_CONNECTION_SIGNAL,
    }
}

/// Base transport cost plus a signal penalty, plus 5 when an end is offline.
pub fn connection_cost(transport: TransportType, signal: i32, both_online: bool) -> u32 {
    let signal_penalty = match signal {
        s if s > -50 => 0,
        s if s > -60 => 2,
        s if s > -70 => 5,
        s if s > -80 => 10,
        _ => 20,
    };
    let offline_penalty = if both_online { 0 } else { 5 };
    transport.base_cost() + signal_penalty + offline_penalty
}

/// One traversed edge of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// Device reached by this hop
    pub device_id: DeviceId,
    pub transport: TransportType,
    /// Edge weight contributed to the route cost
    pub cost: u32,
    /// Link cost of the underlying connection
    pub link_cost: u32,
    pub latency_ms: u64,
}

/// Path from a source to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub source: DeviceId,
    pub destination: DeviceId,
    pub hops: Vec<Hop>,
    /// Sum of hop costs
    pub total_cost: u32,
    /// Sum of hop latencies
    pub estimated_delivery_ms: u64,
    /// Estimated probability of delivery, in [0, 1]
    pub reliability: f64,
}

impl Route {
    fn from_hops(source: &str, destination: &str, hops: Vec<Hop>) -> Self {
        let total_cost = hops.iter().fold(0u32, |sum, h| sum.saturating_add(h.cost));
        let estimated_delivery_ms = hops.iter().map(|h| h.latency_ms).sum();
        let reliability = route_reliability(&hops);
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            hops,
            total_cost,
            estimated_delivery_ms,
            reliability,
        }
    }

    /// First device after the source.
    pub fn next_hop(&self) -> Option<&Hop> {
        self.hops.first()
    }

    /// Devices strictly between source and destination.
    pub fn intermediate_devices(&self) -> impl Iterator<Item = &DeviceId> {
        let relays = self.hops.len().saturating_sub(1);
        self.hops[..relays].iter().map(|h| &h.device_id)
    }

    /// Device ids traversed after the source, destination included.
    pub fn hop_ids(&self) -> Vec<DeviceId> {
        self.hops.iter().map(|h| h.device_id.clone()).collect()
    }

    pub fn is_direct(&self) -> bool {
        self.hops.len() == 1
    }
}

/// Mean transport reliability scaled by a bucket keyed on average hop cost.
fn route_reliability(hops: &[Hop]) -> f64 {
    if hops.is_empty() {
        return 0.0;
    }
    let count = hops.len() as f64;
    let transport_reliability =
        hops.iter().map(|h| h.transport.reliability()).sum::<f64>() / count;
    let average_cost = hops.iter().map(|h| h.cost as f64).sum::<f64>() / count;

    let signal_reliability = if average_cost < 150.0 {
        1.0
    } else if average_cost < 160.0 {
        0.9
    } else if average_cost < 170.0 {
        0.7
    } else if average_cost < 180.0 {
        0.5
    } else {
        0.3
    };

    (transport_reliability * signal_reliability).clamp(0.0, 1.0)
}

/// Shortest-path tree from one source.
#[derive(Debug, Clone, Default)]
struct PathTree {
    distance: BTreeMap<DeviceId, u32>,
    /// device -> (predecessor, connection index)
    previous: BTreeMap<DeviceId, (DeviceId, usize)>,
}

#[derive(Debug, Default)]
struct Exclusions {
    devices: BTreeSet<DeviceId>,
    edges: BTreeSet<(DeviceId, DeviceId)>,
}

/// Immutable result of one topology update.
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    devices: BTreeMap<DeviceId, Device>,
    connections: Vec<Connection>,
    /// device -> sorted (neighbor, connection index)
    adjacency: BTreeMap<DeviceId, Vec<(DeviceId, usize)>>,
    trees: BTreeMap<DeviceId, PathTree>,
}

impl RoutingSnapshot {
    /// Build the connection graph and every per-source path tree.
    pub fn build(devices: &[Device]) -> Self {
        let devices: BTreeMap<DeviceId, Device> = devices
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect();

        let mut connections = Vec::new();
        let mut adjacency: BTreeMap<DeviceId, Vec<(DeviceId, usize)>> = BTreeMap::new();
        for a in devices.values() {
            for b in devices.values() {
                if a.id == b.id {
                    continue;
                }
                if let Some(connection) = Connection::between(a, b) {
                    adjacency
                        .entry(a.id.clone())
                        .or_default()
                        .push((b.id.clone(), connections.len()));
                    connections.push(connection);
                }
            }
        }

        let mut snapshot = Self {
            devices,
            connections,
            adjacency,
            trees: BTreeMap::new(),
        };
        let no_exclusions = Exclusions::default();
        let trees = snapshot
            .devices
            .keys()
            .map(|id| (id.clone(), snapshot.dijkstra(id, &no_exclusions)))
            .collect();
        snapshot.trees = trees;
        snapshot
    }

    fn dijkstra(&self, source: &str, exclusions: &Exclusions) -> PathTree {
        let mut tree = PathTree::default();
        let mut settled = BTreeSet::new();
        let mut heap = BinaryHeap::new();

        tree.distance.insert(source.to_string(), 0);
        heap.push(Reverse((0u32, source.to_string())));

        while let Some(Reverse((distance, id))) = heap.pop() {
            if !settled.insert(id.clone()) {
                continue;
            }
            let Some(neighbors) = self.adjacency.get(&id) else {
                continue;
            };
            for (neighbor, index) in neighbors {
                if exclusions.devices.contains(neighbor)
                    || exclusions.edges.contains(&(id.clone(), neighbor.clone()))
                    || settled.contains(neighbor)
                {
                    continue;
                }
                let candidate = distance.saturating_add(self.connections[*index].weight());
                let improved = tree
                    .distance
                    .get(neighbor)
                    .map_or(true, |current| candidate < *current);
                if improved {
                    tree.distance.insert(neighbor.clone(), candidate);
                    tree.previous.insert(neighbor.clone(), (id.clone(), *index));
                    heap.push(Reverse((candidate, neighbor.clone())));
                }
            }
        }
        tree
    }

    fn route_from_tree(&self, tree: &PathTree, from: &str, to: &str) -> Option<Route> {
        if from == to || !tree.distance.contains_key(to) {
            return None;
        }

        let mut hops = Vec::new();
        let mut current = to.to_string();
        while current != from {
            let (previous, index) = tree.previous.get(&current)?;
            let connection = &self.connections[*index];
            hops.push(Hop {
                device_id: current.clone(),
                transport: connection.transport,
                cost: connection.weight(),
                link_cost: connection.cost,
                latency_ms: connection.transport.latency_ms(),
            });
            current = previous.clone();
        }
        hops.reverse();
        Some(Route::from_hops(from, to, hops))
    }

    pub fn find_best_route(&self, from: &str, to: &str) -> Option<Route> {
        let tree = self.trees.get(from)?;
        self.route_from_tree(tree, from, to)
    }

    /// Best route plus up to `max_routes - 1` alternates, sorted by total cost.
    ///
    /// Each alternate avoids the relay devices of every route found so far, and
    /// the direct link once a direct route has been found.
    pub fn find_alternate_routes(&self, from: &str, to: &str, max_routes: usize) -> Vec<Route> {
        if max_routes == 0 {
            return Vec::new();
        }
        let Some(best) = self.find_best_route(from, to) else {
            return Vec::new();
        };

        let mut routes = vec![best];
        while routes.len() < max_routes {
            let mut exclusions = Exclusions::default();
            for route in &routes {
                exclusions
                    .devices
                    .extend(route.intermediate_devices().cloned());
                if route.is_direct() {
                    exclusions.edges.insert((from.to_string(), to.to_string()));
                }
            }

            let tree = self.dijkstra(from, &exclusions);
            match self.route_from_tree(&tree, from, to) {
                Some(route) if !routes.iter().any(|r| r.hops == route.hops) => routes.push(route),
                _ => break,
            }
        }

        routes.sort_by_key(|r| r.total_cost);
        routes
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Devices directly connected to `id`.
    pub fn neighbors(&self, id: &str) -> Vec<DeviceId> {
        self.adjacency
            .get(id)
            .map(|n| n.iter().map(|(neighbor, _)| neighbor.clone()).collect())
            .unwrap_or_default()
    }

    /// Per-device list of directly connected peers.
    pub fn reachability(&self) -> BTreeMap<DeviceId, Vec<DeviceId>> {
        self.devices
            .keys()
            .map(|id| (id.clone(), self.neighbors(id)))
            .collect()
    }

    /// Destinations with a route from `from`.
    pub fn reachable_from(&self, from: &str) -> Vec<DeviceId> {
        self.trees
            .get(from)
            .map(|tree| {
                tree.distance
                    .keys()
                    .filter(|id| id.as_str() != from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Thread-safe holder of the current routing snapshot.
#[derive(Debug, Default)]
pub struct RoutingEngine {
    current: RwLock<Arc<RoutingSnapshot>>,
}

impl RoutingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the graph and routing tables and swap them in.
    pub fn update_topology(&self, devices: &[Device]) -> Arc<RoutingSnapshot> {
        let snapshot = Arc::new(RoutingSnapshot::build(devices));
        debug!(
            devices = snapshot.devices.len(),
            connections = snapshot.connections.len(),
            "Routing tables recomputed"
        );
        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = Arc::clone(&snapshot);
        snapshot
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn find_best_route(&self, from: &str, to: &str) -> Option<Route> {
        self.snapshot().find_best_route(from, to)
    }

    pub fn find_alternate_routes(&self, from: &str, to: &str, max_routes: usize) -> Vec<Route> {
        self.snapshot().find_alternate_routes(from, to, max_routes)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.snapshot().connections().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, signal: i32, transports: &[TransportType]) -> Device {
        let mut device = Device::new(id, id.to_uppercase(), transports[0]).with_signal(signal);
        for transport in &transports[1..] {
            device = device.with_transport(*transport);
        }
        device
    }

    #[test]
    fn test_connection_cost_weak_bluetooth() {
        let a = device("a", -45, &[TransportType::Bluetooth, TransportType::WifiDirect]);
        let b = device("b", -80, &[TransportType::Bluetooth]);

        let connection = Connection::between(&a, &b).unwrap();
        assert_eq!(connection.transport, TransportType::Bluetooth);
        assert_eq!(connection.signal_strength, -80);
        assert_eq!(connection.cost, 30);

        let snapshot = RoutingSnapshot::build(&[a, b]);
        let route = snapshot.find_best_route("a", "b").unwrap();
        assert!(route.reliability < 0.5, "reliability {} should be poor", route.reliability);
        assert!((route.reliability - 0.24).abs() < 1e-9);
    }

    #[test]
    fn test_transport_priority() {
        let a = device("a", -55, &[TransportType::Bluetooth, TransportType::WifiDirect, TransportType::Hotspot]);
        let b = device("b", -55, &[TransportType::Bluetooth, TransportType::WifiDirect, TransportType::Hotspot]);
        assert_eq!(select_transport(&a, &b), Some(TransportType::Bluetooth));

        let b = b.with_signal(-65);
        assert_eq!(select_transport(&a, &b), Some(TransportType::WifiDirect));

        let b = b.with_signal(-90);
        assert_eq!(select_transport(&a, &b), Some(TransportType::Hotspot));

        let c = device("c", -90, &[TransportType::Internet]);
        assert_eq!(select_transport(&a, &c), None);
    }

    #[test]
    fn test_offline_penalty() {
        let a = device("a", -40, &[TransportType::Hotspot]);
        let b = device("b", -40, &[TransportType::Hotspot]).with_online(false);
        let connection = Connection::between(&a, &b).unwrap();
        assert!(!connection.is_active);
        assert_eq!(connection.cost, 3 + 5);
    }

    #[test]
    fn test_no_connection_without_common_transport() {
        let snapshot = RoutingSnapshot::build(&[
            device("a", -40, &[TransportType::Bluetooth]),
            device("b", -40, &[TransportType::WifiDirect]),
        ]);
        assert!(snapshot.connections().is_empty());
        assert!(snapshot.find_best_route("a", "b").is_none());
    }

    #[test]
    fn test_multi_hop_route_costs() {
        // a and c only share a transport through b.
        let snapshot = RoutingSnapshot::build(&[
            device("a", -40, &[TransportType::Bluetooth]),
            device("b", -40, &[TransportType::Bluetooth, TransportType::WifiDirect]),
            device("c", -40, &[TransportType::WifiDirect]),
        ]);

        let route = snapshot.find_best_route("a", "c").unwrap();
        assert_eq!(route.hop_ids(), vec!["b", "c"]);
        assert_eq!(route.total_cost, route.hops.iter().map(|h| h.cost).sum::<u32>());
        assert_eq!(route.total_cost, 140 + 140);
        assert_eq!(route.estimated_delivery_ms, 100 + 50);
        assert_eq!(route.intermediate_devices().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_stronger_signal_preferred() {
        // a reaches d through either b (strong) or c (weak).
        let snapshot = RoutingSnapshot::build(&[
            device("a", -40, &[TransportType::Hotspot]),
            device("b", -40, &[TransportType::Hotspot, TransportType::WifiDirect]),
            device("c", -85, &[TransportType::Hotspot, TransportType::Bluetooth]),
            device("d", -40, &[TransportType::WifiDirect, TransportType::Bluetooth]),
        ]);

        let route = snapshot.find_best_route("a", "d").unwrap();
        assert_eq!(route.hop_ids(), vec!["b", "d"]);
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let devices = vec![
            device("src", -40, &[TransportType::Bluetooth]),
            device("relay-b", -40, &[TransportType::Bluetooth, TransportType::Hotspot]),
            device("relay-a", -40, &[TransportType::Bluetooth, TransportType::Hotspot]),
            device("dst", -40, &[TransportType::Hotspot]),
        ];
        let mut reversed = devices.clone();
        reversed.reverse();

        let first = RoutingSnapshot::build(&devices).find_best_route("src", "dst").unwrap();
        let second = RoutingSnapshot::build(&reversed).find_best_route("src", "dst").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.hop_ids(), vec!["relay-a", "dst"]);
    }

    #[test]
    fn test_alternate_routes_sorted_and_disjoint() {
        let snapshot = RoutingSnapshot::build(&[
            device("a", -40, &[TransportType::Bluetooth]),
            device("r1", -40, &[TransportType::Bluetooth, TransportType::Hotspot]),
            device("r2", -60, &[TransportType::Bluetooth, TransportType::Hotspot]),
            device("r3", -75, &[TransportType::Bluetooth, TransportType::Hotspot]),
            device("z", -40, &[TransportType::Hotspot]),
        ]);

        let best = snapshot.find_best_route("a", "z").unwrap();
        let routes = snapshot.find_alternate_routes("a", "z", 3);
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0], best);
        assert_eq!(routes[0].hop_ids(), vec!["r1", "z"]);
        assert_eq!(routes[1].hop_ids(), vec!["r2", "z"]);
        assert_eq!(routes[2].hop_ids(), vec!["r3", "z"]);
        for pair in routes.windows(2) {
            assert!(pair[0].total_cost <= pair[1].total_cost);
        }
        for route in &routes {
            assert!(best.total_cost <= route.total_cost);
        }
    }

    #[test]
    fn test_alternate_routes_limits() {
        let devices = [
            device("a", -40, &[TransportType::Bluetooth]),
            device("b", -40, &[TransportType::Bluetooth]),
        ];
        let snapshot = RoutingSnapshot::build(&devices);

        assert!(snapshot.find_alternate_routes("a", "b", 0).is_empty());
        assert_eq!(snapshot.find_alternate_routes("a", "b", 1).len(), 1);
        // The only path is direct; no alternate exists once it is excluded.
        assert_eq!(snapshot.find_alternate_routes("a", "b", 5).len(), 1);
        assert!(snapshot.find_alternate_routes("a", "missing", 3).is_empty());
    }

    #[test]
    fn test_out_of_range_signals_are_clamped() {
        let a = device("a", 2_000_000_000, &[TransportType::WifiDirect]);
        let b = device("b", 2_000_000_000, &[TransportType::WifiDirect]);
        let connection = Connection::between(&a, &b).unwrap();
        assert_eq!(connection.signal_strength, 0);
        assert_eq!(connection.weight(), 100);

        let snapshot = RoutingSnapshot::build(&[
            device("x", i32::MIN + 1, &[TransportType::Hotspot]),
            device("y", i32::MIN + 1, &[TransportType::Hotspot, TransportType::Bluetooth]),
            device("z", i32::MIN + 1, &[TransportType::Bluetooth]),
        ]);
        let route = snapshot.find_best_route("x", "z").unwrap();
        assert_eq!(route.hop_ids(), vec!["y", "z"]);
        assert_eq!(route.total_cost, 227 + 227);
    }

    #[test]
    fn test_weight_decreases_with_signal() {
        let weight = |signal| {
            let a = device("a", signal, &[TransportType::Hotspot]);
            let b = device("b", signal, &[TransportType::Hotspot]);
            Connection::between(&a, &b).unwrap().weight()
        };
        assert!(weight(-90) > weight(-40));
        assert!(weight(-40) > weight(0));
        assert_eq!(weight(0), weight(10));
    }

    #[test]
    fn test_route_to_self_is_none() {
        let snapshot = RoutingSnapshot::build(&[device("a", -40, &[TransportType::Bluetooth])]);
        assert!(snapshot.find_best_route("a", "a").is_none());
    }

    #[test]
    fn test_engine_swaps_snapshots() {
        let engine = RoutingEngine::new();
        assert!(engine.find_best_route("a", "b").is_none());

        let held = engine.snapshot();
        engine.update_topology(&[
            device("a", -40, &[TransportType::Bluetooth]),
            device("b", -40, &[TransportType::Bluetooth]),
        ]);

        assert!(held.find_best_route("a", "b").is_none());
        assert!(engine.find_best_route("a", "b").is_some());
        assert_eq!(engine.connections().len(), 2);
        assert_eq!(engine.snapshot().reachability()["a"], vec!["b".to_string()]);
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;
    use proptest::sample::{select, subsequence};

    const IDS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

    fn arb_device(id: &'static str) -> impl Strategy<Value = Device> {
        (
            subsequence(TransportType::ALL.to_vec(), 1..=TransportType::ALL.len()),
            prop_oneof![-127i32..=0, any::<i32>()],
            any::<bool>(),
        )
            .prop_map(move |(transports, signal, online)| {
                let mut device = Device::new(id, id.to_uppercase(), transports[0])
                    .with_signal(signal)
                    .with_online(online)
                    .with_last_seen(1_000);
                device.transports = transports.into_iter().collect();
                device
            })
    }

    fn arb_topology() -> impl Strategy<Value = Vec<Device>> {
        IDS.into_iter().map(arb_device).collect::<Vec<_>>()
    }

    /// Bellman-Ford over the connection list.
    fn shortest_distance(snapshot: &RoutingSnapshot, from: &str, to: &str) -> Option<u64> {
        let mut distance: BTreeMap<String, u64> = BTreeMap::from([(from.to_string(), 0)]);
        for _ in 0..IDS.len() {
            for connection in snapshot.connections() {
                let Some(reached) = distance.get(&connection.from).copied() else {
                    continue;
                };
                let candidate = reached + u64::from(connection.weight());
                let current = distance.entry(connection.to.clone()).or_insert(u64::MAX);
                if candidate < *current {
                    *current = candidate;
                }
            }
        }
        distance.get(to).copied()
    }

    proptest! {
        /// The best route is a shortest path and its cost is the sum of the
        /// edges it traverses.
        #[test]
        fn prop_best_route_is_shortest(
            devices in arb_topology(),
            from in select(IDS.to_vec()),
            to in select(IDS.to_vec()),
        ) {
            let snapshot = RoutingSnapshot::build(&devices);
            let best = snapshot.find_best_route(from, to);
            let expected = if from == to { None } else { shortest_distance(&snapshot, from, to) };
            prop_assert_eq!(best.as_ref().map(|route| u64::from(route.total_cost)), expected);

            let Some(best) = best else {
                return Ok(());
            };
            prop_assert_eq!(best.total_cost, best.hops.iter().map(|h| h.cost).sum::<u32>());

            let mut previous = from.to_string();
            for hop in &best.hops {
                let edge = snapshot
                    .connections()
                    .iter()
                    .find(|c| c.from == previous && c.to == hop.device_id);
                prop_assert_eq!(edge.map(|c| (c.weight(), c.transport)), Some((hop.cost, hop.transport)));
                previous = hop.device_id.clone();
            }
            prop_assert_eq!(previous.as_str(), to);
        }

        /// Alternates never beat the best route and come back sorted by cost.
        #[test]
        fn prop_alternates_bounded_by_best(
            devices in arb_topology(),
            from in select(IDS.to_vec()),
            to in select(IDS.to_vec()),
            max_routes in 1usize..5,
        ) {
            let snapshot = RoutingSnapshot::build(&devices);
            let routes = snapshot.find_alternate_routes(from, to, max_routes);
            let Some(best) = snapshot.find_best_route(from, to) else {
                prop_assert!(routes.is_empty());
                return Ok(());
            };

            prop_assert!(!routes.is_empty() && routes.len() <= max_routes);
            prop_assert_eq!(&routes[0], &best);
            for route in &routes {
                prop_assert!(best.total_cost <= route.total_cost);
                prop_assert_eq!(route.total_cost, route.hops.iter().map(|h| h.cost).sum::<u32>());
            }
            for pair in routes.windows(2) {
                prop_assert!(pair[0].total_cost <= pair[1].total_cost);
            }
        }
    }
}
