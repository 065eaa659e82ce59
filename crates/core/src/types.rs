//! Shared mesh data model.
//!
//! Devices and messages are the two records every other crate passes around.
//! Routes and connections are derived artifacts and live in the mesh crate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stable identifier of a physical device, shared by every transport.
pub type DeviceId = String;

/// Unique message identifier.
pub type MessageId = String;

/// Short-range (and fallback) transports a device can be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportType {
    /// Bluetooth Low Energy
    Bluetooth,
    /// Wi-Fi Direct (P2P)
    WifiDirect,
    /// Local hotspot
    Hotspot,
    /// Internet relay
    Internet,
}

impl TransportType {
    /// All transports, in declaration order.
    pub const ALL: [TransportType; 4] = [
        TransportType::Bluetooth,
        TransportType::WifiDirect,
        TransportType::Hotspot,
        TransportType::Internet,
    ];

    /// Base link cost before signal and availability penalties.
    pub fn base_cost(self) -> u32 {
        match self {
            TransportType::Bluetooth => 10,
            TransportType::WifiDirect => 5,
            TransportType::Hotspot => 3,
            TransportType::Internet => 1,
        }
    }

    /// Nominal one-hop latency in milliseconds.
    pub fn latency_ms(self) -> u64 {
        match self {
            TransportType::Bluetooth => 100,
            TransportType::WifiDirect => 50,
            TransportType::Hotspot => 30,
            TransportType::Internet => 200,
        }
    }

    /// Nominal per-hop delivery reliability.
    pub fn reliability(self) -> f64 {
        match self {
            TransportType::Bluetooth => 0.8,
            TransportType::WifiDirect => 0.9,
            TransportType::Hotspot => 0.95,
            TransportType::Internet => 0.7,
        }
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Bluetooth => "BLUETOOTH",
            TransportType::WifiDirect => "WIFI_DIRECT",
            TransportType::Hotspot => "HOTSPOT",
            TransportType::Internet => "INTERNET",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Bluetooth => "bluetooth",
            TransportType::WifiDirect => "wifi-direct",
            TransportType::Hotspot => "hotspot",
            TransportType::Internet => "internet",
        };
        f.write_str(name)
    }
}

/// Capabilities a device advertises to the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceCapability {
    /// Bluetooth LE radio
    BluetoothLe,
    /// Wi-Fi Direct radio
    WifiDirect,
    /// Can host a local hotspot
    Hotspot,
    /// Can relay to the internet
    InternetRelay,
    /// Offers store-and-forward storage
    MessageStore,
}

/// Weakest signal strength a device record may carry.
pub const MIN_SIGNAL_STRENGTH: i32 = -127;

/// Strongest signal strength a device record may carry.
pub const MAX_SIGNAL_STRENGTH: i32 = 0;

/// Clamp a reported signal into `[MIN_SIGNAL_STRENGTH, MAX_SIGNAL_STRENGTH]`.
pub fn clamp_signal(signal: i32) -> i32 {
    signal.clamp(MIN_SIGNAL_STRENGTH, MAX_SIGNAL_STRENGTH)
}

/// Identity record for a device observed on one or more transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device identifier
    pub id: DeviceId,
    /// Human readable name
    pub name: String,
    /// Hardware address per transport (MAC, IP, ...)
    #[serde(default)]
    pub addresses: BTreeMap<TransportType, String>,
    /// Last observation (Unix epoch milliseconds)
    pub last_seen: u64,
    /// Signal strength estimate in dBm; stronger is closer to zero
    pub signal_strength: i32,
    /// Whether the device currently answers on any transport
    pub is_online: bool,
    /// Transports the device is reachable over
    #[serde(default)]
    pub transports: BTreeSet<TransportType>,
    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: BTreeSet<DeviceCapability>,
    /// Encoded public key bundle, if the device advertises one
    #[serde(default)]
    pub public_key: Option<String>,
}

impl Device {
    /// Create an online device seen now on a single transport.
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>, transport: TransportType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            addresses: BTreeMap::new(),
            last_seen: current_timestamp_ms(),
            signal_strength: 0,
            is_online: true,
            transports: BTreeSet::from([transport]),
            capabilities: BTreeSet::new(),
            public_key: None,
        }
    }

    /// Set the signal strength.
    pub fn with_signal(mut self, signal_strength: i32) -> Self {
        self.signal_strength = signal_strength;
        self
    }

    /// Add a supported transport.
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transports.insert(transport);
        self
    }

    /// Add a capability.
    pub fn with_capability(mut self, capability: DeviceCapability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Override the last-seen timestamp.
    pub fn with_last_seen(mut self, last_seen: u64) -> Self {
        self.last_seen = last_seen;
        self
    }

    /// Set the online flag.
    pub fn with_online(mut self, is_online: bool) -> Self {
        self.is_online = is_online;
        self
    }

    /// Transports both devices support.
    pub fn common_transports(&self, other: &Device) -> BTreeSet<TransportType> {
        self.transports
            .intersection(&other.transports)
            .copied()
            .collect()
    }

    /// Best transport for talking to this device directly.
    ///
    /// Bluetooth when the signal is strong, then Wi-Fi Direct, then hotspot,
    /// then whatever the device supports first.
    pub fn preferred_transport(&self) -> Option<TransportType> {
        if self.transports.contains(&TransportType::Bluetooth) && self.signal_strength > -60 {
            return Some(TransportType::Bluetooth);
        }
        if self.transports.contains(&TransportType::WifiDirect) && self.signal_strength > -70 {
            return Some(TransportType::WifiDirect);
        }
        if self.transports.contains(&TransportType::Hotspot) {
            return Some(TransportType::Hotspot);
        }
        self.transports.iter().next().copied()
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Persisted and waiting for a delivery attempt
    Pending,
    /// Handed to the next hop
    Sent,
    /// Confirmed at the destination
    Delivered,
    /// Hop budget exhausted
    Failed,
    /// Time-to-live elapsed
    Expired,
}

impl MessageStatus {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Expired => "EXPIRED",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(MessageStatus::Pending),
            "SENT" => Some(MessageStatus::Sent),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "FAILED" => Some(MessageStatus::Failed),
            "EXPIRED" => Some(MessageStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::Failed | MessageStatus::Expired
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default hop budget for new messages.
pub const DEFAULT_MAX_HOPS: u32 = 5;

/// Unit of mesh traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,
    /// Plaintext for control messages, serialized envelope otherwise
    pub content: String,
    /// Originating device
    pub sender_id: DeviceId,
    /// Final destination
    pub receiver_id: DeviceId,
    /// Creation time (Unix epoch milliseconds)
    pub timestamp: u64,
    /// Whether `content` is an encrypted envelope
    pub is_encrypted: bool,
    /// Delivery attempts and relays so far
    pub hop_count: u32,
    /// Hop budget
    pub max_hops: u32,
    /// Lifecycle state
    pub status: MessageStatus,
    /// Devices that relayed this message
    #[serde(default)]
    pub route: Vec<DeviceId>,
    /// Transport chosen at send time
    pub transport: TransportType,
}

impl Message {
    /// Create a pending message with a fresh id.
    pub fn new(
        sender_id: impl Into<DeviceId>,
        receiver_id: impl Into<DeviceId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            timestamp: current_timestamp_ms(),
            is_encrypted: false,
            hop_count: 0,
            max_hops: DEFAULT_MAX_HOPS,
            status: MessageStatus::Pending,
            route: Vec::new(),
            transport: TransportType::Bluetooth,
        }
    }

    /// Mark the content as an encrypted envelope.
    pub fn encrypted(mut self) -> Self {
        self.is_encrypted = true;
        self
    }

    /// Set the hop budget.
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Set the transport.
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the hop budget is used up.
    pub fn hops_exhausted(&self) -> bool {
        self.hop_count >= self.max_hops
    }

    /// Age relative to `now_ms`; zero for timestamps in the future.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

/// Current time in Unix epoch milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
