//! Normalized events from the sensing adapters.
//!
//! Adapters own the raw OS sensing. They reduce it to the discrete values in
//! this module and push them into the core over `tokio::sync::mpsc`
//! channels; the receiving task ends when every sender is dropped or its
//! join handle is aborted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerStatus::Connected => f.write_str("connected"),
            PowerStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Current external power reading.
pub trait PowerSource: Send + Sync {
    fn current(&self) -> PowerStatus;
}

/// A `PowerSource` holding whatever the adapter reported last.
#[derive(Debug)]
pub struct LatestPower {
    connected: AtomicBool,
}

impl LatestPower {
    pub fn new(initial: PowerStatus) -> Self {
        Self {
            connected: AtomicBool::new(initial == PowerStatus::Connected),
        }
    }

    pub fn set(&self, status: PowerStatus) {
        self.connected
            .store(status == PowerStatus::Connected, Ordering::Release);
    }
}

impl PowerSource for LatestPower {
    fn current(&self) -> PowerStatus {
        if self.connected.load(Ordering::Acquire) {
            PowerStatus::Connected
        } else {
            PowerStatus::Disconnected
        }
    }
}

// ---------------------------------------------------------------------------
// AutoArmSignal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Location,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    LeftTrustedLocation,
    EnteredTrustedLocation,
    JoinedUntrustedNetwork,
    JoinedTrustedNetwork,
    NetworkLost,
}

/// One environmental observation. Consumed immediately by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoArmSignal {
    pub source: SignalSource,
    pub kind: SignalKind,
    /// Location name or network SSID.
    pub label: String,
}

impl AutoArmSignal {
    pub fn left_location(label: impl Into<String>) -> Self {
        Self {
            source: SignalSource::Location,
            kind: SignalKind::LeftTrustedLocation,
            label: label.into(),
        }
    }

    pub fn entered_location(label: impl Into<String>) -> Self {
        Self {
            source: SignalSource::Location,
            kind: SignalKind::EnteredTrustedLocation,
            label: label.into(),
        }
    }

    pub fn network(kind: SignalKind, ssid: impl Into<String>) -> Self {
        Self {
            source: SignalSource::Network,
            kind,
            label: ssid.into(),
        }
    }

    /// Human-readable reason used when this signal arms protection.
    pub fn describe(&self) -> String {
        match self.kind {
            SignalKind::LeftTrustedLocation => format!("left trusted location '{}'", self.label),
            SignalKind::EnteredTrustedLocation => {
                format!("entered trusted location '{}'", self.label)
            }
            SignalKind::JoinedUntrustedNetwork => {
                format!("joined untrusted network '{}'", self.label)
            }
            SignalKind::JoinedTrustedNetwork => format!("joined trusted network '{}'", self.label),
            SignalKind::NetworkLost => "network connection lost".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trusted networks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustedNetworks {
    ssids: Vec<String>,
}

impl TrustedNetworks {
    pub fn new(ssids: Vec<String>) -> Self {
        Self { ssids }
    }

    pub fn contains(&self, ssid: &str) -> bool {
        self.ssids.iter().any(|s| s == ssid)
    }

    pub fn is_empty(&self) -> bool {
        self.ssids.is_empty()
    }

    /// Turn a Wi-Fi association change into a signal. `None` means the
    /// interface lost its network.
    pub fn classify(&self, ssid: Option<&str>) -> AutoArmSignal {
        match ssid {
            None => AutoArmSignal::network(SignalKind::NetworkLost, ""),
            Some(s) if self.contains(s) => {
                AutoArmSignal::network(SignalKind::JoinedTrustedNetwork, s)
            }
            Some(s) => AutoArmSignal::network(SignalKind::JoinedUntrustedNetwork, s),
        }
    }
}

// ---------------------------------------------------------------------------
// Trusted locations
// ---------------------------------------------------------------------------

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedLocation {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_radius")]
    pub radius_meters: f64,
}

fn default_radius() -> f64 {
    100.0
}

impl TrustedLocation {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        haversine_meters(self.latitude, self.longitude, latitude, longitude) <= self.radius_meters
    }
}

fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Emits a location signal only when the fix crosses a trusted boundary.
#[derive(Debug, Clone)]
pub struct LocationTracker {
    locations: Vec<TrustedLocation>,
    /// `None` before the first fix; `Some(None)` when outside all locations.
    inside: Option<Option<String>>,
}

impl LocationTracker {
    pub fn new(locations: Vec<TrustedLocation>) -> Self {
        Self {
            locations,
            inside: None,
        }
    }

    /// Feed a position fix. The first fix only establishes a baseline.
    pub fn update(&mut self, latitude: f64, longitude: f64) -> Option<AutoArmSignal> {
        let now_inside = self
            .locations
            .iter()
            .find(|l| l.contains(latitude, longitude))
            .map(|l| l.name.clone());

        let previous = self.inside.replace(now_inside.clone())?;
        match (previous, now_inside) {
            (Some(left), None) => Some(AutoArmSignal::left_location(left)),
            (None, Some(entered)) => Some(AutoArmSignal::entered_location(entered)),
            (Some(left), Some(entered)) if left != entered => {
                Some(AutoArmSignal::entered_location(entered))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
