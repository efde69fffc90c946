//! MAC and IP lease tracking.
//!
//! A [`LeaseTracker`] records which values (MAC or IPv4 addresses) are
//! currently handed out and to which association. Values are unique within a
//! tracker; associations may hold any number of values. Trackers never touch
//! disk themselves: callers persist them through
//! [`crate::persistence::PersistenceStore`] after every mutation.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use anyhow::{Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::IpRange;

/// Current on-disk schema version of a tracker record.
pub const TRACKER_SCHEMA_VERSION: u32 = 1;

/// Which resource a tracker leases out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    Mac,
    Ip,
}

impl LeaseKind {
    /// Persistence key of this tracker.
    pub fn key(self) -> &'static str {
        match self {
            LeaseKind::Mac => "MACTRACK",
            LeaseKind::Ip => "IPTRACK",
        }
    }

    /// Canonical textual form of a value of this kind.
    pub fn normalize(self, value: &str) -> String {
        match self {
            LeaseKind::Mac => value.trim().to_ascii_uppercase(),
            LeaseKind::Ip => value.trim().to_string(),
        }
    }
}

impl std::fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseKind::Mac => write!(f, "MAC"),
            LeaseKind::Ip => write!(f, "IP"),
        }
    }
}

/// A single value assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub association: String,
    pub value: String,
}

/// Plain persisted form of a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerRecord {
    pub schema_version: u32,
    pub kind: LeaseKind,
    pub leases: Vec<LeaseRecord>,
}

/// In-memory lease ledger for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTracker {
    kind: LeaseKind,
    /// value -> association
    leases: BTreeMap<String, String>,
}

impl LeaseTracker {
    pub fn new(kind: LeaseKind) -> Self {
        Self {
            kind,
            leases: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.leases.contains_key(&self.kind.normalize(value))
    }

    /// Association currently holding `value`.
    pub fn owner(&self, value: &str) -> Option<&str> {
        self.leases
            .get(&self.kind.normalize(value))
            .map(String::as_str)
    }

    /// All values held by `association`.
    pub fn values_for(&self, association: &str) -> Vec<String> {
        self.leases
            .iter()
            .filter(|(_, assoc)| assoc.as_str() == association)
            .map(|(value, _)| value.clone())
            .collect()
    }

    pub fn records(&self) -> Vec<LeaseRecord> {
        self.leases
            .iter()
            .map(|(value, association)| LeaseRecord {
                association: association.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Record `value` for `association`. Returns `false` (and changes nothing)
    /// if the value is already tracked.
    pub fn add_value(&mut self, association: &str, value: &str) -> bool {
        let value = self.kind.normalize(value);
        if self.leases.contains_key(&value) {
            debug!(kind = %self.kind, value = %value, "value already tracked");
            return false;
        }
        self.leases.insert(value.clone(), association.to_string());
        debug!(kind = %self.kind, association, value = %value, "lease added");
        true
    }

    /// Record the first candidate that is not already tracked and return it.
    /// `None` means every candidate was taken.
    pub fn new_value<I>(&mut self, association: &str, candidates: I) -> Option<String>
    where
        I: IntoIterator<Item = String>,
    {
        for candidate in candidates {
            let candidate = self.kind.normalize(&candidate);
            if self.add_value(association, &candidate) {
                info!(kind = %self.kind, association, value = %candidate, "lease allocated");
                return Some(candidate);
            }
        }
        None
    }

    /// Remove `value` if it is tracked for `association`.
    pub fn retire_value(&mut self, association: &str, value: &str) -> bool {
        let value = self.kind.normalize(value);
        match self.leases.get(&value) {
            Some(owner) if owner == association => {
                self.leases.remove(&value);
                info!(kind = %self.kind, association, value = %value, "lease retired");
                true
            }
            Some(owner) => {
                debug!(
                    kind = %self.kind,
                    value = %value,
                    owner = %owner,
                    association,
                    "not retiring value held by another association"
                );
                false
            }
            None => false,
        }
    }

    /// Remove every value held by `association`. Returns how many were removed.
    pub fn retire_association(&mut self, association: &str) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, assoc| assoc != association);
        let removed = before - self.leases.len();
        if removed > 0 {
            info!(kind = %self.kind, association, removed, "association retired");
        }
        removed
    }

    /// Retire every association that is not in `known`. Returns the removed
    /// association names.
    pub fn retire_unknown_associations<'a, I>(&mut self, known: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: Vec<&str> = known.into_iter().collect();
        let mut stale: Vec<String> = self
            .leases
            .values()
            .filter(|assoc| !known.contains(&assoc.as_str()))
            .cloned()
            .collect();
        stale.sort();
        stale.dedup();
        for assoc in &stale {
            self.retire_association(assoc);
        }
        stale
    }

    pub fn to_record(&self) -> TrackerRecord {
        TrackerRecord {
            schema_version: TRACKER_SCHEMA_VERSION,
            kind: self.kind,
            leases: self.records(),
        }
    }

    /// Rebuild a tracker from its persisted form. Rejects records of another
    /// kind, unknown schema versions and duplicate values.
    pub fn from_record(kind: LeaseKind, record: TrackerRecord) -> Result<Self> {
        if record.schema_version != TRACKER_SCHEMA_VERSION {
            bail!(
                "unsupported tracker schema version {} (expected {})",
                record.schema_version,
                TRACKER_SCHEMA_VERSION
            );
        }
        if record.kind != kind {
            bail!("tracker holds {} leases, expected {}", record.kind, kind);
        }
        let mut tracker = Self::new(kind);
        for lease in record.leases {
            if !tracker.add_value(&lease.association, &lease.value) {
                bail!("duplicate {} value in tracker: {}", kind, lease.value);
            }
        }
        Ok(tracker)
    }
}

// ---------------------------------------------------------------------------
// Candidate generators
// ---------------------------------------------------------------------------

/// How many random MACs to try before giving up.
pub const MAC_ATTEMPTS: usize = 1024;

/// Parse a MAC prefix such as `A2:AA:BB` (1 to 5 octets). The first octet must
/// be unicast and locally administered.
pub fn parse_mac_prefix(prefix: &str) -> Result<Vec<u8>> {
    let octets = prefix
        .split(':')
        .map(|part| {
            if part.len() != 2 {
                bail!("bad octet '{part}' in MAC prefix '{prefix}'");
            }
            u8::from_str_radix(part, 16)
                .map_err(|_| anyhow::anyhow!("bad octet '{part}' in MAC prefix '{prefix}'"))
        })
        .collect::<Result<Vec<u8>>>()?;
    if octets.is_empty() || octets.len() > 5 {
        bail!("MAC prefix '{prefix}' must have between 1 and 5 octets");
    }
    if octets[0] & 0x01 != 0 {
        bail!("MAC prefix '{prefix}' is a multicast address");
    }
    if octets[0] & 0x02 == 0 {
        bail!("MAC prefix '{prefix}' is not locally administered");
    }
    Ok(octets)
}

/// Whether `mac` is six colon-separated hex octets.
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn format_mac(octets: &[u8]) -> String {
    octets
        .iter()
        .map(|o| format!("{o:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Random MACs under `prefix`, [`MAC_ATTEMPTS`] of them.
pub fn mac_candidates(prefix: Vec<u8>) -> impl Iterator<Item = String> {
    (0..MAC_ATTEMPTS).map(move |_| {
        let mut octets = [0u8; 6];
        octets[..prefix.len()].copy_from_slice(&prefix);
        rand::thread_rng().fill(&mut octets[prefix.len()..]);
        format_mac(&octets)
    })
}

/// Every address of `range`, in order.
pub fn ip_candidates(range: IpRange) -> impl Iterator<Item = String> {
    (u32::from(range.start)..=u32::from(range.end)).map(|n| Ipv4Addr::from(n).to_string())
}
