//! # Topology
//!
//! The live directory of known instances, grouped by type:
//!
//! ```text
//! device
//!   SA1/MOTOR/1   {} @type=device @serverId=srv1 ...
//! server
//!   srv1          {} @type=server @deviceClasses=[...] ...
//! ```
//!
//! Each instance node is an empty Hash carrying its instanceInfo as
//! attributes.
//!
//! Alongside, per instance: liveness (last heartbeat, counter, interval)
//! and, for tracked devices, a cached configuration. Everything sits behind
//! read-write locks; readers never block readers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use karabo_data::{Attributes, Hash, MergePolicy};
use parking_lot::RwLock;

/// Instance type used when an instanceInfo names none.
pub const DEFAULT_TYPE: &str = "client";

/// Number of heartbeat intervals after which a silent instance is gone.
pub const MISSED_HEARTBEATS: u32 = 3;

/// Change in the set of known instances, as seen by one instance.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    New { instance_id: String, info: Hash },
    Updated { instance_id: String, info: Hash },
    Gone { instance_id: String, info: Hash },
}

impl InstanceEvent {
    #[must_use]
    pub fn instance_id(&self) -> &str {
        match self {
            Self::New { instance_id, .. }
            | Self::Updated { instance_id, .. }
            | Self::Gone { instance_id, .. } => instance_id,
        }
    }
}

/// What a heartbeat told about its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Known,
    /// Counter went backwards: the instance restarted.
    Restarted,
    Unknown,
}

#[derive(Debug, Clone)]
struct Liveness {
    last_seen: Instant,
    counter: Option<u32>,
    interval: Duration,
}

#[derive(Debug)]
pub struct Topology {
    default_interval: Duration,
    tree: RwLock<Hash>,
    types: RwLock<HashMap<String, String>>,
    liveness: RwLock<HashMap<String, Liveness>>,
    configurations: RwLock<HashMap<String, Hash>>,
}

fn interval_of(info: &Hash, default: Duration) -> Duration {
    info.get_as::<u64>("heartbeatInterval")
        .ok()
        .filter(|s| *s > 0)
        .map_or(default, Duration::from_secs)
}

impl Topology {
    /// `default_interval` applies to instances not announcing their own.
    #[must_use]
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            tree: RwLock::new(Hash::new()),
            types: RwLock::new(HashMap::new()),
            liveness: RwLock::new(HashMap::new()),
            configurations: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh an instance. Returns true if it was unknown.
    pub fn upsert(&self, instance_id: &str, info: &Hash) -> bool {
        let kind = info
            .get::<String>("type")
            .unwrap_or_else(|_| DEFAULT_TYPE.to_string());
        let previous = self.types.write().insert(instance_id.to_string(), kind.clone());
        {
            let mut tree = self.tree.write();
            if let Some(old) = previous.as_deref().filter(|old| *old != kind) {
                if let Ok(group) = tree.get_hash_mut(old) {
                    group.erase(instance_id);
                }
            }
            if !tree.has(&kind) {
                tree.set_key(&kind, Hash::new());
            }
            if let Ok(group) = tree.get_hash_mut(&kind) {
                group
                    .set_key(instance_id, Hash::new())
                    .set_attributes(info_attributes(info));
            }
        }
        let interval = interval_of(info, self.default_interval);
        self.liveness
            .write()
            .entry(instance_id.to_string())
            .and_modify(|l| {
                l.last_seen = Instant::now();
                l.counter = None;
                l.interval = interval;
            })
            .or_insert(Liveness {
                last_seen: Instant::now(),
                counter: None,
                interval,
            });
        previous.is_none()
    }

    /// Forget an instance. Returns its last instanceInfo.
    pub fn remove(&self, instance_id: &str) -> Option<Hash> {
        let kind = self.types.write().remove(instance_id)?;
        self.liveness.write().remove(instance_id);
        self.configurations.write().remove(instance_id);
        let mut tree = self.tree.write();
        let group = tree.get_hash_mut(&kind).ok()?;
        let info = group.find(instance_id).map(|node| info_hash(node.attributes()));
        group.erase(instance_id);
        if group.is_empty() {
            tree.erase(&kind);
        }
        info
    }

    /// Record a heartbeat.
    pub fn heartbeat(&self, instance_id: &str, counter: u32) -> HeartbeatOutcome {
        let mut liveness = self.liveness.write();
        let Some(entry) = liveness.get_mut(instance_id) else {
            return HeartbeatOutcome::Unknown;
        };
        entry.last_seen = Instant::now();
        let previous = entry.counter.replace(counter);
        match previous {
            Some(p) if counter < p && p != u32::MAX => HeartbeatOutcome::Restarted,
            _ => HeartbeatOutcome::Known,
        }
    }

    /// Instances that missed [`MISSED_HEARTBEATS`] intervals as of `now`.
    #[must_use]
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.liveness
            .read()
            .iter()
            .filter(|(_, l)| now.saturating_duration_since(l.last_seen) > l.interval * MISSED_HEARTBEATS)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, instance_id: &str) -> bool {
        self.types.read().contains_key(instance_id)
    }

    #[must_use]
    pub fn info(&self, instance_id: &str) -> Option<Hash> {
        let kind = self.types.read().get(instance_id)?.clone();
        self.tree
            .read()
            .get_hash(&kind)
            .ok()?
            .find(instance_id)
            .map(|node| info_hash(node.attributes()))
    }

    /// Ids of all known instances of `kind` (`device`, `server`, ...).
    #[must_use]
    pub fn instances_of(&self, kind: &str) -> Vec<String> {
        self.tree
            .read()
            .get_hash(kind)
            .map(|group| group.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole directory.
    #[must_use]
    pub fn snapshot(&self) -> Hash {
        self.tree.read().clone()
    }

    // =========================================================================
    // Tracked device configurations
    // =========================================================================

    /// Cache the full configuration of a known instance.
    pub fn set_configuration(&self, instance_id: &str, configuration: Hash) -> bool {
        if !self.contains(instance_id) {
            return false;
        }
        self.configurations
            .write()
            .insert(instance_id.to_string(), configuration);
        true
    }

    /// Merge changes into the cached configuration. Ignored for instances
    /// that are unknown or gone.
    pub fn update_configuration(&self, instance_id: &str, changes: &Hash) -> bool {
        if !self.contains(instance_id) {
            return false;
        }
        let mut configurations = self.configurations.write();
        let Some(cached) = configurations.get_mut(instance_id) else {
            return false;
        };
        cached.merge(changes, MergePolicy::ReplaceAttributes);
        true
    }

    #[must_use]
    pub fn configuration(&self, instance_id: &str) -> Option<Hash> {
        self.configurations.read().get(instance_id).cloned()
    }
}

/// Directory nodes are empty; the instanceInfo fields are their attributes.
fn info_attributes(info: &Hash) -> Attributes {
    let mut attributes = Attributes::new();
    for node in info {
        attributes.set(node.key(), node.value().clone());
    }
    attributes
}

fn info_hash(attributes: &Attributes) -> Hash {
    let mut info = Hash::new();
    for (name, value) in attributes.iter() {
        info.set_key(name, value.clone());
    }
    info
}
