//! Lattice data store
//!
//! Concurrent in-memory map from declared-object identity to the cloud state
//! created for it. Shared by every reconciliation; different keys proceed
//! independently and same-key read-modify-write goes through the DashMap
//! entry API, which holds the shard lock for the duration of the update.
//!
//! The store is a cache. It is not persisted, and the deployer always looks
//! cloud resources up by their deterministic names, so an empty store after a
//! restart only costs extra lookups. Listener and rule records are
//! bookkeeping only: they are written on apply and cleared on cleanup, and
//! nothing reads them back to decide a cloud call.
//!
//! Target groups are shared between routes, so the store also hands out one
//! async lock per [`TargetGroupKey`]. The reference bookkeeping and the cloud
//! calls that follow it happen under that lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{StackId, TargetGroupKey};

/// Cloud state of a route's service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
    /// Assigned DNS name
    pub dns: String,
    /// Cloud name
    pub name: String,
}

/// Key of a listener record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    /// Owning route
    pub stack: StackId,
    /// Listener port
    pub port: u16,
}

/// Cloud state of a listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerRecord {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
}

/// Key of a rule record
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleKey {
    /// Owning route
    pub stack: StackId,
    /// Listener port
    pub port: u16,
    /// Rule name
    pub name: String,
}

/// Cloud state of a rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleRecord {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
    /// Priority the rule was created with
    pub priority: u32,
}

/// Cloud state of a target group and the routes using it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetGroupRecord {
    /// Cloud id
    pub id: String,
    /// Cloud ARN
    pub arn: String,
    /// Cloud name
    pub name: String,
    /// Routes whose stacks reference the target group
    pub referenced_by: BTreeSet<StackId>,
}

/// Outcome of dropping a route's reference to a target group
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Release {
    /// The store had no record for the key
    Unknown,
    /// Other routes still reference the target group
    StillReferenced,
    /// The last reference was dropped and the record removed
    Unreferenced(TargetGroupRecord),
}

/// Shared store of cloud state keyed by declared identity
#[derive(Debug, Default)]
pub struct LatticeDataStore {
    services: DashMap<StackId, ServiceRecord>,
    listeners: DashMap<ListenerKey, ListenerRecord>,
    rules: DashMap<RuleKey, RuleRecord>,
    target_groups: DashMap<TargetGroupKey, TargetGroupRecord>,
    target_group_locks: DashMap<TargetGroupKey, Arc<Mutex<()>>>,
}

impl LatticeDataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Services
    // -------------------------------------------------------------------------

    /// Service record of a route
    pub fn get_service(&self, stack: &StackId) -> Option<ServiceRecord> {
        self.services.get(stack).map(|r| r.clone())
    }

    /// Insert or replace a route's service record
    pub fn put_service(&self, stack: StackId, record: ServiceRecord) {
        self.services.insert(stack, record);
    }

    /// Remove a route's service record
    pub fn delete_service(&self, stack: &StackId) -> Option<ServiceRecord> {
        self.services.remove(stack).map(|(_, r)| r)
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Listener record
    pub fn get_listener(&self, key: &ListenerKey) -> Option<ListenerRecord> {
        self.listeners.get(key).map(|r| r.clone())
    }

    /// Insert or replace a listener record
    pub fn put_listener(&self, key: ListenerKey, record: ListenerRecord) {
        self.listeners.insert(key, record);
    }

    /// Remove a listener record
    pub fn delete_listener(&self, key: &ListenerKey) -> Option<ListenerRecord> {
        self.listeners.remove(key).map(|(_, r)| r)
    }

    /// Listener ports recorded for a route, sorted
    pub fn listener_ports(&self, stack: &StackId) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .listeners
            .iter()
            .filter(|e| &e.key().stack == stack)
            .map(|e| e.key().port)
            .collect();
        ports.sort_unstable();
        ports
    }

    // -------------------------------------------------------------------------
    // Rules
    // -------------------------------------------------------------------------

    /// Rule record
    pub fn get_rule(&self, key: &RuleKey) -> Option<RuleRecord> {
        self.rules.get(key).map(|r| r.clone())
    }

    /// Insert or replace a rule record
    pub fn put_rule(&self, key: RuleKey, record: RuleRecord) {
        self.rules.insert(key, record);
    }

    /// Remove a rule record
    pub fn delete_rule(&self, key: &RuleKey) -> Option<RuleRecord> {
        self.rules.remove(key).map(|(_, r)| r)
    }

    /// Remove every rule record of one listener
    pub fn delete_rules_for_listener(&self, stack: &StackId, port: u16) {
        self.rules.retain(|k, _| !(&k.stack == stack && k.port == port));
    }

    // -------------------------------------------------------------------------
    // Target groups
    // -------------------------------------------------------------------------

    /// Target group record
    pub fn get_target_group(&self, key: &TargetGroupKey) -> Option<TargetGroupRecord> {
        self.target_groups.get(key).map(|r| r.clone())
    }

    /// Serialize cloud work on one target group
    ///
    /// A deploy holds the guard from the cloud lookup through the target
    /// sync; a release holds it from dropping the reference through the cloud
    /// delete. A route adopting a shared target group therefore never
    /// interleaves with the last referrer tearing it down.
    pub async fn lock_target_group(&self, key: &TargetGroupKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.target_group_locks.entry(key.clone()).or_default());
        lock.lock_owned().await
    }

    /// Record the cloud state of a target group and add `stack` as a referrer
    ///
    /// Atomic per key: concurrent upserts from routes sharing a backend never
    /// lose each other's references.
    pub fn upsert_target_group(
        &self,
        key: TargetGroupKey,
        id: &str,
        arn: &str,
        name: &str,
        stack: &StackId,
    ) {
        match self.target_groups.entry(key) {
            Entry::Occupied(mut e) => {
                let record = e.get_mut();
                record.id = id.to_string();
                record.arn = arn.to_string();
                record.name = name.to_string();
                record.referenced_by.insert(stack.clone());
            }
            Entry::Vacant(e) => {
                e.insert(TargetGroupRecord {
                    id: id.to_string(),
                    arn: arn.to_string(),
                    name: name.to_string(),
                    referenced_by: BTreeSet::from([stack.clone()]),
                });
            }
        }
    }

    /// Drop `stack`'s reference to a target group
    ///
    /// Removes the record when the last reference goes away and returns it so
    /// the caller can delete the cloud resource.
    pub fn release_target_group(&self, key: &TargetGroupKey, stack: &StackId) -> Release {
        match self.target_groups.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                e.get_mut().referenced_by.remove(stack);
                if e.get().referenced_by.is_empty() {
                    Release::Unreferenced(e.remove())
                } else {
                    Release::StillReferenced
                }
            }
            Entry::Vacant(_) => Release::Unknown,
        }
    }

    /// Put back a record taken by [`release_target_group`](Self::release_target_group)
    ///
    /// Used when the cloud delete that followed the release failed. References
    /// added concurrently are kept.
    pub fn restore_target_group(&self, key: TargetGroupKey, record: TargetGroupRecord) {
        match self.target_groups.entry(key) {
            Entry::Occupied(mut e) => {
                e.get_mut().referenced_by.extend(record.referenced_by);
            }
            Entry::Vacant(e) => {
                e.insert(record);
            }
        }
    }

    /// Target groups referenced by a route, sorted
    pub fn target_groups_referenced_by(&self, stack: &StackId) -> Vec<TargetGroupKey> {
        let mut keys: Vec<TargetGroupKey> = self
            .target_groups
            .iter()
            .filter(|e| e.value().referenced_by.contains(stack))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}
