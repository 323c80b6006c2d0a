//! Stack deployer
//!
//! Converges the cloud to a [`Stack`]. Apply mode walks the resource kinds in
//! dependency order (`TargetGroup → Targets → Service → Listener → Rule`),
//! creating what is missing, updating what differs and leaving the rest
//! alone. Listeners, rules and target-group references that are no longer in
//! the stack are pruned in the same pass. Cleanup mode removes everything a
//! route owns in reverse order.
//!
//! A failure aborts the remaining steps without rolling back what was already
//! applied; the next reconcile re-drives convergence.
//!
//! Target groups are shared by every route pointing at the same backend.
//! Each one is worked on under its [`LatticeDataStore::lock_target_group`]
//! guard: apply holds it from the lookup through the target sync, release
//! holds it from dropping the reference through the cloud delete.

pub mod cloud;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use lattice_common::Error;

use crate::model::{
    Listener, Rule, ServiceResource, Stack, StackMode, TargetGroup, TargetGroupKey, Targets,
};
use crate::store::{
    LatticeDataStore, ListenerKey, ListenerRecord, Release, RuleKey, RuleRecord, ServiceRecord,
};
use cloud::{
    CloudError, CloudErrorKind, CloudService, LatticeCloud, ListenerSpec, RuleSpec, ServiceSpec,
    TargetGroupSpec, WeightedTargetGroup,
};

/// Default timeout of a single cloud call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deployer settings
#[derive(Clone, Debug)]
pub struct DeployerConfig {
    /// Timeout of a single cloud call; expiry is a retryable error
    pub call_timeout: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// What a deploy changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployReport {
    /// Resources created
    pub created: usize,
    /// Resources updated
    pub updated: usize,
    /// Resources already converged
    pub unchanged: usize,
    /// Resources deleted
    pub deleted: usize,
    /// DNS name of the route's service (apply mode only)
    pub service_dns: Option<String>,
}

impl DeployReport {
    /// Whether the deploy issued no mutating call
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Applies stacks against a [`LatticeCloud`] and records results in the
/// [`LatticeDataStore`]
pub struct StackDeployer {
    cloud: Arc<dyn LatticeCloud>,
    store: Arc<LatticeDataStore>,
    config: DeployerConfig,
}

impl StackDeployer {
    /// Create a deployer
    pub fn new(
        cloud: Arc<dyn LatticeCloud>,
        store: Arc<LatticeDataStore>,
        config: DeployerConfig,
    ) -> Self {
        Self {
            cloud,
            store,
            config,
        }
    }

    /// The data store the deployer writes to
    pub fn store(&self) -> &Arc<LatticeDataStore> {
        &self.store
    }

    /// Converge the cloud to `stack`
    ///
    /// Once `cancel` fires no further cloud call is issued and a retryable
    /// error is returned.
    #[instrument(skip_all, fields(stack = %stack.id(), mode = ?stack.mode()))]
    pub async fn deploy(
        &self,
        stack: &Stack,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, Error> {
        let run = Run {
            cloud: self.cloud.as_ref(),
            store: &self.store,
            call_timeout: self.config.call_timeout,
            stack,
            cancel,
            report: DeployReport::default(),
        };
        let report = match stack.mode() {
            StackMode::Apply => run.apply().await?,
            StackMode::Cleanup => run.cleanup().await?,
        };
        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            "stack deployed"
        );
        Ok(report)
    }
}

/// State of one deploy
struct Run<'a> {
    cloud: &'a dyn LatticeCloud,
    store: &'a LatticeDataStore,
    call_timeout: Duration,
    stack: &'a Stack,
    cancel: &'a CancellationToken,
    report: DeployReport,
}

fn cancelled(op: &str) -> Error {
    Error::retryable_cloud(op, "reconcile cancelled")
}

impl Run<'_> {
    /// Run one cloud call under the cancellation token and call timeout
    ///
    /// The outer error is cancellation or timeout; the inner one is whatever
    /// the cloud returned.
    async fn guard<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, CloudError>>,
    ) -> Result<Result<T, CloudError>, Error> {
        if self.cancel.is_cancelled() {
            return Err(cancelled(op));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled(op)),
            res = tokio::time::timeout(self.call_timeout, fut) => res.map_err(|_| {
                Error::retryable_cloud(
                    op,
                    format!("timed out after {}s", self.call_timeout.as_secs_f32()),
                )
            }),
        }
    }

    /// Wait for the lock of one target group, giving up on cancellation
    async fn lock_target_group(&self, key: &TargetGroupKey) -> Result<OwnedMutexGuard<()>, Error> {
        if self.cancel.is_cancelled() {
            return Err(cancelled("LockTargetGroup"));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled("LockTargetGroup")),
            guard = self.store.lock_target_group(key) => Ok(guard),
        }
    }

    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, CloudError>>,
    ) -> Result<T, Error> {
        self.guard(op, fut).await?.map_err(Error::from)
    }

    fn service_descriptor(&self) -> Result<&ServiceResource, Error> {
        self.stack
            .list::<ServiceResource>()
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal_with_context("deployer", "stack has no service"))
    }

    // =========================================================================
    // Apply
    // =========================================================================

    async fn apply(mut self) -> Result<DeployReport, Error> {
        let target_groups = self.apply_target_groups().await?;
        let service = self.apply_service().await?;
        let listeners = self.apply_listeners(&service, &target_groups).await?;
        self.apply_rules(&service, &listeners, &target_groups).await?;
        self.prune_target_groups(&target_groups).await?;

        self.report.service_dns = Some(service.dns);
        Ok(self.report)
    }

    async fn apply_target_groups(&mut self) -> Result<BTreeMap<TargetGroupKey, String>, Error> {
        let mut ids = BTreeMap::new();
        for tg in self.stack.list::<TargetGroup>() {
            let _guard = self.lock_target_group(&tg.key).await?;
            let existing = self
                .call("FindTargetGroup", self.cloud.find_target_group(&tg.name))
                .await?;

            let cloud_tg = if tg.key.is_import {
                // Imported target groups belong to the exporting cluster.
                let Some(found) = existing else {
                    return Err(Error::retryable_cloud(
                        "TargetGroup",
                        format!("imported target group {} not exported yet", tg.name),
                    ));
                };
                self.report.unchanged += 1;
                found
            } else {
                let desired = TargetGroupSpec {
                    name: tg.name.clone(),
                    protocol: tg.protocol,
                    port: tg.key.port,
                    health_check_enabled: tg.health_check.enabled,
                    health_check_path: tg.health_check.path.clone(),
                };
                match existing {
                    None => {
                        let created = self
                            .call("CreateTargetGroup", self.cloud.create_target_group(&desired))
                            .await?;
                        debug!(target_group = %tg.name, id = %created.id, "created target group");
                        self.report.created += 1;
                        created
                    }
                    Some(found) if found.spec != desired => {
                        let updated = self
                            .call(
                                "UpdateTargetGroup",
                                self.cloud.update_target_group(&found.id, &desired),
                            )
                            .await?;
                        debug!(target_group = %tg.name, "updated target group");
                        self.report.updated += 1;
                        updated
                    }
                    Some(found) => {
                        self.report.unchanged += 1;
                        found
                    }
                }
            };

            self.store.upsert_target_group(
                tg.key.clone(),
                &cloud_tg.id,
                &cloud_tg.arn,
                &cloud_tg.spec.name,
                self.stack.id(),
            );
            if let Some(targets) = self
                .stack
                .list::<Targets>()
                .into_iter()
                .find(|t| t.target_group == tg.key)
            {
                self.sync_targets(targets, &cloud_tg.id).await?;
            }
            ids.insert(tg.key.clone(), cloud_tg.id);
        }

        for targets in self.stack.list::<Targets>() {
            target_group_id(&ids, &targets.target_group)?;
        }
        Ok(ids)
    }

    async fn sync_targets(&mut self, targets: &Targets, tg_id: &str) -> Result<(), Error> {
        let current: BTreeSet<_> = self
            .call("ListTargets", self.cloud.list_targets(tg_id))
            .await?
            .into_iter()
            .collect();
        let desired: BTreeSet<_> = targets.targets.iter().cloned().collect();

        let register: Vec<_> = desired.difference(&current).cloned().collect();
        let deregister: Vec<_> = current.difference(&desired).cloned().collect();
        if register.is_empty() && deregister.is_empty() {
            self.report.unchanged += 1;
            return Ok(());
        }

        if !register.is_empty() {
            self.call("RegisterTargets", self.cloud.register_targets(tg_id, register))
                .await?;
        }
        if !deregister.is_empty() {
            self.call(
                "DeregisterTargets",
                self.cloud.deregister_targets(tg_id, deregister),
            )
            .await?;
        }
        debug!(target_group = %targets.target_group, count = desired.len(), "synced targets");
        self.report.updated += 1;
        Ok(())
    }

    async fn apply_service(&mut self) -> Result<CloudService, Error> {
        let svc = self.service_descriptor()?;
        let desired = ServiceSpec {
            name: svc.cloud_name(),
            service_network: svc.service_network.clone(),
            customer_cert_arn: svc.customer_cert_arn.clone(),
            hostnames: svc.hostnames.clone(),
        };

        let existing = self
            .call("FindService", self.cloud.find_service(&desired.name))
            .await?;
        let service = match existing {
            None => {
                let created = self
                    .call("CreateService", self.cloud.create_service(&desired))
                    .await?;
                info!(service = %desired.name, dns = %created.dns, "created service");
                self.report.created += 1;
                created
            }
            Some(found) if found.spec != desired => {
                let updated = self
                    .call("UpdateService", self.cloud.update_service(&found.id, &desired))
                    .await?;
                debug!(service = %desired.name, "updated service");
                self.report.updated += 1;
                updated
            }
            Some(found) => {
                self.report.unchanged += 1;
                found
            }
        };

        self.store.put_service(
            self.stack.id().clone(),
            ServiceRecord {
                id: service.id.clone(),
                arn: service.arn.clone(),
                dns: service.dns.clone(),
                name: service.spec.name.clone(),
            },
        );
        Ok(service)
    }

    async fn apply_listeners(
        &mut self,
        service: &CloudService,
        target_groups: &BTreeMap<TargetGroupKey, String>,
    ) -> Result<BTreeMap<u16, String>, Error> {
        let existing = self
            .call("ListListeners", self.cloud.list_listeners(&service.id))
            .await?;
        let mut ids = BTreeMap::new();

        for listener in self.stack.list::<Listener>() {
            let default_key = listener.default_action.target_group_key();
            let tg_id = target_group_id(target_groups, &default_key)?;
            let desired = ListenerSpec {
                port: listener.port,
                protocol: listener.protocol,
                default_target_group_id: tg_id.to_string(),
            };

            let cloud_listener = match existing.iter().find(|l| l.spec.port == listener.port) {
                None => {
                    let created = self
                        .call(
                            "CreateListener",
                            self.cloud.create_listener(&service.id, &desired),
                        )
                        .await?;
                    debug!(port = listener.port, "created listener");
                    self.report.created += 1;
                    created
                }
                Some(found) if found.spec != desired => {
                    let updated = self
                        .call(
                            "UpdateListener",
                            self.cloud.update_listener(&service.id, &found.id, &desired),
                        )
                        .await?;
                    debug!(port = listener.port, "updated listener");
                    self.report.updated += 1;
                    updated
                }
                Some(found) => {
                    self.report.unchanged += 1;
                    found.clone()
                }
            };

            self.store.put_listener(
                ListenerKey {
                    stack: self.stack.id().clone(),
                    port: listener.port,
                },
                ListenerRecord {
                    id: cloud_listener.id.clone(),
                    arn: cloud_listener.arn.clone(),
                },
            );
            ids.insert(listener.port, cloud_listener.id);
        }

        for stale in existing.iter().filter(|l| !ids.contains_key(&l.spec.port)) {
            info!(port = stale.spec.port, "pruning listener no longer declared");
            self.delete_listener(&service.id, &stale.id, stale.spec.port)
                .await?;
        }
        Ok(ids)
    }

    async fn apply_rules(
        &mut self,
        service: &CloudService,
        listeners: &BTreeMap<u16, String>,
        target_groups: &BTreeMap<TargetGroupKey, String>,
    ) -> Result<(), Error> {
        let rules = self.stack.list::<Rule>();
        for (&port, listener_id) in listeners {
            let existing = self
                .call("ListRules", self.cloud.list_rules(&service.id, listener_id))
                .await?;
            let mut declared = BTreeSet::new();

            for rule in rules.iter().filter(|r| r.listener_port == port) {
                let targets = rule
                    .targets
                    .iter()
                    .map(|t| {
                        target_group_id(target_groups, &t.target_group).map(|id| {
                            WeightedTargetGroup {
                                target_group_id: id.to_string(),
                                weight: t.weight,
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let desired = RuleSpec {
                    name: rule.name.clone(),
                    priority: rule.priority,
                    matches: rule.matches.clone(),
                    targets,
                };

                let cloud_rule = match existing.iter().find(|r| r.spec.name == rule.name) {
                    None => {
                        let created = self
                            .call(
                                "CreateRule",
                                self.cloud.create_rule(&service.id, listener_id, &desired),
                            )
                            .await?;
                        debug!(port, rule = %rule.name, "created rule");
                        self.report.created += 1;
                        created
                    }
                    Some(found) if found.spec != desired => {
                        let updated = self
                            .call(
                                "UpdateRule",
                                self.cloud
                                    .update_rule(&service.id, listener_id, &found.id, &desired),
                            )
                            .await?;
                        debug!(port, rule = %rule.name, "updated rule");
                        self.report.updated += 1;
                        updated
                    }
                    Some(found) => {
                        self.report.unchanged += 1;
                        found.clone()
                    }
                };

                self.store.put_rule(
                    RuleKey {
                        stack: self.stack.id().clone(),
                        port,
                        name: rule.name.clone(),
                    },
                    RuleRecord {
                        id: cloud_rule.id,
                        arn: cloud_rule.arn,
                        priority: rule.priority,
                    },
                );
                declared.insert(rule.name.as_str());
            }

            for stale in existing
                .iter()
                .filter(|r| !declared.contains(r.spec.name.as_str()))
            {
                info!(port, rule = %stale.spec.name, "pruning rule no longer declared");
                self.call(
                    "DeleteRule",
                    self.cloud.delete_rule(&service.id, listener_id, &stale.id),
                )
                .await?;
                self.store.delete_rule(&RuleKey {
                    stack: self.stack.id().clone(),
                    port,
                    name: stale.spec.name.clone(),
                });
                self.report.deleted += 1;
            }
        }
        Ok(())
    }

    /// Drop references to target groups this route no longer uses
    async fn prune_target_groups(
        &mut self,
        target_groups: &BTreeMap<TargetGroupKey, String>,
    ) -> Result<(), Error> {
        for key in self.store.target_groups_referenced_by(self.stack.id()) {
            if !target_groups.contains_key(&key) {
                debug!(target_group = %key, "releasing target group no longer referenced");
                let _guard = self.lock_target_group(&key).await?;
                self.release_target_group(&key).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    async fn cleanup(mut self) -> Result<DeployReport, Error> {
        let svc = self.service_descriptor()?;
        let name = svc.cloud_name();

        // Rule → Listener → Service
        let found = self.call("FindService", self.cloud.find_service(&name)).await?;
        if let Some(service) = found {
            let listeners = self
                .call("ListListeners", self.cloud.list_listeners(&service.id))
                .await?;
            for listener in &listeners {
                self.delete_listener(&service.id, &listener.id, listener.spec.port)
                    .await?;
            }
            self.call("DeleteService", self.cloud.delete_service(&service.id))
                .await?;
            info!(service = %name, "deleted service");
            self.report.deleted += 1;
        }
        for port in self.store.listener_ports(self.stack.id()) {
            self.forget_listener(port);
        }
        self.store.delete_service(self.stack.id());

        // Targets → TargetGroup
        let mut keys: BTreeSet<TargetGroupKey> = self
            .store
            .target_groups_referenced_by(self.stack.id())
            .into_iter()
            .collect();
        let declared: BTreeMap<TargetGroupKey, String> = self
            .stack
            .list::<TargetGroup>()
            .into_iter()
            .map(|tg| (tg.key.clone(), tg.name.clone()))
            .collect();
        keys.extend(declared.keys().cloned());

        for key in keys {
            let _guard = self.lock_target_group(&key).await?;
            let released = self.release_target_group(&key).await?;
            if released == Release::Unknown && !key.is_import {
                // Nothing recorded, e.g. after a restart. Fall back to the
                // cloud by name; a Conflict means another route still uses it.
                if let Some(name) = declared.get(&key) {
                    let found = self
                        .call("FindTargetGroup", self.cloud.find_target_group(name))
                        .await?;
                    if let Some(tg) = found {
                        self.delete_target_group_if_unused(&tg.id, &key).await?;
                    }
                }
            }
        }

        Ok(self.report)
    }

    // =========================================================================
    // Shared deletion helpers
    // =========================================================================

    async fn delete_listener(
        &mut self,
        service_id: &str,
        listener_id: &str,
        port: u16,
    ) -> Result<(), Error> {
        let rules = self
            .call("ListRules", self.cloud.list_rules(service_id, listener_id))
            .await?;
        for rule in rules {
            self.call(
                "DeleteRule",
                self.cloud.delete_rule(service_id, listener_id, &rule.id),
            )
            .await?;
            self.report.deleted += 1;
        }
        self.call(
            "DeleteListener",
            self.cloud.delete_listener(service_id, listener_id),
        )
        .await?;
        self.report.deleted += 1;
        self.forget_listener(port);
        Ok(())
    }

    fn forget_listener(&self, port: u16) {
        let stack = self.stack.id();
        self.store.delete_rules_for_listener(stack, port);
        self.store.delete_listener(&ListenerKey {
            stack: stack.clone(),
            port,
        });
    }

    /// Drop this route's reference to a target group, deleting the cloud
    /// resource when it was the last one
    ///
    /// The caller holds the target group's lock.
    async fn release_target_group(&mut self, key: &TargetGroupKey) -> Result<Release, Error> {
        let released = self.store.release_target_group(key, self.stack.id());
        let Release::Unreferenced(record) = &released else {
            return Ok(released);
        };
        if key.is_import {
            return Ok(released);
        }

        let targets = match self
            .call("ListTargets", self.cloud.list_targets(&record.id))
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                self.restore(key, record);
                return Err(e);
            }
        };
        if !targets.is_empty() {
            if let Err(e) = self
                .call(
                    "DeregisterTargets",
                    self.cloud.deregister_targets(&record.id, targets),
                )
                .await
            {
                self.restore(key, record);
                return Err(e);
            }
            self.report.deleted += 1;
        }
        if let Err(e) = self.delete_target_group_if_unused(&record.id, key).await {
            self.restore(key, record);
            return Err(e);
        }
        Ok(released)
    }

    fn restore(&self, key: &TargetGroupKey, record: &crate::store::TargetGroupRecord) {
        let mut record = record.clone();
        record.referenced_by.insert(self.stack.id().clone());
        self.store.restore_target_group(key.clone(), record);
    }

    async fn delete_target_group_if_unused(
        &mut self,
        id: &str,
        key: &TargetGroupKey,
    ) -> Result<(), Error> {
        match self
            .guard("DeleteTargetGroup", self.cloud.delete_target_group(id))
            .await?
        {
            Ok(()) => {
                info!(target_group = %key, "deleted target group");
                self.report.deleted += 1;
                Ok(())
            }
            Err(e) if e.kind == CloudErrorKind::Conflict => {
                warn!(target_group = %key, error = %e, "target group still in use, keeping it");
                Ok(())
            }
            Err(e) if e.kind == CloudErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn target_group_id<'m>(
    target_groups: &'m BTreeMap<TargetGroupKey, String>,
    key: &TargetGroupKey,
) -> Result<&'m str, Error> {
    target_groups.get(key).map(String::as_str).ok_or_else(|| {
        Error::internal_with_context(
            "deployer",
            format!("target group {key} is referenced but not part of the stack"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DefaultAction, HealthCheck, PathMatch, Protocol, RuleMatch, RuleTarget, StackId, Target,
    };
    use async_trait::async_trait;
    use cloud::{CloudListener, CloudRule, CloudTargetGroup};
    use lattice_common::ErrorClass;
    use memory::MemoryCloud;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn tg_key(backend: &str) -> TargetGroupKey {
        TargetGroupKey {
            name: backend.to_string(),
            namespace: "default".to_string(),
            port: Some(8080),
            is_import: false,
        }
    }

    fn target_group(backend: &str) -> TargetGroup {
        let key = tg_key(backend);
        TargetGroup {
            name: key.local_name(),
            key,
            protocol: Protocol::Http,
            health_check: HealthCheck::default(),
        }
    }

    fn route_stack(route: &str, backends: &[&str], mode: StackMode) -> Stack {
        let mut stack = Stack::new(StackId::new("default", route), mode);
        for backend in backends {
            stack.add(target_group(backend));
            stack.add(Targets {
                target_group: tg_key(backend),
                targets: vec![Target {
                    address: "10.0.0.1".to_string(),
                    port: 8080,
                }],
            });
        }
        stack.add(ServiceResource {
            name: route.to_string(),
            namespace: "default".to_string(),
            service_network: "mesh1".to_string(),
            ..Default::default()
        });
        stack.add(Listener {
            name: route.to_string(),
            namespace: "default".to_string(),
            port: 80,
            protocol: Protocol::Http,
            default_action: DefaultAction {
                backend_service_name: backends[0].to_string(),
                backend_service_namespace: "default".to_string(),
                backend_port: Some(8080),
                is_import: false,
            },
        });
        for (i, backend) in backends.iter().enumerate().skip(1) {
            stack.add(Rule {
                service_name: route.to_string(),
                service_namespace: "default".to_string(),
                listener_port: 80,
                listener_protocol: Protocol::Http,
                name: format!("rule-{i}"),
                priority: i as u32,
                matches: RuleMatch {
                    path: Some(PathMatch {
                        exact: false,
                        value: format!("/{backend}"),
                    }),
                    headers: vec![],
                },
                targets: vec![RuleTarget {
                    target_group: tg_key(backend),
                    weight: 1,
                }],
            });
        }
        stack
    }

    fn deployer(cloud: Arc<MemoryCloud>) -> StackDeployer {
        StackDeployer::new(
            cloud,
            Arc::new(LatticeDataStore::new()),
            DeployerConfig::default(),
        )
    }

    /// What an armed [`GatedCloud`] does with the gated operation
    enum Gate {
        /// Never answer
        Hang,
        /// Answer once `resume` is notified
        HoldUntil(Arc<Notify>),
    }

    /// [`MemoryCloud`] whose next call to one operation is held back once
    /// armed. `reached` fires when that call arrives; a held call is not
    /// forwarded until it is released.
    struct GatedCloud {
        inner: Arc<MemoryCloud>,
        op: &'static str,
        gate: Gate,
        armed: AtomicBool,
        reached: Arc<Notify>,
    }

    impl GatedCloud {
        fn new(inner: Arc<MemoryCloud>, op: &'static str, gate: Gate) -> Self {
            Self {
                inner,
                op,
                gate,
                armed: AtomicBool::new(false),
                reached: Arc::new(Notify::new()),
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        async fn enter(&self, op: &'static str) {
            if op != self.op || !self.armed.swap(false, Ordering::SeqCst) {
                return;
            }
            self.reached.notify_one();
            match &self.gate {
                Gate::Hang => std::future::pending::<()>().await,
                Gate::HoldUntil(resume) => resume.notified().await,
            }
        }
    }

    #[async_trait]
    impl LatticeCloud for GatedCloud {
        async fn find_service(&self, name: &str) -> Result<Option<CloudService>, CloudError> {
            self.enter("FindService").await;
            self.inner.find_service(name).await
        }

        async fn create_service(&self, spec: &ServiceSpec) -> Result<CloudService, CloudError> {
            self.enter("CreateService").await;
            self.inner.create_service(spec).await
        }

        async fn update_service(
            &self,
            id: &str,
            spec: &ServiceSpec,
        ) -> Result<CloudService, CloudError> {
            self.enter("UpdateService").await;
            self.inner.update_service(id, spec).await
        }

        async fn delete_service(&self, id: &str) -> Result<(), CloudError> {
            self.enter("DeleteService").await;
            self.inner.delete_service(id).await
        }

        async fn list_listeners(&self, service_id: &str) -> Result<Vec<CloudListener>, CloudError> {
            self.enter("ListListeners").await;
            self.inner.list_listeners(service_id).await
        }

        async fn create_listener(
            &self,
            service_id: &str,
            spec: &ListenerSpec,
        ) -> Result<CloudListener, CloudError> {
            self.enter("CreateListener").await;
            self.inner.create_listener(service_id, spec).await
        }

        async fn update_listener(
            &self,
            service_id: &str,
            listener_id: &str,
            spec: &ListenerSpec,
        ) -> Result<CloudListener, CloudError> {
            self.enter("UpdateListener").await;
            self.inner.update_listener(service_id, listener_id, spec).await
        }

        async fn delete_listener(
            &self,
            service_id: &str,
            listener_id: &str,
        ) -> Result<(), CloudError> {
            self.enter("DeleteListener").await;
            self.inner.delete_listener(service_id, listener_id).await
        }

        async fn list_rules(
            &self,
            service_id: &str,
            listener_id: &str,
        ) -> Result<Vec<CloudRule>, CloudError> {
            self.enter("ListRules").await;
            self.inner.list_rules(service_id, listener_id).await
        }

        async fn create_rule(
            &self,
            service_id: &str,
            listener_id: &str,
            spec: &RuleSpec,
        ) -> Result<CloudRule, CloudError> {
            self.enter("CreateRule").await;
            self.inner.create_rule(service_id, listener_id, spec).await
        }

        async fn update_rule(
            &self,
            service_id: &str,
            listener_id: &str,
            rule_id: &str,
            spec: &RuleSpec,
        ) -> Result<CloudRule, CloudError> {
            self.enter("UpdateRule").await;
            self.inner
                .update_rule(service_id, listener_id, rule_id, spec)
                .await
        }

        async fn delete_rule(
            &self,
            service_id: &str,
            listener_id: &str,
            rule_id: &str,
        ) -> Result<(), CloudError> {
            self.enter("DeleteRule").await;
            self.inner.delete_rule(service_id, listener_id, rule_id).await
        }

        async fn find_target_group(
            &self,
            name: &str,
        ) -> Result<Option<CloudTargetGroup>, CloudError> {
            self.enter("FindTargetGroup").await;
            self.inner.find_target_group(name).await
        }

        async fn create_target_group(
            &self,
            spec: &TargetGroupSpec,
        ) -> Result<CloudTargetGroup, CloudError> {
            self.enter("CreateTargetGroup").await;
            self.inner.create_target_group(spec).await
        }

        async fn update_target_group(
            &self,
            id: &str,
            spec: &TargetGroupSpec,
        ) -> Result<CloudTargetGroup, CloudError> {
            self.enter("UpdateTargetGroup").await;
            self.inner.update_target_group(id, spec).await
        }

        async fn delete_target_group(&self, id: &str) -> Result<(), CloudError> {
            self.enter("DeleteTargetGroup").await;
            self.inner.delete_target_group(id).await
        }

        async fn list_targets(&self, target_group_id: &str) -> Result<Vec<Target>, CloudError> {
            self.enter("ListTargets").await;
            self.inner.list_targets(target_group_id).await
        }

        async fn register_targets(
            &self,
            target_group_id: &str,
            targets: Vec<Target>,
        ) -> Result<(), CloudError> {
            self.enter("RegisterTargets").await;
            self.inner.register_targets(target_group_id, targets).await
        }

        async fn deregister_targets(
            &self,
            target_group_id: &str,
            targets: Vec<Target>,
        ) -> Result<(), CloudError> {
            self.enter("DeregisterTargets").await;
            self.inner.deregister_targets(target_group_id, targets).await
        }
    }

    // =========================================================================
    // Apply Stories
    // =========================================================================

    /// Story: First deploy creates every resource and records it
    #[tokio::test]
    async fn story_first_deploy_creates_everything() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let stack = route_stack("service1", &["a", "b"], StackMode::Apply);

        let report = deployer
            .deploy(&stack, &CancellationToken::new())
            .await
            .expect("deploy should succeed");

        // 2 target groups, 1 service, 1 listener, 1 rule
        assert_eq!(report.created, 5);
        assert!(report.service_dns.unwrap().starts_with("service1-default-"));
        assert_eq!(cloud.service_count(), 1);
        assert_eq!(cloud.listener_count(), 1);
        assert_eq!(cloud.rule_count(), 1);

        let store = deployer.store();
        let id = StackId::new("default", "service1");
        assert!(store.get_service(&id).is_some());
        assert_eq!(store.target_groups_referenced_by(&id).len(), 2);
        assert!(store.get_listener(&ListenerKey { stack: id, port: 80 }).is_some());
    }

    /// Story: Redeploying unchanged input issues no mutating calls
    #[tokio::test]
    async fn story_second_deploy_is_noop() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let stack = route_stack("service1", &["a", "b"], StackMode::Apply);
        let cancel = CancellationToken::new();

        deployer.deploy(&stack, &cancel).await.unwrap();
        cloud.reset_calls();

        let report = deployer.deploy(&stack, &cancel).await.unwrap();
        assert!(report.is_noop(), "{report:?}");
        assert_eq!(cloud.calls_with_prefix("Create"), 0);
        assert_eq!(cloud.calls_with_prefix("Update"), 0);
        assert_eq!(cloud.calls_with_prefix("Register"), 0);
    }

    /// Story: Changing the default backend updates the listener in place
    #[tokio::test]
    async fn story_changed_default_backend_updates_listener() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let cancel = CancellationToken::new();

        deployer
            .deploy(&route_stack("service1", &["a"], StackMode::Apply), &cancel)
            .await
            .unwrap();
        cloud.reset_calls();

        let report = deployer
            .deploy(&route_stack("service1", &["c"], StackMode::Apply), &cancel)
            .await
            .unwrap();
        assert_eq!(cloud.call_count("UpdateListener"), 1);
        assert_eq!(cloud.call_count("CreateListener"), 0);
        // the old target group is no longer referenced and gets deleted
        assert_eq!(cloud.call_count("DeleteTargetGroup"), 1);
        assert_eq!(cloud.target_group_names(), vec!["k8s-c-default-8080"]);
        assert!(report.deleted >= 1);
    }

    /// Story: A rule removed from the route is pruned from the cloud
    #[tokio::test]
    async fn story_removed_rule_is_pruned() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let cancel = CancellationToken::new();

        deployer
            .deploy(&route_stack("service1", &["a", "b", "c"], StackMode::Apply), &cancel)
            .await
            .unwrap();
        assert_eq!(cloud.rule_count(), 2);

        deployer
            .deploy(&route_stack("service1", &["a", "b"], StackMode::Apply), &cancel)
            .await
            .unwrap();
        assert_eq!(cloud.rule_count(), 1);
        assert_eq!(cloud.call_count("DeleteRule"), 1);
        assert_eq!(
            cloud.target_group_names(),
            vec!["k8s-a-default-8080", "k8s-b-default-8080"]
        );
    }

    /// Story: Imported target groups are looked up, never created
    #[tokio::test]
    async fn story_import_target_group_must_be_exported_first() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let key = TargetGroupKey {
            is_import: true,
            port: None,
            ..tg_key("remote")
        };
        let mut stack = Stack::new(StackId::new("default", "service1"), StackMode::Apply);
        stack.add(TargetGroup {
            name: key.export_name(),
            key: key.clone(),
            protocol: Protocol::Http,
            health_check: HealthCheck::default(),
        });
        stack.add(ServiceResource {
            name: "service1".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        });

        let err = deployer
            .deploy(&stack, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Retryable);
        assert_eq!(cloud.call_count("CreateTargetGroup"), 0);
        assert_eq!(cloud.call_count("FindService"), 0);

        cloud.insert_target_group(TargetGroupSpec {
            name: key.export_name(),
            protocol: Protocol::Http,
            port: None,
            health_check_enabled: true,
            health_check_path: "/".to_string(),
        });
        deployer
            .deploy(&stack, &CancellationToken::new())
            .await
            .expect("deploy should succeed once exported");
        assert_eq!(cloud.call_count("CreateTargetGroup"), 0);
    }

    // =========================================================================
    // Failure Stories
    // =========================================================================

    /// Story: A cancelled reconcile issues no cloud calls
    #[tokio::test]
    async fn story_cancelled_deploy_is_retryable_and_silent() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = deployer
            .deploy(&route_stack("service1", &["a"], StackMode::Apply), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cloud.calls_with_prefix(""), 0);
    }

    /// Story: A cloud call that never answers times out as retryable and
    /// nothing after it is attempted
    #[tokio::test(start_paused = true)]
    async fn story_hung_call_times_out_as_retryable() {
        let inner = Arc::new(MemoryCloud::new());
        let cloud = Arc::new(GatedCloud::new(inner.clone(), "FindService", Gate::Hang));
        cloud.arm();
        let deployer = StackDeployer::new(
            cloud.clone(),
            Arc::new(LatticeDataStore::new()),
            DeployerConfig {
                call_timeout: Duration::from_secs(5),
            },
        );

        let started = tokio::time::Instant::now();
        let err = deployer
            .deploy(
                &route_stack("service1", &["a"], StackMode::Apply),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Retryable);
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() >= Duration::from_secs(5));
        // FindTargetGroup, CreateTargetGroup, ListTargets, RegisterTargets
        assert_eq!(inner.calls_with_prefix(""), 4);
        assert_eq!(inner.call_count("CreateService"), 0);
    }

    /// Story: Cancelling while a cloud call is in flight abandons it at once
    #[tokio::test(start_paused = true)]
    async fn story_cancel_during_call_stops_deploy() {
        let inner = Arc::new(MemoryCloud::new());
        let cloud = Arc::new(GatedCloud::new(inner.clone(), "FindService", Gate::Hang));
        cloud.arm();
        let deployer = StackDeployer::new(
            cloud.clone(),
            Arc::new(LatticeDataStore::new()),
            DeployerConfig::default(),
        );
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                deployer
                    .deploy(&route_stack("service1", &["a"], StackMode::Apply), &cancel)
                    .await
            })
        };
        cloud.reached.notified().await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Retryable);
        assert!(err.to_string().contains("cancelled"), "{err}");
        assert!(started.elapsed() < DEFAULT_CALL_TIMEOUT);
        assert_eq!(inner.calls_with_prefix(""), 4);
        assert_eq!(inner.call_count("CreateService"), 0);
    }

    /// Story: Access denied on a dependency aborts its dependants
    #[tokio::test]
    async fn story_fatal_target_group_error_aborts_dependants() {
        let mut mock = cloud::MockLatticeCloud::new();
        mock.expect_find_target_group().returning(|_| Ok(None));
        mock.expect_create_target_group().returning(|_| {
            Err(CloudError::new(
                CloudErrorKind::AccessDenied,
                "CreateTargetGroup",
                "not authorized",
            ))
        });
        // any other call panics the mock

        let deployer = StackDeployer::new(
            Arc::new(mock),
            Arc::new(LatticeDataStore::new()),
            DeployerConfig::default(),
        );
        let err = deployer
            .deploy(
                &route_stack("service1", &["a"], StackMode::Apply),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(deployer
            .store()
            .target_groups_referenced_by(&StackId::new("default", "service1"))
            .is_empty());
    }

    /// Story: Throttling mid-deploy keeps what was applied and retries later
    #[tokio::test]
    async fn story_throttled_listener_create_converges_on_retry() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let stack = route_stack("service1", &["a"], StackMode::Apply);
        let cancel = CancellationToken::new();

        cloud.fail_next("CreateListener", CloudErrorKind::Throttled);
        let err = deployer.deploy(&stack, &cancel).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cloud.service_count(), 1);
        assert_eq!(cloud.listener_count(), 0);

        cloud.reset_calls();
        deployer.deploy(&stack, &cancel).await.unwrap();
        assert_eq!(cloud.call_count("CreateService"), 0);
        assert_eq!(cloud.call_count("CreateListener"), 1);
    }

    // =========================================================================
    // Cleanup Stories
    // =========================================================================

    /// Story: Cleanup removes every resource the route owns
    #[tokio::test]
    async fn story_cleanup_removes_everything() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let cancel = CancellationToken::new();

        deployer
            .deploy(&route_stack("service1", &["a", "b"], StackMode::Apply), &cancel)
            .await
            .unwrap();

        let report = deployer
            .deploy(&route_stack("service1", &["a", "b"], StackMode::Cleanup), &cancel)
            .await
            .unwrap();
        assert!(report.deleted >= 5, "{report:?}");
        assert_eq!(cloud.service_count(), 0);
        assert_eq!(cloud.listener_count(), 0);
        assert!(cloud.target_group_names().is_empty());

        let id = StackId::new("default", "service1");
        assert!(deployer.store().get_service(&id).is_none());
        assert!(deployer.store().listener_ports(&id).is_empty());
        assert!(deployer.store().target_groups_referenced_by(&id).is_empty());
    }

    /// Story: A target group shared by two routes survives the first cleanup
    #[tokio::test]
    async fn story_shared_target_group_outlives_first_route() {
        let cloud = Arc::new(MemoryCloud::new());
        let deployer = deployer(cloud.clone());
        let cancel = CancellationToken::new();

        for route in ["one", "two"] {
            deployer
                .deploy(&route_stack(route, &["shared"], StackMode::Apply), &cancel)
                .await
                .unwrap();
        }
        assert_eq!(cloud.target_group_names().len(), 1);

        deployer
            .deploy(&route_stack("one", &["shared"], StackMode::Cleanup), &cancel)
            .await
            .unwrap();
        assert_eq!(cloud.target_group_names(), vec!["k8s-shared-default-8080"]);
        assert_eq!(cloud.service_count(), 1);

        deployer
            .deploy(&route_stack("two", &["shared"], StackMode::Cleanup), &cancel)
            .await
            .unwrap();
        assert!(cloud.target_group_names().is_empty());
    }

    /// Story: A route adopting a target group while its last user is being
    /// cleaned up ends with a live, populated target group
    #[tokio::test]
    async fn story_adopting_target_group_during_last_release() {
        let inner = Arc::new(MemoryCloud::new());
        let resume = Arc::new(Notify::new());
        let cloud = Arc::new(GatedCloud::new(
            inner.clone(),
            "ListTargets",
            Gate::HoldUntil(resume.clone()),
        ));
        let store = Arc::new(LatticeDataStore::new());
        let deployer = Arc::new(StackDeployer::new(
            cloud.clone(),
            store.clone(),
            DeployerConfig::default(),
        ));
        let cancel = CancellationToken::new();

        deployer
            .deploy(&route_stack("one", &["shared"], StackMode::Apply), &cancel)
            .await
            .unwrap();

        // Route one's cleanup stops inside the release, right before it
        // deregisters the targets.
        cloud.arm();
        let cleanup = {
            let deployer = deployer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                deployer
                    .deploy(&route_stack("one", &["shared"], StackMode::Cleanup), &cancel)
                    .await
            })
        };
        cloud.reached.notified().await;

        let apply = {
            let deployer = deployer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                deployer
                    .deploy(&route_stack("two", &["shared"], StackMode::Apply), &cancel)
                    .await
            })
        };
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        resume.notify_one();

        cleanup.await.unwrap().expect("cleanup should succeed");
        apply.await.unwrap().expect("apply should succeed");

        let tg = inner
            .find_target_group("k8s-shared-default-8080")
            .await
            .unwrap()
            .expect("route two's target group should exist");
        assert_eq!(inner.list_targets(&tg.id).await.unwrap().len(), 1);
        let record = store.get_target_group(&tg_key("shared")).unwrap();
        assert_eq!(record.id, tg.id);
        assert_eq!(
            record.referenced_by,
            BTreeSet::from([StackId::new("default", "two")])
        );
    }

    /// Story: Cleanup after a restart finds resources by name
    #[tokio::test]
    async fn story_cleanup_with_empty_store_uses_cloud_lookup() {
        let cloud = Arc::new(MemoryCloud::new());
        let cancel = CancellationToken::new();
        deployer(cloud.clone())
            .deploy(&route_stack("service1", &["a"], StackMode::Apply), &cancel)
            .await
            .unwrap();

        // fresh store, same cloud
        deployer(cloud.clone())
            .deploy(&route_stack("service1", &["a"], StackMode::Cleanup), &cancel)
            .await
            .unwrap();
        assert_eq!(cloud.service_count(), 0);
        assert!(cloud.target_group_names().is_empty());
    }

    /// Story: Cleanup of a route that never deployed is a no-op
    #[tokio::test]
    async fn story_cleanup_of_unknown_route_succeeds() {
        let cloud = Arc::new(MemoryCloud::new());
        let report = deployer(cloud.clone())
            .deploy(
                &route_stack("ghost", &["a"], StackMode::Cleanup),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.is_noop());
        assert_eq!(cloud.calls_with_prefix("Delete"), 0);
    }
}
