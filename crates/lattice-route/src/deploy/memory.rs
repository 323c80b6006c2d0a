//! In-memory [`LatticeCloud`]
//!
//! Behaves like the real control plane for the operations the deployer uses:
//! ids are allocated on create, dependents block deletes with `Conflict`, and
//! every call is counted. Failures can be injected per operation.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::cloud::{
    CloudError, CloudErrorKind, CloudListener, CloudRule, CloudService, CloudTargetGroup,
    LatticeCloud, ListenerSpec, RuleSpec, ServiceSpec, TargetGroupSpec,
};
use crate::model::Target;

/// DNS suffix of services created by [`MemoryCloud`]
pub const DEFAULT_DNS_SUFFIX: &str = "vpc-lattice-svcs.local";

#[derive(Default)]
struct State {
    next_id: u64,
    services: BTreeMap<String, CloudService>,
    listeners: BTreeMap<String, Vec<CloudListener>>,
    rules: BTreeMap<String, Vec<CloudRule>>,
    target_groups: BTreeMap<String, CloudTargetGroup>,
    targets: BTreeMap<String, BTreeSet<Target>>,
    calls: BTreeMap<&'static str, usize>,
    failures: BTreeMap<&'static str, CloudErrorKind>,
}

impl State {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    fn begin(&mut self, op: &'static str) -> Result<(), CloudError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.remove(op) {
            Some(kind) => Err(CloudError::new(kind, op, "injected failure")),
            None => Ok(()),
        }
    }

    fn target_group_in_use(&self, id: &str) -> bool {
        let by_listener = self
            .listeners
            .values()
            .flatten()
            .any(|l| l.spec.default_target_group_id == id);
        let by_rule = self
            .rules
            .values()
            .flatten()
            .any(|r| r.spec.targets.iter().any(|t| t.target_group_id == id));
        by_listener || by_rule
    }
}

fn not_found(op: &str, what: &str) -> CloudError {
    CloudError::new(CloudErrorKind::NotFound, op, format!("{what} not found"))
}

/// Process-local cloud used by tests and by the controller when no remote
/// control plane is configured
pub struct MemoryCloud {
    state: Mutex<State>,
    dns_suffix: String,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    /// Create an empty cloud
    pub fn new() -> Self {
        Self::with_dns_suffix(DEFAULT_DNS_SUFFIX)
    }

    /// Create an empty cloud assigning DNS names under `suffix`
    pub fn with_dns_suffix(suffix: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            dns_suffix: suffix.into(),
        }
    }

    /// Make the next call to `operation` fail with `kind`
    pub fn fail_next(&self, operation: &'static str, kind: CloudErrorKind) {
        self.state.lock().failures.insert(operation, kind);
    }

    /// Number of calls made to `operation`
    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Number of calls to operations whose name starts with `prefix`
    pub fn calls_with_prefix(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(op, _)| op.starts_with(prefix))
            .map(|(_, n)| n)
            .sum()
    }

    /// Forget every recorded call
    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of services
    pub fn service_count(&self) -> usize {
        self.state.lock().services.len()
    }

    /// Number of listeners across all services
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.values().map(Vec::len).sum()
    }

    /// Number of rules across all listeners
    pub fn rule_count(&self) -> usize {
        self.state.lock().rules.values().map(Vec::len).sum()
    }

    /// Names of all target groups, sorted
    pub fn target_group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .target_groups
            .values()
            .map(|tg| tg.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Seed a target group created outside this controller (e.g. by an
    /// exporting cluster)
    pub fn insert_target_group(&self, spec: TargetGroupSpec) -> CloudTargetGroup {
        let mut state = self.state.lock();
        let id = state.allocate("tg");
        let tg = CloudTargetGroup {
            arn: format!("arn:aws:vpc-lattice:::targetgroup/{id}"),
            id: id.clone(),
            spec,
        };
        state.target_groups.insert(id, tg.clone());
        tg
    }
}

#[async_trait]
impl LatticeCloud for MemoryCloud {
    async fn find_service(&self, name: &str) -> Result<Option<CloudService>, CloudError> {
        let mut state = self.state.lock();
        state.begin("FindService")?;
        Ok(state.services.values().find(|s| s.spec.name == name).cloned())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<CloudService, CloudError> {
        let mut state = self.state.lock();
        state.begin("CreateService")?;
        if state.services.values().any(|s| s.spec.name == spec.name) {
            return Err(CloudError::new(
                CloudErrorKind::Conflict,
                "CreateService",
                format!("service {} already exists", spec.name),
            ));
        }
        let id = state.allocate("svc");
        let service = CloudService {
            arn: format!("arn:aws:vpc-lattice:::service/{id}"),
            dns: format!("{}-{}.{}", spec.name, id, self.dns_suffix),
            id: id.clone(),
            spec: spec.clone(),
        };
        state.services.insert(id, service.clone());
        Ok(service)
    }

    async fn update_service(
        &self,
        id: &str,
        spec: &ServiceSpec,
    ) -> Result<CloudService, CloudError> {
        let mut state = self.state.lock();
        state.begin("UpdateService")?;
        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| not_found("UpdateService", id))?;
        service.spec = spec.clone();
        Ok(service.clone())
    }

    async fn delete_service(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.begin("DeleteService")?;
        if state.listeners.get(id).is_some_and(|l| !l.is_empty()) {
            return Err(CloudError::new(
                CloudErrorKind::Conflict,
                "DeleteService",
                "service still has listeners",
            ));
        }
        state.listeners.remove(id);
        state
            .services
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("DeleteService", id))
    }

    async fn list_listeners(&self, service_id: &str) -> Result<Vec<CloudListener>, CloudError> {
        let mut state = self.state.lock();
        state.begin("ListListeners")?;
        if !state.services.contains_key(service_id) {
            return Err(not_found("ListListeners", service_id));
        }
        Ok(state.listeners.get(service_id).cloned().unwrap_or_default())
    }

    async fn create_listener(
        &self,
        service_id: &str,
        spec: &ListenerSpec,
    ) -> Result<CloudListener, CloudError> {
        let mut state = self.state.lock();
        state.begin("CreateListener")?;
        if !state.services.contains_key(service_id) {
            return Err(not_found("CreateListener", service_id));
        }
        if !state.target_groups.contains_key(&spec.default_target_group_id) {
            return Err(not_found("CreateListener", &spec.default_target_group_id));
        }
        let listeners = state.listeners.get(service_id).cloned().unwrap_or_default();
        if listeners.iter().any(|l| l.spec.port == spec.port) {
            return Err(CloudError::new(
                CloudErrorKind::Conflict,
                "CreateListener",
                format!("port {} already has a listener", spec.port),
            ));
        }
        let id = state.allocate("listener");
        let listener = CloudListener {
            arn: format!("arn:aws:vpc-lattice:::service/{service_id}/listener/{id}"),
            id,
            spec: spec.clone(),
        };
        state
            .listeners
            .entry(service_id.to_string())
            .or_default()
            .push(listener.clone());
        Ok(listener)
    }

    async fn update_listener(
        &self,
        service_id: &str,
        listener_id: &str,
        spec: &ListenerSpec,
    ) -> Result<CloudListener, CloudError> {
        let mut state = self.state.lock();
        state.begin("UpdateListener")?;
        let listener = state
            .listeners
            .get_mut(service_id)
            .and_then(|ls| ls.iter_mut().find(|l| l.id == listener_id))
            .ok_or_else(|| not_found("UpdateListener", listener_id))?;
        listener.spec = spec.clone();
        Ok(listener.clone())
    }

    async fn delete_listener(&self, service_id: &str, listener_id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.begin("DeleteListener")?;
        let listeners = state
            .listeners
            .get_mut(service_id)
            .ok_or_else(|| not_found("DeleteListener", service_id))?;
        let before = listeners.len();
        listeners.retain(|l| l.id != listener_id);
        if listeners.len() == before {
            return Err(not_found("DeleteListener", listener_id));
        }
        state.rules.remove(listener_id);
        Ok(())
    }

    async fn list_rules(
        &self,
        _service_id: &str,
        listener_id: &str,
    ) -> Result<Vec<CloudRule>, CloudError> {
        let mut state = self.state.lock();
        state.begin("ListRules")?;
        Ok(state.rules.get(listener_id).cloned().unwrap_or_default())
    }

    async fn create_rule(
        &self,
        service_id: &str,
        listener_id: &str,
        spec: &RuleSpec,
    ) -> Result<CloudRule, CloudError> {
        let mut state = self.state.lock();
        state.begin("CreateRule")?;
        if let Some(missing) = spec
            .targets
            .iter()
            .find(|t| !state.target_groups.contains_key(&t.target_group_id))
        {
            return Err(not_found("CreateRule", &missing.target_group_id));
        }
        let id = state.allocate("rule");
        let rule = CloudRule {
            arn: format!(
                "arn:aws:vpc-lattice:::service/{service_id}/listener/{listener_id}/rule/{id}"
            ),
            id,
            spec: spec.clone(),
        };
        state
            .rules
            .entry(listener_id.to_string())
            .or_default()
            .push(rule.clone());
        Ok(rule)
    }

    async fn update_rule(
        &self,
        _service_id: &str,
        listener_id: &str,
        rule_id: &str,
        spec: &RuleSpec,
    ) -> Result<CloudRule, CloudError> {
        let mut state = self.state.lock();
        state.begin("UpdateRule")?;
        let rule = state
            .rules
            .get_mut(listener_id)
            .and_then(|rs| rs.iter_mut().find(|r| r.id == rule_id))
            .ok_or_else(|| not_found("UpdateRule", rule_id))?;
        rule.spec = spec.clone();
        Ok(rule.clone())
    }

    async fn delete_rule(
        &self,
        _service_id: &str,
        listener_id: &str,
        rule_id: &str,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.begin("DeleteRule")?;
        let rules = state
            .rules
            .get_mut(listener_id)
            .ok_or_else(|| not_found("DeleteRule", listener_id))?;
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        if rules.len() == before {
            return Err(not_found("DeleteRule", rule_id));
        }
        Ok(())
    }

    async fn find_target_group(&self, name: &str) -> Result<Option<CloudTargetGroup>, CloudError> {
        let mut state = self.state.lock();
        state.begin("FindTargetGroup")?;
        Ok(state
            .target_groups
            .values()
            .find(|tg| tg.spec.name == name)
            .cloned())
    }

    async fn create_target_group(
        &self,
        spec: &TargetGroupSpec,
    ) -> Result<CloudTargetGroup, CloudError> {
        let mut state = self.state.lock();
        state.begin("CreateTargetGroup")?;
        if state.target_groups.values().any(|tg| tg.spec.name == spec.name) {
            return Err(CloudError::new(
                CloudErrorKind::Conflict,
                "CreateTargetGroup",
                format!("target group {} already exists", spec.name),
            ));
        }
        let id = state.allocate("tg");
        let tg = CloudTargetGroup {
            arn: format!("arn:aws:vpc-lattice:::targetgroup/{id}"),
            id: id.clone(),
            spec: spec.clone(),
        };
        state.target_groups.insert(id, tg.clone());
        Ok(tg)
    }

    async fn update_target_group(
        &self,
        id: &str,
        spec: &TargetGroupSpec,
    ) -> Result<CloudTargetGroup, CloudError> {
        let mut state = self.state.lock();
        state.begin("UpdateTargetGroup")?;
        let tg = state
            .target_groups
            .get_mut(id)
            .ok_or_else(|| not_found("UpdateTargetGroup", id))?;
        tg.spec = spec.clone();
        Ok(tg.clone())
    }

    async fn delete_target_group(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.begin("DeleteTargetGroup")?;
        if state.target_group_in_use(id) {
            return Err(CloudError::new(
                CloudErrorKind::Conflict,
                "DeleteTargetGroup",
                format!("target group {id} is in use"),
            ));
        }
        state.targets.remove(id);
        state
            .target_groups
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("DeleteTargetGroup", id))
    }

    async fn list_targets(&self, target_group_id: &str) -> Result<Vec<Target>, CloudError> {
        let mut state = self.state.lock();
        state.begin("ListTargets")?;
        if !state.target_groups.contains_key(target_group_id) {
            return Err(not_found("ListTargets", target_group_id));
        }
        Ok(state
            .targets
            .get(target_group_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn register_targets(
        &self,
        target_group_id: &str,
        targets: Vec<Target>,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.begin("RegisterTargets")?;
        if !state.target_groups.contains_key(target_group_id) {
            return Err(not_found("RegisterTargets", target_group_id));
        }
        state
            .targets
            .entry(target_group_id.to_string())
            .or_default()
            .extend(targets);
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_id: &str,
        targets: Vec<Target>,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock();
        state.begin("DeregisterTargets")?;
        if let Some(registered) = state.targets.get_mut(target_group_id) {
            for t in &targets {
                registered.remove(t);
            }
        }
        Ok(())
    }
}
