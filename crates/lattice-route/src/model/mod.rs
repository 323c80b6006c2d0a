//! The resource graph ("stack") built for one route
//!
//! A [`Stack`] is an ordered, typed collection of cloud resource descriptors.
//! Each descriptor gets a stack-local [`ResourceId`] and is deduplicated on
//! its logical key, so rebuilding from the same route yields the same keys.

mod resources;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use lattice_common::{Error, NamespacedName};

pub use resources::{
    lattice_service_name, DefaultAction, HeaderMatch, HealthCheck, Listener, PathMatch, Protocol,
    Rule, RuleMatch, RuleTarget, ServiceResource, Target, TargetGroup, TargetGroupKey, Targets,
};

/// Identity of a stack: the route's `namespace/name`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackId(NamespacedName);

impl Serialize for StackId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl StackId {
    /// Stack id for the route `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self(NamespacedName::new(namespace, name))
    }

    /// Route namespace
    pub fn namespace(&self) -> &str {
        &self.0.namespace
    }

    /// Route name
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl From<NamespacedName> for StackId {
    fn from(nn: NamespacedName) -> Self {
        Self(nn)
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the deployer should do with a stack
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackMode {
    /// Converge the cloud to the stack contents
    #[default]
    Apply,
    /// Remove everything the route owns
    Cleanup,
}

/// Resource kinds a stack can hold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Lattice service
    Service,
    /// Service listener
    Listener,
    /// Listener rule
    Rule,
    /// Target group
    TargetGroup,
    /// Target group membership
    Targets,
}

impl ResourceKind {
    fn id_prefix(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Listener => "listener",
            Self::Rule => "rule",
            Self::TargetGroup => "targetgroup",
            Self::Targets => "targets",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Service => "Service",
            Self::Listener => "Listener",
            Self::Rule => "Rule",
            Self::TargetGroup => "TargetGroup",
            Self::Targets => "Targets",
        })
    }
}

/// Stack-local resource id, e.g. `listener-1`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A descriptor of any kind
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec")]
pub enum StackResource {
    /// Lattice service
    Service(ServiceResource),
    /// Service listener
    Listener(Listener),
    /// Listener rule
    Rule(Rule),
    /// Target group
    TargetGroup(TargetGroup),
    /// Target group membership
    Targets(Targets),
}

/// Implemented by every descriptor type so stacks can be queried by type
pub trait StackResourceType: Sized {
    /// Kind of this descriptor
    const KIND: ResourceKind;

    /// Key identifying the descriptor within its kind
    fn logical_key(&self) -> String;

    /// Wrap into the untyped enum
    fn into_resource(self) -> StackResource;

    /// Borrow back out of the untyped enum
    fn from_resource(resource: &StackResource) -> Option<&Self>;
}

#[derive(Clone, Debug, Serialize)]
struct StackEntry {
    id: ResourceId,
    #[serde(skip)]
    kind: ResourceKind,
    #[serde(skip)]
    logical_key: String,
    #[serde(flatten)]
    resource: StackResource,
}

/// Resource graph for one route
#[derive(Clone, Debug, Serialize)]
pub struct Stack {
    id: StackId,
    mode: StackMode,
    resources: Vec<StackEntry>,
    #[serde(skip)]
    counters: BTreeMap<ResourceKind, u32>,
}

impl Stack {
    /// Create an empty stack
    pub fn new(id: StackId, mode: StackMode) -> Self {
        Self {
            id,
            mode,
            resources: Vec::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Stack identity
    pub fn id(&self) -> &StackId {
        &self.id
    }

    /// Apply or cleanup
    pub fn mode(&self) -> StackMode {
        self.mode
    }

    /// Add a descriptor, returning its id
    ///
    /// If a descriptor of the same kind and logical key is already present,
    /// the stack is left unchanged and the existing id is returned.
    pub fn add<R: StackResourceType>(&mut self, resource: R) -> ResourceId {
        let logical_key = resource.logical_key();
        if let Some(existing) = self
            .resources
            .iter()
            .find(|e| e.kind == R::KIND && e.logical_key == logical_key)
        {
            return existing.id.clone();
        }

        let counter = self.counters.entry(R::KIND).or_insert(0);
        *counter += 1;
        let id = ResourceId(format!("{}-{}", R::KIND.id_prefix(), counter));
        self.resources.push(StackEntry {
            id: id.clone(),
            kind: R::KIND,
            logical_key,
            resource: resource.into_resource(),
        });
        id
    }

    /// All descriptors of type `R`, in insertion order
    pub fn list<R: StackResourceType>(&self) -> Vec<&R> {
        self.resources
            .iter()
            .filter(|e| e.kind == R::KIND)
            .filter_map(|e| R::from_resource(&e.resource))
            .collect()
    }

    /// Descriptor of type `R` with the given id
    pub fn get<R: StackResourceType>(&self, id: &ResourceId) -> Option<&R> {
        self.resources
            .iter()
            .find(|e| &e.id == id)
            .and_then(|e| R::from_resource(&e.resource))
    }

    /// Logical keys of every descriptor of type `R`, in insertion order
    pub fn logical_keys<R: StackResourceType>(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|e| e.kind == R::KIND)
            .map(|e| e.logical_key.as_str())
            .collect()
    }

    /// Total number of descriptors
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the stack holds no descriptors
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// JSON rendering for debug logs
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| {
            Error::internal_with_context("stack", format!("failed to marshal stack: {e}"))
        })
    }
}
