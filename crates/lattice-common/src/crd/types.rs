//! Shared status types for Gateway API resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// `last_transition_time` is `None` until the condition first transitions
/// away from its initial state. Callers latch it with
/// [`Condition::latch_transition_time`] rather than stamping it on every
/// update, so repeated reconciles produce byte-identical status.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Accepted, ResolvedRefs)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Generation of the object this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned; unset until the first transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a new condition with an unset transition time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: None,
        }
    }

    /// Set the observed generation
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Whether the transition time has been latched
    pub fn is_transition_time_set(&self) -> bool {
        self.last_transition_time.is_some()
    }

    /// Carry over or latch the transition time relative to `previous`.
    ///
    /// The time is latched to `now` when there is no previous time or when
    /// the status changed; otherwise the previous time is kept.
    pub fn latch_transition_time(
        mut self,
        previous: Option<&Condition>,
        now: DateTime<Utc>,
    ) -> Self {
        self.last_transition_time = match previous {
            Some(prev) if prev.status == self.status && prev.is_transition_time_set() => {
                prev.last_transition_time
            }
            _ => Some(now),
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_condition_has_unset_transition_time() {
        let c = Condition::new("Accepted", ConditionStatus::True, "Accepted", "ok");
        assert!(!c.is_transition_time_set());
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("lastTransitionTime").is_none());
        assert_eq!(json["type"], "Accepted");
    }

    #[test]
    fn latch_sets_time_on_first_transition_only() {
        let t0 = Utc::now();
        let first = Condition::new("Accepted", ConditionStatus::True, "Accepted", "a")
            .latch_transition_time(None, t0);
        assert_eq!(first.last_transition_time, Some(t0));

        let later = t0 + Duration::seconds(30);
        let second = Condition::new("Accepted", ConditionStatus::True, "Accepted", "a")
            .latch_transition_time(Some(&first), later);
        assert_eq!(second.last_transition_time, Some(t0));
    }

    #[test]
    fn latch_advances_when_previous_is_unset_or_status_changes() {
        let t0 = Utc::now();
        let unset = Condition::new("Accepted", ConditionStatus::True, "Accepted", "a");
        let c = Condition::new("Accepted", ConditionStatus::True, "Accepted", "a")
            .latch_transition_time(Some(&unset), t0);
        assert_eq!(c.last_transition_time, Some(t0));

        let later = t0 + Duration::seconds(5);
        let flipped = Condition::new("Accepted", ConditionStatus::False, "Invalid", "b")
            .latch_transition_time(Some(&c), later);
        assert_eq!(flipped.last_transition_time, Some(later));
    }

    #[test]
    fn condition_status_display() {
        assert_eq!(ConditionStatus::True.to_string(), "True");
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }
}
