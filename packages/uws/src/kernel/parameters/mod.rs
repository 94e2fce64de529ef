//! Job parameters and per-parameter controllers.
//!
//! A job carries an insertion-ordered map of named values. The five
//! UWS control parameters (PHASE, RUNID, EXECUTIONDURATION, DESTRUCTION,
//! ACTION) match case-insensitively and are canonicalized to their
//! uppercase names; anything else is stored verbatim and stays
//! addressable under the same name.
//!
//! Controllers (see [`controllers`]) validate, coerce, and default
//! individual parameters. A parameter without a controller is stored
//! uncontrolled.

mod controllers;

pub use controllers::{
    Checked, ControllerMap, CustomController, DestructionTimeController,
    DurationController, ExecutionDurationController, NumericController, ParamContext,
    ParameterController, StringController,
};

use indexmap::IndexMap;
use serde_json::Value;

/// Requested start phase, set at creation time (`PHASE=RUN`).
pub const PARAM_PHASE: &str = "PHASE";
/// Optional client-supplied job label.
pub const PARAM_RUN_ID: &str = "RUNID";
/// Per-job execution budget in seconds (0 = no limit).
pub const PARAM_EXECUTION_DURATION: &str = "EXECUTIONDURATION";
/// Absolute destruction instant (ISO-8601).
pub const PARAM_DESTRUCTION: &str = "DESTRUCTION";
/// Reserved control action; `ACTION=DELETE` destroys the job.
pub const PARAM_ACTION: &str = "ACTION";

const CONTROL_PARAMETERS: [&str; 5] = [
    PARAM_PHASE,
    PARAM_RUN_ID,
    PARAM_EXECUTION_DURATION,
    PARAM_DESTRUCTION,
    PARAM_ACTION,
];

/// Canonical storage name: uppercase for UWS control parameters,
/// verbatim otherwise.
pub fn canonical_name(name: &str) -> String {
    CONTROL_PARAMETERS
        .iter()
        .find(|control| name.eq_ignore_ascii_case(control))
        .map(|control| control.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Insertion-ordered parameter map with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobParameters {
    values: IndexMap<String, Value>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        let mut parameters = Self::new();
        for (name, value) in pairs {
            parameters.set(name.as_ref(), value.into());
        }
        parameters
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(&canonical_name(name))
    }

    /// Convenience accessor for parameters used as text.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Insert or overwrite; returns the previous value if any.
    pub fn set(&mut self, name: &str, value: Value) -> Option<Value> {
        self.values.insert(canonical_name(name), value)
    }

    /// Remove a parameter, preserving the order of the others.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.shift_remove(&canonical_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&canonical_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    pub fn into_map(self) -> IndexMap<String, Value> {
        self.values
    }
}

impl From<IndexMap<String, Value>> for JobParameters {
    fn from(values: IndexMap<String, Value>) -> Self {
        let mut parameters = Self::new();
        for (name, value) in values {
            parameters.set(&name, value);
        }
        parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_parameters_match_case_insensitively() {
        let mut params = JobParameters::new();
        params.set("phase", json!("RUN"));
        assert_eq!(params.get("PHASE"), Some(&json!("RUN")));
        assert_eq!(params.get("Phase"), Some(&json!("RUN")));
        assert_eq!(params.len(), 1);

        params.set("PHASE", json!("ABORT"));
        assert_eq!(params.len(), 1);
        assert_eq!(params.get_str("phase"), Some("ABORT"));
    }

    #[test]
    fn uncontrolled_parameters_are_case_sensitive() {
        let mut params = JobParameters::new();
        params.set("speed", json!(1));
        assert!(params.get("SPEED").is_none());
        assert_eq!(params.get("speed"), Some(&json!(1)));
    }

    #[test]
    fn enumeration_preserves_insertion_order() {
        let params = JobParameters::from_pairs([("c", 1), ("a", 2), ("b", 3)]);
        let names: Vec<_> = params.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let mut params = JobParameters::from_pairs([("c", 1), ("a", 2), ("b", 3)]);
        params.remove("a");
        let names: Vec<_> = params.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["c", "b"]);
    }
}
