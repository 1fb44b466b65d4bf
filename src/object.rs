//! Accessors over untyped policy and placement payloads.
//!
//! Policies carry nested, schema-flexible payloads; they are handled as
//! `DynamicObject` throughout and read through the helpers here. Every
//! lookup distinguishes *missing* (absent or null) from *invalid* (present
//! with the wrong shape): callers either require a level (failing the
//! resolve step) or log-and-skip.

use kube::api::DynamicObject;
use serde_json::Value;

use crate::{Error, Result};

/// Compliance value a policy reports for a cluster
pub const COMPLIANT: &str = "Compliant";
/// Non-compliance value a policy reports for a cluster
pub const NON_COMPLIANT: &str = "NonCompliant";

/// Per-cluster, per-policy observed compliance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compliance {
    /// The cluster satisfies the policy
    Compliant,
    /// The cluster violates the policy (or its status is unreadable)
    NonCompliant,
    /// The cluster does not appear in the policy's placement at all
    NotMatched,
}

/// Result of a single field lookup in an untyped payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field<T> {
    /// The field exists with the expected shape
    Found(T),
    /// The field is absent or null
    Missing,
    /// The field exists but has the wrong shape
    Invalid,
}

impl<T> Field<T> {
    /// Unwrap a field that the payload contract requires.
    ///
    /// `subject` and `path` feed the error message, e.g.
    /// `policy p1 is missing spec.policy-templates`.
    pub fn required(self, subject: &str, path: &str) -> Result<T> {
        match self {
            Field::Found(v) => Ok(v),
            Field::Missing => Err(Error::policy_format(format!(
                "{subject} is missing {path}"
            ))),
            Field::Invalid => Err(Error::policy_format(format!(
                "{subject} has a malformed {path}"
            ))),
        }
    }

    /// The found value, if any; Missing and Invalid both collapse to None
    pub fn ok(self) -> Option<T> {
        match self {
            Field::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Walk `path` through nested JSON maps, ending on any value.
fn value_at<'a>(root: &'a Value, path: &[&str]) -> Field<&'a Value> {
    let mut current = root;
    for key in path {
        match current {
            Value::Object(map) => match map.get(*key) {
                Some(Value::Null) | None => return Field::Missing,
                Some(next) => current = next,
            },
            Value::Null => return Field::Missing,
            _ => return Field::Invalid,
        }
    }
    Field::Found(current)
}

/// Look up a string at `path`
pub fn str_at<'a>(root: &'a Value, path: &[&str]) -> Field<&'a str> {
    match value_at(root, path) {
        Field::Found(Value::String(s)) => Field::Found(s.as_str()),
        Field::Found(_) => Field::Invalid,
        Field::Missing => Field::Missing,
        Field::Invalid => Field::Invalid,
    }
}

/// Look up an array at `path`
pub fn array_at<'a>(root: &'a Value, path: &[&str]) -> Field<&'a Vec<Value>> {
    match value_at(root, path) {
        Field::Found(Value::Array(items)) => Field::Found(items),
        Field::Found(_) => Field::Invalid,
        Field::Missing => Field::Missing,
        Field::Invalid => Field::Invalid,
    }
}

/// Look up an object at `path`
pub fn map_at<'a>(
    root: &'a Value,
    path: &[&str],
) -> Field<&'a serde_json::Map<String, Value>> {
    match value_at(root, path) {
        Field::Found(Value::Object(map)) => Field::Found(map),
        Field::Found(_) => Field::Invalid,
        Field::Missing => Field::Missing,
        Field::Invalid => Field::Invalid,
    }
}

/// The remediation action a policy declares, lowercased
pub fn remediation_action(policy: &DynamicObject) -> Option<String> {
    str_at(&policy.data, &["spec", "remediationAction"])
        .ok()
        .map(|s| s.to_lowercase())
}

/// Compliance of `cluster` according to `policy`'s status.
///
/// A policy with no readable per-cluster status list is treated as
/// NonCompliant: selection exists but compliance has not been reported yet,
/// so the cluster cannot be skipped. A cluster absent from the list is not
/// matched with the policy.
pub fn cluster_compliance(policy: &DynamicObject, cluster: &str) -> Compliance {
    let entries = match array_at(&policy.data, &["status", "status"]) {
        Field::Found(entries) => entries,
        _ => {
            tracing::debug!(
                policy = %policy.metadata.name.as_deref().unwrap_or(""),
                "policy has no per-cluster status list, treating as NonCompliant"
            );
            return Compliance::NonCompliant;
        }
    };

    for entry in entries {
        match str_at(entry, &["clustername"]) {
            Field::Found(name) if name == cluster => {
                return match str_at(entry, &["compliant"]) {
                    Field::Found(COMPLIANT) => Compliance::Compliant,
                    Field::Found(NON_COMPLIANT) => Compliance::NonCompliant,
                    // Pending or unreadable compliance cannot be skipped.
                    _ => Compliance::NonCompliant,
                };
            }
            _ => continue,
        }
    }
    Compliance::NotMatched
}
