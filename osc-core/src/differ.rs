//! Differ - Compare desired configuration with observed state
//!
//! Two levels of comparison live here:
//!
//! - attribute level: which top-level attributes changed, and whether a resource
//!   needs creating, updating or nothing at all;
//! - item level: for composite attributes (listeners, attached instances, subnets,
//!   tags, ...) the [`DiffSet`] of sub-items to add and remove, and [`apply_diff`]
//!   which issues the minimal add/remove calls.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;

use log::{debug, info};

use crate::provider::{ProviderError, ProviderResult};
use crate::resource::{Resource, ResourceId, State, Value};
use crate::retry::{RetryPolicy, retry};
use crate::schema::ResourceSchema;
use crate::timeouts::TIMEOUTS_ATTRIBUTE;

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Resource does not exist -> needs creation
    Create(Resource),
    /// Resource exists with differences -> needs update
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Resource exists with no differences -> no action needed
    NoChange(ResourceId),
}

impl Diff {
    /// Returns whether this Diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange(_))
    }
}

/// Compare desired configuration with current state to compute a Diff
pub fn diff(schema: &ResourceSchema, desired: &Resource, current: &State) -> Diff {
    if !current.exists {
        return Diff::Create(desired.clone());
    }

    let changed = changed_attributes(schema, &desired.attributes, &current.attributes);

    if changed.is_empty() {
        Diff::NoChange(desired.id.clone())
    } else {
        Diff::Update {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    }
}

/// Attributes whose desired value differs from the current one, sorted by name
///
/// Values are compared through the schema (set semantics, normalisation). A
/// removable attribute missing from `desired` counts as changed while the cloud
/// still holds a non-empty value for it.
pub fn changed_attributes(
    schema: &ResourceSchema,
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
) -> Vec<String> {
    let updated = desired
        .iter()
        .filter(|(key, _)| is_managed(key))
        .filter(|(key, desired_value)| match current.get(key.as_str()) {
            Some(current_value) => !schema.equivalent(key, desired_value, current_value),
            None => true,
        })
        .map(|(key, _)| key.clone());

    let cleared = current
        .iter()
        .filter(|(key, value)| {
            is_managed(key) && schema.clears(key, desired) && !value.is_empty()
        })
        .map(|(key, _)| key.clone());

    let mut changed: Vec<String> = updated.chain(cleared).collect();
    changed.sort();
    changed
}

/// Internal attributes (starting with _) and timeouts never reach the API
fn is_managed(key: &str) -> bool {
    !key.starts_with('_') && key != TIMEOUTS_ATTRIBUTE
}

/// Items to add and remove to turn one collection into another
///
/// Items are compared through an identity key; an item whose key is present on
/// both sides appears in neither list.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffSet<T> {
    pub to_add: Vec<T>,
    pub to_remove: Vec<T>,
}

impl<T> Default for DiffSet<T> {
    fn default() -> Self {
        Self {
            to_add: Vec::new(),
            to_remove: Vec::new(),
        }
    }
}

impl<T: Clone> DiffSet<T> {
    /// `to_remove = old \ new`, `to_add = new \ old`, compared by `identity`
    pub fn compute<K, F>(old: &[T], new: &[T], identity: F) -> Self
    where
        K: Eq + Hash,
        F: Fn(&T) -> K,
    {
        let old_keys: HashSet<K> = old.iter().map(&identity).collect();
        let new_keys: HashSet<K> = new.iter().map(&identity).collect();

        Self {
            to_add: unique_missing(new, &old_keys, &identity),
            to_remove: unique_missing(old, &new_keys, &identity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

}

impl DiffSet<String> {
    /// Plain string sets (instance IDs, subnet IDs, zone names, private IPs)
    pub fn of_strings(old: &[String], new: &[String]) -> Self {
        Self::compute(old, new, |s| s.clone())
    }
}

impl DiffSet<(String, String)> {
    /// Key/value maps such as tags: a changed value removes the old pair and adds the new one
    pub fn compute_map(old: &HashMap<String, String>, new: &HashMap<String, String>) -> Self {
        let mut old_pairs: Vec<(String, String)> =
            old.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut new_pairs: Vec<(String, String)> =
            new.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        old_pairs.sort();
        new_pairs.sort();
        Self::compute(&old_pairs, &new_pairs, |pair| pair.clone())
    }
}

fn unique_missing<T, K, F>(items: &[T], other_keys: &HashSet<K>, identity: &F) -> Vec<T>
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| {
            let key = identity(*item);
            !other_keys.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect()
}

/// Which side of a diff is applied first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOrder {
    /// Free identities before reusing them (listener ports, subnets in one zone)
    RemoveFirst,
    /// Keep capacity while swapping (availability zones, registered instances)
    AddFirst,
}

/// Ordering and per-side retry policy for one composite attribute
#[derive(Debug, Clone)]
pub struct DiffPolicy {
    pub order: ApplyOrder,
    pub add: RetryPolicy,
    pub remove: RetryPolicy,
}

impl DiffPolicy {
    pub fn new(order: ApplyOrder, retry: RetryPolicy) -> Self {
        Self {
            order,
            add: retry.clone(),
            remove: retry,
        }
    }

    pub fn with_add_policy(mut self, policy: RetryPolicy) -> Self {
        self.add = policy;
        self
    }

    pub fn with_remove_policy(mut self, policy: RetryPolicy) -> Self {
        self.remove = policy;
        self
    }
}

/// Side of a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSide {
    Add,
    Remove,
}

impl fmt::Display for DiffSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffSide::Add => f.write_str("add"),
            DiffSide::Remove => f.write_str("remove"),
        }
    }
}

/// A diff that was only partly applied
///
/// Items of `applied` stay applied; the next reconcile recomputes from fresh state.
#[derive(Debug)]
pub struct DiffError {
    pub failed: DiffSide,
    pub applied: Option<DiffSide>,
    pub error: ProviderError,
}

impl fmt::Display for DiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {} items", self.failed)?;
        if let Some(applied) = self.applied {
            write!(f, " after the {} step succeeded", applied)?;
        }
        write!(f, ": {}", self.error)
    }
}

impl std::error::Error for DiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<DiffError> for ProviderError {
    fn from(err: DiffError) -> Self {
        let message = err.to_string();
        let DiffError { error, .. } = err;
        let mut converted = ProviderError::new(error.class, message);
        converted.resource_id = error.resource_id.clone();
        converted.operation = error.operation;
        converted.last_state = error.last_state.clone();
        converted.with_cause(error)
    }
}

/// Apply a [`DiffSet`] with one batched call per non-empty side
///
/// Each side is retried on its own policy. An empty diff makes no calls. Nothing is
/// rolled back when the second side fails.
pub async fn apply_diff<T, A, AF, R, RF>(
    diff: &DiffSet<T>,
    policy: &DiffPolicy,
    mut add: A,
    mut remove: R,
) -> Result<(), DiffError>
where
    T: Clone + fmt::Debug,
    A: FnMut(Vec<T>) -> AF,
    AF: Future<Output = ProviderResult<()>>,
    R: FnMut(Vec<T>) -> RF,
    RF: Future<Output = ProviderResult<()>>,
{
    if diff.is_empty() {
        debug!("diff is empty, nothing to apply");
        return Ok(());
    }

    let sides = match policy.order {
        ApplyOrder::RemoveFirst => [DiffSide::Remove, DiffSide::Add],
        ApplyOrder::AddFirst => [DiffSide::Add, DiffSide::Remove],
    };

    let mut applied = None;
    for side in sides {
        let result = match side {
            DiffSide::Add if !diff.to_add.is_empty() => {
                info!("adding {:?}", diff.to_add);
                retry(&policy.add, || add(diff.to_add.clone())).await
            }
            DiffSide::Remove if !diff.to_remove.is_empty() => {
                info!("removing {:?}", diff.to_remove);
                retry(&policy.remove, || remove(diff.to_remove.clone())).await
            }
            _ => continue,
        };

        match result {
            Ok(()) => applied = Some(side),
            Err(error) => {
                return Err(DiffError {
                    failed: side,
                    applied,
                    error,
                });
            }
        }
    }

    Ok(())
}
