//! Decides which entitlement certificates went stale after a consumer's
//! environment list changed.
//!
//! An entitlement is dirty when, for any content id it carries, the winning
//! environment differs between the old and the new ordering. Moving from or to
//! [`Winner::Unassigned`] counts as a change; reordering environments whose
//! winners stay put does not.

use crate::content::paths::{winner, PromotionScope};
use crate::types::{ConsumerId, ContentId, EntitlementId, Environment, EnvironmentId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Winning environment for a content id under some ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Winner<'a> {
    Environment(&'a str),
    Unassigned,
}

/// An environment reduced to its id and promoted content ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentPromotions {
    pub environment_id: EnvironmentId,
    pub content_ids: BTreeSet<ContentId>,
}

impl EnvironmentPromotions {
    pub fn new<I, S>(environment_id: impl Into<String>, content_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            environment_id: environment_id.into(),
            content_ids: content_ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&Environment> for EnvironmentPromotions {
    fn from(env: &Environment) -> Self {
        Self {
            environment_id: env.id.clone(),
            content_ids: env.contents.keys().cloned().collect(),
        }
    }
}

impl PromotionScope for EnvironmentPromotions {
    fn scope_id(&self) -> &str {
        &self.environment_id
    }

    fn promotes(&self, content_id: &str) -> bool {
        self.content_ids.contains(content_id)
    }
}

pub fn winner_of<'a>(ordering: &'a [EnvironmentPromotions], content_id: &str) -> Winner<'a> {
    match winner(ordering, content_id) {
        Some(scope) => Winner::Environment(scope.scope_id()),
        None => Winner::Unassigned,
    }
}

/// The content ids an entitlement's product graph carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementContent {
    pub entitlement_id: EntitlementId,
    pub consumer_id: ConsumerId,
    pub content_ids: BTreeSet<ContentId>,
}

/// Content ids, among `content_ids`, whose winner differs between orderings.
pub fn changed_content<'c, I>(
    content_ids: I,
    before: &[EnvironmentPromotions],
    after: &[EnvironmentPromotions],
) -> BTreeSet<ContentId>
where
    I: IntoIterator<Item = &'c ContentId>,
{
    content_ids
        .into_iter()
        .filter(|id| winner_of(before, id) != winner_of(after, id))
        .cloned()
        .collect()
}

/// Ids of the entitlements whose certificates need regenerating.
pub fn detect_dirty_entitlements(
    entitlements: &[EntitlementContent],
    before: &[EnvironmentPromotions],
    after: &[EnvironmentPromotions],
) -> BTreeSet<EntitlementId> {
    let relevant: BTreeSet<&ContentId> = entitlements
        .iter()
        .flat_map(|e| e.content_ids.iter())
        .collect();
    let changed = changed_content(relevant, before, after);

    let mut per_consumer: BTreeMap<&str, usize> = BTreeMap::new();
    let dirty: BTreeSet<EntitlementId> = entitlements
        .iter()
        .filter(|e| !e.content_ids.is_disjoint(&changed))
        .map(|e| {
            *per_consumer.entry(e.consumer_id.as_str()).or_default() += 1;
            e.entitlement_id.clone()
        })
        .collect();

    debug!(
        "{} content ids changed winner, {} of {} entitlements dirty across {} consumers",
        changed.len(),
        dirty.len(),
        entitlements.len(),
        per_consumer.len()
    );
    dirty
}
