//! # Field Merge Policies
//!
//! When a conditional write loses a race, the coordinator reloads the record and
//! replays the caller's changes onto it. A change is whatever differs between the
//! copy the caller originally loaded and the copy it tried to write, so fields the
//! caller never touched keep the concurrently written values.

use crate::constants::WORKER_LOG_CAPACITY;
use crate::models::log_entry::truncate_to_last;
use crate::models::{FleetBox, StreamRecord, Tab, Worker};

/// How a field is reconciled against a concurrently written record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// The caller's value wins if the caller changed it
    Scalar,
    /// Only entries appended by the caller are carried over, then the list is bounded
    AppendOnly,
    /// Elements are merged by position; positions missing on the fresh record are appended
    IndexMerge,
    /// Additions and removals are replayed as set operations, deduplicated
    SetUnion,
}

/// Records whose caller-side changes can be replayed onto a fresher copy
pub trait Mergeable: Sized {
    /// Non-scalar fields and their merge policy; every other field is [`MergePolicy::Scalar`]
    const LIST_FIELDS: &'static [(&'static str, MergePolicy)];

    /// Apply the changes `self` made relative to `original` onto `fresh`
    fn merge_onto(&self, original: &Self, fresh: Self) -> Self;

    fn policy_for(field: &str) -> MergePolicy {
        Self::LIST_FIELDS
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, policy)| *policy)
            .unwrap_or(MergePolicy::Scalar)
    }
}

pub fn merge_scalar<T: PartialEq + Clone>(ours: &T, original: &T, fresh: &mut T) {
    if ours != original {
        *fresh = ours.clone();
    }
}

/// Append the entries `ours` added after `original`'s last entry, skipping any the
/// fresh record already holds, then keep the last `capacity`
pub fn merge_append_only<T: PartialEq + Clone>(
    ours: &[T],
    original: &[T],
    fresh: &mut Vec<T>,
    capacity: usize,
) {
    let start = match original.last() {
        None => 0,
        Some(last) => ours
            .iter()
            .rposition(|entry| entry == last)
            .map(|pos| pos + 1)
            // The caller pushed enough to evict everything it had loaded
            .unwrap_or(0),
    };

    for entry in &ours[start..] {
        if !fresh.contains(entry) {
            fresh.push(entry.clone());
        }
    }
    truncate_to_last(fresh, capacity);
}

/// Merge elements by position
///
/// A caller that emptied a previously non-empty list clears it. Otherwise every
/// position the caller changed is merged into the fresh element at that position via
/// `merge_item(ours, original, fresh)`, or appended if the fresh list is shorter.
pub fn merge_indexed<T, F>(ours: &[T], original: &[T], fresh: &mut Vec<T>, merge_item: F)
where
    T: PartialEq + Clone,
    F: Fn(&T, Option<&T>, &mut T),
{
    if ours.is_empty() && !original.is_empty() {
        fresh.clear();
        return;
    }

    for (index, item) in ours.iter().enumerate() {
        let before = original.get(index);
        if before == Some(item) {
            continue;
        }
        match fresh.get_mut(index) {
            Some(existing) => merge_item(item, before, existing),
            None => fresh.push(item.clone()),
        }
    }
}

/// Replay set additions and removals: `(fresh - removed) ∪ added`
pub fn merge_set<T: PartialEq + Clone>(ours: &[T], original: &[T], fresh: &mut Vec<T>) {
    fresh.retain(|item| ours.contains(item) || !original.contains(item));
    for item in ours {
        if !original.contains(item) && !fresh.contains(item) {
            fresh.push(item.clone());
        }
    }
    dedup_in_order(fresh);
}

fn dedup_in_order<T: PartialEq>(items: &mut Vec<T>) {
    let mut index = 0;
    while index < items.len() {
        if items[..index].contains(&items[index]) {
            items.remove(index);
        } else {
            index += 1;
        }
    }
}

fn merge_tab(ours: &Tab, original: Option<&Tab>, fresh: &mut Tab) {
    let Some(original) = original else {
        *fresh = ours.clone();
        return;
    };
    merge_scalar(&ours.status, &original.status, &mut fresh.status);
    merge_scalar(&ours.last_capture, &original.last_capture, &mut fresh.last_capture);
    merge_scalar(&ours.playback, &original.playback, &mut fresh.playback);
    merge_scalar(&ours.error, &original.error, &mut fresh.error);
}

impl Mergeable for Worker {
    const LIST_FIELDS: &'static [(&'static str, MergePolicy)] = &[
        ("logs", MergePolicy::AppendOnly),
        ("tabs", MergePolicy::IndexMerge),
        ("active_tabs", MergePolicy::SetUnion),
    ];

    fn merge_onto(&self, original: &Self, fresh: Self) -> Self {
        let mut merged = fresh;

        merge_scalar(&self.box_id, &original.box_id, &mut merged.box_id);
        merge_scalar(&self.status, &original.status, &mut merged.status);
        merge_scalar(&self.target, &original.target, &mut merged.target);
        merge_scalar(
            &self.is_parse_chat_enabled,
            &original.is_parse_chat_enabled,
            &mut merged.is_parse_chat_enabled,
        );
        merge_scalar(&self.requested_tabs, &original.requested_tabs, &mut merged.requested_tabs);
        merge_scalar(&self.playback, &original.playback, &mut merged.playback);
        merge_scalar(&self.resource_usage, &original.resource_usage, &mut merged.resource_usage);
        merge_scalar(&self.resource_limits, &original.resource_limits, &mut merged.resource_limits);
        merge_scalar(&self.last_activity_at, &original.last_activity_at, &mut merged.last_activity_at);
        merge_scalar(&self.failure_count, &original.failure_count, &mut merged.failure_count);
        merge_scalar(&self.identity, &original.identity, &mut merged.identity);
        merge_scalar(&self.start_attempt, &original.start_attempt, &mut merged.start_attempt);
        merge_scalar(&self.error_message, &original.error_message, &mut merged.error_message);
        merge_scalar(&self.started_at, &original.started_at, &mut merged.started_at);

        merge_append_only(&self.logs, &original.logs, &mut merged.logs, WORKER_LOG_CAPACITY);
        merge_indexed(&self.tabs, &original.tabs, &mut merged.tabs, merge_tab);
        merge_set(&self.active_tabs, &original.active_tabs, &mut merged.active_tabs);

        merged
    }
}

impl Mergeable for FleetBox {
    const LIST_FIELDS: &'static [(&'static str, MergePolicy)] = &[];

    fn merge_onto(&self, original: &Self, fresh: Self) -> Self {
        let mut merged = fresh;

        merge_scalar(&self.name, &original.name, &mut merged.name);
        merge_scalar(&self.egress_profile, &original.egress_profile, &mut merged.egress_profile);
        merge_scalar(&self.status, &original.status, &mut merged.status);
        merge_scalar(&self.address, &original.address, &mut merged.address);
        merge_scalar(&self.location, &original.location, &mut merged.location);
        merge_scalar(&self.worker_count, &original.worker_count, &mut merged.worker_count);
        merge_scalar(&self.target, &original.target, &mut merged.target);
        merge_scalar(&self.error_message, &original.error_message, &mut merged.error_message);
        merge_scalar(&self.started_at, &original.started_at, &mut merged.started_at);
        merge_scalar(&self.resource_usage, &original.resource_usage, &mut merged.resource_usage);
        merge_scalar(&self.resource_limits, &original.resource_limits, &mut merged.resource_limits);

        merged
    }
}

impl Mergeable for StreamRecord {
    const LIST_FIELDS: &'static [(&'static str, MergePolicy)] =
        &[("active_worker_ids", MergePolicy::SetUnion)];

    fn merge_onto(&self, original: &Self, fresh: Self) -> Self {
        let mut merged = fresh;
        merge_scalar(&self.target, &original.target, &mut merged.target);
        merge_set(
            &self.active_worker_ids,
            &original.active_worker_ids,
            &mut merged.active_worker_ids,
        );
        merged
    }
}
