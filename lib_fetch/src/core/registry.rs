//! # Registry
//!
//! The pending-request registry. It is always accessed through the
//! dispatcher's single mutex, together with the cycle counter and the current
//! interruption token.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::request::{LoadingPhase, Request};

/// A pending request and its lifecycle status.
pub(crate) struct PendingEntry {
    pub(crate) request: Arc<Request>,
    pub(crate) status: LoadingPhase,
    /// The cycle that last claimed this entry, `0` before the first claim.
    pub(crate) cycle: u64,
}

/// The snapshot taken at the start of a dispatch cycle.
pub(crate) struct CyclePlan {
    /// Monotonic cycle id, starting at 1.
    pub(crate) id: u64,
    /// Requests keyed by group, iterated in ascending order.
    pub(crate) groups: BTreeMap<u32, Vec<Arc<Request>>>,
    /// Cancelled by `Registry::interrupt`.
    pub(crate) token: CancellationToken,
}

impl CyclePlan {
    pub(crate) fn request_ids(&self) -> Vec<String> {
        self.groups
            .values()
            .flatten()
            .map(|request| request.id().to_string())
            .collect()
    }
}

pub(crate) struct Registry {
    // Keyed by request id, which makes de-duplication a lookup.
    entries: HashMap<String, PendingEntry>,
    cycle_counter: u64,
    interrupt: CancellationToken,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            cycle_counter: 0,
            interrupt: CancellationToken::new(),
        }
    }

    /// Registers a request unless one with the same id is already pending.
    pub(crate) fn insert(&mut self, request: Request) -> bool {
        if self.entries.contains_key(request.id()) {
            return false;
        }
        self.entries.insert(
            request.id().to_string(),
            PendingEntry {
                request: Arc::new(request),
                status: LoadingPhase::Unloaded,
                cycle: 0,
            },
        );
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn status_of(&self, id: &str) -> Option<LoadingPhase> {
        self.entries.get(id).map(|entry| entry.status)
    }

    pub(crate) fn cycles_started(&self) -> u64 {
        self.cycle_counter
    }

    /// Claims every `Unloaded` request for a new cycle.
    ///
    /// Returns `None`, without consuming a cycle id, when nothing is waiting.
    pub(crate) fn begin_cycle(&mut self) -> Option<CyclePlan> {
        let cycle = self.cycle_counter + 1;
        let mut groups: BTreeMap<u32, Vec<Arc<Request>>> = BTreeMap::new();
        for entry in self.entries.values_mut() {
            if entry.status != LoadingPhase::Unloaded {
                continue;
            }
            entry.status = LoadingPhase::ToLoad;
            entry.cycle = cycle;
            groups
                .entry(entry.request.group())
                .or_default()
                .push(Arc::clone(&entry.request));
        }

        if groups.is_empty() {
            return None;
        }

        self.cycle_counter = cycle;
        Some(CyclePlan {
            id: cycle,
            groups,
            token: self.interrupt.clone(),
        })
    }

    /// Marks a request of `cycle` as finished. Entries that were re-armed or
    /// claimed by another cycle in the meantime are left alone.
    pub(crate) fn mark_loaded(&mut self, cycle: u64, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.cycle == cycle && entry.status == LoadingPhase::ToLoad {
                entry.status = LoadingPhase::Loaded;
            }
        }
    }

    /// Drops the requests of a completed cycle.
    pub(crate) fn finish_cycle(&mut self, cycle: u64, ids: &[String]) {
        for id in ids {
            if self.entries.get(id).is_some_and(|entry| entry.cycle == cycle) {
                self.entries.remove(id);
            }
        }
    }

    /// Settles an interrupted cycle: finished requests are dropped, the rest
    /// go back to `Unloaded` so the next dispatch picks them up again.
    ///
    /// Returns `(removed, rearmed)` ids.
    pub(crate) fn reconcile_interrupted(
        &mut self,
        cycle: u64,
        ids: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let mut removed = Vec::new();
        let mut rearmed = Vec::new();
        for id in ids {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            if entry.cycle != cycle || entry.status == LoadingPhase::Unloaded {
                continue;
            }
            if entry.status == LoadingPhase::Loaded {
                self.entries.remove(id);
                removed.push(id.clone());
            } else {
                entry.status = LoadingPhase::Unloaded;
                rearmed.push(id.clone());
            }
        }
        (removed, rearmed)
    }

    /// Cancels the token of every running cycle and installs a fresh one for
    /// cycles that start later.
    pub(crate) fn interrupt(&mut self) {
        self.interrupt.cancel();
        self.interrupt = CancellationToken::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, group: u32) -> Request {
        Request::builder(id, "https://example.com")
            .group(group)
            .handle(|_, _| true)
            .build()
            .unwrap()
    }

    #[test]
    fn insert_deduplicates_by_id() {
        let mut registry = Registry::new();
        assert!(registry.insert(request("dup", 0)));
        assert!(!registry.insert(request("dup", 3)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.status_of("dup"), Some(LoadingPhase::Unloaded));
    }

    #[test]
    fn begin_cycle_groups_unloaded_requests_in_order() {
        let mut registry = Registry::new();
        registry.insert(request("late", 7));
        registry.insert(request("early-a", 0));
        registry.insert(request("early-b", 0));

        let plan = registry.begin_cycle().unwrap();
        assert_eq!(plan.id, 1);
        assert_eq!(plan.groups.keys().copied().collect::<Vec<_>>(), vec![0, 7]);
        assert_eq!(plan.groups[&0].len(), 2);
        assert_eq!(plan.request_ids().len(), 3);
        assert_eq!(registry.status_of("late"), Some(LoadingPhase::ToLoad));

        // Everything is claimed, so a second snapshot is empty.
        assert!(registry.begin_cycle().is_none());
        assert_eq!(registry.cycles_started(), 1);
    }

    #[test]
    fn requests_added_mid_cycle_wait_for_the_next_one() {
        let mut registry = Registry::new();
        registry.insert(request("a", 0));
        let first = registry.begin_cycle().unwrap();

        registry.insert(request("b", 0));
        let second = registry.begin_cycle().unwrap();
        assert_eq!(second.request_ids(), vec!["b".to_string()]);

        registry.mark_loaded(first.id, "a");
        registry.finish_cycle(first.id, &first.request_ids());
        assert_eq!(registry.status_of("a"), None);
        assert_eq!(registry.status_of("b"), Some(LoadingPhase::ToLoad));
    }

    #[test]
    fn reconcile_removes_loaded_and_rearms_the_rest() {
        let mut registry = Registry::new();
        registry.insert(request("done", 0));
        registry.insert(request("pending", 1));
        let plan = registry.begin_cycle().unwrap();
        registry.mark_loaded(plan.id, "done");

        let (removed, rearmed) = registry.reconcile_interrupted(plan.id, &plan.request_ids());
        assert_eq!(removed, vec!["done".to_string()]);
        assert_eq!(rearmed, vec!["pending".to_string()]);
        assert_eq!(registry.status_of("pending"), Some(LoadingPhase::Unloaded));
        assert!(registry.begin_cycle().is_some());
    }

    #[test]
    fn late_completion_of_a_settled_cycle_is_ignored() {
        let mut registry = Registry::new();
        registry.insert(request("slow", 0));
        let cancelled = registry.begin_cycle().unwrap();
        registry.reconcile_interrupted(cancelled.id, &cancelled.request_ids());

        // The worker of the cancelled cycle finishes after reconciliation.
        registry.mark_loaded(cancelled.id, "slow");
        assert_eq!(registry.status_of("slow"), Some(LoadingPhase::Unloaded));

        let retry = registry.begin_cycle().unwrap();
        registry.mark_loaded(cancelled.id, "slow");
        registry.finish_cycle(cancelled.id, &cancelled.request_ids());
        assert_eq!(registry.status_of("slow"), Some(LoadingPhase::ToLoad));

        registry.mark_loaded(retry.id, "slow");
        registry.finish_cycle(retry.id, &retry.request_ids());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn interrupt_only_cancels_existing_cycles() {
        let mut registry = Registry::new();
        registry.insert(request("a", 0));
        let running = registry.begin_cycle().unwrap();

        registry.interrupt();
        registry.insert(request("b", 0));
        let next = registry.begin_cycle().unwrap();

        assert!(running.token.is_cancelled());
        assert!(!next.token.is_cancelled());
    }
}
