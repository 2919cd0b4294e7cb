use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::events::{AddOutcome, ApprovalOutcome, StagingEvent, StagingSnapshot};
use crate::change::{Action, ChangeRecord, ChangeStatus, EntityType, Fields, RawChange};
use crate::commit::CommitAdapter;
use crate::config::EngineConfig;
use crate::error::{CommitError, CommitFailure, ValidationError};
use crate::notifier::Notifier;

#[derive(Default)]
struct StagingState {
    /// Live changes in the order they were proposed.
    records: Vec<ChangeRecord>,
    /// Settled changes dropped from `records`, still addressable by id.
    archived: HashMap<String, ChangeRecord>,
    /// Replaced change id -> id of the change that replaced it.
    superseded: HashMap<String, String>,
    /// Changes whose store write has started but not returned.
    in_flight: HashSet<String>,
}

impl StagingState {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id() == id)
    }

    fn find(&self, id: &str) -> Option<&ChangeRecord> {
        self.index_of(id)
            .map(|index| &self.records[index])
            .or_else(|| self.archived.get(id))
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ChangeRecord> {
        match self.index_of(id) {
            Some(index) => Some(&mut self.records[index]),
            None => self.archived.get_mut(id),
        }
    }

    /// Takes a pending change out of the live list when a newer pending
    /// change for the same target arrived while it was being committed.
    /// Returns the id of that newer change.
    fn retire_if_superseded(&mut self, id: &str) -> Option<String> {
        let index = self.index_of(id)?;
        let key = self.records[index].proposal().dedup_key()?;
        let newer = self
            .records
            .iter()
            .find(|r| {
                r.id() != id && r.is_pending() && r.proposal().dedup_key().as_ref() == Some(&key)
            })?
            .id()
            .to_string();
        self.records.remove(index);
        self.superseded.insert(id.to_string(), newer.clone());
        Some(newer)
    }

    fn resolve<'a>(&'a self, mut id: &'a str) -> &'a str {
        // Bounded: a replayed id can make the chain loop.
        for _ in 0..=self.superseded.len() {
            if self.find(id).is_some() {
                break;
            }
            match self.superseded.get(id) {
                Some(next) => id = next.as_str(),
                None => break,
            }
        }
        id
    }
}

/// The live set of proposed changes and their review lifecycle. Clones share
/// the same state, so the intake loop and the presentation layer can hold
/// one each.
#[derive(Clone, Default)]
pub struct StagingEngine {
    state: Arc<RwLock<StagingState>>,
    notifier: Notifier<StagingEvent>,
    config: EngineConfig,
}

impl StagingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, StagingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StagingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stages a change. A pending change with the same id, or for the same
    /// target, is replaced in place; settled changes are never touched.
    pub fn add(&self, record: ChangeRecord) -> AddOutcome {
        let id = record.id().to_string();
        let (outcome, event) = {
            let mut state = self.write();

            if let Some(index) = state.index_of(&id) {
                let existing = &state.records[index];
                if !existing.is_pending() || state.in_flight.contains(&id) {
                    log::debug!("Ignoring replay of settled or committing change '{}'", id);
                    return AddOutcome::Ignored;
                }
                state.records[index] = record;
                log::debug!("Replayed pending change '{}'", id);
                (
                    AddOutcome::Replaced {
                        superseded: id.clone(),
                    },
                    StagingEvent::Edited(id),
                )
            } else if state.archived.contains_key(&id) {
                log::debug!("Ignoring replay of archived change '{}'", id);
                return AddOutcome::Ignored;
            } else {
                let key = record.proposal().dedup_key();
                let matching = key.as_ref().and_then(|key| {
                    state.records.iter().position(|r| {
                        r.is_pending()
                            && !state.in_flight.contains(r.id())
                            && r.proposal().dedup_key().as_ref() == Some(key)
                    })
                });
                match matching {
                    Some(index) => {
                        let old_id = state.records[index].id().to_string();
                        log::info!(
                            "Change '{}' supersedes pending {} change '{}'",
                            id,
                            record.entity_type(),
                            old_id
                        );
                        state.records[index] = record;
                        state.superseded.insert(old_id.clone(), id.clone());
                        (
                            AddOutcome::Replaced {
                                superseded: old_id.clone(),
                            },
                            StagingEvent::Replaced {
                                superseded: old_id,
                                replacement: id,
                            },
                        )
                    }
                    None => {
                        log::debug!(
                            "Staged {} {} change '{}'",
                            record.action(),
                            record.entity_type(),
                            id
                        );
                        state.records.push(record);
                        (AddOutcome::Appended, StagingEvent::Added(id))
                    }
                }
            }
        };
        self.notifier.notify(event);
        outcome
    }

    /// Validates and stages a raw proposal. Malformed proposals are logged
    /// and dropped.
    pub fn add_raw(&self, raw: RawChange) -> Result<AddOutcome, ValidationError> {
        match ChangeRecord::try_from(raw) {
            Ok(record) => Ok(self.add(record)),
            Err(e) => {
                log::warn!("Dropping malformed proposal: {}", e);
                Err(e)
            }
        }
    }

    /// Merges hand edits into a pending change's proposed data. Returns
    /// false, changing nothing, when the change is unknown, settled, being
    /// committed, or a delete.
    pub fn update(&self, id: &str, edits: Fields) -> bool {
        let edited = {
            let mut state = self.write();
            if state.in_flight.contains(id) {
                false
            } else {
                match state.find_mut(id) {
                    Some(record) if record.is_pending() => record.merge_edits(edits),
                    _ => false,
                }
            }
        };
        if edited {
            log::debug!("Edited pending change '{}'", id);
            self.notifier.notify(StagingEvent::Edited(id.to_string()));
        }
        edited
    }

    /// Commits a pending change through `adapter` and marks it approved once
    /// the write returns. On failure the change stays pending, edits and all.
    pub fn approve(
        &self,
        id: &str,
        adapter: &dyn CommitAdapter,
    ) -> Result<ApprovalOutcome, CommitError> {
        let record = {
            let mut state = self.write();
            let record = state
                .find(id)
                .ok_or_else(|| CommitError::UnknownChange(id.to_string()))?;
            if record.status().is_settled() {
                return Ok(ApprovalOutcome::AlreadySettled(record.status()));
            }
            let record = record.clone();
            if !state.in_flight.insert(id.to_string()) {
                log::debug!("Approval of '{}' already in flight", id);
                return Ok(ApprovalOutcome::InFlight);
            }
            record
        };

        let result = adapter.commit(&record);

        let replacement = {
            let mut state = self.write();
            state.in_flight.remove(id);
            if result.is_ok() {
                if let Some(live) = state.find_mut(id) {
                    live.settle(ChangeStatus::Approved);
                }
                None
            } else {
                state.retire_if_superseded(id)
            }
        };

        match result {
            Ok(()) => {
                log::info!(
                    "Approved {} {} change '{}'",
                    record.action(),
                    record.entity_type(),
                    id
                );
                self.notifier.notify(StagingEvent::Approved(id.to_string()));
                Ok(ApprovalOutcome::Committed)
            }
            Err(e) => {
                log::warn!("Commit of change '{}' failed: {}", id, e);
                self.notifier.notify(StagingEvent::CommitFailed {
                    id: id.to_string(),
                    message: e.to_string(),
                });
                if let Some(replacement) = replacement {
                    log::info!(
                        "Change '{}' supersedes failed {} change '{}'",
                        replacement,
                        record.entity_type(),
                        id
                    );
                    self.notifier.notify(StagingEvent::Replaced {
                        superseded: id.to_string(),
                        replacement,
                    });
                }
                Err(e)
            }
        }
    }

    /// Discards a pending change without touching any store. Returns false
    /// when the change is unknown, already settled, or being committed.
    pub fn reject(&self, id: &str) -> bool {
        let rejected = {
            let mut state = self.write();
            if state.in_flight.contains(id) {
                false
            } else {
                state
                    .find_mut(id)
                    .is_some_and(|record| record.settle(ChangeStatus::Rejected))
            }
        };
        if rejected {
            log::info!("Rejected change '{}'", id);
            self.notifier.notify(StagingEvent::Rejected(id.to_string()));
        }
        rejected
    }

    /// Approves every pending change, one at a time. Lorebook creations go
    /// first so entries proposed for a new lorebook find it; everything else
    /// keeps proposal order. Returns how many changes were committed, or the
    /// failures, which stay pending.
    pub fn approve_all(&self, adapter: &dyn CommitAdapter) -> Result<usize, Vec<CommitFailure>> {
        let ids: Vec<String> = {
            let state = self.read();
            let pending = state
                .records
                .iter()
                .filter(|r| r.is_pending() && !state.in_flight.contains(r.id()));
            let (lorebooks, rest): (Vec<_>, Vec<_>) = pending.partition(|r| {
                r.entity_type() == EntityType::Lorebook && r.action() == Action::Create
            });
            lorebooks
                .into_iter()
                .chain(rest)
                .map(|r| r.id().to_string())
                .collect()
        };

        log::info!("Approving {} pending changes", ids.len());
        let mut committed = 0;
        let mut failures = Vec::new();
        for id in ids {
            match self.approve(&id, adapter) {
                Ok(ApprovalOutcome::Committed) => committed += 1,
                Ok(_) => {}
                Err(error) => failures.push(CommitFailure {
                    change_id: id,
                    error,
                }),
            }
        }

        if self.config.clear_settled_after_approve_all {
            self.clear_settled();
        }

        if failures.is_empty() {
            Ok(committed)
        } else {
            log::warn!(
                "{} of {} changes failed to commit",
                failures.len(),
                committed + failures.len()
            );
            Err(failures)
        }
    }

    /// Moves approved and rejected changes out of the live list. They stay
    /// resolvable through `get_live_change`.
    pub fn clear_settled(&self) -> usize {
        let cleared = {
            let mut state = self.write();
            let (settled, live): (Vec<_>, Vec<_>) = std::mem::take(&mut state.records)
                .into_iter()
                .partition(|r| r.status().is_settled());
            state.records = live;
            let count = settled.len();
            for record in settled {
                state.archived.insert(record.id().to_string(), record);
            }
            count
        };
        if cleared > 0 {
            self.notifier.notify(StagingEvent::Cleared(cleared));
        }
        cleared
    }

    /// The current state of a change, following replacements, so a card
    /// rendered from an older message still finds its proposal.
    pub fn get_live_change(&self, id: &str) -> Option<ChangeRecord> {
        let state = self.read();
        let current = state.resolve(id);
        state.find(current).cloned()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.read().in_flight.contains(id)
    }

    pub fn pending(&self) -> Vec<ChangeRecord> {
        self.read()
            .records
            .iter()
            .filter(|r| r.is_pending())
            .cloned()
            .collect()
    }

    /// Every live change, settled ones included, in proposal order.
    pub fn records(&self) -> Vec<ChangeRecord> {
        self.read().records.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.read().records.iter().filter(|r| r.is_pending()).count()
    }

    pub fn pending_breakdown(&self) -> BTreeMap<EntityType, usize> {
        let mut breakdown: BTreeMap<EntityType, usize> =
            EntityType::ALL.iter().map(|t| (*t, 0)).collect();
        for record in self.read().records.iter().filter(|r| r.is_pending()) {
            *breakdown.entry(record.entity_type()).or_default() += 1;
        }
        breakdown
    }

    pub fn snapshot(&self) -> StagingSnapshot {
        let pending = self.pending();
        let mut pending_breakdown: BTreeMap<EntityType, usize> =
            EntityType::ALL.iter().map(|t| (*t, 0)).collect();
        for record in &pending {
            *pending_breakdown.entry(record.entity_type()).or_default() += 1;
        }
        StagingSnapshot {
            pending_count: pending.len(),
            pending_breakdown,
            pending,
        }
    }

    /// Subscribe to staging events. Dropped receivers are lazily cleaned up.
    pub fn observer(&self) -> Receiver<StagingEvent> {
        self.notifier.observer()
    }

    pub fn observe(&self, callback: impl FnMut(StagingEvent) + Send + 'static) {
        self.notifier.observe(callback)
    }
}
