use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::{Action, ChangeRecord, EntityType, RawChange};
use crate::commit::CommitAdapter;
use crate::config::EngineConfig;
use crate::staging::{AddOutcome, StagingEngine};

/// One event of an assistant turn. Only `tool_end` events can carry a
/// proposed change; the rest is passed through for logging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposalEvent {
    Thinking {
        #[serde(default)]
        content: String,
    },
    ToolStart {
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    ToolEnd {
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    Message {
        message: AssistantMessage,
    },
    Done,
    Error {
        message: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pending_change: Option<Value>,
}

/// The summary message that closes a turn and takes ownership of the
/// changes proposed during it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub change_ids: Vec<String>,
}

/// Cooperative cancellation for an intake run. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntakeSummary {
    /// Changes left pending for review.
    pub staged: Vec<String>,
    /// Lorebook creations committed on arrival.
    pub auto_approved: Vec<String>,
    /// Malformed proposals that never reached the staging area.
    pub dropped: usize,
    pub cancelled: bool,
    /// Set when the turn ended with an `error` event.
    pub error: Option<String>,
}

/// Feeds an assistant turn's proposals into the staging engine.
pub struct ProposalIntake {
    engine: StagingEngine,
    committer: Arc<dyn CommitAdapter>,
    config: EngineConfig,
    in_flight: Arc<RwLock<Vec<String>>>,
}

impl ProposalIntake {
    pub fn new(
        engine: StagingEngine,
        committer: Arc<dyn CommitAdapter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            committer,
            config,
            in_flight: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Changes proposed during the current turn that no summary message has
    /// claimed yet, in their current state.
    pub fn in_flight(&self) -> Vec<ChangeRecord> {
        self.in_flight
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|id| self.engine.get_live_change(id))
            .collect()
    }

    pub fn run_events<I>(&self, events: I, abort: &AbortSignal) -> IntakeSummary
    where
        I: IntoIterator<Item = ProposalEvent>,
    {
        let mut summary = IntakeSummary::default();
        for event in events {
            if abort.is_aborted() {
                summary.cancelled = true;
                break;
            }
            if self.handle(event, &mut summary).is_break() {
                break;
            }
        }
        self.finish(&summary);
        summary
    }

    /// Like `run_events`, but waits on a channel. The abort signal is checked
    /// at least once per `EngineConfig::intake_poll_interval`.
    pub fn run_channel(
        &self,
        events: &Receiver<ProposalEvent>,
        abort: &AbortSignal,
    ) -> IntakeSummary {
        let mut summary = IntakeSummary::default();
        let poll = self.config.intake_poll_interval();
        loop {
            if abort.is_aborted() {
                summary.cancelled = true;
                break;
            }
            match events.recv_timeout(poll) {
                Ok(event) => {
                    if self.handle(event, &mut summary).is_break() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!("Proposal source closed without a done event");
                    break;
                }
            }
        }
        self.finish(&summary);
        summary
    }

    fn finish(&self, summary: &IntakeSummary) {
        log::info!(
            "Intake finished: {} staged, {} auto-approved, {} dropped{}",
            summary.staged.len(),
            summary.auto_approved.len(),
            summary.dropped,
            if summary.cancelled { ", cancelled" } else { "" }
        );
    }

    fn handle(&self, event: ProposalEvent, summary: &mut IntakeSummary) -> ControlFlow<()> {
        match event {
            ProposalEvent::Thinking { .. } => {}
            ProposalEvent::ToolStart { tool_call } => {
                log::debug!("Tool call '{}' started ({})", tool_call.id, tool_call.name);
            }
            ProposalEvent::ToolEnd { tool_call } => {
                if let Some(value) = tool_call.pending_change {
                    self.intake_change(value, summary);
                }
            }
            ProposalEvent::Message { message } => self.claim(&message.change_ids),
            ProposalEvent::Done => return ControlFlow::Break(()),
            ProposalEvent::Error { message } => {
                log::warn!("Proposal source failed: {}", message);
                summary.error = Some(message);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn intake_change(&self, value: Value, summary: &mut IntakeSummary) {
        let record = match RawChange::from_value(value).and_then(ChangeRecord::try_from) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Dropping malformed proposal: {}", e);
                summary.dropped += 1;
                return;
            }
        };
        let id = record.id().to_string();
        let auto_approve = self.config.auto_approve_lorebooks
            && record.entity_type() == EntityType::Lorebook
            && record.action() == Action::Create;

        match self.engine.add(record) {
            AddOutcome::Ignored => return,
            AddOutcome::Replaced { superseded } => {
                self.forget(&superseded);
                summary.staged.retain(|staged| staged != &superseded);
            }
            AddOutcome::Appended => {}
        }
        self.track(&id);

        if auto_approve {
            match self.engine.approve(&id, self.committer.as_ref()) {
                Ok(_) => {
                    summary.auto_approved.push(id);
                    return;
                }
                Err(e) => log::warn!("Auto-approval of lorebook change '{}' failed: {}", id, e),
            }
        }
        summary.staged.retain(|staged| staged != &id);
        summary.staged.push(id);
    }

    fn track(&self, id: &str) {
        let mut in_flight = self.in_flight.write().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.iter().any(|tracked| tracked == id) {
            in_flight.push(id.to_string());
        }
    }

    fn forget(&self, id: &str) {
        self.in_flight
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tracked| tracked != id);
    }

    /// The summary message now owns these changes.
    fn claim(&self, change_ids: &[String]) {
        self.in_flight
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tracked| !change_ids.contains(tracked));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::change::ChangeStatus;
    use crate::commit::VaultCommitter;
    use crate::store::{EntityStore, MemoryStore};

    struct Setup {
        engine: StagingEngine,
        lorebooks: MemoryStore,
        committer: Arc<VaultCommitter>,
        intake: ProposalIntake,
    }

    fn setup(config: EngineConfig) -> Setup {
        let engine = StagingEngine::new();
        let lorebooks = MemoryStore::new("lorebook");
        let committer = Arc::new(VaultCommitter::new(
            Arc::new(MemoryStore::new("character")),
            Arc::new(MemoryStore::new("scenario")),
            Arc::new(lorebooks.clone()),
        ));
        let intake = ProposalIntake::new(engine.clone(), committer.clone(), config);
        Setup {
            engine,
            lorebooks,
            committer,
            intake,
        }
    }

    fn tool_end(change: Value) -> ProposalEvent {
        ProposalEvent::ToolEnd {
            tool_call: ToolCall {
                id: "call".to_string(),
                name: "propose_change".to_string(),
                pending_change: Some(change),
            },
        }
    }

    fn lorebook_create(id: &str, lorebook_id: &str) -> ProposalEvent {
        tool_end(json!({
            "id": id,
            "entityType": "lorebook",
            "action": "create",
            "data": {"id": lorebook_id, "name": "World"}
        }))
    }

    fn entry_create(id: &str, lorebook_id: &str) -> ProposalEvent {
        tool_end(json!({
            "id": id,
            "entityType": "lorebook-entry",
            "action": "create",
            "lorebookId": lorebook_id,
            "data": {"name": "Dragons"}
        }))
    }

    #[test]
    fn events_deserialize_from_wire_shape() {
        let event: ProposalEvent = serde_json::from_value(json!({
            "type": "tool_end",
            "toolCall": {
                "id": "t1",
                "name": "propose_change",
                "pendingChange": {"entityType": "character", "action": "create", "data": {}}
            }
        }))
        .unwrap();
        match event {
            ProposalEvent::ToolEnd { tool_call } => assert!(tool_call.pending_change.is_some()),
            other => panic!("unexpected event {:?}", other),
        }

        let done: ProposalEvent = serde_json::from_value(json!({"type": "done"})).unwrap();
        assert_eq!(done, ProposalEvent::Done);
    }

    #[test]
    fn lorebook_creations_are_auto_approved() -> anyhow::Result<()> {
        let s = setup(EngineConfig::default());
        let summary = s.intake.run_events(
            vec![
                ProposalEvent::Thinking {
                    content: "Let me build a world".to_string(),
                },
                lorebook_create("book", "lb1"),
                entry_create("entry", "lb1"),
                ProposalEvent::Done,
            ],
            &AbortSignal::new(),
        );

        assert_eq!(summary.auto_approved, vec!["book"]);
        assert_eq!(summary.staged, vec!["entry"]);
        assert!(s.lorebooks.get_by_id("lb1")?.is_some());
        assert_eq!(s.engine.pending_count(), 1);

        s.engine.approve("entry", s.committer.as_ref())?;
        let lorebook = s.lorebooks.get_by_id("lb1")?.unwrap();
        assert_eq!(lorebook["entries"].as_array().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn auto_approval_can_be_disabled() {
        let s = setup(EngineConfig {
            auto_approve_lorebooks: false,
            ..Default::default()
        });
        let summary = s
            .intake
            .run_events(vec![lorebook_create("book", "lb1")], &AbortSignal::new());
        assert!(summary.auto_approved.is_empty());
        assert_eq!(summary.staged, vec!["book"]);
        assert!(s.lorebooks.get_by_id("lb1").unwrap().is_none());
    }

    #[test]
    fn failed_auto_approval_stays_pending() -> anyhow::Result<()> {
        let s = setup(EngineConfig::default());
        s.lorebooks.add(json!({"id": "lb1"}).as_object().cloned().unwrap())?;
        let summary = s
            .intake
            .run_events(vec![lorebook_create("book", "lb1")], &AbortSignal::new());
        assert_eq!(summary.staged, vec!["book"]);
        assert!(s.engine.get_live_change("book").unwrap().is_pending());
        Ok(())
    }

    #[test]
    fn malformed_proposals_are_dropped() {
        let s = setup(EngineConfig::default());
        let summary = s.intake.run_events(
            vec![
                tool_end(json!({"entityType": "character", "action": "explode"})),
                tool_end(json!({
                    "entityType": "lorebook-entry",
                    "action": "merge",
                    "lorebookId": "lb1",
                    "previousEntries": [{"id": "e1"}],
                    "data": {}
                })),
                entry_create("ok", "lb1"),
            ],
            &AbortSignal::new(),
        );
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.staged, vec!["ok"]);
        assert_eq!(s.engine.records().len(), 1);
    }

    #[test]
    fn summary_message_claims_in_flight_changes() {
        let s = setup(EngineConfig::default());
        s.intake.run_events(
            vec![entry_create("a", "lb1"), entry_create("b", "lb1")],
            &AbortSignal::new(),
        );
        assert_eq!(s.intake.in_flight().len(), 2);

        s.intake.run_events(
            vec![ProposalEvent::Message {
                message: AssistantMessage {
                    content: "Added two entries".to_string(),
                    change_ids: vec!["a".to_string()],
                },
            }],
            &AbortSignal::new(),
        );
        let remaining: Vec<String> = s
            .intake
            .in_flight()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(remaining, vec!["b"]);
        assert_eq!(s.engine.pending_count(), 2);
    }

    #[test]
    fn superseded_changes_leave_in_flight_list() {
        let s = setup(EngineConfig::default());
        let update = |id: &str, name: &str| {
            tool_end(json!({
                "id": id,
                "entityType": "character",
                "action": "update",
                "targetId": "c1",
                "data": {"name": name},
                "previous": {"id": "c1", "name": "Ana"}
            }))
        };
        let summary = s
            .intake
            .run_events(vec![update("a", "Anna"), update("b", "Annie")], &AbortSignal::new());
        assert_eq!(summary.staged, vec!["b"]);
        let ids: Vec<String> = s
            .intake
            .in_flight()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(s.engine.pending_count(), 1);
    }

    #[test]
    fn abort_stops_consumption() {
        let s = setup(EngineConfig::default());
        let abort = AbortSignal::new();
        let trigger = abort.clone();
        let events = vec![entry_create("a", "lb1"), entry_create("b", "lb1")]
            .into_iter()
            .enumerate()
            .map(move |(index, event)| {
                if index == 0 {
                    trigger.abort();
                }
                event
            });
        // The first event is pulled before the abort is observed.
        let summary = s.intake.run_events(events, &abort);
        assert!(summary.cancelled);
        assert!(summary.staged.is_empty());
        assert_eq!(s.engine.pending_count(), 0);
    }

    #[test]
    fn error_event_ends_turn() {
        let s = setup(EngineConfig::default());
        let summary = s.intake.run_events(
            vec![
                entry_create("a", "lb1"),
                ProposalEvent::Error {
                    message: "rate limited".to_string(),
                },
                entry_create("b", "lb1"),
            ],
            &AbortSignal::new(),
        );
        assert_eq!(summary.error.as_deref(), Some("rate limited"));
        assert_eq!(summary.staged, vec!["a"]);
        assert_eq!(
            s.engine.get_live_change("a").unwrap().status(),
            ChangeStatus::Pending
        );
    }

    #[test]
    fn channel_run_until_done() {
        let s = setup(EngineConfig::default());
        let (tx, rx) = channel();
        let sender = std::thread::spawn(move || {
            tx.send(entry_create("a", "lb1")).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            tx.send(ProposalEvent::Done).unwrap();
            // Keep the channel open past done.
            std::thread::sleep(Duration::from_millis(50));
        });
        let summary = s.intake.run_channel(&rx, &AbortSignal::new());
        assert!(!summary.cancelled);
        assert_eq!(summary.staged, vec!["a"]);
        sender.join().unwrap();
    }

    #[test]
    fn channel_run_observes_abort_while_idle() {
        let s = setup(EngineConfig {
            intake_poll_ms: 5,
            ..Default::default()
        });
        let (_tx, rx) = channel::<ProposalEvent>();
        let abort = AbortSignal::new();
        let trigger = abort.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.abort();
        });
        let summary = s.intake.run_channel(&rx, &abort);
        assert!(summary.cancelled);
    }
}
