//! In-memory store of conversation turns for one chat identity.
//!
//! The store owns the ordered turn list and the stream status, and is the
//! only place protocol events are turned into message mutations. Every
//! mutation is gated on a chat-identity comparison so a stream that outlives
//! its chat (cancellation of the underlying read is best-effort) cannot
//! write into a newer chat's turn list.

use crate::message::{ContentPart, ConversationTurn, Role, TextPart};
use crate::protocol::StreamEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

/// The `(lectureId, chatId)` pair that scopes a transport and its store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatIdentity {
    pub lecture_id: String,
    pub chat_id: String,
}

impl ChatIdentity {
    pub fn new(lecture_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            lecture_id: lecture_id.into(),
            chat_id: chat_id.into(),
        }
    }
}

impl fmt::Display for ChatIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lecture_id, self.chat_id)
    }
}

/// Status of the chat stream, driven only by transport events.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Submitted,
    Streaming,
    Error,
}

/// Ordered turn list plus stream status for one chat identity.
#[derive(Debug)]
pub struct MessageStore {
    identity: ChatIdentity,
    turns: Vec<ConversationTurn>,
    state: StreamState,
    last_error: Option<String>,
}

impl MessageStore {
    pub fn new(identity: ChatIdentity) -> Self {
        Self {
            identity,
            turns: Vec::new(),
            state: StreamState::Idle,
            last_error: None,
        }
    }

    pub fn identity(&self) -> &ChatIdentity {
        &self.identity
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The user-visible message of the most recent transport failure, kept
    /// across the error → idle reset so the UI can display it.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Appends a completed turn (the user's outbound message).
    pub fn push_turn(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    /// idle → submitted, entered when a send is accepted. Clears the error
    /// left by a previous failed turn.
    pub fn mark_submitted(&mut self) {
        debug!(identity = %self.identity, "stream state: submitted");
        self.last_error = None;
        self.state = StreamState::Submitted;
    }

    /// streaming/submitted → idle, entered on a terminal event, stream
    /// exhaustion, or an explicit stop.
    pub fn mark_idle(&mut self) {
        debug!(identity = %self.identity, "stream state: idle");
        self.state = StreamState::Idle;
    }

    /// any state → error, entered on a transport failure for this identity.
    /// The transport uses [`MessageStore::fail_and_reset`] to follow up with
    /// the idle reset so the user may retry; partial text already applied
    /// stays in place. Failures reported by a superseded stream are dropped.
    pub fn fail(&mut self, identity: &ChatIdentity, message: String) {
        if *identity != self.identity {
            debug!(stale = %identity, current = %self.identity, "dropping error from superseded stream");
            return;
        }
        warn!(identity = %self.identity, error = %message, "stream failed");
        self.state = StreamState::Error;
        self.last_error = Some(message);
    }

    /// Identity-checked failure followed by the reset to idle so the user
    /// may retry. Both transitions are dropped for a superseded stream: a
    /// stale error must not reset the new chat's in-flight state.
    pub fn fail_and_reset(&mut self, identity: &ChatIdentity, message: String) {
        let current = *identity == self.identity;
        self.fail(identity, message);
        if current {
            self.mark_idle();
        }
    }

    /// Applies one protocol event addressed to `identity`. Events whose
    /// identity no longer matches the store are silently dropped.
    pub fn apply(&mut self, identity: &ChatIdentity, event: StreamEvent) {
        if *identity != self.identity {
            debug!(stale = %identity, current = %self.identity, "dropping event from superseded stream");
            return;
        }
        match event {
            StreamEvent::TextStart { id } => {
                self.mark_streaming_on_content();
                let turn = self.in_progress_assistant_turn();
                turn.parts.push(ContentPart::Text(TextPart::new(id)));
            }
            StreamEvent::TextDelta { id, delta } => {
                self.mark_streaming_on_content();
                let turn = self.in_progress_assistant_turn();
                match most_recent_unfinished_part(turn, &id) {
                    PartSlot::Open(part) => part.text.push_str(&delta),
                    PartSlot::Finished => {
                        warn!(part_id = %id, "rejecting delta for a finished text part");
                    }
                    PartSlot::Missing => {
                        // Legacy streams carry no text-start; create the part
                        // on first delta.
                        let mut part = TextPart::new(id);
                        part.text.push_str(&delta);
                        turn.parts.push(ContentPart::Text(part));
                    }
                }
            }
            StreamEvent::TextEnd { id } => {
                let turn = self.in_progress_assistant_turn();
                match most_recent_unfinished_part(turn, &id) {
                    PartSlot::Open(part) => part.finished = true,
                    PartSlot::Finished | PartSlot::Missing => {
                        warn!(part_id = %id, "text-end for an unknown or finished part");
                    }
                }
            }
            StreamEvent::Finish => {
                if let Some(turn) = self.turns.last_mut().filter(|t| {
                    t.role == Role::Assistant && !t.complete
                }) {
                    turn.complete = true;
                    for part in &mut turn.parts {
                        if let ContentPart::Text(t) = part {
                            t.finished = true;
                        }
                    }
                }
                self.mark_idle();
            }
        }
    }

    /// Replaces the whole turn list (chat switch). When the id-set matches
    /// the current one the list is left untouched to avoid UI churn; deep
    /// equality is deliberately not consulted. Returns whether a
    /// replacement happened.
    pub fn replace_turns(&mut self, turns: Vec<ConversationTurn>) -> bool {
        let current: BTreeSet<&str> = self.turns.iter().map(|t| t.id.as_str()).collect();
        let incoming: BTreeSet<&str> = turns.iter().map(|t| t.id.as_str()).collect();
        if current == incoming {
            debug!(identity = %self.identity, "turn list unchanged by id-set, keeping current");
            return false;
        }
        self.turns = turns;
        true
    }

    /// Switches the store to a new chat identity, dropping all prior turns.
    /// Any stream still running for the old identity will find its events
    /// rejected by the identity check.
    pub fn reset_for(&mut self, identity: ChatIdentity) {
        debug!(old = %self.identity, new = %identity, "resetting store for new chat identity");
        self.identity = identity;
        self.turns.clear();
        self.state = StreamState::Idle;
        self.last_error = None;
    }

    fn mark_streaming_on_content(&mut self) {
        if self.state == StreamState::Submitted {
            debug!(identity = %self.identity, "stream state: streaming");
            self.state = StreamState::Streaming;
        }
    }

    fn in_progress_assistant_turn(&mut self) -> &mut ConversationTurn {
        let needs_new = !matches!(
            self.turns.last(),
            Some(t) if t.role == Role::Assistant && !t.complete
        );
        if needs_new {
            self.turns.push(ConversationTurn::assistant_in_progress());
        }
        let last = self.turns.len() - 1;
        &mut self.turns[last]
    }
}

enum PartSlot<'a> {
    Open(&'a mut TextPart),
    Finished,
    Missing,
}

/// Finds the most recently started unfinished text part with the given id.
/// Distinguishes "exists but finished" from "absent" so deltas after
/// text-end can be rejected instead of re-creating the part.
fn most_recent_unfinished_part<'a>(turn: &'a mut ConversationTurn, id: &str) -> PartSlot<'a> {
    let mut saw_finished = false;
    let mut open_index = None;
    for (i, part) in turn.parts.iter().enumerate().rev() {
        if let ContentPart::Text(t) = part {
            if t.id == id {
                if t.finished {
                    saw_finished = true;
                } else {
                    open_index = Some(i);
                    break;
                }
            }
        }
    }
    match open_index {
        Some(i) => match &mut turn.parts[i] {
            ContentPart::Text(t) => PartSlot::Open(t),
            _ => PartSlot::Missing,
        },
        None if saw_finished => PartSlot::Finished,
        None => PartSlot::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LEGACY_PART_ID;

    fn identity() -> ChatIdentity {
        ChatIdentity::new("lec-1", "chat-1")
    }

    fn text_of(store: &MessageStore, turn_index: usize) -> String {
        store.turns()[turn_index].flattened_text()
    }

    #[test]
    fn text_start_creates_the_assistant_turn() {
        let mut store = MessageStore::new(identity());
        store.mark_submitted();
        store.apply(&identity(), StreamEvent::TextStart { id: "p1".into() });
        assert_eq!(store.turns().len(), 1);
        assert_eq!(store.turns()[0].role, Role::Assistant);
        assert!(!store.turns()[0].complete);
        assert_eq!(store.state(), StreamState::Streaming);
    }

    #[test]
    fn deltas_append_to_the_part_by_id() {
        let mut store = MessageStore::new(identity());
        store.mark_submitted();
        store.apply(&identity(), StreamEvent::TextStart { id: "p1".into() });
        store.apply(
            &identity(),
            StreamEvent::TextDelta {
                id: "p1".into(),
                delta: "Slide".into(),
            },
        );
        store.apply(
            &identity(),
            StreamEvent::TextDelta {
                id: "p1".into(),
                delta: " 3 covers...".into(),
            },
        );
        assert_eq!(text_of(&store, 0), "Slide 3 covers...");
    }

    #[test]
    fn delta_without_start_creates_the_part() {
        let mut store = MessageStore::new(identity());
        store.mark_submitted();
        store.apply(
            &identity(),
            StreamEvent::TextDelta {
                id: LEGACY_PART_ID.into(),
                delta: "Hi".into(),
            },
        );
        assert_eq!(text_of(&store, 0), "Hi");
        assert_eq!(store.state(), StreamState::Streaming);
    }

    #[test]
    fn delta_targets_the_most_recent_unfinished_part() {
        let mut store = MessageStore::new(identity());
        store.mark_submitted();
        store.apply(&identity(), StreamEvent::TextStart { id: "p1".into() });
        store.apply(&identity(), StreamEvent::TextEnd { id: "p1".into() });
        store.apply(&identity(), StreamEvent::TextStart { id: "p1".into() });
        store.apply(
            &identity(),
            StreamEvent::TextDelta {
                id: "p1".into(),
                delta: "second".into(),
            },
        );
        let parts = &store.turns()[0].parts;
        assert_eq!(parts.len(), 2);
        match (&parts[0], &parts[1]) {
            (ContentPart::Text(a), ContentPart::Text(b)) => {
                assert_eq!(a.text, "");
                assert!(a.finished);
                assert_eq!(b.text, "second");
                assert!(!b.finished);
            }
            _ => panic!("expected two text parts"),
        }
    }

    #[test]
    fn delta_after_text_end_is_rejected() {
        let mut store = MessageStore::new(identity());
        store.mark_submitted();
        store.apply(&identity(), StreamEvent::TextStart { id: "p1".into() });
        store.apply(
            &identity(),
            StreamEvent::TextDelta {
                id: "p1".into(),
                delta: "done".into(),
            },
        );
        store.apply(&identity(), StreamEvent::TextEnd { id: "p1".into() });
        store.apply(
            &identity(),
            StreamEvent::TextDelta {
                id: "p1".into(),
                delta: " more".into(),
            },
        );
        assert_eq!(text_of(&store, 0), "done");
    }

    #[test]
    fn finish_completes_the_turn_and_returns_to_idle() {
        let mut store = MessageStore::new(identity());
        store.mark_submitted();
        store.apply(&identity(), StreamEvent::TextStart { id: "p1".into() });
        store.apply(&identity(), StreamEvent::Finish);
        assert!(store.turns()[0].complete);
        assert_eq!(store.state(), StreamState::Idle);
        // A second finish (implicit stream close after an explicit one) is
        // harmless.
        store.apply(&identity(), StreamEvent::Finish);
        assert_eq!(store.turns().len(), 1);
    }

    #[test]
    fn events_for_a_superseded_identity_are_dropped() {
        let mut store = MessageStore::new(identity());
        let old = identity();
        store.mark_submitted();
        store.reset_for(ChatIdentity::new("lec-1", "chat-2"));
        store.apply(&old, StreamEvent::TextStart { id: "p1".into() });
        store.apply(
            &old,
            StreamEvent::TextDelta {
                id: "p1".into(),
                delta: "stale".into(),
            },
        );
        store.fail(&old, "stale failure".into());
        assert!(store.turns().is_empty());
        assert!(store.last_error().is_none());
        assert_eq!(store.state(), StreamState::Idle);
    }

    #[test]
    fn replace_turns_keeps_the_list_when_id_sets_match() {
        let mut store = MessageStore::new(identity());
        let turn = ConversationTurn::user(vec![ContentPart::Text(TextPart::finished(
            "p1", "hello",
        ))]);
        let id = turn.id.clone();
        store.push_turn(turn);

        let mut same_ids = store.turns()[0].clone();
        same_ids.parts.clear();
        assert!(!store.replace_turns(vec![same_ids]));
        // The richer local copy survives.
        assert_eq!(text_of(&store, 0), "hello");
        assert_eq!(store.turns()[0].id, id);
    }

    #[test]
    fn replace_turns_swaps_the_list_when_id_sets_differ() {
        let mut store = MessageStore::new(identity());
        store.push_turn(ConversationTurn::user(vec![]));
        let incoming = vec![ConversationTurn::user(vec![]), ConversationTurn::user(vec![])];
        assert!(store.replace_turns(incoming));
        assert_eq!(store.turns().len(), 2);
    }

    #[test]
    fn replace_with_empty_list_clears_stale_turns() {
        let mut store = MessageStore::new(identity());
        store.push_turn(ConversationTurn::user(vec![]));
        assert!(store.replace_turns(Vec::new()));
        assert!(store.turns().is_empty());
    }

    #[test]
    fn fail_and_reset_is_gated_on_identity() {
        let mut store = MessageStore::new(identity());
        let old = identity();
        let new = ChatIdentity::new("lec-1", "chat-2");
        store.reset_for(new.clone());
        // The new chat has its own turn in flight when the stale error lands.
        store.mark_submitted();
        store.fail_and_reset(&old, "stale failure".into());
        assert_eq!(store.state(), StreamState::Submitted);
        assert!(store.last_error().is_none());

        store.fail_and_reset(&new, "boom".into());
        assert_eq!(store.state(), StreamState::Idle);
        assert_eq!(store.last_error(), Some("boom"));
    }

    #[test]
    fn fail_records_the_message_and_allows_reset_to_idle() {
        let mut store = MessageStore::new(identity());
        store.mark_submitted();
        store.fail(&identity(), "backend returned status 500: boom".into());
        assert_eq!(store.state(), StreamState::Error);
        store.mark_idle();
        assert_eq!(store.state(), StreamState::Idle);
        assert_eq!(
            store.last_error(),
            Some("backend returned status 500: boom")
        );
        // The next accepted send clears the error.
        store.mark_submitted();
        assert!(store.last_error().is_none());
    }
}
