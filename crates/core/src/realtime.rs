//! Realtime merge layer: push-driven view slices for one lecture.
//!
//! Three independent slices follow the same lifecycle: fetch initial state
//! once; skip subscribing when that state is already terminal; otherwise
//! open exactly one push subscription and merge each event into local state;
//! tear the subscription down once the terminal condition holds, and always
//! on drop. The slices own disjoint state and never synchronize with each
//! other or with the chat stream.

use crate::api::{Explanation, LectureApi, ProcessingStatus, Summary};
use crate::error::RealtimeError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Topics the push channel can deliver, keyed per lecture. The names match
/// the backend tables whose row changes they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushTopic {
    Explanations,
    Lectures,
    Summaries,
}

impl fmt::Display for PushTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushTopic::Explanations => write!(f, "explanations"),
            PushTopic::Lectures => write!(f, "lectures"),
            PushTopic::Summaries => write!(f, "summaries"),
        }
    }
}

/// One push notification: the inserted or updated row.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub new: serde_json::Value,
}

/// The push-subscription collaborator. Subscribing hands back a receiver of
/// row events; dropping the receiver (or aborting the task that owns it)
/// ends the subscription.
#[async_trait::async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(
        &self,
        topic: PushTopic,
        lecture_id: &str,
    ) -> Result<mpsc::Receiver<PushEvent>, RealtimeError>;
}

fn abort_slot(slot: &StdMutex<Option<JoinHandle<()>>>) {
    let handle = match slot.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(handle) = handle {
        handle.abort();
    }
}

// A merge task that hit its terminal condition has exited on its own; the
// handle left in the slot must not count as a live subscription.
fn slot_occupied(slot: &StdMutex<Option<JoinHandle<()>>>) -> bool {
    match slot.lock() {
        Ok(slot) => slot.as_ref().is_some_and(|h| !h.is_finished()),
        Err(poisoned) => poisoned
            .into_inner()
            .as_ref()
            .is_some_and(|h| !h.is_finished()),
    }
}

// --- Explanations ---

/// Per-slide explanations received so far, plus the page count once the PDF
/// collaborator reports it. Until the count is known no terminal check is
/// possible and an open subscription stays open.
#[derive(Debug, Clone, Default)]
pub struct ExplanationsState {
    pub by_slide: BTreeMap<u32, String>,
    pub page_count: Option<u32>,
}

impl ExplanationsState {
    fn is_terminal(&self) -> bool {
        match self.page_count {
            Some(total) => self.by_slide.len() as u32 >= total,
            None => false,
        }
    }
}

/// View slice holding slide explanations as they arrive asynchronously.
#[derive(Debug)]
pub struct ExplanationsSlice {
    state: Arc<Mutex<ExplanationsState>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl ExplanationsSlice {
    /// Fetches the current explanations and, unless they are already
    /// complete, subscribes for the rest. A failed subscription is logged
    /// and the slice stays static.
    pub async fn start(
        api: &dyn LectureApi,
        push: &dyn PushChannel,
        lecture_id: &str,
        page_count: Option<u32>,
    ) -> Result<Self, RealtimeError> {
        let initial = api
            .get_explanations(lecture_id)
            .await
            .map_err(RealtimeError::Fetch)?;
        let mut by_slide = BTreeMap::new();
        for explanation in initial {
            by_slide.insert(explanation.slide_number, explanation.content);
        }
        let state = ExplanationsState {
            by_slide,
            page_count,
        };
        let slice = Self {
            state: Arc::new(Mutex::new(state)),
            task: StdMutex::new(None),
        };

        if slice.state.lock().await.is_terminal() {
            debug!(lecture_id, "explanations already complete, not subscribing");
            return Ok(slice);
        }
        match push.subscribe(PushTopic::Explanations, lecture_id).await {
            Ok(rx) => {
                let state = Arc::clone(&slice.state);
                slice.set_task(tokio::spawn(merge_explanations(rx, state)));
            }
            Err(e) => {
                warn!(lecture_id, error = %e, "explanations subscription failed; slice will not update");
            }
        }
        Ok(slice)
    }

    /// Records the page count once the PDF collaborator reports it, and
    /// closes the subscription if everything is already explained.
    pub async fn set_page_count(&self, total: u32) {
        let terminal = {
            let mut state = self.state.lock().await;
            state.page_count = Some(total);
            state.is_terminal()
        };
        if terminal {
            self.shutdown();
        }
    }

    pub async fn snapshot(&self) -> ExplanationsState {
        self.state.lock().await.clone()
    }

    /// Whether a push subscription is currently held.
    pub fn has_subscription(&self) -> bool {
        slot_occupied(&self.task)
    }

    /// Tears down the subscription. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        abort_slot(&self.task);
    }

    fn set_task(&self, handle: JoinHandle<()>) {
        match self.task.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }
}

impl Drop for ExplanationsSlice {
    fn drop(&mut self) {
        abort_slot(&self.task);
    }
}

async fn merge_explanations(
    mut rx: mpsc::Receiver<PushEvent>,
    state: Arc<Mutex<ExplanationsState>>,
) {
    while let Some(event) = rx.recv().await {
        match serde_json::from_value::<Explanation>(event.new) {
            Ok(row) => {
                let mut state = state.lock().await;
                state.by_slide.insert(row.slide_number, row.content);
                if state.is_terminal() {
                    debug!("all slides explained, closing subscription");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "dropping malformed explanation event"),
        }
    }
}

// --- Processing status ---

/// Wire shape of a lecture-row push event: only the columns this slice
/// merges.
#[derive(serde::Deserialize, Debug)]
struct LectureStatusRow {
    status: ProcessingStatus,
    #[serde(default)]
    embedding_error_details: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusState {
    pub status: ProcessingStatus,
    /// Failure detail captured when the status transitions into `failed`.
    pub error_details: Option<String>,
}

/// View slice tracking the lecture's processing pipeline status.
#[derive(Debug)]
pub struct StatusSlice {
    state: Arc<Mutex<StatusState>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl StatusSlice {
    pub async fn start(
        api: &dyn LectureApi,
        push: &dyn PushChannel,
        lecture_id: &str,
    ) -> Result<Self, RealtimeError> {
        let lecture = api
            .get_lecture(lecture_id)
            .await
            .map_err(RealtimeError::Fetch)?;
        let state = StatusState {
            status: lecture.status,
            error_details: if lecture.status == ProcessingStatus::Failed {
                lecture.embedding_error_details
            } else {
                None
            },
        };
        let slice = Self {
            state: Arc::new(Mutex::new(state)),
            task: StdMutex::new(None),
        };

        if lecture.status.is_terminal() {
            debug!(lecture_id, status = ?lecture.status, "status already terminal, not subscribing");
            return Ok(slice);
        }
        match push.subscribe(PushTopic::Lectures, lecture_id).await {
            Ok(rx) => {
                let state = Arc::clone(&slice.state);
                slice.set_task(tokio::spawn(merge_status(rx, state)));
            }
            Err(e) => {
                warn!(lecture_id, error = %e, "status subscription failed; slice will not update");
            }
        }
        Ok(slice)
    }

    pub async fn snapshot(&self) -> StatusState {
        self.state.lock().await.clone()
    }

    pub fn has_subscription(&self) -> bool {
        slot_occupied(&self.task)
    }

    pub fn shutdown(&self) {
        abort_slot(&self.task);
    }

    fn set_task(&self, handle: JoinHandle<()>) {
        match self.task.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }
}

impl Drop for StatusSlice {
    fn drop(&mut self) {
        abort_slot(&self.task);
    }
}

async fn merge_status(mut rx: mpsc::Receiver<PushEvent>, state: Arc<Mutex<StatusState>>) {
    while let Some(event) = rx.recv().await {
        match serde_json::from_value::<LectureStatusRow>(event.new) {
            Ok(row) => {
                let mut state = state.lock().await;
                state.status = row.status;
                if row.status == ProcessingStatus::Failed {
                    if row.embedding_error_details.is_none() {
                        // The detail column is optional; its absence must
                        // not break the merge.
                        warn!("lecture failed without error details");
                    }
                    state.error_details = row.embedding_error_details;
                }
                if row.status.is_terminal() {
                    debug!(status = ?row.status, "status reached a terminal value, closing subscription");
                    break;
                }
            }
            Err(e) => warn!(error = %e, "dropping malformed status event"),
        }
    }
}

// --- Summary ---

#[derive(Debug, Clone, Default)]
pub struct SummaryState {
    pub content: Option<String>,
}

/// View slice for the lecture summary. Unlike explanations there is no
/// known total: the first non-empty content is final and closes the
/// subscription immediately.
#[derive(Debug)]
pub struct SummarySlice {
    state: Arc<Mutex<SummaryState>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl SummarySlice {
    pub async fn start(
        api: &dyn LectureApi,
        push: &dyn PushChannel,
        lecture_id: &str,
    ) -> Result<Self, RealtimeError> {
        let initial = api
            .get_summary(lecture_id)
            .await
            .map_err(RealtimeError::Fetch)?;
        let content = initial.map(|s| s.content).filter(|c| !c.is_empty());
        let terminal = content.is_some();
        let slice = Self {
            state: Arc::new(Mutex::new(SummaryState { content })),
            task: StdMutex::new(None),
        };

        if terminal {
            debug!(lecture_id, "summary already available, not subscribing");
            return Ok(slice);
        }
        match push.subscribe(PushTopic::Summaries, lecture_id).await {
            Ok(rx) => {
                let state = Arc::clone(&slice.state);
                slice.set_task(tokio::spawn(merge_summary(rx, state)));
            }
            Err(e) => {
                warn!(lecture_id, error = %e, "summary subscription failed; slice will not update");
            }
        }
        Ok(slice)
    }

    pub async fn snapshot(&self) -> SummaryState {
        self.state.lock().await.clone()
    }

    pub fn has_subscription(&self) -> bool {
        slot_occupied(&self.task)
    }

    pub fn shutdown(&self) {
        abort_slot(&self.task);
    }

    fn set_task(&self, handle: JoinHandle<()>) {
        match self.task.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
    }
}

impl Drop for SummarySlice {
    fn drop(&mut self) {
        abort_slot(&self.task);
    }
}

async fn merge_summary(mut rx: mpsc::Receiver<PushEvent>, state: Arc<Mutex<SummaryState>>) {
    while let Some(event) = rx.recv().await {
        match serde_json::from_value::<Summary>(event.new) {
            Ok(row) if !row.content.is_empty() => {
                state.lock().await.content = Some(row.content);
                debug!("summary received, closing subscription");
                break;
            }
            Ok(_) => debug!("ignoring empty summary event"),
            Err(e) => warn!(error = %e, "dropping malformed summary event"),
        }
    }
}
