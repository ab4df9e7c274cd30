//! Remote store boundary.
//!
//! The store owns durable truth for the slot rows and the singleton
//! selection row, and fans out row-level change notifications. Anything
//! that speaks this contract can back a [`crate::session::Session`]: the
//! HTTP + realtime client in [`rest`] / [`realtime`], or the in-process
//! [`memory::MemoryStore`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};

pub mod memory;
pub mod realtime;
pub mod rest;
pub mod rows;

use rows::{CompetitorRow, NewSlotRow, SelectionRow, SlotRow};

/// The logical rows a client subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Roster,
    Slots,
    Selection,
}

impl Topic {
    pub fn table(&self) -> &'static str {
        match self {
            Topic::Roster => "teams",
            Topic::Slots => "start_position",
            Topic::Selection => "current_selection",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "teams" => Some(Topic::Roster),
            "start_position" => Some(Topic::Slots),
            "current_selection" => Some(Topic::Selection),
            _ => None,
        }
    }
}

/// Filter applied to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedScope {
    pub session_id: String,
    pub selection_row_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A row-level notification, still store-shaped. Conversion into typed
/// entities happens in the session before anything touches local state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub kind: ChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

/// Receiving half of a live subscription plus its release hook.
///
/// Dropping the feed releases it; calling [`ChangeFeed::release`] more than
/// once is a no-op.
pub struct ChangeFeed {
    topic: Topic,
    rx: mpsc::Receiver<ChangeEvent>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("topic", &self.topic)
            .field("live", &self.is_live())
            .finish()
    }
}

impl ChangeFeed {
    pub fn new(
        topic: Topic,
        rx: mpsc::Receiver<ChangeEvent>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn is_live(&self) -> bool {
        self.release.is_some()
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Releases the underlying subscription. Returns `true` only on the
    /// first call.
    pub fn release(&mut self) -> bool {
        match self.release.take() {
            Some(hook) => {
                hook();
                self.rx.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_competitors(&self) -> StoreResult<Vec<CompetitorRow>>;
    /// Slot rows for a session, joined with competitor attributes.
    async fn fetch_slots(&self, session_id: &str) -> StoreResult<Vec<SlotRow>>;
    async fn fetch_selection(&self, row_id: i64) -> StoreResult<Option<SelectionRow>>;
    /// Must fail with [`StoreError::Conflict`] when `(position, session_id)`
    /// already exists.
    async fn insert_slot(&self, row: &NewSlotRow) -> StoreResult<()>;
    /// Returns whether a row was actually removed.
    async fn delete_slot(&self, session_id: &str, position: usize) -> StoreResult<bool>;
    /// Returns the positions whose rows were removed.
    async fn clear_slots(&self, session_id: &str) -> StoreResult<Vec<usize>>;
    async fn upsert_selection(&self, row: &SelectionRow) -> StoreResult<()>;
    async fn subscribe(&self, topic: Topic, scope: &FeedScope) -> StoreResult<ChangeFeed>;
    async fn ping(&self) -> StoreResult<()>;
}

/// Bounds a remote call; an elapsed deadline is reported as a failure.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
