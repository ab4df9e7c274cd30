//! In-process store with the same contract as the remote one.
//!
//! Enforces the `(position, session_id)` uniqueness constraint on slot
//! inserts and fans every applied change out to all matching subscribers,
//! the writer included. Shared by every simulated client through an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::Competitor;
use crate::reliability::fault::{should_fault, FaultProfile};
use crate::store::rows::{CompetitorRow, NewSlotRow, SelectionRow, SlotRow};
use crate::store::{ChangeEvent, ChangeFeed, ChangeKind, FeedScope, RemoteStore, Topic};

struct Subscriber {
    id: u64,
    topic: Topic,
    scope: FeedScope,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Tables {
    teams: Vec<CompetitorRow>,
    slots: Vec<NewSlotRow>,
    selections: HashMap<i64, SelectionRow>,
    subscribers: Vec<Subscriber>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounters {
    pub slot_inserts: u64,
    pub slot_deletes: u64,
    pub selection_upserts: u64,
}

pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Mutex<FaultProfile>,
    offline: AtomicBool,
    op_seq: AtomicU64,
    next_sub_id: AtomicU64,
    counters: Mutex<WriteCounters>,
    feed_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_value<T: serde::Serialize>(row: &T) -> Option<Value> {
    serde_json::to_value(row).ok()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            faults: Mutex::new(FaultProfile::disabled()),
            offline: AtomicBool::new(false),
            op_seq: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(1),
            counters: Mutex::new(WriteCounters::default()),
            feed_capacity: feed_capacity.max(1),
        }
    }

    pub fn set_faults(&self, profile: FaultProfile) {
        if let Ok(mut f) = self.faults.lock() {
            *f = profile;
        }
    }

    /// Every call fails with a transport error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn counters(&self) -> WriteCounters {
        self.counters.lock().map(|c| *c).unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        lock(&self.tables).subscribers.iter().filter(|s| s.topic == topic).count()
    }

    /// Occupied `(position, team_number)` pairs for a session, by position.
    pub fn occupancy(&self, session_id: &str) -> Vec<(usize, u32)> {
        let tables = lock(&self.tables);
        let mut out: Vec<(usize, u32)> = tables
            .slots
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| (r.position as usize, r.team_number as u32))
            .collect();
        out.sort();
        out
    }

    pub fn selection_row(&self, row_id: i64) -> Option<SelectionRow> {
        lock(&self.tables).selections.get(&row_id).cloned()
    }

    /// Roster edit: insert or replace a team and notify roster subscribers.
    pub fn upsert_competitor(&self, competitor: &Competitor) {
        let row = CompetitorRow::from_competitor(competitor);
        let mut tables = lock(&self.tables);
        let existing = tables.teams.iter().position(|t| t.number == row.number);
        let (kind, old) = match existing {
            Some(idx) => {
                let old = std::mem::replace(&mut tables.teams[idx], row.clone());
                (ChangeKind::Update, to_value(&old))
            }
            None => {
                tables.teams.push(row.clone());
                (ChangeKind::Insert, None)
            }
        };
        let event = ChangeEvent {
            topic: Topic::Roster,
            kind,
            new: to_value(&row),
            old,
        };
        Self::fan_out(&mut tables, event, |_| true);
    }

    pub fn seed_competitors(&self, competitors: &[Competitor]) {
        for c in competitors {
            self.upsert_competitor(c);
        }
    }

    pub fn remove_competitor(&self, number: u32) {
        let mut tables = lock(&self.tables);
        let before = tables.teams.len();
        let mut removed = None;
        tables.teams.retain(|t| {
            if t.number == Some(number as i64) {
                removed = Some(t.clone());
                false
            } else {
                true
            }
        });
        if tables.teams.len() != before {
            let event = ChangeEvent {
                topic: Topic::Roster,
                kind: ChangeKind::Delete,
                new: None,
                old: removed.as_ref().and_then(to_value),
            };
            Self::fan_out(&mut tables, event, |_| true);
        }
    }

    fn next_seq(&self) -> u64 {
        self.op_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn profile(&self) -> FaultProfile {
        self.faults.lock().map(|f| f.clone()).unwrap_or_default()
    }

    fn gate_read(&self, op: &str) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Transport(format!("{}: store offline", op)));
        }
        if should_fault(self.next_seq(), self.profile().read_failure_rate) {
            return Err(StoreError::Transport(format!("{}: injected read failure", op)));
        }
        Ok(())
    }

    fn gate_write(&self, op: &str) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Transport(format!("{}: store offline", op)));
        }
        if should_fault(self.next_seq(), self.profile().write_failure_rate) {
            return Err(StoreError::Transport(format!("{}: injected write failure", op)));
        }
        Ok(())
    }

    /// Applied-but-unacknowledged writes.
    fn ack(&self, op: &str) -> StoreResult<()> {
        if should_fault(self.next_seq(), self.profile().lost_ack_rate) {
            return Err(StoreError::Transport(format!("{}: acknowledgement lost", op)));
        }
        Ok(())
    }

    fn bump(&self, f: impl FnOnce(&mut WriteCounters)) {
        if let Ok(mut c) = self.counters.lock() {
            f(&mut c);
        }
    }

    fn fan_out(tables: &mut Tables, event: ChangeEvent, matches: impl Fn(&FeedScope) -> bool) {
        tables.subscribers.retain(|s| !s.tx.is_closed());
        for sub in tables.subscribers.iter().filter(|s| s.topic == event.topic && matches(&s.scope)) {
            if sub.tx.try_send(event.clone()).is_err() {
                log(
                    Level::Error,
                    Domain::Store,
                    "feed_overflow",
                    obj(&[
                        ("subscriber", v_num(sub.id as f64)),
                        ("table", v_str(event.topic.table())),
                    ]),
                );
            }
        }
    }

    fn release_hook(tables: Weak<Mutex<Tables>>, id: u64) -> impl FnOnce() + Send + Sync + 'static {
        move || {
            if let Some(tables) = tables.upgrade() {
                lock(&tables).subscribers.retain(|s| s.id != id);
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch_competitors(&self) -> StoreResult<Vec<CompetitorRow>> {
        self.gate_read("fetch_competitors")?;
        Ok(lock(&self.tables).teams.clone())
    }

    async fn fetch_slots(&self, session_id: &str) -> StoreResult<Vec<SlotRow>> {
        self.gate_read("fetch_slots")?;
        let tables = lock(&self.tables);
        let mut rows: Vec<SlotRow> = tables
            .slots
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| SlotRow {
                position: Some(r.position),
                team_number: Some(r.team_number),
                session_id: Some(r.session_id.clone()),
                teams: tables.teams.iter().find(|t| t.number == Some(r.team_number)).cloned(),
            })
            .collect();
        rows.sort_by_key(|r| r.position);
        Ok(rows)
    }

    async fn fetch_selection(&self, row_id: i64) -> StoreResult<Option<SelectionRow>> {
        self.gate_read("fetch_selection")?;
        Ok(lock(&self.tables).selections.get(&row_id).cloned())
    }

    async fn insert_slot(&self, row: &NewSlotRow) -> StoreResult<()> {
        self.gate_write("insert_slot")?;
        {
            let mut tables = lock(&self.tables);
            if tables
                .slots
                .iter()
                .any(|r| r.position == row.position && r.session_id == row.session_id)
            {
                return Err(StoreError::Conflict(format!(
                    "start_position (position, session_id)=({}, {})",
                    row.position, row.session_id
                )));
            }
            tables.slots.push(row.clone());
            let event = ChangeEvent {
                topic: Topic::Slots,
                kind: ChangeKind::Insert,
                new: to_value(row),
                old: None,
            };
            let session = row.session_id.clone();
            Self::fan_out(&mut tables, event, |scope| scope.session_id == session);
        }
        self.bump(|c| c.slot_inserts += 1);
        self.ack("insert_slot")
    }

    async fn delete_slot(&self, session_id: &str, position: usize) -> StoreResult<bool> {
        self.gate_write("delete_slot")?;
        let hit = {
            let mut tables = lock(&self.tables);
            let mut removed = Vec::new();
            tables.slots.retain(|r| {
                let hit = r.session_id == session_id && r.position == position as i64;
                if hit {
                    removed.push(r.clone());
                }
                !hit
            });
            let hit = !removed.is_empty();
            for row in removed {
                let event = ChangeEvent {
                    topic: Topic::Slots,
                    kind: ChangeKind::Delete,
                    new: None,
                    old: to_value(&row),
                };
                Self::fan_out(&mut tables, event, |scope| scope.session_id == session_id);
            }
            hit
        };
        self.bump(|c| c.slot_deletes += 1);
        self.ack("delete_slot")?;
        Ok(hit)
    }

    async fn clear_slots(&self, session_id: &str) -> StoreResult<Vec<usize>> {
        self.gate_write("clear_slots")?;
        let cleared = {
            let mut tables = lock(&self.tables);
            let (removed, kept): (Vec<NewSlotRow>, Vec<NewSlotRow>) =
                tables.slots.drain(..).partition(|r| r.session_id == session_id);
            tables.slots = kept;
            let mut cleared: Vec<usize> = removed
                .iter()
                .filter_map(|r| usize::try_from(r.position).ok())
                .collect();
            cleared.sort_unstable();
            for row in removed {
                let event = ChangeEvent {
                    topic: Topic::Slots,
                    kind: ChangeKind::Delete,
                    new: None,
                    old: to_value(&row),
                };
                Self::fan_out(&mut tables, event, |scope| scope.session_id == session_id);
            }
            cleared
        };
        self.bump(|c| c.slot_deletes += 1);
        self.ack("clear_slots")?;
        Ok(cleared)
    }

    async fn upsert_selection(&self, row: &SelectionRow) -> StoreResult<()> {
        self.gate_write("upsert_selection")?;
        {
            let mut tables = lock(&self.tables);
            let old = tables.selections.insert(row.id, row.clone());
            let event = ChangeEvent {
                topic: Topic::Selection,
                kind: if old.is_some() {
                    ChangeKind::Update
                } else {
                    ChangeKind::Insert
                },
                new: to_value(row),
                old: old.as_ref().and_then(to_value),
            };
            let id = row.id;
            Self::fan_out(&mut tables, event, |scope| scope.selection_row_id == id);
        }
        self.bump(|c| c.selection_upserts += 1);
        self.ack("upsert_selection")
    }

    async fn subscribe(&self, topic: Topic, scope: &FeedScope) -> StoreResult<ChangeFeed> {
        self.gate_read("subscribe")?;
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.feed_capacity);
        lock(&self.tables).subscribers.push(Subscriber {
            id,
            topic,
            scope: scope.clone(),
            tx,
        });
        let hook = Self::release_hook(Arc::downgrade(&self.tables), id);
        Ok(ChangeFeed::new(topic, rx, hook))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.gate_read("ping")
    }
}
