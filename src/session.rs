//! One client's view of a starting-grid session.
//!
//! A [`Session`] owns the local replica (registry, slot table, selection),
//! the subscriptions that keep it fresh, and the handle to the remote store.
//! Local mutations apply optimistically and are then written through; remote
//! notifications are merged with the same equality-gated setters, after
//! which the auto-advance machine is re-run.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::advance::{self, Directive, Phase};
use crate::cascade::insert_with_cascade;
use crate::error::{StoreError, StoreResult, SyncError, SyncResult};
use crate::logging::{
    agg_increment, log, log_remote_failure, log_selection_change, log_slot_change, log_transition, obj, v_num,
    v_str, Domain, Level, ProfileScope,
};
use crate::model::{Competitor, SelectionState};
use crate::registry::Registry;
use crate::reliability::retry::retry_async;
use crate::replication::{FeedSignal, Subscriptions, TOPICS};
use crate::slots::SlotTable;
use crate::state::Config;
use crate::store::rows::{
    decode_selection, decode_slot, deleted_position, from_value, CompetitorRow, NewSlotRow, SelectingRef,
    SelectionRow, SlotRow,
};
use crate::store::{with_timeout, ChangeEvent, ChangeKind, FeedScope, RemoteStore, Topic};

/// Read-only copy of everything a presentation layer needs to render.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub registry: Registry,
    pub slots: SlotTable,
    pub selection: SelectionState,
    pub phase: Phase,
}

/// Outcome of a confirm that reached the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub position: usize,
    pub competitor: Competitor,
    /// The placement landed but advancing the shared selection did not.
    pub sync_warning: Option<SyncError>,
}

/// Own writes whose change notification has not come back yet.
const MAX_PENDING_ECHOES: usize = 64;

#[derive(Debug, Clone)]
struct SelectionEcho {
    state: SelectionState,
    stamp: Option<DateTime<Utc>>,
}

impl SelectionEcho {
    /// Same value, and the same write time when both sides carry one.
    fn matches(&self, state: &SelectionState, stamp: Option<DateTime<Utc>>) -> bool {
        self.state.same_as(state)
            && match (self.stamp, stamp) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
    }
}

/// How an incoming change relates to the own writes still awaiting their
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    /// The notification of one of our writes.
    Own,
    /// Someone else's change that raced one of our unechoed writes.
    Stale,
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotEcho {
    position: usize,
    number: Option<u32>,
}

type InitialRead = (Vec<CompetitorRow>, Vec<SlotRow>, Option<SelectionRow>);

async fn read_all(store: &dyn RemoteStore, scope: &FeedScope, cfg: &Config) -> SyncResult<InitialRead> {
    let competitors = with_timeout(cfg.remote_timeout, store.fetch_competitors()).await?;
    let slots = with_timeout(cfg.remote_timeout, store.fetch_slots(&scope.session_id)).await?;
    let selection = with_timeout(cfg.remote_timeout, store.fetch_selection(scope.selection_row_id)).await?;
    Ok((competitors, slots, selection))
}

fn registry_from_rows(rows: &[CompetitorRow]) -> Registry {
    let competitors = rows
        .iter()
        .filter_map(|row| match Competitor::try_from(row) {
            Ok(c) => Some(c),
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Sync,
                    "competitor_skipped",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                None
            }
        })
        .collect();
    Registry::new(competitors)
}

pub struct Session {
    store: Arc<dyn RemoteStore>,
    cfg: Config,
    scope: FeedScope,
    registry: Registry,
    slots: SlotTable,
    selection: SelectionState,
    feeds: Subscriptions,
    last_phase: Phase,
    selection_echoes: VecDeque<SelectionEcho>,
    slot_echoes: VecDeque<SlotEcho>,
    /// Follows the session without driving auto-advance.
    observer: bool,
}

impl Session {
    /// Subscribes to every topic, performs the initial full read (with
    /// backoff), replays anything that arrived meanwhile and runs
    /// auto-advance once. Mutations are accepted only after this returns.
    pub async fn start(store: Arc<dyn RemoteStore>, cfg: Config) -> SyncResult<Self> {
        Self::open(store, cfg, false).await
    }

    /// Like [`Session::start`], but auto-advance is never written back; the
    /// session only mirrors what controllers do.
    pub async fn observe(store: Arc<dyn RemoteStore>, cfg: Config) -> SyncResult<Self> {
        Self::open(store, cfg, true).await
    }

    async fn open(store: Arc<dyn RemoteStore>, cfg: Config, observer: bool) -> SyncResult<Self> {
        let scope = FeedScope {
            session_id: cfg.session_id.clone(),
            selection_row_id: cfg.selection_row_id,
        };
        let mut session = Self {
            store,
            slots: SlotTable::new(cfg.slot_count),
            registry: Registry::default(),
            selection: SelectionState::cleared(),
            feeds: Subscriptions::new(),
            last_phase: Phase::Idle,
            selection_echoes: VecDeque::new(),
            slot_echoes: VecDeque::new(),
            observer,
            scope,
            cfg,
        };

        for topic in TOPICS {
            session
                .feeds
                .ensure(session.store.as_ref(), topic, &session.scope, session.cfg.remote_timeout)
                .await?;
        }

        let retry = session.cfg.startup_retry();
        let (store, scope, cfg) = (session.store.as_ref(), &session.scope, &session.cfg);
        let (competitor_rows, slot_rows, selection_row) =
            retry_async(&retry, "initial_read", || read_all(store, scope, cfg)).await?;

        session.registry = registry_from_rows(&competitor_rows);
        session.slots = session.slots_from_rows(&slot_rows)?;
        session.selection = session.selection_from_row(selection_row.as_ref());
        session.last_phase = session.phase();

        let replayed = session.drain_pending().await;
        if let Err(err) = session.after_change("startup").await {
            log(
                Level::Warn,
                Domain::Sync,
                "startup_advance_failed",
                obj(&[("error", v_str(&err.to_string()))]),
            );
        }

        log(
            Level::Info,
            Domain::System,
            "session_started",
            obj(&[
                ("session_id", v_str(&session.scope.session_id)),
                ("competitors", v_num(session.registry.len() as f64)),
                ("occupied", v_num(session.slots.occupied_count() as f64)),
                ("replayed", v_num(replayed as f64)),
                ("phase", v_str(session.last_phase.as_str())),
            ]),
        );
        Ok(session)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn session_id(&self) -> &str {
        &self.scope.session_id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn phase(&self) -> Phase {
        advance::phase(&self.registry, &self.slots, &self.selection)
    }

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.feeds.is_subscribed(topic)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            registry: self.registry.clone(),
            slots: self.slots.clone(),
            selection: self.selection.clone(),
            phase: self.phase(),
        }
    }

    pub fn available_positions(&self) -> Vec<usize> {
        self.slots.available_positions()
    }

    pub fn occupant_of(&self, number: u32) -> Option<usize> {
        self.slots.occupant_of(number)
    }

    // -------------------------------------------------------------------------
    // Selection cursor
    // -------------------------------------------------------------------------

    /// Binds (or clears) the selecting competitor, keeping the cursor.
    /// Returns whether anything was written.
    pub async fn set_selecting(&mut self, competitor: Option<Competitor>) -> SyncResult<bool> {
        let selecting = match competitor {
            Some(c) => Some(self.registry.get(c.number).cloned().ok_or(SyncError::UnknownCompetitor)?),
            None => None,
        };
        let next = SelectionState {
            selecting,
            cursor: self.selection.cursor,
        };
        self.write_selection(next, "set_selecting").await
    }

    pub async fn set_cursor(&mut self, position: usize) -> SyncResult<bool> {
        self.slots.check_position(position)?;
        let next = SelectionState {
            selecting: self.selection.selecting.clone(),
            cursor: position,
        };
        self.write_selection(next, "set_cursor").await
    }

    /// Moves the cursor by `delta`, clamped to the table.
    pub async fn move_cursor(&mut self, delta: i64) -> SyncResult<bool> {
        let max = self.slots.len().max(1) as i64;
        let target = (self.selection.cursor as i64).saturating_add(delta).clamp(1, max);
        self.set_cursor(target as usize).await
    }

    pub async fn move_up(&mut self) -> SyncResult<bool> {
        self.move_cursor(-1).await
    }

    pub async fn move_down(&mut self) -> SyncResult<bool> {
        self.move_cursor(1).await
    }

    /// Equality-gated write of the shared selection. The local copy is
    /// updated first and kept even if the upsert fails.
    async fn write_selection(&mut self, next: SelectionState, origin: &'static str) -> SyncResult<bool> {
        if self.selection.same_as(&next) {
            agg_increment("skipped_write");
            return Ok(false);
        }
        self.selection = next;
        log_selection_change(
            &self.scope.session_id,
            origin,
            self.selection.selecting_number(),
            self.selection.cursor,
        );
        let row = SelectionRow::encode(&self.selection, self.scope.selection_row_id, &self.scope.session_id);
        self.remote_write("upsert_selection", self.store.upsert_selection(&row))
            .await?;
        self.expect_selection_echo(&row);
        Ok(true)
    }

    fn expect_selection_echo(&mut self, row: &SelectionRow) {
        if self.selection_echoes.len() >= MAX_PENDING_ECHOES {
            self.selection_echoes.pop_front();
        }
        let state = self.selection_from_row(Some(row));
        self.selection_echoes.push_back(SelectionEcho {
            state,
            stamp: row.stamp(),
        });
    }

    fn expect_slot_echo(&mut self, position: usize, number: Option<u32>) {
        if self.slot_echoes.len() >= MAX_PENDING_ECHOES {
            self.slot_echoes.pop_front();
        }
        self.slot_echoes.push_back(SlotEcho { position, number });
    }

    /// Consumes the echo of an own selection write, along with any older
    /// ones it supersedes.
    fn settle_selection_echo(&mut self, incoming: &SelectionState, stamp: Option<DateTime<Utc>>) -> Echo {
        if let Some(idx) = self.selection_echoes.iter().position(|w| w.matches(incoming, stamp)) {
            self.selection_echoes.drain(..=idx);
            return Echo::Own;
        }
        if self.selection_echoes.is_empty() {
            Echo::Foreign
        } else {
            Echo::Stale
        }
    }

    /// Slot counterpart of [`Self::settle_selection_echo`], per position.
    fn settle_slot_echo(&mut self, position: usize, number: Option<u32>) -> Echo {
        let echo = SlotEcho { position, number };
        if let Some(idx) = self.slot_echoes.iter().position(|e| *e == echo) {
            self.slot_echoes.remove(idx);
            return Echo::Own;
        }
        if self.slot_echoes.iter().any(|e| e.position == position) {
            Echo::Stale
        } else {
            Echo::Foreign
        }
    }

    // -------------------------------------------------------------------------
    // Slot mutations
    // -------------------------------------------------------------------------

    /// Places the offered competitor at the cursor.
    ///
    /// The slot is occupied locally first, then inserted remotely. If the
    /// store reports the slot as taken, the optimistic placement is undone,
    /// the slots are re-read and `AlreadyOccupied` names the real occupant.
    pub async fn confirm_current_selection(&mut self) -> SyncResult<Confirmation> {
        let (position, competitor) = advance::check_confirm(&self.slots, &self.selection)?;
        self.slots.occupy(position, competitor.clone())?;
        log_slot_change(&self.scope.session_id, "confirm", position, Some(competitor.number));

        let row = NewSlotRow::new(position, competitor.number, &self.scope.session_id);
        let inserted = self.remote_write("insert_slot", self.store.insert_slot(&row)).await;
        match inserted {
            Ok(()) => {
                self.expect_slot_echo(position, Some(competitor.number));
                let sync_warning = self.after_change("confirm").await.err();
                Ok(Confirmation {
                    position,
                    competitor,
                    sync_warning,
                })
            }
            Err(StoreError::Conflict(detail)) => {
                self.slots.vacate(position)?;
                log(
                    Level::Warn,
                    Domain::Slots,
                    "commit_conflict",
                    obj(&[
                        ("session_id", v_str(&self.scope.session_id)),
                        ("position", v_num(position as f64)),
                        ("competitor", v_num(competitor.number as f64)),
                        ("detail", v_str(&detail)),
                    ]),
                );
                self.resync_slots().await?;
                self.advance_or_warn("conflict").await;
                match self.slots.occupant(position) {
                    Some(occupant) => Err(SyncError::AlreadyOccupied {
                        position,
                        occupant: occupant.number,
                    }),
                    None => Err(SyncError::RemoteUnavailable(format!(
                        "position {} reported taken but reads back empty",
                        position
                    ))),
                }
            }
            Err(err) => {
                self.advance_or_warn("confirm").await;
                Err(err.into())
            }
        }
    }

    /// Empties one slot locally and deletes its row. Returns the previous
    /// occupant; an already empty slot writes nothing.
    pub async fn vacate(&mut self, position: usize) -> SyncResult<Option<Competitor>> {
        let previous = self.slots.vacate(position)?;
        if previous.is_none() {
            return Ok(None);
        }
        log_slot_change(&self.scope.session_id, "vacate", position, None);
        let removed = self
            .remote_write("delete_slot", self.store.delete_slot(&self.scope.session_id, position))
            .await;
        if let Ok(true) = removed {
            self.expect_slot_echo(position, None);
        }
        let advanced = self.after_change("vacate").await;
        removed?;
        advanced?;
        Ok(previous)
    }

    /// Clears every slot of the session and neutralizes the selection, then
    /// lets auto-advance offer the first competitor again. Nothing changes
    /// locally unless the store accepted the clear.
    pub async fn reset_all(&mut self) -> SyncResult<()> {
        let cleared = self
            .remote_write("clear_slots", self.store.clear_slots(&self.scope.session_id))
            .await?;
        for position in cleared {
            self.expect_slot_echo(position, None);
        }
        let neutral = SelectionRow::neutral(self.scope.selection_row_id, &self.scope.session_id);
        self.remote_write("upsert_selection", self.store.upsert_selection(&neutral))
            .await?;
        self.expect_selection_echo(&neutral);

        self.slots.reset();
        self.selection = SelectionState::cleared();
        log(
            Level::Info,
            Domain::Slots,
            "reset",
            obj(&[("session_id", v_str(&self.scope.session_id))]),
        );
        self.after_change("reset").await?;
        Ok(())
    }

    /// Where the offered competitor would land if dropped at the cursor.
    pub fn preview(&self) -> SyncResult<SlotTable> {
        self.preview_at(self.selection.cursor)
    }

    pub fn preview_at(&self, target: usize) -> SyncResult<SlotTable> {
        let competitor = self.selection.selecting.as_ref().ok_or(SyncError::UnknownCompetitor)?;
        insert_with_cascade(&self.slots, competitor, target)
    }

    // -------------------------------------------------------------------------
    // Remote changes
    // -------------------------------------------------------------------------

    /// Merges one change notification. Returns whether local state changed.
    pub async fn apply_remote(&mut self, event: ChangeEvent) -> SyncResult<bool> {
        agg_increment("remote_event");
        let changed = match event.topic {
            Topic::Roster => self.refresh_roster().await?,
            Topic::Slots => self.merge_slot_event(&event).await?,
            Topic::Selection => self.merge_selection_event(&event).await?,
        };
        if changed {
            self.after_change("remote").await?;
        }
        Ok(changed)
    }

    async fn merge_slot_event(&mut self, event: &ChangeEvent) -> SyncResult<bool> {
        let slot_count = self.slots.len();
        match event.kind {
            ChangeKind::Delete => match event.old.as_ref().and_then(|old| deleted_position(old, slot_count)) {
                Some(position) => {
                    match self.settle_slot_echo(position, None) {
                        Echo::Own => return Ok(false),
                        Echo::Stale => return self.resync_slots().await,
                        Echo::Foreign => {}
                    }
                    let changed = self.slots.merge_vacancy(position)?;
                    if changed {
                        log_slot_change(&self.scope.session_id, "remote", position, None);
                    }
                    Ok(changed)
                }
                None => self.resync_slots().await,
            },
            ChangeKind::Insert | ChangeKind::Update => {
                let raw = event
                    .new
                    .clone()
                    .ok_or_else(|| SyncError::invalid_row("start_position", "change without new row"))?;
                let row: SlotRow = from_value("start_position", raw)?;
                if row.session_id.as_deref().is_some_and(|s| s != self.scope.session_id) {
                    return Ok(false);
                }
                let (position, competitor) = match decode_slot(&row, &self.registry, slot_count) {
                    Ok(decoded) => decoded,
                    Err(SyncError::UnknownCompetitor) => return self.resync_slots().await,
                    Err(err) => return Err(err),
                };
                match self.settle_slot_echo(position, Some(competitor.number)) {
                    Echo::Own => return Ok(false),
                    Echo::Stale => return self.resync_slots().await,
                    Echo::Foreign => {}
                }
                let moved_from = event
                    .old
                    .as_ref()
                    .and_then(|old| deleted_position(old, slot_count))
                    .filter(|old| *old != position);
                let placed_elsewhere = self
                    .slots
                    .occupant_of(competitor.number)
                    .filter(|held| *held != position && Some(*held) != moved_from);
                if placed_elsewhere.is_some() {
                    // Two rows for one competitor: the full read decides.
                    return self.resync_slots().await;
                }
                let mut changed = false;
                if let Some(old) = moved_from {
                    changed |= self.slots.merge_vacancy(old)?;
                }
                let number = competitor.number;
                if self.slots.merge_occupant(position, competitor)? {
                    log_slot_change(&self.scope.session_id, "remote", position, Some(number));
                    changed = true;
                }
                Ok(changed)
            }
        }
    }

    async fn merge_selection_event(&mut self, event: &ChangeEvent) -> SyncResult<bool> {
        let (incoming, stamp) = match (event.kind, &event.new) {
            (ChangeKind::Delete, _) | (_, None) => (SelectionState::cleared(), None),
            (_, Some(raw)) => {
                let row: SelectionRow = from_value("current_selection", raw.clone())?;
                if row.id != self.scope.selection_row_id {
                    return Ok(false);
                }
                (self.decode_selection_row(&row)?, row.stamp())
            }
        };
        match self.settle_selection_echo(&incoming, stamp) {
            Echo::Own => return Ok(false),
            // Either it precedes our write or our notification was lost;
            // the stored row decides.
            Echo::Stale => return self.resync_selection().await,
            Echo::Foreign => {}
        }
        if self.selection.same_as(&incoming) {
            return Ok(false);
        }
        self.selection = incoming;
        log_selection_change(
            &self.scope.session_id,
            "remote",
            self.selection.selecting_number(),
            self.selection.cursor,
        );
        Ok(true)
    }

    fn decode_selection_row(&self, row: &SelectionRow) -> SyncResult<SelectionState> {
        let decoded = decode_selection(row, &self.registry, self.slots.len())?;
        let selecting = match decoded.selecting {
            SelectingRef::Nobody => None,
            SelectingRef::Known(c) => Some(c),
            SelectingRef::Unknown(number) => {
                log(
                    Level::Warn,
                    Domain::Selection,
                    "unknown_selecting",
                    obj(&[
                        ("session_id", v_str(&self.scope.session_id)),
                        ("competitor", v_num(number as f64)),
                    ]),
                );
                self.selection.selecting.clone()
            }
        };
        Ok(SelectionState {
            selecting,
            cursor: decoded.cursor,
        })
    }

    fn selection_from_row(&self, row: Option<&SelectionRow>) -> SelectionState {
        let Some(row) = row else {
            return SelectionState::cleared();
        };
        match self.decode_selection_row(row) {
            Ok(state) => state,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Selection,
                    "selection_row_rejected",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                SelectionState::cleared()
            }
        }
    }

    fn slots_from_rows(&self, rows: &[SlotRow]) -> SyncResult<SlotTable> {
        let slot_count = self.slots.len();
        let occupants = rows
            .iter()
            .filter_map(|row| match decode_slot(row, &self.registry, slot_count) {
                Ok(pair) => Some(pair),
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Slots,
                        "slot_row_skipped",
                        obj(&[
                            ("session_id", v_str(&self.scope.session_id)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    None
                }
            })
            .collect();
        SlotTable::from_occupants(slot_count, occupants)
    }

    /// Replaces the local slot table with a full read. Returns whether it
    /// differed.
    pub async fn resync_slots(&mut self) -> SyncResult<bool> {
        let rows = self.remote_read("fetch_slots", self.store.fetch_slots(&self.scope.session_id)).await?;
        let fresh = self.slots_from_rows(&rows)?;
        self.slot_echoes.clear();
        if fresh == self.slots {
            return Ok(false);
        }
        self.slots = fresh;
        log(
            Level::Info,
            Domain::Sync,
            "slots_resynced",
            obj(&[
                ("session_id", v_str(&self.scope.session_id)),
                ("occupied", v_num(self.slots.occupied_count() as f64)),
            ]),
        );
        Ok(true)
    }

    pub async fn resync_selection(&mut self) -> SyncResult<bool> {
        let row = self
            .remote_read("fetch_selection", self.store.fetch_selection(self.scope.selection_row_id))
            .await?;
        let fresh = self.selection_from_row(row.as_ref());
        self.selection_echoes.clear();
        if fresh.same_as(&self.selection) {
            return Ok(false);
        }
        self.selection = fresh;
        Ok(true)
    }

    /// Re-reads and re-ranks the roster. Placed and offered competitors pick
    /// up edited attributes. Returns whether the registry changed.
    pub async fn refresh_roster(&mut self) -> SyncResult<bool> {
        let rows = self.remote_read("fetch_competitors", self.store.fetch_competitors()).await?;
        let fresh = registry_from_rows(&rows);
        if fresh == self.registry {
            return Ok(false);
        }
        for slot in self.slots.slots_mut() {
            if let Some(updated) = slot.competitor.as_ref().and_then(|c| fresh.get(c.number)) {
                slot.competitor = Some(updated.clone());
            }
        }
        if let Some(updated) = self.selection.selecting_number().and_then(|n| fresh.get(n)) {
            self.selection.selecting = Some(updated.clone());
        }
        log(
            Level::Info,
            Domain::Sync,
            "roster_refreshed",
            obj(&[
                ("before", v_num(self.registry.len() as f64)),
                ("after", v_num(fresh.len() as f64)),
            ]),
        );
        self.registry = fresh;
        Ok(true)
    }

    /// Waits for the next notification and merges it. A feed that ended is
    /// re-acquired and its topic re-read. `None` once every feed is gone.
    pub async fn next_change(&mut self) -> Option<SyncResult<bool>> {
        let signal = self.next_signal().await?;
        Some(self.handle_signal(signal).await)
    }

    /// Waits for the next feed signal without applying it. Cancel-safe, so
    /// it can sit in a `select!` next to other input.
    pub async fn next_signal(&mut self) -> Option<FeedSignal> {
        self.feeds.next().await
    }

    pub async fn handle_signal(&mut self, signal: FeedSignal) -> SyncResult<bool> {
        match signal {
            FeedSignal::Event(event) => self.apply_remote(event).await,
            FeedSignal::Closed(topic) => self.recover_topic(topic).await,
        }
    }

    pub fn has_feeds(&self) -> bool {
        self.feeds.live_count() > 0
    }

    /// Re-acquires every topic that has no live feed and re-reads those
    /// topics. Returns how many were re-acquired.
    pub async fn resubscribe(&mut self) -> SyncResult<usize> {
        let mut acquired = 0;
        for topic in TOPICS {
            if !self.feeds.is_subscribed(topic) {
                self.recover_topic(topic).await?;
                acquired += 1;
            }
        }
        Ok(acquired)
    }

    async fn recover_topic(&mut self, topic: Topic) -> SyncResult<bool> {
        self.feeds
            .ensure(self.store.as_ref(), topic, &self.scope, self.cfg.remote_timeout)
            .await?;
        let changed = match topic {
            Topic::Roster => self.refresh_roster().await?,
            Topic::Slots => self.resync_slots().await?,
            Topic::Selection => self.resync_selection().await?,
        };
        if changed {
            self.after_change("resubscribe").await?;
        }
        Ok(changed)
    }

    /// Merges every notification already buffered. Returns how many were
    /// applied.
    pub async fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.feeds.try_next() {
            let topic = event.topic;
            match self.apply_remote(event).await {
                Ok(_) => applied += 1,
                Err(err) => log(
                    Level::Warn,
                    Domain::Sync,
                    "remote_change_rejected",
                    obj(&[
                        ("session_id", v_str(&self.scope.session_id)),
                        ("table", v_str(topic.table())),
                        ("error", v_str(&err.to_string())),
                    ]),
                ),
            }
        }
        applied
    }

    /// Releases every subscription. Safe to call more than once.
    pub fn shutdown(&mut self) -> usize {
        let released = self.feeds.release_all();
        if released > 0 {
            log(
                Level::Info,
                Domain::System,
                "session_closed",
                obj(&[
                    ("session_id", v_str(&self.scope.session_id)),
                    ("released", v_num(released as f64)),
                ]),
            );
        }
        released
    }

    // -------------------------------------------------------------------------
    // Auto-advance
    // -------------------------------------------------------------------------

    /// Re-runs auto-advance after any change and logs phase transitions.
    async fn after_change(&mut self, trigger: &'static str) -> SyncResult<()> {
        let directive = if self.observer {
            Directive::Keep
        } else {
            advance::reconcile(
                &self.registry,
                &self.slots,
                &self.selection,
                self.cfg.pick_policy,
                self.cfg.cursor_home,
            )
        };
        let written = match directive {
            Directive::Keep => Ok(false),
            Directive::Offer(next) => self.write_selection(next, "advance").await,
            Directive::Clear => self.write_selection(SelectionState::cleared(), "advance").await,
        };

        let now = self.phase();
        if now != self.last_phase {
            log_transition(
                &self.scope.session_id,
                self.last_phase.as_str(),
                now.as_str(),
                trigger,
                self.selection.selecting_number(),
            );
            self.last_phase = now;
        }
        written.map(|_| ())
    }

    /// Auto-advance on a path that already reports another error.
    async fn advance_or_warn(&mut self, trigger: &'static str) {
        if let Err(err) = self.after_change(trigger).await {
            log(
                Level::Warn,
                Domain::Advance,
                "advance_failed",
                obj(&[
                    ("session_id", v_str(&self.scope.session_id)),
                    ("trigger", v_str(trigger)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Store calls
    // -------------------------------------------------------------------------

    async fn remote_write<T, F>(&self, label: &'static str, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let _timer = ProfileScope::new(label);
        agg_increment("remote_write");
        let result = with_timeout(self.cfg.remote_timeout, call).await;
        match &result {
            Err(StoreError::Conflict(_)) => agg_increment("conflict"),
            Err(err) => log_remote_failure(&self.scope.session_id, label, &err.to_string()),
            Ok(_) => {}
        }
        result
    }

    async fn remote_read<T, F>(&self, label: &'static str, call: F) -> SyncResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let _timer = ProfileScope::new(label);
        with_timeout(self.cfg.remote_timeout, call).await.map_err(|err| {
            log_remote_failure(&self.scope.session_id, label, &err.to_string());
            SyncError::from(err)
        })
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "phase: {}", self.phase.as_str())?;
        let offering = self.selection.selecting.is_some();
        for slot in self.slots.get() {
            let marker = if offering && slot.position == self.selection.cursor {
                '>'
            } else {
                ' '
            };
            match &slot.competitor {
                Some(c) => writeln!(
                    f,
                    "{} {:>2}. #{:<4} {:<24} {}",
                    marker, slot.position, c.number, c.name, c.elapsed
                )?,
                None => writeln!(f, "{} {:>2}. --", marker, slot.position)?,
            }
        }
        match &self.selection.selecting {
            Some(c) => write!(f, "selecting: {} ({})", c, c.elapsed),
            None => write!(f, "selecting: nobody"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advance::CursorHome;
    use crate::model::competitor;
    use crate::store::memory::MemoryStore;

    fn roster() -> Vec<Competitor> {
        vec![
            competitor(11, "01:00:00"),
            competitor(22, "01:00:50"),
            competitor(33, "01:01:00"),
        ]
    }

    async fn session_on(store: &Arc<MemoryStore>, cfg: Config) -> Session {
        let remote: Arc<dyn RemoteStore> = store.clone();
        Session::start(remote, cfg).await.unwrap()
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.seed_competitors(&roster());
        store
    }

    #[tokio::test]
    async fn test_start_offers_top_ranked() {
        let store = seeded();
        let session = session_on(&store, Config::default()).await;
        assert_eq!(session.selection().selecting_number(), Some(11));
        assert_eq!(session.selection().cursor, 1);
        assert_eq!(session.phase(), Phase::Offering { number: 11, cursor: 1 });
        assert_eq!(store.selection_row(1).and_then(|r| r.selecting_competitor_id), Some(11));
    }

    #[tokio::test]
    async fn test_set_selecting_twice_writes_once() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        let before = store.counters().selection_upserts;
        let pick = competitor(22, "01:00:50");
        assert!(session.set_selecting(Some(pick.clone())).await.unwrap());
        assert!(!session.set_selecting(Some(pick)).await.unwrap());
        assert_eq!(store.counters().selection_upserts, before + 1);
    }

    #[tokio::test]
    async fn test_set_selecting_rejects_unknown() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        let err = session.set_selecting(Some(competitor(99, "01:00:00"))).await.unwrap_err();
        assert_eq!(err, SyncError::UnknownCompetitor);
    }

    #[tokio::test]
    async fn test_move_cursor_clamps() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        assert!(!session.move_up().await.unwrap());
        assert_eq!(session.selection().cursor, 1);
        session.move_cursor(25).await.unwrap();
        assert_eq!(session.selection().cursor, 10);
        session.move_down().await.unwrap();
        assert_eq!(session.selection().cursor, 10);
        assert!(matches!(session.set_cursor(11).await, Err(SyncError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn test_confirm_advances_to_next() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        let done = session.confirm_current_selection().await.unwrap();
        assert_eq!(done.position, 1);
        assert_eq!(done.competitor.number, 11);
        assert!(done.sync_warning.is_none());
        assert_eq!(session.selection().selecting_number(), Some(22));
        assert_eq!(session.selection().cursor, 1);
        assert_eq!(store.occupancy("default"), vec![(1, 11)]);
    }

    #[tokio::test]
    async fn test_confirm_into_occupied_is_inert() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        session.confirm_current_selection().await.unwrap();
        let inserts = store.counters().slot_inserts;
        let err = session.confirm_current_selection().await.unwrap_err();
        assert_eq!(err, SyncError::AlreadyOccupied { position: 1, occupant: 11 });
        assert_eq!(store.counters().slot_inserts, inserts);
        assert_eq!(session.slots().occupied_count(), 1);
    }

    #[tokio::test]
    async fn test_three_confirms_reach_done_with_vacant_home() {
        let store = seeded();
        let cfg = Config {
            cursor_home: CursorHome::FirstVacant,
            ..Config::default()
        };
        let mut session = session_on(&store, cfg).await;
        for _ in 0..3 {
            session.confirm_current_selection().await.unwrap();
        }
        assert_eq!(store.occupancy("default"), vec![(1, 11), (2, 22), (3, 33)]);
        assert_eq!(session.phase(), Phase::Done);
        assert!(session.selection().selecting.is_none());
    }

    #[tokio::test]
    async fn test_confirm_with_nobody_offered() {
        let store = Arc::new(MemoryStore::new());
        let mut session = session_on(&store, Config::default()).await;
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(
            session.confirm_current_selection().await.unwrap_err(),
            SyncError::UnknownCompetitor
        );
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_placement() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        store.set_offline(true);
        let err = session.confirm_current_selection().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.slots().occupant(1).map(|c| c.number), Some(11));
        assert!(store.occupancy("default").is_empty());
    }

    #[tokio::test]
    async fn test_reset_failure_changes_nothing() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        session.confirm_current_selection().await.unwrap();
        store.set_offline(true);
        assert!(session.reset_all().await.is_err());
        assert_eq!(session.slots().occupied_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_reoffers_first() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        session.confirm_current_selection().await.unwrap();
        session.reset_all().await.unwrap();
        assert_eq!(session.slots().occupied_count(), 0);
        assert_eq!(session.selection().selecting_number(), Some(11));
        assert!(store.occupancy("default").is_empty());
    }

    #[tokio::test]
    async fn test_vacate_writes_single_delete() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        session.confirm_current_selection().await.unwrap();
        let removed = session.vacate(1).await.unwrap();
        assert_eq!(removed.map(|c| c.number), Some(11));
        assert!(session.vacate(1).await.unwrap().is_none());
        assert_eq!(store.counters().slot_deletes, 1);
    }

    #[tokio::test]
    async fn test_vacate_of_unstored_placement_awaits_no_echo() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        store.set_offline(true);
        assert!(session.confirm_current_selection().await.is_err());
        store.set_offline(false);

        assert_eq!(session.vacate(1).await.unwrap().map(|c| c.number), Some(11));
        assert!(session.slot_echoes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_selection_echo_does_not_hide_later_changes() {
        let store = seeded();
        let mut a = session_on(&store, Config::default()).await;
        let mut b = session_on(&store, Config::default()).await;
        a.drain_pending().await;
        b.drain_pending().await;

        let never_written = SelectionRow::encode(
            &SelectionState::offering(competitor(22, "01:00:50"), 5),
            a.scope.selection_row_id,
            &a.scope.session_id,
        );
        a.expect_selection_echo(&never_written);

        b.set_cursor(3).await.unwrap();
        a.drain_pending().await;
        assert_eq!(a.selection().cursor, 3);
        assert_eq!(a.selection().selecting_number(), Some(11));
        assert!(a.selection_echoes.is_empty());

        b.set_cursor(4).await.unwrap();
        a.drain_pending().await;
        assert_eq!(a.selection().cursor, 4);
    }

    #[tokio::test]
    async fn test_preview_does_not_mutate() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        session.confirm_current_selection().await.unwrap();
        let preview = session.preview().unwrap();
        assert_eq!(preview.occupant(1).map(|c| c.number), Some(22));
        assert_eq!(preview.occupant(2).map(|c| c.number), Some(11));
        assert_eq!(session.slots().occupant(1).map(|c| c.number), Some(11));
        assert!(session.slots().occupant(2).is_none());
    }

    #[tokio::test]
    async fn test_own_echo_is_noop() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        session.confirm_current_selection().await.unwrap();
        let upserts = store.counters().selection_upserts;
        session.drain_pending().await;
        assert_eq!(store.counters().selection_upserts, upserts);
        assert_eq!(session.selection().selecting_number(), Some(22));
    }

    #[tokio::test]
    async fn test_shutdown_releases_once() {
        let store = seeded();
        let mut session = session_on(&store, Config::default()).await;
        assert!(session.is_subscribed(Topic::Slots));
        assert_eq!(session.shutdown(), 3);
        assert_eq!(session.shutdown(), 0);
        assert_eq!(store.subscriber_count(Topic::Slots), 0);
    }
}
