//! Multi-client convergence: several sessions sharing one in-memory store.
//!
//! Each test drives clients the way separate devices would, then lets every
//! client drain its feeds until the store stops producing changes and checks
//! that all replicas agree.

use std::sync::Arc;

use startgrid::advance::{CursorHome, Phase};
use startgrid::model::Competitor;
use startgrid::store::memory::MemoryStore;
use startgrid::store::{RemoteStore, Topic};
use startgrid::{Config, Session, SyncError};

fn crew(number: u32, time: &str) -> Competitor {
    Competitor {
        number,
        name: format!("Driver {}", number),
        country: "PT".to_string(),
        vehicle: "Can-Am".to_string(),
        navigator: format!("Navigator {}", number),
        navigator_country: "PT".to_string(),
        elapsed: time.parse().unwrap(),
    }
}

fn three() -> Vec<Competitor> {
    vec![crew(11, "01:00:00"), crew(22, "01:00:50"), crew(33, "01:01:00")]
}

fn store_with(roster: &[Competitor]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed_competitors(roster);
    store
}

async fn client(store: &Arc<MemoryStore>, cfg: &Config) -> Session {
    let remote: Arc<dyn RemoteStore> = store.clone();
    Session::start(remote, cfg.clone()).await.unwrap()
}

/// Drains every client until a full pass applies nothing.
async fn settle(sessions: &mut [&mut Session]) {
    for _ in 0..16 {
        let mut applied = 0;
        for s in sessions.iter_mut() {
            applied += s.drain_pending().await;
        }
        if applied == 0 {
            return;
        }
    }
    panic!("clients kept producing changes");
}

fn numbers(session: &Session) -> Vec<Option<u32>> {
    session
        .slots()
        .get()
        .iter()
        .map(|s| s.competitor.as_ref().map(|c| c.number))
        .collect()
}

fn assert_agree(a: &Session, b: &Session) {
    assert!(a.slots().check_invariants().is_ok());
    assert!(b.slots().check_invariants().is_ok());
    assert_eq!(numbers(a), numbers(b));
    assert!(a.selection().same_as(b.selection()));
}

// ---------------------------------------------------------------------------
// Selection cursor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn c01_repeated_selection_writes_once() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;
    let before = store.counters().selection_upserts;

    assert!(a.set_selecting(Some(crew(22, "01:00:50"))).await.unwrap());
    assert!(!a.set_selecting(Some(crew(22, "01:00:50"))).await.unwrap());
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(store.counters().selection_upserts, before + 1);
    assert_eq!(b.selection().selecting_number(), Some(22));
    assert_agree(&a, &b);
}

#[tokio::test]
async fn c02_cursor_moves_reach_other_clients() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;

    a.move_down().await.unwrap();
    a.move_down().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.selection().cursor, 3);

    b.move_up().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.selection().cursor, 2);
    assert_agree(&a, &b);
}

// ---------------------------------------------------------------------------
// Commit safety
// ---------------------------------------------------------------------------

#[tokio::test]
async fn c03_stale_confirm_is_rejected_after_resync() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;

    a.confirm_current_selection().await.unwrap();
    // b has not seen a's placement yet and still believes slot 1 is free.
    assert!(b.slots().occupant(1).is_none());
    let err = b.confirm_current_selection().await.unwrap_err();
    assert_eq!(err, SyncError::AlreadyOccupied { position: 1, occupant: 11 });
    assert_eq!(b.slots().occupant(1).map(|c| c.number), Some(11));

    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(store.occupancy("default"), vec![(1, 11)]);
    assert_agree(&a, &b);
}

#[tokio::test]
async fn c04_racing_clients_never_double_fill() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;
    let mut c = client(&store, &cfg).await;

    let results = vec![
        a.confirm_current_selection().await.map(|_| ()),
        b.confirm_current_selection().await.map(|_| ()),
        c.confirm_current_selection().await.map(|_| ()),
    ];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    settle(&mut [&mut a, &mut b, &mut c]).await;
    let occupancy = store.occupancy("default");
    assert_eq!(occupancy.len(), 1);
    assert_agree(&a, &b);
    assert_agree(&b, &c);
}

// ---------------------------------------------------------------------------
// Auto-advance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn c05_confirm_advances_every_client() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;

    a.confirm_current_selection().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(b.slots().occupant(1).map(|c| c.number), Some(11));
    assert_eq!(b.phase(), Phase::Offering { number: 22, cursor: 1 });
    assert_agree(&a, &b);
}

#[tokio::test]
async fn c06_reset_reoffers_on_every_client() {
    let store = store_with(&three());
    let cfg = Config {
        cursor_home: CursorHome::FirstVacant,
        ..Config::default()
    };
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;

    a.confirm_current_selection().await.unwrap();
    a.confirm_current_selection().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    b.reset_all().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    for s in [&a, &b] {
        assert_eq!(s.slots().occupied_count(), 0);
        assert_eq!(s.phase(), Phase::Offering { number: 11, cursor: 1 });
    }
    assert!(store.occupancy("default").is_empty());
    assert_agree(&a, &b);
}

#[tokio::test]
async fn c07_three_confirms_end_done_with_vacant_home() {
    let store = store_with(&three());
    let cfg = Config {
        cursor_home: CursorHome::FirstVacant,
        ..Config::default()
    };
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;

    for _ in 0..3 {
        a.confirm_current_selection().await.unwrap();
    }
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(store.occupancy("default"), vec![(1, 11), (2, 22), (3, 33)]);
    assert_eq!(a.phase(), Phase::Done);
    assert_eq!(b.phase(), Phase::Done);
    assert_agree(&a, &b);
}

#[tokio::test]
async fn c08_three_confirms_with_first_home_need_cursor_moves() {
    let store = store_with(&three());
    let mut a = client(&store, &Config::default()).await;

    a.confirm_current_selection().await.unwrap();
    let err = a.confirm_current_selection().await.unwrap_err();
    assert_eq!(err, SyncError::AlreadyOccupied { position: 1, occupant: 11 });
    a.move_down().await.unwrap();
    a.confirm_current_selection().await.unwrap();
    a.move_cursor(2).await.unwrap();
    let last = a.confirm_current_selection().await.unwrap();
    assert_eq!(last.position, 3);

    assert_eq!(store.occupancy("default"), vec![(1, 11), (2, 22), (3, 33)]);
    assert_eq!(a.phase(), Phase::Done);
}

#[tokio::test]
async fn c09_last_remaining_policy_picks_from_the_end() {
    let store = store_with(&three());
    let cfg = Config {
        pick_policy: "last".parse().unwrap(),
        ..Config::default()
    };
    let mut a = client(&store, &cfg).await;
    assert_eq!(a.selection().selecting_number(), Some(33));
    a.confirm_current_selection().await.unwrap();
    assert_eq!(a.selection().selecting_number(), Some(22));
}

// ---------------------------------------------------------------------------
// Roster edits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn c10_roster_edits_rerank_and_replace_offer() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;

    store.upsert_competitor(&crew(5, "00:59:00"));
    settle(&mut [&mut a]).await;
    assert_eq!(a.registry().len(), 4);
    assert_eq!(a.registry().rank_of(5), Some(1));
    // The current offer stays while it is still valid.
    assert_eq!(a.selection().selecting_number(), Some(11));

    store.remove_competitor(11);
    settle(&mut [&mut a]).await;
    assert!(!a.registry().contains(11));
    assert_eq!(a.selection().selecting_number(), Some(5));
}

#[tokio::test]
async fn c11_empty_roster_is_idle() {
    let store = store_with(&[crew(7, "02:00:00")]);
    let mut a = client(&store, &Config::default()).await;
    assert_eq!(a.selection().selecting_number(), Some(7));

    store.remove_competitor(7);
    settle(&mut [&mut a]).await;
    assert_eq!(a.phase(), Phase::Idle);
    assert!(a.selection().selecting.is_none());
}

// ---------------------------------------------------------------------------
// Failures and teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn c12_remote_failure_keeps_local_state() {
    let store = store_with(&three());
    let mut a = client(&store, &Config::default()).await;

    store.set_offline(true);
    let err = a.set_cursor(3).await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteUnavailable(_)));
    assert_eq!(a.selection().cursor, 3);
    assert!(a.reset_all().await.is_err());
    store.set_offline(false);

    assert_eq!(store.selection_row(1).and_then(|r| r.current_position), Some(1));
}

#[tokio::test]
async fn c13_start_fails_when_store_unreachable() {
    let store = store_with(&three());
    store.set_offline(true);
    let remote: Arc<dyn RemoteStore> = store.clone();
    let cfg = Config {
        startup_retries: 0,
        ..Config::default()
    };
    let err = Session::start(remote, cfg).await.err().unwrap();
    assert!(err.is_retryable());
    assert_eq!(store.subscriber_count(Topic::Slots), 0);
}

#[tokio::test]
async fn c14_teardown_releases_each_subscription_once() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let b = client(&store, &cfg).await;
    assert_eq!(store.subscriber_count(Topic::Selection), 2);

    assert_eq!(a.shutdown(), 3);
    assert_eq!(a.shutdown(), 0);
    assert_eq!(store.subscriber_count(Topic::Selection), 1);

    drop(b);
    for topic in [Topic::Roster, Topic::Slots, Topic::Selection] {
        assert_eq!(store.subscriber_count(topic), 0);
    }
}

#[tokio::test]
async fn c15_observer_mirrors_without_writing() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let remote: Arc<dyn RemoteStore> = store.clone();
    let mut viewer = Session::observe(remote, cfg).await.unwrap();

    a.confirm_current_selection().await.unwrap();
    let upserts = store.counters().selection_upserts;
    settle(&mut [&mut viewer]).await;

    assert_eq!(store.counters().selection_upserts, upserts);
    assert_eq!(viewer.slots().occupant(1).map(|c| c.number), Some(11));
    assert_eq!(viewer.selection().selecting_number(), Some(22));
}

#[tokio::test]
async fn c16_vacate_reaches_other_clients() {
    let store = store_with(&three());
    let cfg = Config {
        cursor_home: CursorHome::FirstVacant,
        ..Config::default()
    };
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;

    a.confirm_current_selection().await.unwrap();
    a.confirm_current_selection().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    let removed = b.vacate(1).await.unwrap();
    assert_eq!(removed.map(|c| c.number), Some(11));
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(a.available_positions()[0], 1);
    assert_eq!(a.occupant_of(22), Some(2));
    assert_eq!(store.occupancy("default"), vec![(2, 22)]);
    assert_agree(&a, &b);
}

#[tokio::test]
async fn c17_vacating_an_unstored_placement_keeps_following_the_slot() {
    let store = store_with(&three());
    let cfg = Config::default();
    let mut a = client(&store, &cfg).await;
    let mut b = client(&store, &cfg).await;
    settle(&mut [&mut a, &mut b]).await;

    store.set_offline(true);
    assert!(a.confirm_current_selection().await.is_err());
    store.set_offline(false);
    assert_eq!(a.vacate(1).await.unwrap().map(|c| c.number), Some(11));

    b.confirm_current_selection().await.unwrap();
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(store.occupancy("default"), vec![(1, 11)]);
    assert_eq!(a.slots().occupant(1).map(|c| c.number), Some(11));
    assert_eq!(numbers(&a), numbers(&b));
    assert!(a.slots().check_invariants().is_ok());
}
