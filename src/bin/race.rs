//! Several controllers racing on one in-memory store.
//!
//! Clients confirm, move the cursor, vacate and reset in a seeded random
//! order, sometimes acting on a stale replica, while the store drops writes
//! and acknowledgements. After the faults stop every client re-reads and the
//! run checks that all replicas agree and that no competitor holds two slots.
//!
//! Usage: cargo run --bin grid-race
//! Env: RACE_CLIENTS, RACE_COMPETITORS, RACE_ROUNDS, RACE_SEED, RACE_FAULT_RATE

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use startgrid::logging::{log, obj, v_num, Domain, Level};
use startgrid::model::{Competitor, ElapsedTime};
use startgrid::reliability::fault::FaultProfile;
use startgrid::store::memory::MemoryStore;
use startgrid::store::RemoteStore;
use startgrid::{Config, Session, SyncError};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn roster(n: u32) -> Vec<Competitor> {
    (1..=n)
        .map(|i| Competitor {
            number: 100 + i,
            name: format!("Crew {}", i),
            country: "PT".to_string(),
            vehicle: "Can-Am".to_string(),
            navigator: format!("Navigator {}", i),
            navigator_country: "ES".to_string(),
            // Spread out, with a tie every fourth crew.
            elapsed: ElapsedTime::from_centis(360_000 + (i as u64 / 4) * 4_500 + (i as u64 % 4) * 1_000),
        })
        .collect()
}

#[derive(Debug, Default)]
struct RaceStats {
    confirms: u64,
    conflicts: u64,
    inert: u64,
    remote_failures: u64,
    cursor_moves: u64,
    vacates: u64,
    resets: u64,
    stale_actions: u64,
}

impl RaceStats {
    fn record(&mut self, outcome: &Result<(), SyncError>) {
        match outcome {
            Ok(()) => {}
            Err(SyncError::RemoteUnavailable(_)) => self.remote_failures += 1,
            Err(_) => self.inert += 1,
        }
    }
}

async fn act(session: &mut Session, rng: &mut StdRng, stats: &mut RaceStats) {
    let roll = rng.gen_range(0..100);
    let slot_count = session.slots().len();
    let outcome = match roll {
        0..=54 => {
            stats.confirms += 1;
            match session.confirm_current_selection().await {
                Ok(_) => Ok(()),
                Err(err @ SyncError::AlreadyOccupied { .. }) => {
                    stats.conflicts += 1;
                    session.move_cursor(1).await.map(|_| ()).and(Err(err))
                }
                Err(err) => Err(err),
            }
        }
        55..=79 => {
            stats.cursor_moves += 1;
            session.move_cursor(rng.gen_range(-3..=3)).await.map(|_| ())
        }
        80..=95 => {
            stats.vacates += 1;
            session.vacate(rng.gen_range(1..=slot_count)).await.map(|_| ())
        }
        _ => {
            stats.resets += 1;
            session.reset_all().await
        }
    };
    stats.record(&outcome);
}

fn duplicate_rows(occupancy: &[(usize, u32)]) -> usize {
    let mut seen: HashMap<u32, usize> = HashMap::new();
    for (_, number) in occupancy {
        *seen.entry(*number).or_default() += 1;
    }
    seen.values().filter(|n| **n > 1).count()
}

#[tokio::main]
async fn main() -> Result<()> {
    let clients: usize = env_or("RACE_CLIENTS", 3).max(1);
    let competitors: u32 = env_or("RACE_COMPETITORS", 8);
    let rounds: usize = env_or("RACE_ROUNDS", 300);
    let seed: u64 = env_or("RACE_SEED", 42);
    let fault_rate: f64 = env_or("RACE_FAULT_RATE", 0.05);

    let store = Arc::new(MemoryStore::new());
    store.seed_competitors(&roster(competitors));
    let remote: Arc<dyn RemoteStore> = store.clone();
    let cfg = Config::from_env();

    let mut sessions = Vec::with_capacity(clients);
    for _ in 0..clients {
        sessions.push(Session::start(remote.clone(), cfg.clone()).await?);
    }

    let profile = FaultProfile {
        write_failure_rate: fault_rate,
        lost_ack_rate: fault_rate / 2.0,
        ..FaultProfile::disabled()
    };
    if !profile.is_disabled() {
        log(
            Level::Info,
            Domain::System,
            "faults_enabled",
            obj(&[
                ("write_failure_rate", v_num(profile.write_failure_rate)),
                ("lost_ack_rate", v_num(profile.lost_ack_rate)),
            ]),
        );
    }
    store.set_faults(profile);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut stats = RaceStats::default();
    for round in 0..rounds {
        let idx = rng.gen_range(0..clients);
        let session = &mut sessions[idx];
        if rng.gen_bool(0.7) {
            session.drain_pending().await;
        } else {
            stats.stale_actions += 1;
        }
        act(session, &mut rng, &mut stats).await;
        if let Err(violation) = session.slots().check_invariants() {
            bail!("round {}: client {}: {}", round, idx, violation.msg);
        }
    }

    store.set_faults(FaultProfile::disabled());
    for session in sessions.iter_mut() {
        session.drain_pending().await;
        session.resync_slots().await?;
        session.resync_selection().await?;
    }
    let reference = Session::observe(remote.clone(), cfg.clone()).await?;

    let mut mismatches = 0;
    for (idx, session) in sessions.iter().enumerate() {
        if let Err(violation) = session.slots().check_invariants() {
            bail!("client {} after convergence: {}", idx, violation.msg);
        }
        if session.slots() != reference.slots() {
            eprintln!("client {} diverged:\n{}", idx, session.snapshot());
            mismatches += 1;
        }
    }

    let occupancy = store.occupancy(&cfg.session_id);
    let counters = store.counters();
    log(
        Level::Info,
        Domain::System,
        "race_summary",
        obj(&[
            ("clients", v_num(clients as f64)),
            ("rounds", v_num(rounds as f64)),
            ("confirms", v_num(stats.confirms as f64)),
            ("conflicts", v_num(stats.conflicts as f64)),
            ("inert", v_num(stats.inert as f64)),
            ("remote_failures", v_num(stats.remote_failures as f64)),
            ("cursor_moves", v_num(stats.cursor_moves as f64)),
            ("vacates", v_num(stats.vacates as f64)),
            ("resets", v_num(stats.resets as f64)),
            ("stale_actions", v_num(stats.stale_actions as f64)),
            ("occupied_rows", v_num(occupancy.len() as f64)),
            ("duplicate_rows", v_num(duplicate_rows(&occupancy) as f64)),
            ("slot_inserts", v_num(counters.slot_inserts as f64)),
            ("selection_upserts", v_num(counters.selection_upserts as f64)),
            ("mismatches", v_num(mismatches as f64)),
        ]),
    );
    println!("{}", reference.snapshot());

    if mismatches > 0 {
        bail!("{} of {} clients did not converge", mismatches, clients);
    }
    Ok(())
}
