//! Structured JSON-lines logging for the assignment engine.
//!
//! Every record is one JSON object on stderr with a run id, a monotonic
//! sequence number, level, component and event name. Setting `LOG_DIR`
//! additionally appends records to `<LOG_DIR>/<run_id>/events.jsonl`
//! (trace and debug go to `trace.jsonl`), so several clients of one session
//! can be merged and replayed in order.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::store::Topic;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Sync,      // Session lifecycle, resyncs
    Slots,     // Slot table mutations
    Selection, // Selecting competitor / cursor
    Advance,   // Auto-advance transitions
    Store,     // Remote calls and their failures
    Feed,      // Realtime subscriptions
    Health,    // Reachability checks
    System,    // Startup, shutdown
    Profile,   // Remote call timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Sync => "sync",
            Domain::Slots => "slots",
            Domain::Selection => "selection",
            Domain::Advance => "advance",
            Domain::Store => "store",
            Domain::Feed => "feed",
            Domain::Health => "health",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

struct FileSinks {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

struct RunContext {
    run_id: String,
    files: Option<FileSinks>,
}

fn open_sinks(run_id: &str) -> Option<FileSinks> {
    let base = std::env::var("LOG_DIR").ok()?;
    let mut run_dir = PathBuf::from(base);
    run_dir.push(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }
    let _ = std::fs::write(
        run_dir.join("manifest.json"),
        json!({
            "run_id": run_id,
            "ts": ts_now(),
            "pid": process::id(),
        })
        .to_string(),
    );
    let open = |name: &str| match File::create(run_dir.join(name)) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", name, err);
            None
        }
    };
    Some(FileSinks {
        events: open("events.jsonl")?,
        trace: open("trace.jsonl")?,
    })
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let files = open_sinks(&run_id);
        RunContext { run_id, files }
    })
}

pub fn run_id() -> &'static str {
    &ensure_run_context().run_id
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["apikey", "authorization", "Authorization", "store_key"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["session_id", "client", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn build_record(run_id: &str, level: Level, component: &str, event: &str, fields: Map<String, Value>) -> Value {
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(run_id));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry)
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let line = build_record(&ctx.run_id, level, component, event, fields).to_string();
    if let Some(files) = &ctx.files {
        match level {
            Level::Trace | Level::Debug => write_line(&files.trace, &line),
            _ => write_line(&files.events, &line),
        }
    }
    eprintln!("{}", line);
}

// =============================================================================
// Engine logs
// =============================================================================

/// A remote call failed; local state was left as it was.
pub fn log_remote_failure(session_id: &str, operation: &str, error: &str) {
    agg_increment("remote_failure");
    log(
        Level::Warn,
        Domain::Store,
        "remote_failure",
        obj(&[
            ("session_id", v_str(session_id)),
            ("operation", v_str(operation)),
            ("error", v_str(error)),
        ]),
    );
}

/// Auto-advance phase change.
pub fn log_transition(session_id: &str, from: &str, to: &str, trigger: &str, selecting: Option<u32>) {
    log(
        Level::Info,
        Domain::Advance,
        "transition",
        obj(&[
            ("session_id", v_str(session_id)),
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("trigger", v_str(trigger)),
            ("selecting", selecting.map(|n| json!(n)).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_slot_change(session_id: &str, origin: &str, position: usize, number: Option<u32>) {
    log(
        Level::Info,
        Domain::Slots,
        "slot_change",
        obj(&[
            ("session_id", v_str(session_id)),
            ("origin", v_str(origin)),
            ("position", json!(position)),
            ("competitor", number.map(|n| json!(n)).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_selection_change(session_id: &str, origin: &str, selecting: Option<u32>, cursor: usize) {
    log(
        Level::Debug,
        Domain::Selection,
        "selection_change",
        obj(&[
            ("session_id", v_str(session_id)),
            ("origin", v_str(origin)),
            ("selecting", selecting.map(|n| json!(n)).unwrap_or(Value::Null)),
            ("cursor", json!(cursor)),
        ]),
    );
}

pub fn log_feed_status(level: Level, topic: Topic, status: &str, detail: &str) {
    log(
        level,
        Domain::Feed,
        "feed_status",
        obj(&[
            ("table", v_str(topic.table())),
            ("status", v_str(status)),
            ("detail", v_str(detail)),
        ]),
    );
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits the elapsed time of a remote call on drop.
pub struct ProfileScope {
    label: &'static str,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            started: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        log(
            Level::Trace,
            Domain::Profile,
            "remote_call",
            obj(&[("label", v_str(self.label)), ("elapsed_ms", v_num(elapsed_ms))]),
        );
    }
}

// =============================================================================
// Aggregated counters
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

struct LogAggregator {
    remote_writes: u64,
    skipped_writes: u64,
    remote_failures: u64,
    conflicts: u64,
    remote_events: u64,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            remote_writes: 0,
            skipped_writes: 0,
            remote_failures: 0,
            conflicts: 0,
            remote_events: 0,
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, event: &str) {
        match event {
            "remote_write" => self.remote_writes += 1,
            "skipped_write" => self.skipped_writes += 1,
            "remote_failure" => self.remote_failures += 1,
            "conflict" => self.conflicts += 1,
            "remote_event" => self.remote_events += 1,
            _ => {}
        }
    }

    fn maybe_flush(&mut self) -> Option<Value> {
        if self.last_flush.elapsed().as_secs() < self.flush_interval_secs {
            return None;
        }
        let snapshot = json!({
            "remote_writes": self.remote_writes,
            "skipped_writes": self.skipped_writes,
            "remote_failures": self.remote_failures,
            "conflicts": self.conflicts,
            "remote_events": self.remote_events,
        });
        *self = Self {
            last_flush: Instant::now(),
            ..Self::new()
        };
        Some(snapshot)
    }
}

/// Call periodically to emit aggregated counters.
pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some(Value::Object(stats)) = agg.maybe_flush() {
            log(Level::Info, Domain::System, "aggregated_stats", stats);
        }
    }
}

pub fn agg_increment(event: &str) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }

    #[test]
    fn test_record_redacts_and_lifts_fields() {
        let record = build_record(
            "r-test",
            Level::Warn,
            "store",
            "remote_failure",
            obj(&[
                ("session_id", v_str("default")),
                ("apikey", v_str("secret")),
                ("operation", v_str("insert_slot")),
            ]),
        );
        assert_eq!(record["session_id"], "default");
        assert_eq!(record["lvl"], "WARN");
        assert_eq!(record["data"]["apikey"], "[REDACTED]");
        assert_eq!(record["data"]["operation"], "insert_slot");
        assert!(record["data"].get("session_id").is_none());
    }

    #[test]
    fn test_aggregator_counts_known_events() {
        let mut agg = LogAggregator::new();
        agg.increment("conflict");
        agg.increment("conflict");
        agg.increment("unknown");
        assert_eq!(agg.conflicts, 2);
        agg.flush_interval_secs = 0;
        let snap = agg.maybe_flush().unwrap();
        assert_eq!(snap["conflicts"], 2);
        assert_eq!(agg.conflicts, 0);
    }
}
