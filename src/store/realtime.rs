//! Row-level change feed over the store's realtime websocket.
//!
//! One socket per subscription: join a channel filtered to a single table
//! (and row set), keep it alive with heartbeats, and forward every
//! `postgres_changes` payload as a [`ChangeEvent`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{StoreError, StoreResult};
use crate::logging::{log_feed_status, Level};
use crate::store::{ChangeEvent, ChangeFeed, ChangeKind, FeedScope, Topic};

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub heartbeat: Duration,
    pub capacity: usize,
}

/// Derives the websocket endpoint from the store's HTTP base URL.
pub fn realtime_url(base: &str, key: &str) -> StoreResult<Url> {
    let mut url = Url::parse(base).map_err(|e| StoreError::Transport(format!("bad store url: {}", e)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(StoreError::Transport(format!("unsupported scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| StoreError::Transport("cannot switch to websocket scheme".to_string()))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

pub fn channel_name(topic: Topic) -> String {
    format!("realtime:startgrid-{}", topic.table())
}

fn row_filter(topic: Topic, scope: &FeedScope) -> Option<String> {
    match topic {
        Topic::Roster => None,
        Topic::Slots => Some(format!("session_id=eq.{}", scope.session_id)),
        Topic::Selection => Some(format!("id=eq.{}", scope.selection_row_id)),
    }
}

pub fn join_message(topic: Topic, scope: &FeedScope, join_ref: u64) -> String {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": topic.table(),
    });
    if let Some(filter) = row_filter(topic, scope) {
        change["filter"] = Value::String(filter);
    }
    json!({
        "topic": channel_name(topic),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": [change],
            }
        },
        "ref": join_ref.to_string(),
        "join_ref": join_ref.to_string(),
    })
    .to_string()
}

pub fn heartbeat_message(seq: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": seq.to_string(),
    })
    .to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Change(ChangeEvent),
    Joined,
    Rejected(String),
    Ignored,
}

fn non_null(v: Option<&Value>) -> Option<Value> {
    match v {
        Some(Value::Null) | None => None,
        Some(other) => {
            if other.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                None
            } else {
                Some(other.clone())
            }
        }
    }
}

/// Decodes one frame for the channel of `topic`. Frames for other channels
/// or other tables are ignored.
pub fn decode_inbound(text: &str, topic: Topic) -> Inbound {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Inbound::Ignored,
    };
    if msg.get("topic").and_then(Value::as_str) != Some(channel_name(topic).as_str()) {
        return Inbound::Ignored;
    }
    let event = msg.get("event").and_then(Value::as_str).unwrap_or_default();
    let payload = msg.get("payload").cloned().unwrap_or(Value::Null);

    if event == "phx_reply" {
        let status = payload.get("status").and_then(Value::as_str).unwrap_or_default();
        return if status == "ok" {
            Inbound::Joined
        } else {
            Inbound::Rejected(payload.get("response").map(|r| r.to_string()).unwrap_or_default())
        };
    }
    if event == "phx_error" || event == "phx_close" {
        return Inbound::Rejected(event.to_string());
    }

    let data = if event == "postgres_changes" {
        payload.get("data").cloned().unwrap_or(Value::Null)
    } else {
        payload
    };
    let kind = data
        .get("type")
        .and_then(Value::as_str)
        .or(Some(event))
        .and_then(ChangeKind::parse);
    let table_ok = data
        .get("table")
        .and_then(Value::as_str)
        .map(|t| t == topic.table())
        .unwrap_or(true);
    match kind {
        Some(kind) if table_ok => Inbound::Change(ChangeEvent {
            topic,
            kind,
            new: non_null(data.get("record")),
            old: non_null(data.get("old_record")),
        }),
        _ => Inbound::Ignored,
    }
}

/// Connects, joins the channel for `topic`, and spawns the reader task.
pub async fn open_feed(url: Url, topic: Topic, scope: &FeedScope, opts: RealtimeOptions) -> StoreResult<ChangeFeed> {
    let (ws, _) = tokio_tungstenite::connect_async(url.to_string()).await?;
    let (mut write, mut read) = ws.split();
    write.send(Message::Text(join_message(topic, scope, 1))).await?;

    let (tx, rx) = mpsc::channel(opts.capacity.max(1));
    let heartbeat = opts.heartbeat.max(Duration::from_secs(1));
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        let mut seq: u64 = 1;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    seq += 1;
                    if write.send(Message::Text(heartbeat_message(seq))).await.is_err() {
                        log_feed_status(Level::Warn, topic, "heartbeat_failed", "");
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match decode_inbound(&text, topic) {
                        Inbound::Change(ev) => {
                            if tx.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Inbound::Joined => log_feed_status(Level::Info, topic, "joined", ""),
                        Inbound::Rejected(reason) => {
                            log_feed_status(Level::Error, topic, "rejected", &reason);
                            break;
                        }
                        Inbound::Ignored => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        log_feed_status(Level::Warn, topic, "socket_closed", "");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log_feed_status(Level::Error, topic, "socket_error", &err.to_string());
                        break;
                    }
                }
            }
        }
    });

    let abort = task.abort_handle();
    Ok(ChangeFeed::new(topic, rx, move || abort.abort()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> FeedScope {
        FeedScope {
            session_id: "default".to_string(),
            selection_row_id: 1,
        }
    }

    #[test]
    fn test_realtime_url_from_https() {
        let url = realtime_url("https://abc.example.co", "k3y").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/realtime/v1/websocket");
        assert!(url.query().unwrap_or_default().contains("apikey=k3y"));
    }

    #[test]
    fn test_realtime_url_rejects_other_schemes() {
        assert!(realtime_url("ftp://abc.example.co", "k").is_err());
    }

    #[test]
    fn test_join_filters_by_scope() {
        let slots: Value = serde_json::from_str(&join_message(Topic::Slots, &scope(), 1)).unwrap();
        let change = &slots["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "start_position");
        assert_eq!(change["filter"], "session_id=eq.default");

        let roster: Value = serde_json::from_str(&join_message(Topic::Roster, &scope(), 1)).unwrap();
        assert!(roster["payload"]["config"]["postgres_changes"][0].get("filter").is_none());
    }

    #[test]
    fn test_decode_postgres_changes_insert() {
        let frame = json!({
            "topic": "realtime:startgrid-start_position",
            "event": "postgres_changes",
            "payload": {"data": {
                "type": "INSERT",
                "table": "start_position",
                "record": {"position": 2, "team_number": 7, "session_id": "default"},
                "old_record": {}
            }},
            "ref": null
        })
        .to_string();
        match decode_inbound(&frame, Topic::Slots) {
            Inbound::Change(ev) => {
                assert_eq!(ev.kind, ChangeKind::Insert);
                assert_eq!(ev.new.unwrap()["team_number"], 7);
                assert!(ev.old.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_ignores_other_channels() {
        let frame = json!({
            "topic": "realtime:startgrid-teams",
            "event": "postgres_changes",
            "payload": {"data": {"type": "DELETE", "table": "teams"}}
        })
        .to_string();
        assert_eq!(decode_inbound(&frame, Topic::Slots), Inbound::Ignored);
        assert_eq!(decode_inbound("not json", Topic::Slots), Inbound::Ignored);
    }

    #[test]
    fn test_decode_join_replies() {
        let ok = json!({"topic": "realtime:startgrid-current_selection", "event": "phx_reply",
                        "payload": {"status": "ok", "response": {}}})
        .to_string();
        assert_eq!(decode_inbound(&ok, Topic::Selection), Inbound::Joined);
        let err = json!({"topic": "realtime:startgrid-current_selection", "event": "phx_reply",
                         "payload": {"status": "error", "response": {"reason": "denied"}}})
        .to_string();
        assert!(matches!(decode_inbound(&err, Topic::Selection), Inbound::Rejected(_)));
    }
}
