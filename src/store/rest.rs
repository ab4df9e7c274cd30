use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::error::{StoreError, StoreResult};
use crate::state::Config;
use crate::store::realtime::{self, RealtimeOptions};
use crate::store::rows::{removed_positions, CompetitorRow, NewSlotRow, SelectionRow, SlotRow};
use crate::store::{with_timeout, ChangeFeed, FeedScope, RemoteStore, Topic};

const SLOT_SELECT: &str =
    "position,team_number,session_id,teams(number,car_brand,pilot_name,pilot_country,navigator_name,navigator_country,time)";

/// PostgREST-style HTTP client for the three tables, with realtime
/// subscriptions over the store's websocket endpoint.
pub struct RestStore {
    client: Client,
    base: String,
    key: String,
    timeout: Duration,
    realtime: RealtimeOptions,
}

#[derive(Deserialize, Debug)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RestStore {
    pub fn new(cfg: &Config) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(cfg.remote_timeout)
            .build()
            .map_err(StoreError::from)?;
        Ok(Self {
            client,
            base: cfg.store_url.trim_end_matches('/').to_string(),
            key: cfg.store_key.clone(),
            timeout: cfg.remote_timeout,
            realtime: RealtimeOptions {
                heartbeat: cfg.heartbeat,
                capacity: cfg.feed_capacity,
            },
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base, table)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", self.key))
    }

    async fn send(&self, req: RequestBuilder) -> StoreResult<Response> {
        let resp = with_timeout(self.timeout, async {
            self.authed(req).send().await.map_err(StoreError::from)
        })
        .await?;
        check_status(resp).await
    }
}

async fn check_status(resp: Response) -> StoreResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

/// Maps a failed response onto a store error. A unique violation arrives as
/// HTTP 409 and/or Postgres code 23505.
fn classify_failure(status: StatusCode, body: &str) -> StoreError {
    let parsed: Option<PostgrestError> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|p| p.code.clone()).unwrap_or_default();
    if status == StatusCode::CONFLICT || code == "23505" {
        let detail = parsed
            .and_then(|p| p.message)
            .unwrap_or_else(|| "duplicate key".to_string());
        return StoreError::Conflict(detail);
    }
    StoreError::Status {
        status: status.as_u16(),
        body: body.to_string(),
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn fetch_competitors(&self) -> StoreResult<Vec<CompetitorRow>> {
        let req = self
            .client
            .get(self.table_url("teams"))
            .query(&[("select", "*"), ("order", "created_at.asc")]);
        let resp = self.send(req).await?;
        Ok(resp.json().await?)
    }

    async fn fetch_slots(&self, session_id: &str) -> StoreResult<Vec<SlotRow>> {
        let session = format!("eq.{}", session_id);
        let req = self.client.get(self.table_url("start_position")).query(&[
            ("select", SLOT_SELECT),
            ("session_id", session.as_str()),
            ("order", "position"),
        ]);
        let resp = self.send(req).await?;
        Ok(resp.json().await?)
    }

    async fn fetch_selection(&self, row_id: i64) -> StoreResult<Option<SelectionRow>> {
        let id = format!("eq.{}", row_id);
        let req = self
            .client
            .get(self.table_url("current_selection"))
            .query(&[("select", "*"), ("id", id.as_str())]);
        let resp = self.send(req).await?;
        let rows: Vec<SelectionRow> = resp.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_slot(&self, row: &NewSlotRow) -> StoreResult<()> {
        let req = self
            .client
            .post(self.table_url("start_position"))
            .header("Prefer", "return=minimal")
            .json(&[row]);
        self.send(req).await?;
        Ok(())
    }

    async fn delete_slot(&self, session_id: &str, position: usize) -> StoreResult<bool> {
        let session = format!("eq.{}", session_id);
        let pos = format!("eq.{}", position);
        let req = self
            .client
            .delete(self.table_url("start_position"))
            .header("Prefer", "return=representation")
            .query(&[
                ("select", "position,session_id"),
                ("position", pos.as_str()),
                ("session_id", session.as_str()),
            ]);
        let resp = self.send(req).await?;
        let removed: Vec<SlotRow> = resp.json().await?;
        Ok(!removed.is_empty())
    }

    async fn clear_slots(&self, session_id: &str) -> StoreResult<Vec<usize>> {
        let session = format!("eq.{}", session_id);
        let req = self
            .client
            .delete(self.table_url("start_position"))
            .header("Prefer", "return=representation")
            .query(&[("select", "position,session_id"), ("session_id", session.as_str())]);
        let resp = self.send(req).await?;
        let removed: Vec<SlotRow> = resp.json().await?;
        Ok(removed_positions(&removed))
    }

    async fn upsert_selection(&self, row: &SelectionRow) -> StoreResult<()> {
        let req = self
            .client
            .post(self.table_url("current_selection"))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row]);
        self.send(req).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, scope: &FeedScope) -> StoreResult<ChangeFeed> {
        let url = realtime::realtime_url(&self.base, &self.key)?;
        with_timeout(self.timeout, realtime::open_feed(url, topic, scope, self.realtime.clone())).await
    }

    async fn ping(&self) -> StoreResult<()> {
        let req = self
            .client
            .get(self.table_url("current_selection"))
            .query(&[("select", "id"), ("limit", "1")]);
        self.send(req).await?;
        Ok(())
    }
}
