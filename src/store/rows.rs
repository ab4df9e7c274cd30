//! Store-shaped rows and their validated conversion into engine types.
//!
//! Every field that arrives from the store is optional here; the decode
//! functions decide what is mandatory and reject the rest with
//! [`SyncError::InvalidRow`].

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Timelike, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::model::{Competitor, ElapsedTime, SelectionState};
use crate::registry::Registry;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetitorRow {
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub car_brand: Option<String>,
    #[serde(default)]
    pub pilot_name: Option<String>,
    #[serde(default)]
    pub pilot_country: Option<String>,
    #[serde(default)]
    pub navigator_name: Option<String>,
    #[serde(default)]
    pub navigator_country: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

impl CompetitorRow {
    pub fn from_competitor(c: &Competitor) -> Self {
        Self {
            number: Some(c.number as i64),
            car_brand: Some(c.vehicle.clone()),
            pilot_name: Some(c.name.clone()),
            pilot_country: Some(c.country.clone()),
            navigator_name: Some(c.navigator.clone()),
            navigator_country: Some(c.navigator_country.clone()),
            time: Some(c.elapsed.to_string()),
        }
    }
}

impl TryFrom<&CompetitorRow> for Competitor {
    type Error = SyncError;

    fn try_from(row: &CompetitorRow) -> SyncResult<Self> {
        let number = row
            .number
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| SyncError::invalid_row("teams", "missing or negative number"))?;
        let raw_time = row
            .time
            .as_deref()
            .ok_or_else(|| SyncError::invalid_row("teams", format!("#{} has no time", number)))?;
        let elapsed: ElapsedTime = raw_time
            .parse()
            .map_err(|e| SyncError::invalid_row("teams", format!("#{}: {}", number, e)))?;
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        Ok(Competitor {
            number,
            name: text(&row.pilot_name),
            country: text(&row.pilot_country),
            vehicle: text(&row.car_brand),
            navigator: text(&row.navigator_name),
            navigator_country: text(&row.navigator_country),
            elapsed,
        })
    }
}

/// A slot row as read back, optionally joined with its competitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotRow {
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub team_number: Option<i64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<CompetitorRow>,
}

/// Body of a slot insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSlotRow {
    pub position: i64,
    pub team_number: i64,
    pub session_id: String,
}

impl NewSlotRow {
    pub fn new(position: usize, number: u32, session_id: &str) -> Self {
        Self {
            position: position as i64,
            team_number: number as i64,
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionRow {
    pub id: i64,
    #[serde(default)]
    pub selecting_competitor_id: Option<i64>,
    #[serde(default)]
    pub current_position: Option<i64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl SelectionRow {
    pub fn encode(state: &SelectionState, row_id: i64, session_id: &str) -> Self {
        Self {
            id: row_id,
            selecting_competitor_id: state.selecting_number().map(|n| n as i64),
            current_position: Some(state.cursor as i64),
            session_id: Some(session_id.to_string()),
            updated_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }

    pub fn neutral(row_id: i64, session_id: &str) -> Self {
        Self::encode(&SelectionState::cleared(), row_id, session_id)
    }

    /// Write time, at the microsecond precision the store keeps. Accepts
    /// values with or without a UTC offset.
    pub fn stamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.updated_at.as_deref()?.trim();
        let parsed = DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc()))
            .ok()?;
        parsed.with_nanosecond(parsed.nanosecond() / 1_000 * 1_000)
    }
}

pub fn from_value<T: DeserializeOwned>(table: &'static str, value: Value) -> SyncResult<T> {
    serde_json::from_value(value).map_err(|e| SyncError::invalid_row(table, e.to_string()))
}

fn position_in_range(table: &'static str, raw: Option<i64>, slot_count: usize) -> SyncResult<usize> {
    let raw = raw.ok_or_else(|| SyncError::invalid_row(table, "missing position"))?;
    usize::try_from(raw)
        .ok()
        .filter(|p| (1..=slot_count).contains(p))
        .ok_or(SyncError::OutOfRange {
            position: raw.max(0) as usize,
            slots: slot_count,
        })
}

/// Resolves a slot row into `(position, competitor)`. The registry copy of
/// the competitor wins over the joined one; a competitor known to neither is
/// [`SyncError::UnknownCompetitor`].
pub fn decode_slot(row: &SlotRow, registry: &Registry, slot_count: usize) -> SyncResult<(usize, Competitor)> {
    let position = position_in_range("start_position", row.position, slot_count)?;
    let number = row
        .team_number
        .or_else(|| row.teams.as_ref().and_then(|t| t.number))
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| SyncError::invalid_row("start_position", "missing team_number"))?;
    if let Some(known) = registry.get(number) {
        return Ok((position, known.clone()));
    }
    match &row.teams {
        Some(joined) => Ok((position, Competitor::try_from(joined)?)),
        None => Err(SyncError::UnknownCompetitor),
    }
}

/// Position carried by a deleted slot row, if the store sent one.
pub fn deleted_position(old: &Value, slot_count: usize) -> Option<usize> {
    old.get("position")
        .and_then(Value::as_i64)
        .and_then(|p| usize::try_from(p).ok())
        .filter(|p| (1..=slot_count).contains(p))
}

/// Positions named by rows a delete returned, ascending and deduplicated.
pub fn removed_positions(rows: &[SlotRow]) -> Vec<usize> {
    let mut positions: Vec<usize> = rows
        .iter()
        .filter_map(|r| r.position)
        .filter_map(|p| usize::try_from(p).ok())
        .filter(|p| *p > 0)
        .collect();
    positions.sort_unstable();
    positions.dedup();
    positions
}

/// Competitor named by a selection row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectingRef {
    Nobody,
    Known(Competitor),
    /// A number this client's registry does not (yet) know.
    Unknown(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSelection {
    pub selecting: SelectingRef,
    pub cursor: usize,
}

pub fn decode_selection(row: &SelectionRow, registry: &Registry, slot_count: usize) -> SyncResult<DecodedSelection> {
    let cursor = match row.current_position {
        None => 1,
        Some(_) => position_in_range("current_selection", row.current_position, slot_count)?,
    };
    let selecting = match row.selecting_competitor_id {
        None => SelectingRef::Nobody,
        Some(raw) => {
            let number = u32::try_from(raw)
                .map_err(|_| SyncError::invalid_row("current_selection", "negative competitor id"))?;
            match registry.get(number) {
                Some(c) => SelectingRef::Known(c.clone()),
                None => SelectingRef::Unknown(number),
            }
        }
    };
    Ok(DecodedSelection { selecting, cursor })
}
