//! Strongly typed entities of the assignment core.
//!
//! Nothing store-shaped lives here: rows coming off the wire are converted
//! into these types in [`crate::store::rows`] before the engine sees them.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of starting slots in a session.
pub const SLOT_COUNT: usize = 10;

/// Elapsed qualifying time, stored as total centiseconds.
///
/// Accepts `m:s:cc` (minute, second, centisecond), `m:s` with optional
/// fractional seconds, or bare seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElapsedTime(u64);

impl ElapsedTime {
    pub fn from_centis(centis: u64) -> Self {
        Self(centis)
    }

    pub fn centis(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(pub String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable elapsed time '{}'", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

fn seconds_to_centis(raw: &str) -> Option<u64> {
    let secs: f64 = raw.trim().parse().ok()?;
    let centis = (secs * 100.0).round();
    if !centis.is_finite() || centis < 0.0 || centis >= u64::MAX as f64 {
        return None;
    }
    Some(centis as u64)
}

fn minutes_plus(minutes: u64, centis: u64) -> Option<u64> {
    minutes.checked_mul(6000)?.checked_add(centis)
}

impl FromStr for ElapsedTime {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        let whole = |p: &str| p.trim().parse::<u64>().ok();
        let centis = match parts.as_slice() {
            [m, sec, cs] => {
                let cs = whole(cs).filter(|v| *v < 100).ok_or_else(err)?;
                let sec = whole(sec).filter(|v| *v < 60).ok_or_else(err)?;
                minutes_plus(whole(m).ok_or_else(err)?, sec * 100 + cs).ok_or_else(err)?
            }
            [m, sec] => {
                let centis = seconds_to_centis(sec).ok_or_else(err)?;
                minutes_plus(whole(m).ok_or_else(err)?, centis).ok_or_else(err)?
            }
            [sec] => seconds_to_centis(sec).ok_or_else(err)?,
            _ => return Err(err()),
        };
        Ok(Self(centis))
    }
}

impl fmt::Display for ElapsedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minutes = self.0 / 6000;
        let seconds = (self.0 % 6000) / 100;
        let centis = self.0 % 100;
        write!(f, "{:02}:{:02}:{:02}", minutes, seconds, centis)
    }
}

/// A crew in the roster, identified by its race number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competitor {
    pub number: u32,
    pub name: String,
    pub country: String,
    pub vehicle: String,
    pub navigator: String,
    pub navigator_country: String,
    pub elapsed: ElapsedTime,
}

impl Competitor {
    /// Ranking order: fastest first, ties broken by race number.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        self.elapsed
            .cmp(&other.elapsed)
            .then(self.number.cmp(&other.number))
    }

    /// Identity comparison. Display attributes may be edited in the roster
    /// without changing who the competitor is.
    pub fn same_as(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl fmt::Display for Competitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.number, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub position: usize,
    pub competitor: Option<Competitor>,
}

impl Slot {
    pub fn empty(position: usize) -> Self {
        Self {
            position,
            competitor: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.competitor.is_none()
    }

    pub fn holds(&self, number: u32) -> bool {
        self.competitor.as_ref().map(|c| c.number) == Some(number)
    }
}

/// The shared "who is choosing, and where is the cursor" record.
///
/// When `selecting` is `None` the cursor carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
    pub selecting: Option<Competitor>,
    pub cursor: usize,
}

impl SelectionState {
    pub fn cleared() -> Self {
        Self {
            selecting: None,
            cursor: 1,
        }
    }

    pub fn offering(competitor: Competitor, cursor: usize) -> Self {
        Self {
            selecting: Some(competitor),
            cursor,
        }
    }

    pub fn selecting_number(&self) -> Option<u32> {
        self.selecting.as_ref().map(|c| c.number)
    }

    /// Equality as seen by the replication guard: identity of the selecting
    /// competitor plus the cursor.
    pub fn same_as(&self, other: &Self) -> bool {
        self.selecting_number() == other.selecting_number() && self.cursor == other.cursor
    }
}

impl Default for SelectionState {
    fn default() -> Self {
        Self::cleared()
    }
}

#[cfg(test)]
pub(crate) fn competitor(number: u32, time: &str) -> Competitor {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minute_second_centis() {
        let t: ElapsedTime = "03:25:07".parse().unwrap();
        assert_eq!(t.centis(), 3 * 6000 + 25 * 100 + 7);
        assert_eq!(t.to_string(), "03:25:07");
    }

    #[test]
    fn test_parse_short_forms() {
        assert_eq!("1:02.5".parse::<ElapsedTime>().unwrap().centis(), 6250);
        assert_eq!("45".parse::<ElapsedTime>().unwrap().centis(), 4500);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ElapsedTime>().is_err());
        assert!("1:2:3:4".parse::<ElapsedTime>().is_err());
        assert!("1:75:00".parse::<ElapsedTime>().is_err());
        assert!("abc".parse::<ElapsedTime>().is_err());
        assert!("9999999999999999:00:00".parse::<ElapsedTime>().is_err());
        assert!("9999999999999999:1e300".parse::<ElapsedTime>().is_err());
        assert!("1e300".parse::<ElapsedTime>().is_err());
    }

    #[test]
    fn test_rank_orders_by_time_then_number() {
        let fast = competitor(9, "01:00:00");
        let slow = competitor(1, "01:00:50");
        let tie = competitor(3, "01:00:00");
        assert_eq!(fast.rank_cmp(&slow), Ordering::Less);
        assert_eq!(tie.rank_cmp(&fast), Ordering::Less);
    }

    #[test]
    fn test_selection_identity_ignores_display_edits() {
        let a = SelectionState::offering(competitor(4, "02:00:00"), 2);
        let mut renamed = competitor(4, "02:00:00");
        renamed.name = "Renamed".to_string();
        let b = SelectionState::offering(renamed, 2);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&SelectionState::offering(competitor(4, "02:00:00"), 3)));
    }
}
