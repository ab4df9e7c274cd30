//! Confirm / auto-advance state machine.
//!
//! The machine holds no state of its own: the phase is derived from the
//! registry, the slot table and the shared selection, and [`reconcile`]
//! decides what the selection should become after any change. Every client
//! runs it after every observed change, local or remote, so a confirmation
//! made on another device advances this one too.

use std::str::FromStr;

use crate::error::{SyncError, SyncResult};
use crate::model::{Competitor, SelectionState};
use crate::registry::Registry;
use crate::slots::SlotTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Nobody is being offered a slot.
    Idle,
    /// A competitor is bound to the cursor awaiting confirmation.
    Offering { number: u32, cursor: usize },
    /// Every competitor is placed, or no vacancy remains.
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Offering { .. } => "offering",
            Phase::Done => "done",
        }
    }
}

/// Which un-placed competitor is offered next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PickPolicy {
    /// Highest ranked remaining competitor.
    #[default]
    TopRanked,
    /// Lowest ranked remaining competitor (end of the remaining list).
    LastRemaining,
}

impl FromStr for PickPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "top" | "top_ranked" | "first" => Ok(PickPolicy::TopRanked),
            "last" | "last_remaining" => Ok(PickPolicy::LastRemaining),
            other => Err(format!("unknown pick policy '{}'", other)),
        }
    }
}

/// Where the cursor lands whenever a new competitor is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorHome {
    /// Always position 1.
    #[default]
    First,
    /// The lowest empty position (position 1 if none).
    FirstVacant,
}

impl FromStr for CursorHome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "1" => Ok(CursorHome::First),
            "vacant" | "first_vacant" => Ok(CursorHome::FirstVacant),
            other => Err(format!("unknown cursor home '{}'", other)),
        }
    }
}

/// What the shared selection should become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Keep,
    Offer(SelectionState),
    Clear,
}

pub fn next_eligible<'a>(
    registry: &'a Registry,
    slots: &SlotTable,
    policy: PickPolicy,
) -> Option<&'a Competitor> {
    if slots.is_full() {
        return None;
    }
    let mut unplaced = registry.ranked().iter().filter(|c| !slots.is_placed(c.number));
    match policy {
        PickPolicy::TopRanked => unplaced.next(),
        PickPolicy::LastRemaining => unplaced.last(),
    }
}

pub fn home_cursor(slots: &SlotTable, home: CursorHome) -> usize {
    match home {
        CursorHome::First => 1,
        CursorHome::FirstVacant => slots.first_vacant().unwrap_or(1),
    }
}

fn is_offerable(registry: &Registry, slots: &SlotTable, number: u32) -> bool {
    registry.contains(number) && !slots.is_placed(number) && !slots.is_full()
}

pub fn phase(registry: &Registry, slots: &SlotTable, selection: &SelectionState) -> Phase {
    if registry.is_empty() {
        return Phase::Idle;
    }
    if let Some(number) = selection.selecting_number() {
        if is_offerable(registry, slots, number) {
            return Phase::Offering {
                number,
                cursor: selection.cursor,
            };
        }
    }
    if next_eligible(registry, slots, PickPolicy::TopRanked).is_none() {
        Phase::Done
    } else {
        Phase::Idle
    }
}

/// Re-derives the selection after any change to the slots, the registry or
/// the selection itself.
pub fn reconcile(
    registry: &Registry,
    slots: &SlotTable,
    selection: &SelectionState,
    policy: PickPolicy,
    home: CursorHome,
) -> Directive {
    if registry.is_empty() {
        return match selection.selecting {
            Some(_) => Directive::Clear,
            None => Directive::Keep,
        };
    }

    let needs_replacement = match selection.selecting_number() {
        None => true,
        Some(number) => !is_offerable(registry, slots, number),
    };
    if !needs_replacement {
        return Directive::Keep;
    }

    match next_eligible(registry, slots, policy) {
        Some(next) => Directive::Offer(SelectionState::offering(next.clone(), home_cursor(slots, home))),
        None if selection.selecting.is_some() => Directive::Clear,
        None => Directive::Keep,
    }
}

/// Preconditions for confirming the offered competitor at the cursor.
/// Returns the target position and the competitor to place.
pub fn check_confirm(slots: &SlotTable, selection: &SelectionState) -> SyncResult<(usize, Competitor)> {
    let competitor = selection.selecting.clone().ok_or(SyncError::UnknownCompetitor)?;
    let position = selection.cursor;
    let target = slots.slot(position)?;
    if let Some(occupant) = &target.competitor {
        return Err(SyncError::AlreadyOccupied {
            position,
            occupant: occupant.number,
        });
    }
    if let Some(held) = slots.occupant_of(competitor.number) {
        return Err(SyncError::CompetitorAlreadyPlaced {
            number: competitor.number,
            position: held,
        });
    }
    Ok((position, competitor))
}
