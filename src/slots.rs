//! Local replica of the starting grid.

use std::collections::HashSet;

use crate::error::{SyncError, SyncResult};
use crate::model::{Competitor, Slot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub msg: String,
}

/// Ordered sequence of exactly `len` slots, positions `1..=len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (1..=len).map(Slot::empty).collect(),
        }
    }

    /// Builds a table from `(position, competitor)` pairs as read from the
    /// store. Out-of-range positions are rejected; a competitor listed twice
    /// keeps only its lowest position.
    pub fn from_occupants(len: usize, occupants: Vec<(usize, Competitor)>) -> SyncResult<Self> {
        let mut table = Self::new(len);
        let mut sorted = occupants;
        sorted.sort_by_key(|(p, _)| *p);
        for (position, competitor) in sorted {
            table.check_position(position)?;
            if table.occupant_of(competitor.number).is_some() {
                continue;
            }
            table.slots[position - 1].competitor = Some(competitor);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Every slot, ordered by position ascending.
    pub fn get(&self) -> &[Slot] {
        &self.slots
    }

    pub fn check_position(&self, position: usize) -> SyncResult<()> {
        if position == 0 || position > self.slots.len() {
            return Err(SyncError::OutOfRange {
                position,
                slots: self.slots.len(),
            });
        }
        Ok(())
    }

    pub fn slot(&self, position: usize) -> SyncResult<&Slot> {
        self.check_position(position)?;
        Ok(&self.slots[position - 1])
    }

    pub fn occupant(&self, position: usize) -> Option<&Competitor> {
        self.slot(position).ok().and_then(|s| s.competitor.as_ref())
    }

    pub fn occupant_of(&self, number: u32) -> Option<usize> {
        self.slots.iter().find(|s| s.holds(number)).map(|s| s.position)
    }

    pub fn is_placed(&self, number: u32) -> bool {
        self.occupant_of(number).is_some()
    }

    pub fn available_positions(&self) -> Vec<usize> {
        self.slots.iter().filter(|s| s.is_empty()).map(|s| s.position).collect()
    }

    pub fn first_vacant(&self) -> Option<usize> {
        self.slots.iter().find(|s| s.is_empty()).map(|s| s.position)
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| !s.is_empty())
    }

    /// Places a competitor into an empty slot.
    pub fn occupy(&mut self, position: usize, competitor: Competitor) -> SyncResult<()> {
        self.check_position(position)?;
        if let Some(current) = &self.slots[position - 1].competitor {
            return Err(SyncError::AlreadyOccupied {
                position,
                occupant: current.number,
            });
        }
        if let Some(held) = self.occupant_of(competitor.number) {
            return Err(SyncError::CompetitorAlreadyPlaced {
                number: competitor.number,
                position: held,
            });
        }
        self.slots[position - 1].competitor = Some(competitor);
        Ok(())
    }

    pub fn vacate(&mut self, position: usize) -> SyncResult<Option<Competitor>> {
        self.check_position(position)?;
        Ok(self.slots[position - 1].competitor.take())
    }

    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.competitor = None;
        }
    }

    /// Applies an authoritative occupancy from the store. The store wins over
    /// any optimistic local placement, and the competitor is removed from any
    /// other slot it was cached in. Returns whether anything changed.
    pub fn merge_occupant(&mut self, position: usize, competitor: Competitor) -> SyncResult<bool> {
        self.check_position(position)?;
        if self.slots[position - 1].holds(competitor.number) {
            return Ok(false);
        }
        for slot in self.slots.iter_mut() {
            if slot.holds(competitor.number) {
                slot.competitor = None;
            }
        }
        self.slots[position - 1].competitor = Some(competitor);
        Ok(true)
    }

    /// Applies an authoritative removal. Returns whether anything changed.
    pub fn merge_vacancy(&mut self, position: usize) -> SyncResult<bool> {
        Ok(self.vacate(position)?.is_some())
    }

    /// Structural invariants: positions `1..=len` in order, each competitor
    /// in at most one slot.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut seen = HashSet::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.position != idx + 1 {
                return Err(InvariantViolation {
                    msg: format!("slot at index {} has position {}", idx, slot.position),
                });
            }
            if let Some(c) = &slot.competitor {
                if !seen.insert(c.number) {
                    return Err(InvariantViolation {
                        msg: format!("competitor #{} occupies more than one slot", c.number),
                    });
                }
            }
        }
        Ok(())
    }

    /// Slots as written by the cascade preview; positions are preserved.
    pub(crate) fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }
}
