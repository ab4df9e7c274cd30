//! "Where would this land" preview for a competitor dropped onto a slot.
//!
//! Occupants are shifted one step toward the target to open it up, using the
//! nearest vacancy after the target first and the nearest one before it
//! second. The result is a what-if table only: commits never write a
//! multi-slot shift, they place into an already empty slot.

use crate::error::SyncResult;
use crate::model::Competitor;
use crate::slots::SlotTable;

/// Returns the table that results from placing `competitor` at `target`
/// without discarding any occupant. A full table is returned unchanged.
pub fn insert_with_cascade(
    table: &SlotTable,
    competitor: &Competitor,
    target: usize,
) -> SyncResult<SlotTable> {
    table.check_position(target)?;
    let mut out = table.clone();
    let idx = target - 1;

    if table.get()[idx].is_empty() {
        out.slots_mut()[idx].competitor = Some(competitor.clone());
        return Ok(out);
    }

    let slots = table.get();
    let forward = (idx + 1..slots.len()).find(|&i| slots[i].is_empty());
    let backward = || (0..idx).rev().find(|&i| slots[i].is_empty());

    let cells = out.slots_mut();
    match forward {
        Some(free) => {
            for i in (idx + 1..=free).rev() {
                cells[i].competitor = cells[i - 1].competitor.take();
            }
        }
        None => match backward() {
            Some(free) => {
                for i in free..idx {
                    cells[i].competitor = cells[i + 1].competitor.take();
                }
            }
            None => return Ok(out),
        },
    }
    cells[idx].competitor = Some(competitor.clone());
    Ok(out)
}
