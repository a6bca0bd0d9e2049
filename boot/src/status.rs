//! Swap progress tracking and trailer-driven boot decisions.
//!
//! Two ordered tables drive everything: one picks which trailer holds
//! the status of an interrupted swap, the other derives the swap a
//! completed set of trailers is asking for. Rows are matched top to
//! bottom; `None` in a cell matches any state.

use redoubt_flash::ERASED_BYTE;

use crate::trailer::{FlagState, MagicState, SwapState, STEPS_PER_CYCLE};

/// Which trailer, if any, records an in-flight swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    None,
    Primary,
    Scratch,
}

/// The swap the trailers call for on this boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapType {
    /// Keep the primary image.
    None,
    /// Swap in the secondary image, revert unless confirmed.
    Test,
    /// Swap in the secondary image and keep it.
    Perm,
    /// Swap the previous primary image back in.
    Revert,
    /// A requested swap was refused; boot the primary image.
    Fail,
}

// ---- status source ----

struct SourceRow {
    primary_magic: Option<MagicState>,
    scratch_magic: Option<MagicState>,
    primary_copy_done: Option<FlagState>,
    source: StatusSource,
}

const SOURCE_ROWS: &[SourceRow] = &[
    // Completed swap: the primary trailer is sealed, nothing to resume.
    SourceRow {
        primary_magic: Some(MagicState::Good),
        scratch_magic: None,
        primary_copy_done: Some(FlagState::Set),
        source: StatusSource::None,
    },
    // Swap under way with status written alongside the primary image.
    SourceRow {
        primary_magic: Some(MagicState::Good),
        scratch_magic: None,
        primary_copy_done: Some(FlagState::Unset),
        source: StatusSource::Primary,
    },
    // The cycle that rebuilds the primary trailer went through scratch.
    SourceRow {
        primary_magic: None,
        scratch_magic: Some(MagicState::Good),
        primary_copy_done: None,
        source: StatusSource::Scratch,
    },
    // Primary trailer erased mid-swap; any status is in the primary slot.
    SourceRow {
        primary_magic: Some(MagicState::Unset),
        scratch_magic: None,
        primary_copy_done: Some(FlagState::Unset),
        source: StatusSource::Primary,
    },
];

fn cell<T: PartialEq + Copy>(want: Option<T>, got: T) -> bool {
    match want {
        Some(w) => w == got,
        None => true,
    }
}

/// Picks the trailer that holds swap status, from the decoded trailer
/// states of the primary slot and the scratch area.
pub fn status_source(primary: &SwapState, scratch: &SwapState) -> StatusSource {
    for row in SOURCE_ROWS {
        if cell(row.primary_magic, primary.magic)
            && cell(row.scratch_magic, scratch.magic)
            && cell(row.primary_copy_done, primary.copy_done)
        {
            return row.source;
        }
    }
    StatusSource::None
}

// ---- swap request ----

struct RequestRow {
    secondary_magic: Option<MagicState>,
    secondary_image_ok: Option<FlagState>,
    primary_magic: Option<MagicState>,
    primary_image_ok: Option<FlagState>,
    primary_copy_done: Option<FlagState>,
    swap: SwapType,
}

const REQUEST_ROWS: &[RequestRow] = &[
    // A staged image without image_ok runs once and must confirm.
    RequestRow {
        secondary_magic: Some(MagicState::Good),
        secondary_image_ok: Some(FlagState::Unset),
        primary_magic: None,
        primary_image_ok: None,
        primary_copy_done: None,
        swap: SwapType::Test,
    },
    // A staged image with image_ok already set stays after the swap.
    RequestRow {
        secondary_magic: Some(MagicState::Good),
        secondary_image_ok: Some(FlagState::Set),
        primary_magic: None,
        primary_image_ok: None,
        primary_copy_done: None,
        swap: SwapType::Perm,
    },
    // A completed but never confirmed swap goes back.
    RequestRow {
        secondary_magic: Some(MagicState::Unset),
        secondary_image_ok: None,
        primary_magic: Some(MagicState::Good),
        primary_image_ok: Some(FlagState::Unset),
        primary_copy_done: Some(FlagState::Set),
        swap: SwapType::Revert,
    },
];

/// Derives the swap requested by the current trailer states.
pub fn requested_swap(primary: &SwapState, secondary: &SwapState) -> SwapType {
    for row in REQUEST_ROWS {
        if cell(row.secondary_magic, secondary.magic)
            && cell(row.secondary_image_ok, secondary.image_ok)
            && cell(row.primary_magic, primary.magic)
            && cell(row.primary_image_ok, primary.image_ok)
            && cell(row.primary_copy_done, primary.copy_done)
        {
            return row.swap;
        }
    }
    SwapType::None
}

/// Labels a swap that was interrupted and finished on this boot.
///
/// The post-swap trailers describe the state after the copy, so the
/// request they derive is inverted: a finished permanent swap reads as
/// no request, a finished test swap reads as a revert request. A test
/// swap whose confirmation window was consumed by the interruption is
/// reported as permanent.
pub fn previous_swap(after: SwapType) -> SwapType {
    match after {
        SwapType::None => SwapType::Perm,
        SwapType::Revert => SwapType::Test,
        _ => SwapType::Fail,
    }
}

// ---- progress ----

/// Position of an in-flight swap: cycle index and sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootStatus {
    /// Sector-swap cycles completed, counted from the slot tail.
    pub idx: u32,
    /// Completed sub-steps of the current cycle.
    pub state: u8,
    /// The current cycle keeps its status in the scratch trailer.
    pub use_scratch: bool,
    /// Bytes being swapped, from the trailer once a swap is under way.
    pub swap_size: u32,
}

impl BootStatus {
    pub fn fresh() -> Self {
        Self {
            idx: 0,
            state: 0,
            use_scratch: false,
            swap_size: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.idx != 0 || self.state != 0
    }

    pub fn completed_steps(&self) -> u32 {
        self.idx * STEPS_PER_CYCLE + u32::from(self.state)
    }

    pub fn from_steps(steps: u32) -> Self {
        Self {
            idx: steps / STEPS_PER_CYCLE,
            state: (steps % STEPS_PER_CYCLE) as u8,
            use_scratch: false,
            swap_size: 0,
        }
    }
}

/// Counts completed sub-steps in a status array.
///
/// Returns the number of programmed bytes before the first erased one,
/// and whether nothing was programmed after it. A programmed byte past
/// an erased one means a status write was lost; the prefix is still the
/// last state known to be consistent.
pub fn scan_status_bytes(bytes: &[u8]) -> (u32, bool) {
    let written = bytes
        .iter()
        .position(|&b| b == ERASED_BYTE)
        .unwrap_or(bytes.len());
    let clean = bytes[written..].iter().all(|&b| b == ERASED_BYTE);
    (written as u32, clean)
}

// ---- tests ----
