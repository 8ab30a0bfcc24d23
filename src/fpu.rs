//! C6 — FPU State Array (spec §3, §4.6).
//!
//! Single mutex+condvar owner of the grid state, following the shape of
//! the original's `FPUArray`: one lock around a `t_grid_state`-equivalent
//! struct, a condition variable signalled on every state change, and a
//! `waitForState` that blocks until the caller's target mask is satisfied.
//!
//! Open Question (a) from spec §9: the original carries two overlapping
//! but non-identical `FPUState` enums for protocol v1/v2. This crate picks
//! one canonical [`FpuStateKind`] (the per-FPU enum from spec §3) and maps
//! the richer `E_GridState` distinctions the original used only at grid
//! level (`LEAVING_DATUM`/`ABOVE_DATUM`) onto [`FpuStateKind::AtDatum`] —
//! this driver's canonical state never tracks "mid-datum-search, one arm
//! done" as separate from "searching"/"at datum".

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::command::Opcode;

/// Host-generated stand-in for `MocErrCode::CommandTimedOut`'s wire value
/// (`dispatch.rs`), written into `last_status` when a command expires
/// locally rather than being reported by a frame from the FPU.
pub const COMMAND_TIMED_OUT_ERRCODE: u8 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FpuStateKind {
    Unknown,
    Uninitialized,
    Locked,
    DatumSearch,
    AtDatum,
    Loading,
    ReadyForward,
    ReadyReverse,
    Moving,
    Resting,
    Aborted,
    ObstacleError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionState {
    Unknown,
    Clockwise,
    AntiClockwise,
    RestingLastCw,
    RestingLastAcw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Uninitialized,
    Unconnected,
    Connected,
    AssertionFailed,
}

/// Unfolds the alpha step field from its asymmetric 16-bit wire encoding:
/// raw values above the positive end of `[-10000, 55535]` are negative.
pub fn unfold_alpha_steps(raw: u16) -> i32 {
    if raw as i32 <= 55535 {
        raw as i32
    } else {
        raw as i32 - 65536
    }
}

/// Unfolds the beta step field: plain symmetric two's-complement i16.
pub fn unfold_beta_steps(raw: u16) -> i32 {
    raw as i16 as i32
}

pub const MAX_TIMEOUTS: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct PendingTimeout {
    pub opcode: Opcode,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

/// Per-FPU state record (spec §3).
#[derive(Debug, Clone)]
pub struct FpuState {
    pub state: FpuStateKind,
    pub alpha_steps: i32,
    pub beta_steps: i32,
    pub alpha_deviation: i32,
    pub beta_deviation: i32,
    pub alpha_was_referenced: bool,
    pub beta_was_referenced: bool,

    pub is_locked: bool,
    pub alpha_datum_switch_active: bool,
    pub beta_datum_switch_active: bool,
    pub beta_collision: bool,
    pub at_alpha_limit: bool,
    pub waveform_valid: bool,
    pub waveform_ready: bool,
    pub waveform_reversed: bool,
    pub ping_ok: bool,
    pub movement_complete: bool,

    pub direction_alpha: DirectionState,
    pub direction_beta: DirectionState,

    pub num_waveform_segments: u32,
    pub waveform_status: u8,
    pub last_command: Option<Opcode>,
    pub last_status: u8,
    pub sequence_number: u16,
    pub pending_command_set: u32,
    pub cmd_timeouts: Vec<PendingTimeout>,

    pub timeout_count: u32,
    pub step_timing_errcount: u32,
    pub can_overflow_errcount: u32,

    pub firmware_version: FirmwareVersion,
    pub crc: u32,
    pub serial_number: [u8; 5],

    pub last_updated: Instant,
}

impl FpuState {
    pub fn new(now: Instant) -> Self {
        Self {
            state: FpuStateKind::Unknown,
            alpha_steps: 0,
            beta_steps: 0,
            alpha_deviation: 0,
            beta_deviation: 0,
            alpha_was_referenced: false,
            beta_was_referenced: false,
            is_locked: false,
            alpha_datum_switch_active: false,
            beta_datum_switch_active: false,
            beta_collision: false,
            at_alpha_limit: false,
            waveform_valid: false,
            waveform_ready: false,
            waveform_reversed: false,
            ping_ok: false,
            movement_complete: false,
            direction_alpha: DirectionState::Unknown,
            direction_beta: DirectionState::Unknown,
            num_waveform_segments: 0,
            waveform_status: 0,
            last_command: None,
            last_status: 0,
            sequence_number: 0,
            pending_command_set: 0,
            cmd_timeouts: Vec::with_capacity(MAX_TIMEOUTS),
            timeout_count: 0,
            step_timing_errcount: 0,
            can_overflow_errcount: 0,
            firmware_version: FirmwareVersion::default(),
            crc: 0,
            serial_number: [0; 5],
            last_updated: now,
        }
    }

    pub fn has_pending(&self, opcode: Opcode) -> bool {
        self.pending_command_set & (1 << opcode as u8) != 0
    }

    fn set_pending_bit(&mut self, opcode: Opcode) {
        self.pending_command_set |= 1 << opcode as u8;
    }

    fn clear_pending_bit(&mut self, opcode: Opcode) {
        self.pending_command_set &= !(1 << opcode as u8);
    }
}

/// Grid-wide summary state (original's `E_GridState`). `AboveDatum` is
/// retained as a named mask member (spec §4.6) even though this driver's
/// canonical per-FPU state never produces it distinctly from `AtDatum` —
/// see the module doc comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridSummary {
    Unknown,
    Uninitialized,
    DatumSearch,
    AtDatum,
    AboveDatum,
    Loading,
    ReadyForward,
    ReadyReverse,
    Moving,
    Finished,
    Collision,
    Aborted,
}

/// Named target masks (spec §4.6). Plain functions rather than a bitflags
/// type: the set of masks is small and fixed, and each is simply "is the
/// summary one of these named members".
pub fn above_datum(summary: GridSummary) -> bool {
    matches!(
        summary,
        GridSummary::AboveDatum | GridSummary::Unknown | GridSummary::Collision | GridSummary::Aborted
    )
}

pub fn at_datum(summary: GridSummary) -> bool {
    matches!(
        summary,
        GridSummary::AtDatum | GridSummary::Unknown | GridSummary::Collision | GridSummary::Aborted
    )
}

pub fn ready_to_move(summary: GridSummary) -> bool {
    matches!(
        summary,
        GridSummary::ReadyForward
            | GridSummary::ReadyReverse
            | GridSummary::AtDatum
            | GridSummary::DatumSearch
            | GridSummary::Uninitialized
            | GridSummary::Collision
            | GridSummary::Aborted
    )
}

pub fn movement_finished(summary: GridSummary) -> bool {
    matches!(
        summary,
        GridSummary::Finished | GridSummary::Collision | GridSummary::Aborted
    )
}

pub fn any_change(_summary: GridSummary) -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct GridState {
    pub fpus: Vec<FpuState>,
    pub interface_state: InterfaceState,
    pub count_pending: u64,
    pub count_timeout: u64,
    pub count_can_overflow: u64,
    pub num_queued: u64,
    /// Set whenever anything changes, consumed and cleared by `ANY_CHANGE`
    /// waiters only (mirrors the original's `state_changed` flag).
    pub state_changed: bool,
}

impl GridState {
    fn new(num_fpus: usize, now: Instant) -> Self {
        Self {
            fpus: (0..num_fpus).map(|_| FpuState::new(now)).collect(),
            interface_state: InterfaceState::Uninitialized,
            count_pending: 0,
            count_timeout: 0,
            count_can_overflow: 0,
            num_queued: 0,
            state_changed: false,
        }
    }

    /// Histogram over `FpuStateKind` (invariant P1: sums to `num_fpus`).
    pub fn counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for fpu in &self.fpus {
            *counts.entry(kind_name(fpu.state)).or_insert(0) += 1;
        }
        counts
    }

    /// "Least common denominator" summary (spec §4.6): locked FPUs are
    /// excluded (they trivially satisfy any target, mirroring the
    /// original's `count_locked` being added into every target counter);
    /// any remaining FPU in a hard-error state forces that error as the
    /// summary; otherwise the summary is the least-advanced pipeline stage
    /// present across the remaining FPUs.
    pub fn summary(&self) -> GridSummary {
        let active: Vec<&FpuState> = self
            .fpus
            .iter()
            .filter(|f| f.state != FpuStateKind::Locked)
            .collect();
        if active.is_empty() {
            return GridSummary::Uninitialized;
        }
        if active.iter().any(|f| f.state == FpuStateKind::ObstacleError) {
            return GridSummary::Collision;
        }
        if active.iter().any(|f| f.state == FpuStateKind::Aborted) {
            return GridSummary::Aborted;
        }
        active
            .iter()
            .map(|f| stage_rank(f.state))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, summary)| summary)
            .unwrap_or(GridSummary::Unknown)
    }
}

fn kind_name(kind: FpuStateKind) -> &'static str {
    match kind {
        FpuStateKind::Unknown => "UNKNOWN",
        FpuStateKind::Uninitialized => "UNINITIALIZED",
        FpuStateKind::Locked => "LOCKED",
        FpuStateKind::DatumSearch => "DATUM_SEARCH",
        FpuStateKind::AtDatum => "AT_DATUM",
        FpuStateKind::Loading => "LOADING",
        FpuStateKind::ReadyForward => "READY_FORWARD",
        FpuStateKind::ReadyReverse => "READY_REVERSE",
        FpuStateKind::Moving => "MOVING",
        FpuStateKind::Resting => "RESTING",
        FpuStateKind::Aborted => "ABORTED",
        FpuStateKind::ObstacleError => "OBSTACLE_ERROR",
    }
}

fn stage_rank(kind: FpuStateKind) -> (u8, GridSummary) {
    match kind {
        FpuStateKind::Unknown => (0, GridSummary::Unknown),
        FpuStateKind::Uninitialized => (1, GridSummary::Uninitialized),
        FpuStateKind::DatumSearch => (2, GridSummary::DatumSearch),
        FpuStateKind::AtDatum => (3, GridSummary::AtDatum),
        FpuStateKind::Loading => (4, GridSummary::Loading),
        FpuStateKind::ReadyForward => (5, GridSummary::ReadyForward),
        FpuStateKind::ReadyReverse => (5, GridSummary::ReadyReverse),
        FpuStateKind::Moving => (6, GridSummary::Moving),
        FpuStateKind::Resting => (7, GridSummary::Finished),
        // Locked/Aborted/ObstacleError are filtered/handled before this
        // function is reached by `GridState::summary`.
        FpuStateKind::Locked => (1, GridSummary::Uninitialized),
        FpuStateKind::Aborted => (8, GridSummary::Aborted),
        FpuStateKind::ObstacleError => (9, GridSummary::Collision),
    }
}

/// Mutex+condvar-protected owner of the grid state (spec §4.6, §5).
pub struct FpuStateArray {
    inner: Mutex<GridState>,
    changed: Condvar,
}

impl FpuStateArray {
    pub fn new(num_fpus: usize) -> Self {
        Self {
            inner: Mutex::new(GridState::new(num_fpus, Instant::now())),
            changed: Condvar::new(),
        }
    }

    pub fn get_grid_state(&self) -> GridState {
        self.inner.lock().clone()
    }

    pub fn with_fpu_mut<R>(&self, fpu_id: u32, f: impl FnOnce(&mut FpuState) -> R) -> R {
        let mut guard = self.inner.lock();
        let r = f(&mut guard.fpus[fpu_id as usize]);
        guard.state_changed = true;
        drop(guard);
        self.changed.notify_all();
        r
    }

    pub fn set_interface_state(&self, state: InterfaceState) {
        let mut guard = self.inner.lock();
        guard.interface_state = state;
        guard.state_changed = true;
        drop(guard);
        self.changed.notify_all();
    }

    /// Registers a pending command and its timeout deadline (spec §4.6).
    pub fn set_pending_command(
        &self,
        fpu_id: u32,
        opcode: Opcode,
        deadline: Instant,
        timeouts: &mut crate::timeout_list::TimeoutList,
    ) {
        let mut guard = self.inner.lock();
        {
            let fpu = &mut guard.fpus[fpu_id as usize];
            fpu.set_pending_bit(opcode);
            fpu.cmd_timeouts.push(PendingTimeout { opcode, deadline });
            fpu.last_command = Some(opcode);
        }
        guard.count_pending += 1;
        guard.state_changed = true;
        drop(guard);
        timeouts.insert(crate::timeout_list::TimeoutEntry { fpu_id, opcode, deadline });
        self.changed.notify_all();
    }

    /// Clears a pending command's bit/timeout bookkeeping — called on
    /// response delivery (P3) or on timeout expiry.
    pub fn clear_pending_command(&self, fpu_id: u32, opcode: Opcode) {
        let mut guard = self.inner.lock();
        {
            let fpu = &mut guard.fpus[fpu_id as usize];
            if fpu.has_pending(opcode) {
                fpu.clear_pending_bit(opcode);
                fpu.cmd_timeouts.retain(|t| t.opcode != opcode);
                guard.count_pending = guard.count_pending.saturating_sub(1);
            }
        }
        guard.state_changed = true;
        drop(guard);
        self.changed.notify_all();
    }

    /// Blocks until `target(summary) == true` or `max_wait` elapses.
    /// Returns `Ok(grid_state)` on satisfaction, `Err(())` on soft timeout
    /// (spec §7: "Wait timeout (soft, not an error at the interface
    /// boundary)").
    pub fn wait_for_state(
        &self,
        target: impl Fn(GridSummary) -> bool,
        max_wait: Option<Duration>,
    ) -> Result<GridState, ()> {
        let mut guard = self.inner.lock();
        let deadline = max_wait.map(|d| Instant::now() + d);
        loop {
            if target(guard.summary())
                || guard.interface_state == InterfaceState::AssertionFailed
            {
                return Ok(guard.clone());
            }
            match deadline {
                None => self.changed.wait(&mut guard),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(());
                    }
                    let timed_out = self.changed.wait_for(&mut guard, dl - now).timed_out();
                    if timed_out && !(target(guard.summary())) {
                        return Err(());
                    }
                }
            }
        }
    }

    /// C5→C6 handoff: pops every expired timeout and applies the
    /// per-opcode timeout action from spec §4.6/§4.7's table.
    pub fn process_timeouts(&self, now: Instant, timeouts: &mut crate::timeout_list::TimeoutList) {
        let expired = timeouts.pop_expired(now);
        if expired.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        for entry in expired {
            guard.count_timeout = guard.count_timeout.wrapping_add(1);
            let fpu = &mut guard.fpus[entry.fpu_id as usize];
            if !fpu.has_pending(entry.opcode) {
                continue;
            }
            fpu.clear_pending_bit(entry.opcode);
            fpu.cmd_timeouts.retain(|t| t.opcode != entry.opcode);
            fpu.timeout_count += 1;
            fpu.last_status = COMMAND_TIMED_OUT_ERRCODE;
            guard.count_pending = guard.count_pending.saturating_sub(1);
            match entry.opcode {
                Opcode::ExecuteMotion => fpu.state = FpuStateKind::Resting,
                Opcode::FindDatum => fpu.state = FpuStateKind::Uninitialized,
                Opcode::AbortMotion => {
                    tracing::error!(fpu_id = entry.fpu_id, "ABORT_MOTION command timed out");
                }
                _ => {}
            }
        }
        guard.state_changed = true;
        drop(guard);
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_unfold_boundary_values() {
        assert_eq!(unfold_alpha_steps(0x0000), 0);
        assert_eq!(unfold_alpha_steps(0x00FF), 255);
        assert_eq!(unfold_alpha_steps(55535), 55535);
        assert_eq!(unfold_alpha_steps(55536), -10000);
    }

    #[test]
    fn beta_unfold_boundary_values() {
        assert_eq!(unfold_beta_steps(0x8000), -32768);
        assert_eq!(unfold_beta_steps(0x7FFF), 32767);
    }

    #[test]
    fn summary_is_least_advanced_stage_present() {
        let arr = FpuStateArray::new(1000);
        {
            let mut g = arr.inner.lock();
            for f in g.fpus.iter_mut().take(950) {
                f.state = FpuStateKind::ReadyForward;
            }
            for f in g.fpus.iter_mut().skip(950).take(45) {
                f.state = FpuStateKind::Loading;
            }
            for f in g.fpus.iter_mut().skip(995).take(5) {
                f.state = FpuStateKind::Uninitialized;
            }
        }
        assert_eq!(arr.get_grid_state().summary(), GridSummary::Uninitialized);
    }

    #[test]
    fn obstacle_error_dominates_summary() {
        let arr = FpuStateArray::new(3);
        arr.with_fpu_mut(0, |f| f.state = FpuStateKind::ReadyForward);
        arr.with_fpu_mut(1, |f| f.state = FpuStateKind::ObstacleError);
        assert_eq!(arr.get_grid_state().summary(), GridSummary::Collision);
    }

    #[test]
    fn locked_fpus_are_excluded_from_summary() {
        let arr = FpuStateArray::new(2);
        arr.with_fpu_mut(0, |f| f.state = FpuStateKind::Locked);
        arr.with_fpu_mut(1, |f| f.state = FpuStateKind::Resting);
        assert_eq!(arr.get_grid_state().summary(), GridSummary::Finished);
    }

    #[test]
    fn wait_for_state_times_out_softly() {
        let arr = FpuStateArray::new(1);
        let result = arr.wait_for_state(|s| s == GridSummary::Finished, Some(Duration::from_millis(20)));
        assert!(result.is_err());
    }

    #[test]
    fn wait_for_state_returns_once_target_satisfied() {
        let arr = std::sync::Arc::new(FpuStateArray::new(1));
        let arr2 = arr.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            arr2.with_fpu_mut(0, |f| f.state = FpuStateKind::Resting);
        });
        let result = arr.wait_for_state(movement_finished, Some(Duration::from_secs(2)));
        handle.join().unwrap();
        assert!(result.is_ok());
    }
}
