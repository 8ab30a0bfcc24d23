//! C9 — Async Driver (spec §4.9).
//!
//! One method per logical high-level operation, each lowering to one or
//! more [`CanCommand`]s fanned out through [`CommandPool`]/[`CommandQueue`]
//! and tracked in [`FpuStateArray`]/[`TimeoutList`] — the Rust shape of
//! the original's `AsyncDriver`, which owns exactly this set of
//! responsibilities over the same C1-C8 collaborators. Motion-capable
//! operations (`configMotion`, `executeMotion`, `findDatum`) additionally
//! run every waveform through [`validate_waveforms`] and the protection
//! layer's envelope check *before* a single frame is queued — the
//! "zero-dispatch-on-failure guarantee" shared with C10.
//!
//! The original's C10 "wraps" C9: callers go through the protection layer,
//! which simulates, checks, and only then calls into the driver. Rust's
//! ownership model makes that literally (`ProtectionLayer` holding an
//! `Arc<AsyncDriver>` while `AsyncDriver` holds an `Arc<ProtectionLayer>`)
//! a reference cycle, so this crate inverts the composition: `AsyncDriver`
//! owns the `ProtectionLayer` and calls its check/commit methods inline
//! around the same dispatch points the original's wrapper would run
//! around. Net effect on callers is identical; see DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::command::{CanCommand, DatumOptions, RequestDirection, WaveformSegment};
use crate::config::{fpu_bus_address, DriverConfig};
use crate::error::{Result, WaveformError};
use crate::fpu::{
    at_datum, movement_finished, DirectionState, FirmwareVersion, FpuStateArray, FpuStateKind, GridState, GridSummary,
};
use crate::pool::CommandPool;
use crate::protection::{Direction, FailureKind, ProtectionLayer};
use crate::queue::{CommandQueue, QueuedCommand};
use crate::timeout_list::TimeoutList;

/// Upper bound on a single waveform segment's step magnitude: the wire
/// encoding (`command.rs::encode_step_field`) packs it into a 14-bit
/// field, so any larger value could never reach the firmware intact.
pub const MAX_STEPS: i32 = 0x3fff;

/// Maps the grid's last-known arm direction onto the protection layer's
/// retry-counter direction, `None` when the arm never got further than
/// `UNKNOWN` (so neither `_cw` nor `_acw` is attributable).
fn retry_direction(state: DirectionState) -> Option<Direction> {
    match state {
        DirectionState::Clockwise | DirectionState::RestingLastCw => Some(Direction::Clockwise),
        DirectionState::AntiClockwise | DirectionState::RestingLastAcw => Some(Direction::AntiClockwise),
        DirectionState::Unknown => None,
    }
}

/// Upper bound on a waveform's segment count. No literal constant for
/// this was found in the retrieved original sources (`AsyncDriver.h`
/// takes it as a `validateWaveforms` parameter, not a `#define`); reused
/// here from `pool::MAX_SUB_COMMANDS`, which already bounds "elementary
/// commands resulting from one high-level command" per FPU for exactly
/// this opcode (`pool_capacity(ConfigMotion, n) = MAX_SUB_COMMANDS * n`).
pub const MAX_NUM_SECTIONS: usize = crate::pool::MAX_SUB_COMMANDS;

/// Outcome of a blocking wait for a grid-state target. Wait timeout is
/// soft at the interface boundary (spec §7) so it is its own type, not a
/// `DriverError` variant.
#[derive(Debug, Clone)]
pub enum WaitResult {
    Completed(GridState),
    TimedOut,
}

impl WaitResult {
    pub fn completed(&self) -> bool {
        matches!(self, WaitResult::Completed(_))
    }
}

pub struct AsyncDriver {
    config: DriverConfig,
    grid: Arc<FpuStateArray>,
    queue: Arc<CommandQueue>,
    pool: Arc<CommandPool>,
    timeouts: Arc<Mutex<TimeoutList>>,
    protection: Arc<ProtectionLayer>,
    /// Bridges the thread-per-gateway core onto the `async-trait`
    /// persistence layer (spec §6) without making every driver method
    /// `async fn` — the gateway TX/RX threads are plain OS threads, not
    /// tokio tasks, so calls into `ProtectionLayer` block on a dedicated
    /// single-threaded runtime instead of requiring a caller-supplied one.
    rt: tokio::runtime::Runtime,
}

impl AsyncDriver {
    pub fn new(
        config: DriverConfig,
        grid: Arc<FpuStateArray>,
        queue: Arc<CommandQueue>,
        pool: Arc<CommandPool>,
        timeouts: Arc<Mutex<TimeoutList>>,
        protection: Arc<ProtectionLayer>,
    ) -> Self {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build protection-layer bridge runtime");
        Self {
            config,
            grid,
            queue,
            pool,
            timeouts,
            protection,
            rt,
        }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }

    /// Waits (up to `max_wait`) for the grid summary to satisfy `target`.
    pub fn wait_for(&self, target: impl Fn(GridSummary) -> bool, max_wait: Option<Duration>) -> WaitResult {
        match self.grid.wait_for_state(target, max_wait) {
            Ok(gs) => WaitResult::Completed(gs),
            Err(()) => WaitResult::TimedOut,
        }
    }

    pub fn grid_state(&self) -> GridState {
        self.grid.get_grid_state()
    }

    /// Queues one unicast command for `fpu_id`, taking a pool slot and
    /// registering its timeout deadline (spec §4.3/§4.6 handoff).
    fn dispatch_one(&self, fpu_id: u32, command: CanCommand) -> Result<()> {
        let addr = fpu_bus_address(fpu_id);
        let opcode = command.opcode();
        let slot = self.pool.provide_instance(opcode);
        let deadline = Instant::now() + opcode.default_timeout();
        self.grid
            .set_pending_command(fpu_id, opcode, deadline, &mut self.timeouts.lock());
        self.queue.enqueue(
            addr.gateway,
            QueuedCommand {
                fpu_id,
                can_id: addr.can_id,
                bus: addr.bus,
                command,
                _slot: Some(slot),
            },
        );
        Ok(())
    }

    /// Queues one CAN-id-zero broadcast frame per gateway that has at
    /// least one of `fpu_ids` attached, while registering the pending bit
    /// and timeout for every targeted FPU individually (spec §4.2
    /// `is_broadcastable`/§4.9).
    fn dispatch_broadcast(&self, command: CanCommand, fpu_ids: &[u32]) -> Result<()> {
        let opcode = command.opcode();
        let deadline = Instant::now() + opcode.default_timeout();
        for &fpu_id in fpu_ids {
            self.grid
                .set_pending_command(fpu_id, opcode, deadline, &mut self.timeouts.lock());
        }
        let mut sent_gateways = std::collections::HashSet::new();
        for &fpu_id in fpu_ids {
            let addr = fpu_bus_address(fpu_id);
            if sent_gateways.insert(addr.gateway) {
                let slot = self.pool.provide_instance(opcode);
                self.queue.enqueue(
                    addr.gateway,
                    QueuedCommand {
                        fpu_id,
                        can_id: 0,
                        bus: addr.bus,
                        command: command.clone(),
                        _slot: Some(slot),
                    },
                );
            }
        }
        Ok(())
    }

    // -- Connection / identity --------------------------------------

    /// Reads back each FPU's serial number and loads its protection
    /// envelope (spec §4.10: "At connect it loads each FPU's envelope
    /// record by serial number").
    pub fn connect(&self, fpu_ids: &[u32], timeout: Duration) -> Result<()> {
        for &id in fpu_ids {
            self.dispatch_one(id, CanCommand::ReadSerialNumber)?;
        }
        let deadline = Instant::now() + timeout;
        while self.grid.get_grid_state().count_pending > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let snapshot = self.grid.get_grid_state();
        for &id in fpu_ids {
            let serial = serial_to_string(&snapshot.fpus[id as usize].serial_number);
            self.block_on(self.protection.load_at_connect(id, &serial))?;
        }
        Ok(())
    }

    pub fn ping_fpu(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::PingFpu)
    }

    pub fn reset_fpu(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::ResetFpu)
    }

    pub fn read_serial_numbers(&self, fpu_ids: &[u32]) -> Result<()> {
        for &id in fpu_ids {
            self.dispatch_one(id, CanCommand::ReadSerialNumber)?;
        }
        Ok(())
    }

    pub fn write_serial_number(&self, fpu_id: u32, serial: [u8; 5]) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::WriteSerialNumber { serial })
    }

    pub fn get_firmware_version(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::GetFirmwareVersion)
    }

    /// Lowest firmware version reported across `fpu_ids`, or `None` if
    /// none have reported one yet.
    pub fn get_min_firmware_version(&self, fpu_ids: &[u32]) -> Option<FirmwareVersion> {
        let snapshot = self.grid.get_grid_state();
        fpu_ids
            .iter()
            .map(|&id| snapshot.fpus[id as usize].firmware_version)
            .min_by_key(|v| (v.major, v.minor, v.patch))
    }

    pub fn check_integrity(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::CheckIntegrity)
    }

    // -- Datum search --------------------------------------------------

    pub fn start_find_datum(&self, fpu_ids: &[u32], options: DatumOptions) -> Result<()> {
        for &id in fpu_ids {
            self.protection.check_motion(id, 0, 0)?;
            self.dispatch_one(id, CanCommand::FindDatum(options))?;
        }
        Ok(())
    }

    pub fn wait_find_datum(&self, timeout: Option<Duration>) -> WaitResult {
        self.wait_for(at_datum, timeout)
    }

    pub fn find_datum(&self, fpu_ids: &[u32], options: DatumOptions, timeout: Option<Duration>) -> Result<WaitResult> {
        self.start_find_datum(fpu_ids, options)?;
        let outcome = self.wait_find_datum(timeout);
        if let WaitResult::Completed(ref gs) = outcome {
            for &id in fpu_ids {
                match gs.fpus[id as usize].state {
                    FpuStateKind::AtDatum => {
                        self.block_on(self.protection.commit_datum_success(id, 0, 0))?;
                    }
                    FpuStateKind::Aborted => {
                        self.block_on(self.protection.commit_failure(id, FailureKind::DatumTimeout))?;
                    }
                    _ => {}
                }
            }
        }
        Ok(outcome)
    }

    // -- Waveform upload -------------------------------------------------

    /// Validates `waveforms` against spec §4.9's structural rules and the
    /// protection envelope, then uploads every segment — no frame is
    /// written for any FPU unless every FPU in the batch passes both
    /// checks.
    pub fn config_motion(&self, waveforms: &HashMap<u32, Vec<WaveformSegment>>) -> Result<()> {
        let start_bound = (self.config.motor_max_start_frequency / self.config.motor_maximum_frequency).round() as i32;
        validate_waveforms(
            waveforms,
            start_bound,
            self.config.motor_max_rel_increase,
            self.config.motor_max_step_difference,
        )?;

        let snapshot = self.grid.get_grid_state();
        for (&fpu_id, segments) in waveforms {
            let fpu = &snapshot.fpus[fpu_id as usize];
            let (final_alpha, final_beta) = simulate_forward(fpu.alpha_steps, fpu.beta_steps, segments);
            self.protection.check_motion(fpu_id, final_alpha, final_beta)?;
        }

        for (&fpu_id, segments) in waveforms {
            let last = segments.len() - 1;
            for (i, seg) in segments.iter().enumerate() {
                self.dispatch_one(
                    fpu_id,
                    CanCommand::ConfigMotion {
                        segments: vec![*seg],
                        first_entry: i == 0,
                        last_entry: i == last,
                    },
                )?;
            }
        }
        Ok(())
    }

    // -- Motion ----------------------------------------------------------

    pub fn start_execute_motion(&self, fpu_ids: &[u32]) -> Result<()> {
        for &id in fpu_ids {
            self.dispatch_one(id, CanCommand::ExecuteMotion)?;
        }
        Ok(())
    }

    pub fn wait_execute_motion(&self, timeout: Option<Duration>) -> WaitResult {
        self.wait_for(movement_finished, timeout)
    }

    /// Starts motion on `fpu_ids` and waits for completion, committing the
    /// protection envelope per-FPU once the grid reaches a finished state
    /// (spec §4.10's commit step — run here, synchronously after the
    /// wait, rather than from the RX thread; see the module doc comment).
    pub fn execute_motion(&self, fpu_ids: &[u32], timeout: Option<Duration>) -> Result<WaitResult> {
        self.start_execute_motion(fpu_ids)?;
        let outcome = self.wait_execute_motion(timeout);
        if let WaitResult::Completed(ref gs) = outcome {
            for &id in fpu_ids {
                let fpu = &gs.fpus[id as usize];
                match fpu.state {
                    FpuStateKind::ObstacleError => {
                        let beta_direction = retry_direction(fpu.direction_beta);
                        self.block_on(self.protection.commit_failure(id, FailureKind::Collision { beta_direction }))?;
                    }
                    FpuStateKind::Aborted => {
                        self.block_on(self.protection.commit_failure(id, FailureKind::Timeout))?;
                    }
                    _ => {
                        self.block_on(self.protection.commit_success(id, fpu.alpha_steps, fpu.beta_steps))?;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Broadcasts `ABORT_MOTION` at its elevated priority to every
    /// gateway serving one of `fpu_ids` (spec §4.9: abort must reach every
    /// affected FPU ahead of anything already queued).
    pub fn abort_motion(&self, fpu_ids: &[u32]) -> Result<()> {
        self.dispatch_broadcast(CanCommand::AbortMotion, fpu_ids)
    }

    pub fn repeat_motion(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::RepeatMotion)
    }

    pub fn reverse_motion(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::ReverseMotion)
    }

    pub fn reset_step_counter(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::ResetStepCounter)
    }

    // -- Locking / protection switches -----------------------------------

    pub fn lock_unit(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::LockUnit)
    }

    pub fn unlock_unit(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::UnlockUnit)
    }

    pub fn enable_beta_collision_protection(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::EnableBetaCollisionProtection)
    }

    pub fn free_beta_collision(&self, fpu_id: u32, direction: RequestDirection) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::FreeBetaCollision { direction })
    }

    pub fn enable_alpha_limit_protection(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::EnableAlphaLimitProtection)
    }

    pub fn free_alpha_limit_breach(&self, fpu_id: u32, direction: RequestDirection) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::FreeAlphaLimitBreach { direction })
    }

    pub fn enable_move(&self, fpu_id: u32) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::EnableMove)
    }

    // -- Stepper tuning ---------------------------------------------------

    pub fn set_ustep_level(&self, fpu_id: u32, level: u8) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::SetUStepLevel { level })
    }

    pub fn set_ticks_per_segment(&self, fpu_id: u32, ticks: u16) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::SetTicksPerSegment { ticks })
    }

    pub fn set_steps_per_segment(&self, fpu_id: u32, steps: u16) -> Result<()> {
        self.dispatch_one(fpu_id, CanCommand::SetStepsPerSegment { steps })
    }
}

fn serial_to_string(raw: &[u8; 5]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Steps one arm forward through its non-pause segments, using the
/// segment's `clockwise` flag (not the sign of `steps`, which carries only
/// a magnitude — see `command::encode_step_field`) to choose direction.
fn simulate_forward(alpha0: i32, beta0: i32, segments: &[WaveformSegment]) -> (i32, i32) {
    let mut alpha = alpha0;
    let mut beta = beta0;
    for seg in segments {
        if !seg.alpha_pause {
            let magnitude = seg.alpha_steps.unsigned_abs() as i32;
            alpha += if seg.alpha_clockwise { magnitude } else { -magnitude };
        }
        if !seg.beta_pause {
            let magnitude = seg.beta_steps.unsigned_abs() as i32;
            beta += if seg.beta_clockwise { magnitude } else { -magnitude };
        }
    }
    (alpha, beta)
}

/// Structural waveform validation (spec §4.9). Purely syntactic — the
/// protection-envelope check against the FPU's actual position happens
/// separately in [`AsyncDriver::config_motion`], since it needs the live
/// grid state this function has no access to.
fn validate_waveforms(
    waveforms: &HashMap<u32, Vec<WaveformSegment>>,
    start_bound: i32,
    max_increase: f64,
    max_step_difference: i32,
) -> Result<()> {
    if waveforms.is_empty() {
        return Err(WaveformError::Empty.into());
    }
    let first_len = waveforms.values().next().unwrap().len();
    for segments in waveforms.values() {
        if segments.is_empty() {
            return Err(WaveformError::Empty.into());
        }
        if segments.len() != first_len {
            return Err(WaveformError::Ragged.into());
        }
    }
    if first_len > MAX_NUM_SECTIONS {
        return Err(WaveformError::TooManySections {
            sections: first_len,
            max: MAX_NUM_SECTIONS,
        }
        .into());
    }
    for segments in waveforms.values() {
        validate_one_arm(segments, start_bound, max_increase, max_step_difference, true)?;
        validate_one_arm(segments, start_bound, max_increase, max_step_difference, false)?;
    }
    Ok(())
}

/// Runs spec §4.9's per-arm checks (`MAX_STEPS`, the start/tail frequency
/// bound, and `MAX_INCREASE`) over one arm's segment sequence.
fn validate_one_arm(
    segments: &[WaveformSegment],
    start_bound: i32,
    max_increase: f64,
    max_step_difference: i32,
    alpha: bool,
) -> Result<()> {
    let step = |s: &WaveformSegment| -> (i32, bool) {
        if alpha {
            (s.alpha_steps.unsigned_abs() as i32, s.alpha_pause)
        } else {
            (s.beta_steps.unsigned_abs() as i32, s.beta_pause)
        }
    };

    for (i, seg) in segments.iter().enumerate() {
        let (magnitude, _) = step(seg);
        if magnitude > MAX_STEPS {
            return Err(WaveformError::StepCountTooLarge {
                segment: i,
                steps: magnitude,
                max: MAX_STEPS,
            }
            .into());
        }
    }

    if let Some((_, (magnitude, _))) = segments.iter().map(step).enumerate().find(|(_, (_, pause))| !pause) {
        if magnitude < start_bound {
            return Err(WaveformError::InvalidStart {
                steps: magnitude,
                min: start_bound,
            }
            .into());
        }
    }

    let mut previous: Option<i32> = None;
    for (i, seg) in segments.iter().enumerate() {
        let (magnitude, pause) = step(seg);
        if pause {
            continue;
        }
        if let Some(prev) = previous {
            let relative_limit = (prev as f64 * max_increase).ceil() as i32;
            let absolute_limit = prev + max_step_difference;
            if magnitude > relative_limit.max(absolute_limit) {
                return Err(WaveformError::InvalidSpeedChange {
                    segment: i,
                    steps: magnitude,
                    previous: prev,
                }
                .into());
            }
        }
        previous = Some(magnitude);
    }

    if let Some(last) = segments.last() {
        let (magnitude, pause) = step(last);
        if !pause && magnitude > start_bound {
            return Err(WaveformError::InvalidTail {
                steps: magnitude,
                max: start_bound,
            }
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::WaveformSegment;

    fn seg(alpha: i16, beta: i16) -> WaveformSegment {
        WaveformSegment {
            alpha_steps: alpha,
            beta_steps: beta,
            alpha_pause: false,
            beta_pause: false,
            alpha_clockwise: true,
            beta_clockwise: true,
        }
    }

    #[test]
    fn ragged_waveforms_are_rejected_before_any_dispatch() {
        let mut waveforms = HashMap::new();
        waveforms.insert(0u32, vec![seg(100, 100); 10]);
        waveforms.insert(1u32, vec![seg(100, 100); 9]);
        let err = validate_waveforms(&waveforms, 50, 1.4, 60).unwrap_err();
        assert!(matches!(err, crate::error::DriverError::Waveform(WaveformError::Ragged)));
    }

    #[test]
    fn oversized_step_is_rejected() {
        let mut waveforms = HashMap::new();
        waveforms.insert(0u32, vec![seg(100, 100), seg(20000, 100)]);
        let err = validate_waveforms(&waveforms, 50, 1.4, 16000).unwrap_err();
        assert!(matches!(
            err,
            crate::error::DriverError::Waveform(WaveformError::StepCountTooLarge { .. })
        ));
    }

    #[test]
    fn excessive_acceleration_between_segments_is_rejected() {
        let mut waveforms = HashMap::new();
        waveforms.insert(0u32, vec![seg(100, 100), seg(1000, 100)]);
        let err = validate_waveforms(&waveforms, 50, 1.4, 60).unwrap_err();
        assert!(matches!(
            err,
            crate::error::DriverError::Waveform(WaveformError::InvalidSpeedChange { .. })
        ));
    }

    #[test]
    fn smooth_ramp_validates_successfully() {
        let mut waveforms = HashMap::new();
        waveforms.insert(0u32, vec![seg(100, 100), seg(130, 130), seg(100, 100)]);
        assert!(validate_waveforms(&waveforms, 50, 1.4, 60).is_ok());
    }

    #[test]
    fn simulate_forward_honours_clockwise_flag_not_sign() {
        let segments = vec![
            WaveformSegment {
                alpha_steps: 100,
                beta_steps: 50,
                alpha_pause: false,
                beta_pause: false,
                alpha_clockwise: false,
                beta_clockwise: true,
            },
        ];
        let (alpha, beta) = simulate_forward(0, 0, &segments);
        assert_eq!(alpha, -100);
        assert_eq!(beta, 50);
    }

    #[test]
    fn paused_segments_do_not_advance_position() {
        let segments = vec![WaveformSegment {
            alpha_steps: 500,
            beta_steps: 500,
            alpha_pause: true,
            beta_pause: true,
            alpha_clockwise: true,
            beta_clockwise: true,
        }];
        assert_eq!(simulate_forward(10, 20, &segments), (10, 20));
    }
}
