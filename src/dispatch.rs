//! C7 — Response Dispatch (spec §4.7).
//!
//! Pulls a decoded CAN frame apart into its fixed fields and runs the
//! per-opcode handler that updates the addressed FPU's state, clears its
//! pending-command bit, and removes its timeout-list entry. Grounded in
//! `original_source/include/ethercan/response_handlers/*` (one handler
//! function per opcode family in the original; collapsed here into a
//! single match, the way the teacher's dispatcher matches on message kind
//! rather than registering a handler object per kind).

use std::time::Instant;

use crate::command::Opcode;
use crate::fpu::{unfold_alpha_steps, unfold_beta_steps, DirectionState, FpuStateArray, FpuStateKind};
use crate::timeout_list::TimeoutList;

/// Status bits in the FPU response message (`E_FPU_STATUS_BITS`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusBits {
    pub alpha_datum_active: bool,
    pub beta_datum_active: bool,
    pub collision_detected: bool,
    pub alpha_at_limit: bool,
    pub fpu_locked: bool,
    pub alpha_last_clockwise: bool,
    pub beta_last_clockwise: bool,
    pub is_referenced: bool,
    pub waveform_valid: bool,
    pub waveform_ready: bool,
    pub waveform_reversed: bool,
}

impl StatusBits {
    pub fn from_word(word: u16) -> Self {
        Self {
            alpha_datum_active: word & 1 != 0,
            beta_datum_active: word & (1 << 1) != 0,
            collision_detected: word & (1 << 2) != 0,
            alpha_at_limit: word & (1 << 3) != 0,
            fpu_locked: word & (1 << 4) != 0,
            alpha_last_clockwise: word & (1 << 5) != 0,
            beta_last_clockwise: word & (1 << 6) != 0,
            is_referenced: word & (1 << 7) != 0,
            waveform_valid: word & (1 << 8) != 0,
            waveform_ready: word & (1 << 9) != 0,
            waveform_reversed: word & (1 << 10) != 0,
        }
    }
}

/// FPU motion-controller error code (`E_MOC_ERRCODE`, v2 numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MocErrCode {
    #[default]
    Ok,
    WarnCollisionDetected,
    WarnLimitSwitchBreach,
    InvalidCommand,
    CommandIgnored,
    WaveformNotReady,
    WaveformRejected,
    WarnStepTimingError,
    InvalidParameter,
    DatumTimeOut,
    NotifyDatumAlphaOnly,
    NotifyDatumBetaOnly,
    AutoDatumUninitialized,
    DatumOnLimitSwitch,
    CanOverflowHw,
    CanOverflowSw,
    NoConfirmationExpected,
    CommandTimedOut,
    Unknown(u8),
}

impl MocErrCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::Ok,
            0x01 => Self::WarnCollisionDetected,
            0x02 => Self::WarnLimitSwitchBreach,
            0x03 => Self::InvalidCommand,
            0x04 => Self::CommandIgnored,
            0x05 => Self::WaveformNotReady,
            0x06 => Self::WaveformRejected,
            0x07 => Self::WarnStepTimingError,
            0x08 => Self::InvalidParameter,
            0x09 => Self::DatumTimeOut,
            0x0a => Self::NotifyDatumAlphaOnly,
            0x0b => Self::NotifyDatumBetaOnly,
            0x0c => Self::AutoDatumUninitialized,
            0x0d => Self::DatumOnLimitSwitch,
            0x0e => Self::CanOverflowHw,
            0x0f => Self::CanOverflowSw,
            0x10 => Self::NoConfirmationExpected,
            0x11 => Self::CommandTimedOut,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::WarnCollisionDetected => 0x01,
            Self::WarnLimitSwitchBreach => 0x02,
            Self::InvalidCommand => 0x03,
            Self::CommandIgnored => 0x04,
            Self::WaveformNotReady => 0x05,
            Self::WaveformRejected => 0x06,
            Self::WarnStepTimingError => 0x07,
            Self::InvalidParameter => 0x08,
            Self::DatumTimeOut => 0x09,
            Self::NotifyDatumAlphaOnly => 0x0a,
            Self::NotifyDatumBetaOnly => 0x0b,
            Self::AutoDatumUninitialized => 0x0c,
            Self::DatumOnLimitSwitch => 0x0d,
            Self::CanOverflowHw => 0x0e,
            Self::CanOverflowSw => 0x0f,
            Self::NoConfirmationExpected => 0x10,
            Self::CommandTimedOut => 0x11,
            Self::Unknown(b) => b,
        }
    }
}

/// A decoded response frame's fixed fields (spec §4.7), extracted from the
/// de-stuffed payload produced by [`crate::codec::FrameDecoder`]. The CAN
/// data payload is at most `MAX_CAN_PAYLOAD_BYTES` (8) bytes
/// (`original_source/include/canlayer/DriverConstants.h`), which has no
/// room for a wire-carried sequence number alongside status/errcode/steps
/// — `fpu.sequence_number` is instead a host-side counter bumped on every
/// received response (see `apply_common_status`).
#[derive(Debug, Clone, Copy)]
pub struct ResponseFrame {
    pub fpu_id: u32,
    pub opcode_or_message: u8,
    pub status_word: u16,
    pub errcode: MocErrCode,
    pub alpha_steps_raw: u16,
    pub beta_steps_raw: u16,
}

impl ResponseFrame {
    /// Parses the 8-byte CAN data payload body (everything after the
    /// bus/CAN-id header the gateway driver already stripped).
    pub fn parse(fpu_id: u32, body: &[u8]) -> Option<Self> {
        if body.len() < 8 {
            return None;
        }
        Some(Self {
            fpu_id,
            opcode_or_message: body[0] & crate::command::COMMAND_CODE_MASK,
            status_word: u16::from_le_bytes([body[1], body[2]]) & 0x07ff,
            errcode: MocErrCode::from_byte(body[3]),
            alpha_steps_raw: u16::from_le_bytes([body[4], body[5]]),
            beta_steps_raw: u16::from_le_bytes([body[6], body[7]]),
        })
    }
}

/// Applies one decoded response to the grid state, the way the original's
/// per-opcode `handle_*_response` functions do: update position/status
/// fields, clear the pending bit, drop the timeout-list entry.
pub fn dispatch_response(
    opcode: Opcode,
    frame: &ResponseFrame,
    grid: &FpuStateArray,
    timeouts: &mut TimeoutList,
    now: Instant,
) {
    let bits = StatusBits::from_word(frame.status_word);
    timeouts.remove(frame.fpu_id, opcode);
    grid.clear_pending_command(frame.fpu_id, opcode);

    grid.with_fpu_mut(frame.fpu_id, |fpu| {
        fpu.last_status = frame.errcode.to_byte();
        apply_common_status(fpu, &bits, frame, now);

        match opcode {
            Opcode::PingFpu => {
                fpu.ping_ok = frame.errcode == MocErrCode::Ok;
                if fpu.state == FpuStateKind::Unknown {
                    fpu.state = FpuStateKind::Uninitialized;
                }
            }
            Opcode::ResetFpu => {
                fpu.state = FpuStateKind::Uninitialized;
                fpu.alpha_steps = 0;
                fpu.beta_steps = 0;
                fpu.alpha_was_referenced = false;
                fpu.beta_was_referenced = false;
            }
            // FINISHED_DATUM (message id 26) aliases the step/deviation
            // fields onto the datum-search residue (spec §4.7): on success
            // both arms' "step" fields are re-purposed as
            // deviation-from-datum rather than absolute position.
            Opcode::FindDatum if frame.opcode_or_message == 26 => {
                finish_datum(fpu, &bits, frame);
            }
            Opcode::FindDatum => {
                fpu.state = FpuStateKind::DatumSearch;
            }
            // CONFIG_MOTION success (spec §4.7): each accepted segment
            // increments `num_waveform_segments`; the firmware raises the
            // WAVEFORM_READY status bit (already parsed into `bits` by
            // `apply_common_status`) only once the last segment of the
            // upload has landed, at which point the FPU is ready to move.
            Opcode::ConfigMotion => {
                if frame.errcode == MocErrCode::Ok {
                    fpu.num_waveform_segments += 1;
                    fpu.state = if bits.waveform_ready {
                        FpuStateKind::ReadyForward
                    } else {
                        FpuStateKind::Loading
                    };
                } else {
                    fpu.state = FpuStateKind::Loading;
                }
            }
            Opcode::ExecuteMotion => {
                fpu.state = FpuStateKind::Moving;
                fpu.movement_complete = false;
            }
            Opcode::AbortMotion => {
                fpu.state = FpuStateKind::Aborted;
            }
            Opcode::RepeatMotion | Opcode::ReverseMotion => {
                fpu.state = FpuStateKind::Loading;
            }
            Opcode::LockUnit => {
                fpu.is_locked = true;
                fpu.state = FpuStateKind::Locked;
            }
            Opcode::UnlockUnit => {
                fpu.is_locked = false;
                if fpu.state == FpuStateKind::Locked {
                    fpu.state = if fpu.alpha_was_referenced && fpu.beta_was_referenced {
                        FpuStateKind::Resting
                    } else {
                        FpuStateKind::Uninitialized
                    };
                }
            }
            Opcode::EnableBetaCollisionProtection | Opcode::FreeBetaCollision => {
                fpu.beta_collision = false;
                if fpu.state == FpuStateKind::ObstacleError {
                    fpu.state = FpuStateKind::Resting;
                }
            }
            Opcode::EnableAlphaLimitProtection | Opcode::FreeAlphaLimitBreach => {
                fpu.at_alpha_limit = false;
                if fpu.state == FpuStateKind::ObstacleError {
                    fpu.state = FpuStateKind::Resting;
                }
            }
            Opcode::EnableMove => {
                if fpu.state == FpuStateKind::Aborted {
                    fpu.state = FpuStateKind::Resting;
                }
            }
            Opcode::ResetStepCounter => {
                fpu.alpha_steps = 0;
                fpu.beta_steps = 0;
            }
            Opcode::GetFirmwareVersion => {
                fpu.firmware_version.major = (frame.alpha_steps_raw >> 8) as u8;
                fpu.firmware_version.minor = (frame.alpha_steps_raw & 0xff) as u8;
                fpu.firmware_version.patch = (frame.beta_steps_raw & 0xff) as u8;
            }
            Opcode::CheckIntegrity => {
                fpu.crc = (frame.alpha_steps_raw as u32) << 16 | frame.beta_steps_raw as u32;
            }
            Opcode::ReadSerialNumber | Opcode::WriteSerialNumber => {
                // serial number bytes are carried in a dedicated frame
                // layout handled by the gateway driver before dispatch;
                // nothing further to update here on a bare ack.
            }
            _ => {}
        }

        match frame.errcode {
            MocErrCode::WarnCollisionDetected => {
                fpu.beta_collision = true;
                fpu.state = FpuStateKind::ObstacleError;
            }
            MocErrCode::WarnLimitSwitchBreach => {
                fpu.at_alpha_limit = true;
                fpu.state = FpuStateKind::ObstacleError;
            }
            MocErrCode::WarnStepTimingError => {
                fpu.step_timing_errcount += 1;
            }
            MocErrCode::DatumTimeOut => {
                fpu.state = FpuStateKind::Uninitialized;
            }
            _ => {}
        }
    });
}

/// Applies a spontaneous (unsolicited) message — these carry no sequence
/// number the caller is waiting on, only a grid-state update.
pub fn dispatch_spontaneous(
    message: crate::command::SpontaneousMessage,
    frame: &ResponseFrame,
    grid: &FpuStateArray,
) {
    use crate::command::SpontaneousMessage::*;
    let bits = StatusBits::from_word(frame.status_word);
    grid.with_fpu_mut(frame.fpu_id, |fpu| {
        apply_common_status(fpu, &bits, frame, Instant::now());
        match message {
            FinishedMotion => {
                fpu.state = FpuStateKind::Resting;
                fpu.movement_complete = true;
            }
            FinishedDatum => finish_datum(fpu, &bits, frame),
            WarnCollisionBeta => {
                fpu.beta_collision = true;
                fpu.state = FpuStateKind::ObstacleError;
            }
            WarnLimitAlpha => {
                fpu.at_alpha_limit = true;
                fpu.state = FpuStateKind::ObstacleError;
            }
            WarnTimeoutDatum => {
                fpu.state = FpuStateKind::Uninitialized;
            }
            WarnCanOverflow => {
                fpu.can_overflow_errcount += 1;
            }
        }
    });
}

fn finish_datum(fpu: &mut crate::fpu::FpuState, bits: &StatusBits, frame: &ResponseFrame) {
    fpu.state = FpuStateKind::AtDatum;
    fpu.alpha_steps = 0;
    fpu.beta_steps = 0;
    fpu.alpha_deviation = unfold_alpha_steps(frame.alpha_steps_raw);
    fpu.beta_deviation = unfold_beta_steps(frame.beta_steps_raw);
    fpu.alpha_was_referenced = bits.is_referenced || fpu.alpha_was_referenced;
    fpu.beta_was_referenced = bits.is_referenced || fpu.beta_was_referenced;
}

fn apply_common_status(
    fpu: &mut crate::fpu::FpuState,
    bits: &StatusBits,
    frame: &ResponseFrame,
    now: Instant,
) {
    fpu.sequence_number = fpu.sequence_number.wrapping_add(1);
    fpu.alpha_datum_switch_active = bits.alpha_datum_active;
    fpu.beta_datum_switch_active = bits.beta_datum_active;
    fpu.is_locked = bits.fpu_locked;
    fpu.waveform_valid = bits.waveform_valid;
    fpu.waveform_ready = bits.waveform_ready;
    fpu.waveform_reversed = bits.waveform_reversed;
    fpu.direction_alpha = if bits.alpha_last_clockwise {
        DirectionState::Clockwise
    } else {
        DirectionState::AntiClockwise
    };
    fpu.direction_beta = if bits.beta_last_clockwise {
        DirectionState::Clockwise
    } else {
        DirectionState::AntiClockwise
    };
    if !matches!(frame.opcode_or_message, 9) {
        fpu.alpha_steps = unfold_alpha_steps(frame.alpha_steps_raw);
        fpu.beta_steps = unfold_beta_steps(frame.beta_steps_raw);
    }
    fpu.last_updated = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fpu::FpuStateArray;
    use crate::timeout_list::{TimeoutEntry, TimeoutList};

    fn make_frame(errcode: u8, alpha_raw: u16, beta_raw: u16) -> ResponseFrame {
        ResponseFrame {
            fpu_id: 0,
            opcode_or_message: Opcode::PingFpu as u8,
            status_word: 0,
            errcode: MocErrCode::from_byte(errcode),
            alpha_steps_raw: alpha_raw,
            beta_steps_raw: beta_raw,
        }
    }

    #[test]
    fn ping_response_clears_pending_and_timeout() {
        let grid = FpuStateArray::new(1);
        let mut timeouts = TimeoutList::new();
        let now = Instant::now();
        grid.set_pending_command(0, Opcode::PingFpu, now + std::time::Duration::from_secs(1), &mut timeouts);
        assert_eq!(timeouts.len(), 1);
        let frame = make_frame(0x00, 100, 200);
        dispatch_response(Opcode::PingFpu, &frame, &grid, &mut timeouts, now);
        assert_eq!(timeouts.len(), 0);
        let state = grid.get_grid_state();
        assert!(state.fpus[0].ping_ok);
    }

    #[test]
    fn collision_errcode_sets_obstacle_error_state() {
        let grid = FpuStateArray::new(1);
        let mut timeouts = TimeoutList::new();
        let frame = make_frame(0x01, 0, 0);
        dispatch_response(Opcode::ExecuteMotion, &frame, &grid, &mut timeouts, Instant::now());
        let state = grid.get_grid_state();
        assert_eq!(state.fpus[0].state, FpuStateKind::ObstacleError);
        assert!(state.fpus[0].beta_collision);
    }

    #[test]
    fn config_motion_success_counts_segments_and_waits_for_last_entry() {
        let grid = FpuStateArray::new(1);
        let mut timeouts = TimeoutList::new();

        let mut mid_entry = make_frame(0x00, 0, 0);
        mid_entry.opcode_or_message = Opcode::ConfigMotion as u8;
        dispatch_response(Opcode::ConfigMotion, &mid_entry, &grid, &mut timeouts, Instant::now());
        let state = grid.get_grid_state();
        assert_eq!(state.fpus[0].num_waveform_segments, 1);
        assert_eq!(state.fpus[0].state, FpuStateKind::Loading);

        let mut last_entry = make_frame(0x00, 0, 0);
        last_entry.opcode_or_message = Opcode::ConfigMotion as u8;
        last_entry.status_word = 1 << 9; // WAVEFORM_READY
        dispatch_response(Opcode::ConfigMotion, &last_entry, &grid, &mut timeouts, Instant::now());
        let state = grid.get_grid_state();
        assert_eq!(state.fpus[0].num_waveform_segments, 2);
        assert_eq!(state.fpus[0].state, FpuStateKind::ReadyForward);
        assert!(state.fpus[0].waveform_ready);
    }

    #[test]
    fn finished_datum_aliases_step_fields_to_deviation() {
        let grid = FpuStateArray::new(1);
        let mut timeouts = TimeoutList::new();
        let mut frame = make_frame(0x00, 5, 7);
        frame.opcode_or_message = 26; // CMSG_FINISHED_DATUM
        dispatch_spontaneous(crate::command::SpontaneousMessage::FinishedDatum, &frame, &grid);
        let state = grid.get_grid_state();
        assert_eq!(state.fpus[0].alpha_steps, 0);
        assert_eq!(state.fpus[0].alpha_deviation, 5);
        assert_eq!(state.fpus[0].beta_deviation, 7);
        assert_eq!(state.fpus[0].state, FpuStateKind::AtDatum);
    }
}
