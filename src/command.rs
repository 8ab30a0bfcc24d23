//! C2 — CAN Command Objects (spec §4.2, §6).
//!
//! The source represents commands as a class hierarchy dispatched through
//! virtual methods; per the teacher's preference for sum types over opcode
//! tags (e.g. `SemOsError`'s flat enum-of-variants), this is a single enum
//! with an opcode-keyed lookup table for the per-opcode metadata
//! (priority/timeout/broadcast/expects-response), grounded in
//! `original_source/include/ethercan/E_CAN_COMMAND.h`.

use std::time::Duration;

use crate::config::ProtocolVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    ConfigMotion = 1,
    ExecuteMotion = 2,
    AbortMotion = 3,
    // v1 only: GetStepsAlpha = 4, GetStepsBeta = 5
    LockUnit = 4,
    UnlockUnit = 5,
    ReadRegister = 6,
    PingFpu = 7,
    ResetFpu = 8,
    FindDatum = 9,
    ResetStepCounter = 10,
    RepeatMotion = 11,
    ReverseMotion = 12,
    EnableBetaCollisionProtection = 13,
    FreeBetaCollision = 14,
    SetUStepLevel = 15,
    GetFirmwareVersion = 16,
    CheckIntegrity = 17,
    FreeAlphaLimitBreach = 18,
    EnableAlphaLimitProtection = 19,
    SetTicksPerSegment = 20,
    SetStepsPerSegment = 21,
    EnableMove = 22,
    ReadSerialNumber = 23,
    WriteSerialNumber = 24,
}

/// Spontaneous messages (spec §6) — not responses to an outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpontaneousMessage {
    FinishedMotion = 25,
    FinishedDatum = 26,
    WarnCollisionBeta = 27,
    WarnLimitAlpha = 28,
    WarnTimeoutDatum = 29,
    WarnCanOverflow = 30,
}

pub const COMMAND_CODE_MASK: u8 = 0x1f;

impl Opcode {
    /// CAN message priority (spec §4.2): lower value = more urgent.
    /// Protocol v1 hard-wires every message's priority field to zero.
    pub fn priority(self, version: ProtocolVersion) -> u8 {
        if version == ProtocolVersion::V1 {
            return 0;
        }
        match self {
            Opcode::AbortMotion | Opcode::ExecuteMotion | Opcode::FindDatum => 3,
            Opcode::LockUnit
            | Opcode::UnlockUnit
            | Opcode::FreeBetaCollision
            | Opcode::FreeAlphaLimitBreach => 4,
            Opcode::ResetFpu
            | Opcode::ResetStepCounter
            | Opcode::EnableBetaCollisionProtection
            | Opcode::EnableAlphaLimitProtection
            | Opcode::CheckIntegrity
            | Opcode::EnableMove => 5,
            Opcode::ConfigMotion
            | Opcode::RepeatMotion
            | Opcode::ReverseMotion
            | Opcode::GetFirmwareVersion
            | Opcode::ReadRegister
            | Opcode::SetUStepLevel
            | Opcode::ReadSerialNumber
            | Opcode::WriteSerialNumber
            | Opcode::PingFpu
            | Opcode::SetTicksPerSegment
            | Opcode::SetStepsPerSegment => 6,
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            Opcode::FindDatum => Duration::from_secs(60),
            Opcode::ConfigMotion => Duration::from_millis(500),
            Opcode::ExecuteMotion => Duration::from_secs(40),
            Opcode::PingFpu => Duration::from_millis(500),
            Opcode::AbortMotion => Duration::from_secs(2),
            _ => Duration::from_secs(20),
        }
    }

    /// `doBroadcast` capability (spec §4.9): these opcodes are sent once
    /// per gateway as a CAN-id-zero broadcast rather than fanned out
    /// per-FPU.
    pub fn is_broadcastable(self) -> bool {
        matches!(self, Opcode::AbortMotion | Opcode::ExecuteMotion | Opcode::FindDatum)
    }

    pub fn expects_response(self) -> bool {
        // Every command in this driver expects an ack/nak except the
        // fire-and-forget debug opcodes that the original marks
        // "unconfirmed"; all opcodes modeled here expect one.
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDirection {
    AntiClockwise = 0,
    Clockwise = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatumOptions {
    pub skip_alpha: bool,
    pub skip_beta: bool,
    pub auto: bool,
    pub anti_clockwise: bool,
    pub timeout_disable: bool,
}

impl Default for DatumOptions {
    fn default() -> Self {
        Self {
            skip_alpha: false,
            skip_beta: false,
            auto: true,
            anti_clockwise: false,
            timeout_disable: false,
        }
    }
}

/// One (alpha_steps, beta_steps) motion segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveformSegment {
    pub alpha_steps: i16,
    pub beta_steps: i16,
    pub alpha_pause: bool,
    pub beta_pause: bool,
    pub alpha_clockwise: bool,
    pub beta_clockwise: bool,
}

/// Polymorphic CAN command payload. One variant per spec §4.2 opcode
/// family; `opcode()` recovers the dispatch tag.
#[derive(Debug, Clone, PartialEq)]
pub enum CanCommand {
    ConfigMotion {
        segments: Vec<WaveformSegment>,
        first_entry: bool,
        last_entry: bool,
    },
    ExecuteMotion,
    AbortMotion,
    FindDatum(DatumOptions),
    PingFpu,
    ResetFpu,
    ReadRegister { register: u16 },
    ReadSerialNumber,
    WriteSerialNumber { serial: [u8; 5] },
    RepeatMotion,
    ReverseMotion,
    FreeBetaCollision { direction: RequestDirection },
    EnableBetaCollisionProtection,
    FreeAlphaLimitBreach { direction: RequestDirection },
    EnableAlphaLimitProtection,
    SetUStepLevel { level: u8 },
    LockUnit,
    UnlockUnit,
    ResetStepCounter,
    GetFirmwareVersion,
    CheckIntegrity,
    SetTicksPerSegment { ticks: u16 },
    SetStepsPerSegment { steps: u16 },
    EnableMove,
}

impl CanCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            CanCommand::ConfigMotion { .. } => Opcode::ConfigMotion,
            CanCommand::ExecuteMotion => Opcode::ExecuteMotion,
            CanCommand::AbortMotion => Opcode::AbortMotion,
            CanCommand::FindDatum(_) => Opcode::FindDatum,
            CanCommand::PingFpu => Opcode::PingFpu,
            CanCommand::ResetFpu => Opcode::ResetFpu,
            CanCommand::ReadRegister { .. } => Opcode::ReadRegister,
            CanCommand::ReadSerialNumber => Opcode::ReadSerialNumber,
            CanCommand::WriteSerialNumber { .. } => Opcode::WriteSerialNumber,
            CanCommand::RepeatMotion => Opcode::RepeatMotion,
            CanCommand::ReverseMotion => Opcode::ReverseMotion,
            CanCommand::FreeBetaCollision { .. } => Opcode::FreeBetaCollision,
            CanCommand::EnableBetaCollisionProtection => Opcode::EnableBetaCollisionProtection,
            CanCommand::FreeAlphaLimitBreach { .. } => Opcode::FreeAlphaLimitBreach,
            CanCommand::EnableAlphaLimitProtection => Opcode::EnableAlphaLimitProtection,
            CanCommand::SetUStepLevel { .. } => Opcode::SetUStepLevel,
            CanCommand::LockUnit => Opcode::LockUnit,
            CanCommand::UnlockUnit => Opcode::UnlockUnit,
            CanCommand::ResetStepCounter => Opcode::ResetStepCounter,
            CanCommand::GetFirmwareVersion => Opcode::GetFirmwareVersion,
            CanCommand::CheckIntegrity => Opcode::CheckIntegrity,
            CanCommand::SetTicksPerSegment { .. } => Opcode::SetTicksPerSegment,
            CanCommand::SetStepsPerSegment { .. } => Opcode::SetStepsPerSegment,
            CanCommand::EnableMove => Opcode::EnableMove,
        }
    }

    /// CAN identifier: `(priority << 7) | can_id` for unicast, 0 for a
    /// gateway-wide broadcast (spec §4.2, §6).
    pub fn can_identifier(&self, can_id: u8, version: ProtocolVersion, broadcast: bool) -> u16 {
        if broadcast {
            return 0;
        }
        ((self.opcode().priority(version) as u16) << 7) | can_id as u16
    }

    /// Serializes the opcode-specific payload body (everything after
    /// `[bus_id][can_id_lo][can_id_hi]`), at most 8 data bytes.
    pub fn serialize_body(&self) -> Vec<u8> {
        let op = self.opcode() as u8;
        match self {
            CanCommand::ConfigMotion {
                segments,
                first_entry,
                last_entry,
            } => {
                let mut body = vec![op, encode_entry_flags(*first_entry, *last_entry)];
                // Only one segment is serialized per CAN frame; the caller
                // (AsyncDriver) emits one ConfigMotion command per segment.
                let seg = segments.first().copied().unwrap_or(WaveformSegment {
                    alpha_steps: 0,
                    beta_steps: 0,
                    alpha_pause: false,
                    beta_pause: false,
                    alpha_clockwise: true,
                    beta_clockwise: true,
                });
                body.extend_from_slice(&encode_step_field(
                    seg.alpha_steps,
                    seg.alpha_pause,
                    seg.alpha_clockwise,
                ));
                body.extend_from_slice(&encode_step_field(
                    seg.beta_steps,
                    seg.beta_pause,
                    seg.beta_clockwise,
                ));
                body
            }
            CanCommand::FindDatum(opts) => {
                let mut flags = 0u8;
                if opts.skip_alpha {
                    flags |= 1 << 0;
                }
                if opts.skip_beta {
                    flags |= 1 << 1;
                }
                if opts.auto {
                    flags |= 1 << 2;
                }
                if opts.anti_clockwise {
                    flags |= 1 << 3;
                }
                if opts.timeout_disable {
                    flags |= 1 << 4;
                }
                vec![op, flags]
            }
            CanCommand::ReadRegister { register } => {
                vec![op, (*register & 0xff) as u8, (*register >> 8) as u8]
            }
            CanCommand::WriteSerialNumber { serial } => {
                let mut body = vec![op];
                body.extend_from_slice(serial);
                body
            }
            CanCommand::FreeBetaCollision { direction } | CanCommand::FreeAlphaLimitBreach { direction } => {
                vec![op, *direction as u8]
            }
            CanCommand::SetUStepLevel { level } => vec![op, *level],
            CanCommand::SetTicksPerSegment { ticks } => {
                vec![op, (*ticks & 0xff) as u8, (*ticks >> 8) as u8]
            }
            CanCommand::SetStepsPerSegment { steps } => {
                vec![op, (*steps & 0xff) as u8, (*steps >> 8) as u8]
            }
            _ => vec![op],
        }
    }
}

fn encode_entry_flags(first: bool, last: bool) -> u8 {
    (first as u8) | ((last as u8) << 1)
}

/// Encodes one arm's step field: signed 14-bit magnitude in the low bits,
/// bit14 = pause, bit15 = clockwise direction (spec §4.2).
fn encode_step_field(steps: i16, pause: bool, clockwise: bool) -> [u8; 2] {
    let magnitude = (steps.unsigned_abs()) & 0x3fff;
    let mut word = magnitude;
    if pause {
        word |= 1 << 14;
    }
    if clockwise {
        word |= 1 << 15;
    }
    word.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_priority_is_always_zero() {
        for op in [Opcode::AbortMotion, Opcode::PingFpu, Opcode::ConfigMotion] {
            assert_eq!(op.priority(ProtocolVersion::V1), 0);
        }
    }

    #[test]
    fn v2_priority_table_matches_spec() {
        assert_eq!(Opcode::AbortMotion.priority(ProtocolVersion::V2), 3);
        assert_eq!(Opcode::ExecuteMotion.priority(ProtocolVersion::V2), 3);
        assert_eq!(Opcode::FindDatum.priority(ProtocolVersion::V2), 3);
        assert_eq!(Opcode::LockUnit.priority(ProtocolVersion::V2), 4);
        assert_eq!(Opcode::ResetFpu.priority(ProtocolVersion::V2), 5);
        assert_eq!(Opcode::CheckIntegrity.priority(ProtocolVersion::V2), 5);
        assert_eq!(Opcode::ConfigMotion.priority(ProtocolVersion::V2), 6);
        assert_eq!(Opcode::PingFpu.priority(ProtocolVersion::V2), 6);
    }

    #[test]
    fn can_identifier_unicast_vs_broadcast() {
        let cmd = CanCommand::AbortMotion;
        assert_eq!(cmd.can_identifier(5, ProtocolVersion::V2, true), 0);
        let id = cmd.can_identifier(5, ProtocolVersion::V2, false);
        assert_eq!(id, (3u16 << 7) | 5);
    }
}
