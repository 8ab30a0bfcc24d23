//! Error taxonomy (spec §7). One leaf enum per failure domain, unified
//! under [`DriverError`] at the public API boundary — the same shape as
//! the teacher's `SemOsError`, which wraps domain-specific detail behind
//! one `thiserror` enum with an `#[from] anyhow::Error` catch-all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("interface already initialized")]
    AlreadyInitialized,
    #[error("interface was never initialized")]
    NeverInitialized,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("too few gateways ({gateways}) for {num_fpus} configured FPUs")]
    TooFewGateways { gateways: usize, num_fpus: usize },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot open socket to gateway {gateway}: {source}")]
    CannotOpenSocket {
        gateway: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("no connection to gateway {0}")]
    NoConnection(usize),
    #[error("command timed out for FPU {fpu_id} ({opcode:?})")]
    CommandTimeout { fpu_id: u32, opcode: crate::command::Opcode },
    #[error("firmware CAN buffer overflow on FPU {0}")]
    CanOverflow(u32),
    #[error("socket failure: {0}")]
    SocketFailure(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("invalid FPU id {0}")]
    InvalidFpuId(u32),
    #[error("invalid parameter value: {0}")]
    InvalidValue(String),
    #[error("duplicate serial number {0}")]
    DuplicateSerialNumber(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaveformError {
    #[error("waveform has {sections} sections, maximum is {max}")]
    TooManySections { sections: usize, max: usize },
    #[error("waveform is ragged: FPU segment counts differ")]
    Ragged,
    #[error("segment {segment} step count {steps} exceeds MAX_STEPS {max}")]
    StepCountTooLarge { segment: usize, steps: i32, max: i32 },
    #[error("segment {segment} speed change invalid (|steps| {steps}, previous {previous})")]
    InvalidSpeedChange { segment: usize, steps: i32, previous: i32 },
    #[error("invalid tail segment: |steps| {steps} exceeds maximum start frequency bound {max}")]
    InvalidTail { steps: i32, max: i32 },
    #[error("first moving segment |steps| {steps} is below the minimum start frequency bound {min}")]
    InvalidStart { steps: i32, min: i32 },
    #[error("waveform addresses no FPUs")]
    Empty,
    #[error("FPU is not ready to accept a new waveform")]
    NotReady,
}

#[derive(Debug, Error)]
pub enum FpuStateError {
    #[error("FPU {0} is still busy with a pending command")]
    StillBusy(u32),
    #[error("FPU {0} is not initialized (never datumed)")]
    NotInitialized(u32),
    #[error("FPU(s) locked: {0:?}")]
    Locked(Vec<u32>),
    #[error("FPU {0} is in aborted state")]
    Aborted(u32),
    #[error("operation invalid for current state of FPU {fpu_id}: {state:?}")]
    InvalidForState { fpu_id: u32, state: crate::fpu::FpuStateKind },
}

#[derive(Debug, Error)]
pub enum MovementError {
    #[error("new collision on FPU {0}")]
    NewCollision(u32),
    #[error("unresolved collision on FPU {0}")]
    UnresolvedCollision(u32),
    #[error("alpha limit breach on FPU {0}")]
    AlphaLimitBreach(u32),
    #[error("alpha limit is hardware-protected on FPU {0}")]
    AlphaLimitProtected(u32),
    #[error("firmware datum search timed out on FPU {0}")]
    DatumTimeout(u32),
    #[error("step timing error on FPU {0}")]
    StepTimingError(u32),
    #[error("movement aborted on FPU {0}")]
    Aborted(u32),
    #[error("inconsistent step counter on FPU {0}")]
    InconsistentStepCounter(u32),
}

#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("proposed move for FPU {fpu_id} would breach its position envelope")]
    EnvelopeBreach { fpu_id: u32 },
    #[error("FPU {0} exceeded its maximum retry count and is locked for motion")]
    MaxRetriesExceeded(u32),
    #[error("persistence transaction failed: {0}")]
    Persistence(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("resource error: {0}")]
    Resource(String),
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
    #[error("operation not implemented in firmware for this protocol version")]
    FirmwareUnimplemented,
}

/// Wait timeout is soft at the interface boundary (spec §7) — it is not
/// part of `DriverError`, it is the `Err` arm of [`crate::fpu::WaitOutcome`]
/// only when a *hard* wait error (ASSERTION_FAILED) interrupts the wait.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    #[error(transparent)]
    Waveform(#[from] WaveformError),
    #[error(transparent)]
    FpuState(#[from] FpuStateError),
    #[error(transparent)]
    Movement(#[from] MovementError),
    #[error(transparent)]
    Protection(#[from] ProtectionError),
    #[error(transparent)]
    System(#[from] SystemError),
}

pub type Result<T> = std::result::Result<T, DriverError>;
