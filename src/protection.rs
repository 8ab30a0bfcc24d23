//! C10 — Protection Layer (spec §4.10, §3).
//!
//! Owns the per-FPU position "envelope" (the known-safe alpha/beta range)
//! persisted across process restarts. Every motion command runs through
//! simulate → check-against-envelope → commit-widened-envelope → dispatch,
//! so a move that would leave the known-safe range is rejected before a
//! single CAN frame is sent (spec's "zero-dispatch-on-failure guarantee",
//! shared with C9). Grounded in `original_source/include/ProtectionDB.h`
//! (the envelope/counters persistence contract) and `FPUCounters.h` (the
//! 22-entry counter enumeration, §2 of SPEC_FULL.md).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ProtectionError, Result};

/// Mirrors `FpuCounterId` (original_source `FPUCounters.h`): indices are
/// part of the persisted format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CounterId {
    UnixTime = 0,
    TotalBetaSteps = 1,
    TotalAlphaSteps = 2,
    ExecutedWaveforms = 3,
    AlphaDirectionReversals = 4,
    BetaDirectionReversals = 5,
    SignAlphaLastDirection = 6,
    SignBetaLastDirection = 7,
    AlphaStarts = 8,
    BetaStarts = 9,
    Collisions = 10,
    LimitBreaches = 11,
    CanTimeout = 12,
    DatumTimeout = 13,
    MovementTimeout = 14,
    DatumCount = 15,
    AlphaAberrationCount = 16,
    BetaAberrationCount = 17,
    DatumSumAlphaAberration = 18,
    DatumSumBetaAberration = 19,
    DatumSqsumAlphaAberration = 20,
    DatumSqsumBetaAberration = 21,
}

pub const NUM_COUNTERS: usize = 22;

/// Per-FPU persisted counter block (spec §2 "FPUCounters").
#[derive(Debug, Clone, Copy)]
pub struct FpuCounters {
    pub values: [i64; NUM_COUNTERS],
}

impl Default for FpuCounters {
    fn default() -> Self {
        Self { values: [0; NUM_COUNTERS] }
    }
}

impl FpuCounters {
    pub fn get(&self, id: CounterId) -> i64 {
        self.values[id as usize]
    }

    pub fn increment(&mut self, id: CounterId, by: i64) {
        self.values[id as usize] += by;
    }

    pub fn set(&mut self, id: CounterId, value: i64) {
        self.values[id as usize] = value;
    }
}

/// Asymmetric alpha wire range (spec §3): raw values above 55535 unfold
/// negative, giving effective travel `[-10000, 55535]`.
const ALPHA_STEP_MIN: i32 = -10000;
const ALPHA_STEP_MAX: i32 = 55535;
/// Symmetric beta wire range (spec §3).
const BETA_STEP_MIN: i32 = -32768;
const BETA_STEP_MAX: i32 = 32767;

/// Known-safe step range for one arm, widened as movements complete
/// without incident and narrowed only by an explicit re-datum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub alpha_min: i32,
    pub alpha_max: i32,
    pub beta_min: i32,
    pub beta_max: i32,
}

impl Envelope {
    pub fn new_at_datum() -> Self {
        Self { alpha_min: 0, alpha_max: 0, beta_min: 0, beta_max: 0 }
    }

    /// The widest envelope a move failure can produce (spec §4.10: "widens
    /// the position envelope to the maximum possible value"). Motion stays
    /// blocked by [`EnvelopeRecord::locked_until_datum`], not by this range.
    pub fn max_possible() -> Self {
        Self { alpha_min: ALPHA_STEP_MIN, alpha_max: ALPHA_STEP_MAX, beta_min: BETA_STEP_MIN, beta_max: BETA_STEP_MAX }
    }

    pub fn contains(&self, alpha: i32, beta: i32) -> bool {
        (self.alpha_min..=self.alpha_max).contains(&alpha) && (self.beta_min..=self.beta_max).contains(&beta)
    }

    pub fn widened(&self, alpha: i32, beta: i32) -> Self {
        Self {
            alpha_min: self.alpha_min.min(alpha),
            alpha_max: self.alpha_max.max(alpha),
            beta_min: self.beta_min.min(beta),
            beta_max: self.beta_max.max(beta),
        }
    }
}

/// Which arm direction a failed move was travelling in when it failed,
/// for the per-direction retry counters `original_source/OLD_PARALLEL_DATA_STRUCTURES.C`
/// names `aretries_cw`/`aretries_acw`/`bretries_cw`/`bretries_acw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Clockwise,
    AntiClockwise,
}

#[derive(Debug, Clone)]
pub struct EnvelopeRecord {
    pub envelope: Envelope,
    pub counters: FpuCounters,
    /// Set on any collision, limit breach, datum timeout, or step-timing
    /// error; cleared only by a successful datum search (spec §4.10).
    /// While set, `check_motion` rejects every proposed move regardless of
    /// whether it would fit inside `envelope`.
    pub locked_until_datum: bool,
    pub max_alpha_retries: u32,
    pub max_beta_retries: u32,
    pub alpha_retry_count_cw: u32,
    pub alpha_retry_count_acw: u32,
    pub beta_retry_count_cw: u32,
    pub beta_retry_count_acw: u32,
}

impl EnvelopeRecord {
    fn bump_alpha(&mut self, direction: Option<Direction>) {
        match direction {
            Some(Direction::Clockwise) => self.alpha_retry_count_cw += 1,
            Some(Direction::AntiClockwise) => self.alpha_retry_count_acw += 1,
            None => {
                self.alpha_retry_count_cw += 1;
                self.alpha_retry_count_acw += 1;
            }
        }
    }

    fn bump_beta(&mut self, direction: Option<Direction>) {
        match direction {
            Some(Direction::Clockwise) => self.beta_retry_count_cw += 1,
            Some(Direction::AntiClockwise) => self.beta_retry_count_acw += 1,
            None => {
                self.beta_retry_count_cw += 1;
                self.beta_retry_count_acw += 1;
            }
        }
    }

    fn alpha_retries_exhausted(&self) -> bool {
        self.alpha_retry_count_cw >= self.max_alpha_retries || self.alpha_retry_count_acw >= self.max_alpha_retries
    }

    fn beta_retries_exhausted(&self) -> bool {
        self.beta_retry_count_cw >= self.max_beta_retries || self.beta_retry_count_acw >= self.max_beta_retries
    }
}

impl Default for EnvelopeRecord {
    fn default() -> Self {
        Self {
            envelope: Envelope::new_at_datum(),
            counters: FpuCounters::default(),
            locked_until_datum: false,
            max_alpha_retries: DEFAULT_MAX_RETRIES,
            max_beta_retries: DEFAULT_MAX_RETRIES,
            alpha_retry_count_cw: 0,
            alpha_retry_count_acw: 0,
            beta_retry_count_cw: 0,
            beta_retry_count_acw: 0,
        }
    }
}

/// Persistence seam the protection layer depends on — a trait object, not
/// a concrete KV crate, the way `sem_os_core::ports` keeps the server
/// logic independent of its storage backend.
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    async fn load(&self, serial_number: &str) -> anyhow::Result<Option<EnvelopeRecord>>;
    async fn store(&self, serial_number: &str, record: &EnvelopeRecord) -> anyhow::Result<()>;
}

/// In-memory `EnvelopeStore` used by tests and as a fallback when no LMDB
/// path is configured.
#[derive(Default)]
pub struct InMemoryEnvelopeStore {
    records: parking_lot::Mutex<HashMap<String, EnvelopeRecord>>,
}

#[async_trait]
impl EnvelopeStore for InMemoryEnvelopeStore {
    async fn load(&self, serial_number: &str) -> anyhow::Result<Option<EnvelopeRecord>> {
        Ok(self.records.lock().get(serial_number).cloned())
    }

    async fn store(&self, serial_number: &str, record: &EnvelopeRecord) -> anyhow::Result<()> {
        self.records.lock().insert(serial_number.to_string(), record.clone());
        Ok(())
    }
}

/// Default per-FPU `maxaretries`/`maxbretries` (spec §4.10) until a unit's
/// record overrides it via persistence.
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Owns one `EnvelopeRecord` per FPU serial number, loaded at connect time
/// and updated on every motion completion/failure.
pub struct ProtectionLayer {
    store: Arc<dyn EnvelopeStore>,
    records: parking_lot::Mutex<HashMap<u32, EnvelopeRecord>>,
    serials: parking_lot::Mutex<HashMap<u32, String>>,
}

impl ProtectionLayer {
    pub fn new(store: Arc<dyn EnvelopeStore>) -> Self {
        Self {
            store,
            records: parking_lot::Mutex::new(HashMap::new()),
            serials: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Loads (or initializes) the envelope record for `fpu_id`, keyed by
    /// its serial number (spec §6: `"{serial_number}#{field}"`-style key).
    pub async fn load_at_connect(&self, fpu_id: u32, serial_number: &str) -> Result<()> {
        let record = self
            .store
            .load(serial_number)
            .await
            .map_err(ProtectionError::Persistence)?
            .unwrap_or_default();
        self.records.lock().insert(fpu_id, record);
        self.serials.lock().insert(fpu_id, serial_number.to_string());
        Ok(())
    }

    /// Simulates a proposed move's final position and checks it against
    /// the stored envelope before any CAN frame is sent. Returns `Err` if
    /// the FPU is locked out pending a re-datum, has exceeded its
    /// directional retry budget, or the move would leave the known-safe
    /// range (spec §4.10's simulate/check step).
    pub fn check_motion(&self, fpu_id: u32, final_alpha: i32, final_beta: i32) -> Result<()> {
        let records = self.records.lock();
        let record = records.get(&fpu_id).cloned().unwrap_or_default();
        drop(records);

        if record.locked_until_datum {
            return Err(ProtectionError::MaxRetriesExceeded(fpu_id).into());
        }
        if record.alpha_retries_exhausted() || record.beta_retries_exhausted() {
            return Err(ProtectionError::MaxRetriesExceeded(fpu_id).into());
        }
        if !record.envelope.contains(final_alpha, final_beta) {
            return Err(ProtectionError::EnvelopeBreach { fpu_id }.into());
        }
        Ok(())
    }

    /// Widens the envelope to include a position actually reached after a
    /// successful move, and persists it (spec §4.10's commit step). Does
    /// not touch `locked_until_datum` — only a successful datum search
    /// ([`Self::commit_datum_success`]) re-tightens a locked-out envelope.
    pub async fn commit_success(&self, fpu_id: u32, alpha: i32, beta: i32) -> Result<()> {
        let updated = {
            let mut records = self.records.lock();
            let record = records.entry(fpu_id).or_default();
            record.envelope = record.envelope.widened(alpha, beta);
            record.counters.increment(CounterId::ExecutedWaveforms, 1);
            record.clone()
        };
        self.persist(fpu_id, &updated).await
    }

    /// Re-tightens the envelope around a position confirmed by a
    /// successful datum search, clears the failure lockout, and resets
    /// every directional retry counter (spec §4.10: "forbids further
    /// motion commands until the envelope is re-tightened by a successful
    /// datum search").
    pub async fn commit_datum_success(&self, fpu_id: u32, alpha: i32, beta: i32) -> Result<()> {
        let updated = {
            let mut records = self.records.lock();
            let record = records.entry(fpu_id).or_default();
            record.envelope = Envelope::new_at_datum().widened(alpha, beta);
            record.locked_until_datum = false;
            record.alpha_retry_count_cw = 0;
            record.alpha_retry_count_acw = 0;
            record.beta_retry_count_cw = 0;
            record.beta_retry_count_acw = 0;
            record.counters.increment(CounterId::DatumCount, 1);
            record.clone()
        };
        self.persist(fpu_id, &updated).await
    }

    /// On collision, limit breach, datum timeout, or step-timing error the
    /// envelope widens to the maximum possible value and every further
    /// motion command is refused until a datum search succeeds (spec
    /// §4.10), while the relevant directional retry counter and failure
    /// counter advance.
    pub async fn commit_failure(&self, fpu_id: u32, kind: FailureKind) -> Result<()> {
        let updated = {
            let mut records = self.records.lock();
            let record = records.entry(fpu_id).or_default();
            record.envelope = Envelope::max_possible();
            record.locked_until_datum = true;
            match kind {
                FailureKind::Collision { beta_direction } => {
                    record.bump_beta(beta_direction);
                    record.counters.increment(CounterId::Collisions, 1);
                }
                FailureKind::LimitBreach { alpha_direction } => {
                    record.bump_alpha(alpha_direction);
                    record.counters.increment(CounterId::LimitBreaches, 1);
                }
                FailureKind::DatumTimeout => {
                    record.counters.increment(CounterId::DatumTimeout, 1);
                }
                FailureKind::Timeout => {
                    record.counters.increment(CounterId::MovementTimeout, 1);
                }
                FailureKind::StepTimingError { alpha_direction, beta_direction } => {
                    record.bump_alpha(alpha_direction);
                    record.bump_beta(beta_direction);
                }
            }
            record.clone()
        };
        self.persist(fpu_id, &updated).await
    }

    async fn persist(&self, fpu_id: u32, record: &EnvelopeRecord) -> Result<()> {
        let serial = self.serials.lock().get(&fpu_id).cloned();
        if let Some(serial) = serial {
            self.store
                .store(&serial, record)
                .await
                .map_err(ProtectionError::Persistence)?;
        }
        Ok(())
    }

    pub fn counters(&self, fpu_id: u32) -> FpuCounters {
        self.records.lock().get(&fpu_id).map(|r| r.counters).unwrap_or_default()
    }
}

/// Reasons `commit_failure` can be called for (spec §4.10: "on collision,
/// limit breach, datum timeout, or step-timing error"). Directional
/// variants carry the arm's direction at the moment of failure, when
/// known, so the correct `_cw`/`_acw` counter advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Collision { beta_direction: Option<Direction> },
    LimitBreach { alpha_direction: Option<Direction> },
    DatumTimeout,
    Timeout,
    StepTimingError { alpha_direction: Option<Direction>, beta_direction: Option<Direction> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> ProtectionLayer {
        ProtectionLayer::new(Arc::new(InMemoryEnvelopeStore::default()))
    }

    #[tokio::test]
    async fn fresh_fpu_only_allows_the_datum_position() {
        let p = layer();
        p.load_at_connect(0, "SN001").await.unwrap();
        assert!(p.check_motion(0, 0, 0).is_ok());
        assert!(p.check_motion(0, 100, 0).is_err());
    }

    #[tokio::test]
    async fn successful_move_widens_envelope_for_next_check() {
        let p = layer();
        p.load_at_connect(0, "SN001").await.unwrap();
        p.commit_success(0, 500, 300).await.unwrap();
        assert!(p.check_motion(0, 500, 300).is_ok());
        assert!(p.check_motion(0, 0, 0).is_ok());
        assert!(p.check_motion(0, 501, 300).is_err());
    }

    #[tokio::test]
    async fn a_single_collision_locks_the_fpu_out_until_redatum() {
        let p = layer();
        p.load_at_connect(0, "SN001").await.unwrap();
        p.commit_success(0, 500, 300).await.unwrap();

        p.commit_failure(0, FailureKind::Collision { beta_direction: Some(Direction::Clockwise) }).await.unwrap();

        // Even a position well inside the pre-failure envelope is refused —
        // the lockout, not the envelope bounds, is what blocks motion here.
        let err = p.check_motion(0, 0, 0).unwrap_err();
        assert!(matches!(err, crate::error::DriverError::Protection(ProtectionError::MaxRetriesExceeded(0))));

        p.commit_datum_success(0, 0, 0).await.unwrap();
        assert!(p.check_motion(0, 0, 0).is_ok());
    }

    #[tokio::test]
    async fn directional_retry_counters_advance_independently() {
        let p = layer();
        p.load_at_connect(0, "SN001").await.unwrap();
        p.commit_failure(0, FailureKind::Collision { beta_direction: Some(Direction::Clockwise) }).await.unwrap();
        p.commit_failure(0, FailureKind::LimitBreach { alpha_direction: Some(Direction::AntiClockwise) }).await.unwrap();

        let record = p.records.lock().get(&0).cloned().unwrap();
        assert_eq!(record.beta_retry_count_cw, 1);
        assert_eq!(record.beta_retry_count_acw, 0);
        assert_eq!(record.alpha_retry_count_acw, 1);
        assert_eq!(record.alpha_retry_count_cw, 0);
    }

    #[tokio::test]
    async fn retry_maxima_reset_by_each_successful_redatum() {
        let p = layer();
        p.load_at_connect(0, "SN001").await.unwrap();
        {
            let mut records = p.records.lock();
            records.entry(0).or_default().max_beta_retries = 2;
        }
        for _ in 0..2 {
            p.commit_failure(0, FailureKind::Collision { beta_direction: Some(Direction::Clockwise) }).await.unwrap();
            p.commit_datum_success(0, 0, 0).await.unwrap();
        }
        // commit_datum_success resets counters, so the FPU is movable again
        // immediately after re-datum even though it has failed twice.
        assert!(p.check_motion(0, 0, 0).is_ok());
    }

    #[tokio::test]
    async fn envelope_survives_reload_through_store() {
        let store = Arc::new(InMemoryEnvelopeStore::default());
        let p1 = ProtectionLayer::new(store.clone());
        p1.load_at_connect(7, "SN777").await.unwrap();
        p1.commit_success(7, 42, 17).await.unwrap();

        let p2 = ProtectionLayer::new(store);
        p2.load_at_connect(7, "SN777").await.unwrap();
        assert!(p2.check_motion(7, 42, 17).is_ok());
    }
}
