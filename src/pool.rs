//! C3 — Command Pool (spec §4.3).
//!
//! A fixed-size pre-allocated vector of command slots per opcode. Running
//! dry must never allocate or silently grow — it signals a logic error and
//! blocks the caller, the way the original's `provideInstance` blocks on a
//! condition variable. Modeled with `parking_lot::{Mutex, Condvar}`, the
//! idiomatic stand-in for the original's pthread primitives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::command::Opcode;

pub const MAX_SUB_COMMANDS: usize = 300;

/// Pool sizing per opcode family (spec §4.3).
pub fn pool_capacity(opcode: Opcode, num_fpus: usize) -> usize {
    match opcode {
        Opcode::ConfigMotion => MAX_SUB_COMMANDS * num_fpus,
        op if op.is_broadcastable() => 10,
        _ => 10 * num_fpus,
    }
}

struct Inner {
    available: HashMap<Opcode, usize>,
    capacity: HashMap<Opcode, usize>,
}

/// Thread-safe, mutex-protected, fixed-capacity command slot pool.
///
/// This models the pool as a capacity counter rather than literally
/// recycling boxed command objects (Rust's ownership makes "provide a
/// `Box<dyn Command>`, recycle it later" a move, not a borrow-and-return
/// cycle) — `provide_instance` returns an owned [`PooledCommand`] whose
/// `Drop` impl performs the recycle, so a leak is structurally impossible
/// and the pool only needs to track the outstanding count.
pub struct CommandPool {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

impl CommandPool {
    pub fn new(num_fpus: usize) -> Self {
        let mut capacity = HashMap::new();
        for &op in ALL_OPCODES {
            capacity.insert(op, pool_capacity(op, num_fpus));
        }
        let available = capacity.clone();
        Self {
            inner: Mutex::new(Inner { available, capacity }),
            not_empty: Condvar::new(),
        }
    }

    /// Blocks until a slot is free for `opcode`. A pool running dry for
    /// more than `warn_after` indicates a command leak and is logged at
    /// ERROR, not treated as fatal (the caller still gets its slot once
    /// one is recycled).
    pub fn provide_instance(self: &std::sync::Arc<Self>, opcode: Opcode) -> PooledCommand {
        let mut guard = self.inner.lock();
        let warn_after = Duration::from_secs(5);
        let start = Instant::now();
        loop {
            let avail = guard.available.entry(opcode).or_insert(0);
            if *avail > 0 {
                *avail -= 1;
                return PooledCommand {
                    pool: self.clone(),
                    opcode,
                };
            }
            if start.elapsed() > warn_after {
                tracing::error!(?opcode, "command pool exhausted — possible command leak");
            }
            self.not_empty.wait_for(&mut guard, Duration::from_millis(200));
        }
    }

    pub fn available(&self, opcode: Opcode) -> usize {
        *self.inner.lock().available.get(&opcode).unwrap_or(&0)
    }

    pub fn capacity(&self, opcode: Opcode) -> usize {
        *self.inner.lock().capacity.get(&opcode).unwrap_or(&0)
    }

    fn recycle(&self, opcode: Opcode) {
        let mut guard = self.inner.lock();
        let cap = *guard.capacity.get(&opcode).unwrap_or(&0);
        let avail = guard.available.entry(opcode).or_insert(0);
        *avail = (*avail + 1).min(cap);
        drop(guard);
        self.not_empty.notify_all();
    }
}

/// A borrowed slot. Returns to the pool automatically on drop — the Rust
/// analogue of "taken from C3 by caller, ... returned to C3" (spec §3).
pub struct PooledCommand {
    pool: std::sync::Arc<CommandPool>,
    opcode: Opcode,
}

impl Drop for PooledCommand {
    fn drop(&mut self) {
        self.pool.recycle(self.opcode);
    }
}

const ALL_OPCODES: &[Opcode] = &[
    Opcode::ConfigMotion,
    Opcode::ExecuteMotion,
    Opcode::AbortMotion,
    Opcode::LockUnit,
    Opcode::UnlockUnit,
    Opcode::ReadRegister,
    Opcode::PingFpu,
    Opcode::ResetFpu,
    Opcode::FindDatum,
    Opcode::ResetStepCounter,
    Opcode::RepeatMotion,
    Opcode::ReverseMotion,
    Opcode::EnableBetaCollisionProtection,
    Opcode::FreeBetaCollision,
    Opcode::SetUStepLevel,
    Opcode::GetFirmwareVersion,
    Opcode::CheckIntegrity,
    Opcode::FreeAlphaLimitBreach,
    Opcode::EnableAlphaLimitProtection,
    Opcode::SetTicksPerSegment,
    Opcode::SetStepsPerSegment,
    Opcode::EnableMove,
    Opcode::ReadSerialNumber,
    Opcode::WriteSerialNumber,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn broadcast_opcodes_get_fixed_capacity_of_ten() {
        assert_eq!(pool_capacity(Opcode::AbortMotion, 500), 10);
    }

    #[test]
    fn config_motion_scales_with_fpu_count_and_max_sub_commands() {
        assert_eq!(pool_capacity(Opcode::ConfigMotion, 4), MAX_SUB_COMMANDS * 4);
    }

    #[test]
    fn instance_returns_to_pool_on_drop() {
        let pool = Arc::new(CommandPool::new(2));
        let cap = pool.capacity(Opcode::PingFpu);
        assert_eq!(pool.available(Opcode::PingFpu), cap);
        {
            let _c = pool.provide_instance(Opcode::PingFpu);
            assert_eq!(pool.available(Opcode::PingFpu), cap - 1);
        }
        assert_eq!(pool.available(Opcode::PingFpu), cap);
    }
}
