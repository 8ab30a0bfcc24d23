//! C4 — Command Queue (spec §4.4).
//!
//! Per-gateway FIFO. The original wakes a `poll`-based TX thread via an
//! eventfd; the idiomatic Rust equivalent used throughout this crate is a
//! `crossbeam_channel` per gateway, which the TX thread waits on with
//! `Select` (see `gateway.rs`) exactly as the original waits on
//! `ppoll(sockets + eventfd)`.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::command::CanCommand;
use crate::pool::PooledCommand;

pub struct QueuedCommand {
    pub fpu_id: u32,
    pub can_id: u8,
    pub bus: usize,
    pub command: CanCommand,
    /// Keeps the pool slot alive until the command is consumed or dropped.
    pub _slot: Option<PooledCommand>,
}

/// One FIFO per gateway, plus a shared receiver the TX thread selects over.
pub struct CommandQueue {
    senders: Vec<Sender<QueuedCommand>>,
    receivers: Vec<Receiver<QueuedCommand>>,
}

impl CommandQueue {
    pub fn new(num_gateways: usize) -> Self {
        let mut senders = Vec::with_capacity(num_gateways);
        let mut receivers = Vec::with_capacity(num_gateways);
        for _ in 0..num_gateways {
            // Unbounded: backpressure is enforced by the command pool
            // (spec §5 "the pool size is the system's hard upper bound"),
            // not by the queue itself.
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        Self { senders, receivers }
    }

    pub fn num_gateways(&self) -> usize {
        self.senders.len()
    }

    /// Pushes to the back of `gateway`'s FIFO (spec P6: after `enqueue`
    /// returns, the command was consumed or is at the back of exactly one
    /// gateway's FIFO).
    pub fn enqueue(&self, gateway: usize, cmd: QueuedCommand) {
        self.senders[gateway]
            .send(cmd)
            .expect("gateway receiver dropped while driver alive");
    }

    pub fn dequeue(&self, gateway: usize) -> Option<QueuedCommand> {
        match self.receivers[gateway].try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Error-recovery requeue: a send failed mid-frame, so the command
    /// must go back to the *front*. `crossbeam_channel` has no FIFO-front
    /// push, so a requeue is modeled with a small side buffer the TX
    /// thread drains before calling `dequeue` again.
    pub fn requeue(&self, gateway: usize, pending: &mut Vec<QueuedCommand>, cmd: QueuedCommand) {
        let _ = gateway;
        pending.push(cmd);
    }

    pub fn receiver(&self, gateway: usize) -> &Receiver<QueuedCommand> {
        &self.receivers[gateway]
    }

    /// Blocks (up to `timeout`) for at least one gateway to have queued
    /// work, returning the bitmask of ready gateways — the Rust analogue
    /// of the original's `waitForCommand`, built on `Select` rather than
    /// condvar + eventfd.
    pub fn wait_for_command(&self, timeout: Duration) -> u64 {
        let mut sel = crossbeam_channel::Select::new();
        for rx in &self.receivers {
            sel.recv(rx);
        }
        match sel.ready_timeout(timeout) {
            Ok(_) => {
                let mut mask = 0u64;
                for (i, rx) in self.receivers.iter().enumerate() {
                    if !rx.is_empty() {
                        mask |= 1 << i;
                    }
                }
                mask
            }
            Err(_) => 0,
        }
    }

    /// Drains every gateway's FIFO, dropping the queued commands (their
    /// pool slots recycle via `Drop`). Used for emergency stop; spec §4.4
    /// requires this be called only from the control thread to avoid a
    /// deadlock against the pool's mutex.
    pub fn flush_to_pool(&self) -> usize {
        let mut drained = 0;
        for rx in &self.receivers {
            while rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        drained
    }
}
