//! C8 — Gateway Driver (spec §4.8).
//!
//! One TX thread and one RX thread per gateway connection. The original
//! waits on `ppoll(sockets + eventfd)`; this crate has no single
//! equivalent, so the TX side blocks on `CommandQueue::wait_for_command`
//! (itself a `crossbeam_channel::Select`) and the RX side blocks on a
//! plain blocking socket read with a read timeout sized from the timeout
//! list's next deadline — the two halves run independently, the way
//! `sem_os_server`'s `OutboxDispatcher::run` is one autonomous loop per
//! background task rather than a single multiplexed reactor.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::{SBuffer, SocketStatus};
use crate::command::Opcode;
use crate::config::{BusAddress, DriverConfig};
use crate::devicelock::DeviceLock;
use crate::dispatch::{dispatch_response, dispatch_spontaneous, ResponseFrame};
use crate::error::{ConnectionError, Result};
use crate::fpu::{FpuStateArray, InterfaceState};
use crate::queue::CommandQueue;
use crate::timeout_list::TimeoutList;

use parking_lot::Mutex;

const RX_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Per-gateway TCP connection plus its framing buffer.
struct GatewayLink {
    stream: TcpStream,
    sbuffer: SBuffer,
}

/// Owns the socket set, the TX/RX thread handles, and the shared
/// `CommandQueue`/`FpuStateArray`/`TimeoutList` the threads coordinate
/// through. One instance per running driver process.
pub struct GatewayDriver {
    config: DriverConfig,
    queue: Arc<CommandQueue>,
    grid: Arc<FpuStateArray>,
    timeouts: Arc<Mutex<TimeoutList>>,
    links: Vec<Arc<Mutex<Option<GatewayLink>>>>,
    running: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
    _lock: Option<DeviceLock>,
}

impl GatewayDriver {
    pub fn new(config: DriverConfig, queue: Arc<CommandQueue>, grid: Arc<FpuStateArray>) -> Self {
        let num_gateways = config.gateway_addresses.len().max(1);
        Self {
            links: (0..num_gateways).map(|_| Arc::new(Mutex::new(None))).collect(),
            config,
            queue,
            grid,
            timeouts: Arc::new(Mutex::new(TimeoutList::new())),
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            _lock: None,
        }
    }

    /// Opens a socket to every configured gateway, acquires the host-scope
    /// advisory lock (spec §9 Open Question (b)), and spawns the TX/RX
    /// thread pair for each gateway.
    #[tracing::instrument(skip(self), fields(num_gateways = self.links.len()))]
    pub fn connect(&mut self) -> Result<()> {
        let lock = DeviceLock::acquire(&self.config.gateway_addresses)
            .map_err(|e| crate::error::SystemError::Resource(e.to_string()))?;
        self._lock = Some(lock);

        for (gw_idx, addr) in self.config.gateway_addresses.iter().enumerate() {
            let stream = connect_one(*addr)?;
            tracing::info!(gateway = gw_idx, %addr, "connected to gateway");
            *self.links[gw_idx].lock() = Some(GatewayLink {
                stream,
                sbuffer: SBuffer::new(),
            });
        }

        self.running.store(true, Ordering::SeqCst);
        for gw_idx in 0..self.links.len() {
            self.threads.push(self.spawn_tx_thread(gw_idx));
            self.threads.push(self.spawn_rx_thread(gw_idx));
        }
        self.grid.set_interface_state(InterfaceState::Connected);
        Ok(())
    }

    /// Shared handle onto the timeout list, for callers (the async driver)
    /// that need to register a deadline alongside a dispatched command.
    pub fn timeouts(&self) -> Arc<Mutex<TimeoutList>> {
        self.timeouts.clone()
    }

    pub fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for link in &self.links {
            *link.lock() = None;
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.grid.set_interface_state(InterfaceState::Unconnected);
        self._lock = None;
    }

    fn spawn_tx_thread(&self, gw_idx: usize) -> std::thread::JoinHandle<()> {
        let queue = self.queue.clone();
        let link = self.links[gw_idx].clone();
        let running = self.running.clone();
        let protocol_version = self.config.protocol_version;
        let min_fpu_repeat_delay = self.config.min_fpu_repeat_delay;
        let mut pending_requeue = Vec::new();

        spawn_with_priority_hint(format!("ethercan-tx-{gw_idx}"), move || {
            while running.load(Ordering::SeqCst) {
                if let Some(cmd) = pending_requeue.pop() {
                    send_command(&link, cmd, protocol_version);
                    std::thread::sleep(min_fpu_repeat_delay);
                    continue;
                }
                let mask = queue.wait_for_command(RX_POLL_INTERVAL);
                if mask & (1 << gw_idx) == 0 {
                    continue;
                }
                while let Some(cmd) = queue.dequeue(gw_idx) {
                    if !send_command(&link, cmd, protocol_version) {
                        tracing::warn!(gateway = gw_idx, "send failed, will requeue on next pass");
                    }
                }
            }
        })
    }

    fn spawn_rx_thread(&self, gw_idx: usize) -> std::thread::JoinHandle<()> {
        let link = self.links[gw_idx].clone();
        let running = self.running.clone();
        let grid = self.grid.clone();
        let timeouts = self.timeouts.clone();
        let protocol_version = self.config.protocol_version;

        spawn_with_priority_hint(format!("ethercan-rx-{gw_idx}"), move || {
            while running.load(Ordering::SeqCst) {
                let status = {
                    let mut guard = link.lock();
                    match guard.as_mut() {
                        Some(l) => {
                            let _ = l.stream.set_read_timeout(Some(RX_POLL_INTERVAL));
                            let grid = &grid;
                            let timeouts = &timeouts;
                            Some(l.sbuffer.decode_and_process(&mut l.stream, |payload| {
                                if payload.len() < 3 {
                                    return;
                                }
                                let bus = payload[0] as usize;
                                // The wire identifier packs `(priority << 7) | can_id`
                                // (see `CanCommand::can_identifier`); mask to the low 7
                                // bits to recover `can_id` alone, since a plain `as u8`
                                // truncation would leak the priority's bit 7 into it for
                                // any odd-priority opcode.
                                let can_id = (u16::from_le_bytes([payload[1], payload[2]]) & 0x7f) as u8;
                                let fpu_id = crate::config::fpu_id_from_bus_address(BusAddress {
                                    gateway: gw_idx,
                                    bus,
                                    can_id,
                                });
                                if let Some(frame) = ResponseFrame::parse(fpu_id, &payload[3..]) {
                                    handle_frame(&frame, grid, timeouts, protocol_version);
                                }
                            }))
                        }
                        None => None,
                    }
                };
                match status {
                    Some(SocketStatus::ConnectionLost) => {
                        // A lost connection is recoverable (spec §7):
                        // `AssertionFailed` is reserved for assertion-level
                        // logic errors that permanently refuse further
                        // commands, not for a dropped socket. Drop the
                        // link and keep looping so pending commands still
                        // age out through `process_timeouts` below instead
                        // of hanging forever on a dead connection.
                        tracing::warn!(gateway = gw_idx, "connection lost, marking link down");
                        *link.lock() = None;
                        grid.set_interface_state(InterfaceState::Unconnected);
                    }
                    Some(SocketStatus::Assertion) => {
                        tracing::error!(gateway = gw_idx, "unrecoverable socket error, refusing further commands");
                        *link.lock() = None;
                        grid.set_interface_state(InterfaceState::AssertionFailed);
                    }
                    None => std::thread::sleep(RX_POLL_INTERVAL),
                    _ => {}
                }
                let now = Instant::now();
                grid.process_timeouts(now, &mut timeouts.lock());
            }
        })
    }
}

fn handle_frame(
    frame: &ResponseFrame,
    grid: &FpuStateArray,
    timeouts: &Mutex<TimeoutList>,
    _version: crate::config::ProtocolVersion,
) {
    use crate::command::SpontaneousMessage;
    let code = frame.opcode_or_message;
    if let Some(message) = spontaneous_from_code(code) {
        dispatch_spontaneous(message, frame, grid);
        return;
    }
    if let Some(opcode) = opcode_from_code(code) {
        dispatch_response(opcode, frame, grid, &mut timeouts.lock(), Instant::now());
    } else {
        tracing::warn!(code, "unrecognised response/message code");
    }
    let _: Option<SpontaneousMessage> = None;
}

fn spontaneous_from_code(code: u8) -> Option<crate::command::SpontaneousMessage> {
    use crate::command::SpontaneousMessage::*;
    Some(match code {
        25 => FinishedMotion,
        26 => FinishedDatum,
        27 => WarnCollisionBeta,
        28 => WarnLimitAlpha,
        29 => WarnTimeoutDatum,
        30 => WarnCanOverflow,
        _ => return None,
    })
}

fn opcode_from_code(code: u8) -> Option<Opcode> {
    Some(match code {
        1 => Opcode::ConfigMotion,
        2 => Opcode::ExecuteMotion,
        3 => Opcode::AbortMotion,
        4 => Opcode::LockUnit,
        5 => Opcode::UnlockUnit,
        6 => Opcode::ReadRegister,
        7 => Opcode::PingFpu,
        8 => Opcode::ResetFpu,
        9 => Opcode::FindDatum,
        10 => Opcode::ResetStepCounter,
        11 => Opcode::RepeatMotion,
        12 => Opcode::ReverseMotion,
        13 => Opcode::EnableBetaCollisionProtection,
        14 => Opcode::FreeBetaCollision,
        15 => Opcode::SetUStepLevel,
        16 => Opcode::GetFirmwareVersion,
        17 => Opcode::CheckIntegrity,
        18 => Opcode::FreeAlphaLimitBreach,
        19 => Opcode::EnableAlphaLimitProtection,
        20 => Opcode::SetTicksPerSegment,
        21 => Opcode::SetStepsPerSegment,
        22 => Opcode::EnableMove,
        23 => Opcode::ReadSerialNumber,
        24 => Opcode::WriteSerialNumber,
        _ => return None,
    })
}

fn send_command(
    link: &Mutex<Option<GatewayLink>>,
    cmd: crate::queue::QueuedCommand,
    version: crate::config::ProtocolVersion,
) -> bool {
    let mut guard = link.lock();
    let Some(l) = guard.as_mut() else { return false };
    let broadcast = cmd.can_id == 0;
    let can_identifier = cmd.command.can_identifier(cmd.can_id, version, broadcast);
    let mut payload = Vec::with_capacity(11);
    payload.push(cmd.bus as u8);
    payload.extend_from_slice(&can_identifier.to_le_bytes());
    payload.extend_from_slice(&cmd.command.serialize_body());
    !matches!(
        l.sbuffer.encode_and_send(&mut l.stream, &payload),
        SocketStatus::ConnectionLost | SocketStatus::Assertion
    )
}

fn connect_one(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).map_err(|e| ConnectionError::CannotOpenSocket {
        gateway: 0,
        source: e,
    })?;
    stream.set_nodelay(true).map_err(ConnectionError::SocketFailure)?;
    Ok(stream)
}

/// Best-effort real-time scheduling hint for the TX/RX threads (spec
/// §4.8): the original requests `SCHED_FIFO`; Rust's `std::thread` has no
/// portable priority knob, so this only logs the intent and falls back to
/// a normal-priority thread everywhere — real priority elevation would
/// need a platform-specific crate the rest of this codebase doesn't carry.
fn spawn_with_priority_hint(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    tracing::debug!(thread = %name, "starting gateway I/O thread (real-time priority not requested on this platform)");
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .expect("failed to spawn gateway I/O thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_from_code_round_trips_known_opcodes() {
        assert_eq!(opcode_from_code(1), Some(Opcode::ConfigMotion));
        assert_eq!(opcode_from_code(9), Some(Opcode::FindDatum));
        assert_eq!(opcode_from_code(99), None);
    }

    #[test]
    fn spontaneous_from_code_identifies_message_ids() {
        assert!(spontaneous_from_code(26).is_some());
        assert!(opcode_from_code(26).is_none());
    }
}
