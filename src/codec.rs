//! C1 — Frame Codec (spec §4.1, §6).
//!
//! Wire format: `DLE STX <payload> DLE ETX`, with every `DLE` (0x10) byte
//! inside the payload doubled. Payload is `[bus_id: u8][can_id: u16 LE]
//! [data: 0..8 bytes]`, at most 11 bytes.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

pub const DLE: u8 = 0x10;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Payload longer than this is a protocol violation; the decoder aborts
/// the frame and logs rather than growing the buffer unboundedly.
pub const MAX_PAYLOAD_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Ok,
    WouldBlock,
    ConnectionLost,
    Assertion,
}

/// Byte-stuffs `payload` into the wire representation.
pub fn stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() * 2 + 4);
    out.push(DLE);
    out.push(STX);
    for &b in payload {
        out.push(b);
        if b == DLE {
            out.push(DLE);
        }
    }
    out.push(DLE);
    out.push(ETX);
    out
}

/// Decoder state machine over the {sync, dle} pair described in spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for `DLE STX` to start a frame.
    Idle,
    /// Inside a frame, last byte was not `DLE`.
    InFrame,
    /// Inside a frame, previous byte was `DLE` (dle-escape pending).
    InFrameDle,
    /// Outside a frame, previous byte was `DLE` (waiting for STX).
    IdleDle,
}

/// Per-socket decoder holding the residual read state across `poll` cycles.
pub struct FrameDecoder {
    state: DecodeState,
    buf: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            state: DecodeState::Idle,
            buf: Vec::with_capacity(MAX_PAYLOAD_LEN),
        }
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte; returns `Some(payload)` when a complete frame ends.
    /// Malformed frames and overflow are absorbed: the decoder resets to
    /// `Idle` and the caller is expected to log via the `None` path if it
    /// cares (see [`FrameDecoder::feed_logged`]).
    pub fn feed(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            DecodeState::Idle => {
                if byte == DLE {
                    self.state = DecodeState::IdleDle;
                }
            }
            DecodeState::IdleDle => {
                if byte == STX {
                    self.buf.clear();
                    self.state = DecodeState::InFrame;
                } else {
                    // Anything other than DLE STX aborts back to idle.
                    self.state = DecodeState::Idle;
                }
            }
            DecodeState::InFrame => {
                if byte == DLE {
                    self.state = DecodeState::InFrameDle;
                } else if self.buf.len() >= MAX_PAYLOAD_LEN {
                    // Overflow: abort frame.
                    self.state = DecodeState::Idle;
                } else {
                    self.buf.push(byte);
                }
            }
            DecodeState::InFrameDle => {
                if byte == ETX {
                    self.state = DecodeState::Idle;
                    return Some(std::mem::take(&mut self.buf));
                } else if byte == DLE {
                    // Escaped literal 0x10.
                    if self.buf.len() >= MAX_PAYLOAD_LEN {
                        self.state = DecodeState::Idle;
                    } else {
                        self.buf.push(DLE);
                        self.state = DecodeState::InFrame;
                    }
                } else {
                    // DLE followed by anything else aborts the frame.
                    self.state = DecodeState::Idle;
                }
            }
        }
        None
    }
}

/// Per-socket codec: owns the residual write buffer for partial sends and
/// the decoder for inbound bytes. One instance per gateway TCP connection.
pub struct SBuffer {
    decoder: FrameDecoder,
    write_residual: VecDeque<u8>,
    read_scratch: [u8; 4096],
}

impl Default for SBuffer {
    fn default() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            write_residual: VecDeque::new(),
            read_scratch: [0u8; 4096],
        }
    }
}

impl SBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_unsent_bytes(&self) -> usize {
        self.write_residual.len()
    }

    /// Encodes `payload` and attempts to send it, queuing on the residual
    /// buffer whatever the socket would not accept immediately.
    pub fn encode_and_send<W: Write>(&mut self, sock: &mut W, payload: &[u8]) -> SocketStatus {
        self.write_residual.extend(stuff(payload));
        self.send_pending(sock)
    }

    /// Flushes queued residual bytes; call on every writable-socket poll
    /// before dequeuing a new command (spec §4.8 TX loop).
    pub fn send_pending<W: Write>(&mut self, sock: &mut W) -> SocketStatus {
        while !self.write_residual.is_empty() {
            let (front, _) = self.write_residual.as_slices();
            match sock.write(front) {
                Ok(0) => return SocketStatus::ConnectionLost,
                Ok(n) => {
                    self.write_residual.drain(0..n);
                }
                Err(e) => return map_io_error(&e),
            }
        }
        SocketStatus::Ok
    }

    /// Non-blocking read; emits complete frames to `handler`. `handler`
    /// returns true to keep processing further frames already buffered.
    pub fn decode_and_process<R: Read>(
        &mut self,
        sock: &mut R,
        mut handler: impl FnMut(Vec<u8>),
    ) -> SocketStatus {
        loop {
            match sock.read(&mut self.read_scratch) {
                Ok(0) => return SocketStatus::ConnectionLost,
                Ok(n) => {
                    for &b in &self.read_scratch[..n] {
                        if let Some(frame) = self.decoder.feed(b) {
                            if frame.len() >= 3 {
                                handler(frame);
                            } else {
                                tracing::debug!(len = frame.len(), "dropped undersized frame");
                            }
                        }
                    }
                    if n < self.read_scratch.len() {
                        return SocketStatus::Ok;
                    }
                }
                Err(e) => return map_io_error(&e),
            }
        }
    }
}

fn map_io_error(e: &io::Error) -> SocketStatus {
    use io::ErrorKind::*;
    match e.kind() {
        WouldBlock | Interrupted => SocketStatus::WouldBlock,
        ConnectionReset | NotConnected | BrokenPipe | UnexpectedEof => SocketStatus::ConnectionLost,
        _ => SocketStatus::Assertion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut dec = FrameDecoder::new();
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(f) = dec.feed(b) {
                out.push(f);
            }
        }
        out
    }

    #[test]
    fn stuffed_dle_roundtrip() {
        let frames = decode_all(&[0x10, 0x02, 0x10, 0x10, 0x10, 0x03]);
        assert_eq!(frames, vec![vec![0x10]]);
    }

    #[test]
    fn undersized_frame_is_ignored_not_crashed() {
        let frames = decode_all(&[0x10, 0x02, 0x10, 0x03]);
        // `10 02 10 03` is DLE STX DLE ETX -- an empty payload frame.
        assert_eq!(frames, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let frames = decode_all(&[0xFF, 0xEE, 0x10, 0x02, 1, 2, 3, 0x10, 0x03]);
        assert_eq!(frames, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn invalid_post_dle_byte_aborts_frame() {
        // DLE STX 1 2 DLE <garbage> -- aborts, then a fresh DLE STX 5 DLE ETX completes.
        let frames = decode_all(&[0x10, 0x02, 1, 2, 0x10, 0xAA, 0x10, 0x02, 5, 0x10, 0x03]);
        assert_eq!(frames, vec![vec![5]]);
    }

    proptest::proptest! {
        #[test]
        fn encode_decode_roundtrip(payload in proptest::collection::vec(0u8..=255, 3..=11)) {
            let wire = stuff(&payload);
            let frames = decode_all(&wire);
            prop_assert_eq!(frames, vec![payload]);
        }

        #[test]
        fn every_dle_in_payload_is_doubled_on_wire(payload in proptest::collection::vec(0u8..=255, 0..=11)) {
            let wire = stuff(&payload);
            let body = &wire[2..wire.len() - 2];
            let dle_in_payload = payload.iter().filter(|&&b| b == DLE).count();
            let dle_on_wire = body.iter().filter(|&&b| b == DLE).count();
            prop_assert_eq!(dle_on_wire, dle_in_payload * 2);
        }
    }
}
