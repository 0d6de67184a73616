// Message framing for the hub link.
//
// Two wire shapes, picked by the transport's payload ceiling:
//  - Lines: newline-terminated JSON, one message per line (USB serial).
//  - LengthPrefixed: `MSG:<decimal-length>|` then exactly that many payload
//    bytes, reassembled across arbitrarily small transport chunks
//    (MTU-limited BLE links).
//
// The framer is purely mechanical: it hands out complete payload byte
// slices and leaves JSON parsing to the protocol module. Callers inject
// `Instant`s so stall recovery is testable without sleeping.

use std::time::{Duration, Instant};

use crate::error::FramingError;

/// Literal prefix of a length-prefixed frame header.
const FRAME_HEADER_PREFIX: &[u8] = b"MSG:";

/// Cap on the decimal digits in a frame length. Anything longer is treated
/// as line noise, not a frame header.
const MAX_LENGTH_DIGITS: usize = 7;

/// Wire shape for the runtime command channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireShape {
    /// Newline-delimited messages (high-MTU links).
    Lines,
    /// `MSG:<len>|` framed messages (MTU-limited links).
    LengthPrefixed,
}

/// Build the on-wire bytes for one framed payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(FRAME_HEADER_PREFIX);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b'|');
    out.extend_from_slice(payload);
    out
}

// ============================================================================
// Internal framers
// ============================================================================

trait FramerImpl {
    fn feed(&mut self, data: &[u8], now: Instant) -> Vec<Vec<u8>>;
}

/// Newline framer. Carriage returns before the newline are stripped.
struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    fn new() -> Self {
        LineFramer { buffer: Vec::new() }
    }
}

impl FramerImpl for LineFramer {
    fn feed(&mut self, data: &[u8], _now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.buffer);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if !line.is_empty() {
                    out.push(line);
                }
            } else {
                self.buffer.push(byte);
            }
        }
        out
    }
}

/// Reassembly state for the length-prefixed shape.
enum MsgState {
    AwaitingHeader,
    AccumulatingPayload {
        expected: usize,
        payload: Vec<u8>,
        last_fragment_at: Instant,
    },
}

/// `MSG:<len>|` framer.
///
/// Bytes that do not form a valid header are debug output from the hub
/// firmware and are dropped silently. A transmitter that stalls
/// mid-payload for longer than `frame_timeout` loses the partial frame and
/// the receiver goes back to hunting for a header.
struct MsgFramer {
    state: MsgState,
    header: Vec<u8>,
    frame_timeout: Duration,
}

impl MsgFramer {
    fn new(frame_timeout: Duration) -> Self {
        MsgFramer {
            state: MsgState::AwaitingHeader,
            header: Vec::new(),
            frame_timeout,
        }
    }

    /// Try to consume a complete `MSG:<len>|` header from the front of
    /// `self.header`. Returns the payload length and removes the header
    /// bytes on success. Noise before the prefix is discarded.
    fn take_header(&mut self) -> Option<usize> {
        loop {
            // Discard leading bytes that cannot start a header
            let start = find_prefix_start(&self.header);
            if start > 0 {
                self.header.drain(..start);
            }
            if self.header.len() < FRAME_HEADER_PREFIX.len() {
                return None; // could still be a partial "MSG:"
            }

            // Scan the digits after the prefix
            let digits_start = FRAME_HEADER_PREFIX.len();
            let mut idx = digits_start;
            while idx < self.header.len() && self.header[idx].is_ascii_digit() {
                idx += 1;
            }

            let digit_count = idx - digits_start;
            if digit_count > MAX_LENGTH_DIGITS {
                // Not a real header - skip the prefix and rescan
                tlog!("[framing] {}, dropping noise", FramingError::TruncatedHeader);
                self.header.drain(..FRAME_HEADER_PREFIX.len());
                continue;
            }
            if idx >= self.header.len() {
                return None; // header still incomplete
            }
            if self.header[idx] != b'|' || digit_count == 0 {
                // Malformed header - noise. Skip the prefix and rescan.
                tlog!("[framing] {}, dropping noise", FramingError::TruncatedHeader);
                self.header.drain(..FRAME_HEADER_PREFIX.len());
                continue;
            }

            let len_str = std::str::from_utf8(&self.header[digits_start..idx])
                .expect("digits are valid UTF-8");
            let expected: usize = match len_str.parse() {
                Ok(n) => n,
                Err(_) => {
                    self.header.drain(..FRAME_HEADER_PREFIX.len());
                    continue;
                }
            };

            self.header.drain(..=idx);
            return Some(expected);
        }
    }
}

/// Index of the first byte that could begin `MSG:` (handles a partial
/// prefix at the end of the buffer).
fn find_prefix_start(buf: &[u8]) -> usize {
    for start in 0..buf.len() {
        let window = &buf[start..];
        let check_len = window.len().min(FRAME_HEADER_PREFIX.len());
        if window[..check_len] == FRAME_HEADER_PREFIX[..check_len] {
            return start;
        }
    }
    buf.len()
}

impl FramerImpl for MsgFramer {
    fn feed(&mut self, data: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        // Stall recovery: a payload that went quiet for too long is dropped
        // before the new fragment is considered, so the new bytes start a
        // fresh header scan.
        if let MsgState::AccumulatingPayload {
            last_fragment_at, ..
        } = &self.state
        {
            if now.duration_since(*last_fragment_at) > self.frame_timeout {
                // Recovered locally; never surfaced to the consumer
                tlog!("[framing] {}, resetting", FramingError::PayloadTimeout);
                self.state = MsgState::AwaitingHeader;
            }
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            match &mut self.state {
                MsgState::AwaitingHeader => {
                    self.header.extend_from_slice(remaining);
                    remaining = &[];
                    if let Some(expected) = self.take_header() {
                        let leftover = std::mem::take(&mut self.header);
                        if expected == 0 {
                            out.push(Vec::new());
                        } else {
                            self.state = MsgState::AccumulatingPayload {
                                expected,
                                payload: Vec::with_capacity(expected),
                                last_fragment_at: now,
                            };
                        }
                        // Bytes that arrived in the same chunk as the header
                        // belong to the payload (or the next frame).
                        out.extend(self.feed(&leftover, now));
                    }
                }
                MsgState::AccumulatingPayload {
                    expected,
                    payload,
                    last_fragment_at,
                } => {
                    *last_fragment_at = now;
                    let needed = *expected - payload.len();
                    let take = needed.min(remaining.len());
                    payload.extend_from_slice(&remaining[..take]);
                    remaining = &remaining[take..];

                    if payload.len() == *expected {
                        out.push(std::mem::take(payload));
                        self.state = MsgState::AwaitingHeader;
                    }
                }
            }
        }

        out
    }
}

// ============================================================================
// Public HubFramer
// ============================================================================

/// Stateful reassembler for the runtime command channel.
pub struct HubFramer {
    inner: Box<dyn FramerImpl + Send>,
    shape: WireShape,
}

impl HubFramer {
    pub fn new(shape: WireShape, frame_timeout: Duration) -> Self {
        let inner: Box<dyn FramerImpl + Send> = match shape {
            WireShape::Lines => Box::new(LineFramer::new()),
            WireShape::LengthPrefixed => Box::new(MsgFramer::new(frame_timeout)),
        };
        HubFramer { inner, shape }
    }

    pub fn shape(&self) -> WireShape {
        self.shape
    }

    /// Feed raw transport bytes. Returns every complete message payload
    /// finished by this chunk, in arrival order.
    pub fn feed(&mut self, data: &[u8], now: Instant) -> Vec<Vec<u8>> {
        self.inner.feed(data, now)
    }

    /// Encode one outbound payload for this wire shape.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        match self.shape {
            WireShape::Lines => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.extend_from_slice(payload);
                out.push(b'\n');
                out
            }
            WireShape::LengthPrefixed => encode_frame(payload),
        }
    }
}
