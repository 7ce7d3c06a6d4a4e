//! Packet framing: `$payload#cs`.
//!
//! The checksum is the 8-bit sum of the payload bytes as they appear on the
//! wire, i.e. after escaping. `#`, `$`, `*` and `}` are escaped as `}`
//! followed by the byte XORed with `0x20`.
//!
//! A single bit flip anywhere in the payload changes the sum and is rejected.
//! Corruptions that happen to preserve the sum modulo 256 (two compensating
//! flips, say) are accepted; the protocol offers nothing stronger.

use tracing::trace;

/// Out-of-band interrupt request (Ctrl-C).
pub const INTERRUPT: u8 = 0x03;

const START: u8 = b'$';
const END: u8 = b'#';
const ESCAPE: u8 = b'}';
const RLE: u8 = b'*';
const ESCAPE_XOR: u8 = 0x20;

/// Default upper bound on a single frame's unescaped payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 0x4000;

/// A decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Unescaped payload bytes.
    pub payload: Vec<u8>,
    /// Whether the transmitted checksum matched.
    pub valid: bool,
}

/// Something the decoder recognized in the byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A complete frame (valid or not).
    Packet(Packet),
    /// A raw `0x03` outside an escape sequence.
    Interrupt,
    /// `+` between frames.
    Ack,
    /// `-` between frames: the peer wants the last frame again.
    Nack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Payload,
    Escape,
    ChecksumHigh,
    ChecksumLow(u8),
}

/// Incremental frame decoder.
///
/// Bytes of an incomplete frame are kept across [`PacketDecoder::feed`]
/// calls, so a frame split over several transport reads decodes the same as
/// one delivered at once.
#[derive(Debug)]
pub struct PacketDecoder {
    state: State,
    payload: Vec<u8>,
    sum: u8,
    overflowed: bool,
    max_payload: usize,
}

impl PacketDecoder {
    /// Create a decoder with the default payload limit.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a decoder that rejects frames with more than `max_payload`
    /// unescaped payload bytes.
    pub fn with_limit(max_payload: usize) -> Self {
        Self {
            state: State::Idle,
            payload: Vec::new(),
            sum: 0,
            overflowed: false,
            max_payload,
        }
    }

    /// Whether no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Feed raw transport bytes, returning every event they complete.
    pub fn feed(&mut self, input: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        for &byte in input {
            if let Some(event) = self.push(byte) {
                events.push(event);
            }
        }
        events
    }

    /// Feed a single byte.
    pub fn push(&mut self, byte: u8) -> Option<Event> {
        match self.state {
            State::Idle => match byte {
                START => {
                    self.restart(State::Payload);
                    None
                }
                INTERRUPT => Some(Event::Interrupt),
                b'+' => Some(Event::Ack),
                b'-' => Some(Event::Nack),
                _ => {
                    trace!(byte, "discarding byte outside frame");
                    None
                }
            },
            State::Payload => match byte {
                END => {
                    self.state = State::ChecksumHigh;
                    None
                }
                START => {
                    trace!(len = self.payload.len(), "frame restarted before '#'");
                    self.restart(State::Payload);
                    None
                }
                INTERRUPT => {
                    trace!(len = self.payload.len(), "interrupt inside frame, dropping frame");
                    self.restart(State::Idle);
                    Some(Event::Interrupt)
                }
                ESCAPE => {
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = State::Escape;
                    None
                }
                _ => {
                    self.sum = self.sum.wrapping_add(byte);
                    self.store(byte);
                    None
                }
            },
            State::Escape => {
                // Escaped bytes may legitimately be 0x03 ('#' ^ 0x20).
                self.sum = self.sum.wrapping_add(byte);
                self.store(byte ^ ESCAPE_XOR);
                self.state = State::Payload;
                None
            }
            State::ChecksumHigh => match hex_digit(byte) {
                Some(high) => {
                    self.state = State::ChecksumLow(high);
                    None
                }
                None => Some(self.finish(None)),
            },
            State::ChecksumLow(high) => {
                let transmitted = hex_digit(byte).map(|low| (high << 4) | low);
                Some(self.finish(transmitted))
            }
        }
    }

    fn store(&mut self, byte: u8) {
        if self.payload.len() < self.max_payload {
            self.payload.push(byte);
        } else {
            self.overflowed = true;
        }
    }

    fn finish(&mut self, transmitted: Option<u8>) -> Event {
        let valid = !self.overflowed && transmitted == Some(self.sum);
        if !valid {
            trace!(
                computed = self.sum,
                ?transmitted,
                overflowed = self.overflowed,
                "rejecting frame"
            );
        }
        let payload = std::mem::take(&mut self.payload);
        self.restart(State::Idle);
        Event::Packet(Packet { payload, valid })
    }

    fn restart(&mut self, state: State) {
        self.state = state;
        self.payload.clear();
        self.sum = 0;
        self.overflowed = false;
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// 8-bit sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Escape the bytes that may not appear raw inside a frame.
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &byte in payload {
        if matches!(byte, START | END | RLE | ESCAPE) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Frame `payload` for transmission.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let body = escape(payload);
    let sum = checksum(&body);
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(START);
    frame.extend_from_slice(&body);
    frame.push(END);
    frame.extend_from_slice(format!("{sum:02x}").as_bytes());
    frame
}
