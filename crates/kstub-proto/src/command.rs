//! Command parsing.
//!
//! [`Command::parse`] turns one decoded payload into a [`Command`]. Payloads
//! that are not part of the supported subset parse to
//! [`Command::Unsupported`], which the dispatcher answers with the empty
//! reply. A [`ParseError`] is reserved for recognized commands with broken
//! arguments.

use std::fmt;

use crate::thread::ThreadId;
use crate::{ParseError, Result, parse_hex_u64, parse_hex_usize};

/// Watchpoint access kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Read,
    Write,
    Access,
}

impl WatchKind {
    /// Stop-reply field naming a hit of this kind.
    pub const fn stop_field(self) -> &'static str {
        match self {
            Self::Read => "rwatch",
            Self::Write => "watch",
            Self::Access => "awatch",
        }
    }
}

/// The `type` field of `Z`/`z`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointType {
    Software,
    Hardware,
    Watch(WatchKind),
}

impl BreakpointType {
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Software),
            1 => Some(Self::Hardware),
            2 => Some(Self::Watch(WatchKind::Write)),
            3 => Some(Self::Watch(WatchKind::Read)),
            4 => Some(Self::Watch(WatchKind::Access)),
            _ => None,
        }
    }
}

/// Arguments of a `Z`/`z` packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub kind: BreakpointType,
    pub address: u64,
    /// Instruction length for breakpoints, watched byte count for watchpoints.
    pub length: usize,
}

/// `H` operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadOp {
    /// `Hg`: register and memory commands.
    General,
    /// `Hc`: step and continue commands.
    Continue,
}

/// What a resume-style command asks a thread to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeKind {
    Continue,
    Step,
    Stop,
}

/// One `vCont` action; `thread: None` is the default action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VContAction {
    pub kind: ResumeKind,
    pub thread: Option<ThreadId>,
}

/// JIT memory permissions, encoded as `rwx` characters on the wire.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Permissions(u8);

impl Permissions {
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXECUTE: Self = Self(4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Parse a permission string such as `rx` or `rwx`.
    pub fn parse(field: &[u8]) -> Result<Self> {
        let invalid = || ParseError::InvalidPermissions(String::from_utf8_lossy(field).into());
        if field.is_empty() {
            return Err(invalid());
        }
        field.iter().try_fold(Self::default(), |perms, &c| {
            let bit = match c {
                b'r' => Self::READ,
                b'w' => Self::WRITE,
                b'x' => Self::EXECUTE,
                _ => return Err(invalid()),
            };
            Ok(perms.union(bit))
        })
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |p: Self, c: char| if self.contains(p) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXECUTE, 'x')
        )
    }
}

/// A parsed debugger command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `?`
    HaltReason,
    /// `g`
    ReadRegisters,
    /// `G data`
    WriteRegisters(Vec<u8>),
    /// `p n`
    ReadRegister(usize),
    /// `m addr,len`
    ReadMemory { address: u64, length: usize },
    /// `M addr,len:data`
    WriteMemory { address: u64, data: Vec<u8> },
    /// `Z type,addr,kind`
    InsertBreakpoint(BreakpointSpec),
    /// `z type,addr,kind`
    RemoveBreakpoint(BreakpointSpec),
    /// `c [addr]` and `C sig[;addr]`
    Continue { address: Option<u64> },
    /// `s [addr]` and `S sig[;addr]`
    Step { address: Option<u64> },
    /// `vCont?`
    VContQuery,
    /// `vCont;action[:tid]...`
    VCont(Vec<VContAction>),
    /// `H op tid`
    SetThread { op: ThreadOp, thread: ThreadId },
    /// `T tid`
    ThreadAlive(ThreadId),
    /// `D`
    Detach,
    /// `k`
    Kill,
    /// `qSupported[:features]`
    Supported,
    /// `QStartNoAckMode`
    StartNoAckMode,
    /// `qAttached`
    Attached,
    /// `qC`
    CurrentThread,
    /// `qfThreadInfo`
    ThreadInfoFirst,
    /// `qsThreadInfo`
    ThreadInfoNext,
    /// `qThreadExtraInfo,tid`
    ThreadExtraInfo(ThreadId),
    /// `qOffsets`
    Offsets,
    /// `qXfer:features:read:annex:off,len`
    ReadFeatures { annex: String, offset: usize, length: usize },
    /// `qXfer:libraries:read::off,len`
    ReadLibraries { offset: usize, length: usize },
    /// `_M size,perms`
    AllocateMemory { size: usize, permissions: Permissions },
    /// `_m addr`
    DeallocateMemory { address: u64 },
    /// Anything outside the supported subset.
    Unsupported,
}

impl Command {
    /// Parse one unescaped payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let Some((&letter, args)) = payload.split_first() else {
            return Ok(Self::Unsupported);
        };
        match letter {
            b'?' => Ok(Self::HaltReason),
            b'g' if args.is_empty() => Ok(Self::ReadRegisters),
            b'G' => Ok(Self::WriteRegisters(hex::decode(args)?)),
            b'p' => Ok(Self::ReadRegister(parse_hex_usize(args, "register")?)),
            b'm' => {
                let (address, length) = split_pair(args, b',', "address", "length")?;
                Ok(Self::ReadMemory {
                    address: parse_hex_u64(address, "address")?,
                    length: parse_hex_usize(length, "length")?,
                })
            }
            b'M' => parse_write_memory(args),
            b'Z' | b'z' => parse_breakpoint(letter, args),
            b'c' | b's' => {
                let address = optional_address(args)?;
                Ok(if letter == b'c' {
                    Self::Continue { address }
                } else {
                    Self::Step { address }
                })
            }
            b'C' | b'S' => {
                // The signal is not delivered anywhere; only the address matters.
                let address = match split_once(args, b';') {
                    Some((_, address)) => Some(parse_hex_u64(address, "address")?),
                    None => None,
                };
                Ok(if letter == b'C' {
                    Self::Continue { address }
                } else {
                    Self::Step { address }
                })
            }
            b'v' => parse_v(args),
            b'H' => parse_set_thread(args),
            b'T' => Ok(Self::ThreadAlive(ThreadId::parse(args)?)),
            b'D' => Ok(Self::Detach),
            b'k' => Ok(Self::Kill),
            b'q' => parse_query(args),
            b'Q' if args == b"StartNoAckMode" => Ok(Self::StartNoAckMode),
            b'_' => parse_jit(args),
            _ => Ok(Self::Unsupported),
        }
    }
}

fn split_once(bytes: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let index = bytes.iter().position(|&b| b == sep)?;
    Some((&bytes[..index], &bytes[index + 1..]))
}

fn split_pair<'a>(
    bytes: &'a [u8],
    sep: u8,
    first: &'static str,
    second: &'static str,
) -> Result<(&'a [u8], &'a [u8])> {
    let (a, b) = split_once(bytes, sep).ok_or(ParseError::MissingField(second))?;
    if a.is_empty() {
        return Err(ParseError::MissingField(first));
    }
    Ok((a, b))
}

fn optional_address(args: &[u8]) -> Result<Option<u64>> {
    if args.is_empty() {
        Ok(None)
    } else {
        parse_hex_u64(args, "address").map(Some)
    }
}

fn parse_write_memory(args: &[u8]) -> Result<Command> {
    let (header, data) = split_pair(args, b':', "address", "data")?;
    let (address, length) = split_pair(header, b',', "address", "length")?;
    let address = parse_hex_u64(address, "address")?;
    let length = parse_hex_usize(length, "length")?;
    let data = hex::decode(data)?;
    if data.len() != length {
        return Err(ParseError::LengthMismatch {
            expected: length,
            actual: data.len(),
        });
    }
    Ok(Command::WriteMemory { address, data })
}

fn parse_breakpoint(letter: u8, args: &[u8]) -> Result<Command> {
    // Conditions and commands after ';' are not supported and ignored.
    let args = split_once(args, b';').map_or(args, |(head, _)| head);
    let (kind, rest) = split_pair(args, b',', "type", "address")?;
    let (address, length) = split_pair(rest, b',', "address", "length")?;
    let Some(kind) = BreakpointType::from_code(parse_hex_u64(kind, "type")?) else {
        return Ok(Command::Unsupported);
    };
    let spec = BreakpointSpec {
        kind,
        address: parse_hex_u64(address, "address")?,
        length: parse_hex_usize(length, "length")?,
    };
    Ok(if letter == b'Z' {
        Command::InsertBreakpoint(spec)
    } else {
        Command::RemoveBreakpoint(spec)
    })
}

fn parse_v(args: &[u8]) -> Result<Command> {
    if args == b"Cont?" {
        return Ok(Command::VContQuery);
    }
    let Some(actions) = args.strip_prefix(b"Cont;") else {
        return Ok(Command::Unsupported);
    };
    actions
        .split(|&b| b == b';')
        .map(parse_vcont_action)
        .collect::<Result<Vec<_>>>()
        .map(Command::VCont)
}

fn parse_vcont_action(action: &[u8]) -> Result<VContAction> {
    let (verb, thread) = match split_once(action, b':') {
        Some((verb, thread)) => (verb, Some(ThreadId::parse(thread)?)),
        None => (action, None),
    };
    let kind = match verb.first() {
        Some(b'c' | b'C') => ResumeKind::Continue,
        Some(b's' | b'S') => ResumeKind::Step,
        Some(b't') => ResumeKind::Stop,
        _ => return Err(ParseError::MissingField("vCont action")),
    };
    Ok(VContAction { kind, thread })
}

fn parse_set_thread(args: &[u8]) -> Result<Command> {
    let Some((&op, thread)) = args.split_first() else {
        return Err(ParseError::MissingField("thread op"));
    };
    let op = match op {
        b'g' => ThreadOp::General,
        b'c' => ThreadOp::Continue,
        _ => return Ok(Command::Unsupported),
    };
    Ok(Command::SetThread {
        op,
        thread: ThreadId::parse(thread)?,
    })
}

fn parse_query(args: &[u8]) -> Result<Command> {
    if args == b"Supported" || args.starts_with(b"Supported:") {
        return Ok(Command::Supported);
    }
    if args == b"Attached" || args.starts_with(b"Attached:") {
        return Ok(Command::Attached);
    }
    match args {
        b"C" => return Ok(Command::CurrentThread),
        b"fThreadInfo" => return Ok(Command::ThreadInfoFirst),
        b"sThreadInfo" => return Ok(Command::ThreadInfoNext),
        b"Offsets" => return Ok(Command::Offsets),
        _ => {}
    }
    if let Some(thread) = args.strip_prefix(b"ThreadExtraInfo,") {
        return Ok(Command::ThreadExtraInfo(ThreadId::parse(thread)?));
    }
    if let Some(rest) = args.strip_prefix(b"Xfer:features:read:") {
        let (annex, range) = split_once(rest, b':').ok_or(ParseError::MissingField("range"))?;
        let (offset, length) = parse_range(range)?;
        return Ok(Command::ReadFeatures {
            annex: String::from_utf8_lossy(annex).into_owned(),
            offset,
            length,
        });
    }
    if let Some(range) = args.strip_prefix(b"Xfer:libraries:read::") {
        let (offset, length) = parse_range(range)?;
        return Ok(Command::ReadLibraries { offset, length });
    }
    Ok(Command::Unsupported)
}

fn parse_range(range: &[u8]) -> Result<(usize, usize)> {
    let (offset, length) = split_pair(range, b',', "offset", "length")?;
    Ok((
        parse_hex_usize(offset, "offset")?,
        parse_hex_usize(length, "length")?,
    ))
}

fn parse_jit(args: &[u8]) -> Result<Command> {
    match args.split_first() {
        Some((b'M', rest)) => {
            let (size, perms) = split_pair(rest, b',', "size", "permissions")?;
            Ok(Command::AllocateMemory {
                size: parse_hex_usize(size, "size")?,
                permissions: Permissions::parse(perms)?,
            })
        }
        Some((b'm', address)) => Ok(Command::DeallocateMemory {
            address: parse_hex_u64(address, "address")?,
        }),
        _ => Ok(Command::Unsupported),
    }
}
