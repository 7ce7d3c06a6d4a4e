//! Hardware breakpoint and watchpoint slots.

use kstub_proto::WatchKind;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::host::Host;

/// Number of hardware breakpoint registers (AArch64 architectural maximum).
pub const HARDWARE_BREAKPOINT_COUNT: usize = 16;

/// Which slot pool an entry draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pool {
    Breakpoint,
    Watchpoint,
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Breakpoint => "breakpoint",
            Self::Watchpoint => "watchpoint",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("no free {pool} slot ({capacity} in use)")]
    SlotsExhausted { pool: Pool, capacity: usize },

    #[error("host refused {pool} at {address:#x}")]
    HardwareRejected { pool: Pool, address: u64 },

    #[error("watchpoint size must be non-zero")]
    ZeroSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u64,
    pub slot: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Watchpoint {
    pub address: u64,
    pub size: usize,
    pub kind: WatchKind,
    pub slot: usize,
}

impl Watchpoint {
    /// Whether `address` falls inside the watched range.
    pub const fn covers(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size as u64
    }
}

/// Result of a successful insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    Installed { slot: usize },
    AlreadyPresent { slot: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Key {
    Breakpoint(u64),
    Watchpoint(u64, usize, WatchKind),
}

/// Tracks which hardware slots hold which breakpoint or watchpoint.
///
/// Breakpoints are identified by address alone: every AArch64 instruction is
/// four bytes, so the length a debugger sends with `Z1` carries no information.
#[derive(Debug)]
pub struct BreakpointTable {
    breakpoints: Vec<Option<Breakpoint>>,
    watchpoints: Vec<Option<Watchpoint>>,
    index: FxHashMap<Key, usize>,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointTable {
    /// Breakpoint pool full size, watchpoint pool empty.
    pub fn new() -> Self {
        Self {
            breakpoints: vec![None; HARDWARE_BREAKPOINT_COUNT],
            watchpoints: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Size the watchpoint pool. Only valid while no watchpoint is installed.
    pub(crate) fn set_watchpoint_capacity(&mut self, count: usize) {
        debug_assert!(self.watchpoints.iter().all(Option::is_none));
        self.watchpoints = vec![None; count];
    }

    pub fn watchpoint_capacity(&self) -> usize {
        self.watchpoints.len()
    }

    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.iter().flatten().count()
    }

    pub fn watchpoint_count(&self) -> usize {
        self.watchpoints.iter().flatten().count()
    }

    pub fn watchpoints(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.iter().flatten()
    }

    /// The tracked watchpoint whose range contains `address`.
    pub fn watchpoint_at(&self, address: u64) -> Option<&Watchpoint> {
        self.watchpoints().find(|wp| wp.covers(address))
    }

    pub fn insert_breakpoint<H: Host + ?Sized>(
        &mut self,
        host: &H,
        address: u64,
    ) -> Result<Insertion, TableError> {
        let key = Key::Breakpoint(address);
        if let Some(&slot) = self.index.get(&key) {
            return Ok(Insertion::AlreadyPresent { slot });
        }
        let slot = free_slot(&self.breakpoints).ok_or(TableError::SlotsExhausted {
            pool: Pool::Breakpoint,
            capacity: self.breakpoints.len(),
        })?;
        if !host.set_hardware_breakpoint(address) {
            return Err(TableError::HardwareRejected {
                pool: Pool::Breakpoint,
                address,
            });
        }
        self.breakpoints[slot] = Some(Breakpoint { address, slot });
        self.index.insert(key, slot);
        debug!(address = format_args!("{address:#x}"), slot, "breakpoint installed");
        Ok(Insertion::Installed { slot })
    }

    /// Returns whether an entry was removed. Untracked addresses are a no-op.
    pub fn remove_breakpoint<H: Host + ?Sized>(
        &mut self,
        host: &H,
        address: u64,
    ) -> Result<bool, TableError> {
        let key = Key::Breakpoint(address);
        let Some(&slot) = self.index.get(&key) else {
            return Ok(false);
        };
        if !host.clear_hardware_breakpoint(address) {
            return Err(TableError::HardwareRejected {
                pool: Pool::Breakpoint,
                address,
            });
        }
        self.breakpoints[slot] = None;
        self.index.remove(&key);
        debug!(address = format_args!("{address:#x}"), slot, "breakpoint removed");
        Ok(true)
    }

    pub fn insert_watchpoint<H: Host + ?Sized>(
        &mut self,
        host: &H,
        address: u64,
        size: usize,
        kind: WatchKind,
    ) -> Result<Insertion, TableError> {
        if size == 0 {
            return Err(TableError::ZeroSize);
        }
        let key = Key::Watchpoint(address, size, kind);
        if let Some(&slot) = self.index.get(&key) {
            return Ok(Insertion::AlreadyPresent { slot });
        }
        let slot = free_slot(&self.watchpoints).ok_or(TableError::SlotsExhausted {
            pool: Pool::Watchpoint,
            capacity: self.watchpoints.len(),
        })?;
        if !host.set_hardware_watchpoint(address, size, kind) {
            return Err(TableError::HardwareRejected {
                pool: Pool::Watchpoint,
                address,
            });
        }
        self.watchpoints[slot] = Some(Watchpoint {
            address,
            size,
            kind,
            slot,
        });
        self.index.insert(key, slot);
        debug!(
            address = format_args!("{address:#x}"),
            size,
            kind = kind.stop_field(),
            slot,
            "watchpoint installed"
        );
        Ok(Insertion::Installed { slot })
    }

    pub fn remove_watchpoint<H: Host + ?Sized>(
        &mut self,
        host: &H,
        address: u64,
        size: usize,
        kind: WatchKind,
    ) -> Result<bool, TableError> {
        if size == 0 {
            return Err(TableError::ZeroSize);
        }
        let key = Key::Watchpoint(address, size, kind);
        let Some(&slot) = self.index.get(&key) else {
            return Ok(false);
        };
        if !host.clear_hardware_watchpoint(address, size, kind) {
            return Err(TableError::HardwareRejected {
                pool: Pool::Watchpoint,
                address,
            });
        }
        self.watchpoints[slot] = None;
        self.index.remove(&key);
        debug!(address = format_args!("{address:#x}"), slot, "watchpoint removed");
        Ok(true)
    }

    /// Release every entry, returning how many were removed. Entries the host
    /// refuses to clear are dropped from tracking anyway.
    pub fn clear<H: Host + ?Sized>(&mut self, host: &H) -> usize {
        let mut removed = 0;
        for entry in &mut self.breakpoints {
            if let Some(bp) = entry.take() {
                if !host.clear_hardware_breakpoint(bp.address) {
                    warn!(address = format_args!("{:#x}", bp.address), "host kept breakpoint");
                }
                removed += 1;
            }
        }
        for entry in &mut self.watchpoints {
            if let Some(wp) = entry.take() {
                if !host.clear_hardware_watchpoint(wp.address, wp.size, wp.kind) {
                    warn!(address = format_args!("{:#x}", wp.address), "host kept watchpoint");
                }
                removed += 1;
            }
        }
        self.index.clear();
        removed
    }
}

fn free_slot<T>(slots: &[Option<T>]) -> Option<usize> {
    slots.iter().position(Option::is_none)
}
