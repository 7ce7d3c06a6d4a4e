//! Engine configuration.

/// Largest reply payload advertised through `qSupported`.
pub const DEFAULT_PACKET_SIZE: usize = 0x1000;

/// Smallest accepted packet size. A `G` packet carrying the whole AArch64
/// register record (788 bytes, 1576 hex digits) must fit.
pub const MIN_PACKET_SIZE: usize = 0x800;

/// Configuration for [`Engine`](crate::Engine).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubConfig {
    /// Reply size bound advertised to the debugger.
    pub packet_size: usize,
    /// Free JIT allocations made by a session when it detaches or resets.
    pub reclaim_jit_on_detach: bool,
    /// Release the session's breakpoints and watchpoints on reset.
    pub clear_breakpoints_on_reset: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            reclaim_jit_on_detach: true,
            clear_breakpoints_on_reset: true,
        }
    }
}

impl StubConfig {
    #[must_use]
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.packet_size = size.max(MIN_PACKET_SIZE);
        self
    }

    #[must_use]
    pub const fn with_reclaim_jit_on_detach(mut self, reclaim: bool) -> Self {
        self.reclaim_jit_on_detach = reclaim;
        self
    }

    #[must_use]
    pub const fn with_clear_breakpoints_on_reset(mut self, clear: bool) -> Self {
        self.clear_breakpoints_on_reset = clear;
        self
    }

    /// Largest memory read answerable in one reply (two hex digits per byte).
    pub fn max_memory_read(&self) -> usize {
        (self.packet_size / 2).max(1)
    }

    /// Largest `qXfer` chunk. Leaves room for the prefix and escaping.
    pub fn max_xfer_chunk(&self) -> usize {
        (self.packet_size.saturating_sub(1) / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StubConfig::default();
        assert_eq!(config.packet_size, 0x1000);
        assert!(config.reclaim_jit_on_detach);
        assert!(config.clear_breakpoints_on_reset);
        assert_eq!(config.max_memory_read(), 0x800);
    }

    #[test]
    fn test_packet_size_floor() {
        let config = StubConfig::default().with_packet_size(0x100);
        assert_eq!(config.packet_size, MIN_PACKET_SIZE);
        let config = StubConfig::default().with_packet_size(0x2000);
        assert_eq!(config.packet_size, 0x2000);
    }

    #[test]
    fn test_floor_fits_register_write() {
        let registers = crate::arch::encode_registers(&crate::arch::Registers::default());
        assert!(1 + registers.len() <= MIN_PACKET_SIZE);
    }
}
