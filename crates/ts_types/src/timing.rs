//! Clock constants for MPEG system time.

/// System clock frequency in Hz (PCR units).
pub const SYSTEM_CLOCK_FREQ: u64 = 27_000_000;

/// System clock sub-frequency in Hz (PTS/DTS units).
pub const SYSTEM_CLOCK_SUBFREQ: u64 = 90_000;

/// Number of PCR extension units per PCR base unit.
pub const PCR_EXT_MODULO: u64 = 300;

/// Modulo of the 33-bit PTS/DTS counters.
pub const PTS_DTS_MODULO: u64 = 1 << 33;

/// Modulo of the full 42-bit PCR counter.
pub const PCR_MODULO: u64 = PTS_DTS_MODULO * PCR_EXT_MODULO;
