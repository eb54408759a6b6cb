//! Session configuration data structures.
//!
//! Everything here is produced by the command-line front end (or by a
//! test) and consumed by the supervisor. Batching caps come in two
//! tuning regimes: offline favors throughput, real-time favors latency.

use crate::buffer::DEFAULT_BUFFER_SIZE_MB;
use std::net::IpAddr;
use std::time::Duration;

/// Default interval between bitrate republications.
pub const DEFAULT_BITRATE_ADJUST: Duration = Duration::from_secs(5);

/// Default control-channel session timeout.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Offline cap on packets processed per processor wake-up.
pub const OFFLINE_MAX_FLUSHED: usize = 10_000;

/// Real-time cap on packets processed per processor wake-up.
pub const REALTIME_MAX_FLUSHED: usize = 1_000;

/// Real-time cap on packets per input receive call.
pub const REALTIME_MAX_INPUT: usize = 1_000;

/// Real-time regime selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Realtime {
    /// Real-time when any plugin declares itself real-time.
    #[default]
    Auto,
    On,
    Off,
}

/// Control channel configuration.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub port: u16,
    /// Local address to bind.
    pub local: IpAddr,
    /// Peers allowed to connect. Empty means loopback only.
    pub sources: Vec<IpAddr>,
    pub reuse_port: bool,
    pub session_timeout: Duration,
}

impl ControlOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            local: IpAddr::from([127, 0, 0, 1]),
            sources: Vec::new(),
            reuse_port: false,
            session_timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }
}

/// Global session options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Fixed input bitrate; disables estimation.
    pub fixed_bitrate: Option<u64>,
    pub bitrate_adjust_interval: Duration,
    /// Ring size in MiB, fractions allowed.
    pub buffer_size_mb: f64,
    pub max_input_packets: Option<usize>,
    pub max_flushed_packets: Option<usize>,
    pub max_output_packets: Option<usize>,
    /// Packets accumulated before the first downstream wake-up.
    pub initial_input_packets: Option<usize>,
    pub add_start_stuffing: usize,
    pub add_stop_stuffing: usize,
    /// (nullpkt, inpkt) interleaved stuffing ratio.
    pub add_input_stuffing: Option<(u64, u64)>,
    pub realtime: Realtime,
    pub ignore_joint_termination: bool,
    /// Post-input drain deadline. `None` waits forever.
    pub final_wait: Option<Duration>,
    /// Deadline on each input receive call.
    pub receive_timeout: Option<Duration>,
    pub control: Option<ControlOptions>,
    /// Prefix report messages with the stage position.
    pub log_plugin_index: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            fixed_bitrate: None,
            bitrate_adjust_interval: DEFAULT_BITRATE_ADJUST,
            buffer_size_mb: DEFAULT_BUFFER_SIZE_MB,
            max_input_packets: None,
            max_flushed_packets: None,
            max_output_packets: None,
            initial_input_packets: None,
            add_start_stuffing: 0,
            add_stop_stuffing: 0,
            add_input_stuffing: None,
            realtime: Realtime::Auto,
            ignore_joint_termination: false,
            final_wait: None,
            receive_timeout: None,
            control: None,
            log_plugin_index: false,
        }
    }
}

/// Concrete batching parameters after regime resolution.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub realtime: bool,
    pub max_input_packets: usize,
    pub max_flushed_packets: usize,
    pub max_output_packets: Option<usize>,
    pub initial_input_packets: usize,
    pub bitrate_adjust_interval: Duration,
    pub receive_timeout: Option<Duration>,
}

impl Options {
    /// Resolves the tuning regime for a ring of `slots` slots.
    ///
    /// `realtime` is the already-arbitrated regime (the flag, or any
    /// plugin's declaration under `Auto`).
    pub fn tuning(&self, realtime: bool, slots: usize) -> Tuning {
        let max_input = self.max_input_packets.unwrap_or(if realtime {
            REALTIME_MAX_INPUT
        } else {
            usize::MAX
        });
        let max_flushed = self.max_flushed_packets.unwrap_or(if realtime {
            REALTIME_MAX_FLUSHED
        } else {
            OFFLINE_MAX_FLUSHED
        });
        // The bootstrap accumulation must leave free slots, or the input
        // could fill the whole ring without ever waking anyone.
        let initial = self
            .initial_input_packets
            .unwrap_or(slots / 2)
            .min(slots / 2)
            .max(1);
        Tuning {
            realtime,
            max_input_packets: max_input.max(1),
            max_flushed_packets: max_flushed.max(1),
            max_output_packets: self.max_output_packets,
            initial_input_packets: initial,
            bitrate_adjust_interval: self.bitrate_adjust_interval,
            receive_timeout: self.receive_timeout,
        }
    }
}

/// One plugin reference on the command line.
#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// The full chain: one input, processors in order, one output.
#[derive(Debug, Clone)]
pub struct ChainSpec {
    pub input: PluginSpec,
    pub processors: Vec<PluginSpec>,
    pub output: PluginSpec,
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self {
            input: PluginSpec::with_args("file", ["-"]),
            processors: Vec::new(),
            output: PluginSpec::with_args("file", ["-"]),
        }
    }
}

impl ChainSpec {
    /// Total number of stages, input and output included.
    pub fn stage_count(&self) -> usize {
        self.processors.len() + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_defaults() {
        let t = Options::default().tuning(false, 10_000);
        assert!(!t.realtime);
        assert_eq!(t.max_input_packets, usize::MAX);
        assert_eq!(t.max_flushed_packets, OFFLINE_MAX_FLUSHED);
        assert_eq!(t.initial_input_packets, 5_000);
    }

    #[test]
    fn realtime_defaults() {
        let t = Options::default().tuning(true, 10_000);
        assert_eq!(t.max_input_packets, REALTIME_MAX_INPUT);
        assert_eq!(t.max_flushed_packets, REALTIME_MAX_FLUSHED);
    }

    #[test]
    fn initial_accumulation_is_clamped() {
        let opts = Options {
            initial_input_packets: Some(1_000_000),
            ..Options::default()
        };
        assert_eq!(opts.tuning(false, 100).initial_input_packets, 50);
    }

    #[test]
    fn explicit_caps_override_regime() {
        let opts = Options {
            max_flushed_packets: Some(42),
            ..Options::default()
        };
        assert_eq!(opts.tuning(true, 1_000).max_flushed_packets, 42);
    }
}
