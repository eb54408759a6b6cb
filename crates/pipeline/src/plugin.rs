//! The plugin contract.
//!
//! A chain stage is bound to exactly one plugin: an input that fills
//! freshly claimed ring slots, a processor that inspects single packets
//! in place, or an output that ships consumed windows. Plugins never
//! allocate, copy or reorder packets; they work on borrowed slots and
//! communicate through verdicts and metadata.

use crate::bitrate::BitrateController;
use crate::data::PacketMetadata;
use crate::error::PluginResult;
use crate::report::StageReport;
use crate::termination::Terminator;
use std::sync::Arc;
use ts_types::TsPacket;

/// Stage position classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Input,
    Processor,
    Output,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Input => "input",
            StageKind::Processor => "processor",
            StageKind::Output => "output",
        }
    }
}

/// Verdict returned by a processor for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the packet on (possibly mutated in place).
    Ok,
    /// Replace the packet with a stuffing null.
    Null,
    /// Mark the slot dropped; downstream skips it.
    Drop,
    /// Flush what was processed and re-present this packet later.
    Stall,
    /// End of stream at this packet; it is not forwarded.
    End,
    /// Fatal failure; the pipeline terminates in error.
    Abort,
}

/// Capabilities shared by all plugin kinds.
pub trait Plugin: Send {
    fn start(&mut self) -> PluginResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> PluginResult<()> {
        Ok(())
    }

    /// Device-reported bitrate in bits/second, when the plugin knows it.
    fn get_bitrate(&self) -> Option<u64> {
        None
    }

    /// Real-time plugins switch the whole session to real-time defaults
    /// unless overridden on the command line.
    fn is_real_time(&self) -> bool {
        false
    }
}

/// A stream source filling claimed ring slots.
pub trait InputPlugin: Plugin {
    /// Fills a prefix of `packets` and returns how many were written.
    /// `Ok(0)` signals end of stream. Source timestamps may be stored in
    /// the matching `metadata` records; the executor stamps the rest.
    fn receive(
        &mut self,
        packets: &mut [TsPacket],
        metadata: &mut [PacketMetadata],
    ) -> PluginResult<usize>;

    /// Best-effort request to unblock a pending `receive`. Returns true
    /// when the plugin supports interruption.
    fn abort(&mut self) -> bool {
        false
    }
}

/// A transform invoked packet by packet.
pub trait ProcessorPlugin: Plugin {
    fn process(&mut self, packet: &mut TsPacket, metadata: &mut PacketMetadata) -> Verdict;

    /// Opt into joint termination: the plugin will declare completion
    /// through its [`JointHandle`] but keeps passing packets until every
    /// participant concurs.
    fn joint_termination(&self) -> bool {
        false
    }
}

/// A stream sink consuming released windows.
pub trait OutputPlugin: Plugin {
    /// Ships a run of packets. `Ok(false)` is a fatal refusal.
    fn send(&mut self, packets: &[TsPacket], metadata: &[PacketMetadata]) -> PluginResult<bool>;
}

/// Read-only view of the declared bitrate.
#[derive(Clone)]
pub struct BitrateView(Arc<BitrateController>);

impl BitrateView {
    pub(crate) fn new(ctrl: Arc<BitrateController>) -> Self {
        Self(ctrl)
    }

    /// Current declared bitrate in bits/second, 0 when unknown.
    pub fn bitrate(&self) -> u64 {
        self.0.bitrate()
    }
}

/// Joint-termination declaration handle for one stage.
#[derive(Clone)]
pub struct JointHandle {
    stage: usize,
    terminator: Arc<Terminator>,
}

impl JointHandle {
    pub(crate) fn new(stage: usize, terminator: Arc<Terminator>) -> Self {
        Self { stage, terminator }
    }

    /// Declares this stage jointly done. Idempotent.
    pub fn declare_done(&self) {
        self.terminator.declare_jointly_done(self.stage);
    }
}

/// Capabilities handed to a plugin factory at construction.
#[derive(Clone)]
pub struct PluginContext {
    pub report: StageReport,
    pub bitrate: BitrateView,
    pub joint: JointHandle,
}

/// A constructed plugin, tagged by kind.
pub enum StagePlugin {
    Input(Box<dyn InputPlugin>),
    Processor(Box<dyn ProcessorPlugin>),
    Output(Box<dyn OutputPlugin>),
}

impl StagePlugin {
    pub fn kind(&self) -> StageKind {
        match self {
            StagePlugin::Input(_) => StageKind::Input,
            StagePlugin::Processor(_) => StageKind::Processor,
            StagePlugin::Output(_) => StageKind::Output,
        }
    }

    pub fn is_real_time(&self) -> bool {
        match self {
            StagePlugin::Input(p) => p.is_real_time(),
            StagePlugin::Processor(p) => p.is_real_time(),
            StagePlugin::Output(p) => p.is_real_time(),
        }
    }

    pub fn start(&mut self) -> PluginResult<()> {
        match self {
            StagePlugin::Input(p) => p.start(),
            StagePlugin::Processor(p) => p.start(),
            StagePlugin::Output(p) => p.start(),
        }
    }

    pub fn stop(&mut self) -> PluginResult<()> {
        match self {
            StagePlugin::Input(p) => p.stop(),
            StagePlugin::Processor(p) => p.stop(),
            StagePlugin::Output(p) => p.stop(),
        }
    }
}
