//! Null-packet removal processor.

use crate::data::PacketMetadata;
use crate::error::{PipelineError, PipelineResult};
use crate::plugin::{Plugin, PluginContext, ProcessorPlugin, Verdict};
use clap::Command;
use ts_types::TsPacket;

/// Factory for the built-in `drop-nulls` processor.
pub fn drop_nulls(args: &[String], _ctx: PluginContext) -> PipelineResult<Box<dyn ProcessorPlugin>> {
    Command::new("drop-nulls")
        .no_binary_name(true)
        .about("Remove all null (PID 0x1FFF) packets from the stream")
        .try_get_matches_from(args)
        .map_err(|e| PipelineError::Config(format!("drop-nulls: {e}")))?;
    Ok(Box::new(DropNulls))
}

pub struct DropNulls;

impl Plugin for DropNulls {}

impl ProcessorPlugin for DropNulls {
    fn process(&mut self, packet: &mut TsPacket, _metadata: &mut PacketMetadata) -> Verdict {
        if packet.is_null() {
            Verdict::Drop
        } else {
            Verdict::Ok
        }
    }
}
