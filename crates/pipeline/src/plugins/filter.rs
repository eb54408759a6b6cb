//! PID filter processor.
//!
//! Keeps only the selected PIDs, or with `--drop` removes them instead.
//! Packets that pass can be tagged with a label for downstream
//! `--only-label` selection.

use crate::data::{PacketMetadata, LABEL_MAX};
use crate::error::{PipelineError, PipelineResult};
use crate::plugin::{Plugin, PluginContext, ProcessorPlugin, Verdict};
use clap::{Arg, ArgAction, Command};
use ts_types::{TsPacket, PID_MAX};

fn command() -> Command {
    Command::new("filter")
        .no_binary_name(true)
        .about("Filter packets by PID")
        .arg(
            Arg::new("pid")
                .long("pid")
                .action(ArgAction::Append)
                .required(true)
                .value_parser(parse_pid)
                .help("Selected PID, decimal or 0x-prefixed hex; repeatable"),
        )
        .arg(
            Arg::new("drop")
                .long("drop")
                .action(ArgAction::SetTrue)
                .help("Drop the selected PIDs instead of keeping only them"),
        )
        .arg(
            Arg::new("set-label")
                .long("set-label")
                .value_parser(clap::value_parser!(u8).range(..=LABEL_MAX as i64))
                .help("Label to set on every packet that passes the filter"),
        )
}

fn parse_pid(s: &str) -> Result<u16, String> {
    let pid = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|_| format!("invalid PID '{s}'"))?;
    if pid > PID_MAX {
        return Err(format!("PID {pid:#x} out of range"));
    }
    Ok(pid)
}

/// Factory for the built-in `filter` processor.
pub fn pid_filter(args: &[String], _ctx: PluginContext) -> PipelineResult<Box<dyn ProcessorPlugin>> {
    let matches = command()
        .try_get_matches_from(args)
        .map_err(|e| PipelineError::Config(format!("filter: {e}")))?;
    let mut pids = vec![false; usize::from(PID_MAX) + 1];
    for pid in matches.get_many::<u16>("pid").into_iter().flatten() {
        pids[usize::from(*pid)] = true;
    }
    Ok(Box::new(PidFilter {
        pids,
        drop_matching: matches.get_flag("drop"),
        set_label: matches.get_one::<u8>("set-label").copied(),
    }))
}

pub struct PidFilter {
    pids: Vec<bool>,
    drop_matching: bool,
    set_label: Option<u8>,
}

impl Plugin for PidFilter {}

impl ProcessorPlugin for PidFilter {
    fn process(&mut self, packet: &mut TsPacket, metadata: &mut PacketMetadata) -> Verdict {
        let hit = self.pids[usize::from(packet.pid())];
        let pass = if self.drop_matching { !hit } else { hit };
        if !pass {
            return Verdict::Drop;
        }
        if let Some(label) = self.set_label {
            metadata.set_label(label);
        }
        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitrate::BitrateController;
    use crate::ledger::WindowLedger;
    use crate::plugin::{BitrateView, JointHandle};
    use crate::report::{AsyncReport, StageReport};
    use crate::termination::Terminator;
    use std::sync::Arc;
    use ts_types::NULL_PACKET;

    fn ctx() -> PluginContext {
        let (report, _handle) = AsyncReport::spawn();
        let ledger = Arc::new(WindowLedger::new(64, 2));
        PluginContext {
            report: StageReport::new(report, 1, "filter", false),
            bitrate: BitrateView::new(Arc::new(BitrateController::new(None))),
            joint: JointHandle::new(1, Arc::new(Terminator::new(ledger, false))),
        }
    }

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn pkt(pid: u16) -> TsPacket {
        let mut p = NULL_PACKET;
        p.set_pid(pid);
        p
    }

    #[test]
    fn pid_parsing_accepts_hex_and_decimal() {
        assert_eq!(parse_pid("0x100"), Ok(0x100));
        assert_eq!(parse_pid("256"), Ok(256));
        assert!(parse_pid("0x2000").is_err());
        assert!(parse_pid("garbage").is_err());
    }

    #[test]
    fn keep_mode_drops_everything_else() {
        let mut f = pid_filter(&args(&["--pid", "0x100"]), ctx()).unwrap();
        let mut md = PacketMetadata::default();
        assert_eq!(f.process(&mut pkt(0x100), &mut md), Verdict::Ok);
        assert_eq!(f.process(&mut pkt(0x101), &mut md), Verdict::Drop);
    }

    #[test]
    fn drop_mode_inverts_the_predicate() {
        let mut f = pid_filter(&args(&["--pid", "0x100", "--drop"]), ctx()).unwrap();
        let mut md = PacketMetadata::default();
        assert_eq!(f.process(&mut pkt(0x100), &mut md), Verdict::Drop);
        assert_eq!(f.process(&mut pkt(0), &mut md), Verdict::Ok);
    }

    #[test]
    fn passed_packets_get_labeled() {
        let mut f =
            pid_filter(&args(&["--pid", "32", "--set-label", "5"]), ctx()).unwrap();
        let mut md = PacketMetadata::default();
        assert_eq!(f.process(&mut pkt(32), &mut md), Verdict::Ok);
        assert!(md.has_label(5));
    }

    #[test]
    fn pid_is_mandatory() {
        assert!(pid_filter(&args(&["--drop"]), ctx()).is_err());
    }
}
