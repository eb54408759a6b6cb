//! Pipeline lifecycle supervision.
//!
//! The supervisor allocates the buffer, instantiates the plugin chain,
//! wires the ring, starts one executor thread per stage plus the
//! optional control channel, waits for the executors to drain, and
//! tears everything down in reverse order.

use crate::bitrate::BitrateController;
use crate::buffer::PacketBuffer;
use crate::config::{ChainSpec, Options, Realtime};
use crate::control::ControlServer;
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{self, SessionClock, StageEvent, StageRuntime, StageShared};
use crate::ledger::WindowLedger;
use crate::loader;
use crate::plugin::{BitrateView, JointHandle, PluginContext, StageKind, StagePlugin};
use crate::registry::PluginRegistry;
use crate::report::{AsyncReport, Severity, StageReport};
use crate::stuffing::StuffingInjector;
use crate::termination::Terminator;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One stage as seen from outside (control channel, run summary).
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub index: usize,
    pub name: String,
    pub kind: &'static str,
    pub packets: u64,
    pub suspended: bool,
    /// Slots currently parked in the stage's window.
    pub window: usize,
}

/// Final accounting for one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// False when any stage aborted.
    pub success: bool,
    /// Most severe message reported during the run.
    pub worst: Option<Severity>,
    pub stages: Vec<StageInfo>,
}

/// Shared view of a running pipeline, for the control channel and
/// signal handlers.
#[derive(Clone)]
pub struct PipelineHandle {
    ledger: Arc<WindowLedger>,
    terminator: Arc<Terminator>,
    bitrate: Arc<BitrateController>,
    stages: Arc<Vec<Arc<StageShared>>>,
}

impl PipelineHandle {
    /// Requests an orderly stop: input ends, downstream drains.
    pub fn request_stop(&self) {
        self.terminator.request_stop();
    }

    /// Hard termination; used as a last resort.
    pub fn force_abort(&self) {
        self.terminator.abort_all();
    }

    /// Current declared bitrate in bits/second.
    pub fn bitrate(&self) -> u64 {
        self.bitrate.bitrate()
    }

    /// Snapshot of all stages, window fill included.
    pub fn stage_infos(&self) -> Vec<StageInfo> {
        let windows = self.ledger.snapshot();
        self.stages
            .iter()
            .map(|s| StageInfo {
                index: s.index,
                name: s.name.to_string(),
                kind: s.kind.name(),
                packets: s.packets.load(Ordering::Relaxed),
                suspended: s.suspended.load(Ordering::Relaxed),
                window: windows.get(s.index).map_or(0, |w| w.count),
            })
            .collect()
    }

    fn find(&self, selector: &str) -> Result<&Arc<StageShared>, String> {
        if let Ok(index) = selector.parse::<usize>() {
            return self
                .stages
                .get(index)
                .ok_or_else(|| format!("no stage {index}"));
        }
        self.stages
            .iter()
            .find(|s| &*s.name == selector)
            .ok_or_else(|| format!("no stage named '{selector}'"))
    }

    /// Suspends a processor: its packets pass through untouched.
    pub fn suspend(&self, selector: &str) -> Result<(), String> {
        let stage = self.find(selector)?;
        if stage.kind != StageKind::Processor {
            return Err(format!("stage {} is not a processor", stage.index));
        }
        stage.suspended.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub fn resume(&self, selector: &str) -> Result<(), String> {
        let stage = self.find(selector)?;
        if stage.kind != StageKind::Processor {
            return Err(format!("stage {} is not a processor", stage.index));
        }
        stage.suspended.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Moves one stage's report severity ceiling.
    pub fn set_log(&self, selector: &str, level: &str) -> Result<(), String> {
        let severity =
            Severity::parse(level).ok_or_else(|| format!("unknown severity '{level}'"))?;
        let stage = self.find(selector)?;
        stage.report.set_ceiling(severity);
        Ok(())
    }
}

/// A built, running pipeline. Dropping without [`Pipeline::run`] leaks
/// the executor threads; always run to completion.
pub struct Pipeline {
    threads: Vec<JoinHandle<()>>,
    events: flume::Receiver<StageEvent>,
    handle: PipelineHandle,
    control: Option<ControlServer>,
    report: AsyncReport,
    log_thread: JoinHandle<()>,
    final_wait: Option<Duration>,
}

impl Pipeline {
    /// Builds the whole chain and starts its executors.
    ///
    /// The registry is mutable so unknown plugin names can be resolved
    /// by loading shared libraries on the fly.
    pub fn build(
        options: Options,
        chain: ChainSpec,
        registry: &mut PluginRegistry,
    ) -> PipelineResult<Self> {
        let stage_count = chain.stage_count();
        if stage_count > 64 {
            return Err(PipelineError::Config(format!(
                "chain of {stage_count} stages exceeds the 64-stage limit"
            )));
        }

        let buffer = Arc::new(PacketBuffer::new(options.buffer_size_mb)?);
        let ledger = Arc::new(WindowLedger::new(buffer.slot_count(), stage_count));
        let terminator = Arc::new(Terminator::new(
            Arc::clone(&ledger),
            options.ignore_joint_termination,
        ));
        let bitrate = Arc::new(BitrateController::new(options.fixed_bitrate));
        let (report, log_thread) = AsyncReport::spawn();

        // Instantiate the chain: input, processors in order, output.
        let mut plugins: Vec<StagePlugin> = Vec::with_capacity(stage_count);
        let mut shared: Vec<Arc<StageShared>> = Vec::with_capacity(stage_count);
        let mut only_labels: Vec<Option<u8>> = vec![None; stage_count];

        let mut specs = Vec::with_capacity(stage_count);
        specs.push((StageKind::Input, chain.input));
        for p in chain.processors {
            specs.push((StageKind::Processor, p));
        }
        specs.push((StageKind::Output, chain.output));

        for (index, (kind, spec)) in specs.into_iter().enumerate() {
            let stage_report =
                StageReport::new(report.clone(), index, &spec.name, options.log_plugin_index);
            let ctx = PluginContext {
                report: stage_report.clone(),
                bitrate: BitrateView::new(Arc::clone(&bitrate)),
                joint: JointHandle::new(index, Arc::clone(&terminator)),
            };
            let mut args = spec.args;
            if kind == StageKind::Processor {
                only_labels[index] = strip_only_label(&mut args)?;
            }
            ensure_loaded(registry, kind, &spec.name)?;
            let plugin = match kind {
                StageKind::Input => StagePlugin::Input(registry.create_input(
                    &spec.name,
                    &args,
                    ctx,
                )?),
                StageKind::Processor => StagePlugin::Processor(registry.create_processor(
                    &spec.name,
                    &args,
                    ctx,
                )?),
                StageKind::Output => StagePlugin::Output(registry.create_output(
                    &spec.name,
                    &args,
                    ctx,
                )?),
            };
            shared.push(Arc::new(StageShared {
                index,
                name: Arc::from(spec.name.as_str()),
                kind,
                suspended: AtomicBool::new(false),
                packets: AtomicU64::new(0),
                report: stage_report,
            }));
            plugins.push(plugin);
        }

        // Regime arbitration: the flag decides, otherwise any real-time
        // plugin switches the whole session.
        let realtime = match options.realtime {
            Realtime::On => true,
            Realtime::Off => false,
            Realtime::Auto => plugins.iter().any(StagePlugin::is_real_time),
        };
        let tuning = options.tuning(realtime, buffer.slot_count());
        info!(
            realtime,
            slots = buffer.slot_count(),
            stages = stage_count,
            "pipeline configured"
        );

        // Start plugins in chain order; unwind on failure.
        for index in 0..plugins.len() {
            if let Err(e) = plugins[index].start() {
                let name = shared[index].name.to_string();
                for started in plugins[..index].iter_mut().rev() {
                    let _ = started.stop();
                }
                report.shutdown();
                let _ = log_thread.join();
                return Err(PipelineError::PluginStart {
                    stage: index,
                    name,
                    message: e.to_string(),
                });
            }
        }
        for (index, plugin) in plugins.iter().enumerate() {
            if let StagePlugin::Processor(p) = plugin {
                if p.joint_termination() {
                    terminator.register_joint(index);
                }
            }
        }

        let cores = if realtime {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let (event_tx, event_rx) = flume::unbounded();
        let clock = SessionClock::new();
        let stages = Arc::new(shared);

        let mut threads = Vec::with_capacity(stage_count);
        for (index, plugin) in plugins.into_iter().enumerate() {
            let rt = StageRuntime {
                shared: Arc::clone(&stages[index]),
                buffer: Arc::clone(&buffer),
                ledger: Arc::clone(&ledger),
                bitrate: Arc::clone(&bitrate),
                terminator: Arc::clone(&terminator),
                events: event_tx.clone(),
                tuning,
                clock,
                core: (!cores.is_empty()).then(|| cores[index % cores.len()]),
            };
            let injector = StuffingInjector::new(
                options.add_start_stuffing,
                options.add_stop_stuffing,
                options.add_input_stuffing,
            );
            let only_label = only_labels[index];
            let builder = thread::Builder::new().name(format!("tsp-{}", stages[index].name));
            let handle = builder
                .spawn(move || match plugin {
                    StagePlugin::Input(p) => executor::run_input(rt, p, injector),
                    StagePlugin::Processor(p) => executor::run_processor(rt, p, only_label),
                    StagePlugin::Output(p) => executor::run_output(rt, p),
                })
                .map_err(|e| {
                    // Best-effort cleanup: wake whatever already runs.
                    terminator.abort_all();
                    PipelineError::Allocation(format!("cannot start thread: {e}"))
                })?;
            threads.push(handle);
        }
        drop(event_tx);

        let handle = PipelineHandle {
            ledger,
            terminator,
            bitrate,
            stages,
        };
        let control = match options.control {
            Some(copts) => match ControlServer::start(copts, handle.clone()) {
                Ok(server) => Some(server),
                Err(e) => {
                    handle.force_abort();
                    for t in threads {
                        let _ = t.join();
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Self {
            threads,
            events: event_rx,
            handle,
            control,
            report,
            log_thread,
            final_wait: options.final_wait,
        })
    }

    /// A cloneable view for signal handlers and embedders.
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Waits for the whole chain to terminate and tears it down.
    pub fn run(self) -> PipelineResult<RunSummary> {
        let stage_count = self.handle.stages.len();
        let mut finished = vec![false; stage_count];
        let mut any_aborted = false;
        let mut deadline: Option<Instant> = None;

        while finished.iter().any(|f| !f) {
            let event = match deadline {
                Some(d) => match self.events.recv_deadline(d) {
                    Ok(ev) => ev,
                    Err(flume::RecvTimeoutError::Timeout) => {
                        warn!(
                            "drain deadline expired with stages still running; aborting the chain"
                        );
                        any_aborted = true;
                        self.handle.terminator.abort_all();
                        deadline = None;
                        continue;
                    }
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                },
                None => match self.events.recv() {
                    Ok(ev) => ev,
                    Err(_) => break,
                },
            };
            let stage = match event {
                StageEvent::Finished { stage } => {
                    debug!(stage, "stage finished");
                    stage
                }
                StageEvent::Aborted { stage, message } => {
                    warn!(stage, "stage aborted: {message}");
                    any_aborted = true;
                    stage
                }
            };
            finished[stage] = true;
            if stage == 0 {
                if let Some(wait) = self.final_wait {
                    deadline = Some(Instant::now() + wait);
                }
            }
        }

        for t in self.threads {
            let _ = t.join();
        }
        if let Some(control) = self.control {
            control.shutdown();
        }

        let stages = self.handle.stage_infos();
        let worst = self.report.worst();
        self.report.shutdown();
        let _ = self.log_thread.join();

        Ok(RunSummary {
            success: !any_aborted,
            worst,
            stages,
        })
    }
}

fn ensure_loaded(
    registry: &mut PluginRegistry,
    kind: StageKind,
    name: &str,
) -> PipelineResult<()> {
    let present = match kind {
        StageKind::Input => registry.has_input(name),
        StageKind::Processor => registry.has_processor(name),
        StageKind::Output => registry.has_output(name),
    };
    if present {
        return Ok(());
    }
    loader::load_plugin(name, registry)
}

/// Removes a `--only-label N` pair from a processor argument list; the
/// core applies the filter itself, without ever calling the plugin.
fn strip_only_label(args: &mut Vec<String>) -> PipelineResult<Option<u8>> {
    let Some(pos) = args.iter().position(|a| a == "--only-label") else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        return Err(PipelineError::Config(
            "--only-label requires a label value".into(),
        ));
    }
    let value = args[pos + 1]
        .parse::<u8>()
        .ok()
        .filter(|&l| l <= crate::data::LABEL_MAX)
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "invalid label '{}' (expected 0..={})",
                args[pos + 1],
                crate::data::LABEL_MAX
            ))
        })?;
    args.drain(pos..=pos + 1);
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_only_label_extracts_pair() {
        let mut args: Vec<String> = ["--pid", "0x100", "--only-label", "7", "--drop"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let label = strip_only_label(&mut args).unwrap();
        assert_eq!(label, Some(7));
        assert_eq!(args, vec!["--pid", "0x100", "--drop"]);
    }

    #[test]
    fn strip_only_label_absent() {
        let mut args: Vec<String> = vec!["--drop".into()];
        assert_eq!(strip_only_label(&mut args).unwrap(), None);
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn strip_only_label_rejects_bad_values() {
        let mut args: Vec<String> = vec!["--only-label".into()];
        assert!(strip_only_label(&mut args).is_err());
        let mut args: Vec<String> = vec!["--only-label".into(), "32".into()];
        assert!(strip_only_label(&mut args).is_err());
    }
}
