//! The per-stage executor thread bodies.
//!
//! All three variants share one skeleton: wait until the stage window
//! has work or a terminal flag, borrow a contiguous run of slots, let
//! the plugin at it, apply its verdict, release the consumed prefix to
//! the next stage. The ledger mutex is never held across a plugin call.

use crate::bitrate::{BitrateController, BitrateEstimator};
use crate::buffer::PacketBuffer;
use crate::config::Tuning;
use crate::data::PacketMetadata;
use crate::ledger::WindowLedger;
use crate::plugin::{InputPlugin, OutputPlugin, ProcessorPlugin, StageKind, Verdict};
use crate::report::StageReport;
use crate::stuffing::StuffingInjector;
use crate::termination::Terminator;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use ts_types::TsPacket;

/// Monotonic session clock; all input timestamps count microseconds
/// from supervisor start.
#[derive(Clone, Copy)]
pub(crate) struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// State shared between a stage's executor, the supervisor and the
/// control channel.
pub(crate) struct StageShared {
    pub index: usize,
    pub name: Arc<str>,
    pub kind: StageKind,
    /// Suspended processors pass packets through without plugin calls.
    pub suspended: AtomicBool,
    /// Packets through this stage (admitted / passed / sent).
    pub packets: AtomicU64,
    pub report: StageReport,
}

/// Lifecycle notification from an executor to the supervisor. Each
/// executor sends exactly one, at exit.
pub(crate) enum StageEvent {
    Finished { stage: usize },
    Aborted { stage: usize, message: String },
}

/// Everything one executor thread needs, bundled for the spawn.
pub(crate) struct StageRuntime {
    pub shared: Arc<StageShared>,
    pub buffer: Arc<PacketBuffer>,
    pub ledger: Arc<WindowLedger>,
    pub bitrate: Arc<BitrateController>,
    pub terminator: Arc<Terminator>,
    pub events: flume::Sender<StageEvent>,
    pub tuning: Tuning,
    pub clock: SessionClock,
    pub core: Option<core_affinity::CoreId>,
}

impl StageRuntime {
    fn pin(&self) {
        if let Some(core) = self.core {
            if core_affinity::set_for_current(core) {
                debug!("stage '{}' pinned to core {core:?}", self.shared.name);
            }
        }
    }
}

enum FillOutcome {
    /// The plugin may have more data.
    More,
    /// The plugin declared end of stream.
    Eos,
    /// PluginFatal: message for the abort event.
    Fatal(String),
}

/// Fills one claimed window: stuffing nulls where the injector schedules
/// them, plugin packets in the gaps, admission stamps everywhere.
fn fill_window(
    plugin: &mut dyn InputPlugin,
    injector: &mut StuffingInjector,
    estimator: &mut BitrateEstimator,
    rt: &StageRuntime,
    pkts: &mut [TsPacket],
    meta: &mut [PacketMetadata],
) -> (usize, FillOutcome) {
    let mut filled = 0;
    while filled < pkts.len() {
        let due = injector.nulls_due();
        if due > 0 {
            let n = due.min(pkts.len() - filled);
            let stamp = rt.clock.now_micros();
            for k in filled..filled + n {
                pkts[k].make_null();
                meta[k] = PacketMetadata::admitted(stamp);
                estimator.feed(&pkts[k]);
            }
            injector.consume_nulls(n);
            filled += n;
            continue;
        }

        let mut cap = pkts.len() - filled;
        if let Some(m) = injector.max_inputs_before_null() {
            cap = cap.min(m);
        }
        // Recycled slots carry stale metadata; plugins must see clean
        // records they may stamp.
        for md in &mut meta[filled..filled + cap] {
            *md = PacketMetadata::default();
        }
        let started = Instant::now();
        let received = catch_unwind(AssertUnwindSafe(|| {
            plugin.receive(
                &mut pkts[filled..filled + cap],
                &mut meta[filled..filled + cap],
            )
        }));
        let n = match received {
            Ok(Ok(n)) => n.min(cap),
            Ok(Err(e)) => return (filled, FillOutcome::Fatal(format!("receive failed: {e}"))),
            Err(_) => return (filled, FillOutcome::Fatal("input plugin panicked".into())),
        };
        if n == 0 {
            return (filled, FillOutcome::Eos);
        }
        let stamp = rt.clock.now_micros();
        for k in filled..filled + n {
            let md = &mut meta[k];
            if md.input_stamp.is_none() {
                md.input_stamp = Some(stamp);
            }
            md.from_input = true;
            estimator.feed(&pkts[k]);
        }
        injector.account_inputs(n);
        filled += n;
        if let Some(limit) = rt.tuning.receive_timeout {
            let elapsed = started.elapsed();
            if elapsed > limit {
                return (
                    filled,
                    FillOutcome::Fatal(format!(
                        "receive took {} ms, limit {} ms",
                        elapsed.as_millis(),
                        limit.as_millis()
                    )),
                );
            }
        }
        if n < cap {
            // Partial batch: push it downstream instead of spinning.
            break;
        }
    }
    (filled, FillOutcome::More)
}

fn publish_bitrate(ctrl: &BitrateController, plugin: &dyn InputPlugin, est: &BitrateEstimator) {
    if ctrl.is_fixed() {
        return;
    }
    if let Some(bps) = plugin.get_bitrate().filter(|&b| b > 0).or_else(|| est.estimate()) {
        ctrl.publish(bps);
    }
}

/// The input executor: claims free slots, runs the stuffing pre-filter
/// and the plugin over them, stamps admission times, seeds and
/// republishes the bitrate, and holds back the first downstream wake
/// until the bootstrap batch is complete.
pub(crate) fn run_input(
    rt: StageRuntime,
    mut plugin: Box<dyn InputPlugin>,
    mut injector: StuffingInjector,
) {
    rt.pin();
    let report = rt.shared.report.clone();
    let mut estimator = BitrateEstimator::new();
    let mut pending: usize = 0;
    let mut primed = false;
    let mut last_adjust = Instant::now();
    let mut failure: Option<String> = None;
    let mut peer_aborted = false;

    loop {
        if rt.terminator.stop_requested() {
            debug!("input: stop requested");
            // Let the plugin cancel any pending operation before stop().
            let _ = plugin.abort();
            break;
        }
        let view = rt
            .ledger
            .wait_window(0, rt.tuning.max_input_packets, 1, pending);
        if view.aborted {
            peer_aborted = true;
            break;
        }
        if view.len == 0 {
            continue;
        }
        let (pkts, meta) = unsafe { rt.buffer.window(view.first, view.len) };
        let (filled, outcome) =
            fill_window(plugin.as_mut(), &mut injector, &mut estimator, &rt, pkts, meta);
        pending += filled;
        rt.shared.packets.fetch_add(filled as u64, Ordering::Relaxed);

        if rt.bitrate.take_stale() {
            estimator.reset_window();
        }
        if !primed || last_adjust.elapsed() >= rt.tuning.bitrate_adjust_interval {
            publish_bitrate(&rt.bitrate, plugin.as_ref(), &estimator);
            last_adjust = Instant::now();
        }

        // The first release is held until the bootstrap accumulation is
        // reached, so downstream stages start with a seeded bitrate.
        let ending = !matches!(outcome, FillOutcome::More);
        if primed || pending >= rt.tuning.initial_input_packets || ending {
            rt.ledger.release(0, pending, false);
            pending = 0;
            primed = true;
        }
        match outcome {
            FillOutcome::More => {}
            FillOutcome::Eos => break,
            FillOutcome::Fatal(msg) => {
                failure = Some(msg);
                break;
            }
        }
    }

    if pending > 0 {
        // A stop during bootstrap accumulation still delivers what was
        // admitted.
        rt.ledger.release(0, pending, false);
    }
    if failure.is_none() && !peer_aborted {
        append_stop_stuffing(&rt, injector.stop_count());
    }
    rt.ledger.set_input_end(0);
    if let Err(e) = plugin.stop() {
        report.warning(format!("stop failed: {e}"));
    }
    finish(&rt, failure);
}

/// Admits the trailing stuffing burst after end of input.
fn append_stop_stuffing(rt: &StageRuntime, count: usize) {
    let mut left = count;
    while left > 0 {
        let view = rt.ledger.wait_window(0, left, 1, 0);
        if view.aborted {
            return;
        }
        if view.len == 0 {
            continue;
        }
        let (pkts, meta) = unsafe { rt.buffer.window(view.first, view.len) };
        let stamp = rt.clock.now_micros();
        for (pkt, md) in pkts.iter_mut().zip(meta.iter_mut()) {
            pkt.make_null();
            *md = PacketMetadata::admitted(stamp);
        }
        rt.shared.packets.fetch_add(view.len as u64, Ordering::Relaxed);
        rt.ledger.release(0, view.len, false);
        left -= view.len;
    }
}

enum Terminal {
    Stall,
    End,
    Abort(String),
}

/// The processor executor. Dropped slots, label-filtered packets and
/// suspended stages bypass the plugin entirely.
pub(crate) fn run_processor(
    rt: StageRuntime,
    mut plugin: Box<dyn ProcessorPlugin>,
    only_label: Option<u8>,
) {
    rt.pin();
    let stage = rt.shared.index;
    let report = rt.shared.report.clone();
    let max_min = rt.ledger.slot_count();
    let mut min_window = 1usize;
    let mut failure: Option<String> = None;

    loop {
        let view = rt
            .ledger
            .wait_window(stage, rt.tuning.max_flushed_packets, min_window, 0);
        min_window = 1;
        if view.aborted {
            // Downstream died; stop accepting and pass the abort on.
            rt.ledger.set_aborted(stage);
            break;
        }
        if view.len == 0 {
            if view.input_end {
                rt.ledger.set_input_end(stage);
                break;
            }
            continue;
        }

        let (pkts, meta) = unsafe { rt.buffer.window(view.first, view.len) };
        let bypassed = rt.shared.suspended.load(Ordering::Relaxed);
        let mut done = 0usize;
        let mut flush = false;
        let mut terminal: Option<Terminal> = None;

        for k in 0..pkts.len() {
            if meta[k].bitrate_changed {
                rt.bitrate.mark_changed();
            }
            let skip = pkts[k].is_dropped()
                || bypassed
                || only_label.is_some_and(|l| !meta[k].has_label(l));
            if !skip {
                let verdict = match catch_unwind(AssertUnwindSafe(|| {
                    plugin.process(&mut pkts[k], &mut meta[k])
                })) {
                    Ok(v) => v,
                    Err(_) => {
                        terminal = Some(Terminal::Abort("processor panicked".into()));
                        break;
                    }
                };
                match verdict {
                    Verdict::Ok => {}
                    Verdict::Null => pkts[k].make_null(),
                    Verdict::Drop => pkts[k].set_dropped(),
                    // Under end-of-input a stall would never resolve;
                    // degrade to pass-through so the chain drains.
                    Verdict::Stall if view.input_end => {}
                    Verdict::Stall => {
                        terminal = Some(Terminal::Stall);
                        break;
                    }
                    Verdict::End => {
                        terminal = Some(Terminal::End);
                        break;
                    }
                    Verdict::Abort => {
                        terminal = Some(Terminal::Abort("plugin aborted".into()));
                        break;
                    }
                }
            }
            done = k + 1;
            if meta[k].flush_requested {
                flush = true;
                break;
            }
        }
        rt.shared.packets.fetch_add(done as u64, Ordering::Relaxed);

        match terminal {
            None => rt.ledger.release(stage, done, flush),
            Some(Terminal::Stall) => {
                // Flush the processed prefix, then sleep until the
                // window grows past its stall-time backlog; the stalled
                // packet is re-presented on the next pass.
                rt.ledger.release(stage, done, true);
                min_window = (view.total - done + 1).min(max_min);
            }
            Some(Terminal::End) => {
                rt.ledger.release(stage, done, true);
                report.verbose("end of stream requested");
                rt.terminator.request_stop();
                rt.ledger.set_input_end(stage);
                break;
            }
            Some(Terminal::Abort(msg)) => {
                rt.ledger.release(stage, done, true);
                rt.ledger.set_aborted(stage); // upstream has no consumer left
                rt.ledger.set_input_end(stage); // downstream drains what it got
                failure = Some(msg);
                break;
            }
        }
    }

    if let Err(e) = plugin.stop() {
        report.warning(format!("stop failed: {e}"));
    }
    finish(&rt, failure);
}

/// The output executor: ships maximal runs of live packets, skips
/// dropped slots, and recycles every consumed slot to the input stage.
pub(crate) fn run_output(rt: StageRuntime, mut plugin: Box<dyn OutputPlugin>) {
    rt.pin();
    let stage = rt.shared.index;
    let report = rt.shared.report.clone();
    // Without an explicit cap the output ships whatever run is ready.
    let max = rt.tuning.max_output_packets.unwrap_or(usize::MAX);
    let mut failure: Option<String> = None;

    'run: loop {
        let view = rt.ledger.wait_window(stage, max, 1, 0);
        if view.aborted {
            break;
        }
        if view.len == 0 {
            if view.input_end {
                break;
            }
            continue;
        }
        let (pkts, meta) = unsafe { rt.buffer.window(view.first, view.len) };
        let mut i = 0;
        while i < pkts.len() {
            if pkts[i].is_dropped() {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            while j < pkts.len() && !pkts[j].is_dropped() {
                j += 1;
            }
            for md in &meta[i..j] {
                if md.bitrate_changed {
                    rt.bitrate.mark_changed();
                }
            }
            let sent = catch_unwind(AssertUnwindSafe(|| plugin.send(&pkts[i..j], &meta[i..j])));
            match sent {
                Ok(Ok(true)) => {
                    rt.shared.packets.fetch_add((j - i) as u64, Ordering::Relaxed);
                }
                Ok(Ok(false)) => failure = Some("output plugin refused the stream".into()),
                Ok(Err(e)) => failure = Some(format!("send failed: {e}")),
                Err(_) => failure = Some("output plugin panicked".into()),
            }
            if failure.is_some() {
                // Recycle what was shipped, then stop the chain.
                rt.ledger.release(stage, i, false);
                rt.ledger.set_aborted(stage);
                break 'run;
            }
            i = j;
        }
        rt.ledger.release(stage, view.len, false);
    }

    if let Err(e) = plugin.stop() {
        report.warning(format!("stop failed: {e}"));
    }
    finish(&rt, failure);
}

fn finish(rt: &StageRuntime, failure: Option<String>) {
    let stage = rt.shared.index;
    let event = match failure {
        Some(message) => {
            rt.shared
                .report
                .error(format!("stage failed: {message}"));
            StageEvent::Aborted { stage, message }
        }
        None => {
            debug!("stage '{}' finished", rt.shared.name);
            StageEvent::Finished { stage }
        }
    };
    let _ = rt.events.send(event);
}
