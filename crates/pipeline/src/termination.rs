//! Termination arbitration.
//!
//! Three ways out of a run: natural end-of-input (propagates stage to
//! stage through the ledger), unilateral stop (any plugin returns END or
//! an operator asks for an orderly exit — OR semantics), and joint
//! termination (every opted-in stage must declare itself done — AND
//! semantics). The arbiter owns the global stop flag the input executor
//! polls, and broadcasts on the ledger condvars whenever it flips so
//! blocked stages re-evaluate.

use crate::ledger::WindowLedger;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct Terminator {
    ledger: Arc<WindowLedger>,
    /// Bit per stage that opted into joint termination.
    joint_mask: AtomicU64,
    /// Bits of `joint_mask` whose stages have declared done.
    joint_done: AtomicU64,
    ignore_joint: bool,
    stop: AtomicBool,
}

impl Terminator {
    pub fn new(ledger: Arc<WindowLedger>, ignore_joint: bool) -> Self {
        assert!(
            ledger.stage_count() <= 64,
            "joint-termination mask limits chains to 64 stages"
        );
        Self {
            ledger,
            joint_mask: AtomicU64::new(0),
            joint_done: AtomicU64::new(0),
            ignore_joint,
            stop: AtomicBool::new(false),
        }
    }

    /// Registers a stage as a joint-termination participant. Called by
    /// the supervisor before any executor starts.
    pub fn register_joint(&self, stage: usize) {
        self.joint_mask.fetch_or(1 << stage, Ordering::Relaxed);
    }

    /// Number of joint-termination participants.
    pub fn joint_count(&self) -> u32 {
        self.joint_mask.load(Ordering::Relaxed).count_ones()
    }

    /// A participant declares itself done. When the last one does, the
    /// pipeline stop is requested — unless joint termination is ignored,
    /// in which case declarations have no effect and packets keep
    /// flowing.
    pub fn declare_jointly_done(&self, stage: usize) {
        if self.ignore_joint {
            return;
        }
        let mask = self.joint_mask.load(Ordering::Relaxed);
        let bit = 1u64 << stage;
        if mask & bit == 0 {
            return;
        }
        let done = self.joint_done.fetch_or(bit, Ordering::AcqRel) | bit;
        debug!(stage, "joint termination declared ({done:#x}/{mask:#x})");
        if done & mask == mask {
            self.request_stop();
        }
    }

    /// Requests an orderly stop: the input executor treats it as end of
    /// stream at its next loop head, and everything downstream drains.
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            debug!("pipeline stop requested");
            self.ledger.notify_all();
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Hard termination: raise terminal flags everywhere and wake all
    /// stages. Used when the post-input drain deadline expires and for
    /// forced shutdown.
    pub fn abort_all(&self) {
        self.stop.store(true, Ordering::Release);
        self.ledger.abort_all();
    }
}
