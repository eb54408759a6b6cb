//! The window ledger: per-stage sliding windows over the packet ring.
//!
//! Every stage owns a contiguous (mod ring size) window of slots. The
//! windows partition the ring: ownership moves only by a stage releasing
//! the head of its window to the tail of the next stage's. All window
//! state lives behind one global mutex; each stage has its own condition
//! variable so a release wakes exactly the stage it feeds.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, Default)]
struct WindowState {
    first: usize,
    count: usize,
    input_end: bool,
    aborted: bool,
}

/// A stage's view of its window at one wait, clipped to a contiguous run.
#[derive(Debug, Clone, Copy)]
pub struct WindowView {
    /// Index of the first slot in the run.
    pub first: usize,
    /// Length of the contiguous run (never wraps the ring edge).
    pub len: usize,
    /// Total slots available to the stage, including any wrapped part.
    pub total: usize,
    /// No more packets will arrive in this window once it drains.
    pub input_end: bool,
    /// A neighboring stage aborted; stop as soon as practical.
    pub aborted: bool,
}

/// Snapshot of one stage's window, for diagnostics and the control channel.
#[derive(Debug, Clone, Copy)]
pub struct WindowSnapshot {
    pub first: usize,
    pub count: usize,
    pub input_end: bool,
    pub aborted: bool,
}

pub struct WindowLedger {
    slots: usize,
    state: Mutex<Vec<WindowState>>,
    todo: Vec<Condvar>,
}

impl WindowLedger {
    /// Creates the ledger for `stages` stages over `slots` slots. Stage 0
    /// (the input) starts owning the entire ring; every other window is
    /// empty.
    pub fn new(slots: usize, stages: usize) -> Self {
        assert!(stages >= 2, "a chain needs at least input and output");
        assert!(slots > 0);
        let mut windows = vec![WindowState::default(); stages];
        windows[0].count = slots;
        Self {
            slots,
            state: Mutex::new(windows),
            todo: (0..stages).map(|_| Condvar::new()).collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    pub fn stage_count(&self) -> usize {
        self.todo.len()
    }

    /// Blocks until the stage's window holds at least `min` slots beyond
    /// `skip`, or a terminal flag is raised, then returns the contiguous
    /// run starting after `skip`.
    ///
    /// `skip` lets the input stage keep claimed-but-unreleased slots out
    /// of the view while it accumulates its initial batch. A view with
    /// `len == 0` is only returned under `input_end` or `aborted`.
    pub fn wait_window(&self, stage: usize, max: usize, min: usize, skip: usize) -> WindowView {
        let min = min.max(1);
        let mut st = self.state.lock().unwrap();
        loop {
            let w = st[stage];
            debug_assert!(skip <= w.count);
            let avail = w.count - skip;
            if w.aborted || w.input_end || avail >= min {
                let first = (w.first + skip) % self.slots;
                let len = avail.min(max).min(self.slots - first);
                return WindowView {
                    first,
                    len,
                    total: avail,
                    input_end: w.input_end,
                    aborted: w.aborted,
                };
            }
            st = self.todo[stage].wait(st).unwrap();
        }
    }

    /// Transfers the first `n` slots of `stage`'s window to the next
    /// stage and wakes it if anything moved (or a flush is requested).
    pub fn release(&self, stage: usize, n: usize, flush: bool) {
        if n == 0 && !flush {
            return;
        }
        let mut st = self.state.lock().unwrap();
        let stages = st.len();
        debug_assert!(n <= st[stage].count, "release beyond window");
        st[stage].first = (st[stage].first + n) % self.slots;
        st[stage].count -= n;
        let next = (stage + 1) % stages;
        st[next].count += n;
        drop(st);
        self.todo[next].notify_all();
    }

    /// Marks end-of-input on the next stage and wakes it. No-op for the
    /// last stage: end-of-input never wraps back to the input.
    pub fn set_input_end(&self, stage: usize) {
        let next = stage + 1;
        if next >= self.todo.len() {
            return;
        }
        let mut st = self.state.lock().unwrap();
        st[next].input_end = true;
        drop(st);
        self.todo[next].notify_all();
    }

    /// Marks the previous stage aborted and wakes it. No-op for the
    /// input stage, which has no upstream neighbor.
    pub fn set_aborted(&self, stage: usize) {
        if stage == 0 {
            return;
        }
        let prev = stage - 1;
        let mut st = self.state.lock().unwrap();
        st[prev].aborted = true;
        drop(st);
        self.todo[prev].notify_all();
    }

    /// Raises both terminal flags on every stage. Used for deadline
    /// expiry and forced shutdown.
    pub fn abort_all(&self) {
        let mut st = self.state.lock().unwrap();
        for w in st.iter_mut() {
            w.input_end = true;
            w.aborted = true;
        }
        drop(st);
        self.notify_all();
    }

    /// Wakes every stage so loop-head conditions get re-evaluated.
    pub fn notify_all(&self) {
        for cv in &self.todo {
            cv.notify_all();
        }
    }

    /// Snapshot of all windows, taken under the ledger mutex.
    pub fn snapshot(&self) -> Vec<WindowSnapshot> {
        let st = self.state.lock().unwrap();
        st.iter()
            .map(|w| WindowSnapshot {
                first: w.first,
                count: w.count,
                input_end: w.input_end,
                aborted: w.aborted,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn assert_partition(ledger: &WindowLedger) {
        let snap = ledger.snapshot();
        let total: usize = snap.iter().map(|w| w.count).sum();
        assert_eq!(total, ledger.slot_count(), "windows must partition the ring");
        for (i, w) in snap.iter().enumerate() {
            let next = &snap[(i + 1) % snap.len()];
            assert_eq!(
                (w.first + w.count) % ledger.slot_count(),
                next.first,
                "stage {i} window must abut its successor"
            );
        }
    }

    #[test]
    fn initial_partition() {
        let ledger = WindowLedger::new(100, 4);
        assert_partition(&ledger);
        let snap = ledger.snapshot();
        assert_eq!(snap[0].count, 100);
        assert!(snap[1..].iter().all(|w| w.count == 0));
    }

    #[test]
    fn release_moves_ownership() {
        let ledger = WindowLedger::new(100, 3);
        ledger.release(0, 30, false);
        ledger.release(1, 10, false);
        assert_partition(&ledger);
        let snap = ledger.snapshot();
        assert_eq!(snap[0].count, 70);
        assert_eq!(snap[1].count, 20);
        assert_eq!(snap[2].count, 10);
        assert_eq!(snap[1].first, 10);
        assert_eq!(snap[2].first, 0);
    }

    #[test]
    fn release_wraps_to_input() {
        let ledger = WindowLedger::new(50, 2);
        ledger.release(0, 50, false);
        ledger.release(1, 50, false);
        assert_partition(&ledger);
        let snap = ledger.snapshot();
        assert_eq!(snap[0].count, 50);
        assert_eq!(snap[0].first, 0);
    }

    #[test]
    fn window_never_wraps_in_one_view() {
        let ledger = WindowLedger::new(100, 2);
        ledger.release(0, 90, false);
        ledger.release(1, 90, false);
        // Stage 0 now owns 100 slots starting at index 90.
        let w = ledger.wait_window(0, usize::MAX, 1, 0);
        assert_eq!(w.first, 90);
        assert_eq!(w.len, 10);
        assert_eq!(w.total, 100);
    }

    #[test]
    fn skip_offsets_the_view() {
        let ledger = WindowLedger::new(100, 2);
        let w = ledger.wait_window(0, usize::MAX, 1, 25);
        assert_eq!(w.first, 25);
        assert_eq!(w.total, 75);
    }

    #[test]
    fn wait_blocks_until_release() {
        let ledger = Arc::new(WindowLedger::new(64, 2));
        let consumer = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                let w = ledger.wait_window(1, 64, 1, 0);
                (w.first, w.len)
            })
        };
        thread::sleep(Duration::from_millis(50));
        ledger.release(0, 5, false);
        let (first, len) = consumer.join().unwrap();
        assert_eq!((first, len), (0, 5));
        assert_partition(&ledger);
    }

    #[test]
    fn input_end_unblocks_empty_window() {
        let ledger = Arc::new(WindowLedger::new(64, 3));
        let consumer = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.wait_window(1, 64, 1, 0))
        };
        thread::sleep(Duration::from_millis(50));
        ledger.set_input_end(0);
        let w = consumer.join().unwrap();
        assert!(w.input_end);
        assert_eq!(w.len, 0);
    }

    #[test]
    fn abort_marks_previous_stage() {
        let ledger = WindowLedger::new(64, 3);
        ledger.set_aborted(2);
        let snap = ledger.snapshot();
        assert!(snap[1].aborted);
        assert!(!snap[0].aborted);
        assert!(!snap[2].aborted);
    }

    #[test]
    fn min_threshold_waits_for_growth() {
        let ledger = Arc::new(WindowLedger::new(64, 2));
        ledger.release(0, 3, false);
        let consumer = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.wait_window(1, 64, 5, 0))
        };
        thread::sleep(Duration::from_millis(50));
        ledger.release(0, 4, false);
        let w = consumer.join().unwrap();
        assert_eq!(w.total, 7);
    }
}
