//! Synthetic null-packet injection at the input stage.
//!
//! The input executor runs every admission through this pre-filter: a
//! configurable burst of nulls before the first plugin packet, evenly
//! spaced nulls interleaved with the live stream, and a trailing burst
//! after end of input. Injection writes the null template straight into
//! ring slots; the stream itself never grows or moves.

/// Stuffing schedule state. One instance lives inside the input executor.
#[derive(Debug, Clone)]
pub struct StuffingInjector {
    start_remaining: usize,
    stop_count: usize,
    /// (nullpkt, inpkt): insert `nullpkt` nulls for every `inpkt`
    /// packets delivered by the plugin.
    ratio: Option<(u64, u64)>,
    acc: u64,
    pending: usize,
}

impl StuffingInjector {
    pub fn new(start: usize, stop: usize, ratio: Option<(u64, u64)>) -> Self {
        let ratio = ratio.filter(|&(n, i)| n > 0 && i > 0);
        Self {
            start_remaining: start,
            stop_count: stop,
            ratio,
            acc: 0,
            pending: 0,
        }
    }

    /// Nulls that must be written before the next plugin packet.
    pub fn nulls_due(&self) -> usize {
        self.start_remaining + self.pending
    }

    /// Records `n` nulls as written.
    pub fn consume_nulls(&mut self, n: usize) {
        let from_start = n.min(self.start_remaining);
        self.start_remaining -= from_start;
        self.pending -= n - from_start;
    }

    /// How many plugin packets may be admitted before the next
    /// interleaved null falls due. `None` when interleaving is off.
    pub fn max_inputs_before_null(&self) -> Option<usize> {
        let (nullpkt, inpkt) = self.ratio?;
        // Inputs until the accumulator reaches the threshold.
        Some(((inpkt - self.acc).div_ceil(nullpkt)) as usize)
    }

    /// Accounts `n` plugin packets, scheduling interleaved nulls.
    pub fn account_inputs(&mut self, n: usize) {
        if let Some((nullpkt, inpkt)) = self.ratio {
            self.acc += nullpkt * n as u64;
            self.pending += (self.acc / inpkt) as usize;
            self.acc %= inpkt;
        }
    }

    /// Nulls to append after the plugin declares end of input.
    pub fn stop_count(&self) -> usize {
        self.stop_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_burst_then_nothing() {
        let mut inj = StuffingInjector::new(5, 0, None);
        assert_eq!(inj.nulls_due(), 5);
        inj.consume_nulls(3);
        assert_eq!(inj.nulls_due(), 2);
        inj.consume_nulls(2);
        assert_eq!(inj.nulls_due(), 0);
        assert_eq!(inj.max_inputs_before_null(), None);
        inj.account_inputs(1000);
        assert_eq!(inj.nulls_due(), 0);
    }

    #[test]
    fn one_in_nine_spacing() {
        let mut inj = StuffingInjector::new(0, 0, Some((1, 9)));
        // Simulate the executor: admit inputs up to the cap, then drain
        // due nulls, and record each emitted position.
        let mut positions = Vec::new();
        let mut emitted = 0usize;
        let mut inputs = 0usize;
        while inputs < 1000 {
            let cap = inj.max_inputs_before_null().unwrap().min(1000 - inputs);
            inputs += cap;
            emitted += cap;
            inj.account_inputs(cap);
            while inj.nulls_due() > 0 {
                positions.push(emitted);
                inj.consume_nulls(1);
                emitted += 1;
            }
        }
        assert_eq!(positions.len(), 111);
        assert_eq!(&positions[..3], &[9, 19, 29]);
        assert_eq!(emitted, 1111);
    }

    #[test]
    fn ratio_survives_split_batches() {
        let mut whole = StuffingInjector::new(0, 0, Some((2, 5)));
        whole.account_inputs(25);
        let mut split = StuffingInjector::new(0, 0, Some((2, 5)));
        for _ in 0..25 {
            split.account_inputs(1);
        }
        assert_eq!(whole.nulls_due(), split.nulls_due());
        assert_eq!(whole.nulls_due(), 10);
    }

    #[test]
    fn zero_ratio_is_disabled() {
        let inj = StuffingInjector::new(0, 0, Some((0, 9)));
        assert_eq!(inj.max_inputs_before_null(), None);
    }

    #[test]
    fn stop_count_passthrough() {
        let inj = StuffingInjector::new(0, 7, None);
        assert_eq!(inj.stop_count(), 7);
    }
}
