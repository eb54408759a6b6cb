//! Bitrate computation and propagation.
//!
//! The declared bitrate is one atomic value readable from any stage
//! without a lock; the input executor republishes it on adjustment
//! ticks. Sources in priority order: a fixed command-line override, the
//! input plugin's own report, a PCR slope over the packets just
//! admitted, and finally a DTS slope when the stream carries no PCR.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use ts_types::{TsPacket, PKT_SIZE_BITS, SYSTEM_CLOCK_FREQ, SYSTEM_CLOCK_SUBFREQ};

/// Shared declared-bitrate cell.
pub struct BitrateController {
    declared: AtomicU64,
    fixed: bool,
    stale: AtomicBool,
}

impl BitrateController {
    /// `fixed` pins the declared bitrate for the whole session; estimator
    /// publications are then ignored.
    pub fn new(fixed: Option<u64>) -> Self {
        Self {
            declared: AtomicU64::new(fixed.unwrap_or(0)),
            fixed: fixed.is_some(),
            stale: AtomicBool::new(false),
        }
    }

    /// Current declared bitrate in bits/second, 0 when still unknown.
    pub fn bitrate(&self) -> u64 {
        self.declared.load(Ordering::Acquire)
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Publishes a new value unless the bitrate is fixed.
    pub fn publish(&self, bps: u64) {
        if !self.fixed && bps > 0 {
            self.declared.store(bps, Ordering::Release);
        }
    }

    /// Flags the declared value as stale (a plugin changed the stream).
    pub fn mark_changed(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Consumes the staleness flag.
    pub fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }
}

/// Least-effort slope over one timestamp family: first and last
/// observation of (timestamp, packet index) on a single locked PID.
#[derive(Debug, Default)]
struct TimestampSlope {
    pid: Option<u16>,
    first: Option<(u64, u64)>,
    last: Option<(u64, u64)>,
}

impl TimestampSlope {
    fn feed(&mut self, pid: u16, ts: u64, index: u64) {
        match self.pid {
            None => self.pid = Some(pid),
            Some(p) if p != pid => return,
            _ => {}
        }
        match self.first {
            None => self.first = Some((ts, index)),
            Some((t0, _)) if ts < t0 => {
                // Timestamp went backwards (wrap or splice): restart.
                self.first = Some((ts, index));
                self.last = None;
            }
            _ => self.last = Some((ts, index)),
        }
    }

    fn estimate(&self, clock_hz: u64) -> Option<u64> {
        let (t0, i0) = self.first?;
        let (t1, i1) = self.last?;
        if t1 <= t0 || i1 <= i0 {
            return None;
        }
        let bits = (i1 - i0) * PKT_SIZE_BITS;
        Some(bits * clock_hz / (t1 - t0))
    }

    fn reset_window(&mut self) {
        self.first = None;
        self.last = None;
    }
}

/// Bitrate estimator fed with every packet the input admits.
#[derive(Debug, Default)]
pub struct BitrateEstimator {
    pcr: TimestampSlope,
    dts: TimestampSlope,
    index: u64,
}

impl BitrateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, pkt: &TsPacket) {
        if !pkt.is_dropped() {
            if let Some(pcr) = pkt.pcr() {
                self.pcr.feed(pkt.pid(), pcr, self.index);
            } else if let Some(dts) = pkt.dts().or_else(|| pkt.pts()) {
                self.dts.feed(pkt.pid(), dts, self.index);
            }
        }
        self.index += 1;
    }

    /// PCR slope when available, DTS slope otherwise.
    pub fn estimate(&self) -> Option<u64> {
        self.pcr
            .estimate(SYSTEM_CLOCK_FREQ)
            .or_else(|| self.dts.estimate(SYSTEM_CLOCK_SUBFREQ))
    }

    /// Forgets accumulated observations (the packet index keeps
    /// counting). Used when a plugin signals a bitrate change.
    pub fn reset_window(&mut self) {
        self.pcr.reset_window();
        self.dts.reset_window();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ts_types::{PKT_SIZE, SYNC_BYTE};

    /// Builds a packet whose adaptation field carries the given PCR.
    fn write_pcr(pid: u16, pcr: u64) -> TsPacket {
        let mut pkt = TsPacket::from_bytes([0u8; PKT_SIZE]);
        pkt.b[0] = SYNC_BYTE;
        pkt.set_pid(pid);
        pkt.b[3] = 0x20;
        pkt.b[4] = 7;
        pkt.b[5] = 0x10;
        let base = pcr / 300;
        let ext = pcr % 300;
        let raw = (base << 15) | ext;
        for (k, byte) in pkt.b[6..12].iter_mut().enumerate() {
            *byte = (raw >> (8 * (5 - k))) as u8;
        }
        pkt
    }

    fn plain(pid: u16) -> TsPacket {
        let mut pkt = ts_types::NULL_PACKET;
        pkt.set_pid(pid);
        pkt
    }

    #[test]
    fn controller_publish_and_fixed() {
        let free = BitrateController::new(None);
        assert_eq!(free.bitrate(), 0);
        free.publish(5_000_000);
        assert_eq!(free.bitrate(), 5_000_000);

        let fixed = BitrateController::new(Some(38_000_000));
        fixed.publish(1);
        assert_eq!(fixed.bitrate(), 38_000_000);
        assert!(fixed.is_fixed());
    }

    #[test]
    fn staleness_flag_is_consumed() {
        let ctrl = BitrateController::new(None);
        assert!(!ctrl.take_stale());
        ctrl.mark_changed();
        assert!(ctrl.take_stale());
        assert!(!ctrl.take_stale());
    }

    #[test]
    fn pcr_slope() {
        // 100 packets between two PCRs one second apart: 100 * 1504 bps.
        let mut est = BitrateEstimator::new();
        est.feed(&write_pcr(0x100, 0));
        for _ in 0..99 {
            est.feed(&plain(0x200));
        }
        est.feed(&write_pcr(0x100, SYSTEM_CLOCK_FREQ));
        assert_eq!(est.estimate(), Some(100 * PKT_SIZE_BITS));
    }

    #[test]
    fn pcr_wins_over_dts() {
        let mut est = BitrateEstimator::new();
        est.feed(&write_pcr(0x100, 0));
        est.feed(&write_pcr(0x100, SYSTEM_CLOCK_FREQ / 10));
        // One packet per PCR interval of 1/10 s: 10 * 1504 bps.
        assert_eq!(est.estimate(), Some(10 * PKT_SIZE_BITS));
    }

    #[test]
    fn foreign_pid_does_not_pollute_the_slope() {
        let mut est = BitrateEstimator::new();
        est.feed(&write_pcr(0x100, 0));
        est.feed(&write_pcr(0x300, 999_999)); // different PID, ignored
        est.feed(&write_pcr(0x100, SYSTEM_CLOCK_FREQ));
        // Two packets elapsed between the locked PID's PCRs.
        assert_eq!(est.estimate(), Some(2 * PKT_SIZE_BITS));
    }

    #[test]
    fn reset_window_restarts() {
        let mut est = BitrateEstimator::new();
        est.feed(&write_pcr(0x100, 0));
        est.feed(&write_pcr(0x100, SYSTEM_CLOCK_FREQ));
        assert!(est.estimate().is_some());
        est.reset_window();
        assert_eq!(est.estimate(), None);
    }

    #[test]
    fn no_estimate_from_single_point() {
        let mut est = BitrateEstimator::new();
        est.feed(&write_pcr(0x100, 12345));
        assert_eq!(est.estimate(), None);
    }

    #[test]
    fn dropped_packets_still_advance_the_index() {
        let mut est = BitrateEstimator::new();
        est.feed(&write_pcr(0x100, 0));
        let mut dropped = plain(0x200);
        dropped.set_dropped();
        est.feed(&dropped);
        est.feed(&write_pcr(0x100, SYSTEM_CLOCK_FREQ));
        // Dropped slots still advance the index: they occupy bandwidth
        // until stripped, so the slope counts them.
        assert_eq!(est.estimate(), Some(2 * PKT_SIZE_BITS));
    }
}
