//! The resident packet buffer.
//!
//! One contiguous allocation of 188-byte packet slots plus a parallel
//! metadata array, locked against paging when the host permits. The
//! buffer performs no synchronization of its own: slot ownership is
//! governed entirely by the window ledger, and windowed access is
//! `unsafe` with that partition as its contract.

use crate::data::PacketMetadata;
use crate::error::{PipelineError, PipelineResult};
use std::cell::UnsafeCell;
use ts_types::{TsPacket, NULL_PACKET, PKT_SIZE};
use tracing::{debug, warn};

/// Default buffer size in MiB.
pub const DEFAULT_BUFFER_SIZE_MB: f64 = 16.0;

/// Smallest usable ring. Below this the initial-accumulation and
/// batching defaults stop making sense.
pub const MIN_SLOTS: usize = 16;

/// Fixed-size circular array of packet slots with parallel metadata.
pub struct PacketBuffer {
    packets: Box<[UnsafeCell<TsPacket>]>,
    metadata: Box<[UnsafeCell<PacketMetadata>]>,
    locked: bool,
}

// Disjoint windowed access is enforced by the ledger partition; see
// `window` for the contract.
unsafe impl Sync for PacketBuffer {}
unsafe impl Send for PacketBuffer {}

impl PacketBuffer {
    /// Allocates a ring sized in MiB (fractions allowed) and attempts to
    /// lock it in memory.
    pub fn new(size_mb: f64) -> PipelineResult<Self> {
        if !size_mb.is_finite() || size_mb <= 0.0 {
            return Err(PipelineError::Config(format!(
                "invalid buffer size: {size_mb} MiB"
            )));
        }
        let bytes = (size_mb * 1024.0 * 1024.0) as usize;
        Self::with_slots(bytes / PKT_SIZE)
    }

    /// Allocates a ring with an explicit slot count.
    pub fn with_slots(slots: usize) -> PipelineResult<Self> {
        if slots < MIN_SLOTS {
            return Err(PipelineError::Config(format!(
                "buffer too small: {slots} slots, minimum {MIN_SLOTS}"
            )));
        }

        let mut packets: Vec<UnsafeCell<TsPacket>> = Vec::new();
        packets
            .try_reserve_exact(slots)
            .map_err(|e| PipelineError::Allocation(format!("{slots} packet slots: {e}")))?;
        packets.resize_with(slots, || UnsafeCell::new(NULL_PACKET));

        let mut metadata: Vec<UnsafeCell<PacketMetadata>> = Vec::new();
        metadata
            .try_reserve_exact(slots)
            .map_err(|e| PipelineError::Allocation(format!("{slots} metadata slots: {e}")))?;
        metadata.resize_with(slots, || UnsafeCell::new(PacketMetadata::default()));

        let mut buf = Self {
            packets: packets.into_boxed_slice(),
            metadata: metadata.into_boxed_slice(),
            locked: false,
        };
        buf.locked = buf.try_lock_memory();
        debug!(
            slots,
            locked = buf.locked,
            "packet buffer allocated ({} bytes)",
            slots * PKT_SIZE
        );
        Ok(buf)
    }

    /// Number of packet slots in the ring.
    pub fn slot_count(&self) -> usize {
        self.packets.len()
    }

    /// True when the backing memory is locked against paging.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Borrows a contiguous window of slots.
    ///
    /// # Safety
    ///
    /// The caller must own slots `[first, first + len)` under the window
    /// ledger partition and must not hold any other view of them. The
    /// range must not wrap around the end of the ring.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn window(
        &self,
        first: usize,
        len: usize,
    ) -> (&mut [TsPacket], &mut [PacketMetadata]) {
        debug_assert!(first + len <= self.packets.len());
        // UnsafeCell<T> is layout-transparent; offsets come off the
        // array base so the views keep whole-allocation provenance.
        let pkt_base = self.packets.as_ptr() as *mut TsPacket;
        let meta_base = self.metadata.as_ptr() as *mut PacketMetadata;
        let pkts = std::slice::from_raw_parts_mut(pkt_base.add(first), len);
        let meta = std::slice::from_raw_parts_mut(meta_base.add(first), len);
        (pkts, meta)
    }

    #[cfg(unix)]
    fn try_lock_memory(&self) -> bool {
        let regions: [(*const u8, usize); 2] = [
            (
                self.packets.as_ptr() as *const u8,
                self.packets.len() * std::mem::size_of::<UnsafeCell<TsPacket>>(),
            ),
            (
                self.metadata.as_ptr() as *const u8,
                self.metadata.len() * std::mem::size_of::<UnsafeCell<PacketMetadata>>(),
            ),
        ];
        for (ptr, len) in regions {
            let addr = match std::ptr::NonNull::new(ptr as *mut std::ffi::c_void) {
                Some(a) => a,
                None => return false,
            };
            if let Err(e) = unsafe { nix::sys::mman::mlock(addr.as_ptr() as *const std::ffi::c_void, len) } {
                warn!("cannot lock packet buffer in memory: {e}");
                return false;
            }
        }
        true
    }

    #[cfg(not(unix))]
    fn try_lock_memory(&self) -> bool {
        warn!("memory locking not supported on this platform");
        false
    }
}
