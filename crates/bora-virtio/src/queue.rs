use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::memory::{read_u16_le, write_u16_le, write_u32_le, GuestMemory, GuestMemoryError};
use crate::pci::{VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_MSI_NO_VECTOR};

pub const VIRTQ_DESC_F_NEXT: u16 = 1 << 0;
pub const VIRTQ_DESC_F_WRITE: u16 = 1 << 1;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 1 << 2;

/// Used-ring flag: the device asks the driver to skip notifications.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1 << 0;
/// Avail-ring flag: the driver asks the device to skip interrupts.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1 << 0;

const DESC_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
    #[error("virtqueue is not ready")]
    NotReady,
}

/// One entry of the descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// A fully-walked descriptor chain: one logical I/O, in guest order.
#[derive(Debug, Clone)]
pub struct DescriptorChain {
    head_index: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Sum of all segment lengths.
    pub fn total_len(&self) -> u64 {
        self.descriptors.iter().map(|d| u64::from(d.len)).sum()
    }
}

/// Outcome of popping one avail-ring entry.
///
/// A malformed chain (bad index, loop, nested indirect, over-long) consumes
/// the avail slot but yields `Invalid`, so callers can release the head back
/// to the used ring and keep the guest from wedging the queue.
#[derive(Debug)]
pub enum PoppedDescriptorChain {
    Chain(DescriptorChain),
    Invalid { head_index: u16 },
}

/// Device-side handle for one legacy split virtqueue.
///
/// Ring storage lives in guest memory; this holds the guest addresses and the
/// device-private cursors. Callers serialize access (the handle is shared
/// behind a mutex between the transport and the data paths).
#[derive(Debug)]
pub struct VirtQueue {
    size: u16,
    pfn: u32,
    ready: bool,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,
    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
    // Used index as of the last end_chains, for the interrupt decision.
    saved_used: Wrapping<u16>,
    msix_vector: u16,
}

impl VirtQueue {
    pub fn new(size: u16) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            size,
            pfn: 0,
            ready: false,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            saved_used: Wrapping(0),
            msix_vector: VIRTIO_MSI_NO_VECTOR,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pfn(&self) -> u32 {
        self.pfn
    }

    pub fn msix_vector(&self) -> u16 {
        self.msix_vector
    }

    pub fn set_msix_vector(&mut self, vector: u16) {
        self.msix_vector = vector;
    }

    /// Program the ring from a legacy queue-PFN write (4 KiB pages).
    ///
    /// The legacy layout packs descriptor table, avail ring, and used ring
    /// contiguously, with the used ring aligned up to the 4096-byte vring
    /// boundary. A PFN of zero tears the ring down.
    pub fn set_legacy_pfn(&mut self, pfn: u32) {
        if pfn == 0 {
            let size = self.size;
            let vector = self.msix_vector;
            *self = Self::new(size);
            self.msix_vector = vector;
            return;
        }
        let base = u64::from(pfn) << 12;
        let qsz = u64::from(self.size);
        let avail = base + DESC_SIZE * qsz;
        let used_unaligned = avail + 4 + 2 * qsz + 2;
        let used = (used_unaligned + 4095) & !4095;

        self.pfn = pfn;
        self.desc_addr = base;
        self.avail_addr = avail;
        self.used_addr = used;
        self.next_avail = Wrapping(0);
        self.next_used = Wrapping(0);
        self.saved_used = Wrapping(0);
        self.ready = true;
    }

    /// Restore power-on state. Queue size survives; everything else clears.
    pub fn reset(&mut self) {
        let size = self.size;
        *self = Self::new(size);
    }

    fn avail_idx(&self, mem: &dyn GuestMemory) -> Result<Wrapping<u16>, GuestMemoryError> {
        Ok(Wrapping(read_u16_le(mem, self.avail_addr + 2)?))
    }

    /// Whether the avail ring holds entries the device has not yet consumed.
    ///
    /// A ring that is not set up, unreadable, or claims more pending entries
    /// than its size reads as empty.
    pub fn has_descs(&self, mem: &dyn GuestMemory) -> bool {
        if !self.ready {
            return false;
        }
        let Ok(avail_idx) = self.avail_idx(mem) else {
            return false;
        };
        let pending = (avail_idx - self.next_avail).0;
        if pending > self.size {
            debug!(pending, size = self.size, "avail ring reports impossible backlog");
            return false;
        }
        pending != 0
    }

    fn read_descriptor(
        &self,
        mem: &dyn GuestMemory,
        table: u64,
        index: u16,
    ) -> Result<Descriptor, GuestMemoryError> {
        let base = table + u64::from(index) * DESC_SIZE;
        let mut raw = [0u8; DESC_SIZE as usize];
        mem.read(base, &mut raw)?;
        Ok(Descriptor {
            addr: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        })
    }

    /// Pop and walk the next avail-ring entry.
    ///
    /// `Ok(None)` means the ring is empty. `Err` is a guest-memory access
    /// failure on the ring structures themselves; malformed chains come back
    /// as [`PoppedDescriptorChain::Invalid`] with the slot consumed.
    pub fn pop_descriptor_chain(
        &mut self,
        mem: &dyn GuestMemory,
        max_segs: usize,
    ) -> Result<Option<PoppedDescriptorChain>, QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        if !self.has_descs(mem) {
            return Ok(None);
        }

        let slot = self.next_avail.0 % self.size;
        let head_index = read_u16_le(mem, self.avail_addr + 4 + u64::from(slot) * 2)?;
        self.next_avail += Wrapping(1);

        let invalid = || Ok(Some(PoppedDescriptorChain::Invalid { head_index }));
        if head_index >= self.size {
            debug!(head_index, "avail ring entry out of range");
            return invalid();
        }

        let mut descriptors = Vec::new();
        let mut next = head_index;
        // The outer walk visits at most `size` table entries; malformed rings
        // loop instead of terminating, so count every hop.
        let mut outer_hops = 0u32;
        loop {
            outer_hops += 1;
            if outer_hops > u32::from(self.size) {
                debug!(head_index, "descriptor chain loops");
                return invalid();
            }
            let Ok(desc) = self.read_descriptor(mem, self.desc_addr, next) else {
                return invalid();
            };

            if desc.is_indirect() {
                if desc.len == 0 || desc.len % DESC_SIZE as u32 != 0 {
                    debug!(head_index, len = desc.len, "bad indirect table length");
                    return invalid();
                }
                let table_len = (desc.len / DESC_SIZE as u32) as u16;
                let mut inner = 0u16;
                loop {
                    if inner >= table_len || descriptors.len() >= max_segs {
                        debug!(head_index, "indirect chain out of bounds");
                        return invalid();
                    }
                    let Ok(ind) = self.read_descriptor(mem, desc.addr, inner) else {
                        return invalid();
                    };
                    if ind.is_indirect() {
                        debug!(head_index, "nested indirect descriptor");
                        return invalid();
                    }
                    descriptors.push(ind);
                    if !ind.has_next() {
                        break;
                    }
                    inner = ind.next;
                }
            } else {
                if descriptors.len() >= max_segs {
                    debug!(head_index, max_segs, "descriptor chain too long");
                    return invalid();
                }
                descriptors.push(desc);
            }

            if !desc.has_next() {
                break;
            }
            next = desc.next;
            if next >= self.size {
                debug!(head_index, next, "descriptor next index out of range");
                return invalid();
            }
        }

        Ok(Some(PoppedDescriptorChain::Chain(DescriptorChain {
            head_index,
            descriptors,
        })))
    }

    /// Push the avail cursor back one entry, returning the most recently
    /// popped chain to the driver untouched.
    pub fn return_chain(&mut self) {
        self.next_avail -= Wrapping(1);
    }

    /// Publish a completed chain to the used ring with the given length.
    pub fn publish_used(
        &mut self,
        mem: &dyn GuestMemory,
        head_index: u16,
        len: u32,
    ) -> Result<(), QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        let slot = self.next_used.0 % self.size;
        let elem = self.used_addr + 4 + u64::from(slot) * 8;
        write_u32_le(mem, elem, u32::from(head_index))?;
        write_u32_le(mem, elem + 4, len)?;
        // The element must be visible before the index moves.
        fence(Ordering::Release);
        self.next_used += Wrapping(1);
        write_u16_le(mem, self.used_addr + 2, self.next_used.0)?;
        Ok(())
    }

    fn update_used_flags(
        &self,
        mem: &dyn GuestMemory,
        set: u16,
        clear: u16,
    ) -> Result<(), QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        let flags = read_u16_le(mem, self.used_addr)?;
        write_u16_le(mem, self.used_addr, (flags | set) & !clear)?;
        Ok(())
    }

    /// Ask the driver to stop notifying while the device drains.
    pub fn set_no_notify(&self, mem: &dyn GuestMemory) -> Result<(), QueueError> {
        self.update_used_flags(mem, VIRTQ_USED_F_NO_NOTIFY, 0)
    }

    /// Reopen the notification window.
    pub fn clear_no_notify(&self, mem: &dyn GuestMemory) -> Result<(), QueueError> {
        self.update_used_flags(mem, 0, VIRTQ_USED_F_NO_NOTIFY)
    }

    /// End a batch of used-ring publications and decide whether to interrupt.
    ///
    /// Interrupt if the device drained the avail ring to empty and
    /// NOTIFY_ON_EMPTY was negotiated; otherwise interrupt when the used index
    /// moved since the previous batch and the driver has not set
    /// NO_INTERRUPT.
    pub fn end_chains(
        &mut self,
        mem: &dyn GuestMemory,
        negotiated_features: u64,
        used_all_avail: bool,
    ) -> bool {
        if !self.ready {
            return false;
        }
        let old_idx = self.saved_used;
        let new_idx = self.next_used;
        self.saved_used = new_idx;

        if used_all_avail && negotiated_features & VIRTIO_F_NOTIFY_ON_EMPTY != 0 {
            return true;
        }
        if new_idx == old_idx {
            return false;
        }
        match read_u16_le(mem, self.avail_addr) {
            Ok(flags) => flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0,
            Err(_) => false,
        }
    }
}
