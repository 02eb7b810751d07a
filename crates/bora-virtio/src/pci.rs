use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::lock;
use crate::queue::VirtQueue;

// Legacy virtio-pci BAR0 register window. With MSI-X enabled the two vector
// registers are present and device-specific config starts at 0x18.
pub const VIRTIO_PCI_LEGACY_HOST_FEATURES: u64 = 0x00;
pub const VIRTIO_PCI_LEGACY_GUEST_FEATURES: u64 = 0x04;
pub const VIRTIO_PCI_LEGACY_QUEUE_PFN: u64 = 0x08;
pub const VIRTIO_PCI_LEGACY_QUEUE_NUM: u64 = 0x0c;
pub const VIRTIO_PCI_LEGACY_QUEUE_SEL: u64 = 0x0e;
pub const VIRTIO_PCI_LEGACY_QUEUE_NOTIFY: u64 = 0x10;
pub const VIRTIO_PCI_LEGACY_STATUS: u64 = 0x12;
pub const VIRTIO_PCI_LEGACY_ISR: u64 = 0x13;
pub const VIRTIO_PCI_LEGACY_MSIX_CONFIG_VECTOR: u64 = 0x14;
pub const VIRTIO_PCI_LEGACY_MSIX_QUEUE_VECTOR: u64 = 0x16;

pub const VIRTIO_PCI_LEGACY_CONFIG_OFFSET_MSIX: u64 = 0x18;
pub const VIRTIO_PCI_LEGACY_CONFIG_OFFSET_NO_MSIX: u64 = 0x14;

pub const VIRTIO_PCI_LEGACY_VRING_ALIGN: u64 = 4096;

pub const VIRTIO_PCI_LEGACY_ISR_QUEUE: u8 = 1 << 0;

pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 1;
pub const VIRTIO_STATUS_DRIVER: u8 = 2;
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 4;
pub const VIRTIO_STATUS_FAILED: u8 = 0x80;

pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

// Transport-level feature bits (legacy window exposes the low 32).
pub const VIRTIO_F_NOTIFY_ON_EMPTY: u64 = 1 << 24;
pub const VIRTIO_RING_F_INDIRECT_DESC: u64 = 1 << 28;

pub const VIRTIO_VENDOR: u16 = 0x1af4;
pub const VIRTIO_DEV_NET: u16 = 0x1000;
pub const VIRTIO_TYPE_NET: u16 = 1;
pub const PCI_CLASS_NETWORK: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VirtioError {
    #[error("msi-x allocation of {vectors} vectors failed")]
    MsixAllocation { vectors: u16 },
}

/// PCI bus/slot/function a device instance occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciSlot {
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
}

/// Config-space identity the embedding VMM writes for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
}

/// Where interrupts go: legacy INTx and MSI-X injection, owned by the
/// embedding VMM.
pub trait InterruptSink: Send + Sync {
    /// Reserve an MSI-X table of `vectors` entries (one per queue plus the
    /// config vector) on the device's MSI-X BAR. Called once at device init;
    /// failure is fatal to the device.
    fn prepare_msix(&self, vectors: u16) -> Result<(), VirtioError> {
        let _ = vectors;
        Ok(())
    }

    fn raise_legacy_irq(&self);

    fn lower_legacy_irq(&self);

    fn signal_msix(&self, vector: u16);
}

/// Device-specific half of the transport contract.
///
/// The transport owns the register window and the generic queue/feature
/// state; everything device-flavored is dispatched through this trait.
pub trait VirtioDeviceOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Feature bits the device offers the driver.
    fn host_features(&self) -> u64;

    /// Size in bytes of the device-specific config window.
    fn config_size(&self) -> usize;

    fn read_config(&self, offset: usize, data: &mut [u8]);

    fn write_config(&self, offset: usize, data: &[u8]);

    /// Applied once when the driver writes its accepted feature mask.
    fn negotiate_features(&self, features: u64);

    /// The driver kicked the given queue.
    fn queue_notify(&self, queue: u16);

    /// The driver wrote zero to the device-status register.
    fn reset(&self);
}

#[derive(Debug)]
struct TransportRegs {
    status: u8,
    isr: u8,
    queue_sel: u16,
    msix_config_vector: u16,
}

impl TransportRegs {
    fn new() -> Self {
        Self {
            status: 0,
            isr: 0,
            queue_sel: 0,
            msix_config_vector: VIRTIO_MSI_NO_VECTOR,
        }
    }
}

/// Generic legacy virtio-pci transport state: the handle a device instance
/// passes back on every transport call.
///
/// The register file sits behind its own mutex; queue handles are shared with
/// the device's data paths, which take the per-queue locks without going
/// through here.
pub struct VirtioState {
    queues: Vec<Arc<Mutex<VirtQueue>>>,
    intr: Arc<dyn InterruptSink>,
    negotiated: AtomicU64,
    msix_enabled: bool,
    regs: Mutex<TransportRegs>,
}

impl VirtioState {
    /// Link up the transport. With `use_msix`, MSI-X vectors for every queue
    /// plus the config vector are reserved up front; failure propagates and
    /// the device must not be registered.
    pub fn new(
        queues: Vec<Arc<Mutex<VirtQueue>>>,
        intr: Arc<dyn InterruptSink>,
        use_msix: bool,
    ) -> Result<Self, VirtioError> {
        if use_msix {
            let vectors = queues.len() as u16 + 1;
            intr.prepare_msix(vectors)?;
        }
        Ok(Self {
            queues,
            intr,
            negotiated: AtomicU64::new(0),
            msix_enabled: use_msix,
            regs: Mutex::new(TransportRegs::new()),
        })
    }

    pub fn negotiated_features(&self) -> u64 {
        self.negotiated.load(Ordering::Acquire)
    }

    pub fn config_offset(&self) -> u64 {
        if self.msix_enabled {
            VIRTIO_PCI_LEGACY_CONFIG_OFFSET_MSIX
        } else {
            VIRTIO_PCI_LEGACY_CONFIG_OFFSET_NO_MSIX
        }
    }

    /// Total BAR0 window size for this device.
    pub fn bar0_size(&self, dev: &dyn VirtioDeviceOps) -> u64 {
        self.config_offset() + dev.config_size() as u64
    }

    fn selected_queue(&self, queue_sel: u16) -> Option<&Arc<Mutex<VirtQueue>>> {
        self.queues.get(usize::from(queue_sel))
    }

    /// Read from the BAR0 register window. Naturally aligned accesses of
    /// 1, 2, or 4 bytes; wider reads are truncated to 4.
    pub fn bar0_read(&self, dev: &dyn VirtioDeviceOps, offset: u64, size: usize) -> u32 {
        let cfg_off = self.config_offset();
        if offset >= cfg_off {
            let mut buf = [0u8; 4];
            let size = size.min(4);
            dev.read_config((offset - cfg_off) as usize, &mut buf[..size]);
            return u32::from_le_bytes(buf);
        }

        let mut regs = lock(&self.regs);
        let value = match offset {
            VIRTIO_PCI_LEGACY_HOST_FEATURES => dev.host_features() as u32,
            VIRTIO_PCI_LEGACY_GUEST_FEATURES => self.negotiated.load(Ordering::Acquire) as u32,
            VIRTIO_PCI_LEGACY_QUEUE_PFN => self
                .selected_queue(regs.queue_sel)
                .map(|q| lock(q).pfn())
                .unwrap_or(0),
            VIRTIO_PCI_LEGACY_QUEUE_NUM => self
                .selected_queue(regs.queue_sel)
                .map(|q| u32::from(lock(q).size()))
                .unwrap_or(0),
            VIRTIO_PCI_LEGACY_QUEUE_SEL => u32::from(regs.queue_sel),
            VIRTIO_PCI_LEGACY_QUEUE_NOTIFY => 0,
            VIRTIO_PCI_LEGACY_STATUS => u32::from(regs.status),
            VIRTIO_PCI_LEGACY_ISR => {
                // Read-to-clear, and deasserts INTx.
                let isr = regs.isr;
                regs.isr = 0;
                drop(regs);
                self.intr.lower_legacy_irq();
                return u32::from(isr) & size_mask(size);
            }
            VIRTIO_PCI_LEGACY_MSIX_CONFIG_VECTOR if self.msix_enabled => {
                u32::from(regs.msix_config_vector)
            }
            VIRTIO_PCI_LEGACY_MSIX_QUEUE_VECTOR if self.msix_enabled => self
                .selected_queue(regs.queue_sel)
                .map(|q| u32::from(lock(q).msix_vector()))
                .unwrap_or_else(|| u32::from(VIRTIO_MSI_NO_VECTOR)),
            _ => {
                debug!(device = dev.name(), offset, "read of unknown register");
                0
            }
        };
        value & size_mask(size)
    }

    /// Write to the BAR0 register window.
    ///
    /// Device callbacks (notify, negotiate, reset, config writes) run with
    /// the register mutex released; they take their own locks.
    pub fn bar0_write(&self, dev: &dyn VirtioDeviceOps, offset: u64, size: usize, value: u32) {
        let cfg_off = self.config_offset();
        if offset >= cfg_off {
            let size = size.min(4);
            let bytes = value.to_le_bytes();
            dev.write_config((offset - cfg_off) as usize, &bytes[..size]);
            return;
        }

        let mut regs = lock(&self.regs);
        match offset {
            VIRTIO_PCI_LEGACY_GUEST_FEATURES => {
                drop(regs);
                // The driver cannot accept bits it was never offered.
                let features = u64::from(value) & dev.host_features();
                self.negotiated.store(features, Ordering::Release);
                dev.negotiate_features(features);
            }
            VIRTIO_PCI_LEGACY_QUEUE_PFN => {
                let queue = self.selected_queue(regs.queue_sel).cloned();
                drop(regs);
                match queue {
                    Some(q) => lock(&q).set_legacy_pfn(value),
                    None => debug!(device = dev.name(), "queue pfn write with no queue selected"),
                }
            }
            VIRTIO_PCI_LEGACY_QUEUE_SEL => regs.queue_sel = value as u16,
            VIRTIO_PCI_LEGACY_QUEUE_NOTIFY => {
                drop(regs);
                let queue = value as u16;
                if usize::from(queue) < self.queues.len() {
                    dev.queue_notify(queue);
                } else {
                    debug!(device = dev.name(), queue, "notify for unknown queue");
                }
            }
            VIRTIO_PCI_LEGACY_STATUS => {
                if value == 0 {
                    drop(regs);
                    dev.reset();
                } else {
                    regs.status = value as u8;
                }
            }
            VIRTIO_PCI_LEGACY_MSIX_CONFIG_VECTOR if self.msix_enabled => {
                regs.msix_config_vector = value as u16;
            }
            VIRTIO_PCI_LEGACY_MSIX_QUEUE_VECTOR if self.msix_enabled => {
                let queue = self.selected_queue(regs.queue_sel).cloned();
                drop(regs);
                match queue {
                    Some(q) => lock(&q).set_msix_vector(value as u16),
                    None => debug!(device = dev.name(), "queue vector write with no queue selected"),
                }
            }
            VIRTIO_PCI_LEGACY_HOST_FEATURES
            | VIRTIO_PCI_LEGACY_QUEUE_NUM
            | VIRTIO_PCI_LEGACY_ISR => {
                debug!(device = dev.name(), offset, "write to read-only register");
            }
            _ => {
                debug!(device = dev.name(), offset, value, "write to unknown register");
            }
        }
    }

    /// Generic device reset: tear down every ring, forget the negotiated
    /// features and MSI-X routing, clear status and ISR, drop INTx.
    ///
    /// Devices layer their own quiesce/reinit around this.
    pub fn reset(&self) {
        for queue in &self.queues {
            lock(queue).reset();
        }
        self.negotiated.store(0, Ordering::Release);
        {
            let mut regs = lock(&self.regs);
            regs.status = 0;
            regs.isr = 0;
            regs.queue_sel = 0;
            regs.msix_config_vector = VIRTIO_MSI_NO_VECTOR;
        }
        self.intr.lower_legacy_irq();
    }

    /// Inject a used-ring interrupt for the given queue, through MSI-X when
    /// the driver routed one, otherwise by ISR + INTx.
    pub fn interrupt_queue(&self, queue: u16) {
        let vector = self
            .selected_queue(queue)
            .map(|q| lock(q).msix_vector())
            .unwrap_or(VIRTIO_MSI_NO_VECTOR);
        if self.msix_enabled && vector != VIRTIO_MSI_NO_VECTOR {
            self.intr.signal_msix(vector);
            return;
        }
        {
            let mut regs = lock(&self.regs);
            regs.isr |= VIRTIO_PCI_LEGACY_ISR_QUEUE;
        }
        self.intr.raise_legacy_irq();
    }
}

fn size_mask(size: usize) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => u32::MAX,
    }
}
