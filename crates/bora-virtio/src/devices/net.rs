//! virtio-net device frontend.
//!
//! The frontend owns the guest-facing half of virtio-net: feature
//! negotiation, the RX/TX virtqueues, and the device config window. Frames
//! move through an opaque [`NetBackend`] bound at init time.
//!
//! TX is drained by a dedicated worker thread, woken by queue notifies. RX is
//! driven by the backend: whenever its fd turns readable the embedder's event
//! loop invokes [`VirtioNet::rx_callback`] on the event-loop thread.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::mac::{MacAddr, MacParseError};
use crate::memory::GuestMemory;
use crate::pci::{
    InterruptSink, PciIdentity, PciSlot, VirtioDeviceOps, VirtioError, VirtioState,
    PCI_CLASS_NETWORK, VIRTIO_DEV_NET, VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_RING_F_INDIRECT_DESC,
    VIRTIO_TYPE_NET, VIRTIO_VENDOR,
};
use crate::queue::{PoppedDescriptorChain, VirtQueue};
use crate::{lock, wait};

pub const NET_RING_SIZE: u16 = 1024;
pub const NET_MAX_SEGMENTS: usize = 256;

pub const NET_RXQ: u16 = 0;
pub const NET_TXQ: u16 = 1;

const RXQ: usize = 0;
const TXQ: usize = 1;

pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_MRG_RXBUF: u64 = 1 << 15;
pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;

pub const VIRTIO_NET_S_LINK_UP: u16 = 1;

/// vnet header size without `num_buffers` (MRG_RXBUF off).
pub const VNET_HDR_LEN: usize = 10;
/// vnet header size with `num_buffers` (MRG_RXBUF on).
pub const VNET_HDR_LEN_MRG: usize = 12;

/// Features the frontend itself offers; the backend's capability bits are
/// OR-ed in at init. MRG_RXBUF is deliberately absent.
pub const NET_HOST_CAPS: u64 =
    VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS | VIRTIO_F_NOTIFY_ON_EMPTY | VIRTIO_RING_F_INDIRECT_DESC;

// Discard scratch: one TSO-sized frame plus header slack.
const DISCARD_BUF_LEN: usize = 65536 + 64;

const RESET_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Mac(#[from] MacParseError),
    #[error(transparent)]
    Virtio(#[from] VirtioError),
    #[error("failed to spawn the transmit worker: {0}")]
    SpawnWorker(#[source] io::Error),
}

/// A frame-moving backend (tap, loopback, ...).
///
/// The backend owns the vnet header: on RX it prepends a header of the size
/// handed to [`NetBackend::apply_features`] and its `recv` return value
/// includes it; on TX the guest's header leads the segment list and goes out
/// as-is. Implementations are called concurrently from the TX worker and the
/// event-loop thread.
pub trait NetBackend: Send + Sync {
    /// Feature bits this backend contributes to the device's offer.
    fn capabilities(&self) -> u64 {
        0
    }

    /// Negotiated feature mask and the RX vnet header size derived from it.
    fn apply_features(&self, features: u64, vnet_hdr_len: usize);

    /// Transmit one frame, given as an ordered segment list.
    fn send(&self, segments: &[&[u8]]) -> io::Result<usize>;

    /// Scatter one pending frame into `segments`.
    ///
    /// Returns `Ok(0)` when no frame is waiting; `Ok(n)` counts the vnet
    /// header the backend prepended.
    fn recv(&self, segments: &mut [&mut [u8]]) -> io::Result<usize>;
}

/// Features and header size pushed down by negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedFeatures {
    pub features: u64,
    pub vnet_hdr_len: usize,
}

/// One transmitted frame as observed by [`LoopbackNet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxFrame {
    pub segments: usize,
    pub len: usize,
    pub bytes: Vec<u8>,
}

/// In-memory backend: injected frames surface through `recv`, transmitted
/// frames are captured for inspection. The observer every net test uses.
#[derive(Default)]
pub struct LoopbackNet {
    capabilities: u64,
    applied: Mutex<Option<AppliedFeatures>>,
    rx_queue: Mutex<VecDeque<Vec<u8>>>,
    tx_log: Mutex<Vec<TxFrame>>,
    fail_next_recv: AtomicBool,
}

impl LoopbackNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: u64) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Queue an Ethernet frame for delivery; `recv` will prepend the
    /// configured vnet header.
    pub fn push_rx_frame(&self, frame: &[u8]) {
        lock(&self.rx_queue).push_back(frame.to_vec());
    }

    /// Make the next `recv` call fail with an I/O error.
    pub fn fail_next_recv(&self) {
        self.fail_next_recv.store(true, Ordering::Release);
    }

    pub fn tx_frames(&self) -> Vec<TxFrame> {
        lock(&self.tx_log).clone()
    }

    /// Frames queued but not yet pulled through `recv`.
    pub fn pending_rx_frames(&self) -> usize {
        lock(&self.rx_queue).len()
    }

    pub fn applied_features(&self) -> Option<AppliedFeatures> {
        *lock(&self.applied)
    }

    fn vnet_hdr_len(&self) -> usize {
        lock(&self.applied)
            .map(|a| a.vnet_hdr_len)
            .unwrap_or(VNET_HDR_LEN_MRG)
    }
}

impl NetBackend for LoopbackNet {
    fn capabilities(&self) -> u64 {
        self.capabilities
    }

    fn apply_features(&self, features: u64, vnet_hdr_len: usize) {
        *lock(&self.applied) = Some(AppliedFeatures {
            features,
            vnet_hdr_len,
        });
    }

    fn send(&self, segments: &[&[u8]]) -> io::Result<usize> {
        let bytes: Vec<u8> = segments.concat();
        let len = bytes.len();
        lock(&self.tx_log).push(TxFrame {
            segments: segments.len(),
            len,
            bytes,
        });
        Ok(len)
    }

    fn recv(&self, segments: &mut [&mut [u8]]) -> io::Result<usize> {
        if self.fail_next_recv.swap(false, Ordering::AcqRel) {
            return Err(io::Error::other("injected recv failure"));
        }
        let Some(frame) = lock(&self.rx_queue).pop_front() else {
            return Ok(0);
        };
        let mut src = vec![0u8; self.vnet_hdr_len()];
        src.extend_from_slice(&frame);

        let mut copied = 0;
        for segment in segments.iter_mut() {
            if copied == src.len() {
                break;
            }
            let take = (src.len() - copied).min(segment.len());
            segment[..take].copy_from_slice(&src[copied..copied + take]);
            copied += take;
        }
        Ok(copied)
    }
}

/// Open the backend named in the device's option string.
pub fn open_backend(spec: &str) -> io::Result<Arc<dyn NetBackend>> {
    #[cfg(target_os = "linux")]
    {
        if spec.starts_with("tap") {
            return Ok(Arc::new(crate::devices::net_tap::TapBackend::open(spec)?));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("unknown network backend '{spec}'"),
    ))
}

/// The device-specific config window: 10 bytes, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub status: u16,
    pub max_virtqueue_pairs: u16,
}

impl NetConfig {
    pub const SIZE: usize = 10;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..6].copy_from_slice(&self.mac);
        bytes[6..8].copy_from_slice(&self.status.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.max_virtqueue_pairs.to_le_bytes());
        bytes
    }
}

struct RxState {
    merge: bool,
    vnet_hdr_len: usize,
    // Write-only drop site for frames that arrive with no ring to land in.
    discard: Box<[u8]>,
}

struct TxState {
    in_progress: bool,
    shutdown: bool,
}

struct NetCore {
    vs: VirtioState,
    mem: Arc<dyn GuestMemory>,
    queues: [Arc<Mutex<VirtQueue>>; 2],
    backend: Option<Arc<dyn NetBackend>>,
    identity: PciIdentity,
    host_features: u64,
    config: Mutex<NetConfig>,
    // Written by the notify path, read by the RX drain; a plain word is
    // enough, the drain re-checks under the rx mutex anyway.
    rx_ready: AtomicBool,
    // Set for the whole quiesce window of a reset; checked by both paths
    // outside any lock.
    resetting: AtomicBool,
    rx: Mutex<RxState>,
    tx: Mutex<TxState>,
    tx_cond: Condvar,
}

/// An emulated virtio-net PCI device instance.
///
/// Created when the VMM instantiates the PCI slot; the TX worker is spawned
/// immediately and parks on its condition until the first kick. Reset
/// re-initializes ring and feature state but never tears the worker down;
/// dropping the device does.
pub struct VirtioNet {
    core: Arc<NetCore>,
    tx_thread: Option<JoinHandle<()>>,
}

impl VirtioNet {
    /// Build a device from an option string `"<backend>[,<mac>]"`.
    ///
    /// A backend that fails to open leaves the device present but link-down.
    /// A malformed MAC literal or MSI-X allocation failure is fatal.
    pub fn new(
        slot: PciSlot,
        opts: Option<&str>,
        mem: Arc<dyn GuestMemory>,
        intr: Arc<dyn InterruptSink>,
    ) -> Result<Self, NetError> {
        let (backend_spec, mac) = match opts {
            Some(opts) => match opts.split_once(',') {
                Some((name, literal)) => (Some(name), Some(MacAddr::parse(literal)?)),
                None => (Some(opts), None),
            },
            None => (None, None),
        };

        let backend = match backend_spec {
            Some(name) => match open_backend(name) {
                Ok(backend) => Some(backend),
                Err(err) => {
                    warn!(backend = name, %err, "network backend initialization failed");
                    None
                }
            },
            None => None,
        };

        Self::build(slot, backend_spec.is_some(), backend, mac, mem, intr)
    }

    /// Build a device around an already-open backend. Link starts up.
    pub fn with_backend(
        slot: PciSlot,
        backend: Arc<dyn NetBackend>,
        mac: Option<MacAddr>,
        mem: Arc<dyn GuestMemory>,
        intr: Arc<dyn InterruptSink>,
    ) -> Result<Self, NetError> {
        Self::build(slot, true, Some(backend), mac, mem, intr)
    }

    fn build(
        slot: PciSlot,
        backend_requested: bool,
        backend: Option<Arc<dyn NetBackend>>,
        mac: Option<MacAddr>,
        mem: Arc<dyn GuestMemory>,
        intr: Arc<dyn InterruptSink>,
    ) -> Result<Self, NetError> {
        let queues = [
            Arc::new(Mutex::new(VirtQueue::new(NET_RING_SIZE))),
            Arc::new(Mutex::new(VirtQueue::new(NET_RING_SIZE))),
        ];

        let host_features =
            NET_HOST_CAPS | backend.as_ref().map(|b| b.capabilities()).unwrap_or(0);
        let mac = mac.unwrap_or_else(|| MacAddr::derive_local(slot.bus, slot.slot, slot.func));

        // Link is up if no backend was requested or the backend opened.
        let link_up = !backend_requested || backend.is_some();

        let vs = VirtioState::new(queues.to_vec(), intr, true)?;

        let core = Arc::new(NetCore {
            vs,
            mem,
            queues,
            backend,
            identity: PciIdentity {
                vendor_id: VIRTIO_VENDOR,
                device_id: VIRTIO_DEV_NET,
                class: PCI_CLASS_NETWORK,
                subsystem_vendor_id: VIRTIO_VENDOR,
                subsystem_id: VIRTIO_TYPE_NET,
            },
            host_features,
            config: Mutex::new(NetConfig {
                mac: mac.octets(),
                status: if link_up { VIRTIO_NET_S_LINK_UP } else { 0 },
                max_virtqueue_pairs: 1,
            }),
            rx_ready: AtomicBool::new(false),
            resetting: AtomicBool::new(false),
            rx: Mutex::new(RxState {
                merge: true,
                vnet_hdr_len: VNET_HDR_LEN_MRG,
                discard: vec![0u8; DISCARD_BUF_LEN].into_boxed_slice(),
            }),
            tx: Mutex::new(TxState {
                in_progress: false,
                shutdown: false,
            }),
            tx_cond: Condvar::new(),
        });

        let worker = Arc::clone(&core);
        let tx_thread = thread::Builder::new()
            .name(format!("vtnet-{}:{} tx", slot.slot, slot.func))
            .spawn(move || tx_worker(worker))
            .map_err(NetError::SpawnWorker)?;

        Ok(Self {
            core,
            tx_thread: Some(tx_thread),
        })
    }

    /// Read from the BAR0 register window (vCPU thread).
    pub fn bar0_read(&self, offset: u64, size: usize) -> u32 {
        self.core.vs.bar0_read(&*self.core, offset, size)
    }

    /// Write to the BAR0 register window (vCPU thread).
    pub fn bar0_write(&self, offset: u64, size: usize, value: u32) {
        self.core.vs.bar0_write(&*self.core, offset, size, value)
    }

    pub fn bar0_size(&self) -> u64 {
        self.core.vs.bar0_size(&*self.core)
    }

    /// Entry point for the event loop: the backend has frames ready.
    pub fn rx_callback(&self) {
        self.core.rx_callback();
    }

    pub fn identity(&self) -> PciIdentity {
        self.core.identity
    }

    pub fn host_features(&self) -> u64 {
        self.core.host_features
    }

    pub fn negotiated_features(&self) -> u64 {
        self.core.vs.negotiated_features()
    }

    pub fn config(&self) -> NetConfig {
        *lock(&self.core.config)
    }

    pub fn is_rx_ready(&self) -> bool {
        self.core.rx_ready.load(Ordering::Acquire)
    }

    pub fn rx_merged(&self) -> bool {
        lock(&self.core.rx).merge
    }

    pub fn rx_vnet_hdr_len(&self) -> usize {
        lock(&self.core.rx).vnet_hdr_len
    }

    /// Whether the TX worker is parked on its condition.
    pub fn is_tx_idle(&self) -> bool {
        !lock(&self.core.tx).in_progress
    }
}

impl Drop for VirtioNet {
    fn drop(&mut self) {
        {
            let mut tx = lock(&self.core.tx);
            tx.shutdown = true;
            self.core.tx_cond.notify_one();
        }
        if let Some(handle) = self.tx_thread.take() {
            let _ = handle.join();
        }
    }
}

impl NetCore {
    fn rx_callback(&self) {
        let mut rx = lock(&self.rx);
        self.drain_rx(&mut rx);
    }

    /// Drain the RX ring, called with the rx mutex held.
    fn drain_rx(&self, rx: &mut RxState) {
        let Some(backend) = self.backend.as_deref() else {
            return;
        };
        let mem = &*self.mem;
        let rxq = &self.queues[RXQ];

        if !self.rx_ready.load(Ordering::Acquire) || self.resetting.load(Ordering::Acquire) {
            // Ring not set up yet, or the guest is resetting the device.
            // Drop the frame and try later.
            discard_frame(backend, &mut rx.discard);
            return;
        }

        if !lock(rxq).has_descs(mem) {
            // No buffers posted. Drop the frame; interrupt on empty if that
            // was negotiated.
            discard_frame(backend, &mut rx.discard);
            self.finish_chains(RXQ, true);
            return;
        }

        loop {
            let popped = lock(rxq).pop_descriptor_chain(mem, NET_MAX_SEGMENTS);
            let chain = match popped {
                Ok(Some(PoppedDescriptorChain::Chain(chain))) => chain,
                Ok(Some(PoppedDescriptorChain::Invalid { head_index })) => {
                    debug!(head_index, "dropping malformed rx chain");
                    let _ = lock(rxq).publish_used(mem, head_index, 0);
                    if lock(rxq).has_descs(mem) {
                        continue;
                    }
                    break;
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(%err, "rx ring unreadable");
                    break;
                }
            };

            // Each posted buffer is assumed to hold an entire frame plus the
            // rx header; materialize the chain and let the backend scatter
            // into it.
            let mut buffers: Vec<Vec<u8>> = chain
                .descriptors()
                .iter()
                .map(|d| vec![0u8; d.len as usize])
                .collect();
            let received = {
                let mut iovs: Vec<&mut [u8]> =
                    buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
                backend.recv(&mut iovs)
            };

            let len = match received {
                Err(err) => {
                    debug!(%err, "backend recv failed");
                    break;
                }
                Ok(0) => {
                    // No more frames, but avail entries remain: hand the
                    // chain back to the driver untouched.
                    lock(rxq).return_chain();
                    self.finish_chains(RXQ, false);
                    return;
                }
                Ok(len) => len,
            };

            let mut remaining = len;
            for (desc, buffer) in chain.descriptors().iter().zip(&buffers) {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(buffer.len());
                if let Err(err) = mem.write(desc.addr, &buffer[..take]) {
                    debug!(%err, "rx chain points outside guest memory");
                    break;
                }
                remaining -= take;
            }

            let _ = lock(rxq).publish_used(mem, chain.head_index(), len as u32);

            if !lock(rxq).has_descs(mem) {
                break;
            }
        }

        // Interrupt if needed, including for NOTIFY_ON_EMPTY.
        self.finish_chains(RXQ, true);
    }

    /// First kick marks the RX ring live; the backend-driven callback is
    /// authoritative from then on, so later kicks are no-ops.
    fn ping_rxq(&self) {
        if !self.rx_ready.swap(true, Ordering::AcqRel) {
            let _ = lock(&self.queues[RXQ]).set_no_notify(&*self.mem);
        }
    }

    /// TX kick, on the vCPU thread: no I/O here, just wake the worker.
    fn ping_txq(&self) {
        let mem = &*self.mem;
        {
            let txq = lock(&self.queues[TXQ]);
            if !txq.has_descs(mem) {
                return;
            }
        }
        let tx = lock(&self.tx);
        let _ = lock(&self.queues[TXQ]).set_no_notify(mem);
        if !tx.in_progress {
            self.tx_cond.notify_one();
        }
    }

    /// Pop one TX chain and hand it to the backend.
    fn proc_tx(&self, txq: &Mutex<VirtQueue>) {
        let mem = &*self.mem;
        let popped = lock(txq).pop_descriptor_chain(mem, NET_MAX_SEGMENTS);
        let chain = match popped {
            Ok(Some(PoppedDescriptorChain::Chain(chain))) => chain,
            Ok(Some(PoppedDescriptorChain::Invalid { head_index })) => {
                debug!(head_index, "dropping malformed tx chain");
                let _ = lock(txq).publish_used(mem, head_index, 0);
                return;
            }
            Ok(None) => return,
            Err(err) => {
                debug!(%err, "tx ring unreadable");
                return;
            }
        };

        // The first descriptor leads with the virtio-net header.
        let mut segments = Vec::with_capacity(chain.descriptors().len());
        for desc in chain.descriptors() {
            let mut buffer = vec![0u8; desc.len as usize];
            if let Err(err) = mem.read(desc.addr, &mut buffer) {
                debug!(%err, "tx chain points outside guest memory");
                let _ = lock(txq).publish_used(mem, chain.head_index(), 0);
                return;
            }
            segments.push(buffer);
        }
        let len = chain.total_len() as u32;

        if let Some(backend) = &self.backend {
            let iovs: Vec<&[u8]> = segments.iter().map(|s| s.as_slice()).collect();
            if let Err(err) = backend.send(&iovs) {
                debug!(%err, "backend send failed");
            }
        }

        // Chain is processed, release it with the summed length.
        let _ = lock(txq).publish_used(mem, chain.head_index(), len);
    }

    fn finish_chains(&self, queue: usize, used_all_avail: bool) {
        let features = self.vs.negotiated_features();
        let interrupt =
            lock(&self.queues[queue]).end_chains(&*self.mem, features, used_all_avail);
        if interrupt {
            self.vs.interrupt_queue(queue as u16);
        }
    }

    /// Stall until the transmit worker has finished its current pass.
    fn tx_wait(&self) {
        loop {
            let tx = lock(&self.tx);
            if !tx.in_progress {
                return;
            }
            drop(tx);
            thread::sleep(RESET_POLL);
        }
    }
}

impl VirtioDeviceOps for NetCore {
    fn name(&self) -> &'static str {
        "virtio-net"
    }

    fn host_features(&self) -> u64 {
        self.host_features
    }

    fn config_size(&self) -> usize {
        NetConfig::SIZE
    }

    fn read_config(&self, offset: usize, data: &mut [u8]) {
        let bytes = lock(&self.config).to_bytes();
        if offset >= bytes.len() {
            data.fill(0);
            return;
        }
        let end = offset
            .checked_add(data.len())
            .unwrap_or(bytes.len())
            .min(bytes.len());
        let n = end - offset;
        data[..n].copy_from_slice(&bytes[offset..end]);
        data[n..].fill(0);
    }

    fn write_config(&self, offset: usize, data: &[u8]) {
        if let Some(end) = offset.checked_add(data.len()) {
            if end <= MacAddr::LEN {
                // The driver is allowed to change the MAC address.
                lock(&self.config).mac[offset..end].copy_from_slice(data);
                return;
            }
        }
        debug!(offset, "write to read-only config register");
    }

    fn negotiate_features(&self, features: u64) {
        let vnet_hdr_len = {
            let mut rx = lock(&self.rx);
            if features & VIRTIO_NET_F_MRG_RXBUF == 0 {
                rx.merge = false;
                rx.vnet_hdr_len = VNET_HDR_LEN;
            } else {
                rx.merge = true;
                rx.vnet_hdr_len = VNET_HDR_LEN_MRG;
            }
            rx.vnet_hdr_len
        };
        // Tell the backend which of its advertised capabilities to enable and
        // what header size to emit.
        if let Some(backend) = &self.backend {
            backend.apply_features(features, vnet_hdr_len);
        }
    }

    fn queue_notify(&self, queue: u16) {
        match queue {
            NET_RXQ => self.ping_rxq(),
            NET_TXQ => self.ping_txq(),
            _ => debug!(queue, "notify for unwired queue"),
        }
    }

    fn reset(&self) {
        debug!("device reset requested");
        self.resetting.store(true, Ordering::Release);

        // Quiesce both paths: poll the worker idle, and take the rx mutex
        // (an RX pass runs entirely under it, so acquisition is the barrier).
        self.tx_wait();
        {
            let mut rx = lock(&self.rx);
            self.rx_ready.store(false, Ordering::Release);
            rx.merge = true;
            rx.vnet_hdr_len = VNET_HDR_LEN_MRG;
        }

        // Now reset rings, MSI-X routing, and negotiated capabilities.
        self.vs.reset();

        self.resetting.store(false, Ordering::Release);
    }
}

fn discard_frame(backend: &dyn NetBackend, scratch: &mut [u8]) {
    let mut iov = [scratch];
    let _ = backend.recv(&mut iov);
}

/// The transmit worker: one per device, lives for the device's lifetime.
fn tx_worker(core: Arc<NetCore>) {
    let mem = Arc::clone(&core.mem);
    let txq = Arc::clone(&core.queues[TXQ]);

    let mut tx = lock(&core.tx);
    if tx.shutdown {
        return;
    }
    // Wait for the queue pointers to be initialised and the first kick.
    tx = wait(&core.tx_cond, tx);

    loop {
        // tx mutex is held here.
        loop {
            if tx.shutdown {
                return;
            }
            let runnable = if core.resetting.load(Ordering::Acquire)
                || !lock(&txq).has_descs(&*mem)
            {
                // Reopen the notification window before sleeping, then check
                // again: a kick that raced the emptiness check must not be
                // lost.
                let _ = lock(&txq).clear_no_notify(&*mem);
                fence(Ordering::SeqCst);
                !core.resetting.load(Ordering::Acquire) && lock(&txq).has_descs(&*mem)
            } else {
                true
            };
            if runnable {
                break;
            }
            tx.in_progress = false;
            tx = wait(&core.tx_cond, tx);
        }
        let _ = lock(&txq).set_no_notify(&*mem);
        tx.in_progress = true;
        drop(tx);

        loop {
            core.proc_tx(&txq);
            if !lock(&txq).has_descs(&*mem) {
                break;
            }
        }

        // Generate an interrupt if needed.
        core.finish_chains(TXQ, true);

        tx = lock(&core.tx);
    }
}
