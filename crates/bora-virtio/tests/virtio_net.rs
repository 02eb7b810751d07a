use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use bora_virtio::devices::net::{
    LoopbackNet, NetBackend, VirtioNet, NET_HOST_CAPS, NET_RXQ, NET_TXQ, VIRTIO_NET_F_MAC,
    VIRTIO_NET_F_STATUS,
};
use bora_virtio::mac::MacAddr;
use bora_virtio::memory::{
    read_u16_le, write_u16_le, write_u32_le, write_u64_le, GuestMemory, GuestRam,
};
use bora_virtio::pci::{
    InterruptSink, PciSlot, VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_PCI_LEGACY_GUEST_FEATURES,
    VIRTIO_PCI_LEGACY_ISR, VIRTIO_PCI_LEGACY_QUEUE_NOTIFY, VIRTIO_PCI_LEGACY_QUEUE_PFN,
    VIRTIO_PCI_LEGACY_QUEUE_SEL, VIRTIO_PCI_LEGACY_STATUS,
};
use bora_virtio::queue::{
    VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE, VIRTQ_USED_F_NO_NOTIFY,
};

const QSZ: u64 = 1024;
const RX_RING_BASE: u64 = 0x10000;
const TX_RING_BASE: u64 = 0x20000;
const RAM_SIZE: usize = 0x40000;

#[derive(Debug, Default)]
struct IrqState {
    raises: u64,
    msix_vectors: Vec<u16>,
}

#[derive(Default)]
struct SharedIrq(Mutex<IrqState>);

impl SharedIrq {
    fn raises(&self) -> u64 {
        self.0.lock().unwrap().raises
    }
}

impl InterruptSink for SharedIrq {
    fn raise_legacy_irq(&self) {
        self.0.lock().unwrap().raises += 1;
    }

    fn lower_legacy_irq(&self) {}

    fn signal_msix(&self, vector: u16) {
        self.0.lock().unwrap().msix_vectors.push(vector);
    }
}

/// A minimal guest-side ring driver over one legacy virtqueue.
struct RingDriver {
    base: u64,
    desc: u64,
    avail: u64,
    used: u64,
    next_desc: u16,
    avail_idx: u16,
}

impl RingDriver {
    fn new(mem: &GuestRam, base: u64) -> Self {
        let desc = base;
        let avail = base + 16 * QSZ;
        let used_unaligned = avail + 4 + 2 * QSZ + 2;
        let used = (used_unaligned + 4095) & !4095;

        write_u16_le(mem, avail, 0).unwrap();
        write_u16_le(mem, avail + 2, 0).unwrap();
        write_u16_le(mem, used, 0).unwrap();
        write_u16_le(mem, used + 2, 0).unwrap();

        Self {
            base,
            desc,
            avail,
            used,
            next_desc: 0,
            avail_idx: 0,
        }
    }

    fn program(&self, dev: &VirtioNet, queue: u16) {
        dev.bar0_write(VIRTIO_PCI_LEGACY_QUEUE_SEL, 2, u32::from(queue));
        dev.bar0_write(VIRTIO_PCI_LEGACY_QUEUE_PFN, 4, (self.base >> 12) as u32);
    }

    /// Write a linked chain of `(addr, len, device_writable)` descriptors and
    /// return its head index. The chain is not yet visible to the device.
    fn add_chain(&mut self, mem: &GuestRam, segments: &[(u64, u32, bool)]) -> u16 {
        let head = self.next_desc;
        for (i, (addr, len, writable)) in segments.iter().enumerate() {
            let index = self.next_desc;
            let last = i + 1 == segments.len();
            let mut flags = if *writable { VIRTQ_DESC_F_WRITE } else { 0 };
            if !last {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            let next = if last { 0 } else { index + 1 };
            let entry = self.desc + u64::from(index) * 16;
            write_u64_le(mem, entry, *addr).unwrap();
            write_u32_le(mem, entry + 8, *len).unwrap();
            write_u16_le(mem, entry + 12, flags).unwrap();
            write_u16_le(mem, entry + 14, next).unwrap();
            self.next_desc += 1;
        }
        head
    }

    /// Publish a chain head on the avail ring.
    fn publish(&mut self, mem: &GuestRam, head: u16) {
        let slot = u64::from(self.avail_idx) % QSZ;
        write_u16_le(mem, self.avail + 4 + slot * 2, head).unwrap();
        self.avail_idx += 1;
        write_u16_le(mem, self.avail + 2, self.avail_idx).unwrap();
    }

    fn set_avail_flags(&self, mem: &GuestRam, flags: u16) {
        write_u16_le(mem, self.avail, flags).unwrap();
    }

    fn used_idx(&self, mem: &GuestRam) -> u16 {
        read_u16_le(mem, self.used + 2).unwrap()
    }

    fn used_flags(&self, mem: &GuestRam) -> u16 {
        read_u16_le(mem, self.used).unwrap()
    }

    fn used_elem(&self, mem: &GuestRam, slot: u64) -> (u32, u32) {
        let entry = self.used + 4 + slot * 8;
        let mut id = [0u8; 4];
        let mut len = [0u8; 4];
        mem.read(entry, &mut id).unwrap();
        mem.read(entry + 4, &mut len).unwrap();
        (u32::from_le_bytes(id), u32::from_le_bytes(len))
    }
}

fn slot() -> PciSlot {
    PciSlot {
        bus: 0,
        slot: 3,
        func: 0,
    }
}

fn setup() -> (VirtioNet, Arc<GuestRam>, Arc<LoopbackNet>, Arc<SharedIrq>) {
    setup_with_backend(Arc::new(LoopbackNet::new()))
}

fn setup_with_backend<B: NetBackend + 'static>(
    backend: Arc<B>,
) -> (VirtioNet, Arc<GuestRam>, Arc<B>, Arc<SharedIrq>) {
    let mem = Arc::new(GuestRam::new(RAM_SIZE));
    let irq = Arc::new(SharedIrq::default());
    let dev = VirtioNet::with_backend(
        slot(),
        backend.clone(),
        None,
        mem.clone() as Arc<dyn GuestMemory>,
        irq.clone() as Arc<dyn InterruptSink>,
    )
    .unwrap();
    (dev, mem, backend, irq)
}

fn negotiate(dev: &VirtioNet, features: u64) {
    dev.bar0_write(VIRTIO_PCI_LEGACY_GUEST_FEATURES, 4, features as u32);
}

fn kick(dev: &VirtioNet, queue: u16) {
    dev.bar0_write(VIRTIO_PCI_LEGACY_QUEUE_NOTIFY, 2, u32::from(queue));
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn cold_init_is_link_up_with_parked_worker() {
    let (dev, _mem, _backend, _irq) = setup();

    assert_eq!(dev.config().status, 1);
    assert_eq!(dev.config().max_virtqueue_pairs, 1);
    assert_eq!(dev.host_features(), NET_HOST_CAPS);
    assert!(dev.is_tx_idle());
    assert!(!dev.is_rx_ready());
    assert!(dev.rx_merged());
    assert_eq!(dev.rx_vnet_hdr_len(), 12);
}

#[test]
fn failed_backend_open_leaves_the_device_link_down() {
    let mem = Arc::new(GuestRam::new(0x1000));
    let irq = Arc::new(SharedIrq::default());
    let dev = VirtioNet::new(
        slot(),
        Some("missing0"),
        mem as Arc<dyn GuestMemory>,
        irq as Arc<dyn InterruptSink>,
    )
    .unwrap();

    assert_eq!(dev.config().status, 0);
    assert_eq!(dev.host_features(), NET_HOST_CAPS);
    assert!(dev.is_tx_idle());
}

#[test]
fn option_string_controls_backend_and_mac() {
    let mem = Arc::new(GuestRam::new(0x1000));
    let irq = Arc::new(SharedIrq::default());

    // No options at all: no backend, but the link reads up.
    let dev = VirtioNet::new(
        slot(),
        None,
        mem.clone() as Arc<dyn GuestMemory>,
        irq.clone() as Arc<dyn InterruptSink>,
    )
    .unwrap();
    assert_eq!(dev.config().status, 1);
    // The MAC is derived from the slot, deterministically.
    assert_eq!(
        dev.config().mac,
        MacAddr::derive_local(0, 3, 0).octets()
    );
    drop(dev);

    // A MAC literal overrides derivation.
    let dev = VirtioNet::new(
        slot(),
        Some("missing0,02:aa:bb:cc:dd:ee"),
        mem.clone() as Arc<dyn GuestMemory>,
        irq.clone() as Arc<dyn InterruptSink>,
    )
    .unwrap();
    assert_eq!(dev.config().mac, [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
    drop(dev);

    // A malformed literal is fatal.
    assert!(VirtioNet::new(
        slot(),
        Some("missing0,not-a-mac"),
        mem as Arc<dyn GuestMemory>,
        irq as Arc<dyn InterruptSink>,
    )
    .is_err());
}

#[test]
fn first_rx_kick_latches_ready_and_suppresses_notifies() {
    let (dev, mem, _backend, _irq) = setup();
    let rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);

    assert!(!dev.is_rx_ready());
    kick(&dev, NET_RXQ);
    assert!(dev.is_rx_ready());
    assert_eq!(
        rx.used_flags(&mem) & VIRTQ_USED_F_NO_NOTIFY,
        VIRTQ_USED_F_NO_NOTIFY
    );

    // Later kicks are no-ops; the backend callback is authoritative.
    kick(&dev, NET_RXQ);
    assert!(dev.is_rx_ready());
    assert_eq!(
        rx.used_flags(&mem) & VIRTQ_USED_F_NO_NOTIFY,
        VIRTQ_USED_F_NO_NOTIFY
    );
}

#[test]
fn tx_frame_reaches_backend_with_summed_length() {
    let (dev, mem, backend, irq) = setup();
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    let mut tx = RingDriver::new(&mem, TX_RING_BASE);
    tx.program(&dev, NET_TXQ);

    // Header (10 bytes, no MRG_RXBUF) and a 64-byte payload.
    let header = 0x1000u64;
    let payload = 0x2000u64;
    mem.write(header, &[0u8; 10]).unwrap();
    let body: Vec<u8> = (0u8..64).collect();
    mem.write(payload, &body).unwrap();

    let head = tx.add_chain(&mem, &[(header, 10, false), (payload, 64, false)]);
    tx.publish(&mem, head);
    kick(&dev, NET_TXQ);

    assert!(wait_until(Duration::from_secs(5), || tx.used_idx(&mem) == 1));

    let frames = backend.tx_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].segments, 2);
    assert_eq!(frames[0].len, 74);
    assert_eq!(&frames[0].bytes[10..], &body[..]);

    let (id, len) = tx.used_elem(&mem, 0);
    assert_eq!(id, u32::from(head));
    assert_eq!(len, 74);

    // The drain ended with an interrupt.
    assert!(wait_until(Duration::from_secs(5), || irq.raises() >= 1));
    assert_eq!(dev.bar0_read(VIRTIO_PCI_LEGACY_ISR, 1), 1);
    assert_eq!(dev.bar0_read(VIRTIO_PCI_LEGACY_ISR, 1), 0);
}

#[test]
fn spurious_tx_kick_is_ignored() {
    let (dev, mem, backend, _irq) = setup();
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    let tx = RingDriver::new(&mem, TX_RING_BASE);
    tx.program(&dev, NET_TXQ);

    kick(&dev, NET_TXQ);
    thread::sleep(Duration::from_millis(50));
    assert!(dev.is_tx_idle());
    assert!(backend.tx_frames().is_empty());
    assert_eq!(tx.used_idx(&mem), 0);
}

#[test]
fn rx_delivery_fills_guest_buffers() {
    let (dev, mem, backend, irq) = setup();
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    let mut rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    kick(&dev, NET_RXQ);

    let buffer = 0x1000u64;
    let head = rx.add_chain(&mem, &[(buffer, 2048, true)]);
    rx.publish(&mem, head);

    let frame: Vec<u8> = (0u8..100).collect();
    backend.push_rx_frame(&frame);
    dev.rx_callback();

    assert_eq!(rx.used_idx(&mem), 1);
    let (id, len) = rx.used_elem(&mem, 0);
    assert_eq!(id, u32::from(head));
    // 10-byte vnet header plus the frame.
    assert_eq!(len, 110);

    let mut delivered = vec![0u8; 110];
    mem.read(buffer, &mut delivered).unwrap();
    assert_eq!(&delivered[..10], &[0u8; 10]);
    assert_eq!(&delivered[10..], &frame[..]);

    assert_eq!(irq.raises(), 1);
}

#[test]
fn rx_before_first_kick_discards_the_frame() {
    let (dev, mem, backend, irq) = setup();
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    let mut rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    let head = rx.add_chain(&mem, &[(0x1000, 2048, true)]);
    rx.publish(&mem, head);

    backend.push_rx_frame(&[0xaa; 60]);
    dev.rx_callback();

    // The frame was consumed by the discard path; the ring was not touched.
    assert_eq!(backend.pending_rx_frames(), 0);
    assert_eq!(rx.used_idx(&mem), 0);
    assert_eq!(irq.raises(), 0);
}

#[test]
fn rx_with_no_buffers_discards_and_interrupts_on_empty() {
    let (dev, mem, backend, irq) = setup();
    negotiate(
        &dev,
        VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS | VIRTIO_F_NOTIFY_ON_EMPTY,
    );

    let rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    kick(&dev, NET_RXQ);

    backend.push_rx_frame(&[0xbb; 60]);
    dev.rx_callback();

    assert_eq!(backend.pending_rx_frames(), 0);
    assert_eq!(rx.used_idx(&mem), 0);
    // NOTIFY_ON_EMPTY wakes the guest so it can post buffers.
    assert_eq!(irq.raises(), 1);
}

#[test]
fn backend_zero_mid_drain_retains_the_chain_and_suppresses_the_interrupt() {
    let (dev, mem, backend, irq) = setup();
    negotiate(
        &dev,
        VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS | VIRTIO_F_NOTIFY_ON_EMPTY,
    );

    let mut rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    kick(&dev, NET_RXQ);
    // Opt out of interrupts so only the NOTIFY_ON_EMPTY path can fire.
    rx.set_avail_flags(&mem, VIRTQ_AVAIL_F_NO_INTERRUPT);

    let first_buf = 0x1000u64;
    let second_buf = 0x2000u64;
    let first = rx.add_chain(&mem, &[(first_buf, 2048, true)]);
    let second = rx.add_chain(&mem, &[(second_buf, 2048, true)]);
    rx.publish(&mem, first);
    rx.publish(&mem, second);

    // One frame waiting, two chains posted: 118 bytes + 10-byte header = 128.
    backend.push_rx_frame(&[0xcc; 118]);
    dev.rx_callback();

    assert_eq!(rx.used_idx(&mem), 1);
    let (id, len) = rx.used_elem(&mem, 0);
    assert_eq!(id, u32::from(first));
    assert_eq!(len, 128);
    // Mid-drain stop: the second chain went back to the avail side and no
    // interrupt was generated.
    assert_eq!(irq.raises(), 0);
    assert!(irq.0.lock().unwrap().msix_vectors.is_empty());

    // The retained chain is reused for the next frame; draining to empty now
    // interrupts through NOTIFY_ON_EMPTY despite the driver's opt-out.
    backend.push_rx_frame(&[0xdd; 50]);
    dev.rx_callback();

    assert_eq!(rx.used_idx(&mem), 2);
    let (id, len) = rx.used_elem(&mem, 1);
    assert_eq!(id, u32::from(second));
    assert_eq!(len, 60);
    let mut delivered = vec![0u8; 60];
    mem.read(second_buf, &mut delivered).unwrap();
    assert_eq!(&delivered[10..], &[0xdd; 50]);
    assert_eq!(irq.raises(), 1);
}

#[test]
fn backend_error_aborts_the_rx_drain() {
    let (dev, mem, backend, irq) = setup();
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    let mut rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    kick(&dev, NET_RXQ);

    let first = rx.add_chain(&mem, &[(0x1000, 2048, true)]);
    let second = rx.add_chain(&mem, &[(0x2000, 2048, true)]);
    rx.publish(&mem, first);
    rx.publish(&mem, second);

    backend.fail_next_recv();
    dev.rx_callback();

    assert_eq!(rx.used_idx(&mem), 0);
    assert_eq!(irq.raises(), 0);

    // The event loop redelivers; the drain picks up from the next chain.
    backend.push_rx_frame(&[0xee; 40]);
    dev.rx_callback();
    assert_eq!(rx.used_idx(&mem), 1);
    let (id, _len) = rx.used_elem(&mem, 0);
    assert_eq!(id, u32::from(second));
}

#[test]
fn mrg_rxbuf_absent_negotiation_shrinks_the_header() {
    let (dev, _mem, backend, _irq) = setup();

    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    assert!(!dev.rx_merged());
    assert_eq!(dev.rx_vnet_hdr_len(), 10);
    let applied = backend.applied_features().unwrap();
    assert_eq!(applied.features, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);
    assert_eq!(applied.vnet_hdr_len, 10);
}

/// Backend whose `send` blocks until the test opens the gate, to hold the TX
/// worker mid-drain.
#[derive(Default)]
struct GatedNet {
    open: Mutex<bool>,
    cond: Condvar,
    sends: Mutex<usize>,
}

impl GatedNet {
    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

impl NetBackend for GatedNet {
    fn apply_features(&self, _features: u64, _vnet_hdr_len: usize) {}

    fn send(&self, segments: &[&[u8]]) -> io::Result<usize> {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
        *self.sends.lock().unwrap() += 1;
        Ok(segments.iter().map(|s| s.len()).sum())
    }

    fn recv(&self, _segments: &mut [&mut [u8]]) -> io::Result<usize> {
        Ok(0)
    }
}

#[test]
fn reset_waits_for_an_inflight_tx_pass() {
    let (dev, mem, backend, _irq) = setup_with_backend(Arc::new(GatedNet::default()));
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    let mut tx = RingDriver::new(&mem, TX_RING_BASE);
    tx.program(&dev, NET_TXQ);

    mem.write(0x1000, &[0u8; 74]).unwrap();
    let head = tx.add_chain(&mem, &[(0x1000, 74, false)]);
    tx.publish(&mem, head);
    kick(&dev, NET_TXQ);

    // The worker is now parked inside the backend send.
    assert!(wait_until(Duration::from_secs(5), || !dev.is_tx_idle()));

    thread::scope(|scope| {
        let resetter = scope.spawn(|| dev.bar0_write(VIRTIO_PCI_LEGACY_STATUS, 1, 0));

        // Reset must not complete while the drain is in flight.
        thread::sleep(Duration::from_millis(100));
        assert!(!resetter.is_finished());

        backend.release();
        resetter.join().unwrap();
    });

    assert!(dev.is_tx_idle());
    assert_eq!(*backend.sends.lock().unwrap(), 1);
    assert!(!dev.is_rx_ready());
    assert!(dev.rx_merged());
    assert_eq!(dev.rx_vnet_hdr_len(), 12);
    assert_eq!(dev.negotiated_features(), 0);
    dev.bar0_write(VIRTIO_PCI_LEGACY_QUEUE_SEL, 2, u32::from(NET_TXQ));
    assert_eq!(dev.bar0_read(VIRTIO_PCI_LEGACY_QUEUE_PFN, 4), 0);
}

#[test]
fn consecutive_resets_are_idempotent() {
    let (dev, mem, _backend, _irq) = setup();
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);
    assert_eq!(dev.rx_vnet_hdr_len(), 10);

    let rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    kick(&dev, NET_RXQ);
    assert!(dev.is_rx_ready());

    for _ in 0..2 {
        dev.bar0_write(VIRTIO_PCI_LEGACY_STATUS, 1, 0);
        assert!(!dev.is_rx_ready());
        assert!(dev.rx_merged());
        assert_eq!(dev.rx_vnet_hdr_len(), 12);
        assert_eq!(dev.negotiated_features(), 0);
        assert!(dev.is_tx_idle());
    }
}

#[test]
fn renegotiation_after_reset_restores_the_same_state() {
    let (dev, _mem, backend, _irq) = setup();

    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);
    assert_eq!(dev.rx_vnet_hdr_len(), 10);
    assert!(!dev.rx_merged());

    dev.bar0_write(VIRTIO_PCI_LEGACY_STATUS, 1, 0);
    assert_eq!(dev.rx_vnet_hdr_len(), 12);
    assert!(dev.rx_merged());

    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);
    assert_eq!(dev.rx_vnet_hdr_len(), 10);
    assert!(!dev.rx_merged());
    assert_eq!(
        backend.applied_features().unwrap().vnet_hdr_len,
        10
    );
}

#[test]
fn rx_after_reset_discards_until_the_next_kick() {
    let (dev, mem, backend, _irq) = setup();
    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);

    let mut rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    kick(&dev, NET_RXQ);

    dev.bar0_write(VIRTIO_PCI_LEGACY_STATUS, 1, 0);

    backend.push_rx_frame(&[0x11; 60]);
    dev.rx_callback();
    assert_eq!(backend.pending_rx_frames(), 0);

    // Ring pointers are gone; the guest has to bring the queue up again.
    let mut rx = RingDriver::new(&mem, RX_RING_BASE);
    rx.program(&dev, NET_RXQ);
    kick(&dev, NET_RXQ);
    let head = rx.add_chain(&mem, &[(0x1000, 2048, true)]);
    rx.publish(&mem, head);

    negotiate(&dev, VIRTIO_NET_F_MAC | VIRTIO_NET_F_STATUS);
    backend.push_rx_frame(&[0x22; 30]);
    dev.rx_callback();
    assert_eq!(rx.used_idx(&mem), 1);
}
