//! Parallel-bus slave engine (spec.md §4.3): the 6502-facing memory-mapped
//! byte register, serviced by a programmable-I/O engine and two DMA
//! channels. This module only implements the software side of the state
//! machine; the PIO program itself (sampling PHI2, driving the bus,
//! reloading the output-shift register to the `0xFF` sentinel) lives in
//! `bridge-bsp` and is opaque to this engine beyond the `BusTxDma` trait.

use bridge_ring::{assemble_span, is_contiguous, RingCursor, RingSource};

use crate::callback::WriteSink;
use crate::config::{BUS_RX_RING_SIZE, DEVICE_TX_BUFFER_SIZE, MAX_BUS_PAYLOAD, MAX_DEVICES};
use crate::devbuf::ByteQueue;
use crate::device::{DeviceId, DIRECTION_BIT};

/// One-shot DMA for the parallel-bus TX (read-response) FIFO.
pub trait BusTxDma {
    fn program_oneshot(&mut self, staging: &[u8]);
    /// Drains the "this one-shot transfer finished" flag set by the DMA
    /// completion interrupt.
    fn take_complete(&mut self) -> bool;
    /// Drains the "CPU read while the TX FIFO was empty" flag the PIO
    /// program's status register exposes.
    fn take_underflow(&mut self) -> bool;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RxState {
    Idle,
    GotDevice {
        device: DeviceId,
    },
    Receiving {
        device: DeviceId,
        want: u8,
        start: usize,
        consumed: u8,
    },
}

#[derive(Default, Clone, Copy, Debug)]
pub struct BusStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub rx_overruns: u32,
    pub rx_bankruptcies: u32,
    pub tx_underflows: u32,
    pub rx_oversized_writes: u32,
}

/// The parallel-bus slave engine. Generic over the TX DMA trait and the
/// RX ring's `RingSource`, so the RX/TX state machines are host-testable
/// the same way the SPI engine is.
pub struct BusEngine<'a, D, R> {
    rx_buf: [u8; BUS_RX_RING_SIZE],
    rx_cursor: RingCursor,
    // Crate-visible rather than private: the bridge's own tests drive
    // these directly to simulate DMA traffic the same way the engine's
    // own tests do.
    pub(crate) rx_src: R,
    rx_state: RxState,
    rx_callbacks: [Option<&'a mut dyn WriteSink>; MAX_DEVICES],
    pub(crate) tx_dma: D,
    tx_bufs: [ByteQueue<DEVICE_TX_BUFFER_SIZE>; MAX_DEVICES],
    pending_read: Option<DeviceId>,
    sending: Option<DeviceId>,
    stats: BusStats,
}

impl<'a, D, R> BusEngine<'a, D, R>
where
    D: BusTxDma,
    R: RingSource,
{
    pub fn new(rx_src: R, tx_dma: D) -> Self {
        BusEngine {
            rx_buf: [0; BUS_RX_RING_SIZE],
            rx_cursor: RingCursor::new(BUS_RX_RING_SIZE),
            rx_src,
            rx_state: RxState::Idle,
            rx_callbacks: Default::default(),
            tx_dma,
            tx_bufs: Default::default(),
            pending_read: None,
            sending: None,
            stats: BusStats::default(),
        }
    }

    /// Configures the PIO program and DMA rings; idempotent (spec.md
    /// §4.3 `init`).
    pub fn init(&mut self) {
        self.rx_state = RxState::Idle;
        self.pending_read = None;
        self.sending = None;
    }

    /// Enables the engine once hardware is configured (spec.md §4.3
    /// `start`). The software state machine has nothing further to do;
    /// `bridge-bsp` enables the PIO state machine and DMA channels here.
    pub fn start(&mut self) {}

    /// Raw pointer to the RX ring buffer and its fixed length, for the
    /// hardware layer to arm a continuously-reloading DMA channel into
    /// before the first call to `task`. See `SpiEngine::rx_buf_ptr` for
    /// the pinning requirement this carries.
    pub fn rx_buf_ptr(&mut self) -> *mut u8 {
        self.rx_buf.as_mut_ptr()
    }

    pub fn rx_buf_len(&self) -> usize {
        self.rx_buf.len()
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// Installs the per-device callback invoked once per completed WRITE
    /// from the CPU (spec.md §4.3 `register_rx_callback`).
    pub fn register_rx_callback(&mut self, device: DeviceId, cb: &'a mut dyn WriteSink) {
        self.rx_callbacks[device.index()] = Some(cb);
    }

    /// Enqueues bytes for the CPU to read back, returning how many
    /// actually fit (spec.md §4.3 `device_write`).
    pub fn device_write(&mut self, device: DeviceId, bytes: &[u8]) -> usize {
        self.tx_bufs[device.index()].push_partial(bytes)
    }

    /// True if any device has data queued for the CPU to read, used by
    /// the bridge to drive the 6502-facing interrupt line (spec.md §4.4,
    /// §6). Device 0 is excluded: it never holds real payload, only the
    /// synthesized interrupt-source-query response.
    pub fn has_pending_tx(&self) -> bool {
        self.tx_bufs[1..].iter().any(|q| !q.is_empty())
    }

    /// Feeds freshly-DMA'd bytes into the RX ring's backing memory; real
    /// hardware does this via DMA, tests call it directly.
    pub fn fill_rx_ring(&mut self, at: usize, bytes: &[u8]) {
        let size = self.rx_buf.len();
        for (i, &b) in bytes.iter().enumerate() {
            self.rx_buf[(at + i) % size] = b;
        }
    }

    /// Drives the parser and services pending reads; call frequently
    /// from the main loop (spec.md §4.3 `task`).
    pub fn task(&mut self) {
        if self.rx_cursor.check_overrun(&self.rx_src) {
            self.stats.rx_overruns += 1;
            self.rx_state = RxState::Idle;
        } else {
            self.drain_rx();
        }

        self.service_read();
    }

    fn drain_rx(&mut self) {
        let available = self.rx_cursor.unread(&self.rx_src) as usize;
        if available == 0 {
            return;
        }

        let size = self.rx_buf.len();
        let start = self.rx_cursor.read_idx();
        let snapshot = self.rx_cursor.begin_callback(&self.rx_src);

        for i in 0..available {
            let idx = (start + i) % size;
            let byte = self.rx_buf[idx];
            self.consume_byte(byte, idx);
        }

        self.rx_cursor.advance(available);
        if self.rx_cursor.end_callback(&self.rx_src, snapshot, available) {
            self.stats.rx_bankruptcies += 1;
            self.rx_state = RxState::Idle;
        }
    }

    fn consume_byte(&mut self, byte: u8, idx: usize) {
        match self.rx_state {
            RxState::Idle => {
                if byte & DIRECTION_BIT != 0 {
                    // Invalid device IDs on a read request are discarded
                    // silently (spec.md §4.3, §7): leave any existing
                    // pending read untouched.
                    if let Some(device) = DeviceId::new(byte) {
                        self.pending_read = Some(device);
                    }
                } else if let Some(device) = DeviceId::new(byte) {
                    self.rx_state = RxState::GotDevice { device };
                }
            }
            RxState::GotDevice { device } => {
                if byte == 0 {
                    self.rx_state = RxState::Idle;
                } else if byte as usize > MAX_BUS_PAYLOAD {
                    // A length above the largest legal payload can never
                    // come from a well-behaved host (spec.md §7): drop the
                    // frame and resync instead of overflowing `scratch` in
                    // `finish_write`.
                    self.stats.rx_oversized_writes += 1;
                    self.rx_state = RxState::Idle;
                } else {
                    self.rx_state = RxState::Receiving {
                        device,
                        want: byte,
                        start: (idx + 1) % self.rx_buf.len(),
                        consumed: 0,
                    };
                }
            }
            RxState::Receiving {
                device,
                want,
                start,
                consumed,
            } => {
                let consumed = consumed + 1;
                if consumed >= want {
                    self.finish_write(device, start, want as usize);
                    self.rx_state = RxState::Idle;
                } else {
                    self.rx_state = RxState::Receiving {
                        device,
                        want,
                        start,
                        consumed,
                    };
                }
            }
        }
    }

    fn finish_write(&mut self, device: DeviceId, start: usize, len: usize) {
        let size = self.rx_buf.len();
        let mut scratch = [0u8; MAX_BUS_PAYLOAD];
        let payload = if is_contiguous(start, len, size) {
            &self.rx_buf[start..start + len]
        } else {
            assemble_span(&self.rx_buf, start, len, &mut scratch)
        };

        self.stats.bytes_received += len as u64;
        if let Some(cb) = &mut self.rx_callbacks[device.index()] {
            cb.on_write(payload);
        }
    }

    /// Device 0's read response is synthesized, not buffer-backed: the
    /// device ID of the next pending source, or zero if none remain
    /// (spec.md §4.3). Device 0 itself is excluded from the scan since
    /// it is reserved for this query and never carries real payload.
    fn next_pending_device(&self) -> u8 {
        for (i, q) in self.tx_bufs.iter().enumerate().skip(1) {
            if !q.is_empty() {
                return i as u8;
            }
        }
        0
    }

    fn service_read(&mut self) {
        if self.tx_dma.take_underflow() {
            self.stats.tx_underflows += 1;
        }
        if self.tx_dma.take_complete() {
            self.sending = None;
        }

        if self.sending.is_some() {
            return;
        }

        if let Some(device) = self.pending_read {
            if device == DeviceId::QUERY {
                let next = self.next_pending_device();
                self.program_send(device, &[next]);
            } else if !self.tx_bufs[device.index()].is_empty() {
                let mut payload = [0u8; MAX_BUS_PAYLOAD];
                let n = self.tx_bufs[device.index()].pop_into(&mut payload);
                self.program_send(device, &payload[..n]);
            }
        }
    }

    fn program_send(&mut self, device: DeviceId, payload: &[u8]) {
        let mut staging = [0u8; 1 + MAX_BUS_PAYLOAD];
        staging[0] = payload.len() as u8;
        staging[1..1 + payload.len()].copy_from_slice(payload);
        self.tx_dma.program_oneshot(&staging[..1 + payload.len()]);
        self.stats.bytes_sent += payload.len() as u64;
        self.sending = Some(device);
        self.pending_read = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    struct FixedSource {
        produced: u64,
    }
    impl RingSource for FixedSource {
        fn epoch(&self) -> u32 {
            (self.produced / (BUS_RX_RING_SIZE as u64)) as u32
        }
        fn remaining(&self) -> u32 {
            let size = BUS_RX_RING_SIZE as u64;
            (size - self.produced % size) as u32
        }
    }

    #[derive(Default)]
    struct RecordingDma {
        last_staging: Rc<RefCell<Vec<u8>>>,
        complete: Rc<RefCell<bool>>,
        underflow: Rc<RefCell<bool>>,
    }
    impl BusTxDma for RecordingDma {
        fn program_oneshot(&mut self, staging: &[u8]) {
            *self.last_staging.borrow_mut() = staging.to_vec();
        }
        fn take_complete(&mut self) -> bool {
            core::mem::replace(&mut *self.complete.borrow_mut(), false)
        }
        fn take_underflow(&mut self) -> bool {
            core::mem::replace(&mut *self.underflow.borrow_mut(), false)
        }
    }

    type TestEngine<'a> = BusEngine<'a, RecordingDma, FixedSource>;

    fn build<'a>() -> (TestEngine<'a>, Rc<RefCell<Vec<u8>>>, Rc<RefCell<bool>>) {
        let dma = RecordingDma::default();
        let staging = dma.last_staging.clone();
        let complete = dma.complete.clone();
        let engine = BusEngine::new(FixedSource { produced: 0 }, dma);
        (engine, staging, complete)
    }

    /// spec.md §8: a write sequence `[device, L, payload...]` produces
    /// exactly one callback with the original payload, for any device
    /// and payload length in range.
    #[test]
    fn write_sequence_invokes_callback_once_with_payload() {
        let (mut engine, _staging, _complete) = build();
        let calls = RefCell::new(Vec::new());
        let mut record = |bytes: &[u8]| calls.borrow_mut().push(bytes.to_vec());
        engine.register_rx_callback(DeviceId::new(3).unwrap(), &mut record);

        let frame = [3u8, 4, 0xAA, 0xBB, 0xCC, 0xDD];
        engine.fill_rx_ring(0, &frame);
        engine.rx_src.produced = frame.len() as u64;
        engine.task();

        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(calls.borrow()[0], vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    /// spec.md §8: a read request after `device_write` yields the
    /// length-prefixed payload once the TX DMA is programmed.
    #[test]
    fn read_request_after_device_write_builds_staging_buffer() {
        let (mut engine, staging, _complete) = build();
        let device = DeviceId::new(5).unwrap();
        assert_eq!(engine.device_write(device, &[0xAA, 0xBB, 0xCC]), 3);

        let frame = [5u8 | DIRECTION_BIT];
        engine.fill_rx_ring(0, &frame);
        engine.rx_src.produced = 1;
        engine.task();

        let s = staging.borrow();
        assert_eq!(s[0], 3);
        assert_eq!(&s[1..4], &[0xAA, 0xBB, 0xCC]);
    }

    /// spec.md §8: reads on an empty device never program the TX DMA;
    /// the CPU keeps seeing the hardware's `0xFF` sentinel.
    #[test]
    fn read_request_on_empty_device_never_arms_dma() {
        let (mut engine, staging, _complete) = build();
        let frame = [2u8 | DIRECTION_BIT];
        engine.fill_rx_ring(0, &frame);
        engine.rx_src.produced = 1;
        engine.task();

        assert!(staging.borrow().is_empty());
    }

    /// spec.md §8: after an induced RX overrun, the overrun counter
    /// increments by exactly one and the next correctly-framed write is
    /// processed normally.
    #[test]
    fn overrun_then_resync_processes_next_frame_normally() {
        let (mut engine, _staging, _complete) = build();
        // Overproduce without ever calling task(): more than a full
        // ring's worth arrives at once.
        engine.rx_src.produced = (BUS_RX_RING_SIZE as u64) + 50;
        engine.task();
        assert_eq!(engine.stats().rx_overruns, 1);

        let calls = RefCell::new(Vec::new());
        let mut record = |bytes: &[u8]| calls.borrow_mut().push(bytes.to_vec());
        engine.register_rx_callback(DeviceId::new(1).unwrap(), &mut record);

        let produced_before = engine.rx_cursor.total_consumed();
        let frame = [1u8, 2, 0x10, 0x20];
        engine.fill_rx_ring(produced_before as usize % BUS_RX_RING_SIZE, &frame);
        engine.rx_src.produced = produced_before + frame.len() as u64;
        engine.task();

        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(calls.borrow()[0], vec![0x10, 0x20]);
        assert_eq!(engine.stats().rx_overruns, 1);
    }

    /// spec.md §4.3: device 0 reads return the next pending device, or 0
    /// if no device has data queued.
    #[test]
    fn query_device_reports_next_pending_source() {
        let (mut engine, staging, _complete) = build();
        let device = DeviceId::new(4).unwrap();
        engine.device_write(device, &[1]);

        let frame = [DeviceId::QUERY.get() | DIRECTION_BIT];
        engine.fill_rx_ring(0, &frame);
        engine.rx_src.produced = 1;
        engine.task();

        let s = staging.borrow();
        assert_eq!(s[0], 1);
        assert_eq!(s[1], 4);
    }

    /// Invalid device IDs on a write are discarded silently (no panic,
    /// no callback, state stays Idle).
    #[test]
    fn invalid_device_id_on_write_is_discarded() {
        let (mut engine, _staging, _complete) = build();
        let frame = [50u8]; // no direction bit, but >= MAX_DEVICES
        engine.fill_rx_ring(0, &frame);
        engine.rx_src.produced = frame.len() as u64;
        engine.task();
        assert_eq!(engine.stats().bytes_received, 0);
        assert_eq!(engine.rx_state, RxState::Idle);
    }

    /// spec.md §7: a write-length byte above `MAX_BUS_PAYLOAD` is dropped
    /// rather than ever reaching `finish_write`, where it would overflow
    /// the fixed-size assembly scratch buffer.
    #[test]
    fn oversized_write_length_is_discarded() {
        let (mut engine, _staging, _complete) = build();
        let frame = [1u8, 255];
        engine.fill_rx_ring(0, &frame);
        engine.rx_src.produced = frame.len() as u64;
        engine.task();
        assert_eq!(engine.stats().rx_oversized_writes, 1);
        assert_eq!(engine.stats().bytes_received, 0);
        assert_eq!(engine.rx_state, RxState::Idle);
    }
}
