//! Bridge multiplexer (spec.md §4.4): wires the SPI engine and the
//! parallel-bus engine together without either engine knowing the other
//! exists. Two data paths cross here:
//!
//! * SPI RX -> parallel-bus TX: bytes drained from the SPI engine's RX
//!   queue are parsed as `[device, length, payload]` frames and handed to
//!   `BusEngine::device_write`.
//! * Parallel-bus RX -> SPI TX: each device's completed WRITE callback
//!   re-frames its payload as `[device, length, payload]` and stages it
//!   for the SPI engine's TX queue.
//!
//! The second path is the one genuine wiring problem: a callback
//! registered on `BusEngine` would need a live reference to the `SpiEngine`
//! it feeds, and both live behind `&mut` inside this same struct. Rather
//! than reach for interior-mutable aliasing of the engines themselves, the
//! callback only ever touches a small FIFO (`staging`) that the bridge
//! also owns a reference to; `poll` drains that FIFO into the SPI engine's
//! TX queue on the bridge's own turn, one engine borrowed at a time.

use core::cell::{Cell, RefCell};

use crate::bus_engine::{BusEngine, BusStats, BusTxDma};
use crate::callback::WriteSink;
use crate::config::{BRIDGE_STAGING_SIZE, MAX_BUS_PAYLOAD, STATS_PERIOD_POLLS};
use crate::devbuf::ByteQueue;
use crate::device::DeviceId;
use crate::spi_engine::{Clock, OutLine, SpiEngine, SpiStats, SpiTxDma};
use bridge_ring::RingSource;

/// The 6502-facing interrupt line (spec.md §6): asserted while any device
/// has data queued to be read, so the host knows to poll. Implementors
/// must set the pin's output value before switching its direction to
/// output, so the line never glitches high during bring-up.
pub trait IrqLine {
    fn assert(&mut self);
    fn deassert(&mut self);
}

/// Where `Bridge::poll` emits the periodic statistics line (spec.md
/// §4.4: "format irrelevant to the core"). `bridge-firmware` implements
/// this with `rtt_target::rprintln!`.
pub trait StatsSink {
    fn emit(&mut self, spi: SpiStats, bus: BusStats, spi_rx_discards: u32, spi_tx_drops: u32);
}

/// Routes one parallel-bus device's completed writes into the shared
/// hand-off queue feeding the SPI TX side. All eight instances share the
/// same concrete type (only `device` differs), which is what lets them
/// live in a plain array of `WriteSink` trait objects without boxing.
pub struct DeviceRouter<'q> {
    device: DeviceId,
    staging: &'q RefCell<ByteQueue<BRIDGE_STAGING_SIZE>>,
    drops: &'q Cell<u32>,
}

impl<'q> DeviceRouter<'q> {
    pub fn new(
        device: DeviceId,
        staging: &'q RefCell<ByteQueue<BRIDGE_STAGING_SIZE>>,
        drops: &'q Cell<u32>,
    ) -> Self {
        DeviceRouter {
            device,
            staging,
            drops,
        }
    }
}

impl<'q> WriteSink for DeviceRouter<'q> {
    fn on_write(&mut self, payload: &[u8]) {
        let mut framed = [0u8; 2 + MAX_BUS_PAYLOAD];
        framed[0] = self.device.get();
        framed[1] = payload.len() as u8;
        framed[2..2 + payload.len()].copy_from_slice(payload);
        let frame = &framed[..2 + payload.len()];
        if !self.staging.borrow_mut().push_all(frame) {
            self.drops.set(self.drops.get() + 1);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TlvState {
    Idle,
    GotDevice,
    Receiving,
}

/// The bridge multiplexer. Holds both engines by mutable reference (they
/// are constructed and, in the parallel-bus engine's case, have their
/// per-device callbacks registered by the caller before the bridge
/// borrows them — see `DeviceRouter`) plus the hand-off queue and
/// discard counters shared with those callbacks.
pub struct Bridge<'a, SD, SR, SL, SC, BD, BR, L, S> {
    spi: &'a mut SpiEngine<'a, SD, SR, SL, SC>,
    bus: &'a mut BusEngine<'a, BD, BR>,
    staging: &'a RefCell<ByteQueue<BRIDGE_STAGING_SIZE>>,
    spi_tx_drops: &'a Cell<u32>,
    irq: L,
    stats_sink: S,
    spi_rx_discards: u32,
    poll_count: u32,
    tlv_state: TlvState,
    tlv_device: u8,
    tlv_len: u8,
    tlv_got: u8,
    tlv_buf: [u8; MAX_BUS_PAYLOAD],
}

impl<'a, SD, SR, SL, SC, BD, BR, L, S> Bridge<'a, SD, SR, SL, SC, BD, BR, L, S>
where
    SD: SpiTxDma,
    SR: RingSource,
    SL: OutLine,
    SC: Clock,
    BD: BusTxDma,
    BR: RingSource,
    L: IrqLine,
    S: StatsSink,
{
    /// `staging`/`spi_tx_drops` must be the same references passed to the
    /// `DeviceRouter`s already registered on `bus` via
    /// `BusEngine::register_rx_callback`.
    pub fn new(
        spi: &'a mut SpiEngine<'a, SD, SR, SL, SC>,
        bus: &'a mut BusEngine<'a, BD, BR>,
        staging: &'a RefCell<ByteQueue<BRIDGE_STAGING_SIZE>>,
        spi_tx_drops: &'a Cell<u32>,
        irq: L,
        stats_sink: S,
    ) -> Self {
        Bridge {
            spi,
            bus,
            staging,
            spi_tx_drops,
            irq,
            stats_sink,
            spi_rx_discards: 0,
            poll_count: 0,
            tlv_state: TlvState::Idle,
            tlv_device: 0,
            tlv_len: 0,
            tlv_got: 0,
            tlv_buf: [0; MAX_BUS_PAYLOAD],
        }
    }

    /// Brings both engines up in the order spec.md §6 requires: the
    /// control lines idle before either engine starts moving bytes.
    pub fn init(&mut self) {
        self.spi.init();
        self.bus.init();
        self.bus.start();
        self.irq.deassert();
    }

    /// One iteration of the main loop (spec.md §4.4 `poll`): drive both
    /// engines, cross the two data paths, update the 6502 interrupt line,
    /// and emit statistics every `STATS_PERIOD_POLLS` calls.
    pub fn poll(&mut self, spi_cs_complete: Option<u64>) {
        self.spi.task(spi_cs_complete);
        self.bus.task();

        self.drain_spi_to_bus();
        self.drain_bus_to_spi();

        if self.bus.has_pending_tx() {
            self.irq.assert();
        } else {
            self.irq.deassert();
        }

        self.poll_count = self.poll_count.wrapping_add(1);
        if self.poll_count % STATS_PERIOD_POLLS == 0 {
            self.stats_sink.emit(
                self.spi.stats(),
                self.bus.stats(),
                self.spi_rx_discards,
                self.spi_tx_drops.get(),
            );
        }
    }

    /// Drains whatever the SPI engine's RX queue has accumulated and
    /// parses it as a stream of `[device, length, payload]` frames.
    fn drain_spi_to_bus(&mut self) {
        let mut chunk = [0u8; 256];
        loop {
            let n = self.spi.rx_drain(&mut chunk);
            if n == 0 {
                break;
            }
            for &byte in &chunk[..n] {
                self.consume_tlv_byte(byte);
            }
        }
    }

    fn consume_tlv_byte(&mut self, byte: u8) {
        match self.tlv_state {
            TlvState::Idle => {
                self.tlv_device = byte;
                self.tlv_state = TlvState::GotDevice;
            }
            TlvState::GotDevice => {
                if byte == 0 {
                    // A zero-length frame carries nothing to dispatch;
                    // resync rather than calling device_write with an
                    // empty slice.
                    self.tlv_state = TlvState::Idle;
                } else {
                    self.tlv_len = byte;
                    self.tlv_got = 0;
                    self.tlv_state = TlvState::Receiving;
                }
            }
            TlvState::Receiving => {
                if (self.tlv_got as usize) < self.tlv_buf.len() {
                    self.tlv_buf[self.tlv_got as usize] = byte;
                }
                self.tlv_got += 1;
                if self.tlv_got >= self.tlv_len {
                    self.dispatch_tlv();
                    self.tlv_state = TlvState::Idle;
                }
            }
        }
    }

    fn dispatch_tlv(&mut self) {
        // `tlv_len` is a full byte (max 255) but `tlv_buf` only holds the
        // largest legal parallel-bus payload (254); a length above that
        // can never have been produced by a well-behaved host, so the
        // overhang is just dropped rather than indexed out of bounds.
        let len = core::cmp::min(self.tlv_len as usize, self.tlv_buf.len());
        match DeviceId::new(self.tlv_device) {
            Some(device) => {
                let written = self.bus.device_write(device, &self.tlv_buf[..len]);
                if written < len {
                    self.spi_rx_discards += (len - written) as u32;
                }
            }
            None => {
                self.spi_rx_discards += 1;
            }
        }
    }

    /// Hands off whatever `DeviceRouter` callbacks have staged, capped to
    /// what the SPI TX queue can currently accept in one shot so nothing
    /// popped off `staging` is ever lost to a failed `tx_enqueue`.
    fn drain_bus_to_spi(&mut self) {
        let free = self.spi.tx_free();
        if free == 0 {
            return;
        }
        let take = core::cmp::min(free, self.staging.borrow().len());
        if take == 0 {
            return;
        }
        let mut chunk = [0u8; BRIDGE_STAGING_SIZE];
        let n = self.staging.borrow_mut().pop_into(&mut chunk[..take]);
        let accepted = self.spi.tx_enqueue(&chunk[..n]);
        debug_assert!(accepted, "drained exactly what the TX queue reported free");
    }
}
