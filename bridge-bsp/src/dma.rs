use core::sync::atomic::{compiler_fence, AtomicBool, AtomicU32, Ordering};

use bridge_core::bus_engine::BusTxDma;
use bridge_core::spi_engine::SpiTxDma;
use bridge_ring::RingSource;
use rp2040_pac::DMA;

/// DREQ numbers for the two one-shot TX channels this bridge arms
/// (RP2040 datasheet §2.5.3): SPI0 TX and PIO0 SM0 TX.
const DREQ_SPI0_TX: u8 = 16;
const DREQ_PIO0_TX0: u8 = 0;
/// DREQ numbers for the two continuously-reloading RX channels.
const DREQ_SPI0_RX: u8 = 17;
const DREQ_PIO0_RX0: u8 = 4;

/// Channels are independent hardware blocks but `rp2040-pac` hands out
/// the whole `DMA` peripheral as one singleton, and the SPI and
/// parallel-bus engines each need their own owned handle implementing a
/// different trait. Rather than thread one shared `&DMA` through both
/// engines (which `bridge-core` is deliberately generic to avoid), each
/// one-shot channel re-derives the register block from `DMA::ptr()` —
/// the same "steal a reference to a singleton peripheral" escape hatch
/// `cortex-m`'s own `Peripherals::steal` is built on, safe here because
/// the two channel indices never overlap.
struct OneShotChannel {
    index: u8,
}

impl OneShotChannel {
    fn new(index: u8) -> Self {
        OneShotChannel { index }
    }

    fn regs(&self) -> &'static rp2040_pac::dma::RegisterBlock {
        unsafe { &*DMA::ptr() }
    }

    fn arm(&self, dreq: u8, write_addr: u32, data: &[u8]) {
        let ch = &self.regs().ch[self.index as usize];
        ch.ch_read_addr.write(|w| unsafe { w.bits(data.as_ptr() as u32) });
        ch.ch_write_addr.write(|w| unsafe { w.bits(write_addr) });
        ch.ch_trans_count.write(|w| unsafe { w.bits(data.len() as u32) });
        // The control-and-trigger register both configures and starts the
        // channel the moment it's written, so every other field has to be
        // in place before this call.
        compiler_fence(Ordering::SeqCst);
        ch.ch_ctrl_trig.write(|w| unsafe {
            w.data_size()
                .size_byte()
                .incr_read()
                .bit(true)
                .incr_write()
                .bit(false)
                .treq_sel()
                .bits(dreq)
                .chain_to()
                .bits(self.index)
                .en()
                .bit(true)
        });
    }

    fn busy(&self) -> bool {
        self.regs().ch[self.index as usize].ch_ctrl_trig.read().busy().bit_is_set()
    }
}

/// Drives the one-shot DMA channel feeding SPI0's TX FIFO (`spec.md`
/// §4.2's `SpiTxDma`). The SPI slave peripheral itself paces the
/// transfer off the host's clock, so this channel only ever needs
/// arming, never polling for space.
pub struct SpiTx {
    channel: OneShotChannel,
    spi_tx_fifo_addr: u32,
}

impl SpiTx {
    pub fn new(channel_index: u8, spi_tx_fifo_addr: u32) -> Self {
        SpiTx { channel: OneShotChannel::new(channel_index), spi_tx_fifo_addr }
    }
}

impl SpiTxDma for SpiTx {
    fn program_oneshot(&mut self, staging: &[u8]) {
        self.channel.arm(DREQ_SPI0_TX, self.spi_tx_fifo_addr, staging);
    }
}

/// One complete/underflow flag pair per one-shot channel, indexed the same
/// way as `CHANNEL_EPOCHS` and for the same reason: `BusTx` is moved into
/// `BusEngine` by value at construction, so the DMA and PIO interrupt
/// handlers in `bridge-firmware` (which only know the channel index) have
/// no way to reach an owned instance's fields directly.
static BUS_TX_COMPLETE: [AtomicBool; 12] = [
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
];
static BUS_TX_UNDERFLOW: [AtomicBool; 12] = [
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
    AtomicBool::new(false), AtomicBool::new(false),
];

/// Drives the one-shot DMA channel feeding PIO0 SM0's TX FIFO (`spec.md`
/// §4.3's `BusTxDma`). `complete`/`underflow` are set from the DMA and
/// PIO interrupt handlers respectively and drained here on the next
/// poll, the same one-shot-flag shape as the ring library's overrun bit.
pub struct BusTx {
    channel: OneShotChannel,
    pio_tx_fifo_addr: u32,
}

impl BusTx {
    pub fn new(channel_index: u8, pio_tx_fifo_addr: u32) -> Self {
        BusTx { channel: OneShotChannel::new(channel_index), pio_tx_fifo_addr }
    }

    /// Called from the DMA_IRQ_0 handler once this channel's transfer
    /// count reaches zero.
    pub fn on_dma_complete(channel_index: u8) {
        BUS_TX_COMPLETE[channel_index as usize].store(true, Ordering::Relaxed);
    }

    /// Called from the PIO0_IRQ_0 handler when the state machine's
    /// status register reports a TX FIFO underflow.
    pub fn on_underflow(channel_index: u8) {
        BUS_TX_UNDERFLOW[channel_index as usize].store(true, Ordering::Relaxed);
    }

    pub fn busy(&self) -> bool {
        self.channel.busy()
    }
}

impl BusTxDma for BusTx {
    fn program_oneshot(&mut self, staging: &[u8]) {
        self.channel.arm(DREQ_PIO0_TX0, self.pio_tx_fifo_addr, staging);
    }

    fn take_complete(&mut self) -> bool {
        BUS_TX_COMPLETE[self.channel.index as usize].swap(false, Ordering::Relaxed)
    }

    fn take_underflow(&mut self) -> bool {
        BUS_TX_UNDERFLOW[self.channel.index as usize].swap(false, Ordering::Relaxed)
    }
}

/// One reload counter per DMA channel, indexed by channel number. Kept as
/// free-standing statics rather than a field on `RxRing` so that a CS/IRQ
/// handler can compute the same total-produced snapshot `SpiEngine::task`
/// wants (`spec.md` §4.2) without needing its own borrow of the `RxRing`
/// instance the engine has already taken ownership of.
static CHANNEL_EPOCHS: [AtomicU32; 12] = [
    AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0),
    AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0),
    AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0),
];

/// A continuously-reloading, peripheral-to-memory DMA channel writing
/// into a fixed ring buffer. RP2040's `RING_SIZE` field wraps the write
/// address within the buffer automatically; what it does not do is wrap
/// `CH_TRANS_COUNT`, so each full pass is armed for exactly the buffer's
/// length and the reload interrupt re-arms the next pass and bumps
/// `epoch`, giving `bridge-ring` the same "total bytes produced" view the
/// teacher's DMA `NDTR`-delta tracking derives from a hardware countdown
/// register instead.
pub struct RxRing {
    index: u8,
    ring_size_log2: u8,
}

impl RxRing {
    /// `ring_bytes` must be a power of two; `ring_size_log2` is its log2,
    /// the value RP2040's `RING_SIZE` field wants directly.
    pub fn new(channel_index: u8, ring_size_log2: u8) -> Self {
        RxRing { index: channel_index, ring_size_log2 }
    }

    fn regs(&self) -> &'static rp2040_pac::dma::RegisterBlock {
        unsafe { &*DMA::ptr() }
    }

    /// Arms a channel for one full pass over `buf`, sourced from
    /// `read_addr` (a peripheral FIFO, fixed) at the given DREQ. A free
    /// function rather than a method: by the time this needs calling the
    /// `RxRing` itself has already been moved into the engine it backs
    /// (`SpiEngine`/`BusEngine` own `rx_src: R` outright), so the caller
    /// only has `rx_buf_ptr`/`rx_buf_len` and the channel index to work
    /// with, not the instance.
    pub fn start(channel_index: u8, ring_size_log2: u8, dreq: u8, read_addr: u32, buf: *mut u8, buf_len: usize) {
        let ch = &unsafe { &*DMA::ptr() }.ch[channel_index as usize];
        ch.ch_read_addr.write(|w| unsafe { w.bits(read_addr) });
        ch.ch_write_addr.write(|w| unsafe { w.bits(buf as u32) });
        ch.ch_trans_count.write(|w| unsafe { w.bits(buf_len as u32) });
        compiler_fence(Ordering::SeqCst);
        ch.ch_ctrl_trig.write(|w| unsafe {
            w.data_size()
                .size_byte()
                .incr_read()
                .bit(false)
                .incr_write()
                .bit(true)
                .ring_sel()
                .bit(true)
                .ring_size()
                .bits(ring_size_log2)
                .treq_sel()
                .bits(dreq)
                .chain_to()
                .bits(channel_index)
                .en()
                .bit(true)
        });
    }

    /// Called from the channel's completion interrupt: a full pass just
    /// finished and the write pointer wrapped back to the buffer's start.
    /// Re-triggering is handled by hardware (`CHAIN_TO` points at itself
    /// with the transfer count reloaded from `CH_TRANS_COUNT_TRIG`'s
    /// latched value), so this only needs to advance the epoch counter.
    /// Also a free function for the same reason `start` is: the ISR only
    /// knows the channel index, never the owned `RxRing`.
    pub fn on_reload(channel_index: u8) {
        CHANNEL_EPOCHS[channel_index as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes this channel has ever produced, computed the same way
    /// whether called from inside the engine that owns the `RxRing` or
    /// from an interrupt handler that only knows the channel index and
    /// ring size — the snapshot `SpiEngine::task`'s `cs_complete` argument
    /// needs (`spec.md` §4.2) is captured this way at the moment CS goes
    /// high, before anything else can advance the ring further.
    pub fn total_produced(channel_index: u8, ring_size_log2: u8) -> u64 {
        let ring_size = 1u32 << ring_size_log2;
        let epoch = CHANNEL_EPOCHS[channel_index as usize].load(Ordering::Relaxed) as u64;
        let remaining =
            unsafe { &*DMA::ptr() }.ch[channel_index as usize].ch_trans_count.read().bits();
        epoch * ring_size as u64 + (ring_size - remaining) as u64
    }
}

impl RingSource for RxRing {
    fn epoch(&self) -> u32 {
        CHANNEL_EPOCHS[self.index as usize].load(Ordering::Relaxed)
    }

    fn remaining(&self) -> u32 {
        self.regs().ch[self.index as usize].ch_trans_count.read().bits()
    }
}

pub const fn spi0_rx_dreq() -> u8 {
    DREQ_SPI0_RX
}

pub const fn bus_rx_dreq() -> u8 {
    DREQ_PIO0_RX0
}
