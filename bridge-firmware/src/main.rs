#![no_std]
#![no_main]

mod app;

use core::cell::{Cell, RefCell};

use bridge_bsp as bsp;
use bridge_bsp::clocks::{ClockController, CoreFrequency};
use bridge_core::bus_engine::BusEngine;
use bridge_core::config::{BRIDGE_STAGING_SIZE, MAX_DEVICES};
use bridge_core::devbuf::ByteQueue;
use bridge_core::spi_engine::SpiEngine;
use cortex_m::peripheral::NVIC;
use cortex_m_rt::entry;
use panic_rtt_target as _;
use rp2040_pac::{interrupt, Interrupt};
use rtt_target::{rprintln, rtt_init_print};

/// Second-stage bootloader RP2040's boot ROM jumps to after checksumming
/// flash; without this the chip never leaves the ROM bootloader. The
/// teacher's STM32 target has no equivalent since it boots straight from
/// flash at a fixed address.
#[link_section = ".boot2"]
#[used]
pub static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GENERIC_03H;

const SPI_TX_CHANNEL: u8 = 0;
const BUS_TX_CHANNEL: u8 = 1;
const SPI_RX_CHANNEL: u8 = 2;
const BUS_RX_CHANNEL: u8 = 3;

const SPI_RX_RING_LOG2: u8 = 13; // 8 KiB
const BUS_RX_RING_LOG2: u8 = 13; // 8 KiB

const PIO_SM_RX: u8 = 0;
const PIO_SM_TX: u8 = 1;

// Board wiring. Arbitrary beyond the SPI0 pins, which are fixed by the
// peripheral's pad mux.
const PIN_LED: u8 = 25;
const PIN_SPI0_MISO: u8 = 16;
const PIN_SPI0_CS: u8 = 17;
const PIN_SPI0_SCLK: u8 = 18;
const PIN_SPI0_MOSI: u8 = 19;
const PIN_HAS_SOMETHING: u8 = 2;
const PIN_READY: u8 = 3;
const PIN_IRQ: u8 = 4;
const PIN_BUS_D0: u8 = 6;
const PIN_BUS_D1: u8 = 7;
const PIN_BUS_D2: u8 = 8;
const PIN_BUS_D3: u8 = 9;
const PIN_BUS_D4: u8 = 10;
const PIN_BUS_D5: u8 = 11;
const PIN_BUS_D6: u8 = 12;
const PIN_BUS_D7: u8 = 13;
const PIN_BUS_RW: u8 = 14;
const PIN_BUS_CS: u8 = 20;
const PIN_BUS_CLK: u8 = 21;

/// Snapshot of "total SPI RX bytes produced" captured by the SPI0 chip
/// select interrupt, handed to `SpiEngine::task` on the next poll. Guarded
/// by a critical section on both ends, the same `cortex_m::interrupt::free`
/// idiom the teacher uses to share state with its USB interrupt handler.
static mut SPI_CS_SNAPSHOT: Option<u64> = None;

#[entry]
fn main() -> ! {
    rtt_init_print!();
    rprintln!("Starting...");

    let p = rp2040_pac::Peripherals::take().unwrap();

    let clock_ctl = ClockController::new(p.XOSC, p.PLL_SYS, p.CLOCKS, p.RESETS);
    let clocks = unsafe { clock_ctl.setup(CoreFrequency::F125MHz) };
    rprintln!("clk_sys = {} Hz", clocks.sys_hz());

    let delay = bsp::delay::Delay::new(p.TIMER);

    let gpio = bsp::gpio::GPIO::new(p.SIO, p.IO_BANK0, p.PADS_BANK0);
    let pins = bsp::gpio::Pins {
        led: gpio.pin(PIN_LED),
        spi0_sclk: gpio.pin(PIN_SPI0_SCLK),
        spi0_mosi: gpio.pin(PIN_SPI0_MOSI),
        spi0_miso: gpio.pin(PIN_SPI0_MISO),
        spi0_cs: gpio.pin(PIN_SPI0_CS),
        has_something: bsp::gpio::OpenDrainPin::new(gpio.pin(PIN_HAS_SOMETHING)),
        ready: bsp::gpio::OpenDrainPin::new(gpio.pin(PIN_READY)),
        irq: bsp::gpio::OpenDrainPin::new(gpio.pin(PIN_IRQ)),
        bus_d0: gpio.pin(PIN_BUS_D0),
        bus_d1: gpio.pin(PIN_BUS_D1),
        bus_d2: gpio.pin(PIN_BUS_D2),
        bus_d3: gpio.pin(PIN_BUS_D3),
        bus_d4: gpio.pin(PIN_BUS_D4),
        bus_d5: gpio.pin(PIN_BUS_D5),
        bus_d6: gpio.pin(PIN_BUS_D6),
        bus_d7: gpio.pin(PIN_BUS_D7),
        bus_rw: gpio.pin(PIN_BUS_RW),
        bus_cs: gpio.pin(PIN_BUS_CS),
        bus_clk: gpio.pin(PIN_BUS_CLK),
    };
    pins.setup();

    let spi = bsp::spi::SPI::new(p.SPI0);
    spi.setup_slave();
    spi.drain();

    let pio = bsp::pio::Pio::new(p.PIO0);
    pio.setup(PIN_BUS_D0, PIN_BUS_RW, PIN_BUS_CS, PIN_BUS_CLK, 1);
    pio.enable_tx_irq(PIO_SM_TX);
    pio.enable();

    // Chip-select edge interrupt drives the SPI REQUEST/READY handshake's
    // "a transaction just finished" signal (spec.md §4.2); rising edge on
    // SPI0_CS is the host releasing the bus.
    // `gpio` already moved `IO_BANK0` into its owned register block, so
    // the edge-interrupt enable re-derives it the same way the DMA/PIO
    // interrupt handlers below reach their registers after construction.
    unsafe { &*rp2040_pac::IO_BANK0::ptr() }.proc0_inte[(PIN_SPI0_CS / 8) as usize]
        .modify(|_, w| unsafe { w.bits(1 << (4 * (PIN_SPI0_CS % 8) + 3)) });

    let spi_rx_ring = bsp::dma::RxRing::new(SPI_RX_CHANNEL, SPI_RX_RING_LOG2);
    let spi_tx = bsp::dma::SpiTx::new(SPI_TX_CHANNEL, spi.fifo_addr());
    let bus_rx_ring = bsp::dma::RxRing::new(BUS_RX_CHANNEL, BUS_RX_RING_LOG2);
    let bus_tx = bsp::dma::BusTx::new(BUS_TX_CHANNEL, pio.tx_fifo_addr(PIO_SM_TX));

    let mut spi_engine = SpiEngine::new(spi_rx_ring, spi_tx, pins.has_something, pins.ready, delay);
    let mut bus_engine = BusEngine::new(bus_rx_ring, bus_tx);

    bsp::dma::RxRing::start(
        SPI_RX_CHANNEL,
        SPI_RX_RING_LOG2,
        bsp::dma::spi0_rx_dreq(),
        spi.fifo_addr(),
        spi_engine.rx_buf_ptr(),
        spi_engine.rx_buf_len(),
    );
    bsp::dma::RxRing::start(
        BUS_RX_CHANNEL,
        BUS_RX_RING_LOG2,
        bsp::dma::bus_rx_dreq(),
        pio.rx_fifo_addr(PIO_SM_RX),
        bus_engine.rx_buf_ptr(),
        bus_engine.rx_buf_len(),
    );

    let staging: RefCell<ByteQueue<BRIDGE_STAGING_SIZE>> = RefCell::new(ByteQueue::new());
    let spi_tx_drops = Cell::new(0u32);
    let mut routers: [app::Router; MAX_DEVICES] = core::array::from_fn(|i| {
        app::Router::new(
            bridge_core::device::DeviceId::new(i as u8).unwrap(),
            &staging,
            &spi_tx_drops,
        )
    });
    app::wire_devices(&mut bus_engine, &staging, &spi_tx_drops, &mut routers);

    let mut application = app::App::new(
        &mut spi_engine,
        &mut bus_engine,
        &staging,
        &spi_tx_drops,
        pins.irq,
    );
    application.init();

    p.DMA.inte0.write(|w| unsafe {
        w.bits((1 << SPI_RX_CHANNEL) | (1 << BUS_RX_CHANNEL) | (1 << BUS_TX_CHANNEL))
    });

    unsafe {
        NVIC::unmask(Interrupt::DMA_IRQ_0);
        NVIC::unmask(Interrupt::PIO0_IRQ_0);
        NVIC::unmask(Interrupt::IO_IRQ_BANK0);
    }

    loop {
        let snapshot = cortex_m::interrupt::free(|_| unsafe {
            core::mem::replace(&mut SPI_CS_SNAPSHOT, None)
        });
        application.poll(snapshot);
    }
}

#[interrupt]
fn IO_IRQ_BANK0() {
    // Acknowledge the edge and latch the current total-produced snapshot
    // before anything else can advance the ring further (spec.md §4.2's
    // `cs_complete` wants the position at the instant CS released).
    let p = unsafe { &*rp2040_pac::IO_BANK0::ptr() };
    let bit = 4 * (PIN_SPI0_CS % 8) + 3;
    p.intr[(PIN_SPI0_CS / 8) as usize].write(|w| unsafe { w.bits(1 << bit) });

    let snapshot = bsp::dma::RxRing::total_produced(SPI_RX_CHANNEL, SPI_RX_RING_LOG2);
    cortex_m::interrupt::free(|_| unsafe {
        SPI_CS_SNAPSHOT = Some(snapshot);
    });
}

#[interrupt]
fn DMA_IRQ_0() {
    let dma = unsafe { &*rp2040_pac::DMA::ptr() };
    let ints = dma.ints0.read().bits();

    if ints & (1 << SPI_RX_CHANNEL) != 0 {
        dma.ints0.write(|w| unsafe { w.bits(1 << SPI_RX_CHANNEL) });
        bsp::dma::RxRing::on_reload(SPI_RX_CHANNEL);
    }
    if ints & (1 << BUS_RX_CHANNEL) != 0 {
        dma.ints0.write(|w| unsafe { w.bits(1 << BUS_RX_CHANNEL) });
        bsp::dma::RxRing::on_reload(BUS_RX_CHANNEL);
    }
    if ints & (1 << BUS_TX_CHANNEL) != 0 {
        dma.ints0.write(|w| unsafe { w.bits(1 << BUS_TX_CHANNEL) });
        bsp::dma::BusTx::on_dma_complete(BUS_TX_CHANNEL);
    }
}

#[interrupt]
fn PIO0_IRQ_0() {
    if bsp::pio::Pio::take_rx_underflow(PIO_SM_TX) {
        bsp::dma::BusTx::on_underflow(BUS_TX_CHANNEL);
    }
}
