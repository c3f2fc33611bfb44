use bridge_bsp as bsp;
use bridge_bsp::clocks::CoreFrequency;
use bridge_core::bus_engine::BusEngine;
use bridge_core::config::{BRIDGE_STAGING_SIZE, MAX_DEVICES};
use bridge_core::devbuf::ByteQueue;
use bridge_core::device::DeviceId;
use bridge_core::spi_engine::SpiEngine;
use bridge_core::{Bridge, WriteSink};
use core::cell::{Cell, RefCell};
use rtt_target::rprintln;

type Spi<'a> = SpiEngine<'a, bsp::dma::SpiTx, bsp::dma::RxRing, bsp::gpio::OpenDrainPin<'a>, bsp::delay::Delay>;
type Bus<'a> = BusEngine<'a, bsp::dma::BusTx, bsp::dma::RxRing>;
type AppBridge<'a> = Bridge<
    'a,
    bsp::dma::SpiTx,
    bsp::dma::RxRing,
    bsp::gpio::OpenDrainPin<'a>,
    bsp::delay::Delay,
    bsp::dma::BusTx,
    bsp::dma::RxRing,
    bsp::gpio::OpenDrainPin<'a>,
    StatsPrinter,
>;

/// Prints the periodic statistics line over RTT (spec.md §4.4 leaves the
/// format up to the implementor; the teacher itself only ever logs plain
/// text over RTT, never a binary telemetry format).
pub struct StatsPrinter;

impl bridge_core::bridge::StatsSink for StatsPrinter {
    fn emit(
        &mut self,
        spi: bridge_core::spi_engine::SpiStats,
        bus: bridge_core::bus_engine::BusStats,
        spi_rx_discards: u32,
        spi_tx_drops: u32,
    ) {
        rprintln!(
            "spi: rx_bytes={} tx_bytes={} protocol_errors={} rx_overruns={} \
             rx_bankruptcies={} request_timeouts={} | bus: rx_bytes={} tx_bytes={} \
             rx_overruns={} rx_bankruptcies={} rx_oversized_writes={} tx_underflows={} \
             | bridge: rx_discards={} tx_drops={}",
            spi.bytes_received,
            spi.bytes_sent,
            spi.protocol_errors,
            spi.rx_overruns,
            spi.rx_bankruptcies,
            spi.request_timeouts,
            bus.bytes_received,
            bus.bytes_sent,
            bus.rx_overruns,
            bus.rx_bankruptcies,
            bus.rx_oversized_writes,
            bus.tx_underflows,
            spi_rx_discards,
            spi_tx_drops,
        );
    }
}

/// Routes one device's completed parallel-bus writes into the bridge's
/// shared hand-off queue. Lives in the application layer rather than
/// inside `bridge-core` itself (see `DESIGN.md`'s `bridge-core::bridge`
/// entry) since it, and the queue it closes over, must outlive the
/// borrow `Bridge::new` takes of both engines.
pub type Router<'a> = bridge_core::bridge::DeviceRouter<'a>;

/// Builds the eight per-device routers and registers them on `bus_engine`.
/// Must run before `bus_engine` is borrowed into an `App`, since
/// registration itself needs `&mut` access to the engine.
pub fn wire_devices<'a>(
    bus_engine: &mut Bus<'a>,
    staging: &'a RefCell<ByteQueue<BRIDGE_STAGING_SIZE>>,
    spi_tx_drops: &'a Cell<u32>,
    routers: &'a mut [Router<'a>; MAX_DEVICES],
) {
    for (i, router) in routers.iter_mut().enumerate() {
        let device = DeviceId::new(i as u8).expect("i < MAX_DEVICES");
        *router = Router::new(device, staging, spi_tx_drops);
    }
    for (i, router) in routers.iter_mut().enumerate() {
        let device = DeviceId::new(i as u8).expect("i < MAX_DEVICES");
        bus_engine.register_rx_callback(device, router as &mut dyn WriteSink);
    }
}

/// Thin wrapper around the bridge, mirroring the teacher's own `App<'a>`:
/// all hardware is constructed and owned by `main`'s stack frame, and only
/// borrowed references cross into here.
pub struct App<'a> {
    bridge: AppBridge<'a>,
}

impl<'a> App<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spi_engine: &'a mut Spi<'a>,
        bus_engine: &'a mut Bus<'a>,
        staging: &'a RefCell<ByteQueue<BRIDGE_STAGING_SIZE>>,
        spi_tx_drops: &'a Cell<u32>,
        irq: bsp::gpio::OpenDrainPin<'a>,
    ) -> Self {
        App {
            bridge: Bridge::new(spi_engine, bus_engine, staging, spi_tx_drops, irq, StatsPrinter),
        }
    }

    pub fn init(&mut self) {
        self.bridge.init();
    }

    pub fn poll(&mut self, spi_cs_complete: Option<u64>) {
        self.bridge.poll(spi_cs_complete);
    }
}

pub fn default_core_frequency() -> CoreFrequency {
    #[cfg(not(feature = "turbo"))]
    return CoreFrequency::F125MHz;
    #[cfg(feature = "turbo")]
    return CoreFrequency::F133MHz;
}
