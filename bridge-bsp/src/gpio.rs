use bridge_core::bridge::IrqLine;
use bridge_core::spi_engine::OutLine;
use rp2040_pac::{IO_BANK0, PADS_BANK0, SIO};

/// Owns the three register blocks RP2040 splits GPIO control across: `SIO`
/// for the fast single-cycle output/input/direction bits, `IO_BANK0` for
/// per-pin function select, `PADS_BANK0` for pull and drive strength.
/// Mirrors the single-port-wrapper-plus-`Pin`-handle split the teacher
/// uses, just against three register blocks instead of one.
pub struct GPIO {
    sio: SIO,
    io_bank0: IO_BANK0,
    pads_bank0: PADS_BANK0,
}

impl<'a> GPIO {
    pub fn new(sio: SIO, io_bank0: IO_BANK0, pads_bank0: PADS_BANK0) -> Self {
        GPIO { sio, io_bank0, pads_bank0 }
    }

    pub fn pin(&'a self, n: u8) -> Pin<'a> {
        assert!(n < 30);
        Pin { n, port: self }
    }

    #[inline(always)]
    fn set_high(&self, n: u8) {
        self.sio.gpio_out_set.write(|w| unsafe { w.bits(1 << n) });
    }

    #[inline(always)]
    fn set_low(&self, n: u8) {
        self.sio.gpio_out_clr.write(|w| unsafe { w.bits(1 << n) });
    }

    #[inline(always)]
    fn set_output(&self, n: u8) {
        self.sio.gpio_oe_set.write(|w| unsafe { w.bits(1 << n) });
    }

    #[inline(always)]
    fn set_input(&self, n: u8) {
        self.sio.gpio_oe_clr.write(|w| unsafe { w.bits(1 << n) });
    }

    #[inline(always)]
    fn is_high(&self, n: u8) -> bool {
        self.sio.gpio_in.read().bits() & (1 << n) != 0
    }

    /// `funcsel` 5 selects SIO (plain GPIO); other values route the pad to
    /// a peripheral (1 = SPI, 6 = PIO0). See RP2040 datasheet table 291.
    fn set_function(&self, n: u8, funcsel: u8) {
        self.io_bank0.gpio[n as usize]
            .gpio_ctrl
            .write(|w| unsafe { w.funcsel().bits(funcsel) });
    }

    fn set_pull(&self, n: u8, up: bool, down: bool) {
        self.pads_bank0.gpio[n as usize]
            .modify(|_, w| w.pue().bit(up).pde().bit(down));
    }

    fn set_input_enable(&self, n: u8, enabled: bool) {
        self.pads_bank0.gpio[n as usize].modify(|_, w| w.ie().bit(enabled));
    }
}

pub struct Pin<'a> {
    n: u8,
    port: &'a GPIO,
}

impl<'a> Pin<'a> {
    #[inline(always)]
    pub fn set_high(&self) -> &Self {
        self.port.set_high(self.n);
        self
    }

    #[inline(always)]
    pub fn set_low(&self) -> &Self {
        self.port.set_low(self.n);
        self
    }

    #[inline(always)]
    pub fn set_bool(&self, state: bool) {
        if state { self.set_high(); } else { self.set_low(); }
    }

    #[inline(always)]
    pub fn is_high(&self) -> bool {
        self.port.is_high(self.n)
    }

    #[inline(always)]
    pub fn is_low(&self) -> bool {
        !self.is_high()
    }

    #[inline]
    pub fn set_mode_output(&self) -> &Self {
        self.port.set_function(self.n, 5);
        self.port.set_output(self.n);
        self
    }

    #[inline]
    pub fn set_mode_input(&self) -> &Self {
        self.port.set_function(self.n, 5);
        self.port.set_input(self.n);
        self
    }

    /// Routes the pad to a peripheral (SPI0 = 1, PIO0 = 6) instead of the
    /// plain SIO GPIO block.
    #[inline]
    pub fn set_function(&self, funcsel: u8) -> &Self {
        self.port.set_function(self.n, funcsel);
        self
    }

    #[inline]
    pub fn set_pull_up(&self) -> &Self {
        self.port.set_pull(self.n, true, false);
        self
    }

    #[inline]
    pub fn set_pull_down(&self) -> &Self {
        self.port.set_pull(self.n, false, true);
        self
    }

    #[inline]
    pub fn set_pull_floating(&self) -> &Self {
        self.port.set_pull(self.n, false, false);
        self
    }

    #[inline]
    pub fn set_input_enable(&self, enabled: bool) -> &Self {
        self.port.set_input_enable(self.n, enabled);
        self
    }
}

/// Open-drain control line, emulated the way RP2040's GPIO always is:
/// there is no true open-drain driver mode, so "asserted" means driven
/// low and "deasserted" means switched to floating input, relying on the
/// host's own pull-up. The value (low) is latched via `GPIO_OUT_CLR`
/// before `GPIO_OE_SET` runs, so the line can never glitch high the way
/// it would if direction changed first (`spec.md` §6).
pub struct OpenDrainPin<'a> {
    pin: Pin<'a>,
}

impl<'a> OpenDrainPin<'a> {
    pub fn new(pin: Pin<'a>) -> Self {
        pin.set_pull_up().set_mode_input();
        OpenDrainPin { pin }
    }
}

impl<'a> OutLine for OpenDrainPin<'a> {
    fn assert(&mut self) {
        self.pin.set_low();
        self.pin.set_mode_output();
    }

    fn deassert(&mut self) {
        self.pin.set_mode_input();
    }
}

impl<'a> IrqLine for OpenDrainPin<'a> {
    fn assert(&mut self) {
        OutLine::assert(self)
    }

    fn deassert(&mut self) {
        OutLine::deassert(self)
    }
}

pub struct Pins<'a> {
    pub led: Pin<'a>,

    // SPI0 in slave mode: SCK/MOSI/MISO/CS all driven by the host.
    pub spi0_sclk: Pin<'a>,
    pub spi0_mosi: Pin<'a>,
    pub spi0_miso: Pin<'a>,
    pub spi0_cs: Pin<'a>,

    // Open-drain, host-pulled-up control lines (spec.md §6).
    pub has_something: OpenDrainPin<'a>,
    pub ready: OpenDrainPin<'a>,
    pub irq: OpenDrainPin<'a>,

    // 6502 parallel bus, sampled by the PIO program in `pio.rs`.
    pub bus_d0: Pin<'a>,
    pub bus_d1: Pin<'a>,
    pub bus_d2: Pin<'a>,
    pub bus_d3: Pin<'a>,
    pub bus_d4: Pin<'a>,
    pub bus_d5: Pin<'a>,
    pub bus_d6: Pin<'a>,
    pub bus_d7: Pin<'a>,
    pub bus_rw: Pin<'a>,
    pub bus_cs: Pin<'a>,
    pub bus_clk: Pin<'a>,
}

impl<'a> Pins<'a> {
    /// Configure I/O pins. Run once at boot, before either engine starts.
    pub fn setup(&self) {
        self.led.set_low().set_mode_output();

        self.spi0_sclk.set_pull_down().set_function(1);
        self.spi0_mosi.set_pull_down().set_function(1);
        self.spi0_miso.set_function(1);
        self.spi0_cs.set_pull_up().set_function(1);

        // `has_something`/`ready`/`irq` already start deasserted
        // (floating input) via `OpenDrainPin::new`.

        for pin in [
            &self.bus_d0, &self.bus_d1, &self.bus_d2, &self.bus_d3,
            &self.bus_d4, &self.bus_d5, &self.bus_d6, &self.bus_d7,
            &self.bus_rw, &self.bus_cs, &self.bus_clk,
        ] {
            // PIO0 function select; direction and pull-up/down are set by
            // the PIO state machine's own pin configuration instead of
            // here, since input/output direction switches mid-program.
            pin.set_function(6);
        }
    }
}
