use rp2040_pac::{CLOCKS, PLL_SYS, RESETS, XOSC};

/// Brings up the RP2040 clock tree from the board's 12 MHz crystal and
/// gates the peripheral clocks this bridge actually uses. Mirrors the
/// shape of an RCC/Clocks split: one type does the (unsafe, one-shot)
/// bring-up, the other is a cheap readback handle callers pass around.
pub struct ClockController {
    xosc: XOSC,
    pll_sys: PLL_SYS,
    clocks: CLOCKS,
    resets: RESETS,
}

impl ClockController {
    pub fn new(xosc: XOSC, pll_sys: PLL_SYS, clocks: CLOCKS, resets: RESETS) -> Self {
        ClockController { xosc, pll_sys, clocks, resets }
    }

    /// Starts the crystal oscillator, locks `PLL_SYS` onto the requested
    /// system frequency, switches `clk_sys`/`clk_ref` onto it, derives
    /// `clk_peri` from `clk_sys`, and releases the resets on every block
    /// this firmware touches (IO_BANK0, PADS_BANK0, SPI0, DMA, PIO0).
    ///
    /// Unsafety: must run once, from the reset handler, before any other
    /// code touches a peripheral register.
    pub unsafe fn setup(&self, frequency: CoreFrequency) -> Clocks {
        // 1-15 MHz crystal range, ~1 ms startup delay at 12 MHz.
        self.xosc.ctrl.write(|w| w.freq_range()._1_15mhz());
        self.xosc.startup.write(|w| w.delay().bits(47));
        self.xosc.ctrl.modify(|_, w| w.enable().enable());
        while self.xosc.status.read().stable().bit_is_clear() {}

        // Everything downstream of clk_ref/clk_sys must be glitchlessly
        // parked on the crystal before the PLL is reconfigured.
        self.clocks.clk_ref_ctrl.write(|w| w.src().xosc_clksrc());
        self.clocks.clk_sys_ctrl.write(|w| w.src().clk_ref());

        self.resets.reset.modify(|_, w| w.pll_sys().set_bit());
        self.resets.reset.modify(|_, w| w.pll_sys().clear_bit());
        while self.resets.reset_done.read().pll_sys().bit_is_clear() {}

        let (refdiv, fbdiv, postdiv1, postdiv2, sys_hz) = frequency.pll_params();
        self.pll_sys.cs.write(|w| w.refdiv().bits(refdiv));
        self.pll_sys.fbdiv_int.write(|w| w.fbdiv_int().bits(fbdiv));
        self.pll_sys.pwr.modify(|_, w| w.pd().clear_bit().vcopd().clear_bit());
        while self.pll_sys.cs.read().lock().bit_is_clear() {}
        self.pll_sys
            .prim
            .write(|w| w.postdiv1().bits(postdiv1).postdiv2().bits(postdiv2));
        self.pll_sys.pwr.modify(|_, w| w.postdivpd().clear_bit());

        self.clocks
            .clk_sys_ctrl
            .modify(|_, w| w.src().clksrc_clk_sys_aux());
        self.clocks
            .clk_sys_ctrl
            .modify(|_, w| w.auxsrc().clksrc_pll_sys());

        self.clocks.clk_peri_ctrl.write(|w| {
            w.enable().set_bit().auxsrc().clk_sys()
        });

        self.resets.reset.modify(|_, w| {
            w.io_bank0()
                .clear_bit()
                .pads_bank0()
                .clear_bit()
                .spi0()
                .clear_bit()
                .dma()
                .clear_bit()
                .pio0()
                .clear_bit()
        });
        while {
            let done = self.resets.reset_done.read();
            !(done.io_bank0().bit_is_set()
                && done.pads_bank0().bit_is_set()
                && done.spi0().bit_is_set()
                && done.dma().bit_is_set()
                && done.pio0().bit_is_set())
        } {}

        Clocks { sys_hz, peri_hz: sys_hz }
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub enum CoreFrequency {
    /// 12 MHz crystal * 125 / (6 * 2) = 125 MHz, the RP2040 reset default.
    F125MHz,
    /// 12 MHz crystal * 133 / (6 * 2) = 133 MHz, the documented safe
    /// overclock most RP2040 boards tolerate without a voltage bump.
    F133MHz,
}

impl CoreFrequency {
    fn pll_params(self) -> (u8, u16, u8, u8, u32) {
        match self {
            CoreFrequency::F125MHz => (1, 125, 6, 2, 125_000_000),
            CoreFrequency::F133MHz => (1, 133, 6, 2, 133_000_000),
        }
    }
}

pub struct Clocks {
    sys_hz: u32,
    peri_hz: u32,
}

impl Clocks {
    pub fn sys_hz(&self) -> u32 {
        self.sys_hz
    }

    pub fn peri_hz(&self) -> u32 {
        self.peri_hz
    }
}
