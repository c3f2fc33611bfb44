use rp2040_pac::PIO0;

/// The parallel-bus wire format (spec.md §3) frames bytes over 8 data
/// lines plus R/W, CS and a host-driven clock, the same device-addressed
/// byte-stream shape as the SPI side rather than a conventional
/// address/data memory bus. This program samples the data bus into the
/// RX FIFO on write cycles (CS asserted, R/W low, clock rising) and
/// drives it from the TX FIFO on read cycles (CS asserted, R/W high);
/// with CS deasserted the pins float and the state machine idles on the
/// first instruction.
///
/// Encoded by hand rather than via `pio-proc`'s assembler since this
/// crate has no build-time PIO toolchain; each word is PIO's 16-bit
/// instruction encoding (opcode in bits 15:13, delay/side-set in 12:8,
/// arguments in 7:0) as documented in the RP2040 datasheet §3.4. The two
/// `WAIT` instructions that test `cs_pin`/`clk_pin` use the GPIO (not
/// PIN-mapped) source, so the pin numbers below are absolute GPIO
/// numbers rather than offsets from `IN_BASE` — `cs_pin`/`clk_pin` need
/// not fall inside the 8-pin `bus_d0..d7` window `in_base`/`out_base`
/// cover.
///
/// 0: wait 1 gpio CS_PIN      ; idle until the host asserts CS
/// 1: wait 1 gpio CLK_PIN     ; idle until the clock's rising edge
/// 2: jmp pin, 5              ; R/W pin high -> read cycle, jump to OUT
/// 3: in pins, 8              ; write cycle: sample D0-D7 into ISR
/// 4: push                    ; ISR -> RX FIFO, then fall through to wrap
/// 5: out pins, 8             ; read cycle: OSR -> D0-D7 (autopull refills)
/// 6: wait 0 gpio CLK_PIN     ; hold until the clock falls before re-arming
/// 7: jmp 0                   ; back to waiting for the next CS assertion
fn program(cs_pin: u8, clk_pin: u8) -> [u16; 8] {
    const WAIT_GPIO_HIGH: u16 = 0x2080;
    const WAIT_GPIO_LOW: u16 = 0x2000;
    [
        WAIT_GPIO_HIGH | (cs_pin as u16 & 0x1f),
        WAIT_GPIO_HIGH | (clk_pin as u16 & 0x1f),
        0x00c5,
        0x4008,
        0x8020,
        0x6008,
        WAIT_GPIO_LOW | (clk_pin as u16 & 0x1f),
        0x0000,
    ]
}

/// Wraps `PIO0`'s two state machines this bridge uses: SM0 samples writes
/// into the RX ring (`bridge-bsp::dma::RxRing`), SM1 drives reads from the
/// one-shot TX channel (`bridge-bsp::dma::BusTx`).
pub struct Pio {
    pio: PIO0,
}

impl Pio {
    pub fn new(pio: PIO0) -> Self {
        Pio { pio }
    }

    /// Loads the bus-sampling program into instruction memory starting at
    /// address 0 and configures both state machines to run it. `d0_base` is
    /// the GPIO number of `bus_d0` (D1-D7 follow it in order); `rw_pin` is
    /// tested by the program's `jmp pin` to pick read vs. write cycles;
    /// `cs_pin`/`clk_pin` are the two `WAIT` operands (`bridge-bsp::gpio::
    /// Pins` lays all four out however the board wires them, so none is
    /// assumed adjacent to or derived from another).
    pub fn setup(&self, d0_base: u8, rw_pin: u8, cs_pin: u8, clk_pin: u8, clock_div_int: u16) {
        for (i, word) in program(cs_pin, clk_pin).iter().enumerate() {
            self.pio.instr_mem[i].write(|w| unsafe { w.instr_mem0().bits(*word) });
        }

        for sm in 0..2u8 {
            let sm_regs = &self.pio.sm[sm as usize];
            sm_regs.sm_clkdiv.write(|w| unsafe { w.int().bits(clock_div_int) });
            sm_regs.sm_pinctrl.write(|w| unsafe {
                w.in_base().bits(d0_base).out_base().bits(d0_base).out_count().bits(8)
            });
            sm_regs.sm_execctrl.modify(|_, w| unsafe { w.jmp_pin().bits(rw_pin) });
            sm_regs.sm_shiftctrl.modify(|_, w| {
                w.autopush().set_bit().autopull().set_bit().in_shiftdir().set_bit().out_shiftdir().set_bit()
            });
            sm_regs.sm_addr.reset();
        }
    }

    pub fn enable(&self) {
        self.pio.ctrl.modify(|_, w| unsafe { w.sm_enable().bits(0b11) });
    }

    pub fn disable(&self) {
        self.pio.ctrl.modify(|_, w| unsafe { w.sm_enable().bits(0) });
    }

    /// Routes the TX state machine's "FIFO not full" status to `PIO0_IRQ_0`
    /// so the handler gets a chance to drain `take_rx_underflow` promptly
    /// after a stall, rather than only finding out on the next poll.
    pub fn enable_tx_irq(&self, sm: u8) {
        self.pio.irq0_inte.modify(|r, w| unsafe { w.bits(r.bits() | (1 << (4 + sm))) });
    }

    pub fn rx_fifo_addr(&self, sm: u8) -> u32 {
        self.pio.rxf[sm as usize].as_ptr() as u32
    }

    pub fn tx_fifo_addr(&self, sm: u8) -> u32 {
        self.pio.txf[sm as usize].as_ptr() as u32
    }

    /// Drains the sticky TX FIFO underflow flag (`FDEBUG.TXSTALL` would
    /// also catch this, but `FDEBUG`'s per-SM stick-on-empty-pull bit at
    /// `8 + sm` is the one that actually fires mid-transfer) for the given
    /// state machine — the signal `bridge_core::bus_engine::BusTxDma::
    /// take_underflow` exposes up to the engine. A free function, like
    /// `bridge-bsp::dma`'s channel-indexed helpers: by the time an
    /// interrupt fires, `Pio` is a local the handler has no access to, only
    /// the state machine index.
    pub fn take_rx_underflow(sm: u8) -> bool {
        let pio = unsafe { &*PIO0::ptr() };
        let mask = 1u32 << (8 + sm);
        let set = pio.fdebug.read().bits() & mask != 0;
        if set {
            pio.fdebug.write(|w| unsafe { w.bits(mask) });
        }
        set
    }
}
