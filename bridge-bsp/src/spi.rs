use rp2040_pac::SPI0;

/// RP2040's `SPI0`, configured as a PL022 SPI *slave* (the host 6502
/// system drives SCK/MOSI/CS; this bridge only ever samples and answers).
/// Unlike the teacher's SWD/JTAG master driver this never bit-bangs a
/// clock or exchanges fixed-width words — bytes flow in and out purely
/// through DMA against the FIFO, so the only hand-written register
/// access left is setup, the FIFO address DMA needs, and drain/disable.
pub struct SPI {
    spi: SPI0,
}

impl SPI {
    pub fn new(spi: SPI0) -> Self {
        SPI { spi }
    }

    /// Configures Motorola SPI frame format, 8-bit words, slave mode,
    /// and enables the DMA request lines. `spec.md` §4.2 leaves clock
    /// polarity/phase to match whatever the host drives; this targets
    /// mode 0 (CPOL=0, CPHA=0), the PL022 reset default.
    pub fn setup_slave(&self) {
        self.spi.sspcr1.modify(|_, w| w.sse().clear_bit());
        self.spi.sspcr0.write(|w| unsafe {
            w.dss().bits(0b0111) // 8-bit data
                .frf().motorola()
                .spo().clear_bit()
                .sph().clear_bit()
        });
        self.spi.sspcr1.modify(|_, w| w.ms().set_bit());
        self.spi.sspdmacr.modify(|_, w| w.txdmae().set_bit().rxdmae().set_bit());
        self.spi.sspcr1.modify(|_, w| w.sse().set_bit());
    }

    pub fn disable(&self) {
        self.wait_not_busy();
        self.spi.sspcr1.modify(|_, w| w.sse().clear_bit());
    }

    /// The FIFO data register's address, for `bridge-bsp::dma`'s one-shot
    /// TX channel and the continuously-reloading RX ring to target.
    pub fn fifo_addr(&self) -> u32 {
        self.spi.sspdr.as_ptr() as u32
    }

    /// Drains stale bytes left in the RX FIFO from before the host
    /// started a new transaction, same purpose as the teacher's `drain`.
    pub fn drain(&self) {
        while self.spi.sspsr.read().rne().bit_is_set() {
            self.spi.sspdr.read();
        }
    }

    #[inline(always)]
    fn wait_not_busy(&self) {
        while self.spi.sspsr.read().bsy().bit_is_set() {}
    }
}
