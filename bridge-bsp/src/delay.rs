use bridge_core::spi_engine::Clock;
use rp2040_pac::TIMER;

/// Wraps RP2040's free-running, always-on microsecond counter (`TIMER`).
/// Unlike the Cortex-M `SysTick` this replaces, it counts up rather than
/// down and never needs a reload value, so `now_us`/`delay_us` both read
/// straight off `TIMERAWL` instead of tracking ticks-since-last-sample.
pub struct Delay {
    timer: TIMER,
}

impl Delay {
    pub fn new(timer: TIMER) -> Self {
        Delay { timer }
    }

    #[inline(always)]
    pub fn now(&self) -> u32 {
        self.timer.timerawl.read().bits()
    }

    pub fn delay_us(&self, us: u32) {
        let start = self.now();
        while self.now().wrapping_sub(start) < us {}
    }

    pub fn delay_ticks_from_last(&self, ticks: u32, last: u32) -> u32 {
        loop {
            let now = self.now();
            if now.wrapping_sub(last) >= ticks {
                break now;
            }
        }
    }
}

impl Clock for Delay {
    fn now_us(&self) -> u32 {
        self.now()
    }
}
