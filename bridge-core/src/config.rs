//! Compile-time constants. There is no runtime configuration layer: the
//! bridge has no persistent storage (spec.md §6) and nothing underneath it
//! to read a config file from, so the handful of tunables the spec calls
//! "configurable" are plain `const`s, the same way the teacher firmware
//! feature-gates a core frequency rather than reading one from flash.

/// Maximum number of addressable devices (spec.md §3). Device IDs are
/// `0..MAX_DEVICES`; device 0 is reserved for the interrupt-source query.
pub const MAX_DEVICES: usize = 8;

/// Size of the SPI engine's inbound (MOSI) DMA ring. Fixed by spec.md §4.2:
/// "A single DMA channel continuously deposits MISO bytes into an 8-KiB
/// ring per §4.1."
pub const SPI_RX_RING_SIZE: usize = 8 * 1024;

/// Size of the parallel-bus engine's inbound DMA ring. Spec.md §4.1 only
/// says rings are "8 KiB or 32 KiB in the current builds"; 8 KiB is chosen
/// here for symmetry with the SPI ring since the 6502 side runs far slower
/// than SPI and never needs the larger size.
pub const BUS_RX_RING_SIZE: usize = 8 * 1024;

/// SPI engine's internal queue of decoded (post length-framing) inbound
/// bytes, drained by the bridge via `rx_drain`. Sized so `free_space_units`
/// can report the full `0xFF` ("≥16 KiB free") saturation point.
pub const SPI_RX_QUEUE_SIZE: usize = 16 * 1024;

/// SPI TX queue (spec.md §3): "a single byte-granular circular buffer of
/// ≈4 KiB".
pub const SPI_TX_QUEUE_SIZE: usize = 4096;

/// Per-device TX buffer on the parallel-bus side (spec.md §3): "up to 1024
/// bytes".
pub const DEVICE_TX_BUFFER_SIZE: usize = 1024;

/// READ transfer size on the SPI side (spec.md §4.2 PAGE): 3-byte header +
/// 1500-byte payload, matching Ethernet MTU.
pub const PAGE: usize = 1503;
pub const PAGE_HEADER_LEN: usize = 3;
pub const PAGE_PAYLOAD_MAX: usize = PAGE - PAGE_HEADER_LEN;

/// Largest payload a WRITE frame may carry before the SPI engine discards
/// it as oversize (spec.md §7 "Oversize payload"). Not stated explicitly
/// for WRITE in spec.md; bounded to the same Ethernet-MTU-sized payload as
/// READ's page, since nothing in the system ever needs to move more than
/// one page's worth of device payload in either direction at once.
pub const MAX_SPI_WRITE_PAYLOAD: usize = PAGE_PAYLOAD_MAX;

/// Largest payload length on the parallel-bus wire format (spec.md §3):
/// length is one byte, 254 is the largest legal value, 255 is the
/// "not ready" sentinel.
pub const MAX_BUS_PAYLOAD: usize = 254;
pub const BUS_NOT_READY: u8 = 0xFF;

/// REQUEST timeout (spec.md §4.2 and §5): "~1 second without a following
/// READ". Expressed in microseconds against whatever free-running clock
/// `bridge-bsp` wires up (the teacher's `Delay`/systick pattern).
pub const REQUEST_TIMEOUT_US: u32 = 1_000_000;

/// How often (in `Bridge::poll` calls) to emit the periodic statistics
/// line (spec.md §4.4, "format irrelevant to the core").
pub const STATS_PERIOD_POLLS: u32 = 4096;

/// Capacity of the bridge's intermediate hand-off queue from the
/// parallel-bus engine's per-device write callbacks to the SPI engine's
/// TX queue (spec.md §4.4, §3 "SPI TX queue"). Sized generously above a
/// single device buffer (1 KiB) so a burst from several devices in one
/// poll doesn't immediately overflow it.
pub const BRIDGE_STAGING_SIZE: usize = 4096;
