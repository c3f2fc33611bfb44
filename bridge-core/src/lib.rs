//! Hardware-independent core of the bridge: the ring-epoch-backed SPI and
//! parallel-bus engines (spec.md §4.2, §4.3) and the bridge multiplexer
//! that wires them together (§4.4). Generic over small traits so the
//! whole stack is testable on the host without real silicon.

#![cfg_attr(not(test), no_std)]

pub mod bridge;
pub mod bus_engine;
pub mod callback;
pub mod config;
pub mod devbuf;
pub mod device;
pub mod spi_engine;

pub use bridge::Bridge;
pub use bus_engine::BusEngine;
pub use callback::WriteSink;
pub use device::DeviceId;
pub use spi_engine::SpiEngine;
