//! The callback trait the parallel-bus engine calls into on a completed
//! WRITE (spec.md §4.3 `register_rx_callback`). A plain `dyn FnMut(&[u8])`
//! is enough for direct engine tests, but the bridge needs eight distinct,
//! identically-typed callbacks (one per device) sharing a single
//! hand-off queue, which a bare closure can't express without boxing.
//! `WriteSink` lets `bridge.rs` implement it on one concrete router struct
//! instead, while the blanket impl keeps plain closures working everywhere
//! else.

pub trait WriteSink {
    fn on_write(&mut self, payload: &[u8]);
}

impl<F: FnMut(&[u8])> WriteSink for F {
    fn on_write(&mut self, payload: &[u8]) {
        self(payload)
    }
}
