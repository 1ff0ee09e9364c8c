//! Progress reporting seam.
//!
//! The driver is the only writer; implementations are injected by the caller
//! (the CLI renders a counter on stderr, the library default is silent).

pub trait ProgressSink {
    fn begin(&self, _total: usize) {}
    fn advance(&self, _path: &str) {}
    fn finish(&self) {}
}

/// Silent default for library callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}
