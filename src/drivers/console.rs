//! Console sink interface.
//!
//! The framebuffer text renderer and the shell are external to the kernel
//! core; the core only needs somewhere to put log records and the panic
//! screen. Whoever owns the framebuffer registers a [`ConsoleSink`] here.

use core::fmt;

use spin::RwLock;

pub trait ConsoleSink: Send + Sync {
    fn write_str(&self, s: &str);

    /// 0x00RRGGBB foreground/background, as the renderer understands them.
    fn set_colors(&self, fg: u32, bg: u32) {
        let _ = (fg, bg);
    }

    fn clear(&self) {}
}

static SINK: RwLock<Option<&'static dyn ConsoleSink>> = RwLock::new(None);

pub fn register(sink: &'static dyn ConsoleSink) {
    *SINK.write() = Some(sink);
}

/// Run `f` against the registered sink, if any.
pub fn with_sink(f: impl FnOnce(&dyn ConsoleSink)) {
    if let Some(sink) = *SINK.read() {
        f(sink);
    }
}

/// Adapter so `core::fmt` machinery can drive a sink.
pub struct SinkWriter<'a>(pub &'a dyn ConsoleSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}
