/// Destination for finished log lines.
///
/// `line` carries no trailing newline; sinks that need one add it.
pub trait LineSink: Send + Sync {
    fn emit(&self, line: &str);
}

impl<S: LineSink + ?Sized> LineSink for &S {
    #[inline]
    fn emit(&self, line: &str) {
        (**self).emit(line);
    }
}

/// Discards every line.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullSink;

impl LineSink for NullSink {
    #[inline]
    fn emit(&self, _line: &str) {}
}

/// QEMU debug console (`-debugcon`), one byte per `out` to port `0x402`.
///
/// Compiled to a no-op without the `qemu` feature or off x86-64.
#[derive(Debug, Default, Copy, Clone)]
pub struct QemuDebugSink;

impl QemuDebugSink {
    /// The port number for QEMU's debug port.
    pub const PORT: u16 = 0x402;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn putc(byte: u8) {
        #[cfg(all(feature = "qemu", target_arch = "x86_64"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") Self::PORT,
                in("al") byte,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(all(feature = "qemu", target_arch = "x86_64")))]
        let _ = byte;
    }
}

impl LineSink for QemuDebugSink {
    fn emit(&self, line: &str) {
        for b in line.bytes() {
            Self::putc(b);
        }
        Self::putc(b'\n');
    }
}
