use crate::{LineBuffer, LineSink};
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Longest line handed to a sink, in bytes.
pub const LINE_CAPACITY: usize = 256;

/// `log::Log` implementation writing `[LEVEL] target: message` lines to a [`LineSink`].
pub struct SinkLogger<S> {
    sink: S,
    max_level: LevelFilter,
}

impl<S: LineSink> SinkLogger<S> {
    #[must_use]
    pub const fn new(sink: S, max_level: LevelFilter) -> Self {
        Self { sink, max_level }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Install as the global logger. Call once during early init.
    ///
    /// # Errors
    /// Fails if a logger was already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError>
    where
        S: 'static,
    {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    fn format(record: &Record) -> LineBuffer<LINE_CAPACITY> {
        let mut line = LineBuffer::new();
        // LineBuffer never reports an error; overflow is tracked as truncation.
        let _ = write!(
            line,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        line.mark_truncation("...");
        line
    }
}

impl<S: LineSink> Log for SinkLogger<S> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);
        self.sink.emit(line.as_str());
    }

    fn flush(&self) {}
}
