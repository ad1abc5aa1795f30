//! Output abstraction for the `print` statement and error reporting.
//!
//! The VM never writes to stdout directly; everything flows through a
//! [`PrintWriter`] supplied by the host. This keeps the core embeddable and
//! lets tests capture output without touching process-level streams.

/// Destination for interpreter output.
pub trait PrintWriter {
    /// Writes a chunk of output. No newline is appended.
    fn print(&mut self, output: &str);
}

/// Writes output to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn print(&mut self, output: &str) {
        print!("{output}");
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn print(&mut self, _output: &str) {}
}

/// Collects output into a string, for tests and embedders that want to
/// inspect what a script printed.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    output: String,
}

impl CollectStringPrint {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected output, leaving the collector empty.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Returns the collected output without consuming it.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }
}

impl PrintWriter for CollectStringPrint {
    fn print(&mut self, output: &str) {
        self.output.push_str(output);
    }
}
