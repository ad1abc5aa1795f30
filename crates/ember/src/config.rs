//! VM configuration.

/// Tunables for a [`crate::Vm`] instance, fixed at construction time.
///
/// The four heap sizes are the collection thresholds of the Eden, Young, Old
/// and Permanent generations in bytes. When a generation's allocated bytes
/// exceed its threshold, a collection of that generation (and every younger
/// one) runs on the next allocation.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Collection threshold for the Eden generation.
    pub gc_eden_heap_size: usize,
    /// Collection threshold for the Young generation.
    pub gc_young_heap_size: usize,
    /// Collection threshold for the Old generation.
    pub gc_old_heap_size: usize,
    /// Collection threshold for the Permanent generation (full collections).
    pub gc_heap_size: usize,
    /// Multiplier applied to a generation's threshold after a collection
    /// that leaves it more than half full.
    pub gc_growth_factor: usize,
    /// Trace every token the scanner produces, at trace level.
    pub debug_token: bool,
    /// Disassemble every compiled function through `tracing` at debug level.
    pub debug_print_code: bool,
    /// Collect the Eden generation on every allocation. Slow; for tests.
    pub stress_gc: bool,
    /// Emit `tracing` events for every collection cycle.
    pub log_gc: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            gc_eden_heap_size: 1024 * 1024,
            gc_young_heap_size: 4 * 1024 * 1024,
            gc_old_heap_size: 16 * 1024 * 1024,
            gc_heap_size: 64 * 1024 * 1024,
            gc_growth_factor: 2,
            debug_token: false,
            debug_print_code: false,
            stress_gc: false,
            log_gc: false,
        }
    }
}

impl VmConfig {
    /// A configuration that collects on every allocation, for exercising GC
    /// interactions in tests.
    #[must_use]
    pub fn stress() -> Self {
        Self {
            stress_gc: true,
            ..Self::default()
        }
    }
}
