/// Size of the stack every execution unit boots and idles on.
pub(crate) const KERNEL_STACK_SIZE: usize = 32_768;

/// Default stack size for kernel threads that do not request one.
pub(crate) const DEFAULT_STACK_SIZE: usize = 65_536;

/// Guard pages placed below and above every thread stack.
pub(crate) const STACK_GUARD_PAGES: usize = 1;

/// Local timer tick period in milliseconds.
pub(crate) const TICK_PERIOD_MS: u64 = 1;

/// Depth of the per-CPU deferred-call pool.
pub(crate) const DEFERRED_CALL_SLOTS: usize = 64;

/// Upper bound on logical processors; matches the affinity bitmap width.
pub(crate) const MAX_CORES: usize = 64;

/// INIT/SIPI attempts per application processor before it is skipped.
pub(crate) const AP_START_ATTEMPTS: usize = 10;

/// Per-attempt wait for an application processor to signal itself, in
/// milliseconds.
pub(crate) const AP_START_TIMEOUT_MS: u64 = 500;

/// Initial size of the kernel heap arena.
pub(crate) const HEAP_INITIAL_SIZE: usize = 2 * 1024 * 1024;
