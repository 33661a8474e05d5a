//! Default constants for bridge configuration.

/// Argument and return slots in a call arena are rounded up to this size.
pub const DEFAULT_SLOT_GRANULARITY: usize = 16;

/// Minimum size of an argument slot (one machine word).
pub const DEFAULT_MIN_SLOT_SIZE: usize = std::mem::size_of::<usize>();

/// Suffix inserted into the names of dynamically created native classes.
pub const DEFAULT_DYNAMIC_CLASS_SUFFIX: &str = "_Tether";

/// Number of times a finalizer may be retried before it is reported.
pub const DEFAULT_MAX_FINALIZER_RETRIES: u32 = 64;

/// Wait used by worker message loops between termination checks, in milliseconds.
pub const DEFAULT_WORKER_QUEUE_WAIT_MS: u64 = 50;
