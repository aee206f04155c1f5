/// Pages in the default user pool (frames available to user processes).
pub const USER_POOL_PAGES: usize = 256;

/// Pages in the default kernel pool (page-table pages).
pub const KERNEL_POOL_PAGES: usize = 128;

/// Swap slots backed by the default swap device. Also the hard upper
/// bound; the slot bitmap is sized to it.
pub const SWAP_SLOTS: usize = 1024;

/// Maximum length of a process name.
pub const MAXPROCNAME: usize = 16;

/// Memory-mapped file regions per process.
pub const NMMAP: usize = 16;

/// Buckets in a freshly initialized hash table. Must be a power of 2.
pub const HASH_INIT_BUCKETS: usize = 4;
