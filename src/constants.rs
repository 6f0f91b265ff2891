// -
// Shared-memory layout

/// Maximum number of concurrent readers per lock instance. The next reader
/// blocks until a slot frees.
pub const READ_LIMIT: usize = 10;

/// "DSTR" in little-endian
pub(crate) const REGION_MAGIC: u32 = 0x5254_5344;
pub(crate) const REGION_VERSION: u32 = 1;

// -
// File naming

pub(crate) const MAIN_REGION_NAME: &str = "main";
pub(crate) const REGION_SUFFIX: &str = "shm";
pub(crate) const DATA_SUFFIX: &str = "data";
pub(crate) const SUB_REGION_SUFFIX: &str = "sub.shm";
pub(crate) const SUB_DATA_SUFFIX: &str = "sub";

// -
// Holder identities

/// Set on holder ids owned by a single request rather than a session
pub(crate) const REQUEST_HOLDER_BIT: u64 = 1 << 63;
