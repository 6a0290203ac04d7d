//! consts relative of memory pool

/// Size of 2 MiB
pub const SZ_2M: usize = 2 * 1024 * 1024;
/// Max size can be managed by Tlsf pool
pub const MAX_POOL_SIZE: usize = SZ_2M;
