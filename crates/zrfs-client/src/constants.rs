//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH host for local development.
pub const DEFAULT_SSH_HOST: &str = "localhost";

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// SSH subsystem the server exposes the filesystem on.
pub const ZRFS_SUBSYSTEM: &str = "zrfs";

/// SSH inactivity timeout.
pub const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// SSH keep-alive interval.
pub const SSH_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// SSH keep-alive max retries.
pub const SSH_KEEPALIVE_MAX: usize = 3;

/// Largest message on the subsystem stream: everything the `u32` length
/// prefix can express. A whole-file read reply may be this large.
pub const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Most payload bytes sent in one `write` request (16 MiB). Larger writes
/// are split; the remainder is reported back as a short write.
pub const MAX_WRITE_LEN: usize = 16 * 1024 * 1024;

/// Chunk size for whole-file reads of files whose size is unknown
/// (virtual files report size 0).
pub const READ_FILE_CHUNK: u64 = 8 * 1024;

/// Default chunk size requested by read streams.
pub const STREAM_CHUNK_SIZE: u64 = 64 * 1024;

/// Consecutive zero-progress write attempts tolerated after the first one.
pub const WRITE_RETRY_LIMIT: u32 = 5;
