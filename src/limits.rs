use crate::model::Ms;

/// Widest date range a single availability query may cover.
pub const MAX_QUERY_DAYS: i64 = 31;

/// Longest contiguous run of slots one booking may hold.
pub const MAX_SLOTS_PER_BOOKING: u32 = 19;

pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_GATEWAY_ID_LEN: usize = 128;
/// Hex-encoded HMAC-SHA256 is exactly this long.
pub const SIGNATURE_HEX_LEN: usize = 64;

/// Amounts above this are rejected before they reach the gateway.
pub const MAX_AMOUNT_MINOR: i64 = 100_000_000;

/// Attempts of a reservation commit before an aborted transaction surfaces as a conflict.
pub const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Pause between aborted commit attempts.
pub const COMMIT_RETRY_BACKOFF_MS: u64 = 25;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
