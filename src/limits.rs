// Hard limits. Anything beyond these is rejected with `LimitExceeded`.

use crate::model::Ms;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single slot: 7 days.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_COMMENT_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 1_000;

pub const MAX_OCCURRENCES_PER_EXPANSION: usize = 10_000;
pub const MAX_SLOTS_PER_PROVIDER: usize = 200_000;
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Largest journal payload. Bigger length prefixes are treated as corruption.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Upper bound for query and materialization windows when no config overrides it.
pub const DEFAULT_MAX_WINDOW_DAYS: i64 = 366;
