// Limits
pub const MAX_MESSAGE_LENGTH: usize = 4000;
pub const MAX_GROUP_NAME_LENGTH: usize = 100;
pub const MAX_SEARCH_QUERY_LENGTH: usize = 64;

// Pagination
pub const INITIAL_PAGE_SIZE: u32 = 16;
pub const OLDER_PAGE_SIZE: u32 = 5;
pub const RETAINED_MESSAGES_ON_SWITCH: usize = 20;

// Reconciliation
pub const RECONCILE_WINDOW_MS: i64 = 5_000;
pub const TYPING_EXPIRY_MS: u64 = 2_000;
pub const TYPING_COLLAPSE_THRESHOLD: usize = 3;
pub const VISIBILITY_REFRESH_AFTER_SECS: u64 = 30;

// Realtime transport
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 16_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

// Offline queue
pub const OFFLINE_MAX_RETRIES: u32 = 3;
