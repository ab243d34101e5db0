//! Names and limits shared across the server runtime.

/// Tables reserved for the schema registry and admin bookkeeping. User collections may never
/// use these names, nor anything starting with `_`.
pub const COLLECTIONS_TABLE: &str = "_collections";
pub const FIELDS_TABLE: &str = "_fields";
pub const ADMINS_TABLE: &str = "_admins";

/// Managed columns present on every user table, in addition to the schema-defined fields.
pub const MANAGED_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

pub const ID_LENGTH: usize = 12;

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_DB_PATH: &str = "bunbase.db";
pub const DEFAULT_STORAGE_DIR: &str = "./data/storage";

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 30;
pub const MAX_PER_PAGE: i64 = 500;

pub const DEFAULT_FILE_MAX_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_FILE_MAX_FILES: u32 = 1;

pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

pub const SSE_PING_INTERVAL_SECS: u64 = 30;
pub const REALTIME_SWEEP_INTERVAL_SECS: u64 = 60;
pub const REALTIME_INACTIVITY_TIMEOUT_SECS: i64 = 5 * 60;
pub const REALTIME_CLIENT_CHANNEL_CAPACITY: usize = 64;
