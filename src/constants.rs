pub const ENABLED_DIR_ENV: &str = "HEARTBEAT_ENABLED_DIR";
pub const TIME_DIR_ENV: &str = "HEARTBEAT_TIME_DIR";
pub const DEFAULT_TIME_DIR: &str = "/tmp";
pub const DEFAULT_TIME_FILE_PATTERN: &str = r"^heartbeat_time";
pub const SHM_STATE_PREFIX: &str = "/heartbeat-state-";
pub const SHM_LOG_PREFIX: &str = "/heartbeat-log-";
pub const NANOS_PER_SEC: f64 = 1_000_000_000.0;
pub const TEXT_LOG_HEADER: &str =
    "Beat\tTag\tTimestamp\tGlobal Rate\tWindow Rate\tInstant Rate\tMin Rate\tMax Rate";
