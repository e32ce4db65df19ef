pub const GROUP_ID_KEY: &str = "group.id";
pub const AUTO_OFFSET_RESET_KEY: &str = "auto.offset.reset";
pub const OFFSET_RESET_EARLIEST: &str = "earliest";
pub const OFFSET_RESET_LATEST: &str = "latest";

pub const DEFAULT_PROPERTIES_FILE: &str = "client.properties";

// in-process broker knobs
pub const DEFAULT_PARTITION_CNT: u32 = 1;
pub const DEFAULT_AUTO_CREATE_TOPICS_ENABLE: bool = true;
