use std::time::Duration;

pub const ENV_PREFIX: &str = "KVBENCH_";

const DEFAULT_VALUE_LOG_THRESHOLD: u64 = 256;
const DEFAULT_CACHE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    Snappy,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compression {
    pub kind: CompressionKind,
    pub level: i32,
    pub max_dict_bytes: i32,
    /// Blocks smaller than this are stored uncompressed. `0` compresses all.
    pub min_bytes: u64,
    /// Compressed output is kept only if it saves at least this many bytes.
    pub min_savings: u64,
}

impl Compression {
    pub fn has_thresholds(&self) -> bool {
        self.min_bytes > 0 || self.min_savings > 0
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression {
            kind: CompressionKind::Zstd,
            level: 3,
            max_dict_bytes: 0,
            min_bytes: 0,
            min_savings: 0,
        }
    }
}

/// Whether reads go through an engine-managed cache or straight to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cached,
    Raw,
}

/// Background compaction pacing. `None` keeps the engine default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionThrottle {
    pub interval: Option<Duration>,
    pub rate_bytes_per_sec: Option<i64>,
    pub burst_bytes: Option<u64>,
}

/// Construction-time tunables. Every engine reads the fields it understands
/// and ignores the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub disable_wal: bool,
    pub disable_background: bool,
    pub relaxed_sync: bool,
    pub disable_value_log: bool,
    pub disable_read_checksum: bool,
    /// Explicit override of the unsafe marker; `None` derives it.
    pub allow_unsafe: Option<bool>,
    pub pin_snapshot: bool,
    pub reuse_reads: bool,
    pub force_value_pointers: bool,
    /// Values at least this large are moved to the value log.
    pub value_log_threshold: u64,
    pub compression: Compression,
    pub disable_index_vacuum: bool,
    /// Make every plain write behave like its `*_sync` variant.
    pub sync_writes: bool,
    pub mode: Mode,
    pub cache_bytes: usize,
    pub compaction: CompactionThrottle,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            disable_wal: false,
            disable_background: false,
            relaxed_sync: false,
            disable_value_log: false,
            disable_read_checksum: false,
            allow_unsafe: None,
            pin_snapshot: false,
            reuse_reads: false,
            force_value_pointers: false,
            value_log_threshold: DEFAULT_VALUE_LOG_THRESHOLD,
            compression: Compression::default(),
            disable_index_vacuum: false,
            sync_writes: false,
            mode: Mode::Cached,
            cache_bytes: DEFAULT_CACHE_BYTES,
            compaction: CompactionThrottle::default(),
        }
    }
}

impl StoreOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds options from `lookup`, which is handed full variable names
    /// (`KVBENCH_DISABLE_WAL`, ...). Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let defaults = StoreOptions::default();

        let compression = Compression {
            kind: var("COMPRESSION")
                .map(|v| parse_compression(&v, defaults.compression.kind))
                .unwrap_or(defaults.compression.kind),
            level: parse_num(var("COMPRESSION_LEVEL"), defaults.compression.level),
            max_dict_bytes: parse_num(
                var("COMPRESSION_DICT_BYTES"),
                defaults.compression.max_dict_bytes,
            ),
            min_bytes: parse_num(var("COMPRESSION_MIN_BYTES"), defaults.compression.min_bytes),
            min_savings: parse_num(
                var("COMPRESSION_MIN_SAVINGS"),
                defaults.compression.min_savings,
            ),
        };

        let mode = match var("MODE").map(|v| v.trim().to_lowercase()).as_deref() {
            Some("backend") | Some("raw") | Some("uncached") => Mode::Raw,
            _ => defaults.mode,
        };

        let compaction = CompactionThrottle {
            interval: parse_opt::<u64>(var("COMPACTION_INTERVAL_SECS")).map(Duration::from_secs),
            rate_bytes_per_sec: parse_opt(var("COMPACTION_RATE_BYTES")),
            burst_bytes: parse_opt(var("COMPACTION_BURST_BYTES")),
        };

        StoreOptions {
            disable_wal: parse_bool(var("DISABLE_WAL"), defaults.disable_wal),
            disable_background: parse_bool(var("DISABLE_BG"), defaults.disable_background),
            relaxed_sync: parse_bool(var("RELAXED_SYNC"), defaults.relaxed_sync),
            disable_value_log: parse_bool(var("DISABLE_VALUE_LOG"), defaults.disable_value_log),
            disable_read_checksum: parse_bool(
                var("DISABLE_READ_CHECKSUM"),
                defaults.disable_read_checksum,
            ),
            allow_unsafe: var("ALLOW_UNSAFE").map(|v| parse_bool(Some(v), false)),
            pin_snapshot: parse_bool(var("PIN_SNAPSHOT"), defaults.pin_snapshot),
            reuse_reads: parse_bool(var("REUSE_READS"), defaults.reuse_reads),
            force_value_pointers: parse_bool(
                var("FORCE_VALUE_POINTERS"),
                defaults.force_value_pointers,
            ),
            value_log_threshold: parse_num(
                var("VALUE_LOG_THRESHOLD"),
                defaults.value_log_threshold,
            ),
            compression,
            disable_index_vacuum: parse_bool(
                var("DISABLE_INDEX_VACUUM"),
                defaults.disable_index_vacuum,
            ),
            sync_writes: parse_bool(var("SYNC_MODE"), defaults.sync_writes),
            mode,
            cache_bytes: parse_num(var("CACHE_BYTES"), defaults.cache_bytes),
            compaction,
        }
    }

    /// A store is unsafe when it trades durability or integrity checks for
    /// speed, unless `allow_unsafe` says otherwise.
    pub fn is_unsafe(&self) -> bool {
        self.allow_unsafe
            .unwrap_or(self.disable_wal || self.relaxed_sync || self.disable_read_checksum)
    }
}

/// Parses a boolean-like value. An empty value means `true`.
pub fn parse_bool(value: Option<String>, default: bool) -> bool {
    let value = match value {
        Some(v) => v.trim().to_lowercase(),
        None => return default,
    };
    match value.as_str() {
        "" | "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "0" | "false" | "f" | "no" | "n" | "off" => false,
        other => other.parse::<i64>().map(|n| n != 0).unwrap_or(default),
    }
}

fn parse_num<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    parse_opt(value).unwrap_or(default)
}

fn parse_opt<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn parse_compression(value: &str, default: CompressionKind) -> CompressionKind {
    match value.trim().to_lowercase().as_str() {
        "" | "none" | "off" | "false" => CompressionKind::None,
        "snappy" => CompressionKind::Snappy,
        "lz4" => CompressionKind::Lz4,
        "zstd" => CompressionKind::Zstd,
        _ => default,
    }
}
