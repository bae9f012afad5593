//! Server configuration, loaded from a YAML file with explicit defaults
//! for every recognized key. Invalid configuration aborts startup.

use crate::errinput;
use crate::error::Result;

use serde::Deserialize;

/// The sfdb configuration. Field structure mirrors the YAML table layout.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub dir: DirConfig,
    pub persistent: PersistentConfig,
    pub meids: MeidConfig,
    pub memory: MemoryConfig,
    pub logs: LogConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// HTTP port. The HTTP face itself is out of scope here, but the port
    /// is part of the recognized key set.
    pub port: u16,
    /// TCP shell port.
    pub cli_port: u16,
    /// Failed logins before a subject is locked down. 0 disables lockdown.
    pub max_cli_login_attempt: u32,
    /// Lockdown subject: by source IP, by token, or disabled.
    pub cli_lockdown: LockdownMode,
    /// Lockdown cooldown in seconds, at least 5.
    pub cli_cooldown: u64,
    /// Authentication timeout in milliseconds, at least 1000.
    pub cli_authentication_timeout: u64,
    /// Maximum shell input line size as a byte string, 0 for unlimited.
    pub cli_input_size: String,
    /// Origin allowlist patterns, compiled once at server start.
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DirConfig {
    /// Database directory holding shard and change log files.
    pub database: String,
    /// Log file directory.
    pub logs: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PersistentConfig {
    /// Whether mutations are logged to disk at all.
    pub enabled: bool,
    /// Change log rotation size as a byte string, 0 for unlimited.
    pub backup_size_limit: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MeidConfig {
    /// Recognized but unsupported; enabling it logs a startup warning.
    pub encrypt: bool,
    /// Unix permission bits applied to created shard files.
    pub permission: u32,
    /// Number of shards. Fixed for the lifetime of a database.
    pub count: usize,
    /// Per-entry value size limit as a byte string, 0 for unlimited.
    pub size: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    /// Whether the in-memory byte total is tracked and enforced.
    pub monitor: bool,
    /// Total in-memory size cap as a byte string, 0 for unlimited.
    pub max_size: String,
    /// If true a KB is 1024 bytes, otherwise 1000.
    pub mb_mode: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    pub enabled: bool,
    pub show_time: bool,
    /// Timestamp format, either "rfc3339" or "rfc2822".
    pub time_format: String,
    pub use_colors: bool,
    pub save_cli_connections: bool,
    pub save_cli_logins: bool,
}

/// The lockdown subject mode.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockdownMode {
    Ip,
    Token,
    None,
}

impl Config {
    /// Loads the configuration from the given YAML file, layered over the
    /// built-in defaults and under SFDB_-prefixed environment variables.
    /// A missing file yields the defaults.
    pub fn load(file: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .set_default("server.port", 6400)?
            .set_default("server.cli_port", 6402)?
            .set_default("server.max_cli_login_attempt", 3)?
            .set_default("server.cli_lockdown", "ip")?
            .set_default("server.cli_cooldown", 60)?
            .set_default("server.cli_authentication_timeout", 5000)?
            .set_default("server.cli_input_size", "0")?
            .set_default("server.allowed_origins", vec![".*".to_string()])?
            .set_default("dir.database", "data")?
            .set_default("dir.logs", "logs")?
            .set_default("persistent.enabled", true)?
            .set_default("persistent.backup_size_limit", "0")?
            .set_default("meids.encrypt", false)?
            .set_default("meids.permission", 0o644)?
            .set_default("meids.count", 4)?
            .set_default("meids.size", "0")?
            .set_default("memory.monitor", true)?
            .set_default("memory.max_size", "0")?
            .set_default("memory.mb_mode", false)?
            .set_default("logs.enabled", true)?
            .set_default("logs.show_time", true)?
            .set_default("logs.time_format", "rfc3339")?
            .set_default("logs.use_colors", true)?
            .set_default("logs.save_cli_connections", true)?
            .set_default("logs.save_cli_logins", true)?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("SFDB").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.cli_cooldown < 5 {
            return errinput!("server.cli_cooldown must be at least 5 seconds");
        }
        if self.server.cli_authentication_timeout < 1000 {
            return errinput!("server.cli_authentication_timeout must be at least 1000 ms");
        }
        if self.meids.count < 1 {
            return errinput!("meids.count must be at least 1");
        }
        if !matches!(self.logs.time_format.as_str(), "rfc3339" | "rfc2822") {
            return errinput!("logs.time_format must be rfc3339 or rfc2822");
        }
        // Parse all byte strings up front so bad values fail at startup.
        self.cli_input_size()?;
        self.backup_size_limit()?;
        self.entry_size_limit()?;
        self.memory_limit()?;
        Ok(())
    }

    /// Maximum shell input line size in bytes, 0 for unlimited.
    pub fn cli_input_size(&self) -> Result<u64> {
        parse_size(&self.server.cli_input_size, self.memory.mb_mode)
    }

    /// Change log rotation limit in bytes, 0 for unlimited.
    pub fn backup_size_limit(&self) -> Result<u64> {
        parse_size(&self.persistent.backup_size_limit, self.memory.mb_mode)
    }

    /// Per-entry value size limit in bytes, 0 for unlimited.
    pub fn entry_size_limit(&self) -> Result<u64> {
        parse_size(&self.meids.size, self.memory.mb_mode)
    }

    /// Total in-memory size cap in bytes, 0 for unlimited. Always 0 when
    /// memory monitoring is off.
    pub fn memory_limit(&self) -> Result<u64> {
        if !self.memory.monitor {
            return Ok(0);
        }
        parse_size(&self.memory.max_size, self.memory.mb_mode)
    }
}

/// Parses a byte-size string such as "64KB" or "2MB". The KB unit is 1024
/// when binary is true and 1000 otherwise. A bare number is bytes.
pub fn parse_size(input: &str, binary: bool) -> Result<u64> {
    let input = input.trim();
    let split = input.find(|c: char| !c.is_ascii_digit()).unwrap_or(input.len());
    let (number, suffix) = input.split_at(split);
    if number.is_empty() {
        return errinput!("invalid size {input}");
    }
    let number: u64 = number.parse()?;
    let unit: u64 = if binary { 1024 } else { 1000 };
    let scale = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => unit,
        "MB" => unit * unit,
        "GB" => unit * unit * unit,
        suffix => return errinput!("unknown size unit {suffix}"),
    };
    number
        .checked_mul(scale)
        .ok_or_else(|| crate::error::Error::InvalidInput(format!("size {input} overflows")))
}
