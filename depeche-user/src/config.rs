use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub insecure_auth: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_output: LogOutput,

    pub database: DatabaseConfig,
    pub s3: S3Config,
    pub local_cache: LocalCacheConfig,
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    pub servers: ServersConfig,
    #[serde(default)]
    pub lmtp: LmtpConfig,
    pub tls: Option<TlsConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Syslog,
    Stderr,
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Stderr
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub log_queries: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub trace: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LocalCacheConfig {
    pub path: PathBuf,
    #[serde(default = "default_cache_capacity")]
    pub capacity: ConfigSize,
    #[serde(default = "default_max_object_size")]
    pub max_object_size: ConfigSize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploaderConfig {
    pub path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: ConfigDuration,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CleanupConfig {
    #[serde(default = "default_grace_period")]
    pub grace_period: ConfigDuration,
    #[serde(default = "default_wake_interval")]
    pub wake_interval: ConfigDuration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            wake_interval: default_wake_interval(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServersConfig {
    #[serde(default)]
    pub start_imap: bool,
    #[serde(default = "default_imap_addr")]
    pub imap_addr: SocketAddr,

    #[serde(default)]
    pub start_lmtp: bool,
    #[serde(default = "default_lmtp_addr")]
    pub lmtp_addr: SocketAddr,

    #[serde(default)]
    pub start_pop3: bool,
    #[serde(default = "default_pop3_addr")]
    pub pop3_addr: SocketAddr,

    #[serde(default)]
    pub start_managesieve: bool,
    #[serde(default = "default_managesieve_addr")]
    pub managesieve_addr: SocketAddr,

    pub master_username: Option<String>,
    pub master_password: Option<String>,
}

impl ServersConfig {
    pub fn any_enabled(&self) -> bool {
        self.start_imap || self.start_lmtp || self.start_pop3 || self.start_managesieve
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LmtpConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Reserved: outbound relay for sieve redirects and vacation replies.
    pub external_relay: Option<String>,
}

impl Default for LmtpConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            external_relay: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

// ---

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_db_host() -> String {
    "localhost".into()
}
fn default_db_port() -> u16 {
    5432
}
fn default_s3_region() -> String {
    "garage".into()
}
fn default_cache_capacity() -> ConfigSize {
    ConfigSize(1 << 30)
}
fn default_max_object_size() -> ConfigSize {
    ConfigSize(1 << 20)
}
fn default_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_interval() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(30))
}
fn default_grace_period() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(14 * 24 * 3600))
}
fn default_wake_interval() -> ConfigDuration {
    ConfigDuration(Duration::from_secs(600))
}
fn default_imap_addr() -> SocketAddr {
    "[::]:143".parse().unwrap()
}
fn default_lmtp_addr() -> SocketAddr {
    "[::]:24".parse().unwrap()
}
fn default_pop3_addr() -> SocketAddr {
    "[::]:110".parse().unwrap()
}
fn default_managesieve_addr() -> SocketAddr {
    "[::]:4190".parse().unwrap()
}
fn default_hostname() -> String {
    "localhost".into()
}

// ---- suffixed durations and sizes ----

/// A duration written as `30s`, `5m`, `12h` or `14d` (bare integers are
/// seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn duration(&self) -> Duration {
        self.0
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, mult) = match s.char_indices().last() {
        Some((i, 's')) => (&s[..i], 1u64),
        Some((i, 'm')) => (&s[..i], 60),
        Some((i, 'h')) => (&s[..i], 3600),
        Some((i, 'd')) => (&s[..i], 24 * 3600),
        Some((_, c)) if c.is_ascii_digit() => (s, 1),
        _ => return Err(format!("invalid duration {:?}", s)),
    };
    let n: u64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {:?}", s))?;
    Ok(Duration::from_secs(n * mult))
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Human(String),
        }
        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(ConfigDuration(Duration::from_secs(n))),
            Raw::Human(s) => parse_duration(&s).map(ConfigDuration).map_err(de::Error::custom),
        }
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&format!("{}s", self.0.as_secs()))
    }
}

/// A size written as `512kb`, `10mb` or `2gb` (bare integers are bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSize(pub u64);

impl ConfigSize {
    pub fn bytes(&self) -> u64 {
        self.0
    }
}

pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_ascii_lowercase();
    let (value, mult) = if let Some(v) = s.strip_suffix("kb") {
        (v, 1u64 << 10)
    } else if let Some(v) = s.strip_suffix("mb") {
        (v, 1 << 20)
    } else if let Some(v) = s.strip_suffix("gb") {
        (v, 1 << 30)
    } else {
        (s.as_str(), 1)
    };
    let n: u64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid size {:?}", s))?;
    Ok(n * mult)
}

impl<'de> Deserialize<'de> for ConfigSize {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Human(String),
        }
        match Raw::deserialize(d)? {
            Raw::Bytes(n) => Ok(ConfigSize(n)),
            Raw::Human(s) => parse_size(&s).map(ConfigSize).map_err(de::Error::custom),
        }
    }
}

impl Serialize for ConfigSize {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43200));
        assert_eq!(parse_duration("14d").unwrap(), Duration::from_secs(1209600));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("never").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512kb").unwrap(), 512 << 10);
        assert_eq!(parse_size("10mb").unwrap(), 10 << 20);
        assert_eq!(parse_size("2GB").unwrap(), 2 << 30);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn full_config_parses() {
        let cfg: Config = toml::from_str(
            r#"
insecure_auth = true
debug = true
log_output = "stderr"

[database]
host = "db.internal"
user = "mail"
password = "hunter2"
name = "mail"

[s3]
endpoint = "http://garage:3900"
access_key = "GK123"
secret_key = "s3cr3t"
bucket = "mail-bodies"

[local_cache]
path = "/var/lib/depeche/cache"
capacity = "10mb"
max_object_size = "1mb"

[uploader]
path = "/var/lib/depeche/staging"
retry_interval = "30s"

[cleanup]
grace_period = "14d"
wake_interval = "10m"

[servers]
start_imap = true
imap_addr = "[::]:1143"
start_lmtp = true
master_username = "master"
master_password = "m4ster"
"#,
        )
        .unwrap();

        assert!(cfg.insecure_auth);
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.local_cache.capacity.bytes(), 10 << 20);
        assert_eq!(
            cfg.uploader.retry_interval.duration(),
            Duration::from_secs(30)
        );
        assert_eq!(
            cfg.cleanup.grace_period.duration(),
            Duration::from_secs(14 * 24 * 3600)
        );
        assert!(cfg.servers.start_imap);
        assert!(!cfg.servers.start_pop3);
        assert!(cfg.servers.any_enabled());
        assert_eq!(cfg.lmtp.hostname, "localhost");
        assert!(cfg.tls.is_none());
    }
}
