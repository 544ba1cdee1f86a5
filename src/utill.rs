//! Various utility and helper functions shared by the nursery, the wire clients and the store.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Once,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitcoin::secp256k1::SecretKey;
use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Logger, Root},
    encode::pattern::PatternEncoder,
    Config,
};
use serde::{Deserialize, Serialize};

/// Interval at which background loops re-check their shutdown flag.
#[cfg(not(feature = "integration-test"))]
pub const HEART_BEAT_INTERVAL: Duration = Duration::from_secs(3);
/// Interval at which background loops re-check their shutdown flag.
#[cfg(feature = "integration-test")]
pub const HEART_BEAT_INTERVAL: Duration = Duration::from_millis(250);

static LOGGER: Once = Once::new();

/// Get the system specific home directory.
fn get_home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default data directory. `~/.swap-nursery`.
pub fn get_data_dir() -> PathBuf {
    get_home_dir().join(".swap-nursery")
}

/// Sets up the logger for the nursery.
///
/// Logs go to stdout and to `<data_dir>/debug.log`. The `RUST_LOG` env variable, when set,
/// overrides `filter`. Calling this more than once is a no-op.
pub fn setup_logger(filter: LevelFilter, data_dir: Option<PathBuf>) {
    LOGGER.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .ok()
            .and_then(|level| level.parse::<LevelFilter>().ok())
            .unwrap_or(filter);

        let log_dir = data_dir.unwrap_or_else(get_data_dir);
        let pattern = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l}):5.5} {T} {m}{n}";

        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build();

        let mut builder =
            Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
        let mut root = Root::builder().appender("stdout");

        match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build(log_dir.join("debug.log"))
        {
            Ok(file) => {
                builder = builder.appender(Appender::builder().build("file", Box::new(file)));
                root = root.appender("file");
            }
            Err(e) => eprintln!("Could not create log file in {}: {e}", log_dir.display()),
        }

        let config = builder
            .logger(Logger::builder().build("tungstenite", LevelFilter::Warn))
            .logger(Logger::builder().build("rustls", LevelFilter::Warn))
            .build(root.build(filter));

        match config {
            Ok(config) => {
                if let Err(e) = log4rs::init_config(config) {
                    eprintln!("Logger already initialized: {e}");
                }
            }
            Err(e) => eprintln!("Invalid logger config: {e}"),
        }
    });
}

/// Parses a flat `key = value` TOML file into a map.
///
/// Section headers and comments are skipped. Quotes around values are stripped.
pub fn parse_toml(file_path: &Path) -> io::Result<HashMap<String, String>> {
    let file = File::open(file_path)?;
    let reader = BufReader::new(file);

    let mut map = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(map)
}

/// Parses a config value, returning `default` when the key is missing or has the wrong type.
pub fn parse_field<T: std::str::FromStr>(value: Option<&String>, default: T) -> T {
    value
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Newtype wrapper for `SecretKey` that implements Serialize/Deserialize.
///
/// `SecretKey` is serialized as a raw 32-byte array so it stays compact in CBOR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializableSecretKey(pub SecretKey);

impl Serialize for SerializableSecretKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.secret_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializableSecretKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; 32] = Deserialize::deserialize(deserializer)?;
        let key = SecretKey::from_slice(&bytes).map_err(serde::de::Error::custom)?;
        Ok(SerializableSecretKey(key))
    }
}

impl From<SecretKey> for SerializableSecretKey {
    fn from(key: SecretKey) -> Self {
        SerializableSecretKey(key)
    }
}

impl From<SerializableSecretKey> for SecretKey {
    fn from(key: SerializableSecretKey) -> Self {
        key.0
    }
}

/// Serde helpers encoding byte vectors as lowercase hex strings.
pub mod hex_bytes {
    use bitcoin::hex::{DisplayHex, FromHex};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as hex.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&bytes.to_lower_hex_string())
    }

    /// Deserialize hex into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Vec::<u8>::from_hex(&s).map_err(serde::de::Error::custom)
    }

    /// Same as the parent module for optional fields.
    pub mod option {
        use super::*;

        /// Serialize optional bytes as hex.
        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&bytes.to_lower_hex_string()),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize optional hex into bytes.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| Vec::<u8>::from_hex(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
