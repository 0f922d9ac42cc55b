//! Token and logging configuration.
use std::{
    collections::HashMap,
    env, fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{LevelFilter, error};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, de};

use crate::commons::{
    error::{Error, IoError},
    util::file,
};
use crate::constants::*;
use crate::crypto::keyuri::TokenUri;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(KEYCUSTODY_ENV_LOG_LEVEL) {
            Ok(level) => LevelFilter::from_str(&level).unwrap_or_else(|_| {
                eprintln!(
                    "Unrecognized value for log level in env var {}, using 'info'",
                    KEYCUSTODY_ENV_LOG_LEVEL
                );
                LevelFilter::Info
            }),
            Err(_) => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./keycustody.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }
}

//------------ TokenConfig ---------------------------------------------------

/// How to reach one key custody backend.
///
/// Read from a JSON file such as:
///
/// ```json
/// {
///   "Manufacturer": "SoftHSM",
///   "Model": "SoftHSM v2",
///   "Path": "/usr/lib/softhsm/libsofthsm2.so",
///   "TokenSerial": "",
///   "TokenLabel": "signer",
///   "Pin": "file:signer.pin",
///   "Attributes": "MaxSessions=64"
/// }
/// ```
///
/// A PIN starting with `file:` names a file holding the actual PIN. A
/// relative name is tried as is, then under the current directory, then
/// next to the config file.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenConfig {
    #[serde(default)]
    manufacturer: String,

    #[serde(default)]
    model: String,

    #[serde(default)]
    path: String,

    #[serde(default)]
    token_serial: String,

    #[serde(default)]
    token_label: String,

    #[serde(default)]
    pin: Option<SecretString>,

    #[serde(default)]
    attributes: String,
}

impl TokenConfig {
    pub fn new(manufacturer: &str, model: &str) -> Self {
        TokenConfig {
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            path: String::new(),
            token_serial: String::new(),
            token_label: String::new(),
            pin: None,
            attributes: String::new(),
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    pub fn with_token_serial(mut self, serial: &str) -> Self {
        self.token_serial = serial.to_string();
        self
    }

    pub fn with_token_label(mut self, label: &str) -> Self {
        self.token_label = label.to_string();
        self
    }

    pub fn with_pin(mut self, pin: SecretString) -> Self {
        self.pin = Some(pin);
        self
    }

    pub fn with_attributes(mut self, attributes: &str) -> Self {
        self.attributes = attributes.to_string();
        self
    }

    /// Reads the config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = file::read_to_string(path)?;
        Self::from_json(&json, path.parent())
    }

    /// Parses the JSON form of the config, resolving a PIN file relative
    /// to `config_dir` as a last resort.
    pub fn from_json(json: &str, config_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: TokenConfig = serde_json::from_str(json)?;
        config.resolve_pin(config_dir)?;
        Ok(config)
    }

    /// Creates the config from a token locator URI.
    pub fn from_uri(uri: &str) -> Result<Self, Error> {
        let uri = TokenUri::parse(uri)?;
        let mut config = TokenConfig::new(uri.manufacturer(), uri.model())
            .with_token_serial(uri.serial())
            .with_token_label(uri.token());
        if let Some(path) = uri.module_path() {
            config = config.with_path(path);
        }
        config.pin = uri.pin().cloned();
        config.resolve_pin(None)?;
        Ok(config)
    }

    fn resolve_pin(&mut self, config_dir: Option<&Path>) -> Result<(), ConfigError> {
        let pin_file = match &self.pin {
            Some(pin) => match pin.expose_secret().strip_prefix(PIN_FILE_PREFIX) {
                Some(pin_file) => PathBuf::from(pin_file),
                None => return Ok(()),
            },
            None => return Ok(()),
        };

        let mut bases = vec![PathBuf::new()];
        if let Ok(cwd) = env::current_dir() {
            bases.push(cwd);
        }
        if let Some(dir) = config_dir {
            bases.push(dir.to_path_buf());
        }

        let found = file::resolve_in(&pin_file, &bases).ok_or_else(|| {
            ConfigError::Other(format!("could not find PIN file '{}'", pin_file.display()))
        })?;
        let pin = file::read_to_string(&found)?;
        self.pin = Some(SecretString::new(pin.trim().to_string()));
        Ok(())
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The path of the PKCS#11 library.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn token_serial(&self) -> &str {
        &self.token_serial
    }

    pub fn token_label(&self) -> &str {
        &self.token_label
    }

    pub fn pin(&self) -> Option<&SecretString> {
        self.pin.as_ref()
    }

    /// The free form attributes, `key=value` pairs separated by commas.
    pub fn attributes(&self) -> HashMap<String, String> {
        self.attributes
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes().remove(key)
    }

    /// The session pool capacity, see [`DEFAULT_MAX_SESSIONS`].
    pub fn max_sessions(&self) -> Result<usize, ConfigError> {
        match self.attribute(ATTR_MAX_SESSIONS) {
            None => Ok(DEFAULT_MAX_SESSIONS),
            Some(value) => match value.parse::<usize>() {
                Ok(max) if max > 0 => Ok(max),
                _ => Err(ConfigError::Other(format!(
                    "invalid value for {}: '{}'",
                    ATTR_MAX_SESSIONS, value
                ))),
            },
        }
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("manufacturer", &self.manufacturer)
            .field("model", &self.model)
            .field("path", &self.path)
            .field("token_serial", &self.token_serial)
            .field("token_label", &self.token_label)
            .field("pin", &self.pin.as_ref().map(|_| "<hidden>"))
            .field("attributes", &self.attributes)
            .finish()
    }
}

//------------ LogConfig -----------------------------------------------------

/// Where and how much to log.
#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "ConfigDefaults::log_level", deserialize_with = "de_level_filter")]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
        }
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

impl LogConfig {
    /// Installs the global logger. Can only succeed once per process.
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            LogType::Syslog => self.syslog_logger(),
        }
    }

    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    #[cfg(unix)]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        let facility = syslog::Facility::from_str(&self.syslog_facility)
            .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("keycustody"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(e) => Err(ConfigError::Other(format!("Cannot connect to syslog: {}", e))),
        }
    }

    #[cfg(not(unix))]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        Err(ConfigError::other("syslog is only supported on unix"))
    }

    fn fern_logger(&self) -> fern::Dispatch {
        // PKCS#11 bindings are chatty at debug level
        let framework_level = self.log_level.min(LevelFilter::Info);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("cryptoki", framework_level)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found : \"{}\"",
                string
            ))),
        }
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(IoError),
    JsonError(serde_json::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "{}", e),
            ConfigError::JsonError(e) => write!(f, "{}", e),
            ConfigError::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<IoError> for ConfigError {
    fn from(e: IoError) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::JsonError(e)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn should_parse_token_config() {
        let json = r#"{
            "Manufacturer": "SoftHSM",
            "Model": "SoftHSM v2",
            "Path": "/usr/lib/softhsm/libsofthsm2.so",
            "TokenSerial": "6c1f8f4ad83a",
            "TokenLabel": "signer",
            "Pin": "1234",
            "Attributes": "MaxSessions = 64, Foo=bar"
        }"#;
        let config = TokenConfig::from_json(json, None).unwrap();
        assert_eq!(config.manufacturer(), "SoftHSM");
        assert_eq!(config.model(), "SoftHSM v2");
        assert_eq!(config.path(), "/usr/lib/softhsm/libsofthsm2.so");
        assert_eq!(config.token_serial(), "6c1f8f4ad83a");
        assert_eq!(config.token_label(), "signer");
        assert_eq!(config.pin().unwrap().expose_secret(), "1234");
        assert_eq!(config.attribute("Foo"), Some("bar".to_string()));
        assert_eq!(config.max_sessions().unwrap(), 64);
        assert!(!format!("{:?}", config).contains("1234"));
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let config = TokenConfig::from_json(r#"{"Manufacturer": "inmem"}"#, None).unwrap();
        assert_eq!(config.path(), "");
        assert!(config.pin().is_none());
        assert_eq!(config.max_sessions().unwrap(), DEFAULT_MAX_SESSIONS);
    }

    #[test]
    fn invalid_max_sessions() {
        let config = TokenConfig::new("SoftHSM", "v2").with_attributes("MaxSessions=none");
        assert!(config.max_sessions().is_err());
    }

    #[test]
    fn should_resolve_pin_file_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let pin_name = format!("keycustody-test-{}.pin", std::process::id());
        fs::write(dir.path().join(&pin_name), "  987654\n").unwrap();
        let config_path = dir.path().join("token.json");
        fs::write(
            &config_path,
            format!(r#"{{"Manufacturer": "SoftHSM", "Pin": "file:{}"}}"#, pin_name),
        )
        .unwrap();

        let config = TokenConfig::load(&config_path).unwrap();
        assert_eq!(config.pin().unwrap().expose_secret(), "987654");
    }

    #[test]
    fn should_resolve_absolute_pin_file() {
        let dir = tempfile::tempdir().unwrap();
        let pin_path = dir.path().join("abs.pin");
        fs::write(&pin_path, "4321").unwrap();

        let json = format!(r#"{{"Pin": "file:{}"}}"#, pin_path.display());
        let config = TokenConfig::from_json(&json, None).unwrap();
        assert_eq!(config.pin().unwrap().expose_secret(), "4321");
    }

    #[test]
    fn missing_pin_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let res = TokenConfig::from_json(r#"{"Pin": "file:no-such-keycustody.pin"}"#, Some(dir.path()));
        assert!(matches!(res, Err(ConfigError::Other(_))));
    }

    #[test]
    fn should_create_config_from_token_uri() {
        let config = TokenConfig::from_uri(
            "pkcs11:manufacturer=SoftHSM;model=v2;serial=1234;token=signer?pin-value=5678&module-path=%2Flib%2Fsofthsm2.so",
        )
        .unwrap();
        assert_eq!(config.manufacturer(), "SoftHSM");
        assert_eq!(config.token_serial(), "1234");
        assert_eq!(config.token_label(), "signer");
        assert_eq!(config.path(), "/lib/softhsm2.so");
        assert_eq!(config.pin().unwrap().expose_secret(), "5678");
    }

    #[test]
    fn should_parse_log_config() {
        let config: LogConfig = serde_json::from_str(r#"{"log_level": "debug", "log_type": "file"}"#).unwrap();
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.log_type, LogType::File);
        assert_eq!(config.log_file, PathBuf::from("./keycustody.log"));

        let (level, _) = config.fern_logger().chain(std::io::stderr()).into_log();
        assert_eq!(level, LevelFilter::Debug);

        assert!(serde_json::from_str::<LogConfig>(r#"{"log_type": "journal"}"#).is_err());
    }
}
