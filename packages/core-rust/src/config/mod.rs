//! Configuration assembly.
//!
//! Turns one JSON document into typed configuration objects:
//!
//! 1. **Parsing** (`document`): JSON -> `ConfigDocument` (shape only)
//! 2. **Interpretation** (`assemble`): secrets, signature methods, log levels
//!    and queue overrides are resolved into an [`AssembledConfig`]
//!
//! Assembly is all-or-nothing: the first error aborts it and no partial
//! result is returned.

pub mod document;
pub mod types;

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

pub use document::ConfigDocument;
pub use types::{AmqpConfig, AppConfig, DbConfig, LdapConfig, LogConfig, LogHandler, LogLevel};

use crate::error::ConfigError;
use crate::jwt::{Issuer, JwtEncoder, JwtValidator, SignMethod};
use crate::queues::QueueTable;
use crate::secret::{resolve_secret, Secret};
use document::{IssuerSection, JwtCreationSection, LogSection, SecretSection};

/// Everything the runner needs, resolved from one configuration document.
///
/// Absent sections are `None`; the queue table always holds every default.
#[derive(Debug, Clone, Default)]
pub struct AssembledConfig {
    pub jwt_validator: Option<JwtValidator>,
    pub jwt_encoder: Option<JwtEncoder>,
    pub ldap: Option<LdapConfig>,
    pub db: Option<DbConfig>,
    pub amqp: Option<AmqpConfig>,
    pub app: Option<AppConfig>,
    pub log: Option<LogConfig>,
    pub queues: QueueTable,
}

/// Reads and assembles the configuration file at `path`.
///
/// # Errors
///
/// Returns `ConfigError::Io` if the file cannot be read, otherwise any error
/// from [`parse_config`].
pub fn load_config(path: impl AsRef<Path>) -> Result<AssembledConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text)
}

/// Parses and assembles a configuration document from JSON text.
///
/// # Errors
///
/// Returns `ConfigError::Malformed` for invalid JSON or a bad field inside a
/// present section, or the specific error raised while interpreting it.
pub fn parse_config(text: &str) -> Result<AssembledConfig, ConfigError> {
    let document: ConfigDocument = serde_json::from_str(text)?;
    assemble(document)
}

/// Interprets a parsed document.
///
/// # Errors
///
/// - `UnsupportedScheme` / `Io` / `Base64` / `NotUtf8` from secret resolution
/// - `UnknownSignMethod`, `DuplicateIssuer`, `NoSignMethods` from JWT sections
/// - `UnknownLevel`, `UnknownLogHandler`, `Malformed`, `Invalid` from `log_settings`
pub fn assemble(document: ConfigDocument) -> Result<AssembledConfig, ConfigError> {
    let jwt_validator = document
        .jwt_validation
        .map(build_validator)
        .transpose()?;
    let jwt_encoder = document.jwt_creation.map(build_encoder).transpose()?;
    let log = document.log_settings.map(build_log_config).transpose()?;

    let mut queues = QueueTable::with_defaults();
    if let Some(overrides) = document.queue_settings {
        queues.merge(overrides);
    }

    tracing::debug!(
        validator = jwt_validator.is_some(),
        encoder = jwt_encoder.is_some(),
        ldap = document.ldap_settings.is_some(),
        db = document.db_settings.is_some(),
        amqp = document.amqp_settings.is_some(),
        app = document.app_config.is_some(),
        log = log.is_some(),
        "configuration assembled"
    );

    Ok(AssembledConfig {
        jwt_validator,
        jwt_encoder,
        ldap: document.ldap_settings,
        db: document.db_settings,
        amqp: document.amqp_settings,
        app: document.app_config,
        log,
        queues,
    })
}

// ---------------------------------------------------------------------------
// JWT sections
// ---------------------------------------------------------------------------

fn resolve_section_secret(section: &SecretSection) -> Result<Secret, ConfigError> {
    if section.secret.is_some() {
        return Err(ConfigError::EncryptedKey);
    }
    resolve_secret(&section.scheme, &section.value)
}

fn build_validator(sections: Vec<IssuerSection>) -> Result<JwtValidator, ConfigError> {
    let mut validator = JwtValidator::new();
    for section in sections {
        let methods = section
            .methods
            .iter()
            .map(|name| name.parse::<SignMethod>())
            .collect::<Result<Vec<_>, _>>()?;
        let secret = resolve_section_secret(&section.secret)?;
        validator.add_issuer(Issuer::new(section.name, secret, methods)?)?;
    }
    Ok(validator)
}

fn build_encoder(section: JwtCreationSection) -> Result<JwtEncoder, ConfigError> {
    let secret = resolve_section_secret(&section.secret)?;
    let method: SignMethod = section.signmethod.parse()?;
    Ok(JwtEncoder::new(section.issuer, method, secret))
}

// ---------------------------------------------------------------------------
// log_settings
// ---------------------------------------------------------------------------

fn parse_level(name: &str) -> Result<LogLevel, ConfigError> {
    match name.to_ascii_uppercase().as_str() {
        "CRITICAL" | "FATAL" => Ok(LogLevel::Critical),
        "ERROR" => Ok(LogLevel::Error),
        "WARNING" | "WARN" => Ok(LogLevel::Warning),
        "INFO" => Ok(LogLevel::Info),
        "DEBUG" => Ok(LogLevel::Debug),
        "NOTSET" => Ok(LogLevel::NotSet),
        _ => Err(ConfigError::UnknownLevel(name.to_string())),
    }
}

fn build_log_config(section: LogSection) -> Result<LogConfig, ConfigError> {
    let level = parse_level(&section.level)?;
    let handler = match section.handler.as_deref() {
        None | Some("console") => LogHandler::Console,
        Some("stderr") => LogHandler::Stderr,
        Some("json") => LogHandler::Json,
        Some("file") => LogHandler::File {
            path: PathBuf::from(required_str(&section.handler_config, "path")?),
        },
        Some("amqp") => build_amqp_handler(&section.handler_config)?,
        Some(other) => return Err(ConfigError::UnknownLogHandler(other.to_string())),
    };
    Ok(LogConfig { level, handler })
}

fn build_amqp_handler(settings: &Map<String, Value>) -> Result<LogHandler, ConfigError> {
    let broker = settings.get("amqp_settings").cloned().ok_or_else(|| {
        ConfigError::Invalid("amqp log handler requires handler_config.amqp_settings".to_string())
    })?;
    let config: AmqpConfig = serde_json::from_value(broker)?;
    let queue = match settings.get("queue") {
        None => "logs".to_string(),
        Some(_) => required_str(settings, "queue")?.to_string(),
    };
    Ok(LogHandler::Amqp { config, queue })
}

fn required_str<'a>(settings: &'a Map<String, Value>, key: &str) -> Result<&'a str, ConfigError> {
    settings
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::Invalid(format!("handler_config.{key} must be a string")))
}
