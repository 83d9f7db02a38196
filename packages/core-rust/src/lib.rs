//! `authrpc` core: secret resolution, JWT issuers, configuration assembly and
//! the queue-name table.

pub mod config;
pub mod envelope;
pub mod error;
pub mod jwt;
pub mod queues;
pub mod secret;

pub use config::{
    load_config, parse_config, AmqpConfig, AppConfig, AssembledConfig, DbConfig, LdapConfig,
    LogConfig, LogHandler, LogLevel,
};
pub use envelope::ResponseEnvelope;
pub use error::ConfigError;
pub use jwt::{Issuer, JwtEncoder, JwtError, JwtValidator, SignMethod};
pub use queues::{OperationId, QueueTable};
pub use secret::{resolve_secret, Secret, SecretScheme, SecretValue};
