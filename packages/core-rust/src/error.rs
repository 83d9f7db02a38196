//! Configuration error taxonomy.
//!
//! Every variant is fatal at startup. The binary maps all of them to the
//! reserved configuration exit status.

use std::path::PathBuf;

/// Errors raised while resolving secrets or assembling configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("secret scheme `{0}` is not supported")]
    UnsupportedScheme(String),
    #[error("unknown signature method `{0}`")]
    UnknownSignMethod(String),
    #[error("unknown log level `{0}`")]
    UnknownLevel(String),
    #[error("unknown log handler `{0}`")]
    UnknownLogHandler(String),
    #[error("invalid base64 secret: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("base64plain secret is not valid UTF-8: {0}")]
    NotUtf8(#[from] std::string::FromUtf8Error),
    #[error("issuer `{0}` is declared more than once")]
    DuplicateIssuer(String),
    #[error("issuer `{0}` accepts no signature methods")]
    NoSignMethods(String),
    #[error("passphrase-protected key material is not supported")]
    EncryptedKey,
}
