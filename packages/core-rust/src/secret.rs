//! Credential resolution for the four declared secret schemes.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::ConfigError;

/// Encoding/storage convention of a configured credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretScheme {
    /// Value is used as-is.
    Plain,
    /// Value is base64 of UTF-8 text.
    Base64Plain,
    /// Value is base64 of binary key material.
    Base64Key,
    /// Value is a path to a key file on disk.
    KeyFile,
}

impl SecretScheme {
    /// Identifier used in the configuration document.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Base64Plain => "base64plain",
            Self::Base64Key => "base64key",
            Self::KeyFile => "keyfile",
        }
    }
}

impl FromStr for SecretScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "base64plain" => Ok(Self::Base64Plain),
            "base64key" => Ok(Self::Base64Key),
            "keyfile" => Ok(Self::KeyFile),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for SecretScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved credential payload.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl SecretValue {
    /// Raw bytes of the credential regardless of representation.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

// Never print key material.
impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "Text(<{} chars>)", text.len()),
            Self::Bytes(bytes) => write!(f, "Bytes(<{} bytes>)", bytes.len()),
        }
    }
}

/// A resolved credential together with the scheme that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub scheme: SecretScheme,
    pub value: SecretValue,
}

impl Secret {
    /// Raw bytes of the credential.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }
}

/// Resolves `value` according to the scheme named by `scheme`.
///
/// The scheme identifier is validated before any decoding takes place, so an
/// unknown identifier never falls back to `plain`.
///
/// # Errors
///
/// - `ConfigError::UnsupportedScheme` for an unknown scheme identifier
/// - `ConfigError::Base64` / `ConfigError::NotUtf8` for undecodable values
/// - `ConfigError::Io` when a key file cannot be read
pub fn resolve_secret(scheme: &str, value: &str) -> Result<Secret, ConfigError> {
    let scheme: SecretScheme = scheme.parse()?;
    resolve_with(scheme, value)
}

/// Resolves `value` with an already-validated scheme.
///
/// # Errors
///
/// See [`resolve_secret`].
pub fn resolve_with(scheme: SecretScheme, value: &str) -> Result<Secret, ConfigError> {
    let value = match scheme {
        SecretScheme::Plain => SecretValue::Text(value.to_string()),
        SecretScheme::Base64Plain => {
            let decoded = STANDARD.decode(value.as_bytes())?;
            SecretValue::Text(String::from_utf8(decoded)?)
        }
        SecretScheme::Base64Key => SecretValue::Bytes(STANDARD.decode(value.as_bytes())?),
        SecretScheme::KeyFile => SecretValue::Bytes(read_key_file(Path::new(value))?),
    };
    Ok(Secret { scheme, value })
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    tracing::debug!(path = %path.display(), "reading key file");
    std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn plain_is_returned_unchanged() {
        let secret = resolve_secret("plain", "hunter2").unwrap();
        assert_eq!(secret.scheme, SecretScheme::Plain);
        assert_eq!(secret.value, SecretValue::Text("hunter2".to_string()));
    }

    #[test]
    fn base64plain_decodes_to_text() {
        // "hunter2"
        let secret = resolve_secret("base64plain", "aHVudGVyMg==").unwrap();
        assert_eq!(secret.value, SecretValue::Text("hunter2".to_string()));
    }

    #[test]
    fn base64key_decodes_to_bytes() {
        let secret = resolve_secret("base64key", "AAH/fw==").unwrap();
        assert_eq!(secret.value, SecretValue::Bytes(vec![0x00, 0x01, 0xff, 0x7f]));
    }

    #[test]
    fn keyfile_reads_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"-----BEGIN KEY-----\nabc\n-----END KEY-----\n")
            .unwrap();

        let secret = resolve_secret("keyfile", file.path().to_str().unwrap()).unwrap();
        assert_eq!(secret.scheme, SecretScheme::KeyFile);
        assert_eq!(
            secret.as_bytes(),
            b"-----BEGIN KEY-----\nabc\n-----END KEY-----\n"
        );
    }

    #[test]
    fn keyfile_missing_path_is_io_error() {
        let err = resolve_secret("keyfile", "/nonexistent/authrpc/key.pem").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn unsupported_scheme_never_falls_back_to_plain() {
        for scheme in ["", "PLAIN", "base64", "env", "file"] {
            let err = resolve_secret(scheme, "value").unwrap_err();
            assert!(
                matches!(&err, ConfigError::UnsupportedScheme(s) if s == scheme),
                "scheme {scheme:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(matches!(
            resolve_secret("base64key", "not base64!").unwrap_err(),
            ConfigError::Base64(_)
        ));
    }

    #[test]
    fn base64plain_requires_utf8() {
        // 0xff 0xfe is not valid UTF-8
        assert!(matches!(
            resolve_secret("base64plain", "//4=").unwrap_err(),
            ConfigError::NotUtf8(_)
        ));
    }

    #[test]
    fn debug_output_hides_material() {
        let secret = resolve_secret("plain", "hunter2").unwrap();
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
