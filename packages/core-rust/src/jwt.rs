//! JWT trust and signing identities.
//!
//! [`JwtValidator`] holds any number of trusted [`Issuer`]s and verifies a
//! token against the issuer it claims. [`JwtEncoder`] is the single identity
//! this service signs with. Signing and verification are delegated to
//! `jsonwebtoken`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::secret::Secret;

// ---------------------------------------------------------------------------
// SignMethod
// ---------------------------------------------------------------------------

/// Closed set of signature methods accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignMethod {
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
    ES256,
    ES384,
    EdDSA,
}

impl SignMethod {
    #[must_use]
    pub fn algorithm(self) -> Algorithm {
        match self {
            Self::HS256 => Algorithm::HS256,
            Self::HS384 => Algorithm::HS384,
            Self::HS512 => Algorithm::HS512,
            Self::RS256 => Algorithm::RS256,
            Self::RS384 => Algorithm::RS384,
            Self::RS512 => Algorithm::RS512,
            Self::PS256 => Algorithm::PS256,
            Self::PS384 => Algorithm::PS384,
            Self::PS512 => Algorithm::PS512,
            Self::ES256 => Algorithm::ES256,
            Self::ES384 => Algorithm::ES384,
            Self::EdDSA => Algorithm::EdDSA,
        }
    }

    #[must_use]
    pub fn from_algorithm(alg: Algorithm) -> Self {
        match alg {
            Algorithm::HS256 => Self::HS256,
            Algorithm::HS384 => Self::HS384,
            Algorithm::HS512 => Self::HS512,
            Algorithm::RS256 => Self::RS256,
            Algorithm::RS384 => Self::RS384,
            Algorithm::RS512 => Self::RS512,
            Algorithm::PS256 => Self::PS256,
            Algorithm::PS384 => Self::PS384,
            Algorithm::PS512 => Self::PS512,
            Algorithm::ES256 => Self::ES256,
            Algorithm::ES384 => Self::ES384,
            Algorithm::EdDSA => Self::EdDSA,
        }
    }

    fn family(self) -> KeyFamily {
        match self {
            Self::HS256 | Self::HS384 | Self::HS512 => KeyFamily::Hmac,
            Self::RS256 | Self::RS384 | Self::RS512 | Self::PS256 | Self::PS384 | Self::PS512 => {
                KeyFamily::Rsa
            }
            Self::ES256 | Self::ES384 => KeyFamily::Ec,
            Self::EdDSA => KeyFamily::Ed,
        }
    }
}

impl FromStr for SignMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "HS256" => Self::HS256,
            "HS384" => Self::HS384,
            "HS512" => Self::HS512,
            "RS256" => Self::RS256,
            "RS384" => Self::RS384,
            "RS512" => Self::RS512,
            "PS256" => Self::PS256,
            "PS384" => Self::PS384,
            "PS512" => Self::PS512,
            "ES256" => Self::ES256,
            "ES384" => Self::ES384,
            "EdDSA" => Self::EdDSA,
            other => return Err(ConfigError::UnknownSignMethod(other.to_string())),
        })
    }
}

impl fmt::Display for SignMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
    Ed,
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes.starts_with(b"-----BEGIN")
}

fn encoding_key(method: SignMethod, secret: &Secret) -> Result<EncodingKey, JwtError> {
    let bytes = secret.as_bytes();
    let key = match (method.family(), is_pem(bytes)) {
        (KeyFamily::Hmac, _) => EncodingKey::from_secret(bytes),
        (KeyFamily::Rsa, true) => EncodingKey::from_rsa_pem(bytes)?,
        (KeyFamily::Rsa, false) => EncodingKey::from_rsa_der(bytes),
        (KeyFamily::Ec, true) => EncodingKey::from_ec_pem(bytes)?,
        (KeyFamily::Ec, false) => EncodingKey::from_ec_der(bytes),
        (KeyFamily::Ed, true) => EncodingKey::from_ed_pem(bytes)?,
        (KeyFamily::Ed, false) => EncodingKey::from_ed_der(bytes),
    };
    Ok(key)
}

fn decoding_key(method: SignMethod, secret: &Secret) -> Result<DecodingKey, JwtError> {
    let bytes = secret.as_bytes();
    let key = match (method.family(), is_pem(bytes)) {
        (KeyFamily::Hmac, _) => DecodingKey::from_secret(bytes),
        (KeyFamily::Rsa, true) => DecodingKey::from_rsa_pem(bytes)?,
        (KeyFamily::Rsa, false) => DecodingKey::from_rsa_der(bytes),
        (KeyFamily::Ec, true) => DecodingKey::from_ec_pem(bytes)?,
        (KeyFamily::Ec, false) => DecodingKey::from_ec_der(bytes),
        (KeyFamily::Ed, true) => DecodingKey::from_ed_pem(bytes)?,
        (KeyFamily::Ed, false) => DecodingKey::from_ed_der(bytes),
    };
    Ok(key)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while issuing or verifying tokens.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("token is not a well-formed JWT")]
    Malformed,
    #[error("token carries no issuer claim")]
    MissingIssuer,
    #[error("issuer `{0}` is not trusted")]
    UnknownIssuer(String),
    #[error("issuer `{issuer}` does not accept {method}")]
    MethodNotAccepted { issuer: String, method: SignMethod },
    #[error("claims must serialize to a JSON object")]
    ClaimsNotObject,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Issuer / JwtValidator
// ---------------------------------------------------------------------------

/// A trusted signing identity.
#[derive(Debug, Clone)]
pub struct Issuer {
    name: String,
    secret: Secret,
    methods: Vec<SignMethod>,
}

impl Issuer {
    /// Creates an issuer.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoSignMethods` when `methods` is empty.
    pub fn new(
        name: impl Into<String>,
        secret: Secret,
        methods: Vec<SignMethod>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if methods.is_empty() {
            return Err(ConfigError::NoSignMethods(name));
        }
        Ok(Self {
            name,
            secret,
            methods,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn methods(&self) -> &[SignMethod] {
        &self.methods
    }

    #[must_use]
    pub fn accepts(&self, method: SignMethod) -> bool {
        self.methods.contains(&method)
    }
}

#[derive(Deserialize)]
struct IssuerClaim {
    iss: Option<String>,
}

/// Collection of trusted issuers, consulted per token.
///
/// Built once at startup by repeated [`JwtValidator::add_issuer`] calls and
/// shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct JwtValidator {
    issuers: HashMap<String, Issuer>,
}

impl JwtValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a trusted issuer.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateIssuer` if an issuer with the same name
    /// is already registered.
    pub fn add_issuer(&mut self, issuer: Issuer) -> Result<(), ConfigError> {
        if self.issuers.contains_key(issuer.name()) {
            return Err(ConfigError::DuplicateIssuer(issuer.name));
        }
        self.issuers.insert(issuer.name.clone(), issuer);
        Ok(())
    }

    #[must_use]
    pub fn issuer(&self, name: &str) -> Option<&Issuer> {
        self.issuers.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    /// Verifies `token` and returns its claims.
    ///
    /// The issuer is looked up by the token's own `iss` claim, then the
    /// header algorithm is checked against that issuer's accepted methods
    /// before the signature and expiry are verified.
    ///
    /// # Errors
    ///
    /// Returns a `JwtError` describing why the token was rejected.
    pub fn validate<C: DeserializeOwned>(&self, token: &str) -> Result<C, JwtError> {
        let header = jsonwebtoken::decode_header(token)?;
        let issuer_name = asserted_issuer(token)?;
        let issuer = self
            .issuers
            .get(&issuer_name)
            .ok_or_else(|| JwtError::UnknownIssuer(issuer_name.clone()))?;

        let method = SignMethod::from_algorithm(header.alg);
        if !issuer.accepts(method) {
            return Err(JwtError::MethodNotAccepted {
                issuer: issuer_name,
                method,
            });
        }

        let key = decoding_key(method, &issuer.secret)?;
        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[issuer.name()]);
        let data = jsonwebtoken::decode::<C>(token, &key, &validation)?;
        Ok(data.claims)
    }
}

/// Reads the unverified `iss` claim used to pick the issuer.
fn asserted_issuer(token: &str) -> Result<String, JwtError> {
    let payload = token.split('.').nth(1).ok_or(JwtError::Malformed)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| JwtError::Malformed)?;
    let claim: IssuerClaim = serde_json::from_slice(&bytes)?;
    claim.iss.ok_or(JwtError::MissingIssuer)
}

// ---------------------------------------------------------------------------
// JwtEncoder
// ---------------------------------------------------------------------------

/// The identity this service signs tokens with.
#[derive(Debug, Clone)]
pub struct JwtEncoder {
    issuer: String,
    method: SignMethod,
    secret: Secret,
}

impl JwtEncoder {
    #[must_use]
    pub fn new(issuer: impl Into<String>, method: SignMethod, secret: Secret) -> Self {
        Self {
            issuer: issuer.into(),
            method,
            secret,
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn method(&self) -> SignMethod {
        self.method
    }

    /// Signs `claims`, stamping this encoder's issuer into `iss`.
    ///
    /// # Errors
    ///
    /// Returns `JwtError::ClaimsNotObject` if the claims do not serialize to
    /// a JSON object, or a signing error from `jsonwebtoken`.
    pub fn encode<C: Serialize>(&self, claims: &C) -> Result<String, JwtError> {
        let mut value = serde_json::to_value(claims)?;
        let object = value.as_object_mut().ok_or(JwtError::ClaimsNotObject)?;
        object.insert(
            "iss".to_string(),
            serde_json::Value::String(self.issuer.clone()),
        );

        let key = encoding_key(self.method, &self.secret)?;
        let token = jsonwebtoken::encode(&Header::new(self.method.algorithm()), &value, &key)?;
        Ok(token)
    }
}
