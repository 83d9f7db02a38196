//! Raw shape of the configuration document, before interpretation.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{AmqpConfig, AppConfig, DbConfig, LdapConfig};

/// Top-level document. Every section is optional and unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub jwt_validation: Option<Vec<IssuerSection>>,
    #[serde(default)]
    pub jwt_creation: Option<JwtCreationSection>,
    #[serde(default)]
    pub ldap_settings: Option<LdapConfig>,
    #[serde(default)]
    pub db_settings: Option<DbConfig>,
    #[serde(default)]
    pub amqp_settings: Option<AmqpConfig>,
    #[serde(default)]
    pub app_config: Option<AppConfig>,
    #[serde(default)]
    pub queue_settings: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub log_settings: Option<LogSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretSection {
    #[serde(rename = "type")]
    pub scheme: String,
    pub value: String,
    /// Passphrase for encrypted key files.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssuerSection {
    pub name: String,
    pub methods: Vec<String>,
    pub secret: SecretSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtCreationSection {
    pub issuer: String,
    pub signmethod: String,
    pub secret: SecretSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    pub level: String,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub handler_config: Map<String, Value>,
}
