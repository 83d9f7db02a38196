//! In-process auth backend.
//!
//! Users, groups and sessions live in `DashMap`s. Passwords are stored as
//! salted SHA-256 digests and compared in constant time. Access tokens are
//! JWTs signed with the configured encoder and verified with the configured
//! validator; refresh tokens are opaque random hex.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use authrpc_core::{AppConfig, DbConfig, JwtEncoder, JwtValidator, ResponseEnvelope};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::{
    AdminCreateUserRequest, ChangeUserRequest, GroupMembershipRequest, GroupRequest, GroupWorkflow,
    LoginRequest, RegisterUserRequest, SessionRequest, SessionWorkflow, TokenRequest,
    UserRequest, UserWorkflow, WorkflowContext, WorkflowError, WorkflowFactory, WorkflowResult,
    WorkflowSet,
};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct UserRecord {
    email: Option<String>,
    salt: [u8; 16],
    password_hash: Vec<u8>,
    groups: BTreeSet<String>,
}

impl UserRecord {
    fn new(password: &str, email: Option<String>) -> Self {
        let salt: [u8; 16] = rand::random();
        Self {
            email,
            salt,
            password_hash: hash_password(&salt, password),
            groups: BTreeSet::new(),
        }
    }

    fn set_password(&mut self, password: &str) {
        self.salt = rand::random();
        self.password_hash = hash_password(&self.salt, password);
    }

    fn password_matches(&self, password: &str) -> bool {
        hash_password(&self.salt, password)
            .ct_eq(&self.password_hash)
            .into()
    }

    fn view(&self, username: &str) -> serde_json::Value {
        json!({
            "username": username,
            "email": self.email,
            "groups": self.groups,
        })
    }
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
    expires_at: u64,
}

/// Claims carried by access tokens. `iss` is stamped by the encoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    groups: Vec<String>,
    iat: u64,
    exp: u64,
}

fn hash_password(salt: &[u8], password: &str) -> Vec<u8> {
    Sha256::new()
        .chain_update(salt)
        .chain_update(password.as_bytes())
        .finalize()
        .to_vec()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn forbidden() -> ResponseEnvelope {
    ResponseEnvelope::message(403, "permission denied")
}

fn user_not_found(username: &str) -> ResponseEnvelope {
    ResponseEnvelope::message(404, format!("user `{username}` not found"))
}

fn group_not_found(group: &str) -> ResponseEnvelope {
    ResponseEnvelope::message(404, format!("group `{group}` not found"))
}

// ---------------------------------------------------------------------------
// MemoryAuth
// ---------------------------------------------------------------------------

/// A verified access token holder.
struct Caller {
    username: String,
    is_admin: bool,
}

impl Caller {
    fn may_manage(&self, username: &str) -> bool {
        self.is_admin || self.username == username
    }
}

/// Shared state behind all three in-memory workflows.
pub struct MemoryAuth {
    users: DashMap<String, UserRecord>,
    groups: DashMap<String, ()>,
    sessions: DashMap<String, Session>,
    encoder: JwtEncoder,
    validator: JwtValidator,
    app: AppConfig,
}

impl MemoryAuth {
    /// Creates an empty store, seeding the admin group and, when configured,
    /// the bootstrap admin account.
    #[must_use]
    pub fn new(encoder: JwtEncoder, validator: JwtValidator, app: AppConfig) -> Self {
        let auth = Self {
            users: DashMap::new(),
            groups: DashMap::new(),
            sessions: DashMap::new(),
            encoder,
            validator,
            app,
        };
        auth.groups.insert(auth.app.admin_group.clone(), ());

        if let (Some(username), Some(password)) = (&auth.app.admin_user, &auth.app.admin_password) {
            let mut record = UserRecord::new(password, None);
            record.groups.insert(auth.app.admin_group.clone());
            auth.users.insert(username.clone(), record);
            info!(username = %username, "bootstrap admin account created");
        }
        auth
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn issue_access_token(&self, username: &str) -> Result<String, WorkflowError> {
        let groups = self
            .users
            .get(username)
            .map(|record| record.groups.iter().cloned().collect())
            .unwrap_or_default();
        let iat = now_secs();
        let claims = AccessClaims {
            sub: username.to_owned(),
            groups,
            iat,
            exp: iat.saturating_add(self.app.access_token_ttl_secs),
        };
        self.encoder
            .encode(&claims)
            .context("failed to sign access token")
            .map_err(WorkflowError::Internal)
    }

    /// Verifies an access token, or yields the 401 envelope to answer with.
    fn caller(&self, token: &str) -> Result<Caller, ResponseEnvelope> {
        match self.validator.validate::<AccessClaims>(token) {
            Ok(claims) => Ok(Caller {
                is_admin: claims.groups.iter().any(|g| *g == self.app.admin_group),
                username: claims.sub,
            }),
            Err(err) => {
                debug!(error = %err, "rejected access token");
                Err(ResponseEnvelope::message(401, "invalid token"))
            }
        }
    }

    fn insert_user(
        &self,
        username: String,
        password: &str,
        email: Option<String>,
        groups: Vec<String>,
    ) -> ResponseEnvelope {
        if username.is_empty() || password.is_empty() {
            return ResponseEnvelope::message(400, "username and password are required");
        }
        if let Some(missing) = groups.iter().find(|g| !self.groups.contains_key(*g)) {
            return group_not_found(missing);
        }

        match self.users.entry(username) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                ResponseEnvelope::message(409, format!("user `{}` already exists", entry.key()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let mut record = UserRecord::new(password, email);
                record.groups.extend(groups);
                let body = record.view(entry.key());
                info!(username = %entry.key(), "user created");
                entry.insert(record);
                ResponseEnvelope::new(201, body)
            }
        }
    }

    fn revoke_sessions_of(&self, username: &str) {
        self.sessions.retain(|_, session| session.username != username);
    }
}

impl std::fmt::Debug for MemoryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAuth")
            .field("users", &self.users.len())
            .field("groups", &self.groups.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// SessionWorkflow
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionWorkflow for MemoryAuth {
    async fn login(&self, request: LoginRequest) -> WorkflowResult {
        let valid = self
            .users
            .get(&request.username)
            .is_some_and(|record| record.password_matches(&request.password));
        if !valid {
            return Err(WorkflowError::BadCredentials);
        }

        let access_token = self.issue_access_token(&request.username)?;
        let refresh_token = hex::encode(rand::random::<[u8; 32]>());
        self.sessions.insert(
            refresh_token.clone(),
            Session {
                username: request.username.clone(),
                expires_at: now_secs().saturating_add(self.app.refresh_token_ttl_secs),
            },
        );
        info!(username = %request.username, "login succeeded");

        Ok(ResponseEnvelope::ok(json!({
            "access_token": access_token,
            "refresh_token": refresh_token,
            "expires_in": self.app.access_token_ttl_secs,
        })))
    }

    async fn logout(&self, request: SessionRequest) -> WorkflowResult {
        match self.sessions.remove(&request.refresh_token) {
            Some((_, session)) => {
                info!(username = %session.username, "logged out");
                Ok(ResponseEnvelope::message(200, "logged out"))
            }
            None => Ok(ResponseEnvelope::message(404, "session not found")),
        }
    }

    async fn get_access_token(&self, request: SessionRequest) -> WorkflowResult {
        let session = self
            .sessions
            .get(&request.refresh_token)
            .map(|entry| entry.value().clone());
        let username = match session {
            Some(session) if session.expires_at > now_secs() => session.username,
            Some(_) => {
                self.sessions.remove(&request.refresh_token);
                return Err(WorkflowError::InvalidToken("refresh token expired".into()));
            }
            None => return Err(WorkflowError::InvalidToken("unknown refresh token".into())),
        };
        if !self.users.contains_key(&username) {
            self.sessions.remove(&request.refresh_token);
            return Err(WorkflowError::PermissionDenied(format!(
                "user `{username}` no longer exists"
            )));
        }

        let access_token = self.issue_access_token(&username)?;
        Ok(ResponseEnvelope::ok(json!({
            "access_token": access_token,
            "expires_in": self.app.access_token_ttl_secs,
        })))
    }
}

// ---------------------------------------------------------------------------
// UserWorkflow
// ---------------------------------------------------------------------------

#[async_trait]
impl UserWorkflow for MemoryAuth {
    async fn register_user(&self, request: RegisterUserRequest) -> WorkflowResult {
        if !self.app.registration_open {
            return Ok(ResponseEnvelope::message(403, "registration is closed"));
        }
        Ok(self.insert_user(request.username, &request.password, request.email, Vec::new()))
    }

    async fn admin_create_user(&self, request: AdminCreateUserRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.is_admin {
            return Ok(forbidden());
        }
        Ok(self.insert_user(
            request.username,
            &request.password,
            request.email,
            request.groups,
        ))
    }

    async fn delete_user(&self, request: UserRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.may_manage(&request.username) {
            return Ok(forbidden());
        }
        if self.users.remove(&request.username).is_none() {
            return Ok(user_not_found(&request.username));
        }
        self.revoke_sessions_of(&request.username);
        info!(username = %request.username, by = %caller.username, "user deleted");
        Ok(ResponseEnvelope::message(200, "user deleted"))
    }

    async fn change_user(&self, request: ChangeUserRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.may_manage(&request.username) {
            return Ok(forbidden());
        }
        if request.password.as_deref() == Some("") {
            return Ok(ResponseEnvelope::message(400, "password must not be empty"));
        }

        let Some(mut record) = self.users.get_mut(&request.username) else {
            return Ok(user_not_found(&request.username));
        };
        if let Some(password) = &request.password {
            record.set_password(password);
        }
        if request.email.is_some() {
            record.email = request.email;
        }
        let body = record.view(&request.username);
        drop(record);

        if request.password.is_some() {
            self.revoke_sessions_of(&request.username);
        }
        Ok(ResponseEnvelope::ok(body))
    }

    async fn get_all(&self, request: TokenRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.is_admin {
            return Ok(forbidden());
        }
        let mut users: Vec<(String, serde_json::Value)> = self
            .users
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().view(entry.key())))
            .collect();
        users.sort_by(|a, b| a.0.cmp(&b.0));
        let users: Vec<serde_json::Value> = users.into_iter().map(|(_, view)| view).collect();
        Ok(ResponseEnvelope::ok(json!({ "users": users })))
    }

    async fn get_user(&self, request: UserRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.may_manage(&request.username) {
            return Ok(forbidden());
        }
        Ok(match self.users.get(&request.username) {
            Some(record) => ResponseEnvelope::ok(record.view(&request.username)),
            None => user_not_found(&request.username),
        })
    }
}

// ---------------------------------------------------------------------------
// GroupWorkflow
// ---------------------------------------------------------------------------

#[async_trait]
impl GroupWorkflow for MemoryAuth {
    async fn add_user_to_group(&self, request: GroupMembershipRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.is_admin {
            return Ok(forbidden());
        }
        if !self.groups.contains_key(&request.group) {
            return Ok(group_not_found(&request.group));
        }
        let Some(mut record) = self.users.get_mut(&request.username) else {
            return Ok(user_not_found(&request.username));
        };
        record.groups.insert(request.group.clone());
        Ok(ResponseEnvelope::ok(record.view(&request.username)))
    }

    async fn remove_user_from_group(&self, request: GroupMembershipRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.is_admin {
            return Ok(forbidden());
        }
        let Some(mut record) = self.users.get_mut(&request.username) else {
            return Ok(user_not_found(&request.username));
        };
        if !record.groups.remove(&request.group) {
            return Ok(ResponseEnvelope::message(
                404,
                format!("user `{}` is not in group `{}`", request.username, request.group),
            ));
        }
        Ok(ResponseEnvelope::ok(record.view(&request.username)))
    }

    async fn create_group(&self, request: GroupRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.is_admin {
            return Ok(forbidden());
        }
        if request.group.is_empty() {
            return Ok(ResponseEnvelope::message(400, "group name is required"));
        }
        if self.groups.insert(request.group.clone(), ()).is_some() {
            return Ok(ResponseEnvelope::message(
                409,
                format!("group `{}` already exists", request.group),
            ));
        }
        info!(group = %request.group, "group created");
        Ok(ResponseEnvelope::new(201, json!({ "group": request.group })))
    }

    async fn delete_group(&self, request: GroupRequest) -> WorkflowResult {
        let caller = match self.caller(&request.token) {
            Ok(caller) => caller,
            Err(refusal) => return Ok(refusal),
        };
        if !caller.is_admin {
            return Ok(forbidden());
        }
        if request.group == self.app.admin_group {
            return Ok(ResponseEnvelope::message(409, "the admin group cannot be deleted"));
        }
        if self.groups.remove(&request.group).is_none() {
            return Ok(group_not_found(&request.group));
        }
        for mut record in self.users.iter_mut() {
            record.groups.remove(&request.group);
        }
        info!(group = %request.group, "group deleted");
        Ok(ResponseEnvelope::message(200, "group deleted"))
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds [`MemoryAuth`]-backed workflows. Requires both a validator and an
/// encoder in the configuration.
#[derive(Debug, Default)]
pub struct MemoryWorkflowFactory;

impl MemoryWorkflowFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkflowFactory for MemoryWorkflowFactory {
    async fn init_persistence(&self, db: Option<&DbConfig>) -> anyhow::Result<()> {
        match db {
            Some(db) => warn!(
                dialect = %db.dialect,
                host = %db.host,
                database = %db.database,
                "in-memory backend ignores db_settings"
            ),
            None => debug!("in-memory persistence ready"),
        }
        Ok(())
    }

    fn build(&self, context: WorkflowContext) -> anyhow::Result<WorkflowSet> {
        let encoder = context
            .encoder
            .ok_or_else(|| anyhow!("jwt_creation is required to issue access tokens"))?;
        let validator = context
            .validator
            .filter(|validator| !validator.is_empty())
            .ok_or_else(|| anyhow!("jwt_validation must trust at least one issuer"))?;
        if validator.issuer(encoder.issuer()).is_none() {
            warn!(
                issuer = %encoder.issuer(),
                "issued access tokens will not validate: issuer is not trusted"
            );
        }
        if let Some(directory) = &context.directory {
            warn!(url = %directory.url, "in-memory backend ignores ldap_settings");
        }

        let auth = Arc::new(MemoryAuth::new(encoder, validator, context.app));
        Ok(WorkflowSet {
            session: Arc::clone(&auth) as Arc<dyn SessionWorkflow>,
            users: Arc::clone(&auth) as Arc<dyn UserWorkflow>,
            groups: auth as Arc<dyn GroupWorkflow>,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
