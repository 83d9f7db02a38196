//! Logical operation ids and the queue-name table they resolve through.

use std::collections::BTreeMap;
use std::fmt;

/// One business operation exposed over the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationId {
    SessionLogin,
    SessionLogout,
    SessionGetAccessToken,
    UserRegisterUser,
    UserAdminCreateUser,
    UserDeleteUser,
    UserChangeUser,
    UserGetAll,
    UserGetUser,
    GroupAddUserToGroup,
    GroupRemoveUserFromGroup,
    GroupCreateGroup,
    GroupDeleteGroup,
}

impl OperationId {
    pub const ALL: [Self; 13] = [
        Self::SessionLogin,
        Self::SessionLogout,
        Self::SessionGetAccessToken,
        Self::UserRegisterUser,
        Self::UserAdminCreateUser,
        Self::UserDeleteUser,
        Self::UserChangeUser,
        Self::UserGetAll,
        Self::UserGetUser,
        Self::GroupAddUserToGroup,
        Self::GroupRemoveUserFromGroup,
        Self::GroupCreateGroup,
        Self::GroupDeleteGroup,
    ];

    /// Key used in `queue_settings`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionLogin => "session_workflow_login",
            Self::SessionLogout => "session_workflow_logout",
            Self::SessionGetAccessToken => "session_workflow_get_access_token",
            Self::UserRegisterUser => "user_workflow_register_user",
            Self::UserAdminCreateUser => "user_workflow_admin_create_user",
            Self::UserDeleteUser => "user_workflow_delete_user",
            Self::UserChangeUser => "user_workflow_change_user",
            Self::UserGetAll => "user_workflow_get_all",
            Self::UserGetUser => "user_workflow_get_user",
            Self::GroupAddUserToGroup => "group_workflow_add_user_to_group",
            Self::GroupRemoveUserFromGroup => "group_workflow_remove_user_from_group",
            Self::GroupCreateGroup => "group_workflow_create_group",
            Self::GroupDeleteGroup => "group_workflow_delete_group",
        }
    }

    /// Built-in queue name.
    #[must_use]
    pub fn default_queue(self) -> &'static str {
        match self {
            Self::SessionLogin => "login",
            Self::SessionLogout => "logout",
            Self::SessionGetAccessToken => "token",
            Self::UserRegisterUser => "user_register",
            Self::UserAdminCreateUser => "user_admin_create",
            Self::UserDeleteUser => "user_delete",
            Self::UserChangeUser => "user_change",
            Self::UserGetAll => "user_get_all",
            Self::UserGetUser => "user_get",
            Self::GroupAddUserToGroup => "group_add_user",
            Self::GroupRemoveUserFromGroup => "group_remove_user",
            Self::GroupCreateGroup => "group_create",
            Self::GroupDeleteGroup => "group_delete",
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation id -> queue name, seeded with the built-in defaults.
///
/// Overrides are merged permissively: ids outside [`OperationId::ALL`] are
/// stored as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTable {
    entries: BTreeMap<String, String>,
}

impl QueueTable {
    /// Table holding only the 13 defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        let entries = OperationId::ALL
            .iter()
            .map(|op| (op.as_str().to_string(), op.default_queue().to_string()))
            .collect();
        Self { entries }
    }

    /// Overwrites every entry present in `overrides`.
    pub fn merge<I, K, V>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (id, queue) in overrides {
            self.entries.insert(id.into(), queue.into());
        }
    }

    /// Queue name bound to a known operation.
    #[must_use]
    pub fn queue_for(&self, op: OperationId) -> &str {
        self.entries
            .get(op.as_str())
            .map_or(op.default_queue(), String::as_str)
    }

    /// Raw lookup, including ids outside the known set.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for QueueTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
