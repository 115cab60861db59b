use std::time::Duration;

pub mod command;
pub mod signature;

pub use command::Command;

/// User id under which a group's default instruction is stored. Platform
/// user ids always start with `U`, so it cannot clash with a real member.
pub const GROUP_DEFAULT_USER: &str = "default";

/// Fixed texts sent back to chat users.
pub mod replies {
    pub const INSTRUCTION_UPDATED: &str = "instruction updated";
    pub const DEFAULT_INSTRUCTION_UPDATED: &str = "default instruction updated";
    pub const NO_INSTRUCTION: &str = "no instruction set";
    pub const FETCH_FAILED: &str = "Something went wrong when fetching your instruction";
    pub const UPDATE_FAILED: &str = "Something went wrong when updating your instruction";
    pub const GENERATION_FAILED: &str = "Something went wrong when generating response";
    pub const GENERATION_TIMEOUT: &str = "Timeout when generating response";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    User,
    Group,
}

/// Identity an instruction is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    User { user_id: String },
    GroupUser { group_id: String, user_id: String },
}

impl ScopeKey {
    pub fn group_default(group_id: &str) -> Self {
        ScopeKey::GroupUser {
            group_id: group_id.to_string(),
            user_id: GROUP_DEFAULT_USER.to_string(),
        }
    }
}

/// Conversation an event arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    User { user_id: String },
    Group { group_id: String, user_id: String },
}

impl Scope {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::User { .. } => ScopeKind::User,
            Scope::Group { .. } => ScopeKind::Group,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Scope::User { user_id } | Scope::Group { user_id, .. } => user_id,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        match self {
            Scope::User { .. } => None,
            Scope::Group { group_id, .. } => Some(group_id),
        }
    }

    /// Key for the caller's own instruction.
    pub fn personal_key(&self) -> ScopeKey {
        match self {
            Scope::User { user_id } => ScopeKey::User {
                user_id: user_id.clone(),
            },
            Scope::Group { group_id, user_id } => ScopeKey::GroupUser {
                group_id: group_id.clone(),
                user_id: user_id.clone(),
            },
        }
    }

    /// Key consulted when the personal instruction is empty.
    pub fn fallback_key(&self) -> Option<ScopeKey> {
        self.group_id().map(ScopeKey::group_default)
    }
}

/// Group messages are only processed when they start with `marker`; the
/// marker itself is not part of the message.
pub fn strip_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    if marker.is_empty() {
        return None;
    }
    text.strip_prefix(marker)
}

/// Time left for a step that must finish `margin` before the deadline.
pub fn budget(remaining: Duration, margin: Duration) -> Duration {
    remaining.saturating_sub(margin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_scope_falls_back_to_sentinel_key() {
        let scope = Scope::Group {
            group_id: "C1".to_string(),
            user_id: "U1".to_string(),
        };
        assert_eq!(
            scope.personal_key(),
            ScopeKey::GroupUser {
                group_id: "C1".to_string(),
                user_id: "U1".to_string()
            }
        );
        assert_eq!(
            scope.fallback_key(),
            Some(ScopeKey::GroupUser {
                group_id: "C1".to_string(),
                user_id: GROUP_DEFAULT_USER.to_string()
            })
        );
    }

    #[test]
    fn user_scope_has_no_fallback() {
        let scope = Scope::User {
            user_id: "U1".to_string(),
        };
        assert_eq!(scope.kind(), ScopeKind::User);
        assert_eq!(scope.fallback_key(), None);
    }

    #[test]
    fn marker_is_stripped_once() {
        assert_eq!(strip_marker("//x", "/"), Some("/x"));
        assert_eq!(strip_marker("/set instruction a", "/"), Some("set instruction a"));
        assert_eq!(strip_marker("hello /there", "/"), None);
        assert_eq!(strip_marker("anything", ""), None);
    }

    #[test]
    fn budget_saturates() {
        assert_eq!(
            budget(Duration::from_millis(1500), Duration::from_millis(1000)),
            Duration::from_millis(500)
        );
        assert_eq!(
            budget(Duration::from_millis(200), Duration::from_secs(1)),
            Duration::ZERO
        );
    }
}
