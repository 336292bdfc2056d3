//! src/event.rs
//! Zdarzenie wejściowe niezależne od platformy. Adapter mapuje na nie payloady z gatewaya.

use serde::{Deserialize, Serialize};

use crate::error::EvaluationError;
use crate::window::Millis;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Message,
    Join,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Command => "command",
            EventKind::Message => "message",
            EventKind::Join => "join",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub kind: EventKind,
    pub identity_id: String,
    pub scope_id: String,
    pub timestamp: Millis,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_created_at: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_avatar: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Id wiadomości na platformie, wraca do `Enforcer::delete_content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Ustawia adapter na podstawie ról (staff / owner).
    #[serde(default)]
    pub is_admin: bool,
}

impl ActivityEvent {
    fn base(kind: EventKind, identity_id: &str, scope_id: &str, timestamp: Millis) -> Self {
        Self {
            kind,
            identity_id: identity_id.to_owned(),
            scope_id: scope_id.to_owned(),
            timestamp,
            command_name: None,
            content: None,
            mention_count: None,
            link_count: None,
            account_created_at: None,
            has_avatar: None,
            display_name: None,
            event_id: None,
            is_admin: false,
        }
    }

    pub fn command(identity_id: &str, scope_id: &str, timestamp: Millis, command: &str) -> Self {
        Self {
            command_name: Some(command.to_owned()),
            ..Self::base(EventKind::Command, identity_id, scope_id, timestamp)
        }
    }

    pub fn message(identity_id: &str, scope_id: &str, timestamp: Millis, content: &str) -> Self {
        Self {
            content: Some(content.to_owned()),
            ..Self::base(EventKind::Message, identity_id, scope_id, timestamp)
        }
    }

    pub fn join(identity_id: &str, scope_id: &str, timestamp: Millis) -> Self {
        Self::base(EventKind::Join, identity_id, scope_id, timestamp)
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_owned());
        self
    }

    pub fn with_account_created_at(mut self, at: Millis) -> Self {
        self.account_created_at = Some(at);
        self
    }

    pub fn with_avatar(mut self, has_avatar: bool) -> Self {
        self.has_avatar = Some(has_avatar);
        self
    }

    pub fn with_mentions(mut self, n: u32) -> Self {
        self.mention_count = Some(n);
        self
    }

    pub fn with_links(mut self, n: u32) -> Self {
        self.link_count = Some(n);
        self
    }

    pub fn with_event_id(mut self, id: &str) -> Self {
        self.event_id = Some(id.to_owned());
        self
    }

    pub fn as_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn expect_kind(&self, expected: EventKind) -> Result<(), EvaluationError> {
        if self.kind != expected {
            return Err(EvaluationError::WrongKind {
                expected: expected.as_str(),
                actual: self.kind.as_str(),
            });
        }
        Ok(())
    }

    pub fn require_command(&self) -> Result<&str, EvaluationError> {
        self.command_name
            .as_deref()
            .ok_or(EvaluationError::MissingField {
                kind: "command",
                field: "commandName",
            })
    }

    pub fn require_content(&self) -> Result<&str, EvaluationError> {
        self.content.as_deref().ok_or(EvaluationError::MissingField {
            kind: "message",
            field: "content",
        })
    }

    pub fn content_ref(&self) -> ContentRef {
        ContentRef {
            scope_id: self.scope_id.clone(),
            identity_id: self.identity_id.clone(),
            event_id: self.event_id.clone(),
        }
    }
}

/// To, czego `Enforcer::delete_content` potrzebuje, żeby znaleźć wiadomość.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub scope_id: String,
    pub identity_id: String,
    pub event_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_json() {
        let raw = r#"{"kind":"join","identityId":"u1","scopeId":"g1","timestamp":1000,
                      "accountCreatedAt":500,"hasAvatar":false,"displayName":"raider01"}"#;
        let ev: ActivityEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.kind, EventKind::Join);
        assert_eq!(ev.account_created_at, Some(500));
        assert_eq!(ev.has_avatar, Some(false));
        assert!(!ev.is_admin);
    }

    #[test]
    fn missing_fields_are_reported() {
        let mut ev = ActivityEvent::message("u", "g", 0, "hi");
        ev.content = None;
        assert_eq!(
            ev.require_content(),
            Err(EvaluationError::MissingField { kind: "message", field: "content" })
        );
        assert!(ev.expect_kind(EventKind::Join).is_err());
    }
}
