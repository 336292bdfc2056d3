//! src/decision.rs
//! Wynik każdego sprawdzenia. Jeden kształt dla wszystkich detektorów i zamknięty
//! zbiór powodów, żeby adaptery robiły pełny `match` zamiast porównywać stringi.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementAction {
    Warn,
    DeleteMessage,
    Mute,
    Kick,
    TempBan,
    PermaBan,
    Lockdown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    // przepuszczone
    Allowed,
    Whitelisted,
    AdminBypass,
    EvaluationError,

    // bramki orkiestratora
    EmergencyMode,
    Blacklisted,

    // limiter
    GlobalRateLimit,
    UserRateLimit,
    UserHourlyLimit,
    CommandCooldown,
    BurstLimit,
    TempBan,
    PermaBan,

    // spam
    MessageFlood,
    DuplicateMessages,
    MentionSpam,
    LinkSpam,
    SuspiciousLink,
    ExcessiveCaps,
    EmojiSpam,
    MessageTooLong,
    RepeatedCharacters,
    RepeatedWords,
    HiddenUnicode,
    ZalgoText,
    PersonalInfo,
    InviteLink,

    // raid
    Lockdown,
    MassJoin,
    RaidDetected,
    JoinSpike,
    SuspiciousAccount,
}

/// Kubełki liczników per kategoria w [`crate::orchestrator::ShieldStats`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Allowed,
    Bypass,
    AccessList,
    Emergency,
    RateLimit,
    Spam,
    Raid,
    Error,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Allowed => "ALLOWED",
            Reason::Whitelisted => "WHITELISTED",
            Reason::AdminBypass => "ADMIN_BYPASS",
            Reason::EvaluationError => "EVALUATION_ERROR",
            Reason::EmergencyMode => "EMERGENCY_MODE",
            Reason::Blacklisted => "BLACKLISTED",
            Reason::GlobalRateLimit => "GLOBAL_RATE_LIMIT",
            Reason::UserRateLimit => "USER_RATE_LIMIT",
            Reason::UserHourlyLimit => "USER_HOURLY_LIMIT",
            Reason::CommandCooldown => "COMMAND_COOLDOWN",
            Reason::BurstLimit => "BURST_LIMIT",
            Reason::TempBan => "TEMP_BAN",
            Reason::PermaBan => "PERMA_BAN",
            Reason::MessageFlood => "MESSAGE_FLOOD",
            Reason::DuplicateMessages => "DUPLICATE_MESSAGES",
            Reason::MentionSpam => "MENTION_SPAM",
            Reason::LinkSpam => "LINK_SPAM",
            Reason::SuspiciousLink => "SUSPICIOUS_LINK",
            Reason::ExcessiveCaps => "EXCESSIVE_CAPS",
            Reason::EmojiSpam => "EMOJI_SPAM",
            Reason::MessageTooLong => "MESSAGE_TOO_LONG",
            Reason::RepeatedCharacters => "REPEATED_CHARACTERS",
            Reason::RepeatedWords => "REPEATED_WORDS",
            Reason::HiddenUnicode => "HIDDEN_UNICODE",
            Reason::ZalgoText => "ZALGO_TEXT",
            Reason::PersonalInfo => "PERSONAL_INFO",
            Reason::InviteLink => "INVITE_LINK",
            Reason::Lockdown => "LOCKDOWN",
            Reason::MassJoin => "MASS_JOIN",
            Reason::RaidDetected => "RAID_DETECTED",
            Reason::JoinSpike => "JOIN_SPIKE",
            Reason::SuspiciousAccount => "SUSPICIOUS_ACCOUNT",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Reason::Allowed => Category::Allowed,
            Reason::Whitelisted | Reason::AdminBypass => Category::Bypass,
            Reason::EvaluationError => Category::Error,
            Reason::EmergencyMode => Category::Emergency,
            Reason::Blacklisted => Category::AccessList,
            Reason::GlobalRateLimit
            | Reason::UserRateLimit
            | Reason::UserHourlyLimit
            | Reason::CommandCooldown
            | Reason::BurstLimit
            | Reason::TempBan
            | Reason::PermaBan => Category::RateLimit,
            Reason::MessageFlood
            | Reason::DuplicateMessages
            | Reason::MentionSpam
            | Reason::LinkSpam
            | Reason::SuspiciousLink
            | Reason::ExcessiveCaps
            | Reason::EmojiSpam
            | Reason::MessageTooLong
            | Reason::RepeatedCharacters
            | Reason::RepeatedWords
            | Reason::HiddenUnicode
            | Reason::ZalgoText
            | Reason::PersonalInfo
            | Reason::InviteLink => Category::Spam,
            Reason::Lockdown
            | Reason::MassJoin
            | Reason::RaidDetected
            | Reason::JoinSpike
            | Reason::SuspiciousAccount => Category::Raid,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<EnforcementAction>,
}

impl Decision {
    pub fn allow(reason: Reason) -> Self {
        Self {
            allowed: true,
            reason,
            severity: None,
            message: None,
            retry_after_seconds: None,
            action: None,
        }
    }

    pub fn block(reason: Reason, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason,
            severity: Some(severity),
            message: Some(message.into()),
            retry_after_seconds: None,
            action: None,
        }
    }

    pub fn retry_after(mut self, secs: u64) -> Self {
        self.retry_after_seconds = Some(secs);
        self
    }

    pub fn with_action(mut self, action: EnforcementAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn maybe_action(mut self, action: Option<EnforcementAction>) -> Self {
        if action.is_some() {
            self.action = action;
        }
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
