//! src/spam.rs
//! Heurystyki per wiadomość. Wygrywa pierwsze trafienie; każda flaga to ostrzeżenie
//! dla autora, a `max_warnings` ostrzeżeń kończy się czasowym mute.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::config::SpamConfig;
use crate::decision::{Decision, EnforcementAction, Reason, Severity};
use crate::identity::{IdentityStore, WarningOutcome};
use crate::similarity::{normalize_content, similarity};
use crate::window::{Millis, WindowCounter};

static RE_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@[!&]?\d+>|@everyone|@here").unwrap());

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bhttps?://[^\s<>]+").unwrap());

static RE_CUSTOM_EMOJI: Lazy<Regex> = Lazy::new(|| Regex::new(r"<a?:\w+:\d+>").unwrap());

static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

/// Odgrodzone od cyfr, żeby końcówka dłuższej liczby (snowflake ID) nie łapała.
static RE_PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\d+])(?:\+\d{1,3}[\s.-]?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{3,4}(?:$|\D)")
        .unwrap()
});

static RE_INVITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:discord\.gg|discord(?:app)?\.com/invite)/[A-Za-z0-9-]+").unwrap()
});

/// Co okna pamiętają o wcześniejszej wiadomości.
#[derive(Debug, Clone)]
struct Fingerprint {
    normalized: String,
    mentions: u32,
    links: u32,
}

/// Pola wiadomości, które czyta detektor. Liczniki nadpisują wartości z treści.
#[derive(Debug, Clone, Copy)]
pub struct MessageInput<'a> {
    pub identity_id: &'a str,
    pub scope_id: &'a str,
    pub content: &'a str,
    pub mention_count: Option<u32>,
    pub link_count: Option<u32>,
    pub now: Millis,
}

#[derive(Debug)]
struct Flag {
    reason: Reason,
    severity: Severity,
    message: String,
}

impl Flag {
    fn new(reason: Reason, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            reason,
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct SpamDetector {
    cfg: SpamConfig,
    identities: Arc<IdentityStore>,
    messages: WindowCounter<Fingerprint>,
}

impl SpamDetector {
    pub fn new(cfg: SpamConfig, identities: Arc<IdentityStore>) -> Self {
        let retention = [
            cfg.message_window_ms,
            cfg.duplicate_window_ms,
            cfg.mention_window_ms,
            cfg.link_window_ms,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        Self {
            messages: WindowCounter::with_retention(retention),
            identities,
            cfg,
        }
    }

    pub fn config(&self) -> &SpamConfig {
        &self.cfg
    }

    pub fn check_message(&self, input: MessageInput<'_>) -> Decision {
        let MessageInput {
            identity_id,
            scope_id,
            content,
            now,
            ..
        } = input;
        self.identities.touch(identity_id, now);

        let urls: Vec<&str> = RE_URL.find_iter(content).map(|m| m.as_str()).collect();
        let fp = Fingerprint {
            normalized: normalize_content(content),
            mentions: input
                .mention_count
                .unwrap_or_else(|| RE_MENTION.find_iter(content).count() as u32),
            links: input.link_count.unwrap_or(urls.len() as u32),
        };

        let flag = self.evaluate(identity_id, content, &urls, &fp, now);
        self.messages.record(identity_id, now, fp);

        match flag {
            None => Decision::allow(Reason::Allowed),
            Some(flag) => self.punish(identity_id, scope_id, flag, now),
        }
    }

    fn evaluate(
        &self,
        identity_id: &str,
        content: &str,
        urls: &[&str],
        fp: &Fingerprint,
        now: Millis,
    ) -> Option<Flag> {
        let c = &self.cfg;

        /* ==== 1. frequency ==== */
        let recent = self.messages.count(identity_id, now, c.message_window_ms);
        if recent + 1 > c.max_messages_per_window as usize {
            return Some(Flag::new(
                Reason::MessageFlood,
                Severity::Medium,
                "You are sending messages too quickly.",
            ));
        }

        /* ==== 2. duplicates ==== */
        if !fp.normalized.is_empty() {
            let dupes = self
                .messages
                .count_where(identity_id, now, c.duplicate_window_ms, |prev| {
                    similarity(&prev.normalized, &fp.normalized) >= c.similarity_threshold
                });
            if dupes >= c.max_duplicates as usize {
                return Some(Flag::new(
                    Reason::DuplicateMessages,
                    Severity::Medium,
                    "Please do not repeat the same message.",
                ));
            }
        }

        /* ==== 3. mentions ==== */
        if fp.mentions > c.max_mentions_per_message {
            return Some(Flag::new(
                Reason::MentionSpam,
                Severity::High,
                "Too many mentions in one message.",
            ));
        }
        if fp.mentions > 0 {
            let earlier: u32 = self
                .messages
                .entries(identity_id, now, c.mention_window_ms)
                .iter()
                .map(|e| e.tag.mentions)
                .sum();
            if earlier + fp.mentions > c.max_mentions_per_window {
                return Some(Flag::new(
                    Reason::MentionSpam,
                    Severity::High,
                    "You are mentioning people too often.",
                ));
            }
        }

        /* ==== 4. links ==== */
        if let Some(host) = urls.iter().find_map(|u| self.shortener_host(u)) {
            tracing::debug!(identity = %identity_id, %host, "shortened link");
            return Some(Flag::new(
                Reason::SuspiciousLink,
                Severity::High,
                "Shortened links are not allowed.",
            ));
        }
        if fp.links > c.max_links_per_message {
            return Some(Flag::new(
                Reason::LinkSpam,
                Severity::Medium,
                "Too many links in one message.",
            ));
        }
        if fp.links > 0 {
            let earlier: u32 = self
                .messages
                .entries(identity_id, now, c.link_window_ms)
                .iter()
                .map(|e| e.tag.links)
                .sum();
            if earlier + fp.links > c.max_links_per_window {
                return Some(Flag::new(
                    Reason::LinkSpam,
                    Severity::Medium,
                    "You are posting links too often.",
                ));
            }
        }

        /* ==== 5. character patterns ==== */
        if self.excessive_caps(content) {
            return Some(Flag::new(
                Reason::ExcessiveCaps,
                Severity::Low,
                "Please do not write in all caps.",
            ));
        }
        if count_emojis(content) > c.max_emojis_per_message as usize {
            return Some(Flag::new(
                Reason::EmojiSpam,
                Severity::Low,
                "Too many emojis in one message.",
            ));
        }
        if content.chars().count() > c.max_message_length as usize {
            return Some(Flag::new(
                Reason::MessageTooLong,
                Severity::Low,
                "Your message is too long.",
            ));
        }

        /* ==== 6. advanced patterns ==== */
        if longest_char_run(content) >= c.repeated_char_run as usize {
            return Some(Flag::new(
                Reason::RepeatedCharacters,
                Severity::Low,
                "Please do not spam repeated characters.",
            ));
        }
        if longest_word_run(content) >= c.repeated_word_run as usize {
            return Some(Flag::new(
                Reason::RepeatedWords,
                Severity::Low,
                "Please do not spam repeated words.",
            ));
        }
        if content.chars().any(is_zero_width) {
            return Some(Flag::new(
                Reason::HiddenUnicode,
                Severity::Medium,
                "Messages with hidden characters are not allowed.",
            ));
        }
        let marks = content
            .chars()
            .filter(|ch| unicode_normalization::char::is_combining_mark(*ch))
            .count();
        if marks > c.max_combining_marks as usize {
            return Some(Flag::new(
                Reason::ZalgoText,
                Severity::Medium,
                "Zalgo text is not allowed.",
            ));
        }
        if c.detect_personal_info && contains_personal_info(content) {
            return Some(Flag::new(
                Reason::PersonalInfo,
                Severity::High,
                "Do not share personal information in public channels.",
            ));
        }
        if RE_INVITE.is_match(content) {
            return Some(Flag::new(
                Reason::InviteLink,
                Severity::Medium,
                "Invite links are not allowed.",
            ));
        }

        None
    }

    fn punish(&self, identity_id: &str, scope_id: &str, flag: Flag, now: Millis) -> Decision {
        let c = &self.cfg;
        let outcome = self.identities.record_warning(identity_id, c.max_warnings, now);
        tracing::info!(
            identity = %identity_id,
            scope = %scope_id,
            reason = %flag.reason,
            ?outcome,
            "spam flagged"
        );

        match outcome {
            WarningOutcome::Muted => {
                let minutes = c.mute_duration_ms.div_ceil(60_000);
                Decision::block(
                    flag.reason,
                    flag.severity,
                    format!("{} You have been muted for {minutes} minutes.", flag.message),
                )
                .with_action(EnforcementAction::Mute)
            }
            WarningOutcome::Warned { count } => Decision::block(
                flag.reason,
                flag.severity,
                format!("{} Warning {count}/{}.", flag.message, c.max_warnings),
            )
            .with_action(EnforcementAction::DeleteMessage),
        }
    }

    fn excessive_caps(&self, content: &str) -> bool {
        if content.chars().count() < self.cfg.min_caps_length as usize {
            return false;
        }
        let (mut letters, mut upper) = (0u64, 0u64);
        for ch in content.chars().filter(|c| c.is_alphabetic()) {
            letters += 1;
            if ch.is_uppercase() {
                upper += 1;
            }
        }
        letters > 0 && upper * 100 >= self.cfg.caps_percentage_threshold as u64 * letters
    }

    fn shortener_host(&self, raw: &str) -> Option<String> {
        let url = Url::parse(raw).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host).to_owned();
        self.cfg
            .shortener_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
            .then_some(host)
    }

    pub fn reset(&self, identity_id: &str) {
        self.messages.remove(identity_id);
    }

    pub fn sweep(&self, now: Millis, horizon_ms: u64) -> usize {
        self.messages.sweep(now, horizon_ms)
    }

    pub fn tracked_keys(&self) -> usize {
        self.messages.key_count()
    }
}

/* =========================================
   Character helpers
   ========================================= */

fn longest_char_run(s: &str) -> usize {
    let mut best = 0;
    let mut run = 0;
    let mut prev: Option<char> = None;
    for ch in s.chars() {
        if ch.is_whitespace() {
            run = 0;
            prev = None;
            continue;
        }
        if prev == Some(ch) {
            run += 1;
        } else {
            run = 1;
            prev = Some(ch);
        }
        best = best.max(run);
    }
    best
}

fn longest_word_run(s: &str) -> usize {
    let mut best = 0;
    let mut run = 0;
    let mut prev = String::new();
    for word in s.split_whitespace() {
        let w = word.to_lowercase();
        if !prev.is_empty() && w == prev {
            run += 1;
        } else {
            run = 1;
            prev = w;
        }
        best = best.max(run);
    }
    best
}

/// Wzmianki i custom emoji niosą ID z platformy; wycinamy je przed skanem.
fn contains_personal_info(content: &str) -> bool {
    let stripped = RE_MENTION.replace_all(content, " ");
    let stripped = RE_CUSTOM_EMOJI.replace_all(&stripped, " ");
    RE_EMAIL.is_match(&stripped) || RE_PHONE.is_match(&stripped)
}

fn is_zero_width(ch: char) -> bool {
    matches!(
        ch,
        '\u{200B}'..='\u{200F}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}' | '\u{180E}'
    )
}

fn is_emoji(ch: char) -> bool {
    matches!(
        ch as u32,
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B50 | 0x2B55 | 0x3030 | 0x303D
    )
}

fn count_emojis(s: &str) -> usize {
    let custom = RE_CUSTOM_EMOJI.find_iter(s).count();
    let stripped = RE_CUSTOM_EMOJI.replace_all(s, "");
    custom + stripped.chars().filter(|c| is_emoji(*c)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(cfg: SpamConfig) -> (SpamDetector, Arc<IdentityStore>) {
        let ids = Arc::new(IdentityStore::new());
        (SpamDetector::new(cfg, ids.clone()), ids)
    }

    fn msg<'a>(content: &'a str, now: Millis) -> MessageInput<'a> {
        MessageInput {
            identity_id: "u",
            scope_id: "g",
            content,
            mention_count: None,
            link_count: None,
            now,
        }
    }

    #[test]
    fn fourth_duplicate_is_flagged() {
        let (sd, _) = detector(SpamConfig {
            max_duplicates: 3,
            duplicate_window_ms: 30_000,
            similarity_threshold: 0.8,
            ..SpamConfig::default()
        });
        for t in [0, 3_000, 6_000] {
            assert!(sd.check_message(msg("hello world", t)).allowed);
        }
        let d = sd.check_message(msg("Hello  World", 9_000));
        assert_eq!(d.reason, Reason::DuplicateMessages);
        assert_eq!(d.action, Some(EnforcementAction::DeleteMessage));
    }

    #[test]
    fn flood_counts_flagged_messages_too() {
        let (sd, _) = detector(SpamConfig {
            max_messages_per_window: 3,
            ..SpamConfig::default()
        });
        assert!(sd.check_message(msg("one", 0)).allowed);
        assert!(sd.check_message(msg("two", 100)).allowed);
        assert!(sd.check_message(msg("three", 200)).allowed);
        assert_eq!(sd.check_message(msg("four", 300)).reason, Reason::MessageFlood);
        assert_eq!(sd.check_message(msg("five", 400)).reason, Reason::MessageFlood);
        // okno minęło
        assert!(sd.check_message(msg("six", 5_500)).allowed);
    }

    #[test]
    fn mentions_per_message_and_per_window() {
        let (sd, _) = detector(SpamConfig {
            max_mentions_per_message: 3,
            max_mentions_per_window: 5,
            ..SpamConfig::default()
        });
        let d = sd.check_message(msg("<@1> <@2> <@!3> @everyone", 0));
        assert_eq!(d.reason, Reason::MentionSpam);

        let (sd, _) = detector(SpamConfig {
            max_mentions_per_message: 3,
            max_mentions_per_window: 5,
            ..SpamConfig::default()
        });
        assert!(sd.check_message(msg("hi <@1> <@2> <@3>", 0)).allowed);
        let mut second = msg("again", 1_000);
        second.mention_count = Some(3);
        assert_eq!(sd.check_message(second).reason, Reason::MentionSpam);
    }

    #[test]
    fn shortener_links_are_suspicious() {
        let (sd, _) = detector(SpamConfig::default());
        let d = sd.check_message(msg("free nitro https://bit.ly/abc", 0));
        assert_eq!(d.reason, Reason::SuspiciousLink);
        let d = sd.check_message(msg("look https://www.tinyurl.com/x", 10_000));
        assert_eq!(d.reason, Reason::SuspiciousLink);
        // podróbka, która tylko zawiera nazwę
        assert!(sd.check_message(msg("https://notbit.ly.example.com/", 20_000)).allowed);
    }

    #[test]
    fn too_many_links_per_message() {
        let (sd, _) = detector(SpamConfig::default());
        let d = sd.check_message(msg(
            "https://a.com https://b.com https://c.com https://d.com",
            0,
        ));
        assert_eq!(d.reason, Reason::LinkSpam);
    }

    #[test]
    fn caps_ratio_uses_letters_only() {
        let (sd, _) = detector(SpamConfig {
            caps_percentage_threshold: 50,
            min_caps_length: 5,
            ..SpamConfig::default()
        });
        assert_eq!(sd.check_message(msg("aaaaAAAA!!", 0)).reason, Reason::ExcessiveCaps);
        assert!(sd.check_message(msg("OK", 10_000)).allowed);
    }

    #[test]
    fn character_patterns() {
        let (sd, _) = detector(SpamConfig {
            max_warnings: 100,
            ..SpamConfig::default()
        });
        let cases = [
            ("so cool 😀😀😀😀😀😀😀😀😀😀😀", Reason::EmojiSpam),
            ("nooooooo way", Reason::RepeatedCharacters),
            ("buy buy buy buy now", Reason::RepeatedWords),
            ("hid\u{200B}den", Reason::HiddenUnicode),
            ("z\u{0301}\u{0302}\u{0303}\u{0304}\u{0305}\u{0306}algo", Reason::ZalgoText),
            ("mail me at jan.kowalski@example.com", Reason::PersonalInfo),
            ("call 555 123 4567 now", Reason::PersonalInfo),
            ("join discord.gg/abcdef", Reason::InviteLink),
        ];
        for (i, (text, reason)) in cases.into_iter().enumerate() {
            let d = sd.check_message(msg(text, i as i64 * 60_000));
            assert_eq!(d.reason, reason, "{text}");
        }
        let long = "a ".repeat(1_500);
        assert_eq!(
            sd.check_message(msg(&long, 10 * 60_000)).reason,
            Reason::MessageTooLong
        );
    }

    #[test]
    fn platform_ids_are_not_phone_numbers() {
        let (sd, ids) = detector(SpamConfig::default());
        for (i, text) in [
            "thanks <@123456789012345678>!",
            "ping <@!876543210987654321> and <@&112233445566778899>",
            "nice <:pepe:987654321098765432>",
            "lol <a:dance:1098765432109876543>",
            "my id is 123456789012345678",
        ]
        .into_iter()
        .enumerate()
        {
            let d = sd.check_message(msg(text, i as i64 * 60_000));
            assert!(d.allowed, "{text}: {d:?}");
        }
        assert_eq!(ids.get("u").map(|i| i.warnings).unwrap_or(0), 0);

        assert!(contains_personal_info("<@123456789012345678> call 555-123-4567"));
        assert!(contains_personal_info("(555) 123-4567"));
        assert!(contains_personal_info("+48 600 123 456"));
        assert!(!contains_personal_info("order #1234567890123"));
    }

    #[test]
    fn third_warning_mutes_and_resets() {
        let (sd, ids) = detector(SpamConfig {
            max_warnings: 3,
            ..SpamConfig::default()
        });
        let d1 = sd.check_message(msg("https://bit.ly/1", 0));
        assert!(d1.message.as_deref().unwrap().contains("1/3"));
        sd.check_message(msg("https://bit.ly/2", 10_000));
        let d3 = sd.check_message(msg("https://bit.ly/3", 20_000));
        assert_eq!(d3.action, Some(EnforcementAction::Mute));
        assert_eq!(ids.get("u").unwrap().warnings, 0);
    }

    #[test]
    fn helpers() {
        assert_eq!(longest_char_run("aa bbb cc"), 3);
        assert_eq!(longest_char_run("a     a"), 1);
        assert_eq!(longest_word_run("Spam spam SPAM eggs"), 3);
        assert_eq!(count_emojis("<:pepe:123> <a:dance:456> 🎉"), 3);
    }
}
