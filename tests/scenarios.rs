use tigris_shield::config::ShieldConfig;
use tigris_shield::{ActivityEvent, EnforcementAction, Reason, SecurityOrchestrator, Severity};

const DAY: i64 = 24 * 3_600_000;

fn shield(cfg: ShieldConfig) -> SecurityOrchestrator {
    SecurityOrchestrator::new(cfg).unwrap()
}

#[tokio::test]
async fn eleventh_command_in_five_seconds_hits_user_rate_limit() {
    let mut cfg = ShieldConfig::default();
    cfg.rate_limit.user_requests_per_minute = 10;
    let s = shield(cfg);

    for i in 0..10 {
        let d = s
            .evaluate_command(&ActivityEvent::command("u1", "g1", i * 500, "ping"))
            .await;
        assert!(d.allowed, "command {i} should pass: {d:?}");
    }

    let d = s
        .evaluate_command(&ActivityEvent::command("u1", "g1", 5_000, "ping"))
        .await;
    assert!(!d.allowed);
    assert_eq!(d.reason, Reason::UserRateLimit);
    assert!(d.retry_after_seconds.unwrap() >= 1);
    assert!(d.message.is_some());
}

#[tokio::test]
async fn mass_join_locks_the_scope() {
    let mut cfg = ShieldConfig::default();
    cfg.raid.suspicious_join_window_ms = 10_000;
    cfg.raid.suspicious_join_count = 5;
    let s = shield(cfg);

    for (i, t) in [0, 2_000, 4_000, 6_000].into_iter().enumerate() {
        let d = s
            .evaluate_join(&ActivityEvent::join(&format!("j{i}"), "g1", t))
            .await;
        assert!(d.allowed);
    }

    let fifth = s.evaluate_join(&ActivityEvent::join("j4", "g1", 8_000)).await;
    assert_eq!(fifth.reason, Reason::MassJoin);
    assert_eq!(fifth.severity, Some(Severity::Critical));
    assert_eq!(fifth.action, Some(EnforcementAction::Lockdown));
    assert!(s.is_in_lockdown_at("g1", 8_000));

    let benign = s
        .evaluate_join(
            &ActivityEvent::join("friend", "g1", 9_000)
                .with_display_name("Kasia")
                .with_avatar(true),
        )
        .await;
    assert!(!benign.allowed);
    assert_eq!(benign.reason, Reason::Lockdown);

    // inne scope'y bez zmian
    assert!(s.evaluate_join(&ActivityEvent::join("x", "g2", 9_000)).await.allowed);
}

#[tokio::test]
async fn fourth_identical_message_is_a_duplicate() {
    let mut cfg = ShieldConfig::default();
    cfg.spam.max_duplicates = 3;
    cfg.spam.duplicate_window_ms = 30_000;
    cfg.spam.similarity_threshold = 0.8;
    let s = shield(cfg);

    for t in [0, 3_000, 6_000] {
        let d = s
            .evaluate_message(&ActivityEvent::message("u1", "g1", t, "hello world"))
            .await;
        assert!(d.allowed);
    }
    let d = s
        .evaluate_message(&ActivityEvent::message("u1", "g1", 9_000, "hello world"))
        .await;
    assert_eq!(d.reason, Reason::DuplicateMessages);
    assert_eq!(d.action, Some(EnforcementAction::DeleteMessage));
}

#[tokio::test]
async fn new_generic_avatarless_account_is_suspicious() {
    let s = shield(ShieldConfig::default());
    let now = 30 * DAY;
    let day_old = now - DAY;

    for (id, name, t) in [("r1", "raider01", now - 20_000), ("r2", "raider02", now - 10_000)] {
        let d = s
            .evaluate_join(
                &ActivityEvent::join(id, "g1", t)
                    .with_display_name(name)
                    .with_account_created_at(day_old),
            )
            .await;
        assert!(d.allowed, "{name}: {d:?}");
    }

    let d = s
        .evaluate_join(
            &ActivityEvent::join("r3", "g1", now)
                .with_display_name("raider03")
                .with_account_created_at(day_old)
                .with_avatar(false),
        )
        .await;
    assert!(!d.allowed);
    assert_eq!(d.reason, Reason::SuspiciousAccount);
    assert_eq!(d.action, Some(EnforcementAction::Kick));
    let message = d.message.unwrap();
    for flag in ["new account", "suspicious name", "no avatar"] {
        assert!(message.contains(flag), "{flag} missing from {message}");
    }
    // pojedyncze kicki nie blokują scope'u
    assert!(!s.is_in_lockdown_at("g1", now));

    let status = s.identity_status("r3", now).unwrap();
    assert_eq!(status.identity.created_at, Some(day_old));
}

#[tokio::test]
async fn caps_threshold_counts_letters_only() {
    let mut cfg = ShieldConfig::default();
    cfg.spam.caps_percentage_threshold = 50;
    cfg.spam.min_caps_length = 5;
    let s = shield(cfg);

    let d = s
        .evaluate_message(&ActivityEvent::message("u1", "g1", 0, "aaaaAAAA!!"))
        .await;
    assert_eq!(d.reason, Reason::ExcessiveCaps);
}
