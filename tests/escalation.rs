use tigris_shield::config::ShieldConfig;
use tigris_shield::identity::EscalationTier;
use tigris_shield::{ActivityEvent, EnforcementAction, Reason, SecurityOrchestrator};

/// burst 1 na 2s: każda komenda po pierwszej w oknie to naruszenie
fn strict() -> ShieldConfig {
    let mut cfg = ShieldConfig::default();
    cfg.rate_limit.burst_limit = 1;
    cfg.rate_limit.burst_window_ms = 2_000;
    cfg
}

async fn cmd(s: &SecurityOrchestrator, t: i64) -> tigris_shield::Decision {
    s.evaluate_command(&ActivityEvent::command("u1", "g1", t, "ping"))
        .await
}

#[tokio::test]
async fn violations_walk_the_escalation_ladder() {
    let cfg = strict();
    let temp_ms = cfg.rate_limit.temp_ban_duration_ms as i64;
    let s = SecurityOrchestrator::new(cfg).unwrap();

    assert!(cmd(&s, 0).await.allowed);

    // 1, 2: zwykłe blokady burst
    for t in [10, 20] {
        let d = cmd(&s, t).await;
        assert_eq!(d.reason, Reason::BurstLimit);
        assert_eq!(d.action, None);
    }
    // 3, 4: próg ostrzeżenia osiągnięty
    for t in [30, 40] {
        let d = cmd(&s, t).await;
        assert_eq!(d.reason, Reason::BurstLimit);
        assert_eq!(d.action, Some(EnforcementAction::Warn));
    }
    assert_eq!(
        s.identity_status("u1", 40).unwrap().tier,
        EscalationTier::Warned
    );

    // 5: temp ban
    let d = cmd(&s, 50).await;
    assert!(!d.allowed);
    assert_eq!(d.reason, Reason::TempBan);
    let status = s.identity_status("u1", 50).unwrap();
    assert_eq!(status.tier, EscalationTier::TempBlocked);
    assert_eq!(status.identity.ban_until, Some(50 + temp_ms));

    // dalsze próby w banie: 6..9 zostają temp, 10 to perma
    for t in [60, 70, 80, 90] {
        assert_eq!(cmd(&s, t).await.reason, Reason::TempBan);
    }
    let d = cmd(&s, 100).await;
    assert_eq!(d.reason, Reason::PermaBan);
    assert_eq!(d.action, Some(EnforcementAction::PermaBan));
    assert_eq!(
        s.identity_status("u1", 100).unwrap().tier,
        EscalationTier::PermaBlocked
    );
    assert_eq!(s.identity_status("u1", 100).unwrap().identity.history.len(), 10);
}

#[tokio::test]
async fn expired_ban_resets_the_counter() {
    let cfg = strict();
    let temp_ms = cfg.rate_limit.temp_ban_duration_ms as i64;
    let s = SecurityOrchestrator::new(cfg).unwrap();

    assert!(cmd(&s, 0).await.allowed);
    for t in [10, 20, 30, 40, 50] {
        cmd(&s, t).await;
    }
    let until = s.identity_status("u1", 50).unwrap().identity.ban_until.unwrap();
    assert_eq!(until, 50 + temp_ms);

    let d = cmd(&s, until + 1).await;
    assert!(d.allowed, "{d:?}");
    let status = s.identity_status("u1", until + 1).unwrap();
    assert_eq!(status.identity.violation_count, 0);
    assert_eq!(status.tier, EscalationTier::Clean);
}

#[tokio::test]
async fn global_limit_does_not_punish_the_caller() {
    let mut cfg = ShieldConfig::default();
    cfg.rate_limit.global_requests_per_minute = 2;
    let s = SecurityOrchestrator::new(cfg).unwrap();

    for (i, who) in ["a", "b"].into_iter().enumerate() {
        assert!(
            s.evaluate_command(&ActivityEvent::command(who, "g1", i as i64, "ping"))
                .await
                .allowed
        );
    }
    let d = s
        .evaluate_command(&ActivityEvent::command("c", "g1", 5, "ping"))
        .await;
    assert_eq!(d.reason, Reason::GlobalRateLimit);
    assert_eq!(s.identity_status("c", 5).unwrap().identity.violation_count, 0);
}

#[tokio::test]
async fn reset_identity_lifts_a_ban() {
    let s = SecurityOrchestrator::new(strict()).unwrap();
    assert!(cmd(&s, 0).await.allowed);
    for t in [10, 20, 30, 40, 50] {
        cmd(&s, t).await;
    }
    assert_eq!(cmd(&s, 60).await.reason, Reason::TempBan);

    assert!(s.reset_identity("u1"));
    assert!(cmd(&s, 70).await.allowed);
}
