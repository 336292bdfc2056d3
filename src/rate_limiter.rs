//! src/rate_limiter.rs
//! Limitowanie komend z eskalacją naruszeń.
//!
//! Kolejność (wygrywa pierwsza porażka): aktywny ban, limit scope'u, limit
//! tożsamości na minutę / godzinę, cooldown komendy, burst. Naruszeniem są tylko
//! limity tożsamości (minuta, godzina, burst) oraz próby w trakcie temp bana;
//! zapchany scope i cooldowny nie karzą wołającego.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::config::RateLimitConfig;
use crate::decision::{Decision, EnforcementAction, Reason, Severity};
use crate::identity::{BanTier, IdentityStore};
use crate::window::{HOUR_MS, MINUTE_MS, Millis, WindowCounter, ceil_secs, retry_after_secs};

pub struct RateLimiter {
    cfg: RateLimitConfig,
    identities: Arc<IdentityStore>,
    /// Per scope, każda przepuszczona komenda każdej tożsamości.
    global: WindowCounter<()>,
    /// Per tożsamość; czytane w oknach burst, minuta i godzina.
    user: WindowCounter<()>,
    /// (identity, komenda) -> ostatnie przepuszczone użycie.
    cooldowns: Cache<(String, String), Millis>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("global_keys", &self.global.key_count())
            .field("user_keys", &self.user.key_count())
            .field("cooldown_keys", &self.cooldowns.entry_count())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig, identities: Arc<IdentityStore>) -> Self {
        let mut builder = Cache::builder().max_capacity(cfg.max_tracked_command_keys);
        // nic nie żyje dłużej niż najdłuższy cooldown
        let longest = cfg
            .command_cooldowns
            .values()
            .copied()
            .chain(cfg.default_command_cooldown_ms)
            .max();
        if let Some(ms) = longest {
            builder = builder.time_to_live(Duration::from_millis(ms));
        }

        Self {
            identities,
            global: WindowCounter::new(),
            user: WindowCounter::with_retention(HOUR_MS),
            cooldowns: builder.build(),
            cfg,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.cfg
    }

    pub fn check_limit(
        &self,
        identity_id: &str,
        scope_id: &str,
        command: &str,
        now: Millis,
    ) -> Decision {
        let c = &self.cfg;

        /* ==== 0. active ban ==== */
        if let Some((until, tier)) = self.identities.touch(identity_id, now) {
            return self.banned(identity_id, scope_id, until, tier, now);
        }

        /* ==== 1. scope-wide ==== */
        let global = self.global.count(scope_id, now, MINUTE_MS);
        if global >= c.global_requests_per_minute as usize {
            let retry = self.retry_after(&self.global, scope_id, MINUTE_MS, now);
            tracing::debug!(scope = %scope_id, global, "global rate limit hit");
            return Decision::block(
                Reason::GlobalRateLimit,
                Severity::Medium,
                format!("This server is handling too many commands right now. Try again in {retry} seconds."),
            )
            .retry_after(retry);
        }

        /* ==== 2. identity per minute / per hour ==== */
        let per_minute = self.user.count(identity_id, now, MINUTE_MS);
        if per_minute >= c.user_requests_per_minute as usize {
            let retry = self.retry_after(&self.user, identity_id, MINUTE_MS, now);
            return self.violation(
                identity_id,
                scope_id,
                Reason::UserRateLimit,
                Severity::Medium,
                format!("You are sending commands too fast. Try again in {retry} seconds."),
                retry,
                now,
            );
        }

        let per_hour = self.user.count(identity_id, now, HOUR_MS);
        if per_hour >= c.user_requests_per_hour as usize {
            let retry = self.retry_after(&self.user, identity_id, HOUR_MS, now);
            return self.violation(
                identity_id,
                scope_id,
                Reason::UserHourlyLimit,
                Severity::Medium,
                format!("You have reached the hourly command limit. Try again in {retry} seconds."),
                retry,
                now,
            );
        }

        /* ==== 3. per-command cooldown ==== */
        let cooldown = self.cooldown_for(command);
        let cooldown_key = (identity_id.to_owned(), command.to_owned());
        if let Some(cd) = cooldown
            && let Some(last) = self.cooldowns.get(&cooldown_key)
        {
            let ready_at = last.saturating_add(cd as i64);
            if now < ready_at {
                let retry = ceil_secs(ready_at - now);
                return Decision::block(
                    Reason::CommandCooldown,
                    Severity::Low,
                    format!("`{command}` is on cooldown. Try again in {retry} seconds."),
                )
                .retry_after(retry);
            }
        }

        /* ==== 4. burst ==== */
        let burst = self.user.count(identity_id, now, c.burst_window_ms);
        if burst >= c.burst_limit as usize {
            let retry = self.retry_after(&self.user, identity_id, c.burst_window_ms, now);
            return self.violation(
                identity_id,
                scope_id,
                Reason::BurstLimit,
                Severity::Low,
                format!("Slow down! Try again in {retry} seconds."),
                retry,
                now,
            );
        }

        self.global.record(scope_id, now, ());
        self.user.record(identity_id, now, ());
        if cooldown.is_some() {
            self.cooldowns.insert(cooldown_key, now);
        }
        Decision::allow(Reason::Allowed)
    }

    fn cooldown_for(&self, command: &str) -> Option<u64> {
        self.cfg
            .command_cooldowns
            .get(command)
            .copied()
            .or(self.cfg.default_command_cooldown_ms)
    }

    fn retry_after(&self, w: &WindowCounter<()>, key: &str, window_ms: u64, now: Millis) -> u64 {
        w.oldest(key, now, window_ms)
            .map(|oldest| retry_after_secs(oldest, window_ms, now))
            .unwrap_or(1)
    }

    fn banned(
        &self,
        identity_id: &str,
        scope_id: &str,
        until: Millis,
        tier: BanTier,
        now: Millis,
    ) -> Decision {
        match tier {
            BanTier::Perma => Decision::block(
                Reason::PermaBan,
                Severity::Critical,
                "You are blocked from using commands.",
            )
            .retry_after(ceil_secs(until - now))
            .with_action(EnforcementAction::PermaBan),
            BanTier::Temp => {
                // spamowanie w trakcie temp bana dalej eskaluje
                let count = self.identities.record_violation(
                    identity_id,
                    scope_id,
                    Reason::TempBan,
                    Severity::High,
                    now,
                );
                if count >= self.cfg.perma_ban_threshold {
                    return self.escalate(identity_id, BanTier::Perma, count, now);
                }
                let retry = ceil_secs(until - now);
                Decision::block(
                    Reason::TempBan,
                    Severity::High,
                    format!("You are temporarily blocked. Try again in {retry} seconds."),
                )
                .retry_after(retry)
                .with_action(EnforcementAction::TempBan)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn violation(
        &self,
        identity_id: &str,
        scope_id: &str,
        reason: Reason,
        severity: Severity,
        message: String,
        retry: u64,
        now: Millis,
    ) -> Decision {
        let c = &self.cfg;
        let count = self
            .identities
            .record_violation(identity_id, scope_id, reason, severity, now);
        tracing::debug!(identity = %identity_id, scope = %scope_id, %reason, count, "rate limit violation");

        if count >= c.perma_ban_threshold {
            return self.escalate(identity_id, BanTier::Perma, count, now);
        }
        if count >= c.temp_ban_threshold {
            return self.escalate(identity_id, BanTier::Temp, count, now);
        }

        let decision = Decision::block(reason, severity, message).retry_after(retry);
        if count >= c.warning_threshold {
            decision.with_action(EnforcementAction::Warn)
        } else {
            decision
        }
    }

    fn escalate(&self, identity_id: &str, tier: BanTier, count: u32, now: Millis) -> Decision {
        let (duration, reason, severity, action, message) = match tier {
            BanTier::Temp => (
                self.cfg.temp_ban_duration_ms,
                Reason::TempBan,
                Severity::High,
                EnforcementAction::TempBan,
                "You have been temporarily blocked for repeated rate limit violations.",
            ),
            BanTier::Perma => (
                self.cfg.perma_ban_duration_ms,
                Reason::PermaBan,
                Severity::Critical,
                EnforcementAction::PermaBan,
                "You have been blocked for repeated rate limit violations.",
            ),
        };
        let until = now.saturating_add(duration as i64);
        self.identities.ban(identity_id, tier, until);
        tracing::warn!(identity = %identity_id, ?tier, count, until, "identity banned");

        Decision::block(reason, severity, message)
            .retry_after(ceil_secs(duration as i64))
            .with_action(action)
    }

    /// Zapomina okna i cooldowny jednej tożsamości. Sam stan tożsamości siedzi
    /// we wspólnym store.
    pub fn reset(&self, identity_id: &str) {
        self.user.remove(identity_id);
        let keys: Vec<_> = self
            .cooldowns
            .iter()
            .filter(|(k, _)| k.0 == identity_id)
            .map(|(k, _)| k)
            .collect();
        for k in keys {
            self.cooldowns.invalidate(k.as_ref());
        }
    }

    /// Zwraca liczbę usuniętych wpisów z okien.
    pub fn sweep(&self, now: Millis, horizon_ms: u64) -> usize {
        self.cooldowns.run_pending_tasks();
        self.global.sweep(now, horizon_ms) + self.user.sweep(now, horizon_ms)
    }

    pub fn tracked_keys(&self) -> usize {
        self.global.key_count() + self.user.key_count() + self.cooldowns.entry_count() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(cfg: RateLimitConfig) -> (RateLimiter, Arc<IdentityStore>) {
        let ids = Arc::new(IdentityStore::new());
        (RateLimiter::new(cfg, ids.clone()), ids)
    }

    fn relaxed() -> RateLimitConfig {
        RateLimitConfig {
            burst_limit: 100,
            ..RateLimitConfig::default()
        }
    }

    #[test]
    fn eleventh_command_in_a_minute_is_limited() {
        let (rl, _) = limiter(RateLimitConfig {
            user_requests_per_minute: 10,
            ..relaxed()
        });
        for i in 0..10 {
            assert!(rl.check_limit("u", "g", "ping", i * 500).allowed);
        }
        let d = rl.check_limit("u", "g", "ping", 5_000);
        assert!(!d.allowed);
        assert_eq!(d.reason, Reason::UserRateLimit);
        // najstarszy z 0 wypada z okna w 60_000
        assert_eq!(d.retry_after_seconds, Some(55));
    }

    #[test]
    fn hourly_limit_survives_minute_pruning() {
        let (rl, _) = limiter(RateLimitConfig {
            user_requests_per_hour: 3,
            ..relaxed()
        });
        for t in [0, 70_000, 140_000] {
            assert!(rl.check_limit("u", "g", "ping", t).allowed);
        }
        let d = rl.check_limit("u", "g", "ping", 210_000);
        assert_eq!(d.reason, Reason::UserHourlyLimit);
    }

    #[test]
    fn global_limit_is_per_scope_and_not_a_violation() {
        let (rl, ids) = limiter(RateLimitConfig {
            global_requests_per_minute: 3,
            ..relaxed()
        });
        for (i, who) in ["a", "b", "c"].iter().enumerate() {
            assert!(rl.check_limit(who, "g1", "ping", i as i64).allowed);
        }
        let d = rl.check_limit("d", "g1", "ping", 10);
        assert_eq!(d.reason, Reason::GlobalRateLimit);
        assert_eq!(ids.get("d").unwrap().violation_count, 0);
        // inny scope bez zmian
        assert!(rl.check_limit("d", "g2", "ping", 10).allowed);
    }

    #[test]
    fn cooldown_applies_per_command() {
        let mut cfg = relaxed();
        cfg.command_cooldowns.insert("daily".into(), 30_000);
        let (rl, ids) = limiter(cfg);

        assert!(rl.check_limit("u", "g", "daily", 0).allowed);
        let d = rl.check_limit("u", "g", "daily", 10_000);
        assert_eq!(d.reason, Reason::CommandCooldown);
        assert_eq!(d.retry_after_seconds, Some(20));
        assert_eq!(ids.get("u").unwrap().violation_count, 0);

        // ta nie ma ustawionego cooldownu
        assert!(rl.check_limit("u", "g", "ping", 10_000).allowed);
        assert!(rl.check_limit("u", "g", "daily", 30_000).allowed);
    }

    #[test]
    fn burst_counts_as_violation() {
        let (rl, ids) = limiter(RateLimitConfig {
            burst_limit: 3,
            burst_window_ms: 2_000,
            ..RateLimitConfig::default()
        });
        for t in [0, 100, 200] {
            assert!(rl.check_limit("u", "g", "ping", t).allowed);
        }
        let d = rl.check_limit("u", "g", "ping", 300);
        assert_eq!(d.reason, Reason::BurstLimit);
        assert_eq!(ids.get("u").unwrap().violation_count, 1);
        assert!(rl.check_limit("u", "g", "ping", 2_100).allowed);
    }

    #[test]
    fn warning_threshold_attaches_warn_action() {
        let (rl, ids) = limiter(RateLimitConfig {
            burst_limit: 1,
            ..RateLimitConfig::default()
        });
        ids.set_violation_count("u", 2, 0);
        assert!(rl.check_limit("u", "g", "ping", 0).allowed);
        let d = rl.check_limit("u", "g", "ping", 10);
        assert_eq!(d.reason, Reason::BurstLimit);
        assert_eq!(d.action, Some(EnforcementAction::Warn));
    }

    #[test]
    fn reaching_temp_threshold_bans() {
        let cfg = RateLimitConfig {
            burst_limit: 1,
            ..RateLimitConfig::default()
        };
        let temp = cfg.temp_ban_threshold;
        let dur = cfg.temp_ban_duration_ms;
        let (rl, ids) = limiter(cfg);

        assert!(rl.check_limit("u", "g", "ping", 0).allowed);
        ids.set_violation_count("u", temp - 1, 0);
        let d = rl.check_limit("u", "g", "ping", 100);
        assert!(!d.allowed);
        assert_eq!(d.reason, Reason::TempBan);
        assert!(d.reason.as_str().contains("BAN"));
        assert_eq!(ids.get("u").unwrap().ban_until, Some(100 + dur as i64));
    }

    #[test]
    fn attempts_during_temp_ban_escalate_to_perma() {
        let cfg = RateLimitConfig::default();
        let (rl, ids) = limiter(cfg.clone());
        ids.set_violation_count("u", cfg.perma_ban_threshold - 1, 0);
        ids.ban("u", BanTier::Temp, 1_000_000);

        let d = rl.check_limit("u", "g", "ping", 10);
        assert_eq!(d.reason, Reason::PermaBan);
        assert_eq!(d.action, Some(EnforcementAction::PermaBan));
        let again = rl.check_limit("u", "g", "ping", 20);
        assert_eq!(again.reason, Reason::PermaBan);
    }

    #[test]
    fn ban_expiry_forgives() {
        let (rl, ids) = limiter(relaxed());
        ids.touch("u", 0);
        ids.set_violation_count("u", 6, 0);
        ids.ban("u", BanTier::Temp, 5_000);

        assert_eq!(rl.check_limit("u", "g", "ping", 4_999).reason, Reason::TempBan);
        let d = rl.check_limit("u", "g", "ping", 5_001);
        assert!(d.allowed);
        assert_eq!(ids.get("u").unwrap().violation_count, 0);
    }

    #[test]
    fn reset_clears_windows_and_cooldowns() {
        let mut cfg = RateLimitConfig {
            user_requests_per_minute: 1,
            ..relaxed()
        };
        cfg.default_command_cooldown_ms = Some(60_000);
        let (rl, _) = limiter(cfg);
        assert!(rl.check_limit("u", "g", "ping", 0).allowed);
        assert!(!rl.check_limit("u", "g", "ping", 10).allowed);
        rl.reset("u");
        assert!(rl.check_limit("u", "g", "ping", 20).allowed);
    }
}
