//! src/raid.rs
//! Tempo dołączeń per scope, scoring podejrzanych kont i maszyna stanów lockdownu.
//! Dopóki lockdown trwa, każde dołączenie jest odrzucane.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::RaidConfig;
use crate::decision::{Decision, EnforcementAction, Reason, Severity};
use crate::similarity::{normalize_name, similarity};
use crate::window::{HOUR_MS, MINUTE_MS, Millis, WindowCounter, ceil_secs};

static RE_GENERIC_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z]+(?:\d+)?$").unwrap());

#[derive(Debug, Clone)]
struct JoinRecord {
    identity_id: String,
    /// Znormalizowana nazwa; None, gdy brak albo pusta po normalizacji.
    name: Option<String>,
    new_account: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockdownRecord {
    pub started_at: Millis,
    pub until: Millis,
    pub reason: Reason,
    pub manual: bool,
}

impl LockdownRecord {
    pub fn is_active(&self, now: Millis) -> bool {
        now < self.until
    }
}

/// Pola dołączenia, które czyta detektor.
#[derive(Debug, Clone, Copy)]
pub struct JoinInput<'a> {
    pub identity_id: &'a str,
    pub scope_id: &'a str,
    pub display_name: Option<&'a str>,
    pub account_created_at: Option<Millis>,
    pub has_avatar: Option<bool>,
    pub now: Millis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidSweep {
    pub entries_removed: usize,
    pub lockdowns_cleared: usize,
}

#[derive(Debug)]
pub struct RaidDetector {
    cfg: RaidConfig,
    joins: WindowCounter<JoinRecord>,
    lockdowns: DashMap<String, LockdownRecord>,
}

impl RaidDetector {
    pub fn new(cfg: RaidConfig) -> Self {
        let retention = [
            HOUR_MS,
            cfg.suspicious_join_window_ms,
            cfg.new_account_window_ms,
            cfg.check_similarity_window_ms,
        ]
        .into_iter()
        .max()
        .unwrap_or(HOUR_MS);
        Self {
            joins: WindowCounter::with_retention(retention),
            lockdowns: DashMap::new(),
            cfg,
        }
    }

    pub fn config(&self) -> &RaidConfig {
        &self.cfg
    }

    pub fn check_join(&self, input: JoinInput<'_>) -> Decision {
        let c = &self.cfg;
        let JoinInput {
            identity_id,
            scope_id,
            now,
            ..
        } = input;

        /* ==== 1. lockdown ==== */
        if let Some(lock) = self.active_lockdown(scope_id, now) {
            let retry = ceil_secs(lock.until - now);
            return Decision::block(
                Reason::Lockdown,
                Severity::High,
                format!("This server is in lockdown. Try joining again in {retry} seconds."),
            )
            .retry_after(retry)
            .with_action(EnforcementAction::Kick);
        }

        /* ==== 2. join rate ==== */
        let new_account = input
            .account_created_at
            .is_some_and(|created| now - created < c.new_account_threshold_ms as i64);
        let name = input
            .display_name
            .map(normalize_name)
            .filter(|n| !n.is_empty());
        self.joins.record(
            scope_id,
            now,
            JoinRecord {
                identity_id: identity_id.to_owned(),
                name: name.clone(),
                new_account,
            },
        );

        let burst = self.joins.count(scope_id, now, c.suspicious_join_window_ms);
        if burst >= c.suspicious_join_count as usize {
            return self.raid(scope_id, identity_id, Reason::MassJoin, Severity::Critical, burst, now);
        }
        let per_minute = self.joins.count(scope_id, now, MINUTE_MS);
        if per_minute >= c.max_joins_per_minute as usize {
            return self.raid(scope_id, identity_id, Reason::RaidDetected, Severity::High, per_minute, now);
        }
        let per_hour = self.joins.count(scope_id, now, HOUR_MS);
        if per_hour >= c.max_joins_per_hour as usize {
            return self.raid(scope_id, identity_id, Reason::JoinSpike, Severity::Medium, per_hour, now);
        }

        /* ==== 3. suspicion score ==== */
        let mut flags: Vec<&'static str> = Vec::new();

        if new_account {
            let recent_new = self
                .joins
                .count_where(scope_id, now, c.new_account_window_ms, |j| j.new_account);
            if recent_new >= c.new_account_max_joins as usize {
                flags.push("new account");
            }
        }

        if let Some(name) = name.as_deref() {
            let recent = self.joins.entries(scope_id, now, c.check_similarity_window_ms);
            let similar = recent
                .iter()
                .filter(|e| e.tag.identity_id != identity_id)
                .filter_map(|e| e.tag.name.as_deref())
                .filter(|other| similarity(name, other) >= c.similarity_threshold)
                .count();
            let generic = RE_GENERIC_NAME.is_match(name) && {
                let matching = recent
                    .iter()
                    .filter_map(|e| e.tag.name.as_deref())
                    .filter(|n| RE_GENERIC_NAME.is_match(n))
                    .count();
                matching >= c.generic_name_min_joins as usize
            };
            if similar >= c.similar_name_min_joins as usize || generic {
                flags.push("suspicious name");
            }
        }

        if input.has_avatar == Some(false) {
            flags.push("no avatar");
        }

        if flags.len() >= c.suspicion_threshold as usize {
            tracing::info!(
                scope = %scope_id,
                identity = %identity_id,
                score = flags.len(),
                flags = ?flags,
                "suspicious joiner"
            );
            return Decision::block(
                Reason::SuspiciousAccount,
                Severity::Medium,
                format!("Your account looks suspicious ({}).", flags.join(", ")),
            )
            .with_action(EnforcementAction::Kick);
        }

        Decision::allow(Reason::Allowed)
    }

    fn raid(
        &self,
        scope_id: &str,
        identity_id: &str,
        reason: Reason,
        severity: Severity,
        joins: usize,
        now: Millis,
    ) -> Decision {
        let until = now.saturating_add(self.cfg.lockdown_duration_ms as i64);
        // wygrywa pierwszy raid; aktywnego lockdownu nie przesuwamy
        let lock = self
            .lockdowns
            .entry(scope_id.to_owned())
            .and_modify(|l| {
                if !l.is_active(now) {
                    *l = LockdownRecord {
                        started_at: now,
                        until,
                        reason,
                        manual: false,
                    };
                }
            })
            .or_insert_with(|| LockdownRecord {
                started_at: now,
                until,
                reason,
                manual: false,
            })
            .clone();
        tracing::warn!(
            scope = %scope_id,
            identity = %identity_id,
            %reason,
            joins,
            until = lock.until,
            "raid detected, scope locked down"
        );

        Decision::block(
            reason,
            severity,
            format!("Too many accounts are joining right now ({joins}). The server is in lockdown."),
        )
        .retry_after(ceil_secs(lock.until - now))
        .with_action(EnforcementAction::Lockdown)
    }

    /// Aktywny lockdown dla `scope_id`; wygasły czyścimy po drodze.
    pub fn active_lockdown(&self, scope_id: &str, now: Millis) -> Option<LockdownRecord> {
        if self
            .lockdowns
            .remove_if(scope_id, |_, l| !l.is_active(now))
            .is_some()
        {
            tracing::info!(scope = %scope_id, "lockdown expired");
        }
        self.lockdowns.get(scope_id).map(|l| l.clone())
    }

    pub fn is_in_lockdown(&self, scope_id: &str, now: Millis) -> bool {
        self.active_lockdown(scope_id, now).is_some()
    }

    /// Ręczny lockdown. Zastępuje to, co aktualnie trwa.
    pub fn enable_lockdown(
        &self,
        scope_id: &str,
        duration_ms: Option<u64>,
        now: Millis,
    ) -> LockdownRecord {
        let duration = duration_ms.unwrap_or(self.cfg.lockdown_duration_ms);
        let rec = LockdownRecord {
            started_at: now,
            until: now.saturating_add(duration as i64),
            reason: Reason::Lockdown,
            manual: true,
        };
        self.lockdowns.insert(scope_id.to_owned(), rec.clone());
        tracing::warn!(scope = %scope_id, until = rec.until, "lockdown enabled manually");
        rec
    }

    /// Zwraca true, jeśli lockdown był aktywny.
    pub fn disable_lockdown(&self, scope_id: &str) -> bool {
        let removed = self.lockdowns.remove(scope_id).is_some();
        if removed {
            tracing::warn!(scope = %scope_id, "lockdown disabled");
        }
        removed
    }

    pub fn active_lockdowns(&self, now: Millis) -> Vec<(String, LockdownRecord)> {
        let mut out: Vec<_> = self
            .lockdowns
            .iter()
            .filter(|e| e.value().is_active(now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn sweep(&self, now: Millis, horizon_ms: u64) -> RaidSweep {
        let entries_removed = self.joins.sweep(now, horizon_ms);
        let before = self.lockdowns.len();
        self.lockdowns.retain(|_, l| l.is_active(now));
        RaidSweep {
            entries_removed,
            lockdowns_cleared: before - self.lockdowns.len(),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.joins.key_count() + self.lockdowns.len()
    }
}
