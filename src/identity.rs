//! src/identity.rs
//! Stan per tożsamość, wspólny dla limitera (naruszenia / bany), detektora spamu
//! (ostrzeżenia) i sweepa. Tworzony przy pierwszym kontakcie, sprzątany po bezczynności.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;

use crate::decision::{Reason, Severity};
use crate::window::Millis;

const MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BanTier {
    Temp,
    Perma,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationTier {
    Clean,
    Warned,
    TempBlocked,
    PermaBlocked,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub reason: Reason,
    pub severity: Severity,
    pub timestamp: Millis,
    pub scope_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub violation_count: u32,
    pub last_violation_at: Option<Millis>,
    pub ban_until: Option<Millis>,
    pub ban_tier: Option<BanTier>,
    pub warnings: u32,
    pub last_warning_at: Option<Millis>,
    pub created_at: Option<Millis>,
    pub last_seen_at: Millis,
    pub history: VecDeque<ViolationRecord>,
}

impl Identity {
    fn new(id: &str, now: Millis) -> Self {
        Self {
            id: id.to_owned(),
            violation_count: 0,
            last_violation_at: None,
            ban_until: None,
            ban_tier: None,
            warnings: 0,
            last_warning_at: None,
            created_at: None,
            last_seen_at: now,
            history: VecDeque::new(),
        }
    }

    pub fn is_banned(&self, now: Millis) -> bool {
        self.ban_until.is_some_and(|until| now < until)
    }

    pub fn tier(&self, now: Millis, warning_threshold: u32) -> EscalationTier {
        if self.is_banned(now) {
            return match self.ban_tier {
                Some(BanTier::Perma) => EscalationTier::PermaBlocked,
                _ => EscalationTier::TempBlocked,
            };
        }
        if self.violation_count >= warning_threshold {
            EscalationTier::Warned
        } else {
            EscalationTier::Clean
        }
    }

    /// Wygaśnięcie bana wybacza: czyści bana i zeruje `violation_count`.
    /// Zwraca true, gdy wyczyszczono wygasły ban.
    fn clear_expired_ban(&mut self, now: Millis) -> bool {
        match self.ban_until {
            Some(until) if now >= until => {
                self.ban_until = None;
                self.ban_tier = None;
                self.violation_count = 0;
                true
            }
            _ => false,
        }
    }

    fn push_history(&mut self, record: ViolationRecord) {
        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

/// Wynik [`IdentityStore::record_warning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningOutcome {
    Warned { count: u32 },
    /// Licznik doszedł do limitu i został wyzerowany.
    Muted,
}

#[derive(Debug, Default)]
pub struct IdentityStore {
    identities: DashMap<String, Identity>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notuje aktywność, leniwie czyści wygasły ban i zwraca aktywny, jeśli jest.
    pub fn touch(&self, id: &str, now: Millis) -> Option<(Millis, BanTier)> {
        let mut ident = self
            .identities
            .entry(id.to_owned())
            .or_insert_with(|| Identity::new(id, now));
        ident.last_seen_at = ident.last_seen_at.max(now);
        if ident.clear_expired_ban(now) {
            tracing::info!(identity = %id, "ban expired, violations forgiven");
        }
        match (ident.ban_until, ident.ban_tier) {
            (Some(until), Some(tier)) => Some((until, tier)),
            _ => None,
        }
    }

    pub fn set_created_at(&self, id: &str, created_at: Millis, now: Millis) {
        let mut ident = self
            .identities
            .entry(id.to_owned())
            .or_insert_with(|| Identity::new(id, now));
        ident.created_at = Some(created_at);
    }

    /// Dopisuje naruszenie i zwraca nowy licznik.
    pub fn record_violation(
        &self,
        id: &str,
        scope_id: &str,
        reason: Reason,
        severity: Severity,
        now: Millis,
    ) -> u32 {
        let mut ident = self
            .identities
            .entry(id.to_owned())
            .or_insert_with(|| Identity::new(id, now));
        ident.violation_count = ident.violation_count.saturating_add(1);
        ident.last_violation_at = Some(now);
        ident.push_history(ViolationRecord {
            reason,
            severity,
            timestamp: now,
            scope_id: scope_id.to_owned(),
        });
        ident.violation_count
    }

    pub fn ban(&self, id: &str, tier: BanTier, until: Millis) {
        if let Some(mut ident) = self.identities.get_mut(id) {
            ident.ban_until = Some(until);
            ident.ban_tier = Some(tier);
        }
    }

    pub fn record_warning(&self, id: &str, max_warnings: u32, now: Millis) -> WarningOutcome {
        let mut ident = self
            .identities
            .entry(id.to_owned())
            .or_insert_with(|| Identity::new(id, now));
        ident.warnings = ident.warnings.saturating_add(1);
        ident.last_warning_at = Some(now);
        if ident.warnings >= max_warnings {
            ident.warnings = 0;
            WarningOutcome::Muted
        } else {
            WarningOutcome::Warned {
                count: ident.warnings,
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Identity> {
        self.identities.get(id).map(|e| e.clone())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.identities.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn set_violation_count(&self, id: &str, count: u32, now: Millis) {
        let mut ident = self
            .identities
            .entry(id.to_owned())
            .or_insert_with(|| Identity::new(id, now));
        ident.violation_count = count;
        ident.last_violation_at = Some(now);
    }

    /// Wygasza stare liczniki i zapomina bezczynne tożsamości. Aktywnych banów nie ruszamy.
    pub fn sweep(&self, now: Millis, policy: &DecayPolicy) -> IdentitySweep {
        let mut report = IdentitySweep::default();
        self.identities.retain(|_, ident| {
            let banned = ident.is_banned(now);
            if !banned {
                if ident.clear_expired_ban(now) {
                    report.bans_expired += 1;
                }
                let stale_violation = ident
                    .last_violation_at
                    .is_none_or(|t| now - t >= policy.violation_decay_ms as i64);
                if ident.violation_count > 0 && stale_violation {
                    ident.violation_count = 0;
                    ident.history.clear();
                    report.violations_decayed += 1;
                }
            }
            let stale_warning = ident
                .last_warning_at
                .is_none_or(|t| now - t >= policy.warning_decay_ms as i64);
            if ident.warnings > 0 && stale_warning {
                ident.warnings = 0;
                report.warnings_decayed += 1;
            }

            let idle = now - ident.last_seen_at >= policy.identity_idle_ms as i64;
            let empty = ident.violation_count == 0 && ident.warnings == 0;
            if !banned && idle && empty {
                report.reclaimed += 1;
                return false;
            }
            true
        });
        report
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecayPolicy {
    pub violation_decay_ms: u64,
    pub warning_decay_ms: u64,
    pub identity_idle_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySweep {
    pub bans_expired: usize,
    pub violations_decayed: usize,
    pub warnings_decayed: usize,
    pub reclaimed: usize,
}
