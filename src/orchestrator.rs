//! src/orchestrator.rs
//! Wejście dla każdego zdarzenia.
//!
//! Kolejność (taka sama dla komend, wiadomości i dołączeń):
//! emergency -> whitelist -> blacklist -> bypass admina -> detektor -> allow.
//!
//! Stan zmieniamy pod lockiem per klucz (identity dla komend/wiadomości, scope
//! dla komend i dołączeń). Egzekucja leci po zwolnieniu locka, a jej błędy
//! nie zmieniają decyzji.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::config::ShieldConfig;
use crate::decision::{Category, Decision, EnforcementAction, Reason, Severity};
use crate::enforcer::{Enforcer, NotifyPayload};
use crate::error::{ConfigurationError, EnforcementError, EvaluationError};
use crate::event::{ActivityEvent, EventKind};
use crate::identity::{DecayPolicy, EscalationTier, Identity, IdentityStore, IdentitySweep};
use crate::locks::KeyedLocks;
use crate::raid::{JoinInput, LockdownRecord, RaidDetector};
use crate::rate_limiter::RateLimiter;
use crate::spam::{MessageInput, SpamDetector};
use crate::window::{Millis, now_ms};

/// Wpis blacklisty / whitelisty dotyczy jednej tożsamości albo całego scope'u.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Identity,
    Scope,
}

/// Jedna końcowa decyzja, tak jak trzymamy ją w ograniczonym logu.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub timestamp: Millis,
    pub kind: EventKind,
    pub identity_id: String,
    pub scope_id: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShieldStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub by_category: BTreeMap<Category, u64>,
    pub evaluation_errors: u64,
    pub enforcement_failures: u64,
    pub emergency_mode: bool,
    pub tracked_identities: usize,
    pub tracked_keys: usize,
    pub active_lockdowns: usize,
    pub blacklist_size: usize,
    pub whitelist_size: usize,
    pub admins: usize,
    pub log_size: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityStatus {
    pub tier: EscalationTier,
    #[serde(flatten)]
    pub identity: Identity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub window_entries_removed: usize,
    pub identities: IdentitySweep,
    pub lockdowns_cleared: usize,
    pub locks_pruned: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    blocked: AtomicU64,
    evaluation_errors: AtomicU64,
    enforcement_failures: AtomicU64,
    by_category: DashMap<Category, u64>,
}

pub struct SecurityOrchestrator {
    cfg: ShieldConfig,
    identities: Arc<IdentityStore>,
    rate_limiter: RateLimiter,
    spam: SpamDetector,
    raid: RaidDetector,
    enforcer: Option<Arc<dyn Enforcer>>,

    identity_locks: KeyedLocks,
    scope_locks: KeyedLocks,

    blacklist: DashSet<(ListKind, String)>,
    whitelist: DashSet<(ListKind, String)>,
    admins: DashSet<String>,
    emergency: AtomicBool,

    log: Mutex<VecDeque<SecurityEvent>>,
    counters: Counters,
    /// Najnowszy widziany timestamp zdarzenia; `Millis::MIN` do pierwszego zdarzenia.
    event_clock: AtomicI64,
}

impl std::fmt::Debug for SecurityOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityOrchestrator")
            .field("identities", &self.identities.len())
            .field("rate_limiter", &self.rate_limiter)
            .field("emergency", &self.emergency.load(Ordering::Relaxed))
            .field("has_enforcer", &self.enforcer.is_some())
            .finish_non_exhaustive()
    }
}

impl SecurityOrchestrator {
    pub fn new(cfg: ShieldConfig) -> Result<Self, ConfigurationError> {
        cfg.validate()?;
        let identities = Arc::new(IdentityStore::new());
        let admins = DashSet::new();
        for id in &cfg.orchestrator.admin_ids {
            admins.insert(id.clone());
        }
        Ok(Self {
            rate_limiter: RateLimiter::new(cfg.rate_limit.clone(), identities.clone()),
            spam: SpamDetector::new(cfg.spam.clone(), identities.clone()),
            raid: RaidDetector::new(cfg.raid.clone()),
            identities,
            enforcer: None,
            identity_locks: KeyedLocks::new(),
            scope_locks: KeyedLocks::new(),
            blacklist: DashSet::new(),
            whitelist: DashSet::new(),
            admins,
            emergency: AtomicBool::new(cfg.orchestrator.emergency_mode),
            log: Mutex::new(VecDeque::with_capacity(cfg.orchestrator.max_log_size.min(1_024))),
            counters: Counters::default(),
            event_clock: AtomicI64::new(Millis::MIN),
            cfg,
        })
    }

    pub fn with_enforcer(mut self, enforcer: Arc<dyn Enforcer>) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    pub fn config(&self) -> &ShieldConfig {
        &self.cfg
    }

    /* =========================================
       Evaluation
       ========================================= */

    /// Rozdziela po `event.kind`.
    pub async fn evaluate(&self, event: &ActivityEvent) -> Decision {
        self.run(event, event.kind).await
    }

    pub async fn evaluate_command(&self, event: &ActivityEvent) -> Decision {
        self.run(event, EventKind::Command).await
    }

    pub async fn evaluate_message(&self, event: &ActivityEvent) -> Decision {
        self.run(event, EventKind::Message).await
    }

    pub async fn evaluate_join(&self, event: &ActivityEvent) -> Decision {
        self.run(event, EventKind::Join).await
    }

    async fn run(&self, event: &ActivityEvent, entry: EventKind) -> Decision {
        let decision = {
            // zawsze najpierw identity, potem scope
            let _identity_guard = match entry {
                EventKind::Command | EventKind::Message => {
                    Some(self.identity_locks.lock(&event.identity_id).await)
                }
                EventKind::Join => None,
            };
            // komendy dzielą okno limitu całego scope'u
            let _scope_guard = match entry {
                EventKind::Command | EventKind::Join => {
                    Some(self.scope_locks.lock(&event.scope_id).await)
                }
                EventKind::Message => None,
            };

            let decision = match guarded(self.decide(event, entry)).await {
                Ok(d) => d,
                Err(e) => {
                    self.counters.evaluation_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        identity = %event.identity_id,
                        scope = %event.scope_id,
                        kind = entry.as_str(),
                        error = %e,
                        "evaluation failed, allowing"
                    );
                    Decision::allow(Reason::EvaluationError)
                }
            };
            self.record(event, entry, &decision);
            decision
        };

        self.enforce(event, &decision).await;
        decision
    }

    async fn decide(
        &self,
        event: &ActivityEvent,
        entry: EventKind,
    ) -> Result<Decision, EvaluationError> {
        event.expect_kind(entry)?;
        let now = event.timestamp;
        let is_admin = event.is_admin || self.admins.contains(&event.identity_id);

        if self.emergency.load(Ordering::Relaxed) && !is_admin {
            return Ok(Decision::block(
                Reason::EmergencyMode,
                Severity::High,
                "The server is in emergency mode. Only administrators can act right now.",
            )
            .maybe_action(gate_action(entry)));
        }

        if self.listed(&self.whitelist, event) {
            return Ok(Decision::allow(Reason::Whitelisted));
        }

        if self.listed(&self.blacklist, event) {
            return Ok(Decision::block(
                Reason::Blacklisted,
                Severity::Critical,
                "You are not allowed to do that here.",
            )
            .maybe_action(gate_action(entry)));
        }

        if is_admin {
            return Ok(Decision::allow(Reason::AdminBypass));
        }

        let decision = match entry {
            EventKind::Command => {
                let command = event.require_command()?;
                self.rate_limiter
                    .check_limit(&event.identity_id, &event.scope_id, command, now)
            }
            EventKind::Message => {
                let content = event.require_content()?;
                self.spam.check_message(MessageInput {
                    identity_id: &event.identity_id,
                    scope_id: &event.scope_id,
                    content,
                    mention_count: event.mention_count,
                    link_count: event.link_count,
                    now,
                })
            }
            EventKind::Join => {
                if let Some(created) = event.account_created_at {
                    self.identities
                        .set_created_at(&event.identity_id, created, now);
                }
                self.raid.check_join(JoinInput {
                    identity_id: &event.identity_id,
                    scope_id: &event.scope_id,
                    display_name: event.display_name.as_deref(),
                    account_created_at: event.account_created_at,
                    has_avatar: event.has_avatar,
                    now,
                })
            }
        };
        Ok(decision)
    }

    fn listed(&self, list: &DashSet<(ListKind, String)>, event: &ActivityEvent) -> bool {
        list.contains(&(ListKind::Identity, event.identity_id.clone()))
            || list.contains(&(ListKind::Scope, event.scope_id.clone()))
    }

    fn record(&self, event: &ActivityEvent, entry: EventKind, decision: &Decision) {
        self.event_clock.fetch_max(event.timestamp, Ordering::Relaxed);
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if !decision.allowed {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
        }
        *self
            .counters
            .by_category
            .entry(decision.reason.category())
            .or_insert(0) += 1;

        let mut log = self.log.lock().unwrap_or_else(|p| p.into_inner());
        while log.len() >= self.cfg.orchestrator.max_log_size {
            log.pop_front();
        }
        log.push_back(SecurityEvent {
            timestamp: event.timestamp,
            kind: entry,
            identity_id: event.identity_id.clone(),
            scope_id: event.scope_id.clone(),
            decision: decision.clone(),
        });
    }

    /* =========================================
       Enforcement
       ========================================= */

    async fn enforce(&self, event: &ActivityEvent, decision: &Decision) {
        let (Some(enforcer), Some(action)) = (self.enforcer.as_ref(), decision.action) else {
            return;
        };
        let scope = event.scope_id.as_str();
        let who = event.identity_id.as_str();
        let reason = decision.reason.as_str();

        match action {
            EnforcementAction::DeleteMessage => {
                let r = enforcer.delete_content(&event.content_ref()).await;
                self.swallow("delete_content", event, r);
            }
            EnforcementAction::Mute => {
                let r = enforcer.delete_content(&event.content_ref()).await;
                self.swallow("delete_content", event, r);
                let r = enforcer
                    .mute(scope, who, self.cfg.spam.mute_duration_ms, reason)
                    .await;
                self.swallow("mute", event, r);
            }
            EnforcementAction::Kick => {
                let r = enforcer.kick(scope, who, reason).await;
                self.swallow("kick", event, r);
            }
            EnforcementAction::Lockdown => {
                let r = enforcer.kick(scope, who, reason).await;
                self.swallow("kick", event, r);
                let payload = NotifyPayload {
                    reason: decision.reason,
                    severity: decision.severity.unwrap_or(Severity::High),
                    message: decision.message.clone().unwrap_or_default(),
                    lockdown_until: self
                        .raid
                        .active_lockdown(scope, event.timestamp)
                        .map(|l| l.until),
                    triggered_by: who.to_owned(),
                };
                let r = enforcer.notify(scope, &payload).await;
                self.swallow("notify", event, r);
            }
            // wołający widzi to w samej decyzji
            EnforcementAction::Warn | EnforcementAction::TempBan | EnforcementAction::PermaBan => {}
        }
    }

    fn swallow(&self, op: &'static str, event: &ActivityEvent, r: Result<(), EnforcementError>) {
        if let Err(e) = r {
            self.counters
                .enforcement_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                op,
                identity = %event.identity_id,
                scope = %event.scope_id,
                error = %e,
                "enforcement failed"
            );
        }
    }

    /* =========================================
       Admin operations
       ========================================= */

    pub fn add_to_blacklist(&self, kind: ListKind, id: &str) -> bool {
        tracing::info!(?kind, %id, "blacklist add");
        self.blacklist.insert((kind, id.to_owned()))
    }

    pub fn remove_from_blacklist(&self, kind: ListKind, id: &str) -> bool {
        self.blacklist.remove(&(kind, id.to_owned())).is_some()
    }

    pub fn add_to_whitelist(&self, kind: ListKind, id: &str) -> bool {
        tracing::info!(?kind, %id, "whitelist add");
        self.whitelist.insert((kind, id.to_owned()))
    }

    pub fn remove_from_whitelist(&self, kind: ListKind, id: &str) -> bool {
        self.whitelist.remove(&(kind, id.to_owned())).is_some()
    }

    pub fn is_blacklisted(&self, kind: ListKind, id: &str) -> bool {
        self.blacklist.contains(&(kind, id.to_owned()))
    }

    pub fn is_whitelisted(&self, kind: ListKind, id: &str) -> bool {
        self.whitelist.contains(&(kind, id.to_owned()))
    }

    pub fn add_admin(&self, id: &str) -> bool {
        self.admins.insert(id.to_owned())
    }

    pub fn remove_admin(&self, id: &str) -> bool {
        self.admins.remove(id).is_some()
    }

    pub fn is_admin(&self, id: &str) -> bool {
        self.admins.contains(id)
    }

    /// Zapomina naruszenia, bany, ostrzeżenia i okna jednej tożsamości.
    pub fn reset_identity(&self, id: &str) -> bool {
        let existed = self.identities.remove(id);
        self.rate_limiter.reset(id);
        self.spam.reset(id);
        tracing::info!(identity = %id, existed, "identity reset");
        existed
    }

    /// Przełącza tryb awaryjny i zwraca nowy stan.
    pub fn toggle_emergency_mode(&self) -> bool {
        let on = !self.emergency.fetch_xor(true, Ordering::SeqCst);
        tracing::warn!(on, "emergency mode toggled");
        on
    }

    pub fn set_emergency_mode(&self, on: bool) {
        self.emergency.store(on, Ordering::SeqCst);
        tracing::warn!(on, "emergency mode set");
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.emergency.load(Ordering::Relaxed)
    }

    pub fn enable_lockdown(&self, scope_id: &str, duration_ms: Option<u64>) -> LockdownRecord {
        self.enable_lockdown_at(scope_id, duration_ms, now_ms())
    }

    /// [`Self::enable_lockdown`] na zegarze zdarzeń zamiast ściennego.
    pub fn enable_lockdown_at(
        &self,
        scope_id: &str,
        duration_ms: Option<u64>,
        now: Millis,
    ) -> LockdownRecord {
        self.raid.enable_lockdown(scope_id, duration_ms, now)
    }

    pub fn disable_lockdown(&self, scope_id: &str) -> bool {
        self.raid.disable_lockdown(scope_id)
    }

    pub fn is_in_lockdown(&self, scope_id: &str) -> bool {
        self.is_in_lockdown_at(scope_id, now_ms())
    }

    pub fn is_in_lockdown_at(&self, scope_id: &str, now: Millis) -> bool {
        self.raid.is_in_lockdown(scope_id, now)
    }

    pub fn lockdown(&self, scope_id: &str, now: Millis) -> Option<LockdownRecord> {
        self.raid.active_lockdown(scope_id, now)
    }

    pub fn active_lockdowns(&self, now: Millis) -> Vec<(String, LockdownRecord)> {
        self.raid.active_lockdowns(now)
    }

    pub fn identity_status(&self, id: &str, now: Millis) -> Option<IdentityStatus> {
        let identity = self.identities.get(id)?;
        Some(IdentityStatus {
            tier: identity.tier(now, self.cfg.rate_limit.warning_threshold),
            identity,
        })
    }

    /// Lockdowny liczymy względem najnowszego timestampu zdarzenia, a zanim
    /// jakieś przyjdzie, względem zegara ściennego.
    pub fn get_stats(&self) -> ShieldStats {
        let clock = self.event_clock.load(Ordering::Relaxed);
        self.get_stats_at(if clock == Millis::MIN { now_ms() } else { clock })
    }

    pub fn get_stats_at(&self, now: Millis) -> ShieldStats {
        let total = self.counters.total.load(Ordering::Relaxed);
        let blocked = self.counters.blocked.load(Ordering::Relaxed);
        let by_category = self
            .counters
            .by_category
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        let log_size = self.log.lock().map(|l| l.len()).unwrap_or_else(|p| p.into_inner().len());

        ShieldStats {
            total_requests: total,
            allowed_requests: total.saturating_sub(blocked),
            blocked_requests: blocked,
            by_category,
            evaluation_errors: self.counters.evaluation_errors.load(Ordering::Relaxed),
            enforcement_failures: self.counters.enforcement_failures.load(Ordering::Relaxed),
            emergency_mode: self.is_emergency_mode(),
            tracked_identities: self.identities.len(),
            tracked_keys: self.rate_limiter.tracked_keys()
                + self.spam.tracked_keys()
                + self.raid.tracked_keys(),
            active_lockdowns: self.raid.active_lockdowns(now).len(),
            blacklist_size: self.blacklist.len(),
            whitelist_size: self.whitelist.len(),
            admins: self.admins.len(),
            log_size,
        }
    }

    /// Od najnowszych, najwyżej `limit`.
    pub fn get_recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        let log = self.log.lock().unwrap_or_else(|p| p.into_inner());
        log.iter().rev().take(limit).cloned().collect()
    }

    /* =========================================
       Sweep
       ========================================= */

    /// Odzyskuje pamięć. Nigdy nie zdejmuje aktywnego bana ani lockdownu.
    pub fn sweep(&self, now: Millis) -> SweepReport {
        let horizon = self.cfg.sweep.retention_ms.max(self.cfg.longest_window_ms());
        let raid = self.raid.sweep(now, horizon);
        let window_entries_removed = self.rate_limiter.sweep(now, horizon)
            + self.spam.sweep(now, horizon)
            + raid.entries_removed;
        let identities = self.identities.sweep(
            now,
            &DecayPolicy {
                violation_decay_ms: self.cfg.sweep.violation_decay_ms,
                warning_decay_ms: self.cfg.spam.warning_decay_ms,
                identity_idle_ms: self.cfg.sweep.identity_idle_ms,
            },
        );
        let locks_pruned = self.identity_locks.prune_idle() + self.scope_locks.prune_idle();

        SweepReport {
            window_entries_removed,
            identities,
            lockdowns_cleared: raid.lockdowns_cleared,
            locks_pruned,
        }
    }
}

/// Akcja dla odrzuceń na bramce, żeby zablokowany raider i tak wyleciał.
fn gate_action(entry: EventKind) -> Option<EnforcementAction> {
    match entry {
        EventKind::Command => None,
        EventKind::Message => Some(EnforcementAction::DeleteMessage),
        EventKind::Join => Some(EnforcementAction::Kick),
    }
}

/// Odpala future ewaluacji; panic zamienia na [`EvaluationError::Panicked`].
async fn guarded<F>(fut: F) -> Result<Decision, EvaluationError>
where
    F: std::future::Future<Output = Result<Decision, EvaluationError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(r) => r,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(EvaluationError::Panicked(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shield() -> SecurityOrchestrator {
        SecurityOrchestrator::new(ShieldConfig::default()).unwrap()
    }

    async fn explode() -> Result<Decision, EvaluationError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panics_become_evaluation_errors() {
        let r = guarded(explode()).await;
        assert_eq!(r, Err(EvaluationError::Panicked("boom".into())));
    }

    #[tokio::test]
    async fn wrong_kind_fails_open() {
        let s = shield();
        let ev = ActivityEvent::join("u", "g", 0);
        let d = s.evaluate_command(&ev).await;
        assert!(d.allowed);
        assert_eq!(d.reason, Reason::EvaluationError);
        assert!(d.message.is_none());
        assert_eq!(s.get_stats().evaluation_errors, 1);
    }

    #[tokio::test]
    async fn precedence_order() {
        let s = shield();
        let ev = ActivityEvent::command("u", "g", 0, "ping");

        s.add_to_blacklist(ListKind::Identity, "u");
        assert_eq!(s.evaluate(&ev).await.reason, Reason::Blacklisted);

        // whitelist wygrywa z blacklistą
        s.add_to_whitelist(ListKind::Scope, "g");
        assert_eq!(s.evaluate(&ev).await.reason, Reason::Whitelisted);

        // emergency wygrywa ze wszystkim poza adminami
        s.toggle_emergency_mode();
        assert_eq!(s.evaluate(&ev).await.reason, Reason::EmergencyMode);
        assert_eq!(s.evaluate(&ev.clone().as_admin()).await.reason, Reason::Whitelisted);
    }

    #[tokio::test]
    async fn admins_bypass_detectors() {
        let s = shield();
        s.add_admin("boss");
        for i in 0..50 {
            let d = s
                .evaluate(&ActivityEvent::command("boss", "g", i, "ping"))
                .await;
            assert_eq!(d.reason, Reason::AdminBypass);
        }
        assert!(s.remove_admin("boss"));
    }

    #[tokio::test]
    async fn log_is_bounded_and_newest_first() {
        let mut cfg = ShieldConfig::default();
        cfg.orchestrator.max_log_size = 3;
        cfg.rate_limit.burst_limit = 100;
        let s = SecurityOrchestrator::new(cfg).unwrap();
        for i in 0..5 {
            s.evaluate(&ActivityEvent::command(&format!("u{i}"), "g", i, "ping"))
                .await;
        }
        let recent = s.get_recent_events(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].identity_id, "u4");
        assert_eq!(recent[2].identity_id, "u2");
        let stats = s.get_stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.by_category.get(&Category::Allowed), Some(&5));
    }

    #[tokio::test]
    async fn sweep_keeps_active_lockdown() {
        let s = shield();
        s.enable_lockdown_at("g", Some(3_600_000), 0);
        let report = s.sweep(10);
        assert_eq!(report.lockdowns_cleared, 0);
        assert!(s.is_in_lockdown_at("g", 10));
    }

    #[tokio::test]
    async fn stats_count_lockdowns_on_the_event_clock() {
        let mut cfg = ShieldConfig::default();
        cfg.raid.suspicious_join_count = 2;
        let s = SecurityOrchestrator::new(cfg).unwrap();

        // historyczne timestampy, daleko za zegarem ściennym
        s.evaluate_join(&ActivityEvent::join("a", "g", 1_000)).await;
        s.evaluate_join(&ActivityEvent::join("b", "g", 2_000)).await;
        let d = s.evaluate_join(&ActivityEvent::join("c", "g", 3_000)).await;
        assert_eq!(d.reason, Reason::Lockdown);

        assert_eq!(s.get_stats().active_lockdowns, 1);
        assert_eq!(s.get_stats_at(now_ms()).active_lockdowns, 0);
    }
}
