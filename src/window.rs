//! src/window.rs
//! Liczniki okien przesuwnych per identity / scope / identity+komenda.
//!
//! Każdy odczyt przycina klucz, którego dotyka (najpierw prune, potem count), więc
//! wygasłe wpisy nie wpływają na decyzję, nawet gdy sweep jeszcze nie przeszedł.
//! Sweep tylko odzyskuje pamięć: stare wpisy i puste klucze.

use std::collections::VecDeque;

use dashmap::DashMap;

/// Milisekundy od epoki. Wszystkie timestampy w silniku są w tej jednostce.
pub type Millis = i64;

pub const MINUTE_MS: u64 = 60 * 1000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;

/// Zegar ścienny w [`Millis`]. Ewaluacje biorą timestamp zdarzenia; to jest
/// dla operacji admina i sweepa.
pub fn now_ms() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry<T> {
    pub timestamp: Millis,
    pub tag: T,
}

#[derive(Debug)]
pub struct WindowCounter<T> {
    entries: DashMap<String, VecDeque<WindowEntry<T>>>,
    /// Przycinanie nigdy nie schodzi poniżej tego horyzontu. Potrzebne, gdy jeden
    /// klucz pytamy o kilka zagnieżdżonych okien (minuta + godzina tej samej tożsamości).
    retention_ms: u64,
}

impl<T: Clone> Default for WindowCounter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> WindowCounter<T> {
    pub fn new() -> Self {
        Self::with_retention(0)
    }

    pub fn with_retention(retention_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            retention_ms,
        }
    }

    pub fn record(&self, key: &str, now: Millis, tag: T) {
        let mut q = self.entries.entry(key.to_owned()).or_default();
        q.push_back(WindowEntry { timestamp: now, tag });
    }

    /// Wpisy z `[now - window_ms, ∞)` dla `key`.
    pub fn count(&self, key: &str, now: Millis, window_ms: u64) -> usize {
        self.count_where(key, now, window_ms, |_| true)
    }

    pub fn count_where<F>(&self, key: &str, now: Millis, window_ms: u64, pred: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        self.with_window(key, now, window_ms, |cutoff, q| {
            q.iter()
                .filter(|e| e.timestamp >= cutoff && pred(&e.tag))
                .count()
        })
        .unwrap_or(0)
    }

    /// Kopia żywych wpisów, od najstarszego.
    pub fn entries(&self, key: &str, now: Millis, window_ms: u64) -> Vec<WindowEntry<T>> {
        self.with_window(key, now, window_ms, |cutoff, q| {
            q.iter()
                .filter(|e| e.timestamp >= cutoff)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Najstarszy timestamp wciąż w oknie; z niego liczymy `retry_after`.
    pub fn oldest(&self, key: &str, now: Millis, window_ms: u64) -> Option<Millis> {
        self.with_window(key, now, window_ms, |cutoff, q| {
            q.iter()
                .map(|e| e.timestamp)
                .filter(|ts| *ts >= cutoff)
                .min()
        })
        .flatten()
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Wyrzuca wpisy starsze niż `horizon_ms` i klucze, które zostały puste.
    /// Zwraca liczbę usuniętych wpisów.
    pub fn sweep(&self, now: Millis, horizon_ms: u64) -> usize {
        let cutoff = now.saturating_sub(horizon_ms.max(self.retention_ms) as i64);
        let mut removed = 0usize;
        self.entries.retain(|_, q| {
            let before = q.len();
            q.retain(|e| e.timestamp >= cutoff);
            removed += before - q.len();
            !q.is_empty()
        });
        removed
    }

    fn with_window<R>(
        &self,
        key: &str,
        now: Millis,
        window_ms: u64,
        f: impl FnOnce(Millis, &VecDeque<WindowEntry<T>>) -> R,
    ) -> Option<R> {
        let mut q = self.entries.get_mut(key)?;
        let prune_cutoff = now.saturating_sub(window_ms.max(self.retention_ms) as i64);
        q.retain(|e| e.timestamp >= prune_cutoff);
        let cutoff = now.saturating_sub(window_ms as i64);
        Some(f(cutoff, &q))
    }
}

/// Sekundy, aż najstarszy wpis wypadnie z okna (co najmniej 1).
pub fn retry_after_secs(oldest: Millis, window_ms: u64, now: Millis) -> u64 {
    let free_at = oldest.saturating_add(window_ms as i64);
    ceil_secs(free_at - now)
}

/// Zaokrągla różnicę w ms w górę do pełnych sekund, minimum 1.
pub fn ceil_secs(delta_ms: i64) -> u64 {
    if delta_ms <= 0 {
        return 1;
    }
    (((delta_ms as u64) + 999) / 1000).max(1)
}
