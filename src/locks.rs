//! src/locks.rs
//! Asynchroniczne locki per klucz. Ewaluacje tej samej tożsamości (albo tego
//! samego scope'u) idą po kolei; różne klucze się nie blokują.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Czeka na lock klucza. Guard zwalnia go przy dropie.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        // klonujemy Arc, żeby nie trzymać locka sharda przez await
        let m = self
            .locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        m.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Wyrzuca locki, których nikt nie trzyma ani na nie nie czeka. Zwraca ile usunięto.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        // strong_count == 1: trzyma go tylko mapa
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        before - self.locks.len()
    }
}
