// src/lib.rs

pub mod config;
pub mod decision;
pub mod enforcer;
pub mod error;
pub mod event;
pub mod identity;
pub mod locks;
pub mod logging;
pub mod orchestrator;
pub mod raid;
pub mod rate_limiter;
pub mod replay;
pub mod similarity;
pub mod spam;
pub mod sweeper;
pub mod window;

pub use decision::{Decision, EnforcementAction, Reason, Severity};
pub use event::{ActivityEvent, EventKind};
pub use orchestrator::SecurityOrchestrator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;

use config::Settings;
use enforcer::{Enforcer, TracingEnforcer};
use sweeper::SweepHandle;

/// Kontekst aplikacji budowany w entry poincie. Trzyma orkiestrator i task
/// sweepa; żadnego globalnego stanu.
pub struct ShieldContext {
    pub settings: Settings,
    shield: Arc<SecurityOrchestrator>,
    sweep: Mutex<Option<SweepHandle>>,
}

impl ShieldContext {
    /// Bootstrap:
    /// - logowanie
    /// - orkiestrator z enforcerem, który tylko loguje
    /// - task sweepa
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        logging::init(&settings);
        Self::bootstrap_with(settings, Arc::new(TracingEnforcer)).await
    }

    /// Jak [`Self::bootstrap`], ale z enforcerem od wołającego i bez ruszania
    /// globalnego subscribera.
    pub async fn bootstrap_with(settings: Settings, enforcer: Arc<dyn Enforcer>) -> Result<Arc<Self>> {
        let shield =
            Arc::new(SecurityOrchestrator::new(settings.shield.clone())?.with_enforcer(enforcer));
        let every = Duration::from_millis(settings.shield.sweep.interval_ms);
        let sweep = sweeper::spawn(&shield, every);

        tracing::info!(
            env = %settings.env,
            app = %settings.app.name,
            sweep_every_ms = settings.shield.sweep.interval_ms,
            "shield ready"
        );

        Ok(Arc::new(Self {
            settings,
            shield,
            sweep: Mutex::new(Some(sweep)),
        }))
    }

    pub fn shield(&self) -> Arc<SecurityOrchestrator> {
        self.shield.clone()
    }

    /// Zatrzymuje sweep. Można wołać wielokrotnie.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep.lock().await.take() {
            handle.stop().await;
        }
    }
}

/// Puszcza stdin przez orkiestrator do EOF albo Ctrl-C, potem zatrzymuje sweep.
pub async fn run(ctx: Arc<ShieldContext>) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let shield = ctx.shield();

    let outcome = tokio::select! {
        r = replay::replay(&shield, stdin, stdout) => Some(r),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(Ok(summary)) => tracing::info!(?summary, "input exhausted"),
        Some(Err(e)) => {
            ctx.shutdown().await;
            return Err(e);
        }
        None => tracing::info!("interrupted"),
    }

    ctx.shutdown().await;
    let stats = shield.get_stats();
    tracing::info!(
        total = stats.total_requests,
        blocked = stats.blocked_requests,
        errors = stats.evaluation_errors,
        enforcement_failures = stats.enforcement_failures,
        "final stats"
    );
    Ok(())
}
