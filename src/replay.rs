//! src/replay.rs
//! Adapter JSON-lines: jedno `ActivityEvent` na linię wejścia, jedna `Decision` na
//! linię wyjścia. Zepsute linie logujemy i pomijamy.

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::event::ActivityEvent;
use crate::orchestrator::SecurityOrchestrator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub processed: u64,
    pub blocked: u64,
    pub skipped: u64,
}

pub async fn replay<R, W>(
    shield: &SecurityOrchestrator,
    reader: R,
    mut writer: W,
) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = ReplaySummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: ActivityEvent = match serde_json::from_str(line) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(line_no, error = %e, "skipping malformed event");
                summary.skipped += 1;
                continue;
            }
        };

        let decision = shield.evaluate(&event).await;
        summary.processed += 1;
        if !decision.allowed {
            summary.blocked += 1;
        }

        let mut out = serde_json::to_string(&decision)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }

    writer.flush().await?;
    Ok(summary)
}
