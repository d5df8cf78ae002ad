//! Long-poll loop feeding Telegram messages into the gate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use enrollgate_core::{AccessGate, CallerId, Outcome};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::telegram::TelegramClient;

/// Seconds the server holds a `getUpdates` request open.
const POLL_TIMEOUT_SECS: u64 = 30;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Poll until `shutdown` resolves, then wait for in-flight messages.
///
/// Each message is handled in its own task; at most `max_concurrent` run at
/// once. The gate serializes all state changes, so ordering between tasks
/// does not matter for correctness.
pub async fn run(
    gate: Arc<AccessGate>,
    client: TelegramClient,
    max_concurrent: usize,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let total = u32::try_from(max_concurrent).context("max_concurrent does not fit in u32")?;
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut offset: Option<i64> = None;
    let mut backoff = Backoff::default();
    tokio::pin!(shutdown);

    loop {
        let polled = tokio::select! {
            _ = &mut shutdown => break,
            polled = client.get_updates(offset, POLL_TIMEOUT_SECS) => polled,
        };

        let updates = match polled {
            Ok(updates) => {
                backoff.reset();
                updates
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, retry_in_secs = delay.as_secs(), "getUpdates failed");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);
            let Some((caller, text)) = update.inbound_text() else {
                tracing::debug!(update_id = update.update_id, "ignoring non-text update");
                continue;
            };
            let message_id = update.message.as_ref().map(|m| m.message_id);

            let permit = Arc::clone(&permits).acquire_owned().await?;
            let span = tracing::info_span!(
                "request",
                id = %uuid::Uuid::new_v4(),
                caller,
                message_id
            );
            let gate = Arc::clone(&gate);
            let client = client.clone();
            let text = text.to_string();
            tokio::spawn(
                async move {
                    handle(gate, client, caller, text).await;
                    drop(permit);
                }
                .instrument(span),
            );
        }
    }

    tracing::info!("waiting for in-flight requests");
    let _all = permits.acquire_many(total).await?;
    Ok(())
}

/// Exponential retry delay for failed polls, doubling up to [`MAX_BACKOFF`].
struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: MIN_BACKOFF,
        }
    }
}

impl Backoff {
    fn reset(&mut self) {
        self.current = MIN_BACKOFF;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }
}

async fn handle(gate: Arc<AccessGate>, client: TelegramClient, caller: CallerId, text: String) {
    match gate.handle(caller, &text, &client).await {
        Outcome::Delivered { identity, .. } => {
            tracing::info!(identity = %identity, "request completed");
        }
        Outcome::PipelineFailed(identity) => {
            tracing::warn!(identity = %identity, "request failed after authorization");
        }
        Outcome::Denied(verdict) => {
            tracing::debug!(?verdict, "request denied");
        }
    }
}
