use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{Mutex, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    domain::Client,
    engine::EngineSupervisor,
    notify::{Notifier, NotifyOutcome},
    store::{SqliteStore, StoreError},
};

pub type RestartFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Seam between the reconciler and the process supervisor so passes can be
/// exercised against a recording double.
pub trait EngineRestarter: Send + Sync {
    fn restart(&self) -> RestartFuture;
}

impl EngineRestarter for EngineSupervisor {
    fn restart(&self) -> RestartFuture {
        let supervisor = self.clone();
        Box::pin(async move { supervisor.restart().await })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    Expired,
    TrafficLimit,
}

impl DisableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::TrafficLimit => "traffic limit",
        }
    }
}

#[derive(Clone)]
pub struct ReconcilerHandle {
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ReconcilerHandle {
    pub async fn shutdown(&self) {
        let tx = self.shutdown.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// Background enforcement of expiry/quota policy. One pass per interval;
/// errors are logged and retried on the next tick, never fatal.
pub fn spawn_reconciler(
    store: Arc<Mutex<SqliteStore>>,
    restarter: Arc<dyn EngineRestarter>,
    notifier: Notifier,
    interval: Duration,
) -> ReconcilerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let handle = ReconcilerHandle {
        shutdown: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match run_pass(&store, restarter.as_ref(), &notifier).await {
                        Ok(0) => debug!("reconcile pass: nothing to disable"),
                        Ok(disabled) => info!(disabled, "reconcile pass disabled clients"),
                        Err(err) => warn!(%err, "reconcile pass failed"),
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
        debug!("reconciler stopped");
    });

    handle
}

pub async fn run_pass(
    store: &Arc<Mutex<SqliteStore>>,
    restarter: &dyn EngineRestarter,
    notifier: &Notifier,
) -> Result<usize, StoreError> {
    run_pass_at(Utc::now().timestamp_millis(), store, restarter, notifier).await
}

/// One reconcile sweep at the given instant.
///
/// Disables are committed in a single transaction and followed by exactly
/// one restart, no matter how many clients crossed a threshold. The
/// transition is one-way: this path never re-enables anything.
pub async fn run_pass_at(
    now_ms: i64,
    store: &Arc<Mutex<SqliteStore>>,
    restarter: &dyn EngineRestarter,
    notifier: &Notifier,
) -> Result<usize, StoreError> {
    let crossed: Vec<(Client, DisableReason)> = {
        let store = store.lock().await;
        store
            .list_enabled_clients()?
            .into_iter()
            .filter_map(|client| {
                if client.is_expired_at(now_ms) {
                    Some((client, DisableReason::Expired))
                } else if client.is_over_quota() {
                    Some((client, DisableReason::TrafficLimit))
                } else {
                    None
                }
            })
            .collect()
    };

    if crossed.is_empty() {
        return Ok(0);
    }

    let ids: Vec<String> = crossed.iter().map(|(c, _)| c.id.clone()).collect();
    let (bot_token, chat_id) = {
        let mut store = store.lock().await;
        store.disable_clients(&ids)?;
        (
            store.get_setting("tg_bot_token", "")?,
            store.get_setting("tg_chat_id", "")?,
        )
    };

    for (client, reason) in &crossed {
        info!(
            client_id = %client.id,
            name = %client.name,
            reason = reason.as_str(),
            "client disabled"
        );
        let text = format!(
            "⚠️ <b>Client disabled</b>\nName: <code>{}</code>\nReason: {}",
            client.name,
            reason.as_str()
        );
        match notifier.send_message(&bot_token, &chat_id, &text).await {
            Ok(NotifyOutcome::Sent) => {}
            Ok(NotifyOutcome::NotConfigured) => {
                debug!(client_id = %client.id, "telegram not configured; skipping notification");
            }
            Err(err) => warn!(%err, client_id = %client.id, "telegram notification failed"),
        }
    }

    let _ = restarter.restart().await;
    Ok(crossed.len())
}
