//! The relay actor: single owner of the ledger, store, subscribers, poll
//! timer and credential.
//!
//! Every state change happens on the actor task. Callers talk to it through
//! a [`RelayHandle`], which queues a command and waits for the reply, so no
//! two operations ever interleave. The only suspension point is the upstream
//! fetch inside a poll; commands that arrive meanwhile are served after it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::api::{FeedSource, FetchError};
use crate::config::AppConfig;
use crate::keys;
use crate::ledger::HistoryLedger;
use crate::mask_credential;
use crate::registry::{Outbound, SubscriberId, SubscriberRegistry};
use crate::scheduler::PollScheduler;
use crate::store::Store;
use crate::types::{EventRecord, PageParams, ServerMessage};

/// Queue depth between handles and the actor.
const COMMAND_BUFFER: usize = 256;

/// Errors returned to callers of the synchronous boundary operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("credential must be a non-empty string")]
    InvalidCredential,
    #[error("relay actor is not running")]
    Unavailable,
    #[error("store write failed: {0:#}")]
    Store(anyhow::Error),
}

/// Tunables for one relay instance.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub poll_interval: Duration,
    pub history_limit: usize,
    pub page: PageParams,
    pub fallback_credential: String,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            poll_interval: crate::POLL_INTERVAL,
            history_limit: crate::HISTORY_LIMIT,
            page: PageParams::default(),
            fallback_credential: crate::FALLBACK_CREDENTIAL.to_string(),
        }
    }
}

impl From<&AppConfig> for RelayOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.relay.poll_interval(),
            history_limit: config.relay.history_limit,
            page: config.upstream.page_params(),
            fallback_credential: config.upstream.fallback_credential.clone(),
        }
    }
}

enum Command {
    History(oneshot::Sender<Vec<EventRecord>>),
    Subscribe(Outbound, oneshot::Sender<SubscriberId>),
    Unsubscribe(SubscriberId),
    UpdateCredential(String, oneshot::Sender<Result<(), RelayError>>),
    Reset(oneshot::Sender<Result<(), RelayError>>),
    Shutdown,
}

/// Cheap, cloneable entry point to a running relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Command>,
}

impl RelayHandle {
    /// Newest-first snapshot of the retained history.
    pub async fn history(&self) -> Result<Vec<EventRecord>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::History(reply)).await?;
        rx.await.map_err(|_| RelayError::Unavailable)
    }

    /// Register a subscriber channel; it immediately receives a history snapshot.
    pub async fn subscribe(&self, channel: Outbound) -> Result<SubscriberId, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe(channel, reply)).await?;
        rx.await.map_err(|_| RelayError::Unavailable)
    }

    /// Tell the actor a subscriber's transport has gone away.
    pub async fn unsubscribe(&self, id: SubscriberId) {
        // A stopped actor has no registry left to clean.
        let _ = self.send(Command::Unsubscribe(id)).await;
    }

    pub async fn update_credential(&self, token: String) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UpdateCredential(token, reply)).await?;
        rx.await.map_err(|_| RelayError::Unavailable)?
    }

    pub async fn reset(&self) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset(reply)).await?;
        rx.await.map_err(|_| RelayError::Unavailable)?
    }

    /// Ask the actor to stop after the operation it is currently serving.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) -> Result<(), RelayError> {
        self.tx.send(cmd).await.map_err(|_| RelayError::Unavailable)
    }
}

/// State owned by the actor task.
pub struct RelayActor {
    options: RelayOptions,
    feed: Arc<dyn FeedSource>,
    store: Box<dyn Store>,
    ledger: HistoryLedger,
    registry: SubscriberRegistry,
    scheduler: PollScheduler,
    credential: Option<String>,
    auth_failures: u32,
}

impl RelayActor {
    /// Cold start: rebuild ledger, credential and pending wake-up from the store.
    pub fn restore(
        options: RelayOptions,
        feed: Arc<dyn FeedSource>,
        store: Box<dyn Store>,
    ) -> anyhow::Result<Self> {
        let ledger = HistoryLedger::restore(store.as_ref(), options.history_limit)
            .context("restore history")?;
        let credential = store
            .get(keys::AUTH_COOKIE)
            .context("restore credential")?
            .filter(|c| !c.trim().is_empty());
        let next_poll_at = match store.get(keys::NEXT_POLL_AT)? {
            Some(raw) => match DateTime::parse_from_rfc3339(raw.trim()) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    warn!("Ignoring unreadable stored wake-up {raw:?}: {e}");
                    None
                }
            },
            None => None,
        };

        info!(
            records = ledger.len(),
            last_id = ledger.last_seen_id(),
            credential = credential.is_some(),
            "Restored relay state"
        );

        Ok(Self {
            options,
            feed,
            store,
            ledger,
            registry: SubscriberRegistry::new(),
            scheduler: PollScheduler::restore(next_poll_at),
            credential,
            auth_failures: 0,
        })
    }

    /// Move the actor onto its own task.
    pub fn spawn(self) -> (RelayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(rx));
        (RelayHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(
            interval_secs = self.options.poll_interval.as_secs_f64(),
            "Relay actor started"
        );
        loop {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.poll().await;
                }
            }
        }
        info!("Relay actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::History(reply) => {
                let _ = reply.send(self.history());
            }
            Command::Subscribe(channel, reply) => {
                let id = self.subscribe(channel);
                if reply.send(id).is_err() {
                    // The caller vanished before learning its ID; nobody will unsubscribe it.
                    self.unsubscribe(id);
                }
            }
            Command::Unsubscribe(id) => self.unsubscribe(id),
            Command::UpdateCredential(token, reply) => {
                let _ = reply.send(self.update_credential(token));
            }
            Command::Reset(reply) => {
                let _ = reply.send(self.reset());
            }
            Command::Shutdown => {}
        }
    }

    /// Newest-first snapshot of the retained history.
    pub fn history(&self) -> Vec<EventRecord> {
        self.ledger.snapshot()
    }

    /// Send the current history on `channel`, then register it.
    ///
    /// A failed snapshot send does not prevent registration; the next failed
    /// broadcast prunes the channel.
    pub fn subscribe(&mut self, channel: Outbound) -> SubscriberId {
        let id = self.registry.register(channel);
        if !self.registry.send_to(id, ServerMessage::History(self.ledger.snapshot())) {
            debug!(subscriber = id, "Initial snapshot not delivered");
        }
        info!(
            subscriber = id,
            subscribers = self.registry.len(),
            "Subscriber connected"
        );
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) {
        if self.registry.remove(id) {
            info!(
                subscriber = id,
                subscribers = self.registry.len(),
                "Subscriber disconnected"
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Replace the upstream credential and persist it verbatim.
    pub fn update_credential(&mut self, token: String) -> Result<(), RelayError> {
        if token.trim().is_empty() {
            warn!("Rejected empty credential update");
            return Err(RelayError::InvalidCredential);
        }
        self.store
            .put(keys::AUTH_COOKIE, token.clone())
            .map_err(RelayError::Store)?;
        info!("Credential updated: {}", mask_credential(&token));
        self.credential = Some(token);
        self.auth_failures = 0;
        Ok(())
    }

    /// Credential the next poll will send; the fallback if none was ever set.
    pub fn credential(&self) -> &str {
        self.credential
            .as_deref()
            .unwrap_or(&self.options.fallback_credential)
    }

    /// Wipe store, history, cursor and credential; poll again right away.
    pub fn reset(&mut self) -> Result<(), RelayError> {
        self.store.clear().map_err(RelayError::Store)?;
        self.ledger.clear();
        self.credential = None;
        self.auth_failures = 0;
        self.scheduler.disarm();
        self.scheduler.arm_now();
        self.persist_wakeup();
        warn!("Relay state reset");
        Ok(())
    }

    /// Run one poll cycle, then re-arm the timer no matter how the cycle ended.
    pub async fn poll(&mut self) {
        match self.poll_cycle().await {
            Ok(0) => {}
            Ok(count) => debug!(count, "Poll cycle relayed new rounds"),
            Err(e) => self.record_fetch_error(&e),
        }
        self.scheduler.fire();
        self.scheduler.arm(self.options.poll_interval);
        self.persist_wakeup();
    }

    /// Fetch, ingest, persist, broadcast. Returns how many rounds were new.
    async fn poll_cycle(&mut self) -> Result<usize, FetchError> {
        let credential = self.credential().to_owned();
        let feed = Arc::clone(&self.feed);
        let batch = feed.fetch(&credential, self.options.page).await?;
        self.auth_failures = 0;

        if batch.is_empty() {
            debug!("Upstream returned an empty batch");
            return Ok(0);
        }

        let fresh = self.ledger.ingest(&batch);
        if fresh.is_empty() {
            debug!(last_id = self.ledger.last_seen_id(), "No new rounds");
            return Ok(0);
        }

        if let Err(e) = self.ledger.persist(self.store.as_mut()) {
            error!("Failed to persist history: {e:#}");
        }

        for record in &fresh {
            let delivered = self.registry.broadcast(&ServerMessage::Crash(record.clone()));
            debug!(id = record.id, delivered, "Broadcast round");
        }

        info!(
            count = fresh.len(),
            last_id = self.ledger.last_seen_id(),
            subscribers = self.registry.len(),
            "Relayed new rounds"
        );
        Ok(fresh.len())
    }

    fn record_fetch_error(&mut self, err: &FetchError) {
        match err {
            FetchError::AuthRejected { .. } => {
                self.auth_failures += 1;
                error!(
                    consecutive = self.auth_failures,
                    "{err}; credential {} looks stale, waiting for an update",
                    mask_credential(self.credential())
                );
            }
            FetchError::BadFormat { .. } => warn!("Poll cycle aborted: {err}"),
            FetchError::UnexpectedStatus { .. } => warn!("Poll cycle aborted: {err}"),
            FetchError::Transport(_) => warn!("Poll cycle aborted: {err}"),
        }
    }

    fn persist_wakeup(&mut self) {
        let Some(at) = self.scheduler.wake_at() else {
            return;
        };
        if let Err(e) = self.store.put(keys::NEXT_POLL_AT, at.to_rfc3339()) {
            warn!("Failed to persist next wake-up: {e:#}");
        }
    }

    pub fn consecutive_auth_failures(&self) -> u32 {
        self.auth_failures
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }
}
