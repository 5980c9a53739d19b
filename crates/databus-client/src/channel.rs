use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    client::HttpClient,
    config::ChannelConfig,
    error::{Error, Result},
    records::{CommitEntry, CommitRequest, ConsumeResponse, ConsumedPayload, RECORDS_CONTENT_TYPE},
    retry::{with_retry, RetryGate},
};

/// Local view of the server-side consumer session.
///
/// `consumer_id` is non-empty exactly while the server is believed to hold a
/// consumer for this channel, and `active_subscriptions` is non-empty only
/// then. `requested_subscriptions` survives a reset so that consumer-loss
/// recovery can re-install the last requested topic set.
#[derive(Debug, Default)]
struct ConsumerState {
    consumer_id: Option<String>,
    active_subscriptions: Vec<String>,
    requested_subscriptions: Vec<String>,
    commit_log: Vec<CommitEntry>,
}

#[derive(Debug)]
pub(crate) struct ChannelInner {
    consumer_base: String,
    produce_url: String,
    pub(crate) consumer_group: Option<String>,
    consumer_configs: HashMap<String, String>,
    retry_on_fail: bool,
    http: HttpClient,
    state: Mutex<ConsumerState>,
    active: AtomicBool,
    running: watch::Sender<bool>,
    stop: Mutex<Option<CancellationToken>>,
}

/// A stateful session against one streaming service.
///
/// A channel binds one consumer group to one server-side consumer instance
/// and drives its lifecycle: create, subscribe, consume, commit, delete.
/// Producing does not need a consumer group. Clones share the session, so a
/// clone can [`stop`](Channel::stop) or [`destroy`](Channel::destroy) a
/// channel whose [`run`](Channel::run) loop is held elsewhere.
#[derive(Debug, Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel against `base` (scheme + host, optionally a port).
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] if the base URL is empty or invalid,
    /// or if the HTTP client cannot be built from the TLS options.
    pub fn new(base: impl AsRef<str>, config: ChannelConfig) -> Result<Self> {
        let base = base.as_ref().trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::permanent("base URL must not be empty"));
        }
        Url::parse(base).map_err(|e| Error::permanent(format!("invalid base URL `{base}`: {e}")))?;

        let http = HttpClient::new(config.tls.build_client()?, config.auth.clone());
        let (running, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ChannelInner {
                consumer_base: format!("{base}{}/consumers", config.consumer_path_prefix),
                produce_url: format!("{base}{}/produce", config.producer_path_prefix),
                consumer_configs: config.consumer_configs(),
                consumer_group: config.consumer_group,
                retry_on_fail: config.retry_on_fail,
                http,
                state: Mutex::new(ConsumerState::default()),
                active: AtomicBool::new(true),
                running,
                stop: Mutex::new(None),
            }),
        })
    }

    /// The consumer group this channel joins, if one was configured.
    #[must_use]
    pub fn consumer_group(&self) -> Option<&str> {
        self.inner.consumer_group.as_deref()
    }

    /// The server-side consumer instance id, present after a successful
    /// create.
    #[must_use]
    pub fn consumer_id(&self) -> Option<String> {
        self.inner.state().consumer_id.clone()
    }

    /// The last successfully acknowledged subscription set.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.state().active_subscriptions.clone()
    }

    /// Whether a run loop is currently executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.inner.running.borrow()
    }

    /// Create a server-side consumer for the configured group, discarding
    /// any previous local session state first.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] if no consumer group is configured or
    /// the channel was destroyed; temporary failures are retried per the
    /// channel's retry setting.
    pub async fn create(&self) -> Result<()> {
        let inner = self.inner.as_ref();
        with_retry(inner, "create", inner.retry_on_fail, || inner.create_once())
            .await
            .map(drop)
    }

    /// Subscribe the consumer to `topics`, creating a consumer first when
    /// none exists. Subscribing to the already-active topic set is a no-op
    /// that performs no HTTP request.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] on an empty topic list, or with
    /// [`Error::ConsumerLost`] if the server no longer holds the consumer.
    pub async fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> Result<()> {
        let topics: Vec<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();
        if topics.is_empty() {
            return Err(Error::permanent("at least one topic is required to subscribe"));
        }
        self.inner.state().requested_subscriptions.clone_from(&topics);

        let inner = self.inner.as_ref();
        with_retry(inner, "subscribe", inner.retry_on_fail, || {
            inner.subscribe_once(&topics)
        })
        .await
    }

    /// Fetch the next batch of records, queue their offsets for the next
    /// commit, and return the decoded payloads.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] if there is no active subscription or
    /// a payload cannot be decoded, and with [`Error::ConsumerLost`] if the
    /// server no longer holds the consumer.
    pub async fn consume(&self) -> Result<Vec<ConsumedPayload>> {
        let inner = self.inner.as_ref();
        with_retry(inner, "consume", inner.retry_on_fail, || inner.consume_once()).await
    }

    /// Acknowledge every record delivered since the last commit. Completes
    /// without a request when nothing is pending.
    ///
    /// # Errors
    /// Fails with [`Error::ConsumerLost`] if the server no longer holds the
    /// consumer; the pending offsets stay queued on failure.
    pub async fn commit(&self) -> Result<()> {
        let inner = self.inner.as_ref();
        with_retry(inner, "commit", inner.retry_on_fail, || inner.commit_once()).await
    }

    /// Publish `payload` verbatim to the produce endpoint.
    ///
    /// Produce is deliberately not retried; callers see the classified
    /// error directly.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] if the payload cannot be serialized
    /// or the channel was destroyed, [`Error::Temporary`] otherwise.
    pub async fn produce<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let inner = self.inner.as_ref();
        inner.ensure_active()?;
        let body = serde_json::to_vec(payload)
            .map_err(|e| Error::permanent(format!("failed to serialize produce payload: {e}")))?;
        let request = inner
            .http
            .client()
            .post(&inner.produce_url)
            .header(CONTENT_TYPE, RECORDS_CONTENT_TYPE)
            .body(body);
        inner.http.execute(request).await.map(drop)
    }

    /// Delete the server-side consumer, if one exists.
    ///
    /// Local consumer state is cleared once the response is classified as
    /// 2xx or 404. The 404 is still reported, as [`Error::ConsumerLost`], so
    /// callers can observe that the server had already dropped the consumer.
    ///
    /// # Errors
    /// Fails with [`Error::ConsumerLost`] on 404 (state cleared anyway) and
    /// [`Error::Temporary`] on other failures (state kept).
    pub async fn delete(&self) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.delete_once().await
    }

    /// Forget the server-side consumer without contacting the server: clears
    /// the consumer id, the active subscriptions and any uncommitted
    /// offsets.
    pub fn reset(&self) {
        self.inner.reset_consumer();
    }

    /// Request a running loop to halt and wait until it has. Returns
    /// immediately when no loop is running.
    ///
    /// The request is cooperative: it cancels pending waits and is observed
    /// at the next suspension point or retry-attempt boundary.
    pub async fn stop(&self) {
        let Some(mut rx) = self.inner.request_stop() else {
            return;
        };
        tracing::debug!("stop requested, waiting for the run loop to halt");
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Tear the channel down: stop any running loop, delete the server-side
    /// consumer and mark the channel inactive. Every subsequent operation
    /// fails with [`Error::Permanent`].
    ///
    /// # Errors
    /// Fails if the consumer deletion fails with anything other than a
    /// consumer-loss report (the consumer being gone is fine here).
    pub async fn destroy(&self) -> Result<()> {
        if !self.inner.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stop().await;
        let result = self.delete().await;
        self.inner.active.store(false, Ordering::SeqCst);
        tracing::debug!("channel destroyed");
        match result {
            Err(e) if e.is_consumer_loss() => Ok(()),
            other => other,
        }
    }
}

impl ChannelInner {
    fn state(&self) -> std::sync::MutexGuard<'_, ConsumerState> {
        self.state.lock().expect("non-poisoned lock")
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::permanent("channel has been destroyed"))
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop
            .lock()
            .expect("non-poisoned lock")
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn stop_token(&self) -> Option<CancellationToken> {
        self.stop.lock().expect("non-poisoned lock").clone()
    }

    pub(crate) fn requested_topics(&self) -> Vec<String> {
        self.state().requested_subscriptions.clone()
    }

    #[cfg(test)]
    pub(crate) fn pending_commits(&self) -> usize {
        self.state().commit_log.len()
    }

    pub(crate) fn set_requested_topics(&self, topics: Vec<String>) {
        self.state().requested_subscriptions = topics;
    }

    /// Claim the running flag and install a fresh stop token for a run loop.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] when a run loop is already executing.
    pub(crate) fn try_begin_run(&self) -> Result<()> {
        let mut slot = self.stop.lock().expect("non-poisoned lock");
        if *self.running.borrow() {
            return Err(Error::permanent("a run loop is already executing"));
        }
        *slot = Some(CancellationToken::new());
        self.running.send_replace(true);
        Ok(())
    }

    /// Release the running flag; wakes every pending stop waiter.
    pub(crate) fn end_run(&self) {
        let mut slot = self.stop.lock().expect("non-poisoned lock");
        *slot = None;
        self.running.send_replace(false);
    }

    /// Signal a running loop to halt. Returns a receiver to await the halt
    /// on, or `None` when no loop is running.
    fn request_stop(&self) -> Option<watch::Receiver<bool>> {
        let slot = self.stop.lock().expect("non-poisoned lock");
        let mut rx = self.running.subscribe();
        if !*rx.borrow_and_update() {
            return None;
        }
        if let Some(token) = slot.as_ref() {
            token.cancel();
        }
        Some(rx)
    }

    pub(crate) fn reset_consumer(&self) {
        let mut state = self.state();
        if let Some(id) = state.consumer_id.take() {
            tracing::debug!(consumer_id = %id, "discarded consumer session state");
        }
        state.active_subscriptions.clear();
        state.commit_log.clear();
    }

    async fn create_once(&self) -> Result<String> {
        let group = self.consumer_group.as_ref().ok_or_else(|| {
            Error::permanent("a consumer group is required for consumer operations")
        })?;
        self.reset_consumer();

        let body = json!({ "consumerGroup": group, "configs": self.consumer_configs });
        let response = self
            .http
            .execute(self.http.client().post(&self.consumer_base).json(&body))
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::temporary(format!("create consumer response unreadable: {e}")))?;
        let id = body
            .get("consumerInstanceId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::permanent("create consumer response is missing `consumerInstanceId`")
            })?;

        self.state().consumer_id = Some(id.to_string());
        tracing::debug!(consumer_id = id, group = %group, "created consumer instance");
        Ok(id.to_string())
    }

    async fn subscribe_once(&self, topics: &[String]) -> Result<()> {
        let consumer_id = {
            let state = self.state();
            if state.active_subscriptions.as_slice() == topics {
                return Ok(());
            }
            state.consumer_id.clone()
        };
        let consumer_id = match consumer_id {
            Some(id) => id,
            None => self.create_once().await?,
        };

        let url = format!("{}/{consumer_id}/subscription", self.consumer_base);
        self.http
            .execute_consumer_scoped(self.http.client().post(&url).json(&json!({ "topics": topics })))
            .await?;

        self.state().active_subscriptions = topics.to_vec();
        tracing::debug!(consumer_id = %consumer_id, ?topics, "subscription installed");
        Ok(())
    }

    async fn consume_once(&self) -> Result<Vec<ConsumedPayload>> {
        let consumer_id = {
            let state = self.state();
            if state.active_subscriptions.is_empty() {
                return Err(Error::permanent("consume requires an active subscription"));
            }
            state
                .consumer_id
                .clone()
                .ok_or_else(|| Error::permanent("consume requires an active subscription"))?
        };

        let url = format!("{}/{consumer_id}/records", self.consumer_base);
        let response = self
            .http
            .execute_consumer_scoped(self.http.client().get(&url))
            .await?;
        let body: ConsumeResponse = response
            .json()
            .await
            .map_err(|e| Error::temporary(format!("records response unreadable: {e}")))?;

        let mut entries = Vec::with_capacity(body.records.len());
        let mut payloads = Vec::with_capacity(body.records.len());
        for record in body.records {
            entries.push(CommitEntry {
                topic: record.routing_data.topic.clone(),
                partition: record.partition,
                offset: record.offset,
            });
            payloads.push(record.into_payload()?);
        }
        self.state().commit_log.extend(entries);

        tracing::debug!(count = payloads.len(), "consumed records");
        Ok(payloads)
    }

    async fn commit_once(&self) -> Result<()> {
        let (consumer_id, offsets) = {
            let state = self.state();
            if state.commit_log.is_empty() {
                return Ok(());
            }
            let id = state
                .consumer_id
                .clone()
                .ok_or_else(|| Error::permanent("commit requires a consumer"))?;
            (id, state.commit_log.clone())
        };

        let url = format!("{}/{consumer_id}/offsets", self.consumer_base);
        self.http
            .execute_consumer_scoped(
                self.http
                    .client()
                    .post(&url)
                    .json(&CommitRequest { offsets: &offsets }),
            )
            .await?;

        let mut state = self.state();
        let committed = offsets.len().min(state.commit_log.len());
        state.commit_log.drain(..committed);
        tracing::debug!(offsets = committed, "committed offsets");
        Ok(())
    }

    async fn delete_once(&self) -> Result<()> {
        let Some(consumer_id) = self.state().consumer_id.clone() else {
            return Ok(());
        };

        let url = format!("{}/{consumer_id}", self.consumer_base);
        let result = self
            .http
            .execute_consumer_scoped(self.http.client().delete(&url))
            .await;
        // Clear only after the response is classified: 2xx and 404 both mean
        // the server no longer holds the consumer.
        match result {
            Ok(_) => {
                self.reset_consumer();
                Ok(())
            }
            Err(e) if e.is_consumer_loss() => {
                self.reset_consumer();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RetryGate for ChannelInner {
    fn check(&self) -> Result<()> {
        self.ensure_active()?;
        if *self.running.borrow() && self.stop_requested() {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    async fn wait(&self, delay: Duration) {
        match self.stop_token() {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}
