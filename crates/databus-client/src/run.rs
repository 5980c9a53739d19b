use std::{future::Future, time::Duration};

use serde_json::Value;

use crate::{
    channel::{Channel, ChannelInner},
    error::{Error, Result},
    retry::RetryGate as _,
};

const DEFAULT_WAIT_BETWEEN_QUERIES: Duration = Duration::from_secs(30);

/// Options for [`Channel::run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    wait_between_queries: Duration,
    topics: Option<Vec<String>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait_between_queries: DEFAULT_WAIT_BETWEEN_QUERIES,
            topics: None,
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to sleep between consume cycles. Defaults to 30 seconds.
    #[must_use]
    pub fn wait_between_queries(mut self, wait: Duration) -> Self {
        self.wait_between_queries = wait;
        self
    }

    /// Topics to subscribe to when the loop starts. When omitted, the loop
    /// reuses the channel's last requested subscriptions.
    #[must_use]
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }
}

impl Channel {
    /// Drive the long-running consume loop:
    /// subscribe → consume → process → commit → wait, until `process`
    /// returns `Ok(false)`, fails, or [`stop`](Channel::stop) is requested.
    ///
    /// `process` receives the decoded payloads of one consume cycle and
    /// returns whether the loop should continue. An error from `process` is
    /// non-recoverable and surfaces from `run`. A stop request surfaces as
    /// success. When the server forgets the consumer mid-run, the loop
    /// re-creates it, re-subscribes to the latest requested topics and keeps
    /// going; offsets not committed by then are lost, and the configured
    /// offset reset governs what the new consumer sees.
    ///
    /// Do not await [`stop`](Channel::stop) from inside `process`: it waits
    /// for this loop to halt and would deadlock. Request it from a clone of
    /// the channel on another task, or return `Ok(false)`.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] when no consumer group is configured,
    /// when no topics are passed and no subscription is active, or when a
    /// loop is already running; otherwise propagates the first
    /// non-recoverable loop error.
    pub async fn run<P, Fut>(&self, mut process: P, options: RunOptions) -> Result<()>
    where
        P: FnMut(Vec<Value>) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let inner = self.inner.as_ref();
        inner.ensure_active()?;
        if inner.consumer_group.is_none() {
            return Err(Error::permanent("a consumer group is required to run"));
        }
        if let Some(topics) = &options.topics {
            if topics.is_empty() {
                return Err(Error::permanent("at least one topic is required to run"));
            }
            inner.set_requested_topics(topics.clone());
        } else if self.subscriptions().is_empty() {
            return Err(Error::permanent(
                "no topics to consume: pass topics in the run options or subscribe first",
            ));
        }

        inner.try_begin_run()?;
        tracing::debug!("run loop started");
        let result = self.run_loop(&mut process, &options).await;
        inner.end_run();

        match result {
            Ok(()) => {
                tracing::debug!("run loop finished");
                Ok(())
            }
            Err(e) if e.is_stop() => {
                tracing::debug!("run loop stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "run loop failed");
                Err(e)
            }
        }
    }

    async fn run_loop<P, Fut>(&self, process: &mut P, options: &RunOptions) -> Result<()>
    where
        P: FnMut(Vec<Value>) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let inner = self.inner.as_ref();
        'subscribe: loop {
            // Refreshed on every re-subscribe cycle so external subscription
            // updates take effect after a recovery.
            let topics = inner.requested_topics();
            match self.subscribe(&topics).await {
                Ok(()) => {}
                Err(e) if e.is_consumer_loss() => {
                    recover(inner, &e);
                    continue 'subscribe;
                }
                Err(e) => return Err(e),
            }

            loop {
                let payloads = match self.consume().await {
                    Ok(payloads) => payloads,
                    Err(e) if e.is_consumer_loss() => {
                        recover(inner, &e);
                        continue 'subscribe;
                    }
                    Err(e) => return Err(e),
                };

                let values: Vec<Value> = payloads.into_iter().map(|p| p.payload).collect();
                let mut keep_going = process(values).await?;
                if inner.stop_requested() {
                    keep_going = false;
                }

                match self.commit().await {
                    Ok(()) => {}
                    Err(e) if e.is_consumer_loss() => {
                        recover(inner, &e);
                        continue 'subscribe;
                    }
                    Err(e) => return Err(e),
                }

                if !keep_going {
                    return Ok(());
                }
                inner.wait(options.wait_between_queries).await;
                if inner.stop_requested() {
                    return Ok(());
                }
            }
        }
    }
}

fn recover(inner: &ChannelInner, err: &Error) {
    tracing::warn!(error = %err, "server consumer lost, recreating consumer and subscriptions");
    inner.reset_consumer();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{records::encode_payload, ChannelConfig};

    const CONSUMERS: &str = "/databus/consumer-service/v1/consumers";

    fn channel(server: &mockito::Server) -> Channel {
        Channel::new(
            server.url(),
            ChannelConfig::new().consumer_group("run-group"),
        )
        .unwrap()
    }

    fn records_body() -> String {
        json!({
            "records": [{
                "routingData": {"topic": "t", "shardingKey": ""},
                "partition": 0,
                "offset": 0,
                "message": {"headers": {}, "payload": encode_payload(&json!({"m": 1})).unwrap()}
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn loop_consumes_processes_and_commits_until_told_to_stop() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", CONSUMERS)
            .with_status(200)
            .with_body(json!({ "consumerInstanceId": "c1" }).to_string())
            .create_async()
            .await;
        let subscription = server
            .mock("POST", format!("{CONSUMERS}/c1/subscription").as_str())
            .match_body(mockito::Matcher::Json(json!({ "topics": ["t"] })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", format!("{CONSUMERS}/c1/records").as_str())
            .with_status(200)
            .with_body(records_body())
            .expect(2)
            .create_async()
            .await;
        let offsets = server
            .mock("POST", format!("{CONSUMERS}/c1/offsets").as_str())
            .match_body(mockito::Matcher::Json(
                json!({ "offsets": [{"topic": "t", "partition": 0, "offset": 0}] }),
            ))
            .with_status(204)
            .expect(2)
            .create_async()
            .await;

        let channel = channel(&server);
        let calls = AtomicU32::new(0);
        let options = RunOptions::new()
            .topics(["t"])
            .wait_between_queries(Duration::from_millis(5));

        channel
            .run(
                |payloads| {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        assert_eq!(payloads, vec![json!({"m": 1})]);
                        Ok(call == 0)
                    }
                },
                options,
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(channel.inner.pending_commits(), 0);
        assert!(!channel.is_running());
        // One subscription for two consume cycles: the loop reuses it.
        subscription.assert_async().await;
        offsets.assert_async().await;
    }

    #[tokio::test]
    async fn stop_during_wait_halts_promptly_with_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", CONSUMERS)
            .with_status(200)
            .with_body(json!({ "consumerInstanceId": "c1" }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", format!("{CONSUMERS}/c1/subscription").as_str())
            .with_status(204)
            .create_async()
            .await;
        server
            .mock("GET", format!("{CONSUMERS}/c1/records").as_str())
            .with_status(200)
            .with_body(json!({ "records": [] }).to_string())
            .create_async()
            .await;

        let channel = channel(&server);
        let (entered_wait_tx, entered_wait_rx) = tokio::sync::oneshot::channel::<()>();
        let mut entered_wait_tx = Some(entered_wait_tx);

        let runner = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .run(
                        move |_| {
                            if let Some(tx) = entered_wait_tx.take() {
                                let _ = tx.send(());
                            }
                            async { Ok(true) }
                        },
                        RunOptions::new()
                            .topics(["t"])
                            .wait_between_queries(Duration::from_secs(3600)),
                    )
                    .await
            })
        };

        entered_wait_rx.await.unwrap();
        let stopped = tokio::time::Instant::now();
        channel.stop().await;
        assert!(stopped.elapsed() < Duration::from_secs(5));

        runner.await.unwrap().unwrap();
        assert!(!channel.is_running());

        // A second stop with no loop running returns immediately.
        channel.stop().await;
    }

    #[tokio::test]
    async fn consumer_loss_recreates_the_consumer_and_resubscribes() {
        let mut server = mockito::Server::new_async().await;
        // The first create hands out "c1"; after the loss the server hands
        // out "c2", so a recovery that skipped the reset would keep polling
        // the dead consumer and never reach the processor.
        let created = AtomicU32::new(0);
        let create = server
            .mock("POST", CONSUMERS)
            .with_status(200)
            .with_body_from_request(move |_| {
                let id = if created.fetch_add(1, Ordering::SeqCst) == 0 {
                    "c1"
                } else {
                    "c2"
                };
                json!({ "consumerInstanceId": id }).to_string().into_bytes()
            })
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", format!("{CONSUMERS}/c1/subscription").as_str())
            .with_status(204)
            .create_async()
            .await;
        let resubscription = server
            .mock("POST", format!("{CONSUMERS}/c2/subscription").as_str())
            .match_body(mockito::Matcher::Json(json!({ "topics": ["t"] })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", format!("{CONSUMERS}/c1/records").as_str())
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", format!("{CONSUMERS}/c2/records").as_str())
            .with_status(200)
            .with_body(json!({ "records": [] }).to_string())
            .create_async()
            .await;

        let channel = channel(&server);
        let calls = AtomicU32::new(0);
        channel
            .run(
                |payloads| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        assert!(payloads.is_empty());
                        Ok(false)
                    }
                },
                RunOptions::new().topics(["t"]),
            )
            .await
            .unwrap();

        // The processor only ran once the fresh consumer was polled, and the
        // channel now holds the re-created consumer's id.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.consumer_id().as_deref(), Some("c2"));
        create.assert_async().await;
        resubscription.assert_async().await;
    }

    #[tokio::test]
    async fn process_errors_are_non_recoverable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", CONSUMERS)
            .with_status(200)
            .with_body(json!({ "consumerInstanceId": "c1" }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", format!("{CONSUMERS}/c1/subscription").as_str())
            .with_status(204)
            .create_async()
            .await;
        server
            .mock("GET", format!("{CONSUMERS}/c1/records").as_str())
            .with_status(200)
            .with_body(json!({ "records": [] }).to_string())
            .create_async()
            .await;

        let channel = channel(&server);
        let err = channel
            .run(
                |_| async { Err(Error::permanent("handler exploded")) },
                RunOptions::new().topics(["t"]),
            )
            .await
            .unwrap_err();
        assert_eq!(err, Error::permanent("handler exploded"));
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn run_requires_a_consumer_group_and_topics() {
        let server = mockito::Server::new_async().await;

        let no_group = Channel::new(server.url(), ChannelConfig::new()).unwrap();
        let err = no_group
            .run(|_| async { Ok(false) }, RunOptions::new().topics(["t"]))
            .await
            .unwrap_err();
        assert!(err.is_permanent());

        let no_topics = channel(&server);
        let err = no_topics
            .run(|_| async { Ok(false) }, RunOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn only_one_loop_may_run_at_a_time() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", CONSUMERS)
            .with_status(200)
            .with_body(json!({ "consumerInstanceId": "c1" }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", format!("{CONSUMERS}/c1/subscription").as_str())
            .with_status(204)
            .create_async()
            .await;
        server
            .mock("GET", format!("{CONSUMERS}/c1/records").as_str())
            .with_status(200)
            .with_body(json!({ "records": [] }).to_string())
            .create_async()
            .await;

        let channel = channel(&server);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let mut started_tx = Some(started_tx);

        let runner = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .run(
                        move |_| {
                            if let Some(tx) = started_tx.take() {
                                let _ = tx.send(());
                            }
                            async { Ok(true) }
                        },
                        RunOptions::new()
                            .topics(["t"])
                            .wait_between_queries(Duration::from_secs(3600)),
                    )
                    .await
            })
        };

        started_rx.await.unwrap();
        let err = channel
            .run(|_| async { Ok(false) }, RunOptions::new().topics(["t"]))
            .await
            .unwrap_err();
        assert!(err.is_permanent());

        channel.stop().await;
        runner.await.unwrap().unwrap();
    }
}
