use std::sync::Arc;

use reqwest::{RequestBuilder, Response, StatusCode};

use crate::{
    authorizers::Authorizer,
    error::{Error, Result},
};

/// Stateless request executor: applies the authentication strategy, sends,
/// and classifies the response status into the error taxonomy.
///
/// A 401/403 resets the strategy's cached token and surfaces as temporary,
/// so the retry driver re-attempts with a fresh credential. A 404 is
/// temporary except on consumer-scoped routes, where it means the server no
/// longer holds the consumer.
#[derive(Debug, Clone)]
pub(crate) struct HttpClient {
    client: reqwest::Client,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl HttpClient {
    pub(crate) fn new(client: reqwest::Client, authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        Self { client, authorizer }
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute a request on a route that is not consumer-scoped.
    pub(crate) async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        self.send(request, false).await
    }

    /// Execute a request on a consumer-scoped route: a 404 here means the
    /// server-side consumer is gone.
    pub(crate) async fn execute_consumer_scoped(&self, request: RequestBuilder) -> Result<Response> {
        self.send(request, true).await
    }

    async fn send(&self, request: RequestBuilder, consumer_scoped: bool) -> Result<Response> {
        let request = match &self.authorizer {
            Some(authorizer) => authorizer.authorize(request).await?,
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::temporary(format!("request failed: {e}")))?;

        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                Ok(response)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                if let Some(authorizer) = &self.authorizer {
                    authorizer.reset();
                }
                Err(Error::temporary(format!(
                    "request to {} rejected with status {status}",
                    response.url()
                )))
            }
            StatusCode::NOT_FOUND if consumer_scoped => Err(Error::ConsumerLost(format!(
                "server returned 404 for {}",
                response.url()
            ))),
            _ => Err(Error::temporary(format!(
                "unexpected status {status} from {}",
                response.url()
            ))),
        }
    }
}
