mod client_credentials;
mod credentials;

use std::fmt;

use async_trait::async_trait;
pub use client_credentials::*;
pub use credentials::*;
use http::HeaderValue;
use reqwest::StatusCode;
use serde_json::Value;

use crate::error::{Error, Result};

/// Authentication capability: decorates outgoing requests with credentials
/// and can invalidate a cached token.
///
/// Strategies are shared between channels by cloning; implementations cache
/// their token behind an `Arc` so every clone sees the same credential.
/// `authorize` and `reset` must therefore be safe for sequential reentry
/// from concurrent channels.
#[async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Return `request` augmented with credentials, acquiring (and caching)
    /// a token first if none is cached.
    ///
    /// # Errors
    /// Fails with [`Error::PermanentAuthentication`] if the credentials were
    /// rejected, or [`Error::TemporaryAuthentication`] if the token endpoint
    /// could not be reached or answered unexpectedly.
    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder>;

    /// Discard any cached credential so the next [`Authorizer::authorize`]
    /// must re-acquire one.
    fn reset(&self);
}

/// Send a prepared token request and extract the `field` string from its
/// JSON body as a sensitive `Bearer` header value.
pub(crate) async fn fetch_token(
    request: reqwest::RequestBuilder,
    field: &str,
    endpoint: &str,
) -> Result<HeaderValue> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::TemporaryAuthentication(format!("{endpoint} request failed: {e}")))?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::PermanentAuthentication(format!(
            "{endpoint} rejected the credentials with status {status}"
        )));
    }
    if !status.is_success() {
        return Err(Error::TemporaryAuthentication(format!(
            "{endpoint} returned unexpected status {status}"
        )));
    }

    let body: Value = response.json().await.map_err(|e| {
        Error::TemporaryAuthentication(format!("{endpoint} response unreadable: {e}"))
    })?;
    let token = body.get(field).and_then(Value::as_str).ok_or_else(|| {
        Error::PermanentAuthentication(format!("{endpoint} response is missing `{field}`"))
    })?;

    let mut header = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
        Error::PermanentAuthentication(format!("{endpoint} returned a token unusable as a header"))
    })?;
    header.set_sensitive(true);
    Ok(header)
}
