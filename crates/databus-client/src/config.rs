use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use crate::{
    authorizers::Authorizer,
    error::{Error, Result},
};

/// Consumer-service prefix used when the caller does not override it.
pub const DEFAULT_CONSUMER_PATH_PREFIX: &str = "/databus/consumer-service/v1";
/// Producer-service prefix used when the caller does not override it.
pub const DEFAULT_PRODUCER_PATH_PREFIX: &str = "/databus/cloudproxy/v1";

const AUTO_OFFSET_RESET: &str = "auto.offset.reset";
const ENABLE_AUTO_COMMIT: &str = "enable.auto.commit";
const SESSION_TIMEOUT_MS: &str = "session.timeout.ms";
const REQUEST_TIMEOUT_MS: &str = "request.timeout.ms";

/// Where a freshly created consumer starts reading when the group holds no
/// committed offset for a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetReset {
    #[default]
    Latest,
    Earliest,
    None,
}

impl OffsetReset {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Earliest => "earliest",
            Self::None => "none",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetReset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latest" => Ok(Self::Latest),
            "earliest" => Ok(Self::Earliest),
            "none" => Ok(Self::None),
            other => Err(Error::permanent(format!(
                "invalid offset reset value `{other}`, expected one of latest, earliest, none"
            ))),
        }
    }
}

/// TLS material passed through to the HTTP transport.
///
/// `ca_pem` adds a root certificate to the trust store, `identity_pem` holds
/// a client certificate plus key in PEM form, and `accept_invalid_certs`
/// disables server certificate verification entirely.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    ca_pem: Option<Vec<u8>>,
    identity_pem: Option<Vec<u8>>,
    accept_invalid_certs: bool,
}

impl TlsOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust an additional root certificate (PEM).
    #[must_use]
    pub fn ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_pem = Some(pem.into());
        self
    }

    /// Present a client certificate; the PEM must contain the certificate
    /// chain and the private key.
    #[must_use]
    pub fn identity_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.identity_pem = Some(pem.into());
        self
    }

    /// Skip server certificate verification. Only for test brokers.
    #[must_use]
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Build a `reqwest::Client` carrying this TLS material. Redirects are
    /// disabled; the services addressed here never redirect.
    ///
    /// # Errors
    /// Fails with [`Error::Permanent`] if the PEM material cannot be parsed
    /// or the TLS backend cannot be initialized.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());

        if let Some(pem) = &self.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::permanent(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(pem) = &self.identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| Error::permanent(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        if self.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder
            .build()
            .map_err(|e| Error::permanent(format!("failed to build HTTP client: {e}")))
    }
}

/// Options recognised by the [`Channel`](crate::Channel) constructor.
///
/// The defaults match the service conventions: consumer and producer path
/// prefixes point at the databus services, offsets reset to `latest`,
/// auto-commit stays off and failed operations are retried.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub(crate) auth: Option<Arc<dyn Authorizer>>,
    pub(crate) consumer_group: Option<String>,
    pub(crate) consumer_path_prefix: String,
    pub(crate) producer_path_prefix: String,
    pub(crate) offset: OffsetReset,
    pub(crate) session_timeout: Option<Duration>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) retry_on_fail: bool,
    pub(crate) extra_configs: HashMap<String, String>,
    pub(crate) tls: TlsOptions,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auth: None,
            consumer_group: None,
            consumer_path_prefix: DEFAULT_CONSUMER_PATH_PREFIX.to_string(),
            producer_path_prefix: DEFAULT_PRODUCER_PATH_PREFIX.to_string(),
            offset: OffsetReset::default(),
            session_timeout: None,
            request_timeout: None,
            retry_on_fail: true,
            extra_configs: HashMap::new(),
            tls: TlsOptions::default(),
        }
    }
}

impl ChannelConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Authentication strategy applied to every outgoing request.
    #[must_use]
    pub fn auth<A: Authorizer + 'static>(mut self, auth: A) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Consumer group this channel joins. Required for consumer operations;
    /// a produce-only channel may leave it unset.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Override both service prefixes with a shared one.
    #[must_use]
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.consumer_path_prefix.clone_from(&prefix);
        self.producer_path_prefix = prefix;
        self
    }

    #[must_use]
    pub fn consumer_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_path_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn producer_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.producer_path_prefix = prefix.into();
        self
    }

    /// Offset reset behaviour for a freshly created consumer.
    #[must_use]
    pub fn offset(mut self, offset: OffsetReset) -> Self {
        self.offset = offset;
        self
    }

    /// Server-side consumer session timeout. Serialized on the wire in
    /// milliseconds.
    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Server-side request timeout. Serialized on the wire in milliseconds.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Whether temporary failures are retried with backoff. Defaults to
    /// `true`.
    #[must_use]
    pub fn retry_on_fail(mut self, retry: bool) -> Self {
        self.retry_on_fail = retry;
        self
    }

    /// Append a raw consumer config entry. Named options take precedence,
    /// except `enable.auto.commit` which an extra entry may override.
    #[must_use]
    pub fn extra_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_configs.insert(key.into(), value.into());
        self
    }

    /// TLS material for the channel's HTTP client.
    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Materialize the server-side consumer config strings.
    pub(crate) fn consumer_configs(&self) -> HashMap<String, String> {
        let mut configs = self.extra_configs.clone();
        configs.insert(AUTO_OFFSET_RESET.to_string(), self.offset.as_str().to_string());
        configs
            .entry(ENABLE_AUTO_COMMIT.to_string())
            .or_insert_with(|| "false".to_string());
        if let Some(timeout) = self.session_timeout {
            configs.insert(SESSION_TIMEOUT_MS.to_string(), timeout.as_millis().to_string());
        }
        if let Some(timeout) = self.request_timeout {
            configs.insert(REQUEST_TIMEOUT_MS.to_string(), timeout.as_millis().to_string());
        }
        configs
    }
}
