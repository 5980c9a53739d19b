#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]

//! # Databus streaming client
//!
//! Client for REST-fronted streaming message services that broker records on
//! named topics. Features include:
//!
//! * A stateful [`Channel`] binding one consumer group to one server-side
//!   consumer instance (create → subscribe → poll → commit → delete)
//! * A long-running consume loop with cooperative cancellation via
//!   [`Channel::run`] and [`Channel::stop`]
//! * Exponential-backoff retries for temporary failures
//! * Transparent recovery when the server forgets the consumer: the channel
//!   re-creates it and re-installs the last requested subscriptions
//! * Pluggable authentication through the [`Authorizer`] trait, with
//!   username/password login and `OAuth2` client-credentials strategies
//!   built in
//! * Produce helpers that base64-encode JSON payloads the way the consuming
//!   side decodes them
//!
//! # Example
//!
//! Consume records from a topic and print each decoded payload. The process
//! closure decides after every batch whether the loop keeps going; a clone
//! of the channel can stop it from another task at any time.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use databus_client::{Channel, ChannelConfig, CredentialsAuthorizer, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> databus_client::Result<()> {
//!     let auth = CredentialsAuthorizer::builder("https://broker.example.com", "user", "secret")
//!         .build()?;
//!
//!     let config = ChannelConfig::new()
//!         .consumer_group("my-group")
//!         .auth(auth);
//!     let channel = Channel::new("https://broker.example.com", config)?;
//!
//!     let options = RunOptions::new()
//!         .topics(["telemetry"])
//!         .wait_between_queries(Duration::from_secs(5));
//!     channel
//!         .run(
//!             |payloads| async move {
//!                 for payload in payloads {
//!                     println!("{payload}");
//!                 }
//!                 Ok(true)
//!             },
//!             options,
//!         )
//!         .await
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **default**: Includes `rustls-tls`.
//! - **rustls-tls**: Enables `reqwest/rustls-tls` and
//!   `reqwest/rustls-tls-native-roots`.

mod authorizers;
mod channel;
mod client;
mod config;
pub mod error;
mod records;
mod retry;
mod run;

pub use authorizers::*;
pub use channel::Channel;
pub use config::{
    ChannelConfig, OffsetReset, TlsOptions, DEFAULT_CONSUMER_PATH_PREFIX,
    DEFAULT_PRODUCER_PATH_PREFIX,
};
pub use error::{Error, Result};
pub use records::{
    decode_payload, encode_payload, CommitEntry, ConsumedPayload, ConsumedRecord, ProduceRecord,
    ProduceRecords, RecordMessage, RoutingData, RECORDS_CONTENT_TYPE,
};
pub use run::RunOptions;
