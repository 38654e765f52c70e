//! HTTP client for downloading pages

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use reqwest::{Client, redirect::Policy};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::fetch::{FailureKind, FetchFailure};
use crate::config::FetchConfig;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// One GET with a chosen certificate policy
///
/// The download state machine only sees classified [`FetchFailure`]s, so
/// tests can drive it without a network.
#[async_trait]
pub trait PageClient: Send + Sync {
    async fn get(&self, url: &Url, verify_tls: bool) -> Result<Bytes, FetchFailure>;
}

/// HTTP client settings
#[derive(Debug, Clone, Builder)]
pub struct FetchSettings {
    /// Applies to connect and to the whole response
    #[builder(default = Duration::from_secs(5))]
    pub timeout: Duration,
    #[builder(into, default = "Mozilla/5.0".to_string())]
    pub user_agent: String,
    #[builder(default = 10)]
    pub max_redirects: usize,
}

impl From<&FetchConfig> for FetchSettings {
    fn from(config: &FetchConfig) -> Self {
        FetchSettings::builder()
            .timeout(config.timeout.as_duration())
            .user_agent(config.user_agent.clone())
            .max_redirects(config.max_redirects)
            .build()
    }
}

/// reqwest-backed [`PageClient`]
///
/// Holds two clients that differ only in certificate verification.
#[derive(Debug, Clone)]
pub struct HttpPageClient {
    verifying: Client,
    insecure: Client,
}

impl HttpPageClient {
    pub fn new(settings: &FetchSettings) -> Result<Self, ClientError> {
        Ok(Self {
            verifying: build_client(settings, true)?,
            insecure: build_client(settings, false)?,
        })
    }
}

fn build_client(settings: &FetchSettings, verify_tls: bool) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(settings.timeout)
        .timeout(settings.timeout)
        .user_agent(&settings.user_agent)
        .redirect(Policy::limited(settings.max_redirects))
        .danger_accept_invalid_certs(!verify_tls)
        .build()
}

#[async_trait]
impl PageClient for HttpPageClient {
    async fn get(&self, url: &Url, verify_tls: bool) -> Result<Bytes, FetchFailure> {
        let client = if verify_tls {
            &self.verifying
        } else {
            &self.insecure
        };

        debug!(%url, verify_tls, "Starting download");

        let response = client.get(url.clone()).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::new(
                FailureKind::Status(status.as_u16()),
                format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ),
            ));
        }

        let body = response.bytes().await.map_err(classify)?;
        debug!(%url, size = body.len(), "Download completed");

        Ok(body)
    }
}

/// Map a reqwest error onto the state machine's failure kinds
fn classify(error: reqwest::Error) -> FetchFailure {
    let message = error_chain(&error);
    // The URL is part of the display text and must not feed the TLS match
    let error = error.without_url();

    let kind = if error.is_redirect() {
        FailureKind::TooManyRedirects
    } else if is_tls_error(&error) {
        FailureKind::Tls
    } else if error.is_connect() {
        // Includes connect timeouts: the host was never reached
        FailureKind::Connect
    } else if error.is_timeout() {
        FailureKind::Timeout
    } else {
        FailureKind::Other
    };

    FetchFailure::new(kind, message)
}

const TLS_MARKERS: [&str; 4] = ["certificate", "tls", "ssl", "handshake"];

/// reqwest has no TLS error kind; look for TLS wording anywhere in the chain
fn is_tls_error(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        let text = err.to_string().to_lowercase();
        if TLS_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
        current = err.source();
    }
    false
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut current = error.source();
    while let Some(err) = current {
        parts.push(err.to_string());
        current = err.source();
    }
    parts.join(": ")
}
