//! Download state machine
//!
//! A page download walks a fixed chain of fallbacks before giving up:
//!
//! ```text
//! TryHttps ──tls──▶ TryHttpsNoVerify ──tls──▶ Skipped(tls_failure)
//!    │                    │
//!    └──connect──▶ TryWww ◀──connect──┘
//!                    │
//!                    └──tls/connect──▶ Skipped(unreachable)
//! ```
//!
//! Timeouts, redirect loops, non-2xx answers and any other request failure
//! end the chain immediately. Every non-terminal transition moves to a
//! strictly higher [`FetchState::rank`], so a URL gets at most three network
//! attempts.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use url::{Host, Url};

use super::http::PageClient;

/// What went wrong with one network attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Certificate or handshake failure
    Tls,
    /// Name resolution, refused or reset connection, connect timeout
    Connect,
    /// Response not received within the fetch timeout
    Timeout,
    TooManyRedirects,
    /// Answered, but not with a 2xx status
    Status(u16),
    Other,
}

/// A failed attempt with the raw error text kept for debug logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Why a URL was given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TlsFailure,
    Unreachable,
    Timeout,
    RedirectLoop,
    HttpStatus(u16),
    RequestFailed,
    InvalidUrl,
    WriteFailed,
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::TlsFailure => "tls_failure",
            SkipReason::Unreachable => "unreachable",
            SkipReason::Timeout => "timeout",
            SkipReason::RedirectLoop => "redirect_loop",
            SkipReason::HttpStatus(_) => "http_status",
            SkipReason::RequestFailed => "request_failed",
            SkipReason::InvalidUrl => "invalid_url",
            SkipReason::WriteFailed => "write_failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::HttpStatus(status) => write!(f, "http_status({})", status),
            other => f.write_str(other.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Original URL, certificate verified
    TryHttps,
    /// Original URL, certificate not verified
    TryHttpsNoVerify,
    /// `www.` prepended to the host, certificate verified
    TryWww,
    Skipped(SkipReason),
    Written,
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchState::Skipped(_) | FetchState::Written)
    }

    /// Position in the fallback chain; terminal states rank last
    pub fn rank(&self) -> u8 {
        match self {
            FetchState::TryHttps => 0,
            FetchState::TryHttpsNoVerify => 1,
            FetchState::TryWww => 2,
            FetchState::Skipped(_) | FetchState::Written => 3,
        }
    }

    pub fn verify_tls(&self) -> bool {
        !matches!(self, FetchState::TryHttpsNoVerify)
    }

    /// Next state after an attempt in `self` failed with `failure`
    ///
    /// `www_available` is false when the host already starts with `www.` or
    /// cannot take a `www.` prefix (IP literals).
    pub fn on_failure(self, failure: FailureKind, www_available: bool) -> FetchState {
        use FetchState::*;

        match (self, failure) {
            (Skipped(_) | Written, _) => self,

            (_, FailureKind::Timeout) => Skipped(SkipReason::Timeout),
            (_, FailureKind::TooManyRedirects) => Skipped(SkipReason::RedirectLoop),
            (_, FailureKind::Status(status)) => Skipped(SkipReason::HttpStatus(status)),
            (_, FailureKind::Other) => Skipped(SkipReason::RequestFailed),

            (TryHttps, FailureKind::Tls) => TryHttpsNoVerify,
            (TryHttpsNoVerify, FailureKind::Tls) => Skipped(SkipReason::TlsFailure),

            (TryHttps | TryHttpsNoVerify, FailureKind::Connect) if www_available => TryWww,
            (TryHttps | TryHttpsNoVerify, FailureKind::Connect) => Skipped(SkipReason::Unreachable),

            (TryWww, FailureKind::Tls | FailureKind::Connect) => Skipped(SkipReason::Unreachable),
        }
    }
}

/// Terminal result of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Written {
        /// URL of the attempt that succeeded
        url: String,
        path: PathBuf,
        bytes: usize,
    },
    Skipped {
        url: String,
        reason: SkipReason,
    },
}

impl Outcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Outcome::Written { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Outcome::Skipped { reason, .. } => Some(*reason),
            Outcome::Written { .. } => None,
        }
    }
}

/// `<host>.html`
pub fn filename_for(url: &Url) -> Option<String> {
    url.host_str().map(|host| format!("{}.html", host))
}

fn www_variant(url: &Url) -> Option<Url> {
    match url.host()? {
        Host::Domain(domain) if !domain.starts_with("www.") => {
            let mut variant = url.clone();
            variant.set_host(Some(&format!("www.{}", domain))).ok()?;
            Some(variant)
        }
        _ => None,
    }
}

/// Runs the state machine for one URL against a [`PageClient`]
#[derive(Debug, Clone)]
pub struct Downloader<C> {
    client: C,
}

impl<C: PageClient> Downloader<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Download `url` into `directory/<host>.html`
    ///
    /// Never fails: every path ends in [`Outcome::Written`] or
    /// [`Outcome::Skipped`]. An existing file is overwritten.
    pub async fn fetch(&self, url: &str, directory: &Path) -> Outcome {
        let skipped = |reason| Outcome::Skipped {
            url: url.to_string(),
            reason,
        };

        let original = match Url::parse(url) {
            Ok(parsed) if parsed.host_str().is_some() => parsed,
            Ok(_) => {
                error!(url, "URL has no host, skipping");
                return skipped(SkipReason::InvalidUrl);
            }
            Err(e) => {
                debug!(url, error = %e, "URL parse error");
                error!(url, "Invalid URL, skipping");
                return skipped(SkipReason::InvalidUrl);
            }
        };
        let www = www_variant(&original);

        // Success returns from inside the loop; a break is always a skip
        let mut state = FetchState::TryHttps;
        let reason = loop {
            let target = match (state, &www) {
                (FetchState::Skipped(reason), _) => break reason,
                (FetchState::TryWww, Some(variant)) => variant,
                (FetchState::TryWww, None) => break SkipReason::Unreachable,
                _ => &original,
            };

            match self.client.get(target, state.verify_tls()).await {
                Ok(body) => return self.write(target, directory, &body).await,
                Err(failure) => {
                    debug!(url = %target, error = %failure, "Download attempt failed");
                    let next = state.on_failure(failure.kind, www.is_some());
                    log_transition(target, state, next);
                    state = next;
                }
            }
        };

        skipped(reason)
    }

    async fn write(&self, target: &Url, directory: &Path, body: &[u8]) -> Outcome {
        let Some(filename) = filename_for(target) else {
            return Outcome::Skipped {
                url: target.to_string(),
                reason: SkipReason::InvalidUrl,
            };
        };
        let path = directory.join(filename);

        info!(url = %target, path = %path.display(), "Downloaded site, writing to file");
        match tokio::fs::write(&path, body).await {
            Ok(()) => Outcome::Written {
                url: target.to_string(),
                path,
                bytes: body.len(),
            },
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to write page, skipping");
                Outcome::Skipped {
                    url: target.to_string(),
                    reason: SkipReason::WriteFailed,
                }
            }
        }
    }
}

fn log_transition(url: &Url, from: FetchState, to: FetchState) {
    match (from, to) {
        (_, FetchState::TryHttpsNoVerify) => {
            warn!(%url, "Encountered SSL error, trying without certificate verification")
        }
        (_, FetchState::TryWww) => {
            warn!(%url, "Encountered connection error, trying with added \"www.\"")
        }
        (_, FetchState::Skipped(reason)) => {
            error!(%url, reason = %reason, "Download failed, skipping")
        }
        _ => {}
    }
}
