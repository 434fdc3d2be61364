//! Pull and push requests against the remote store.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fitsync_common::{Error, Result};

use crate::changeset::{ChangeSet, Cursor};
use crate::config::SyncConfig;
use crate::transport::{RemoteResponse, RemoteTransport};
use crate::validate::{ChangeValidator, NOTHING_TO_SYNC};

/// Query parameter carrying the pull cursor.
pub const CURSOR_PARAM: &str = "last_pulled_at";

/// Result of a pull.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullOutcome {
    /// Inbound changes that passed validation.
    pub changes: ChangeSet,
    /// Cursor to store once the changes are applied; `None` keeps the old one.
    pub cursor: Option<Cursor>,
    /// Validation warnings for the inbound payload.
    pub warnings: Vec<String>,
}

/// Acknowledgement of a push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushAck {
    /// The validated subset that was transmitted and accepted.
    pub sent: ChangeSet,
    /// Server-side versions of the pushed records, if the server echoed them.
    pub echoed: ChangeSet,
    /// Validation warnings for the outbound set.
    pub warnings: Vec<String>,
}

impl PushAck {
    /// Whether anything was transmitted.
    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

/// Talks to the remote store; never touches local state.
pub struct RemoteSyncClient {
    transport: Arc<dyn RemoteTransport>,
    outbound: ChangeValidator,
    inbound: ChangeValidator,
    pull_path: String,
    push_path: String,
    timeout: Duration,
}

impl RemoteSyncClient {
    /// Create a client for the configured endpoints.
    pub fn new(transport: Arc<dyn RemoteTransport>, config: &SyncConfig) -> Self {
        Self {
            transport,
            outbound: ChangeValidator::new(&config.tables),
            inbound: ChangeValidator::structural(),
            pull_path: config.pull_path.clone(),
            push_path: config.push_path.clone(),
            timeout: config.request_timeout(),
        }
    }

    /// Fetch changes since `cursor`, or everything when there is none.
    ///
    /// # Errors
    /// - Network/timeout: the request did not complete
    /// - Remote: error status, `success: false` or a malformed body
    pub async fn pull(&self, cursor: Option<&Cursor>) -> Result<PullOutcome> {
        let query: Vec<(String, String)> = cursor
            .map(|c| vec![(CURSOR_PARAM.to_string(), c.to_string())])
            .unwrap_or_default();
        debug!("Pulling changes since {:?}", cursor.map(Cursor::as_str));

        let response = self
            .bounded(self.transport.get_json(&self.pull_path, &query))
            .await?;
        if response.is_not_found() {
            info!("Pull returned 404, treating as no changes");
            return Ok(PullOutcome::default());
        }
        let body = Self::check(&response)?;

        let changes = match body.get("changes") {
            None | Some(Value::Null) => json!({}),
            Some(changes) => changes.clone(),
        };
        let result = self.inbound.validate(&changes);
        let (changes, warnings) = result.into_result().map_err(|e| Error::Remote {
            status: response.status,
            message: format!("Malformed pull response: {}", e),
        })?;
        for warning in warnings.iter().filter(|w| *w != NOTHING_TO_SYNC) {
            warn!("Inbound validation: {}", warning);
        }

        let cursor = body
            .get("timestamp")
            .and_then(Cursor::from_value)
            .or_else(|| body.get("cursor").and_then(Cursor::from_value));
        info!(
            "Pulled {} changes (next cursor {:?})",
            changes.len(),
            cursor.as_ref().map(Cursor::as_str)
        );
        Ok(PullOutcome {
            changes,
            cursor,
            warnings,
        })
    }

    /// Validate and transmit outbound changes.
    ///
    /// Nothing is sent when validation fails or leaves nothing to send.
    ///
    /// # Errors
    /// - Validation: structurally malformed change set (no request made)
    /// - Network/timeout: the request did not complete
    /// - Remote: error status or `success: false`
    pub async fn push(&self, changes: &ChangeSet) -> Result<PushAck> {
        let (sent, warnings) = self.outbound.validate_change_set(changes).into_result()?;
        for warning in &warnings {
            warn!("Outbound validation: {}", warning);
        }
        if sent.is_empty() {
            debug!("Nothing to push after validation");
            return Ok(PushAck {
                warnings,
                ..Default::default()
            });
        }

        let body = json!({ "changes": sent.to_value() });
        let response = self
            .bounded(self.transport.post_json(&self.push_path, &body))
            .await?;
        if response.is_not_found() {
            info!("Push returned 404, treating as no-op");
            return Ok(PushAck {
                warnings,
                ..Default::default()
            });
        }
        let ack = Self::check(&response)?;

        let echoed = match ack.get("changes") {
            None | Some(Value::Null) => ChangeSet::new(),
            Some(changes) => match self.inbound.validate(changes).into_result() {
                Ok((echoed, _)) => echoed,
                Err(e) => {
                    warn!("Ignoring malformed push acknowledgement: {}", e);
                    ChangeSet::new()
                }
            },
        };
        info!("Pushed {} changes", sent.len());
        Ok(PushAck {
            sent,
            echoed,
            warnings,
        })
    }

    async fn bounded<F>(&self, request: F) -> Result<RemoteResponse>
    where
        F: Future<Output = Result<RemoteResponse>>,
    {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| Error::Timeout(format!("No response within {:?}", self.timeout)))?
    }

    /// Body of a successful response, or the application-level failure.
    fn check(response: &RemoteResponse) -> Result<&Value> {
        let message = |fallback: String| {
            response
                .body
                .get("error")
                .or_else(|| response.body.get("message"))
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or(fallback)
        };
        if !response.is_success() {
            return Err(Error::Remote {
                status: response.status,
                message: message(format!("HTTP {}", response.status)),
            });
        }
        if response.body.get("success") == Some(&Value::Bool(false)) {
            return Err(Error::Remote {
                status: response.status,
                message: message("Request rejected".to_string()),
            });
        }
        if !response.body.is_object() && !response.body.is_null() {
            return Err(Error::Remote {
                status: response.status,
                message: "Response body is not a JSON object".to_string(),
            });
        }
        Ok(&response.body)
    }
}
