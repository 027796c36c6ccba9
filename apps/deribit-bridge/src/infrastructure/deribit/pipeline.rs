//! Authenticated Request Pipeline
//!
//! Serializes trading API calls from any number of callers through one
//! credentialed worker task.
//!
//! # Design
//!
//! ```text
//! caller ─┐                    ┌──────────────────────────────────┐
//! caller ─┼─► bounded queue ──►│ worker: refresh token if needed, │──► HTTP
//! caller ─┘   (FIFO)           │ sign, execute, resolve handle    │
//!                              └──────────────────────────────────┘
//! ```
//!
//! - Arguments are validated on the caller's task. Invalid requests never
//!   reach the queue.
//! - Requests are executed strictly in submission order.
//! - The worker owns the token. Re-authentication happens on the worker,
//!   immediately before the request that needed it.
//! - A failed request resolves its own handle and the worker moves on.
//! - Abandoning a [`PendingResponse`] (timeout, drop) does not cancel the
//!   request; its result is discarded when it arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::auth::{AuthError, Credentials, TokenState};
use super::messages::{AuthParams, AuthResult, RpcError, RpcRequest};
use crate::application::ports::{RpcTransport, TransportError};
use crate::domain::order::{EditParams, OrderError, OrderRequest};
use crate::infrastructure::metrics::{self, RequestOutcome};

// =============================================================================
// Constants
// =============================================================================

/// Path of the JSON-RPC endpoint. Methods are appended as `/<method>`.
pub const API_PATH: &str = "/api/v2";

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// Error Types
// =============================================================================

/// Errors resolved into a caller's handle, or raised synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Argument validation failed. Never queued.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] OrderError),

    /// Initial or periodic authentication failed.
    #[error("authentication error: {0}")]
    Authentication(#[from] AuthError),

    /// HTTP call failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The exchange answered with a JSON-RPC error.
    #[error("exchange error: {0}")]
    Api(RpcError),

    /// Request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),

    /// Queue is at capacity.
    #[error("request queue is full")]
    QueueFull,

    /// Pipeline has been shut down.
    #[error("request pipeline is shut down")]
    QueueClosed,

    /// Caller stopped waiting. The request itself still runs.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Worker went away without resolving the request.
    #[error("request dropped before completion")]
    Dropped,
}

// =============================================================================
// Requests and Handles
// =============================================================================

type Reply = Result<Value, PipelineError>;

/// One queued API call.
#[derive(Debug)]
pub struct ApiRequest {
    /// API method, e.g. `private/cancel`.
    pub method: String,
    /// Method parameters.
    pub params: Value,
    /// When the request was queued.
    pub enqueued_at: Instant,
    reply: oneshot::Sender<Reply>,
}

/// Handle to the eventual result of a queued request.
///
/// Resolved exactly once, with either the response body or an error.
#[derive(Debug)]
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    rx: oneshot::Receiver<Reply>,
}

impl PendingResponse {
    /// Wait for the result.
    ///
    /// # Errors
    ///
    /// Returns the request's failure, or `PipelineError::Dropped` if the
    /// worker exited without answering.
    pub async fn wait(self) -> Result<Value, PipelineError> {
        self.rx.await.unwrap_or(Err(PipelineError::Dropped))
    }

    /// Wait for the result for at most `timeout`.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait), plus `PipelineError::Timeout` when the
    /// deadline passes first.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Value, PipelineError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(PipelineError::Timeout(timeout)))
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    reauthentications: AtomicU64,
    depth: AtomicUsize,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    /// Requests accepted into the queue.
    pub submitted: u64,
    /// Requests resolved with a response.
    pub succeeded: u64,
    /// Requests resolved with an error.
    pub failed: u64,
    /// Re-authentications performed after startup.
    pub reauthentications: u64,
    /// Requests waiting in the queue.
    pub queue_depth: usize,
}

impl PipelineStats {
    fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reauthentications: self.reauthentications.load(Ordering::Relaxed),
            queue_depth: self.depth.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Pipeline settings.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Maximum queued requests.
    pub queue_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Serialized, authenticated request pipeline.
pub struct Pipeline {
    sender: Mutex<Option<mpsc::Sender<ApiRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Authenticate and start the worker.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Authentication` if the initial
    /// authentication fails. No worker is started in that case.
    pub async fn start(
        credentials: Credentials,
        transport: Arc<dyn RpcTransport>,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        let mut ids = RequestIds::from_clock();
        let token = authenticate(transport.as_ref(), &credentials, ids.next()).await?;

        tracing::info!(
            expires_in = token.expires_in(),
            "Authenticated with trading API"
        );

        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));

        let worker = Worker {
            credentials,
            transport,
            token,
            ids,
            stats: Arc::clone(&stats),
        };
        let handle = tokio::spawn(worker.run(rx));

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            stats,
        })
    }

    /// Place a new order. See [`OrderRequest::compose`] for the rules.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` for invalid arguments, or a
    /// queue error if the request cannot be queued.
    pub fn place_order(
        &self,
        instrument: &str,
        side: &str,
        order_type: &str,
        amount: Decimal,
        price: Option<Decimal>,
        reduce_only: bool,
    ) -> Result<PendingResponse, PipelineError> {
        let order =
            OrderRequest::compose(instrument, side, order_type, amount, price, reduce_only)?;
        self.submit(order.method(), encode(&order.params)?)
    }

    /// Cancel an order.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` if `order_id` is empty, or a
    /// queue error.
    pub fn cancel_order(&self, order_id: &str) -> Result<PendingResponse, PipelineError> {
        require("order_id", order_id)?;
        self.submit("private/cancel", json!({ "order_id": order_id }))
    }

    /// Change the price and amount of an open order.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` if `order_id` is empty or the
    /// amount is not positive, or a queue error.
    pub fn modify_order(
        &self,
        order_id: &str,
        new_price: Decimal,
        new_amount: Decimal,
    ) -> Result<PendingResponse, PipelineError> {
        let params = EditParams::compose(order_id, new_price, new_amount)?;
        self.submit("private/edit", encode(&params)?)
    }

    /// List all open orders.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the request cannot be queued.
    pub fn get_active_orders(&self) -> Result<PendingResponse, PipelineError> {
        self.submit("private/get_open_orders", json!({ "type": "all" }))
    }

    /// Fetch the state of one order.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` if `order_id` is empty, or a
    /// queue error.
    pub fn get_order_state(&self, order_id: &str) -> Result<PendingResponse, PipelineError> {
        require("order_id", order_id)?;
        self.submit("private/get_order_state", json!({ "order_id": order_id }))
    }

    /// Fetch the top of the order book.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` if `instrument` is empty, or
    /// a queue error.
    pub fn get_orderbook(&self, instrument: &str) -> Result<PendingResponse, PipelineError> {
        require("instrument", instrument)?;
        self.submit(
            "public/get_order_book",
            json!({ "instrument_name": instrument, "depth": 1 }),
        )
    }

    /// Fetch details of one instrument.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` if `instrument` is empty, or
    /// a queue error.
    pub fn get_instrument(&self, instrument: &str) -> Result<PendingResponse, PipelineError> {
        require("instrument", instrument)?;
        self.submit(
            "public/get_instrument",
            json!({ "instrument_name": instrument }),
        )
    }

    /// List active instruments for a currency and kind.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` if `currency` or `kind` is
    /// empty, or a queue error.
    pub fn get_instruments(
        &self,
        currency: &str,
        kind: &str,
    ) -> Result<PendingResponse, PipelineError> {
        require("currency", currency)?;
        require("kind", kind)?;
        self.submit(
            "public/get_instruments",
            json!({ "currency": currency, "kind": kind, "expired": false }),
        )
    }

    /// List positions for a currency.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::InvalidArgument` if `currency` is empty, or a
    /// queue error.
    pub fn get_positions(&self, currency: &str) -> Result<PendingResponse, PipelineError> {
        require("currency", currency)?;
        self.submit("private/get_positions", json!({ "currency": currency }))
    }

    /// Queue an arbitrary API call.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::QueueFull` or `PipelineError::QueueClosed`.
    pub fn submit(&self, method: &str, params: Value) -> Result<PendingResponse, PipelineError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(PipelineError::QueueClosed)?;

        let (reply, rx) = oneshot::channel();
        let request = ApiRequest {
            method: method.to_string(),
            params,
            enqueued_at: Instant::now(),
            reply,
        };

        self.stats.depth.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = sender.try_send(request) {
            self.stats.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => PipelineError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PipelineError::QueueClosed,
            });
        }

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::set_pipeline_queue_depth(self.stats.depth.load(Ordering::Relaxed));
        tracing::debug!(method, "Request queued");

        Ok(PendingResponse { rx })
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the pipeline still accepts requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting requests, let the worker finish everything already
    /// queued, and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Pipeline worker panicked");
            }
            tracing::info!("Request pipeline stopped");
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    credentials: Credentials,
    transport: Arc<dyn RpcTransport>,
    token: TokenState,
    ids: RequestIds,
    stats: Arc<PipelineStats>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<ApiRequest>) {
        while let Some(request) = rx.recv().await {
            self.stats.depth.fetch_sub(1, Ordering::Relaxed);
            metrics::set_pipeline_queue_depth(self.stats.depth.load(Ordering::Relaxed));

            let ApiRequest {
                method,
                params,
                enqueued_at,
                reply,
            } = request;

            let result = self.execute(&method, params).await;
            let outcome = match &result {
                Ok(_) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    RequestOutcome::Success
                }
                Err(PipelineError::Api(e)) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(method = %method, code = e.code, error = %e.message, "Exchange rejected request");
                    RequestOutcome::Rejected
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(method = %method, error = %e, "Request failed");
                    RequestOutcome::Failed
                }
            };
            metrics::record_pipeline_request(outcome, enqueued_at.elapsed());

            // The caller may have timed out and dropped its handle.
            let _ = reply.send(result);
        }

        tracing::debug!("Pipeline worker drained");
    }

    async fn execute(&mut self, method: &str, params: Value) -> Result<Value, PipelineError> {
        if self.token.needs_refresh(Instant::now()) {
            tracing::info!(
                expires_in = self.token.expires_in(),
                "Access token near expiry, re-authenticating"
            );
            self.token =
                authenticate(self.transport.as_ref(), &self.credentials, self.ids.next()).await?;
            self.stats.reauthentications.fetch_add(1, Ordering::Relaxed);
            metrics::record_reauthentication();
        }

        let id = self.ids.next();
        let body = encode(&RpcRequest::new(id, method, params))?;
        let path = format!("{API_PATH}/{method}");

        tracing::debug!(method, id, "Dispatching request");

        let response = self
            .transport
            .post(&path, &body, Some(self.token.access_token()))
            .await?;

        if let Some(error) = response.get("error") {
            return Err(PipelineError::Api(RpcError::from_value(error)));
        }

        Ok(response)
    }
}

/// Run the client-credentials grant.
async fn authenticate(
    transport: &dyn RpcTransport,
    credentials: &Credentials,
    id: u64,
) -> Result<TokenState, AuthError> {
    let params = AuthParams::client_credentials(credentials.api_key(), credentials.api_secret());
    let body = serde_json::to_value(RpcRequest::new(id, "public/auth", params))
        .map_err(|e| AuthError::Transport(e.to_string()))?;

    let response = transport
        .post(API_PATH, &body, None)
        .await
        .map_err(|e| AuthError::Transport(e.to_string()))?;

    let Some(result) = response.get("result") else {
        return Err(AuthError::Rejected(response.to_string()));
    };

    let result: AuthResult = serde_json::from_value(result.clone())
        .map_err(|e| AuthError::Rejected(format!("{e}: {response}")))?;

    Ok(TokenState::from_result(result, Instant::now()))
}

// =============================================================================
// Helpers
// =============================================================================

/// Strictly increasing request ids, seeded from wall-clock milliseconds.
#[derive(Debug)]
struct RequestIds {
    next: u64,
}

impl RequestIds {
    fn from_clock() -> Self {
        let millis = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(1);
        Self { next: millis }
    }

    const fn next(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

fn require(field: &'static str, value: &str) -> Result<(), PipelineError> {
    if value.is_empty() {
        return Err(OrderError::EmptyField(field).into());
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> Result<Value, PipelineError> {
    serde_json::to_value(value).map_err(|e| PipelineError::Encode(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_increase() {
        let mut ids = RequestIds::from_clock();
        let a = ids.next();
        let b = ids.next();
        assert!(a > 1_600_000_000_000);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn require_rejects_empty() {
        assert_eq!(
            require("order_id", "").unwrap_err(),
            PipelineError::InvalidArgument(OrderError::EmptyField("order_id"))
        );
        assert!(require("order_id", "ETH-1").is_ok());
    }

    #[tokio::test]
    async fn dropped_sender_resolves_as_dropped() {
        let (tx, rx) = oneshot::channel::<Reply>();
        drop(tx);
        let pending = PendingResponse { rx };
        assert_eq!(pending.wait().await.unwrap_err(), PipelineError::Dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_releases_caller() {
        let (tx, rx) = oneshot::channel::<Reply>();
        let pending = PendingResponse { rx };

        let err = pending
            .wait_timeout(Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Timeout(Duration::from_secs(30)));

        // Late resolution after the caller left is harmless.
        assert!(tx.send(Ok(Value::Null)).is_err());
    }
}
