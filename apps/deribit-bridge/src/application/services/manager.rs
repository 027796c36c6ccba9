//! Bridge Manager
//!
//! Owns the exchange connector, the local broker and the router between
//! them, and sequences their lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use super::router::Router;
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::broker::{BrokerError, BrokerServer, BrokerSettings, SessionRegistry};
use crate::infrastructure::deribit::connector::{CloseOutcome, Connector, ConnectorError};
use crate::infrastructure::metrics;

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Broker failed to start.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Upstream connection failed.
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Wires the connector and broker through a [`Router`].
pub struct Manager {
    connector: Arc<Connector>,
    broker: Arc<BrokerServer>,
    router: Arc<Router>,
    stopped: AtomicBool,
}

impl Manager {
    /// Build a manager around an unconnected connector.
    #[must_use]
    pub fn new(connector: Connector, broker: BrokerSettings, book_interval: &str) -> Self {
        let connector = Arc::new(connector);
        let broker = Arc::new(BrokerServer::new(broker));
        let router = Arc::new(Router::new(
            Arc::clone(&connector) as _,
            broker.registry() as _,
            book_interval,
        ));

        Self {
            connector,
            broker,
            router,
            stopped: AtomicBool::new(false),
        }
    }

    /// Start the local broker.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the listener cannot be bound.
    pub async fn start(&self) -> Result<SocketAddr, ManagerError> {
        let addr = self.broker.run(Arc::clone(&self.router) as _).await?;
        Ok(addr)
    }

    /// Connect to the exchange. No retry is attempted on failure.
    ///
    /// # Errors
    ///
    /// Returns the connector error.
    pub async fn connect_upstream(
        &self,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<(), ManagerError> {
        self.connector
            .connect(host, port, path, Arc::clone(&self.router) as _)
            .await?;
        Ok(())
    }

    /// Forward a raw text frame to the exchange.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::NotConnected` when the connection is not
    /// open, or the write error.
    pub async fn send_upstream(&self, text: &str) -> Result<(), ManagerError> {
        self.connector.send_message(text).await?;
        Ok(())
    }

    /// Whether the exchange connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connector.is_open()
    }

    /// False after [`stop`](Self::stop) or once the exchange connection
    /// has closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.router.is_running()
    }

    /// Close the exchange connection (if open), stop the broker, then drop
    /// every subscription entry. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.connector.is_open() {
            tracing::info!("Closing Deribit connection");
            match self.connector.close().await {
                Ok(CloseOutcome::Closed | CloseOutcome::AlreadyClosed) => {}
                Err(e) => tracing::error!(error = %e, "Deribit close failed"),
            }
        }

        tracing::info!("Stopping local broker");
        self.broker.stop().await;
        self.router.halt();

        let subscriptions = self.router.subscriptions();
        let dropped = subscriptions.len();
        subscriptions.clear();
        metrics::set_subscription_entries(0);
        tracing::debug!(entries_dropped = dropped, "Subscription registry cleared");
    }

    /// Exchange connector.
    #[must_use]
    pub fn connector(&self) -> Arc<Connector> {
        Arc::clone(&self.connector)
    }

    /// Local broker.
    #[must_use]
    pub fn broker(&self) -> Arc<BrokerServer> {
        Arc::clone(&self.broker)
    }

    /// Router.
    #[must_use]
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Live local sessions.
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.broker.registry()
    }

    /// Subscription entries.
    #[must_use]
    pub fn subscriptions(&self) -> Arc<SubscriptionRegistry> {
        self.router.subscriptions()
    }
}
