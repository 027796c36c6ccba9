//! Subscription Routing Types
//!
//! Fan-out records that map an exchange event stream to the local sessions
//! that asked for it.
//!
//! # Design
//!
//! Entries hold a [`SessionId`] rather than the session itself, so a
//! subscription never keeps a closed connection alive. Liveness is decided
//! by whoever owns the sessions; the registry only compacts entries whose
//! session is reported dead.
//!
//! Unsubscribe is not modelled. Subscribing twice adds a second entry, and
//! entries disappear only when their session does.

use std::fmt;

use parking_lot::Mutex;

// =============================================================================
// Types
// =============================================================================

/// Stable identifier of one local client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Kind of exchange event a session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Order book updates for an instrument.
    Orderbook,
    /// Position updates for an instrument on the authenticated account.
    Position,
}

impl SubscriptionKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Orderbook => "orderbook",
            Self::Position => "position",
        }
    }
}

/// One fan-out routing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    /// Event kind.
    pub kind: SubscriptionKind,
    /// Instrument name, e.g. `BTC-PERPETUAL`.
    pub symbol: String,
    /// Session that receives matching events.
    pub session: SessionId,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe list of subscription entries.
///
/// # Example
///
/// ```
/// use deribit_bridge::domain::subscription::{SessionId, SubscriptionKind, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new();
/// registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", SessionId::new(1));
/// registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", SessionId::new(2));
///
/// let targets = registry.matching(SubscriptionKind::Orderbook, "BTC-PERPETUAL");
/// assert_eq!(targets, vec![SessionId::new(1), SessionId::new(2)]);
///
/// // Session 2 went away.
/// registry.purge(|id| id == SessionId::new(1));
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session` wants `kind` events for `symbol`.
    pub fn add(&self, kind: SubscriptionKind, symbol: &str, session: SessionId) {
        self.entries.lock().push(SubscriptionEntry {
            kind,
            symbol: symbol.to_string(),
            session,
        });
    }

    /// Drop every entry whose session is not live. Returns the number removed.
    pub fn purge(&self, is_live: impl Fn(SessionId) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| is_live(entry.session));
        before - entries.len()
    }

    /// Drop every entry held by `session`. Returns the number removed.
    pub fn remove_session(&self, session: SessionId) -> usize {
        self.purge(|id| id != session)
    }

    /// Sessions subscribed to `(kind, symbol)`, in subscription order.
    ///
    /// A session subscribed twice appears twice.
    #[must_use]
    pub fn matching(&self, kind: SubscriptionKind, symbol: &str) -> Vec<SessionId> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.kind == kind && entry.symbol == symbol)
            .map(|entry| entry.session)
            .collect()
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<SubscriptionEntry> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: u64) -> SessionId {
        SessionId::new(raw)
    }

    #[test]
    fn add_and_match() {
        let registry = SubscriptionRegistry::new();
        registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", sid(1));
        registry.add(SubscriptionKind::Position, "BTC-PERPETUAL", sid(2));
        registry.add(SubscriptionKind::Orderbook, "ETH-PERPETUAL", sid(3));

        assert_eq!(
            registry.matching(SubscriptionKind::Orderbook, "BTC-PERPETUAL"),
            vec![sid(1)]
        );
        assert_eq!(
            registry.matching(SubscriptionKind::Position, "BTC-PERPETUAL"),
            vec![sid(2)]
        );
        assert!(
            registry
                .matching(SubscriptionKind::Position, "ETH-PERPETUAL")
                .is_empty()
        );
    }

    #[test]
    fn one_session_many_entries() {
        let registry = SubscriptionRegistry::new();
        registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", sid(1));
        registry.add(SubscriptionKind::Orderbook, "ETH-PERPETUAL", sid(1));
        registry.add(SubscriptionKind::Position, "BTC-PERPETUAL", sid(1));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.remove_session(sid(1)), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn resubscribe_adds_entry() {
        let registry = SubscriptionRegistry::new();
        registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", sid(1));
        registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", sid(1));

        assert_eq!(
            registry.matching(SubscriptionKind::Orderbook, "BTC-PERPETUAL"),
            vec![sid(1), sid(1)]
        );
    }

    #[test]
    fn purge_keeps_live_sessions() {
        let registry = SubscriptionRegistry::new();
        for raw in 1..=4 {
            registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", sid(raw));
        }

        let removed = registry.purge(|id| id.get() % 2 == 0);

        assert_eq!(removed, 2);
        assert_eq!(
            registry.matching(SubscriptionKind::Orderbook, "BTC-PERPETUAL"),
            vec![sid(2), sid(4)]
        );
    }

    #[test]
    fn symbol_match_is_exact() {
        let registry = SubscriptionRegistry::new();
        registry.add(SubscriptionKind::Orderbook, "BTC-PERPETUAL", sid(1));

        assert!(
            registry
                .matching(SubscriptionKind::Orderbook, "btc-perpetual")
                .is_empty()
        );
        assert!(registry.matching(SubscriptionKind::Orderbook, "BTC").is_empty());
    }

    #[test]
    fn session_id_display() {
        assert_eq!(sid(42).to_string(), "session-42");
    }
}
