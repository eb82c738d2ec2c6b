use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::beacon::conn::HandshakeConnection;

/// The sink side of one virtual server's worker pool.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub hostname: String,
    tx: mpsc::Sender<HandshakeConnection>,
}

impl ServerHandle {
    pub fn new(hostname: String, tx: mpsc::Sender<HandshakeConnection>) -> Self {
        Self { hostname, tx }
    }

    /// Hands the connection to the pool. Blocks while the pool is saturated;
    /// that backpressure is what throttles the gateway. On a closed pool the
    /// connection comes back to the caller.
    pub async fn deliver(
        &self,
        conn: HandshakeConnection,
    ) -> Result<(), HandshakeConnection> {
        self.tx.send(conn).await.map_err(|err| err.0)
    }
}

/// Normalizes a routing key: the prefix before the first NUL byte (Forge
/// appends `\0FML\0`), trimmed and lower-cased.
pub fn normalize_hostname(raw: &str) -> String {
    let host = raw.split('\0').next().unwrap_or(raw);
    host.trim().to_ascii_lowercase()
}

/// Hostname to server-pool mapping.
///
/// Read lock-free by every gateway worker; replaced wholesale by its single
/// owner via copy-on-write publication. Partial updates are impossible by
/// construction.
#[derive(Debug, Default)]
pub struct RoutingTable {
    table: ArcSwap<HashMap<String, ServerHandle>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a complete new table built from `handles`. Later entries for
    /// the same hostname win, matching config precedence.
    pub fn publish(&self, handles: Vec<ServerHandle>) {
        let mut table = HashMap::with_capacity(handles.len());
        for h in handles {
            table.insert(normalize_hostname(&h.hostname), h);
        }
        self.table.store(Arc::new(table));
    }

    /// Drops every route, which releases the pool senders and lets the
    /// worker pools drain out.
    pub fn clear(&self) {
        self.table.store(Arc::new(HashMap::new()));
    }

    pub fn resolve(&self, key: &str) -> Option<ServerHandle> {
        self.table.load().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(hostname: &str) -> (ServerHandle, mpsc::Receiver<HandshakeConnection>) {
        let (tx, rx) = mpsc::channel(1);
        (ServerHandle::new(hostname.into(), tx), rx)
    }

    #[test]
    fn normalize_strips_nul_suffix_and_case() {
        assert_eq!(normalize_hostname("Play.Example.Com"), "play.example.com");
        assert_eq!(normalize_hostname("foo.example\0FML\0"), "foo.example");
        assert_eq!(normalize_hostname("  mc.example  "), "mc.example");
        assert_eq!(normalize_hostname(""), "");
    }

    #[tokio::test]
    async fn resolve_hits_and_misses() {
        let table = RoutingTable::new();
        let (a, _rx_a) = handle("a.example");
        let (b, _rx_b) = handle("B.Example");
        table.publish(vec![a, b]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("a.example").unwrap().hostname, "a.example");
        // Keys are normalized on publish.
        assert!(table.resolve("b.example").is_some());
        assert!(table.resolve("c.example").is_none());
    }

    #[tokio::test]
    async fn clear_releases_pool_senders() {
        let table = RoutingTable::new();
        let (a, mut rx) = handle("a.example");
        table.publish(vec![a]);

        table.clear();
        assert!(table.is_empty());
        // With the last sender gone the pool channel closes.
        assert!(rx.recv().await.is_none());
    }
}
