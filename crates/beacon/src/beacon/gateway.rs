use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, Mutex},
    time,
};

use crate::beacon::{
    conn::HandshakeConnection, protocol::handshake::ServerBoundHandshake, router::RoutingTable,
};

/// The inbound channel's receive side, shared by all gateway workers.
pub type SharedInbound = Arc<Mutex<mpsc::Receiver<HandshakeConnection>>>;

/// Reads the one handshake packet off fresh connections and routes them to
/// their virtual server's pool.
pub struct Gateway {
    table: Arc<RoutingTable>,
    handshake_timeout: Duration,
}

impl Gateway {
    pub fn new(table: Arc<RoutingTable>, handshake_timeout: Duration) -> Self {
        Self {
            table,
            handshake_timeout,
        }
    }

    /// One worker: pulls connections off the shared channel until it closes,
    /// handling them strictly one at a time. A send to a saturated pool
    /// blocks here, which is the intended backpressure on the accept path.
    pub async fn run(self: Arc<Self>, worker: usize, inbound: SharedInbound) -> anyhow::Result<()> {
        loop {
            let conn = { inbound.lock().await.recv().await };
            let Some(conn) = conn else {
                break;
            };
            self.route(conn).await;
        }
        tracing::debug!(worker, "gateway: worker drained");
        Ok(())
    }

    async fn route(&self, mut conn: HandshakeConnection) {
        let client = conn.peer_addr();

        let frame = match time::timeout(self.handshake_timeout, conn.read_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                tracing::debug!(client = %client, err = %err, "gateway: handshake read failed");
                conn.close().await;
                return;
            }
            Err(_) => {
                tracing::debug!(client = %client, "gateway: handshake deadline exceeded");
                conn.close().await;
                return;
            }
        };

        let hs = match ServerBoundHandshake::unmarshal(&frame.packet) {
            Ok(hs) => hs,
            Err(err) => {
                tracing::debug!(client = %client, err = %err, "gateway: invalid handshake");
                conn.close().await;
                return;
            }
        };

        let key = hs.routing_key();
        let Some(handle) = self.table.resolve(&key) else {
            // Mirror an unreachable vanilla server: no bytes, just close.
            tracing::debug!(client = %client, host = %key, "gateway: no route");
            conn.close().await;
            return;
        };

        conn.set_handshake(hs, frame.raw);

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(client = %client, host = %handle.hostname, "gateway: routed");
        }

        if let Err(mut conn) = handle.deliver(conn).await {
            tracing::warn!(host = %handle.hostname, "gateway: pool is gone, dropping connection");
            conn.close().await;
        }
    }
}
