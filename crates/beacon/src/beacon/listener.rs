use tokio::{net::TcpListener, sync::mpsc, sync::watch};

use crate::beacon::conn::HandshakeConnection;

/// Runs an accept loop over an already-bound listener, wrapping each stream
/// and sending it to the gateway channel. The listener never reads a byte
/// itself; handshake parsing is the gateway's job.
///
/// Binding happens at the call site so that bind failures surface to the
/// process. A fatal accept error ends this loop only; sibling listeners on
/// other bind addresses keep serving.
pub async fn serve(
    ln: TcpListener,
    tx: mpsc::Sender<HandshakeConnection>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local = ln.local_addr().ok();
    if let Some(addr) = local {
        tracing::info!(listen_addr = %addr, "listener: accepting");
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => match res {
                Ok((stream, peer)) => {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "listener: accepted");
                    }
                    let conn = HandshakeConnection::new(stream, peer);
                    // A closed channel means the pipeline is gone; stop.
                    if tx.send(conn).await.is_err() {
                        break;
                    }
                }
                Err(err) if is_transient_accept_error(&err) => {
                    tracing::warn!(err = %err, "listener: transient accept error");
                }
                Err(err) => {
                    tracing::error!(err = %err, "listener: fatal accept error");
                    break;
                }
            }
        }
    }

    if let Some(addr) = local {
        tracing::info!(listen_addr = %addr, "listener: stopped");
    }
    Ok(())
}

/// Per-connection accept failures that do not poison the listening socket.
fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncWriteExt, net::TcpStream};

    #[tokio::test]
    async fn accepted_connections_reach_the_channel() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(ln, tx, shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let conn = rx.recv().await.expect("connection forwarded");
        assert_eq!(conn.peer_addr(), client.local_addr().unwrap());

        // The listener must not have consumed any client bytes.
        client.write_all(&[0x01, 0x00]).await.unwrap();
        let mut conn = conn;
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(frame.packet.id, 0x00);

        task.abort();
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(ln, tx, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_channel_stops_the_loop() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(ln, tx, shutdown_rx));

        drop(rx);
        let _client = TcpStream::connect(addr).await.unwrap();
        task.await.unwrap().unwrap();
    }
}
