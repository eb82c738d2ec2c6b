use std::{sync::Arc, time::Duration};

use tokio::{
    io::BufReader,
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinSet,
    time,
};

use crate::beacon::{
    config::ServerConfig,
    conn::{HandshakeConnection, UpstreamConnector},
    protocol::{
        handshake::NextState,
        login,
        status::{self, StatusTemplate},
        Packet,
    },
    router::ServerHandle,
};

/// The pool channel's receive side, shared by a virtual server's workers.
type SharedPool = Arc<Mutex<mpsc::Receiver<HandshakeConnection>>>;

/// One routable virtual host: its upstream address, status templates, and a
/// pool of workers that each own one connection at a time.
pub struct VirtualServer {
    hostname: String,
    upstream_addr: String,
    instances: usize,
    request_timeout: Duration,
    online_status: StatusTemplate,
    offline_status: StatusTemplate,
    connector: Arc<dyn UpstreamConnector>,
}

impl VirtualServer {
    pub fn new(
        cfg: ServerConfig,
        request_timeout: Duration,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hostname: cfg.hostname,
            upstream_addr: cfg.upstream,
            instances: cfg.instances.max(1),
            request_timeout,
            online_status: cfg.online_status,
            offline_status: cfg.offline_status,
            connector,
        })
    }

    /// Spawns the worker pool into `tasks` and returns the handle the
    /// gateway routes into. The pool drains and exits once every handle
    /// clone is dropped.
    pub fn spawn_pool(self: Arc<Self>, tasks: &mut JoinSet<anyhow::Result<()>>) -> ServerHandle {
        let (tx, rx) = mpsc::channel(1);
        let rx: SharedPool = Arc::new(Mutex::new(rx));
        for worker in 0..self.instances {
            tasks.spawn(run_worker(self.clone(), worker, rx.clone()));
        }
        ServerHandle::new(self.hostname.clone(), tx)
    }

    async fn handle(&self, mut conn: HandshakeConnection) {
        let client = conn.peer_addr();

        let Some(next_state) = conn.handshake().map(|hs| hs.next_state) else {
            // The gateway attaches the handshake before delivery; a bare
            // connection here is a wiring bug, not a client problem.
            tracing::error!(client = %client, host = %self.hostname, "server: connection without handshake");
            conn.close().await;
            return;
        };

        let frame = match time::timeout(self.request_timeout, conn.read_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                tracing::debug!(client = %client, err = %err, "server: request read failed");
                conn.close().await;
                return;
            }
            Err(_) => {
                tracing::debug!(client = %client, "server: request deadline exceeded");
                conn.close().await;
                return;
            }
        };

        match next_state {
            NextState::Status => self.serve_status(conn, frame.packet).await,
            NextState::Login => self.serve_login(conn, frame.raw).await,
        }
    }

    async fn serve_status(&self, mut conn: HandshakeConnection, request: Packet) {
        let client = conn.peer_addr();

        if let Err(err) = status::expect_status_request(&request) {
            tracing::debug!(client = %client, err = %err, "server: bad status request");
            conn.close().await;
            return;
        }

        // One connect probe decides which template to serve; the response
        // itself is always synthesized locally.
        let template = match self.connector.connect(&self.upstream_addr).await {
            Ok(mut upstream) => {
                upstream.close().await;
                &self.online_status
            }
            Err(_) => &self.offline_status,
        };

        let response = match template.render().to_packet() {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(host = %self.hostname, err = %err, "server: status render failed");
                conn.close().await;
                return;
            }
        };
        if conn.write_packet(&response).await.is_err() {
            conn.close().await;
            return;
        }

        // The client may follow up with a ping; echo its payload.
        match time::timeout(self.request_timeout, conn.read_packet()).await {
            Ok(Ok(ping)) => {
                if let Ok(pong) = status::pong_for(&ping) {
                    let _ = conn.write_packet(&pong).await;
                }
            }
            Ok(Err(_)) | Err(_) => {}
        }
        conn.close().await;
    }

    async fn serve_login(&self, mut conn: HandshakeConnection, login_frame: Vec<u8>) {
        let client = conn.peer_addr();

        let mut upstream = match self.connector.connect(&self.upstream_addr).await {
            Ok(up) => up,
            Err(err) => {
                tracing::warn!(
                    client = %client,
                    host = %self.hostname,
                    upstream = %self.upstream_addr,
                    err = %err,
                    "server: upstream dial failed"
                );
                if let Ok(kick) = login::disconnect_packet(&self.offline_status.description) {
                    let _ = conn.write_packet(&kick).await;
                }
                conn.close().await;
                return;
            }
        };

        // Replay the original handshake bytes, then the login start the
        // client already sent us.
        let handshake_frame = conn.handshake_frame().map(<[u8]>::to_vec).unwrap_or_default();
        if upstream.write_frame(&handshake_frame).await.is_err()
            || upstream.write_frame(&login_frame).await.is_err()
        {
            tracing::debug!(client = %client, "server: handshake replay failed");
            upstream.close().await;
            conn.close().await;
            return;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(client = %client, host = %self.hostname, upstream = %self.upstream_addr, "server: piping");
        }
        pipe(conn.into_stream(), upstream.into_stream()).await;
        tracing::debug!(client = %client, host = %self.hostname, "server: session ended");
    }
}

async fn run_worker(
    server: Arc<VirtualServer>,
    worker: usize,
    pool: SharedPool,
) -> anyhow::Result<()> {
    loop {
        let conn = { pool.lock().await.recv().await };
        let Some(conn) = conn else {
            break;
        };

        // One task per connection so a panicking handler is contained here
        // instead of taking the worker down.
        let srv = server.clone();
        let handled = tokio::spawn(async move { srv.handle(conn).await });
        if let Err(err) = handled.await {
            if err.is_panic() {
                tracing::error!(host = %server.hostname, worker, "server: connection handler panicked");
            }
        }
    }
    tracing::debug!(host = %server.hostname, worker, "server: worker drained");
    Ok(())
}

/// Bridges bytes both ways until either side closes or errors; the first
/// direction to finish aborts the other, so neither socket lingers
/// half-open.
async fn pipe(client: BufReader<TcpStream>, upstream: BufReader<TcpStream>) {
    use tokio::io::AsyncWriteExt;

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut to_upstream = tokio::spawn(async move {
        let res = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        res
    });
    let mut to_client = tokio::spawn(async move {
        let res = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        res
    });

    tokio::select! {
        _ = &mut to_upstream => to_client.abort(),
        _ = &mut to_client => to_upstream.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{
        conn::{ServerConnection, TcpConnector},
        protocol::{
            handshake::{NextState, ServerBoundHandshake},
            status::PlayerSample,
            PacketReader,
        },
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    fn template(version_name: &str, description: &str) -> StatusTemplate {
        StatusTemplate {
            version_name: version_name.into(),
            protocol_number: 765,
            max_players: 20,
            players_online: 0,
            description: description.into(),
            favicon: None,
            sample: Vec::<PlayerSample>::new(),
        }
    }

    fn server_config(upstream: &str) -> ServerConfig {
        ServerConfig {
            hostname: "mc.example.org".into(),
            upstream: upstream.into(),
            instances: 1,
            dial_timeout: Duration::from_millis(200),
            online_status: template("beacon-online", "Welcome"),
            offline_status: template("beacon-offline", "Server is offline"),
        }
    }

    /// A client socket (wrapped for packet IO) and the proxy-side connection
    /// with the handshake already captured, as the gateway leaves it.
    async fn session(next_state: NextState) -> (ServerConnection, HandshakeConnection, Vec<u8>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(ln.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = ln.accept().await.unwrap();
        let mut conn = HandshakeConnection::new(stream, peer);

        let hs = ServerBoundHandshake {
            protocol_version: 765,
            server_address: "mc.example.org".into(),
            server_port: 25565,
            next_state,
        };
        let frame = hs.marshal().to_frame().unwrap();
        conn.set_handshake(hs, frame.clone());
        (ServerConnection::new(client), conn, frame)
    }

    fn spawn_server(
        cfg: ServerConfig,
        connector: Arc<dyn UpstreamConnector>,
    ) -> (ServerHandle, JoinSet<anyhow::Result<()>>) {
        let server = VirtualServer::new(cfg, Duration::from_millis(500), connector);
        let mut tasks = JoinSet::new();
        let handle = server.spawn_pool(&mut tasks);
        (handle, tasks)
    }

    fn unreachable_addr() -> String {
        // Bind then drop so nothing listens there.
        let ln = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);
        addr.to_string()
    }

    fn response_version_name(p: &Packet) -> String {
        let resp = crate::beacon::protocol::status::StatusResponse::from_packet(p).unwrap();
        resp.version.name
    }

    #[tokio::test]
    async fn status_offline_synthesizes_and_echoes_ping() {
        let cfg = server_config(&unreachable_addr());
        let connector = Arc::new(TcpConnector::new(cfg.dial_timeout));
        let (handle, _tasks) = spawn_server(cfg, connector);

        let (mut client, conn, _) = session(NextState::Status).await;
        handle.deliver(conn).await.unwrap();

        client
            .write_packet(&status::status_request())
            .await
            .unwrap();
        let resp = client.read_packet().await.unwrap();
        assert_eq!(response_version_name(&resp), "beacon-offline");

        let payload = 0xDEADBEEFDEADBEEFu64.to_be_bytes().to_vec();
        let ping = Packet::new(status::PING_PACKET_ID, payload.clone());
        client.write_packet(&ping).await.unwrap();
        let pong = client.read_packet().await.unwrap();
        assert_eq!(pong.id, status::PING_PACKET_ID);
        assert_eq!(pong.data, payload);

        // The worker closes after the ping exchange.
        let mut stream = client.into_stream();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_online_uses_online_template() {
        // A live listener is enough; the probe only connects.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = server_config(&upstream.local_addr().unwrap().to_string());
        let connector = Arc::new(TcpConnector::new(cfg.dial_timeout));
        let (handle, _tasks) = spawn_server(cfg, connector);

        let (mut client, conn, _) = session(NextState::Status).await;
        handle.deliver(conn).await.unwrap();

        client
            .write_packet(&status::status_request())
            .await
            .unwrap();
        let resp = client.read_packet().await.unwrap();
        assert_eq!(response_version_name(&resp), "beacon-online");
    }

    #[tokio::test]
    async fn login_to_unreachable_upstream_kicks_with_offline_message() {
        let cfg = server_config(&unreachable_addr());
        let connector = Arc::new(TcpConnector::new(cfg.dial_timeout));
        let (handle, _tasks) = spawn_server(cfg, connector);

        let (mut client, conn, _) = session(NextState::Login).await;
        handle.deliver(conn).await.unwrap();

        // Login start; body content is opaque to the proxy.
        client
            .write_packet(&Packet::new(0x00, b"steve".to_vec()))
            .await
            .unwrap();

        let kick = client.read_packet().await.unwrap();
        assert_eq!(kick.id, login::DISCONNECT_PACKET_ID);
        let mut r = PacketReader::new(&kick.data);
        let json: serde_json::Value =
            serde_json::from_str(r.read_string(32_767).unwrap()).unwrap();
        assert_eq!(json["text"], "Server is offline");

        let mut stream = client.into_stream();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn login_replays_handshake_first_and_bridges_both_ways() {
        let upstream_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_ln.local_addr().unwrap().to_string();

        let cfg = server_config(&upstream_addr);
        let connector = Arc::new(TcpConnector::new(cfg.dial_timeout));
        let (handle, _tasks) = spawn_server(cfg, connector);

        let (mut client, conn, handshake_frame) = session(NextState::Login).await;
        let login_start = Packet::new(0x00, b"steve".to_vec());
        let login_frame = login_start.to_frame().unwrap();

        handle.deliver(conn).await.unwrap();
        client.write_packet(&login_start).await.unwrap();

        // The upstream sees the original handshake frame first, then the
        // login start, then raw session bytes.
        let (mut upstream, _) = upstream_ln.accept().await.unwrap();
        let mut got = vec![0u8; handshake_frame.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, handshake_frame);
        let mut got = vec![0u8; login_frame.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, login_frame);

        let mut stream = client.into_stream();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut got = [0u8; 5];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        upstream.write_all(b"world").await.unwrap();
        let mut got = [0u8; 5];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");

        // Closing one side tears down the other: no half-open sessions.
        drop(stream);
        let mut buf = [0u8; 1];
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }

    struct PanicOnceConnector {
        tripped: AtomicBool,
    }

    #[async_trait::async_trait]
    impl UpstreamConnector for PanicOnceConnector {
        async fn connect(&self, _addr: &str) -> anyhow::Result<ServerConnection> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("injected dial panic");
            }
            anyhow::bail!("upstream unreachable")
        }
    }

    #[tokio::test]
    async fn worker_survives_a_panicking_handler() {
        let cfg = server_config("127.0.0.1:1");
        let connector = Arc::new(PanicOnceConnector {
            tripped: AtomicBool::new(false),
        });
        let (handle, _tasks) = spawn_server(cfg, connector);

        // First connection trips the panic; the worker must keep going.
        let (mut c1, conn1, _) = session(NextState::Login).await;
        handle.deliver(conn1).await.unwrap();
        c1.write_packet(&Packet::new(0x00, b"a".to_vec()))
            .await
            .unwrap();

        // Second connection reaches the (now erroring) dial and gets the
        // offline kick, proving the pool is still alive.
        let (mut c2, conn2, _) = session(NextState::Login).await;
        handle.deliver(conn2).await.unwrap();
        c2.write_packet(&Packet::new(0x00, b"b".to_vec()))
            .await
            .unwrap();
        let kick = c2.read_packet().await.unwrap();
        assert_eq!(kick.id, login::DISCONNECT_PACKET_ID);
    }
}
