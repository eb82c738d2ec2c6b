use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
    task::JoinSet,
};

use crate::beacon::{
    config,
    conn::TcpConnector,
    gateway::Gateway,
    listener, logging,
    router::RoutingTable,
    server::VirtualServer,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if cfg.servers.is_empty() {
        anyhow::bail!("config: no virtual servers configured (add [[servers]] entries)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listeners = cfg.listeners.len(),
        gateway_workers = cfg.gateway_workers,
        servers = cfg.servers.len(),
        "beacon: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // Server worker pools, published as the routing table.
    let table = Arc::new(RoutingTable::new());
    let mut handles = Vec::with_capacity(cfg.servers.len());
    for sc in &cfg.servers {
        let connector = Arc::new(TcpConnector::new(sc.dial_timeout));
        let server = VirtualServer::new(sc.clone(), cfg.timeouts.request_timeout, connector);
        handles.push(server.spawn_pool(&mut tasks));
    }
    table.publish(handles);

    // Gateway workers behind one shared inbound channel.
    let (inbound_tx, inbound_rx) = mpsc::channel(1);
    let inbound = Arc::new(Mutex::new(inbound_rx));
    let gateway = Arc::new(Gateway::new(table.clone(), cfg.timeouts.handshake_timeout));
    for worker in 0..cfg.gateway_workers {
        tasks.spawn(gateway.clone().run(worker, inbound.clone()));
    }

    // Listeners. Bind first so bind errors abort startup, then serve.
    for addr in &cfg.listeners {
        let ln = TcpListener::bind(*addr)
            .await
            .with_context(|| format!("bind tcp {addr}"))?;
        let tx = inbound_tx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(listener::serve(ln, tx, shutdown));
    }
    // Only the listeners hold senders now; when they stop, the gateway
    // channel closes and the workers drain out.
    drop(inbound_tx);

    // Wait for a shutdown signal or a failed task. A task ending cleanly
    // (for example one listener hitting a fatal accept error) does not take
    // the rest of the pipeline with it.
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => {
                tracing::info!("shutdown: signal");
                let _ = shutdown_tx.send(true);
                break;
            }
            res = tasks.join_next() => match res {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    let _ = shutdown_tx.send(true);
                    table.clear();
                    return Err(err);
                }
                Some(Err(join_err)) => {
                    let _ = shutdown_tx.send(true);
                    table.clear();
                    return Err(join_err.into());
                }
            }
        }
    }

    // Release the pool senders so the server workers drain too.
    table.clear();

    // Drain tasks; cap the wait so an external stop cannot stall forever.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

/// Resolves when the process is told to stop, recording which signal it was.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::debug!(signal = "interrupt", "shutdown: signal received");
                    }
                    _ = term.recv() => {
                        tracing::debug!(signal = "terminate", "shutdown: signal received");
                    }
                }
            }
            Err(err) => {
                // Restricted sandboxes can refuse the handler; Ctrl-C still
                // covers interactive use.
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable, watching Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                tracing::debug!(signal = "interrupt", "shutdown: signal received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::debug!(signal = "interrupt", "shutdown: signal received");
    }
}
