use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::edgetun::{
    admin, config, logging, net, proxy, telemetry,
    tunnel::{
        buffer::{BufferPool, EDGE_BUFFER_SIZE, TCP_BUFFER_SIZE, UDP_BUFFER_SIZE},
        dialer::{DestinationDialer, EgressPolicy, RetryPolicy, SocketDialer},
        edge::{Demux, EdgeServer, EndpointOptions},
        pool::{Pool, PoolOptions},
        transport::{
            Establisher, QuicDialOptions, QuicListenOptions, SessionEstablisher,
            TransportDialOptions, transport_by_name,
            ws::{WsEstablisher, WsOptions},
        },
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        client = cfg.client.is_some(),
        edge = cfg.edge.is_some(),
        admin_addr = %cfg.admin_addr,
        tunnels = cfg.client.as_ref().map(|c| c.tunnels.len()).unwrap_or(0),
        edge_endpoints = cfg.edge.as_ref().map(|e| e.endpoints.len()).unwrap_or(0),
        "edgetun: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let flows = Arc::new(telemetry::FlowRegistry::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let mut pool: Option<Arc<Pool>> = None;

    // Admin server.
    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: prom.clone(),
            flows: flows.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Client role.
    if let Some(cc) = &cfg.client {
        let p = Pool::new(
            build_establisher(cc)?,
            PoolOptions {
                capacity: cc.pool_size,
                retry_interval: cc.retry_interval,
            },
        );
        tracing::info!(
            transport = %p.transport_name(),
            pool_size = cc.pool_size,
            "client: transport pool started"
        );

        let ctx = proxy::ClientContext {
            pool: p.clone(),
            tcp_buffers: BufferPool::new(TCP_BUFFER_SIZE),
            udp_buffers: BufferPool::new(UDP_BUFFER_SIZE),
            flows: flows.clone(),
        };
        pool = Some(p);

        for t in &cc.tunnels {
            let remote = net::resolve_socket_addr(&t.remote)
                .await
                .with_context(|| format!("client: resolve tunnel remote {}", t.remote))?;
            let listen = t.listen.clone();
            let ctx = ctx.clone();
            let shutdown = shutdown_rx.clone();
            match t.protocol.as_str() {
                "udp" => {
                    let idle = t.timeout;
                    tasks.spawn(async move {
                        proxy::serve_udp_with_shutdown(&listen, remote, idle, ctx, shutdown).await
                    });
                }
                _ => {
                    tasks.spawn(async move {
                        proxy::serve_tcp_with_shutdown(&listen, remote, ctx, shutdown).await
                    });
                }
            }
        }
    }

    // Edge role.
    if let Some(ec) = &cfg.edge {
        let demux = Arc::new(Demux::new(
            build_egress(ec),
            RetryPolicy {
                max_attempts: ec.max_dial_retries,
                delay: ec.retry_delay,
            },
            BufferPool::new(EDGE_BUFFER_SIZE),
            flows.clone(),
        ));

        for ep in &ec.endpoints {
            let server = EdgeServer::new(
                EndpointOptions {
                    listen_addr: ep.listen_addr.clone(),
                    transport: ep.transport.clone(),
                    quic: QuicListenOptions {
                        cert_file: ep.quic.cert_file.clone(),
                        key_file: ep.quic.key_file.clone(),
                        next_protos: Vec::new(),
                    },
                },
                demux.clone(),
            );
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server.listen_and_serve(shutdown).await });
        }
    }

    if tasks.is_empty() {
        anyhow::bail!("config: nothing to run (no client tunnels, edge endpoints or admin_addr)");
    }

    supervise(&mut tasks, shutdown_signal()).await;
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout = %humantime::format_duration(DRAIN_TIMEOUT),
            "shutdown: drain timed out; aborting remaining tasks"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    if let Some(p) = pool {
        p.close().await;
    }

    Ok(())
}

/// Waits for `signal` while listener tasks run. A task that fails is logged
/// and the rest keep serving; returns early only once every task has ended.
async fn supervise<F>(tasks: &mut JoinSet<anyhow::Result<()>>, signal: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(signal);
    loop {
        tokio::select! {
            _ = &mut signal => {
                tracing::info!("shutdown: signal");
                return;
            }
            res = tasks.join_next() => match res {
                None => {
                    tracing::warn!("shutdown: no tasks left");
                    return;
                }
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    let err = format!("{err:#}");
                    tracing::error!(err = %err, remaining = tasks.len(), "task failed");
                }
                Some(Err(join_err)) => {
                    tracing::error!(err = %join_err, remaining = tasks.len(), "task panicked");
                }
            },
        }
    }
}

fn build_establisher(cc: &config::ClientConfig) -> anyhow::Result<Arc<dyn Establisher>> {
    match cc.transport.as_str() {
        "ws" | "wss" => {
            let est = WsEstablisher::new(WsOptions {
                url: cc.url.clone(),
                tls: cc.transport == "wss",
                cdn_ip: cc.cdn_ip.clone(),
                cdn_port: cc.cdn_port,
                server_name: cc.server_name.clone(),
                insecure_skip_verify: cc.insecure_skip_verify,
                headers: Vec::new(),
                dial_timeout: cc.dial_timeout,
            })?;
            Ok(Arc::new(est))
        }
        other => {
            let tr = transport_by_name(other)?;
            let opts = TransportDialOptions {
                quic: QuicDialOptions {
                    server_name: cc.server_name.clone(),
                    insecure_skip_verify: cc.insecure_skip_verify,
                    next_protos: Vec::new(),
                },
            };
            Ok(Arc::new(SessionEstablisher::new(
                tr,
                cc.server_addr.clone(),
                opts,
                cc.dial_timeout,
            )))
        }
    }
}

fn build_egress(ec: &config::EdgeConfig) -> Arc<dyn DestinationDialer> {
    let direct: Arc<dyn DestinationDialer> = Arc::new(SocketDialer::direct(ec.dial_timeout));
    let g = &ec.egress;
    if !(g.proxy4 || g.proxy6) {
        return Arc::new(EgressPolicy::direct(direct));
    }
    let designated: Arc<dyn DestinationDialer> =
        Arc::new(SocketDialer::bound(g.bind_v4, g.bind_v6, ec.dial_timeout));
    tracing::info!(
        proxy4 = g.proxy4,
        proxy6 = g.proxy6,
        bind_v4 = ?g.bind_v4,
        bind_v6 = ?g.bind_v6,
        "edge: split egress enabled"
    );
    Arc::new(EgressPolicy::split(direct, designated, g.proxy4, g.proxy6))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
