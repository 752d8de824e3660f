mod cache;
mod chain;
mod clock;
mod config;
mod engine;
mod error;
mod group;
mod outbound;
mod proto_utils;
mod router;
mod speedcheck;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{InboundNet, LogConfig, load_config};
use crate::engine::Engine;
use crate::router::GroupRouter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "xdns: caching DNS forwarder with upstream racing and speed checks", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/xdns.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 每个 UDP 入口的 worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = load_config(&args.config).context("load config")?;
    init_tracing(&cfg.log, args.debug);

    let router = Arc::new(GroupRouter::new(&cfg).context("build groups")?);
    let engine = Engine::new(Arc::clone(&router));

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get().max(1)
    };

    let mut servers = JoinSet::new();
    for inbound in &cfg.inbounds {
        let addr = inbound.socket_addr()?;
        match inbound.net {
            InboundNet::Udp => spawn_udp(&mut servers, addr, udp_workers, &engine)?,
            InboundNet::Tcp => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("bind tcp listener {addr}"))?;
                let engine = engine.clone();
                servers.spawn(async move {
                    if let Err(err) = run_tcp(listener, engine).await {
                        error!(listen = %addr, error = %err, "tcp server exited");
                    }
                });
            }
        }
        info!(listen = %addr, net = ?inbound.net, "inbound started");
    }
    info!(udp_workers, "dns server started");

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = async { while servers.join_next().await.is_some() {} } => warn!("all listeners exited"),
    }
    servers.abort_all();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, router.shutdown()).await.is_err() {
        warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "shutdown timed out");
    }
    info!("dns server stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig, debug: bool) {
    let level = if debug { "debug" } else { log.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
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
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn spawn_udp(
    servers: &mut JoinSet<()>,
    bind_addr: SocketAddr,
    workers: usize,
    engine: &Engine,
) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        // On Unix create individual sockets with SO_REUSEPORT so kernel distributes packets
        for worker_id in 0..workers {
            let engine = engine.clone();
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket {bind_addr} for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket)?;
            servers.spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, Arc::new(socket), engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_addr.into()).context("bind socket")?;

        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..workers {
            let engine = engine.clone();
            let socket = Arc::clone(&udp_socket);
            servers.spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
        }
    }
    Ok(())
}

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    // SAFETY: fd is a live socket owned by `socket`; val outlives the call.
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        warn!(listen = %addr, "SO_REUSEPORT unavailable, workers will contend on bind");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// UDP worker：每个请求单独 spawn，上游等待不阻塞接收循环
async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                // 继续接收，不退出
                tracing::debug!(worker_id, error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = bytes::Bytes::copy_from_slice(&buf[..len]);
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match engine.handle_packet(&packet, peer).await {
                Ok(Some(resp)) => {
                    let _ = socket.send_to(&resp, peer).await;
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(client_ip = %peer.ip(), error = %err, "udp request failed"),
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, engine).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let resp = match engine.handle_packet(&buf, peer).await {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(_) => return Ok(()),
        };

        if resp.len() <= u16::MAX as usize {
            let len_bytes = (resp.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&resp).await.is_err() {
                return Ok(());
            }
        }
    }
}
