mod cli;
mod protocol;
mod shutdown;
mod tls;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

/// Maximum bytes accumulated for one client frame before it's rejected;
/// guards against an unbounded buffer if a client never sends `\n`.
const MAX_FRAME_BYTES: usize = 1 << 20;

use cluster_core::Store;
use cluster_engine::{Scheduler, SchedulerConfig};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

/// Unifies a plain TCP stream and a TLS-wrapped one behind a single
/// `AsyncRead + AsyncWrite` object so the accept loop and connection handler
/// don't need to care which transport is in use.
trait Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> Conn for T {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tls_paths = cli.tls_paths().map_err(|err| anyhow::anyhow!(err))?;
    let acceptor = match tls_paths {
        Some((cert, key, ca)) => Some(tls::build_acceptor(cert, key, ca, cli.tls_min_version)?),
        None => None,
    };

    let store = match &cli.db {
        Some(path) => Some(Arc::new(Store::open(Path::new(path))?)),
        None => None,
    };

    let scheduler = Scheduler::new(
        SchedulerConfig {
            server_id: cli.server_id.clone(),
            engine_path: cli.engine_path.clone(),
            threads: cli.threads,
            max_jobs: cli.max_jobs,
        },
        store.clone(),
    );
    scheduler.restore(cli.db_load_limit).await;

    let listener = TcpListener::bind((cli.host.as_str(), cli.port)).await?;
    let local_addr = listener.local_addr()?;
    let proto = if acceptor.is_some() { "TLS" } else { "TCP" };
    println!(
        "[server] Listening on {local_addr} ({proto}, server_id={})",
        cli.server_id
    );

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    let server_id = cli.server_id.clone();
    let mut graceful = false;

    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("[server] stop requested, no longer accepting new connections");
                        graceful = true;
                        break;
                    }
                    Some(ShutdownEvent::Immediate) | None => {
                        eprintln!("[server] stop requested again, exiting immediately");
                        std::process::exit(130);
                    }
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        eprintln!("[server] accept error: {err}");
                        continue;
                    }
                };
                let conn: Box<dyn Conn> = match &acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => Box::new(tls_stream),
                        Err(err) => {
                            eprintln!("[server] TLS handshake with {peer} failed: {err}");
                            continue;
                        }
                    },
                    None => Box::new(stream),
                };
                println!("[server] Client connected: {peer}");
                tokio::spawn(handle_client(Arc::clone(&scheduler), server_id.clone(), conn, peer));
            }
        }
    }

    if graceful {
        eprintln!("[server] waiting for in-flight jobs to finish");
        loop {
            if scheduler.active_count().await == 0 {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                ev = shutdown_rx.recv() => {
                    if matches!(ev, Some(ShutdownEvent::Immediate) | None) {
                        eprintln!("[server] stop requested again, exiting immediately");
                        std::process::exit(130);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_client(
    scheduler: Arc<Scheduler>,
    server_id: String,
    conn: Box<dyn Conn>,
    peer: std::net::SocketAddr,
) {
    let (read_half, write_half) = tokio::io::split(conn);
    let sink = Arc::new(AsyncMutex::new(Box::new(write_half) as Box<dyn tokio::io::AsyncWrite + Unpin + Send>));

    let client_id = scheduler.register_client(sink.clone()).await;
    scheduler.broadcast_status().await;

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = match reader.read_until(b'\n', &mut buf).await {
            Ok(n) => n,
            Err(err) => {
                eprintln!("[server] read error from {peer}: {err}");
                break;
            }
        };
        if n == 0 {
            break;
        }
        if buf.len() > MAX_FRAME_BYTES {
            eprintln!("[server] frame from {peer} exceeds {MAX_FRAME_BYTES} bytes, dropping connection");
            break;
        }
        // Invalid UTF-8 is replaced rather than treated as fatal, so one
        // malformed frame can't kill an otherwise well-behaved connection.
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        protocol::dispatch(&scheduler, &server_id, line, &sink).await;
    }

    println!("[server] Client disconnected: {peer}");
    {
        let mut writer = sink.lock().await;
        let _ = writer.shutdown().await;
    }
    scheduler.remove_client(client_id).await;
}
