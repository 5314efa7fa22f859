use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::cache::CachePool;
use crate::util::human_size;

/// Line-oriented inspection socket: `status`, `list`, and `show <key>`.
/// Read-only; intended for a local operator, so bind it accordingly.
pub async fn start_control(addr: SocketAddr, cache: CachePool) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control socket on {addr}"))?;
    info!(address = %addr, "control socket started");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept control connection");
                continue;
            }
        };
        let cache = cache.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_control(stream, cache).await {
                debug!(peer = %peer, error = %err, "control connection closed with error");
            }
        });
    }
}

async fn handle_control(stream: TcpStream, cache: CachePool) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        let reply = run_command(&cache, command);
        write_half.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

fn run_command(cache: &CachePool, command: &str) -> String {
    if command == "status" {
        return cache.stats().to_string();
    }
    if command == "list" {
        let mut out = String::from("Size\tStatus\tAccess\tURI\n");
        for summary in cache.list() {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                human_size(summary.size),
                summary.status.as_str(),
                summary.access_count,
                summary.key
            ));
        }
        return out;
    }
    if let Some(key) = command.strip_prefix("show ") {
        return match cache.show(key.trim()) {
            None => "\n".to_string(),
            Some(detail) => {
                let protected = detail
                    .protected_age
                    .map(|age| format!("{:.1}s ago", age.as_secs_f64()))
                    .unwrap_or_default();
                format!(
                    "Content size:\t{}\nHeaders:\t{}\nStatus:\t{}\nAccess count:\t{}\nHash:\t{}\nProtected:\t{}\nAll URIs:\t{}\n",
                    human_size(detail.size),
                    detail.header_count,
                    detail.status.as_str(),
                    detail.access_count,
                    detail.hash.unwrap_or_default(),
                    protected,
                    detail.keys.join("\n\t\t"),
                )
            }
        };
    }
    "ERR unknown command\n".to_string()
}
