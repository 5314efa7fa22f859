use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Wraps a fallible future with an optional timeout, converting elapsed
/// deadlines and inner errors into contextual `anyhow::Error` values for
/// consistent diagnostics. `None` means no deadline.
pub async fn maybe_timeout<F, T, E>(
    duration: Option<Duration>,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    match duration {
        Some(duration) => timeout(duration, future)
            .await
            .map_err(|_| anyhow!("timed out {context}"))?
            .with_context(|| format!("failed while {context}")),
        None => future
            .await
            .with_context(|| format!("failed while {context}")),
    }
}

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
    duration: Option<Duration>,
    context: impl Into<String>,
) -> Result<()> {
    maybe_timeout(duration, writer.write_all(buf), context).await
}

/// Renders a byte count with the largest unit that keeps the value below 1024.
pub fn human_size(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2}{}", UNITS[unit])
}
