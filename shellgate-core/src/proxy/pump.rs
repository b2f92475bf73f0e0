//! Byte pumps between a client channel and a shell subprocess.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::config::StderrMode;
use crate::connection::ConnectionId;

/// Longest diagnostic line kept when stderr is logged. Longer lines are
/// truncated, the rest of the line is still drained.
pub const MAX_DIAGNOSTIC_LINE_BYTES: usize = 8 * 1024;

/// Copy `reader` into `writer` until EOF, flushing after every chunk.
///
/// Returns the number of bytes copied. Each chunk is flushed immediately so
/// an interactive peer sees output without waiting for the buffer to fill.
pub async fn pump<R, W>(mut reader: R, mut writer: W, buffer_size: usize) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

/// Drain a subprocess's stderr until EOF so it never blocks on a full pipe.
///
/// Lines are either discarded or emitted as `debug` events. Nothing read here
/// ever reaches the client. Returns the number of lines seen.
pub async fn drain_stderr<R>(
    stderr: R,
    mode: StderrMode,
    server: &str,
    connection_id: &ConnectionId,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line: Vec<u8> = Vec::new();
    let mut lines = 0u64;
    // Bytes seen since the last newline, kept apart from `line` which only
    // buffers text in log mode.
    let mut pending = false;

    let emit = |line: &[u8]| {
        if mode == StderrMode::Log {
            debug!(
                server,
                connection_id = %connection_id,
                line = %String::from_utf8_lossy(line).trim_end(),
                "shell stderr"
            );
        }
    };

    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(server, connection_id = %connection_id, error = %e, "stderr read failed");
                break;
            }
        };
        let consumed = chunk.len();
        for &byte in chunk {
            if byte == b'\n' {
                lines += 1;
                emit(&line);
                line.clear();
                pending = false;
            } else {
                pending = true;
                if mode == StderrMode::Log && line.len() < MAX_DIAGNOSTIC_LINE_BYTES {
                    line.push(byte);
                }
            }
        }
        reader.consume(consumed);
    }

    if pending {
        lines += 1;
        emit(&line);
    }
    lines
}
