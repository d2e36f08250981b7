use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::util::maybe_timeout_with_context;

/// Reads one CRLF- or LF-terminated line into `buf`, bounded by `max_len` bytes. Returns 0 on
/// a clean EOF before any byte arrived.
pub(crate) async fn read_line<R>(
    reader: &mut R,
    buf: &mut String,
    max_len: usize,
    timeout: Option<Duration>,
    what: &str,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available =
            maybe_timeout_with_context(timeout, reader.fill_buf(), format!("reading {what}"))
                .await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading {what}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow while reading {what}"))?
            > max_len
        {
            bail!("{what} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("{what} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn reads_lines_across_partial_writes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = BufReader::new(rx);
        tokio::spawn(async move {
            tx.write_all(b"HTTP/1.1 20").await.unwrap();
            tx.write_all(b"0 OK\r\nnext").await.unwrap();
        });
        let mut line = String::new();
        let read = read_line(&mut reader, &mut line, 128, None, "status line")
            .await
            .unwrap();
        assert_eq!(read, 17);
        assert_eq!(line, "HTTP/1.1 200 OK\r\n");
    }

    #[tokio::test]
    async fn clean_eof_returns_zero() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = BufReader::new(rx);
        let mut line = String::new();
        assert_eq!(
            read_line(&mut reader, &mut line, 128, None, "line").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn rejects_overlong_lines() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tx.write_all(&[b'a'; 100]).await.unwrap();
        tx.write_all(b"\r\n").await.unwrap();
        let mut reader = BufReader::new(rx);
        let mut line = String::new();
        let err = read_line(&mut reader, &mut line, 32, None, "header line")
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("exceeds configured limit"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_peer_stalls() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut reader = BufReader::new(rx);
        let mut line = String::new();
        let err = read_line(
            &mut reader,
            &mut line,
            64,
            Some(Duration::from_millis(250)),
            "request line",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out reading request line"));
    }
}
