use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::BodyPlan;
use super::line::read_line;
use crate::body::{Body, BodySender};
use crate::error::BodyError;
use crate::util::maybe_timeout_with_context;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// Hands `data` to the body reader. A reader that went away turns the sink into a discard so
/// the connection keeps consuming the framed bytes.
async fn deliver(sink: &mut Option<BodySender>, data: Bytes) {
    if let Some(tx) = sink.as_ref()
        && tx.send(data).await.is_err()
    {
        *sink = None;
    }
}

async fn read_available<R>(
    reader: &mut R,
    limit: u64,
    timeout: Option<Duration>,
    what: &str,
) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let available =
        maybe_timeout_with_context(timeout, reader.fill_buf(), format!("reading {what}")).await?;
    let take = available.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
    let data = Bytes::copy_from_slice(&available[..take]);
    reader.consume(take);
    Ok(data)
}

/// Reads one body framed by `plan`, pushing the data into `sink`. `timeout` bounds each read
/// from the peer. Returns the number of body bytes read.
pub(crate) async fn read_body<R>(
    reader: &mut R,
    plan: BodyPlan,
    sink: &mut Option<BodySender>,
    timeout: Option<Duration>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(0),
        BodyPlan::Fixed(length) => read_fixed(reader, length, sink, timeout).await,
        BodyPlan::Chunked => read_chunked(reader, sink, timeout).await,
        BodyPlan::UntilClose => read_until_close(reader, sink, timeout).await,
    }
}

async fn read_fixed<R>(
    reader: &mut R,
    length: u64,
    sink: &mut Option<BodySender>,
    timeout: Option<Duration>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut remaining = length;
    while remaining > 0 {
        let data = read_available(reader, remaining, timeout, "message body").await?;
        if data.is_empty() {
            bail!(
                "peer closed connection after {} of {length} body bytes",
                length - remaining
            );
        }
        remaining -= data.len() as u64;
        deliver(sink, data).await;
    }
    Ok(length)
}

async fn read_chunked<R>(
    reader: &mut R,
    sink: &mut Option<BodySender>,
    timeout: Option<Duration>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0u64;
    let mut line = String::new();
    loop {
        let size_bytes =
            read_line(reader, &mut line, MAX_CHUNK_LINE_LENGTH, timeout, "chunk size").await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        let chunk_size = u64::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            loop {
                let trailer_bytes = read_line(
                    reader,
                    &mut line,
                    MAX_CHUNK_LINE_LENGTH,
                    timeout,
                    "chunk trailer",
                )
                .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(total);
                }
            }
        }

        let mut remaining = chunk_size;
        while remaining > 0 {
            let data = read_available(reader, remaining, timeout, "chunk data").await?;
            if data.is_empty() {
                bail!("unexpected EOF while reading chunk data");
            }
            remaining -= data.len() as u64;
            total += data.len() as u64;
            deliver(sink, data).await;
        }

        let mut crlf = [0u8; 2];
        maybe_timeout_with_context(
            timeout,
            reader.read_exact(&mut crlf),
            "reading chunk terminator",
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator");
        }
    }
}

async fn read_until_close<R>(
    reader: &mut R,
    sink: &mut Option<BodySender>,
    timeout: Option<Duration>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0u64;
    loop {
        let data = read_available(reader, u64::MAX, timeout, "close-delimited body").await?;
        if data.is_empty() {
            return Ok(total);
        }
        total += data.len() as u64;
        deliver(sink, data).await;
    }
}

/// Writes `body` framed by `plan` and flushes. A failing body surfaces as a [`BodyError`]
/// inside the returned error.
pub(crate) async fn write_body<W>(writer: &mut W, mut body: Body, plan: BodyPlan) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    match plan {
        BodyPlan::Empty => {}
        BodyPlan::Fixed(expected) => {
            while let Some(chunk) = body.chunk().await {
                let chunk = chunk.map_err(|err| anyhow!(err))?;
                written += chunk.len() as u64;
                if written > expected {
                    return Err(anyhow!(BodyError::LengthMismatch {
                        expected,
                        actual: written,
                    }));
                }
                writer
                    .write_all(&chunk)
                    .await
                    .context("writing message body")?;
            }
            if written != expected {
                return Err(anyhow!(BodyError::LengthMismatch {
                    expected,
                    actual: written,
                }));
            }
        }
        BodyPlan::Chunked => {
            while let Some(chunk) = body.chunk().await {
                let chunk = chunk.map_err(|err| anyhow!(err))?;
                if chunk.is_empty() {
                    continue;
                }
                writer
                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await
                    .context("writing chunk size")?;
                writer
                    .write_all(&chunk)
                    .await
                    .context("writing chunk data")?;
                writer
                    .write_all(b"\r\n")
                    .await
                    .context("writing chunk terminator")?;
                written += chunk.len() as u64;
            }
            writer
                .write_all(b"0\r\n\r\n")
                .await
                .context("writing last chunk")?;
        }
        BodyPlan::UntilClose => {
            while let Some(chunk) = body.chunk().await {
                let chunk = chunk.map_err(|err| anyhow!(err))?;
                writer
                    .write_all(&chunk)
                    .await
                    .context("writing message body")?;
                written += chunk.len() as u64;
            }
        }
    }
    writer.flush().await.context("flushing message body")?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn read_all(raw: &'static [u8], plan: BodyPlan) -> (Result<u64>, Bytes, usize) {
        let mut reader = BufReader::new(raw);
        let (tx, body) = Body::channel(None);
        let collector = tokio::spawn(body.collect());
        let mut sink = Some(tx);
        let result = read_body(&mut reader, plan, &mut sink, None).await;
        drop(sink);
        let collected = collector.await.unwrap().unwrap_or_default();
        let leftover = reader.buffer().len();
        (result, collected, leftover)
    }

    #[tokio::test]
    async fn reads_chunked_body_with_extensions_and_trailers() {
        let raw = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT";
        let (result, collected, leftover) = read_all(raw, BodyPlan::Chunked).await;
        assert_eq!(result.unwrap(), 9);
        assert_eq!(collected, Bytes::from_static(b"Wikipedia"));
        assert_eq!(leftover, 4);
    }

    #[tokio::test]
    async fn rejects_bad_chunk_terminator() {
        let (result, _, _) = read_all(b"3\r\nabcXX0\r\n\r\n", BodyPlan::Chunked).await;
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("invalid chunk terminator")
        );
    }

    #[tokio::test]
    async fn fixed_body_stops_at_length() {
        let (result, collected, leftover) =
            read_all(b"helloHTTP/1.1 200", BodyPlan::Fixed(5)).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(collected, Bytes::from_static(b"hello"));
        assert_eq!(leftover, 12);
    }

    #[tokio::test]
    async fn fixed_body_reports_truncation() {
        let (result, _, _) = read_all(b"abc", BodyPlan::Fixed(10)).await;
        assert!(result.unwrap_err().to_string().contains("3 of 10"));
    }

    #[tokio::test]
    async fn until_close_reads_everything() {
        let (result, collected, _) = read_all(b"raw stream bytes", BodyPlan::UntilClose).await;
        assert_eq!(result.unwrap(), 16);
        assert_eq!(collected, Bytes::from_static(b"raw stream bytes"));
    }

    #[tokio::test]
    async fn dropped_reader_still_drains_framing() {
        let mut reader = BufReader::new(&b"5\r\nhello\r\n0\r\n\r\nrest"[..]);
        let (tx, body) = Body::channel(None);
        drop(body);
        let mut sink = Some(tx);
        let read = read_body(&mut reader, BodyPlan::Chunked, &mut sink, None)
            .await
            .unwrap();
        assert_eq!(read, 5);
        assert!(sink.is_none());
        assert_eq!(reader.buffer(), b"rest");
    }

    #[tokio::test]
    async fn writes_chunked_frames() {
        let (tx, body) = Body::channel(None);
        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"Wiki")).await.unwrap();
            tx.send(Bytes::from_static(b"pedia in chunks")).await.unwrap();
        });
        let mut out = Vec::new();
        let written = write_body(&mut out, body, BodyPlan::Chunked).await.unwrap();
        assert_eq!(written, 19);
        assert_eq!(out, b"4\r\nWiki\r\nf\r\npedia in chunks\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn fixed_write_detects_length_mismatch() {
        let mut out = Vec::new();
        let err = write_body(&mut out, Body::from("short"), BodyPlan::Fixed(10))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<BodyError>(),
            Some(&BodyError::LengthMismatch {
                expected: 10,
                actual: 5
            })
        );
    }
}
