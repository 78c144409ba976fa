//! `Content-Length` framing for the editor connection.
//!
//! Each message is `Content-Length: N\r\n[other headers]\r\n{N bytes of JSON}`.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single message body. Full-text document sync means a
/// frame carries a whole story file, so this is generous.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct FrameReader<R> {
    reader: BufReader<R>,
    header: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            header: String::new(),
        }
    }

    /// Next message, or `None` when the stream ends between messages.
    pub async fn read_frame(&mut self) -> Result<Option<Value>> {
        let Some(length) = self.read_content_length().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            bail!("message of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading message body")?;
        let value = serde_json::from_slice(&body).context("message body is not valid JSON")?;
        Ok(Some(value))
    }

    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut first = true;
        loop {
            self.header.clear();
            let read = self
                .reader
                .read_line(&mut self.header)
                .await
                .context("reading message header")?;
            if read == 0 {
                if first {
                    return Ok(None);
                }
                bail!("stream ended inside a message header");
            }
            first = false;

            let line = self.header.trim();
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                tracing::debug!("Ignoring malformed header line: {line}");
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let parsed = value
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("invalid Content-Length {:?}", value.trim()))?;
                length = Some(parsed);
            }
        }

        length
            .map(Some)
            .context("message header has no Content-Length")
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, message: &Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("serializing message")?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.writer
            .write_all(&frame)
            .await
            .context("writing message")?;
        self.writer.flush().await.context("flushing message")?;
        Ok(())
    }
}
