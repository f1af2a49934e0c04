//! Language Server Protocol framing: a `Content-Length` header block
//! followed by exactly that many payload bytes.
//!
//! Unknown headers are ignored. Records must be valid UTF-8, matching the
//! protocol's requirement that payloads are JSON text.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Channel, Receiver, Sender, MAX_RECORD_SIZE};

/// Build an LSP-framed channel over the given stream halves.
pub fn lsp<R, W>(reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Channel::new(
        Box::new(LspSender { writer }),
        Box::new(LspReceiver {
            reader: BufReader::new(reader),
        }),
    )
}

struct LspSender<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sender for LspSender<W> {
    async fn send(&mut self, record: &[u8]) -> io::Result<()> {
        let header = format!("Content-Length: {}\r\n\r\n", record.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(record).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

struct LspReceiver<R> {
    reader: BufReader<R>,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Receiver for LspReceiver<R> {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let mut header = String::new();
            let n = self.reader.read_line(&mut header).await?;
            if n == 0 {
                if saw_header {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof inside header block",
                    ));
                }
                return Ok(None);
            }
            saw_header = true;

            let header = header.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                break;
            }
            let Some((name, value)) = header.split_once(':') else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed header line {header:?}"),
                ));
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len: usize = value.trim().parse().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length")
                })?;
                content_length = Some(len);
            }
            // All other headers are ignored.
        }

        let len = content_length
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length"))?;
        if len > MAX_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "record exceeds maximum size",
            ));
        }

        let mut record = vec![0; len];
        self.reader.read_exact(&mut record).await?;
        if std::str::from_utf8(&record).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "record is not valid UTF-8",
            ));
        }
        Ok(Some(record))
    }
}
