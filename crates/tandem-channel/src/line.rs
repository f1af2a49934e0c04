//! Newline-delimited framing: one record per `\n`-terminated line.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Channel, Receiver, Sender};

/// Build a line-framed channel over the given stream halves.
pub fn line<R, W>(reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Channel::new(
        Box::new(LineSender { writer }),
        Box::new(LineReceiver {
            reader: BufReader::new(reader),
        }),
    )
}

struct LineSender<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sender for LineSender<W> {
    async fn send(&mut self, record: &[u8]) -> io::Result<()> {
        // The record boundary is the newline, so the record may not contain one.
        if record.contains(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "record contains a newline",
            ));
        }
        self.writer.write_all(record).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

struct LineReceiver<R> {
    reader: BufReader<R>,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Receiver for LineReceiver<R> {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut record = Vec::new();
        let n = self.reader.read_until(b'\n', &mut record).await?;
        if n == 0 {
            return Ok(None);
        }
        if record.last() == Some(&b'\n') {
            record.pop();
        }
        Ok(Some(record))
    }
}
