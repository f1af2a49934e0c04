//! Varint framing: an unsigned little-endian base-128 length prefix
//! followed by that many payload bytes.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Channel, Receiver, Sender, MAX_RECORD_SIZE};

/// Build a varint-framed channel over the given stream halves.
pub fn varint<R, W>(reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Channel::new(
        Box::new(VarintSender { writer }),
        Box::new(VarintReceiver { reader }),
    )
}

struct VarintSender<W> {
    writer: W,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sender for VarintSender<W> {
    async fn send(&mut self, record: &[u8]) -> io::Result<()> {
        let mut prefix = [0u8; 10];
        let mut len = record.len() as u64;
        let mut n = 0;
        loop {
            let byte = (len & 0x7f) as u8;
            len >>= 7;
            if len == 0 {
                prefix[n] = byte;
                n += 1;
                break;
            }
            prefix[n] = byte | 0x80;
            n += 1;
        }
        self.writer.write_all(&prefix[..n]).await?;
        self.writer.write_all(record).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

struct VarintReceiver<R> {
    reader: R,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Receiver for VarintReceiver<R> {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        // The first prefix byte distinguishes clean EOF from a truncated record.
        let mut first = [0u8; 1];
        if self.reader.read(&mut first).await? == 0 {
            return Ok(None);
        }

        let mut len = u64::from(first[0] & 0x7f);
        let mut shift = 7;
        let mut byte = first[0];
        while byte & 0x80 != 0 {
            if shift >= 64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "varint length prefix overflows",
                ));
            }
            byte = self.reader.read_u8().await?;
            len |= u64::from(byte & 0x7f) << shift;
            shift += 7;
        }

        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= MAX_RECORD_SIZE)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "record exceeds maximum size")
            })?;

        let mut record = vec![0; len];
        self.reader.read_exact(&mut record).await?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn roundtrip() {
        let (near, far) = duplex(4096);
        let (mut tx, _) = varint(tokio::io::empty(), near).split();
        let (_, mut rx) = varint(far, tokio::io::sink()).split();

        tx.send(b"{}").await.unwrap();
        tx.send(b"").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), b"{}");
        assert_eq!(rx.recv().await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn multi_byte_prefix() {
        let (near, far) = duplex(1 << 12);
        let payload = vec![b'x'; 300]; // prefix must span two bytes
        let (mut tx, _) = varint(tokio::io::empty(), near).split();
        let (_, mut rx) = varint(far, tokio::io::sink()).split();

        let send = {
            let payload = payload.clone();
            async move {
                tx.send(&payload).await.unwrap();
                tx
            }
        };
        let (_, received) = tokio::join!(send, async { rx.recv().await.unwrap().unwrap() });
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn eof_before_prefix_is_clean() {
        let (near, far) = duplex(64);
        drop(near);
        let (_, mut rx) = varint(far, tokio::io::sink()).split();
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (mut near, far) = duplex(64);
        near.write_all(&[5, b'a', b'b']).await.unwrap();
        near.shutdown().await.unwrap();
        let (_, mut rx) = varint(far, tokio::io::sink()).split();
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn overlong_prefix_is_invalid() {
        let (mut near, far) = duplex(64);
        near.write_all(&[0x80; 11]).await.unwrap();
        let (_, mut rx) = varint(far, tokio::io::sink()).split();
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
