//! Self-delimiting JSON framing: records are whole JSON values split out of
//! the byte stream by an incremental scanner. No delimiter bytes are added;
//! whitespace between values is consumed and never becomes part of a record.
//!
//! [`raw_json`] writes outbound records verbatim; [`json`] validates each
//! outbound record and re-encodes it compactly.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Channel, Receiver, Sender, MAX_RECORD_SIZE};

/// Build a raw JSON channel: records pass through untouched.
pub fn raw_json<R, W>(reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Channel::new(
        Box::new(JsonSender {
            writer,
            compact: false,
        }),
        Box::new(JsonReceiver {
            reader,
            buf: BytesMut::new(),
        }),
    )
}

/// Build a JSON channel that compacts outbound records.
pub fn json<R, W>(reader: R, writer: W) -> Channel
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Channel::new(
        Box::new(JsonSender {
            writer,
            compact: true,
        }),
        Box::new(JsonReceiver {
            reader,
            buf: BytesMut::new(),
        }),
    )
}

struct JsonSender<W> {
    writer: W,
    compact: bool,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sender for JsonSender<W> {
    async fn send(&mut self, record: &[u8]) -> io::Result<()> {
        if self.compact {
            let value: serde_json::Value = serde_json::from_slice(record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let compacted = serde_json::to_vec(&value)?;
            self.writer.write_all(&compacted).await?;
        } else {
            self.writer.write_all(record).await?;
        }
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

struct JsonReceiver<R> {
    reader: R,
    buf: BytesMut,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Receiver for JsonReceiver<R> {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Scan::Complete { start, end } = scan_value(&self.buf, false)? {
                let record = self.buf[start..end].to_vec();
                self.buf.advance(end);
                return Ok(Some(record));
            }
            if self.buf.len() > MAX_RECORD_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "record exceeds maximum size",
                ));
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                // End of stream: whitespace may remain, a partial value may not.
                // A trailing number is complete only now that nothing can follow it.
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return match scan_value(&self.buf, true)? {
                    Scan::Complete { start, end } => {
                        let record = self.buf[start..end].to_vec();
                        self.buf.advance(end);
                        Ok(Some(record))
                    }
                    Scan::Incomplete => Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof inside a JSON value",
                    )),
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

enum Scan {
    /// A whole value occupies `start..end` of the buffer.
    Complete { start: usize, end: usize },
    /// More bytes are needed.
    Incomplete,
}

/// Find the extent of one top-level JSON value. The scanner tracks strings,
/// escapes, and bracket nesting; it does not validate the value's interior,
/// which is the envelope parser's job.
fn scan_value(buf: &[u8], at_eof: bool) -> io::Result<Scan> {
    let start = match buf.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(i) => i,
        None => return Ok(Scan::Incomplete),
    };

    match buf[start] {
        b'{' | b'[' => scan_nested(buf, start),
        b'"' => match scan_string(buf, start) {
            Some(end) => Ok(Scan::Complete { start, end }),
            None => Ok(Scan::Incomplete),
        },
        b'-' | b'0'..=b'9' => {
            let mut end = start + 1;
            while end < buf.len() && is_number_byte(buf[end]) {
                end += 1;
            }
            if end == buf.len() && !at_eof {
                return Ok(Scan::Incomplete);
            }
            Ok(Scan::Complete { start, end })
        }
        b't' => scan_literal(buf, start, b"true"),
        b'f' => scan_literal(buf, start, b"false"),
        b'n' => scan_literal(buf, start, b"null"),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected byte {other:#04x} at start of JSON value"),
        )),
    }
}

fn scan_nested(buf: &[u8], start: usize) -> io::Result<Scan> {
    let mut depth = 0usize;
    let mut i = start;
    while i < buf.len() {
        match buf[i] {
            b'"' => match scan_string(buf, i) {
                Some(end) => {
                    i = end;
                    continue;
                }
                None => return Ok(Scan::Incomplete),
            },
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "unbalanced bracket")
                })?;
                if depth == 0 {
                    return Ok(Scan::Complete {
                        start,
                        end: i + 1,
                    });
                }
            }
            _ => {}
        }
        i += 1;
    }
    Ok(Scan::Incomplete)
}

/// The index one past a string's closing quote, or None if unterminated.
fn scan_string(buf: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < buf.len() {
        match buf[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn scan_literal(buf: &[u8], start: usize, literal: &[u8]) -> io::Result<Scan> {
    let have = &buf[start..(start + literal.len()).min(buf.len())];
    if have == &literal[..have.len()] {
        if have.len() == literal.len() {
            Ok(Scan::Complete {
                start,
                end: start + literal.len(),
            })
        } else {
            Ok(Scan::Incomplete)
        }
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed JSON literal",
        ))
    }
}

fn is_number_byte(b: u8) -> bool {
    b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn collect(mut rx: Box<dyn Receiver>) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        while let Some(rec) = rx.recv().await.unwrap() {
            records.push(rec);
        }
        records
    }

    #[tokio::test]
    async fn splits_concatenated_values() {
        let (mut near, far) = duplex(1024);
        near.write_all(b"{\"a\":1}{\"b\":2}[3,4]").await.unwrap();
        near.shutdown().await.unwrap();

        let (_, rx) = raw_json(far, tokio::io::sink()).split();
        let records = collect(rx).await;
        assert_eq!(records, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec(), b"[3,4]".to_vec()]);
    }

    #[tokio::test]
    async fn interstitial_whitespace_is_consumed() {
        let (mut near, far) = duplex(1024);
        near.write_all(b"  {\"a\":1}\n\n\t {\"b\":2}\n").await.unwrap();
        near.shutdown().await.unwrap();

        let (_, rx) = json(far, tokio::io::sink()).split();
        let records = collect(rx).await;
        assert_eq!(records, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
    }

    #[tokio::test]
    async fn strings_hide_structural_bytes() {
        let (mut near, far) = duplex(1024);
        near.write_all(b"{\"brace\":\"}{\",\"quote\":\"\\\"\"}")
            .await
            .unwrap();
        near.shutdown().await.unwrap();

        let (_, rx) = raw_json(far, tokio::io::sink()).split();
        let records = collect(rx).await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn value_split_across_reads() {
        let (mut near, far) = duplex(16);
        let (_, mut rx) = raw_json(far, tokio::io::sink()).split();

        let writer = tokio::spawn(async move {
            near.write_all(b"{\"long\":\"aaaa").await.unwrap();
            tokio::task::yield_now().await;
            near.write_all(b"bbbb\"}").await.unwrap();
        });
        let rec = rx.recv().await.unwrap().unwrap();
        assert_eq!(rec, b"{\"long\":\"aaaabbbb\"}");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_inside_value_is_an_error() {
        let (mut near, far) = duplex(64);
        near.write_all(b"{\"open\":").await.unwrap();
        near.shutdown().await.unwrap();

        let (_, mut rx) = raw_json(far, tokio::io::sink()).split();
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn garbage_is_invalid_data() {
        let (mut near, far) = duplex(64);
        near.write_all(b"@@@").await.unwrap();

        let (_, mut rx) = raw_json(far, tokio::io::sink()).split();
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn trailing_number_completes_at_eof() {
        let (mut near, far) = duplex(64);
        near.write_all(b"42").await.unwrap();
        near.shutdown().await.unwrap();

        let (_, mut rx) = raw_json(far, tokio::io::sink()).split();
        assert_eq!(rx.recv().await.unwrap().unwrap(), b"42");
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn compacting_sender_strips_whitespace() {
        let (near, far) = duplex(1024);
        let (mut tx, _) = json(tokio::io::empty(), near).split();
        let (_, mut rx) = json(far, tokio::io::sink()).split();

        tx.send(b"{ \"a\" : 1 }").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn compacting_sender_rejects_invalid_records() {
        let (near, _far) = duplex(64);
        let (mut tx, _) = json(tokio::io::empty(), near).split();
        let err = tx.send(b"not json").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
