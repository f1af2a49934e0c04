//! # Framed record channels
//!
//! A channel carries a sequence of opaque byte records over a paired
//! read/write byte stream. The engines in the `tandem` crate speak whole
//! records; this crate supplies the framing disciplines that cut a byte
//! stream into records and back:
//!
//! - [`line`]: one record per `\n`-terminated line; the LF is not part of
//!   the record.
//! - [`lsp`]: an HTTP-style `Content-Length` header block followed by the
//!   payload, as used by the Language Server Protocol.
//! - [`varint`]: an unsigned little-endian varint length prefix.
//! - [`raw_json`]: records are self-delimiting JSON values split by a
//!   streaming scanner (the default).
//! - [`json`]: like `raw_json`, but outbound records are validated and
//!   re-encoded compactly.
//!
//! One task may send while another receives; neither side is required to
//! support more than one concurrent user.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod json;
pub mod line;
pub mod lsp;
pub mod varint;

pub use json::{json, raw_json};
pub use line::line;
pub use lsp::lsp;
pub use varint::varint;

/// The sending half of a channel: writes one whole record per call.
#[async_trait]
pub trait Sender: Send {
    async fn send(&mut self, record: &[u8]) -> io::Result<()>;

    /// Shut down the write side, signalling end-of-stream to the peer.
    /// Closing is idempotent.
    async fn close(&mut self) -> io::Result<()>;
}

/// The receiving half of a channel: yields one whole record per call, or
/// `Ok(None)` at a clean end of stream.
#[async_trait]
pub trait Receiver: Send {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// A paired sender and receiver over one byte stream.
pub struct Channel {
    sender: Box<dyn Sender>,
    receiver: Box<dyn Receiver>,
}

impl Channel {
    pub fn new(sender: Box<dyn Sender>, receiver: Box<dyn Receiver>) -> Self {
        Self { sender, receiver }
    }

    /// Hand the two halves to their owning tasks.
    pub fn split(self) -> (Box<dyn Sender>, Box<dyn Receiver>) {
        (self.sender, self.receiver)
    }
}

/// A framing discipline, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    Json,
    Line,
    Lsp,
    #[default]
    RawJson,
    Varint,
}

impl Framing {
    /// Look up a framing by its registered name. The names understood are
    /// `json`, `line`, `lsp`, `raw`, and `varint`.
    pub fn from_name(name: &str) -> Option<Framing> {
        match name {
            "json" => Some(Framing::Json),
            "line" => Some(Framing::Line),
            "lsp" => Some(Framing::Lsp),
            "raw" => Some(Framing::RawJson),
            "varint" => Some(Framing::Varint),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Framing::Json => "json",
            Framing::Line => "line",
            Framing::Lsp => "lsp",
            Framing::RawJson => "raw",
            Framing::Varint => "varint",
        }
    }

    /// Build a channel with this framing over the given stream halves.
    pub fn channel<R, W>(self, reader: R, writer: W) -> Channel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match self {
            Framing::Json => json(reader, writer),
            Framing::Line => line(reader, writer),
            Framing::Lsp => lsp(reader, writer),
            Framing::RawJson => raw_json(reader, writer),
            Framing::Varint => varint(reader, writer),
        }
    }
}

/// Records larger than this are refused rather than buffered; a length
/// prefix beyond it is treated as corrupt framing.
pub(crate) const MAX_RECORD_SIZE: usize = 64 << 20;

/// Whether an I/O error indicates the underlying connection was torn down.
/// The engines coerce these to a clean end-of-stream.
pub fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    ) || err.to_string().contains("closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_names_roundtrip() {
        for framing in [
            Framing::Json,
            Framing::Line,
            Framing::Lsp,
            Framing::RawJson,
            Framing::Varint,
        ] {
            assert_eq!(Framing::from_name(framing.name()), Some(framing));
        }
        assert_eq!(Framing::from_name("cobs"), None);
    }

    #[test]
    fn default_framing_is_raw_json() {
        assert_eq!(Framing::default(), Framing::RawJson);
    }

    #[test]
    fn closed_error_classification() {
        assert!(is_closed(&io::Error::new(io::ErrorKind::BrokenPipe, "x")));
        assert!(is_closed(&io::Error::other(
            "use of closed network connection"
        )));
        assert!(!is_closed(&io::Error::new(
            io::ErrorKind::InvalidData,
            "bad frame"
        )));
    }

    #[tokio::test]
    async fn channel_by_name_roundtrips() {
        for name in ["json", "line", "lsp", "raw", "varint"] {
            let framing = Framing::from_name(name).unwrap();
            let (near, far) = tokio::io::duplex(4096);
            let (near_r, near_w) = tokio::io::split(near);
            let (far_r, far_w) = tokio::io::split(far);
            let (mut tx, _) = framing.channel(near_r, near_w).split();
            let (_, mut rx) = framing.channel(far_r, far_w).split();

            tx.send(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"A\"}")
                .await
                .unwrap();
            let rec = rx.recv().await.unwrap().expect("record");
            assert_eq!(rec, b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"A\"}");
        }
    }
}
