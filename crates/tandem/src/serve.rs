//! Listener accept loop: one server per inbound connection.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use tandem_channel::Framing;

use crate::assign::Assigner;
use crate::server::{Server, ServerOptions};

/// Options for [`serve`].
#[derive(Clone, Default)]
pub struct LoopOptions {
    /// Framing applied to each accepted connection.
    pub framing: Framing,
    /// Options for each per-connection server.
    pub server: ServerOptions,
}

/// Accept connections from `listener` and run a server for each until the
/// listener fails. The error is reported once every active server has
/// drained.
pub async fn serve(
    listener: TcpListener,
    assigner: Arc<dyn Assigner>,
    opts: LoopOptions,
) -> io::Result<()> {
    let mut active = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(target: "tandem::serve", %addr, "accepted connection");
                let (reader, writer) = stream.into_split();
                let channel = opts.framing.channel(reader, writer);
                let server = Server::new(Arc::clone(&assigner), opts.server.clone());
                server.start(channel);
                active.spawn(async move {
                    if let Err(err) = server.wait().await {
                        warn!(target: "tandem::serve", %addr, error = %err, "server exited");
                    }
                });
            }
            Err(err) => {
                warn!(target: "tandem::serve", error = %err, "accept failed, draining servers");
                while active.join_next().await.is_some() {}
                return Err(err);
            }
        }
    }
}
