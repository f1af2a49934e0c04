//! The client request multiplexer.
//!
//! A [`Client`] owns one channel. Callers from any task issue calls,
//! notifications, and batches; rendered frames funnel through a single
//! writer task (the channel's one sender), and a single reader task
//! demultiplexes inbound records back to the pending calls by identifier.
//! Server pushes are handed to the `on_notify` callback one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tandem_channel::{is_closed, Channel};
use tandem_wire::{parse_replies, Reply, Request, RequestId, Response, RpcError};

use crate::context::{Context, DoneReason};

/// Hook applied to outbound params before each request is rendered, letting
/// the client embed caller metadata (see [`crate::jctx`]).
pub type EncodeContext =
    Arc<dyn Fn(&Context, Option<Value>) -> Result<Option<Value>, RpcError> + Send + Sync>;

/// Callback invoked for server-initiated notifications. At most one
/// invocation runs at a time.
pub type NotifyCallback = Arc<dyn Fn(Request) + Send + Sync>;

/// Client behaviour switches. The default is a strict client that logs and
/// discards server pushes.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Tolerate replies missing the `"jsonrpc":"2.0"` marker.
    pub allow_v1: bool,
    /// Transform outbound params for each request.
    pub encode_context: Option<EncodeContext>,
    /// Receive server-initiated notifications.
    pub on_notify: Option<NotifyCallback>,
}

/// Errors reported by client operations.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The sentinel for operations after [`Client::close`].
    #[error("client is closed")]
    Closed,
    /// The server answered the call with an error.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The caller's context was cancelled before the reply arrived.
    #[error("call cancelled")]
    Cancelled,
    /// The caller's deadline passed before the reply arrived.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The channel died while work was outstanding.
    #[error("connection shut down: {0}")]
    Shutdown(String),
    /// A frame could not be written.
    #[error("i/o error: {0}")]
    Io(String),
}

/// One member of a batch: a method, its params, and whether it is a
/// notification.
#[derive(Debug, Clone)]
pub struct Spec {
    pub method: String,
    pub params: Option<Value>,
    pub notify: bool,
}

impl Spec {
    pub fn call(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: false,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Closing,
    Closed,
}

type PendingSlot = oneshot::Sender<Result<Response, ClientError>>;

struct OutFrame {
    bytes: Vec<u8>,
    /// Present for frames whose caller blocks on the write itself
    /// (notifications and cancel frames); calls block on their reply slot.
    ack: Option<oneshot::Sender<Result<(), String>>>,
}

/// A JSON-RPC client bound to one channel. Safe for concurrent use from any
/// number of tasks; cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    allow_v1: bool,
    encode_context: Option<EncodeContext>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingSlot>>,
    lifecycle: Mutex<Lifecycle>,
    out_tx: Mutex<Option<mpsc::Sender<OutFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl Client {
    /// Take ownership of a channel and start the reader and writer tasks.
    pub fn new(channel: Channel, opts: ClientOptions) -> Self {
        let (tx_half, rx_half) = channel.split();
        let (out_tx, out_rx) = mpsc::channel::<OutFrame>(64);
        let (stop_tx, _) = watch::channel(false);
        let stop_rx = stop_tx.subscribe();

        let inner = Arc::new(ClientInner {
            allow_v1: opts.allow_v1,
            encode_context: opts.encode_context,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::Running),
            out_tx: Mutex::new(Some(out_tx)),
            tasks: Mutex::new(Vec::new()),
            stop_tx,
        });

        // Server pushes are serialized through their own queue so at most
        // one on_notify invocation is active at a time.
        let push_tx = opts.on_notify.map(|callback| {
            let (push_tx, mut push_rx) = mpsc::channel::<Request>(16);
            let handle = tokio::spawn(async move {
                while let Some(req) = push_rx.recv().await {
                    callback(req);
                }
            });
            inner.tasks.lock().unwrap().push(handle);
            push_tx
        });

        let writer = tokio::spawn(write_loop(out_rx, tx_half, Arc::clone(&inner)));
        let reader = tokio::spawn(read_loop(rx_half, Arc::clone(&inner), push_tx, stop_rx));
        {
            let mut tasks = inner.tasks.lock().unwrap();
            tasks.push(writer);
            tasks.push(reader);
        }

        Self { inner }
    }

    /// Send one call and wait for its reply, the caller's context to end,
    /// or the channel to die. A server-side error surfaces as
    /// [`ClientError::Rpc`].
    pub async fn call(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
    ) -> Result<Response, ClientError> {
        let mut request = self.prepare(ctx, method, params, false)?;
        let (id, mut slot) = match self.register(&mut request) {
            Some(entry) => entry,
            // Unreachable: a call always carries an id.
            None => return Err(ClientError::Closed),
        };
        if let Err(err) = self.enqueue(render(&request.to_value())?, None).await {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(err);
        }

        tokio::select! {
            reply = &mut slot => match reply {
                Ok(result) => finish(result?),
                Err(_) => Err(ClientError::Shutdown("reply slot dropped".into())),
            },
            reason = ctx.done() => {
                self.inner.pending.lock().unwrap().remove(&id);
                // A reply may have raced the cancellation.
                if let Ok(result) = slot.try_recv() {
                    return finish(result?);
                }
                self.send_cancel(&[id]).await;
                Err(done_error(reason))
            }
        }
    }

    /// Send one notification and return once the frame has been written.
    pub async fn notify(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        let request = self.prepare(ctx, method, params, true)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(render(&request.to_value())?, Some(ack_tx)).await?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ClientError::Io(err)),
            Err(_) => Err(ClientError::Shutdown("writer stopped".into())),
        }
    }

    /// Send a batch as one frame and wait for every non-notification reply.
    /// Responses come back in spec order, notifications excised; each
    /// carries its own success-or-error payload.
    pub async fn batch(
        &self,
        ctx: &Context,
        specs: Vec<Spec>,
    ) -> Result<Vec<Response>, ClientError> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let mut members = Vec::with_capacity(specs.len());
        let mut waits = Vec::new();
        for spec in specs {
            let mut request = self.prepare(ctx, &spec.method, spec.params, spec.notify)?;
            if let Some(entry) = self.register(&mut request) {
                waits.push(entry);
            }
            members.push(request.to_value());
        }

        let enqueue = self.enqueue(render(&Value::Array(members))?, None).await;
        if let Err(err) = enqueue {
            let mut pending = self.inner.pending.lock().unwrap();
            for (id, _) in &waits {
                pending.remove(id);
            }
            return Err(err);
        }

        let mut responses = Vec::with_capacity(waits.len());
        let mut waits = waits.into_iter();
        while let Some((id, mut slot)) = waits.next() {
            tokio::select! {
                reply = &mut slot => match reply {
                    Ok(Ok(rsp)) => responses.push(rsp),
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(ClientError::Shutdown("reply slot dropped".into())),
                },
                reason = ctx.done() => {
                    // Tear down this call and everything still outstanding
                    // with a single rpc.cancel.
                    let mut ids = vec![id];
                    ids.extend(waits.map(|(id, _)| id));
                    {
                        let mut pending = self.inner.pending.lock().unwrap();
                        for id in &ids {
                            pending.remove(id);
                        }
                    }
                    self.send_cancel(&ids).await;
                    return Err(done_error(reason));
                }
            }
        }
        Ok(responses)
    }

    /// Fail every pending call, close the channel, and wait for the engine
    /// tasks to finish. Idempotent; operations after close report
    /// [`ClientError::Closed`].
    pub async fn close(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if *lifecycle != Lifecycle::Running {
                return;
            }
            *lifecycle = Lifecycle::Closing;
        }
        self.inner.fail_pending(ClientError::Closed);
        let _ = self.inner.stop_tx.send(true);
        drop(self.inner.out_tx.lock().unwrap().take());

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        *self.inner.lifecycle.lock().unwrap() = Lifecycle::Closed;
    }

    /// Whether the client is still usable.
    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock().unwrap() == Lifecycle::Running
    }

    // Validate, apply the context hook, and build the request envelope.
    fn prepare(
        &self,
        ctx: &Context,
        method: &str,
        params: Option<Value>,
        notify: bool,
    ) -> Result<Request, ClientError> {
        if !self.is_running() {
            return Err(ClientError::Closed);
        }
        if let Some(p) = &params {
            if !tandem_wire::request::params_are_structured(p) {
                return Err(ClientError::Rpc(RpcError::invalid_params(
                    "params are not an object or array",
                )));
            }
        }
        let params = match &self.inner.encode_context {
            Some(hook) => hook(ctx, params)?,
            None => params,
        };
        Ok(if notify {
            Request::notification(method, params)
        } else {
            // The id is assigned at registration time; placeholder here.
            Request::call(0, method, params)
        })
    }

    // Assign the next identifier to a call and park a delivery slot for it.
    // Notifications get no identifier and no slot.
    fn register(
        &self,
        request: &mut Request,
    ) -> Option<(i64, oneshot::Receiver<Result<Response, ClientError>>)> {
        request.id.as_ref()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        request.id = Some(RequestId::Number(id));
        let (slot_tx, slot_rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, slot_tx);
        Some((id, slot_rx))
    }

    async fn enqueue(
        &self,
        bytes: Vec<u8>,
        ack: Option<oneshot::Sender<Result<(), String>>>,
    ) -> Result<(), ClientError> {
        let tx = self.inner.out_tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            return Err(ClientError::Closed);
        };
        tx.send(OutFrame { bytes, ack })
            .await
            .map_err(|_| ClientError::Shutdown("writer stopped".into()))
    }

    // Emit one rpc.cancel naming the abandoned ids, and wait for it to be
    // written so the cancellation is on the wire before the caller returns.
    async fn send_cancel(&self, ids: &[i64]) {
        let params = Value::Array(ids.iter().map(|id| Value::from(*id)).collect());
        let frame = Request::notification("rpc.cancel", Some(params)).to_value();
        let Ok(bytes) = render(&frame) else { return };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.enqueue(bytes, Some(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl ClientInner {
    fn fail_pending(&self, err: ClientError) {
        let mut pending = self.pending.lock().unwrap();
        for (_, slot) in pending.drain() {
            let _ = slot.send(Err(err.clone()));
        }
    }

    // Terminal transition driven by the reader or writer noticing the
    // channel die underneath us.
    fn shutdown(&self, err: ClientError) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle == Lifecycle::Running {
                *lifecycle = Lifecycle::Closed;
            }
        }
        self.fail_pending(err);
        drop(self.out_tx.lock().unwrap().take());
        let _ = self.stop_tx.send(true);
    }

    fn deliver(&self, rsp: Response) {
        let Some(RequestId::Number(id)) = rsp.id.clone() else {
            warn!(target: "tandem::client", id = ?rsp.id, "discarding reply with no matching id");
            return;
        };
        let Some(slot) = self.pending.lock().unwrap().remove(&id) else {
            warn!(target: "tandem::client", id, "discarding reply for unknown or duplicate id");
            return;
        };
        let _ = slot.send(Ok(rsp));
    }
}

async fn write_loop(
    mut queue: mpsc::Receiver<OutFrame>,
    mut tx: Box<dyn tandem_channel::Sender>,
    inner: Arc<ClientInner>,
) {
    while let Some(frame) = queue.recv().await {
        let result = tx.send(&frame.bytes).await;
        match result {
            Ok(()) => {
                if let Some(ack) = frame.ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(err) => {
                if let Some(ack) = frame.ack {
                    let _ = ack.send(Err(err.to_string()));
                }
                warn!(target: "tandem::client", error = %err, "write failed, shutting down");
                inner.shutdown(ClientError::Shutdown(err.to_string()));
                break;
            }
        }
    }
    let _ = tx.close().await;
}

async fn read_loop(
    mut rx: Box<dyn tandem_channel::Receiver>,
    inner: Arc<ClientInner>,
    push_tx: Option<mpsc::Sender<Request>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let record = tokio::select! {
            _ = stop_rx.changed() => return,
            record = rx.recv() => record,
        };
        match record {
            Ok(Some(record)) => handle_record(&inner, &record, &push_tx).await,
            Ok(None) => {
                inner.shutdown(ClientError::Shutdown("connection closed".into()));
                return;
            }
            Err(err) if is_closed(&err) => {
                inner.shutdown(ClientError::Shutdown("connection closed".into()));
                return;
            }
            Err(err) => {
                inner.shutdown(ClientError::Io(err.to_string()));
                return;
            }
        }
    }
}

async fn handle_record(
    inner: &Arc<ClientInner>,
    record: &[u8],
    push_tx: &Option<mpsc::Sender<Request>>,
) {
    let replies = match parse_replies(record, inner.allow_v1) {
        Ok(replies) => replies,
        Err(err) => {
            warn!(target: "tandem::client", error = %err, "discarding unparseable record");
            return;
        }
    };
    for reply in replies {
        match reply {
            Ok(Reply::Response(rsp)) => inner.deliver(rsp),
            Ok(Reply::Push(req)) => match push_tx {
                Some(tx) => {
                    if tx.send(req).await.is_err() {
                        debug!(target: "tandem::client", "push handler is gone");
                    }
                }
                None => {
                    debug!(target: "tandem::client", method = %req.method, "discarding server push")
                }
            },
            Err(err) => {
                warn!(target: "tandem::client", error = %err, "discarding malformed reply")
            }
        }
    }
}

fn finish(rsp: Response) -> Result<Response, ClientError> {
    match rsp.payload {
        Ok(_) => Ok(rsp),
        Err(err) => Err(ClientError::Rpc(err)),
    }
}

fn done_error(reason: DoneReason) -> ClientError {
    match reason {
        DoneReason::Cancelled => ClientError::Cancelled,
        DoneReason::DeadlineExceeded => ClientError::DeadlineExceeded,
    }
}

fn render(value: &Value) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(value).map_err(|e| ClientError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_constructors() {
        let call = Spec::call("Math.Add", Some(json!([1, 2])));
        assert!(!call.notify);
        let note = Spec::notification("Alert", None);
        assert!(note.notify);
    }

    #[tokio::test]
    async fn scalar_params_are_rejected_locally() {
        let (near, _far) = tokio::io::duplex(256);
        let (r, w) = tokio::io::split(near);
        let client = Client::new(tandem_channel::line(r, w), ClientOptions::default());
        let ctx = Context::new();
        let err = client.call(&ctx, "Add", Some(json!(3))).await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc(e) if e.code == -32602));
        client.close().await;
    }

    #[tokio::test]
    async fn operations_after_close_report_closed() {
        let (near, _far) = tokio::io::duplex(256);
        let (r, w) = tokio::io::split(near);
        let client = Client::new(tandem_channel::line(r, w), ClientOptions::default());
        client.close().await;
        let ctx = Context::new();
        assert!(matches!(
            client.call(&ctx, "Add", None).await.unwrap_err(),
            ClientError::Closed
        ));
        assert!(matches!(
            client.notify(&ctx, "Alert", None).await.unwrap_err(),
            ClientError::Closed
        ));
        // close is idempotent
        client.close().await;
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let (near, _far) = tokio::io::duplex(256);
        let (r, w) = tokio::io::split(near);
        let client = Client::new(tandem_channel::line(r, w), ClientOptions::default());
        let ctx = Context::new();
        let responses = client.batch(&ctx, Vec::new()).await.unwrap();
        assert!(responses.is_empty());
        client.close().await;
    }
}
