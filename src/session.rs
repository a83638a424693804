//! Per-connection engine.
//!
//! A session owns its byte stream through two tasks: a reader that decodes
//! messages off the wire and a writer that drains an ordered outgoing
//! queue, so concurrent producers can never interleave frame bytes. Either
//! end of a connection may hold both roles at once: inbound requests go to
//! the attached dispatcher while inbound responses complete pending calls
//! issued through [`Client`](crate::Client).
//!
//! The read loop starts lazily, on the first client send or when a
//! dispatcher is attached, so a direction that is never used never opens.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::codec::{Codec, Dialect};
use crate::dispatcher::{Dispatcher, Responder};
use crate::error::{Error, UNKNOWN_FUNCTION};
use crate::message::{Id, Message, Params};
use crate::pending::PendingCalls;

/// Read chunk granularity for the growable receive buffer.
const READ_CHUNK_SIZE: usize = 4096;

trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

type BoxedStream = Box<dyn SessionStream>;

/// A message queued for the writer task, which owns all encoding.
pub(crate) enum Outgoing {
    Request {
        id: u32,
        method: String,
        params: Params,
    },
    Notification {
        method: String,
        params: Params,
    },
    Reply {
        id: Id,
        result: Result<Value, Value>,
    },
}

/// Handle to a per-connection RPC engine. Clones share the connection.
///
/// Dropping every handle does not close the connection; the session lives
/// until the stream ends, a protocol violation occurs, or
/// [`close`](Session::close) is called.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    dialect: Dialect,
    out: mpsc::UnboundedSender<Outgoing>,
    pending: PendingCalls,
    next_id: AtomicU32,
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
    closed: AtomicBool,
    close_tx: broadcast::Sender<()>,
    start: Mutex<Option<StartParts>>,
}

struct StartParts {
    stream: BoxedStream,
    out_rx: mpsc::UnboundedReceiver<Outgoing>,
}

impl Session {
    /// Wrap an established byte stream speaking `dialect`.
    pub fn new<S>(stream: S, dialect: Dialect) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, _) = broadcast::channel(1);
        Session {
            shared: Arc::new(Shared {
                dialect,
                out: out_tx,
                pending: PendingCalls::new(),
                next_id: AtomicU32::new(0),
                dispatcher: RwLock::new(None),
                closed: AtomicBool::new(false),
                close_tx,
                start: Mutex::new(Some(StartParts {
                    stream: Box::new(Box::pin(stream)),
                    out_rx,
                })),
            }),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.shared.dialect
    }

    /// Serve inbound requests on this connection with `dispatcher`,
    /// starting the read loop if it is not running yet. Must be called
    /// from within a tokio runtime.
    pub fn attach_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        *self
            .shared
            .dispatcher
            .write()
            .expect("dispatcher slot lock poisoned") = Some(dispatcher);
        self.shared.ensure_started();
    }

    /// True once the connection is torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tear the connection down. Outstanding calls fail with
    /// [`Error::SessionClosed`] and both I/O tasks stop; replies fired by
    /// in-flight handlers afterwards are discarded.
    pub fn close(&self) {
        self.shared.teardown("closed by user");
    }

    pub(crate) fn next_request_id(&self) -> u32 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.shared.pending
    }

    pub(crate) fn ensure_started(&self) {
        self.shared.ensure_started();
    }

    pub(crate) fn send(&self, outgoing: Outgoing) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.shared.out.send(outgoing).map_err(|_| Error::SessionClosed)
    }
}

impl Shared {
    /// Spawn the reader and writer tasks on first use.
    fn ensure_started(self: &Arc<Self>) {
        let parts = self.start.lock().expect("session start slot lock poisoned").take();
        let Some(parts) = parts else {
            return;
        };
        // Subscribe before checking the flag: teardown stores the flag and
        // then broadcasts, so a close racing this start is seen one way or
        // the other.
        let read_close = self.close_tx.subscribe();
        let write_close = self.close_tx.subscribe();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (read, write) = tokio::io::split(parts.stream);
        tokio::spawn(read_loop(Arc::clone(self), read, read_close));
        tokio::spawn(write_loop(Arc::clone(self), write, parts.out_rx, write_close));
    }

    fn teardown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "session teardown");
        let _ = self.close_tx.send(());
        self.pending.cancel_all(|| Error::SessionClosed);
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut read: ReadHalf<BoxedStream>,
    mut close_rx: broadcast::Receiver<()>,
) {
    let mut codec = shared.dialect.codec();
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    'outer: loop {
        buf.reserve(READ_CHUNK_SIZE);
        tokio::select! {
            _ = close_rx.recv() => break,
            result = read.read_buf(&mut buf) => match result {
                Ok(0) => {
                    debug!("connection closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "read error");
                    break;
                }
            },
        }

        loop {
            match codec.decode_next(&mut buf) {
                Ok(Some(message)) => deliver(&shared, message),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "protocol violation");
                    break 'outer;
                }
            }
        }
    }

    shared.teardown("connection lost");
}

/// Route one decoded message. Responses complete pending calls; requests
/// and notifications are posted to the runtime so handlers never run on
/// the read path.
fn deliver(shared: &Arc<Shared>, message: Message) {
    if shared.closed.load(Ordering::Acquire) {
        return;
    }
    match message {
        Message::Response { id, result } => {
            let Some(id) = id.as_request_id() else {
                debug!(?id, "response with an uncorrelatable id");
                return;
            };
            shared.pending.complete(id, result.map_err(Error::Call));
        }
        Message::Request { id, method, params } => {
            let responder = Responder::for_request(shared.out.clone(), id);
            invoke(shared, &method, params, responder);
        }
        Message::Notification { method, params } => {
            invoke(shared, &method, params, Responder::for_notification());
        }
    }
}

fn invoke(shared: &Arc<Shared>, method: &str, params: Params, responder: Responder) {
    let dispatcher = shared
        .dispatcher
        .read()
        .expect("dispatcher slot lock poisoned")
        .clone();
    let Some(dispatcher) = dispatcher else {
        debug!(method, "call received with no dispatcher attached");
        responder.set_error(UNKNOWN_FUNCTION);
        return;
    };
    let Some(handler) = dispatcher.lookup(method) else {
        debug!(method, "unknown function");
        responder.set_error(UNKNOWN_FUNCTION);
        return;
    };
    debug!(method, "dispatching call");
    tokio::spawn(async move {
        (*handler)(responder, params);
    });
}

async fn write_loop(
    shared: Arc<Shared>,
    mut write: WriteHalf<BoxedStream>,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
    mut close_rx: broadcast::Receiver<()>,
) {
    let codec = shared.dialect.codec();

    loop {
        let outgoing = tokio::select! {
            _ = close_rx.recv() => break,
            outgoing = out_rx.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        let (frame, request_id) = encode(codec.as_ref(), &outgoing);
        if let Err(err) = write_frame(&mut write, &frame).await {
            debug!(error = %err, "write error");
            // The request this frame belonged to can never be answered.
            if let Some(id) = request_id {
                shared.pending.cancel(id, Error::SessionClosed);
            }
            shared.teardown("write failure");
            break;
        }
    }
}

async fn write_frame(write: &mut WriteHalf<BoxedStream>, frame: &[u8]) -> std::io::Result<()> {
    write.write_all(frame).await?;
    write.flush().await
}

fn encode(codec: &dyn Codec, outgoing: &Outgoing) -> (bytes::Bytes, Option<u32>) {
    match outgoing {
        Outgoing::Request { id, method, params } => {
            (codec.encode_request(*id, method, params), Some(*id))
        }
        Outgoing::Notification { method, params } => {
            (codec.encode_notification(method, params), None)
        }
        Outgoing::Reply { id, result } => (codec.encode_response(id, result.as_ref()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let (local, _remote) = tokio::io::duplex(64);
        let session = Session::new(local, Dialect::Msgpack);
        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (local, _remote) = tokio::io::duplex(64);
        let session = Session::new(local, Dialect::JsonRpc);
        session.close();
        let err = session
            .send(Outgoing::Notification {
                method: "ping".to_string(),
                params: Params::none(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }

    #[tokio::test]
    async fn pending_calls_fail_on_teardown() {
        let (local, _remote) = tokio::io::duplex(64);
        let session = Session::new(local, Dialect::Msgpack);
        let rx = session.pending().insert(session.next_request_id());
        session.close();
        assert!(matches!(rx.await.unwrap(), Err(Error::SessionClosed)));
    }
}
