//! RPC call surface for one end of a session.
//!
//! A client issues requests (which expect a reply) and notifications
//! (fire-and-forget) over its session, correlating responses by id through
//! the pending-call table. Calls may carry a per-call deadline or inherit
//! the client-wide default.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;

use crate::codec::Dialect;
use crate::error::Error;
use crate::message::Params;
use crate::pending::CallReply;
use crate::session::{Outgoing, Session};

/// Client half of a session.
///
/// Cloning is cheap; clones share the session and its pending-call table
/// but carry their own default timeout.
#[derive(Clone)]
pub struct Client {
    session: Session,
    timeout: Option<Duration>,
}

impl Client {
    /// Issue calls over an existing session.
    pub fn new(session: Session) -> Client {
        Client {
            session,
            timeout: None,
        }
    }

    /// Connect a TCP stream and wrap it in a fresh session.
    pub async fn connect(addr: impl ToSocketAddrs, dialect: Dialect) -> std::io::Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Client::new(Session::new(stream, dialect)))
    }

    /// Default deadline applied to calls without an explicit one. `None`
    /// waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Call `method` and wait for its reply.
    ///
    /// `params` may be a tuple or sequence (positional call), a map or
    /// struct (named call), or any single value, which is treated as a
    /// one-element positional list.
    pub async fn call(&self, method: &str, params: impl Serialize) -> Result<Value, Error> {
        self.call_inner(method, params, self.timeout).await
    }

    /// Call with an explicit deadline, overriding the client default.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: impl Serialize,
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.call_inner(method, params, Some(timeout)).await
    }

    /// Like [`call`](Client::call), but issues the request immediately and
    /// hands back its id before the reply resolves, so the call can be
    /// aborted with [`cancel`](Client::cancel). The returned future uses
    /// the client default timeout.
    pub fn call_tracked(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> (u32, impl Future<Output = Result<Value, Error>> + Send + '_) {
        let id = self.session.next_request_id();
        let rx = self.session.pending().insert(id);
        let started = match into_params(params) {
            Ok(params) => self.dispatch_request(id, method, params),
            Err(err) => {
                self.session.pending().cancel(id, Error::Cancelled);
                Err(err)
            }
        };
        let future = async move {
            started?;
            self.wait_for_reply(id, rx, self.timeout).await
        };
        (id, future)
    }

    /// Fire-and-forget notification; resolves once the frame is queued on
    /// the session's ordered writer.
    pub async fn notify(&self, method: &str, params: impl Serialize) -> Result<(), Error> {
        let params = into_params(params)?;
        self.session.ensure_started();
        debug!(method, "issuing notification");
        self.session.send(Outgoing::Notification {
            method: method.to_string(),
            params,
        })
    }

    /// Fail one in-flight call with [`Error::Cancelled`]. Unknown or
    /// already-completed ids are ignored.
    pub fn cancel(&self, id: u32) {
        self.session.pending().cancel(id, Error::Cancelled);
    }

    /// Fail every call in flight on this client's session.
    pub fn cancel_all(&self) {
        self.session.pending().cancel_all(|| Error::Cancelled);
    }

    async fn call_inner(
        &self,
        method: &str,
        params: impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let params = into_params(params)?;
        let id = self.session.next_request_id();
        let rx = self.session.pending().insert(id);
        self.dispatch_request(id, method, params)?;
        self.wait_for_reply(id, rx, timeout).await
    }

    fn dispatch_request(&self, id: u32, method: &str, params: Params) -> Result<(), Error> {
        self.session.ensure_started();
        debug!(method, id, "issuing call");
        let sent = self.session.send(Outgoing::Request {
            id,
            method: method.to_string(),
            params,
        });
        if let Err(err) = sent {
            self.session.pending().cancel(id, Error::SessionClosed);
            return Err(err);
        }
        Ok(())
    }

    async fn wait_for_reply(
        &self,
        id: u32,
        mut rx: oneshot::Receiver<CallReply>,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let Some(timeout) = timeout else {
            return rx.await.unwrap_or(Err(Error::SessionClosed));
        };
        let outcome = time::timeout(timeout, &mut rx).await;
        match outcome {
            Ok(reply) => reply.unwrap_or(Err(Error::SessionClosed)),
            Err(_elapsed) => {
                if self.session.pending().cancel(id, Error::Timeout) {
                    debug!(id, "call timed out");
                    Err(Error::Timeout)
                } else {
                    // Lost the race: a response landed between the deadline
                    // and the cancellation attempt.
                    rx.try_recv().unwrap_or(Err(Error::SessionClosed))
                }
            }
        }
    }
}

fn into_params(params: impl Serialize) -> Result<Params, Error> {
    let value = serde_json::to_value(params)
        .map_err(|e| Error::Protocol(format!("unserializable params: {}", e)))?;
    Ok(match value {
        Value::Null => Params::none(),
        Value::Array(args) => Params::Positional(args),
        Value::Object(args) => Params::Named(args),
        other => Params::Positional(vec![other]),
    })
}
