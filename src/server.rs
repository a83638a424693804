//! TCP accept loop.
//!
//! Accepts connections and binds each one to a session serving the shared
//! dispatcher. Each session's lifetime is independent of the loop; shutting
//! the server down stops accepting but leaves established sessions running.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::codec::Dialect;
use crate::dispatcher::Dispatcher;
use crate::session::Session;

/// RPC server bound to a listener and a shared handler registry.
pub struct Server {
    listener: TcpListener,
    dialect: Dialect,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Wrap an already-bound listener.
    pub fn new(listener: TcpListener, dialect: Dialect, dispatcher: Arc<Dispatcher>) -> Server {
        let (shutdown_tx, _) = broadcast::channel(1);
        Server {
            listener,
            dialect,
            dispatcher,
            shutdown_tx,
        }
    }

    /// Bind `addr` and construct a server with a fresh dispatcher.
    pub async fn bind(addr: impl ToSocketAddrs, dialect: Dialect) -> std::io::Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server::new(listener, dialect, Arc::new(Dispatcher::new())))
    }

    /// The registry served to every accepted connection.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until [`shutdown`](Server::shutdown) is called.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(addr = %self.listener.local_addr()?, dialect = ?self.dialect, "RPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "client connected");
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(peer = %peer_addr, error = %e, "failed to disable Nagle");
                            }
                            let session = Session::new(stream, self.dialect);
                            session.attach_dispatcher(Arc::clone(&self.dispatcher));
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Signal the accept loop to stop. Established sessions are unaffected.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
