//! TCP listener for Modbus clients.
//!
//! Accepts incoming connections and runs each one as its own task against
//! the shared register bank.

use crate::config::Config;
use crate::protocols::modbus::{handle_connection, ConnectionOptions};
use crate::registers::RegisterBank;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    registers: Arc<RegisterBank>,
    options: ConnectionOptions,
}

impl Server {
    /// Bind the listening socket and allocate the register bank.
    ///
    /// Must be called from within a tokio runtime. A bind failure is not
    /// retried.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::from_std(create_listener(addr, config.backlog)?)?;
        let registers = RegisterBank::new(config.register_count);
        info!(
            address = %listener.local_addr()?,
            registers = registers.len(),
            "Modbus server listening"
        );

        Ok(Server {
            listener,
            registers,
            options: ConnectionOptions {
                debug: config.debug,
                idle_timeout: config.idle_timeout,
                frame_timeout: config.frame_timeout,
            },
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get a reference to the register bank for testing
    #[cfg(test)]
    pub fn registers(&self) -> &Arc<RegisterBank> {
        &self.registers
    }

    /// Serve until SIGINT or SIGTERM.
    pub async fn run(self) -> io::Result<()> {
        self.serve(shutdown_signal()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// After shutdown no new connections are accepted. Connections waiting
    /// for a request are closed, and a reply already in progress is written
    /// before its connection closes.
    pub async fn serve<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "Client connected");

                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let registers = Arc::clone(&self.registers);
                        let options = self.options;
                        let shutdown = shutdown_rx.clone();

                        connections.spawn(async move {
                            match handle_connection(stream, &registers, options, shutdown).await {
                                Ok(()) => info!(peer = %peer, "Client disconnected"),
                                Err(e) if e.is_reset() => {
                                    info!(peer = %peer, "Client disconnected (connection reset by peer)")
                                }
                                Err(e) => warn!(peer = %peer, error = %e, "Closing connection"),
                            }
                        });
                    }
                    Err(e) => accept_failed(&e).await,
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join_error(joined);
                }
            }
        }

        info!(connections = connections.len(), "Server shutting down");
        drop(self.listener);
        // Receivers only ever see `true` from here on.
        shutdown_tx.send_replace(true);

        while let Some(joined) = connections.join_next().await {
            log_join_error(joined);
        }

        Ok(())
    }
}

async fn accept_failed(e: &io::Error) {
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Connection task failed");
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
