//! The listening socket and the lifetime of everything behind it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::metrics::ServerMetrics;
use crate::registry::{ConnectionId, Registry};
use crate::router::Router;

/// Back-off after the process runs out of file descriptors.
const FD_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection task.
pub(crate) struct ServerContext {
    pub registry: Arc<Registry>,
    pub router: Router,
    pub metrics: Arc<ServerMetrics>,
    pub config: ServerConfig,
    next_connection_id: AtomicU64,
}

impl ServerContext {
    pub(crate) fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(ServerMetrics::new());
        Self {
            router: Router::new(Arc::clone(&registry), Arc::clone(&metrics)),
            registry,
            metrics,
            config,
            next_connection_id: AtomicU64::new(1),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A running relay.
///
/// Dropping a `Server` without calling [`shutdown`](Self::shutdown) leaves
/// the accept loop running in the background.
pub struct Server {
    local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
    accept_task: JoinHandle<Result<(), ServerError>>,
}

impl Server {
    /// Bind the configured address and start accepting connections.
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let ctx = Arc::new(ServerContext::new(config));
        let cancel = CancellationToken::new();

        info!(
            addr = %local_addr,
            max_connections = ctx.config.max_connections,
            "switchboard listening"
        );

        let accept_task = tokio::spawn(accept_loop(listener, cancel.clone(), Arc::clone(&ctx)));

        Ok(Self {
            local_addr,
            ctx,
            cancel,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.ctx.metrics
    }

    /// Serve until `signal` resolves, then shut down gracefully.
    ///
    /// Returns early with the error if the listening socket fails first.
    pub async fn serve_until<F>(mut self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let finished = tokio::select! {
            _ = signal => None,
            result = &mut self.accept_task => Some(result),
        };
        match finished {
            None => {
                info!("shutdown requested");
                self.shutdown().await
            }
            Some(result) => flatten(result),
        }
    }

    /// Stop accepting, close every connection within the grace period,
    /// then abort whatever is left.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.cancel.cancel();
        flatten(self.accept_task.await)
    }
}

fn flatten(result: Result<Result<(), ServerError>, JoinError>) -> Result<(), ServerError> {
    match result {
        Ok(result) => result,
        Err(e) => {
            error!("accept loop panicked: {}", e);
            Err(ServerError::ListenerFatal(io::Error::other(e)))
        }
    }
}

/// Accept sockets and hand each one to a pooled connection task.
///
/// A pool slot is claimed before `accept` is called, so once the pool is
/// full new clients wait in the kernel backlog instead of being refused.
async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    ctx: Arc<ServerContext>,
) -> Result<(), ServerError> {
    let pool = Arc::new(Semaphore::new(ctx.config.max_connections));
    let mut tasks: JoinSet<()> = JoinSet::new();

    let result = loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                reap(done);
                continue;
            }
            permit = Arc::clone(&pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break Ok(()),
            },
        };

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                reap(done);
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_fatal_accept_error(&e) => {
                    error!("listening socket failed: {}", e);
                    break Err(ServerError::ListenerFatal(e));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    if is_fd_exhaustion(&e) {
                        tokio::time::sleep(FD_EXHAUSTED_BACKOFF).await;
                    }
                    continue;
                }
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, "failed to set TCP_NODELAY: {}", e);
        }

        let id = ctx.next_connection_id();
        let conn = Connection::new(stream, peer, id, cancel.child_token(), Arc::clone(&ctx));
        tasks.spawn(async move {
            let _permit = permit;
            conn.run().await;
        });
    };

    drop(listener);
    cancel.cancel();
    drain(&mut tasks, ctx.config.shutdown_grace).await;

    info!(metrics = ?ctx.metrics.snapshot(), "listener stopped");
    result
}

/// Wait up to `grace` for connection tasks to finish, then abort the rest.
async fn drain(tasks: &mut JoinSet<()>, grace: Duration) {
    if tasks.is_empty() {
        return;
    }
    info!(open = tasks.len(), "waiting for connections to close");

    let finished = tokio::time::timeout(grace, async {
        while let Some(done) = tasks.join_next().await {
            reap(done);
        }
    })
    .await;

    if finished.is_err() {
        warn!(
            remaining = tasks.len(),
            "grace period elapsed, aborting connections"
        );
        tasks.shutdown().await;
    }
}

fn reap(done: Result<(), JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            error!("connection task panicked: {}", e);
        }
    }
}

/// EBADF, EINVAL, ENOTSOCK: the listening socket itself is unusable.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::InvalidInput || matches!(e.raw_os_error(), Some(9 | 22 | 88))
}

/// ENFILE, EMFILE.
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23 | 24))
}
