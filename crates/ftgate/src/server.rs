use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::errors::ProxyError;
use crate::metrics::{ProxyMetrics, ProxyMetricsStore};
use crate::session::{run_session, SessionRuntime};

pub struct FtpProxy {
    pub(crate) listen_address: SocketAddr,
    pub(crate) max_connections: usize,
    pub(crate) runtime: Arc<SessionRuntime>,
}

impl std::fmt::Debug for FtpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpProxy")
            .field("listen_address", &self.listen_address)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl FtpProxy {
    pub fn metrics(&self) -> ProxyMetrics {
        self.runtime.metrics.snapshot()
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.listen_address).await?;
        accept_loop(self.runtime, listener, self.max_connections)
            .await
            .map_err(ProxyError::Io)
    }

    pub async fn start(self) -> Result<FtpProxyHandle, ProxyError> {
        let listener = TcpListener::bind(self.listen_address).await?;
        let local_addr = listener.local_addr()?;
        let metrics = Arc::clone(&self.runtime.metrics);
        let (shutdown_sender, mut shutdown_receiver) = watch::channel(false);

        let runtime = self.runtime;
        let max_connections = self.max_connections;
        let task = tokio::spawn(async move {
            tokio::select! {
                result = accept_loop(runtime, listener, max_connections) => result,
                _ = shutdown_receiver.changed() => Ok(()),
            }
        });

        Ok(FtpProxyHandle {
            local_addr,
            shutdown: shutdown_sender,
            task: Mutex::new(Some(task)),
            metrics,
        })
    }
}

pub struct FtpProxyHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<io::Result<()>>>>,
    metrics: Arc<ProxyMetricsStore>,
}

impl FtpProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> ProxyMetrics {
        self.metrics.snapshot()
    }

    pub async fn shutdown(self, timeout: Duration) -> Result<(), ProxyError> {
        let _ = self.shutdown.send(true);
        let mut guard = self.task.lock().await;
        let Some(task) = guard.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result.map_err(ProxyError::Io),
            Ok(Err(join_error)) if join_error.is_cancelled() => Ok(()),
            Ok(Err(join_error)) => Err(ProxyError::Join(join_error)),
            Err(_) => Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for proxy shutdown",
            ))),
        }
    }
}

async fn accept_loop(
    runtime: Arc<SessionRuntime>,
    listener: TcpListener,
    max_connections: usize,
) -> io::Result<()> {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, client_addr) = accepted?;

                if max_connections > 0 && sessions.len() >= max_connections {
                    let mut stream = stream;
                    let _ = stream.write_all(b"530 Connection limit exceeded\r\n").await;
                    let _ = stream.shutdown().await;
                    continue;
                }

                runtime.metrics.record_session_open();
                let session_runtime = Arc::clone(&runtime);
                sessions.spawn(async move {
                    let metrics = Arc::clone(&session_runtime.metrics);
                    if let Err(error) = run_session(session_runtime, stream, client_addr).await {
                        eprintln!("session from {client_addr} failed: {error}");
                    }
                    metrics.record_session_close();
                });
            }
            Some(_finished) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}
