#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use smsgate_common::{Signal, internal};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};

use crate::{
    ControlError, Request, Response, Result,
    frame::{self, MAX_REQUEST_SIZE},
};

/// Per-connection budget for reading the request and writing the response.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes decoded requests against the running worker.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// # Errors
    /// An error is sent back to the client as [`crate::ResponsePayload::Error`].
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

/// Accepts control connections on a Unix domain socket.
pub struct ControlServer {
    socket_path: PathBuf,
    handler: Arc<dyn CommandHandler>,
}

impl ControlServer {
    pub fn new(socket_path: impl Into<PathBuf>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and answer requests until a shutdown signal arrives.
    ///
    /// A socket file left behind by a dead process is replaced; one that
    /// still accepts connections means another worker owns it.
    ///
    /// # Errors
    /// Returns an error if the socket is in use or cannot be bound.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let socket_path = self.socket_path.as_path();
        if socket_path.exists() {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!(
                        "Socket already in use by running instance: {}",
                        socket_path.display()
                    ),
                )));
            }
            internal!(
                level = INFO,
                path = %socket_path.display(),
                "Removing stale control socket"
            );
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(socket_path)?;

        #[cfg(unix)]
        {
            let mut perms = tokio::fs::metadata(socket_path).await?.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(socket_path, perms).await?;
        }
        internal!(
            level = INFO,
            path = %socket_path.display(),
            "Control socket listening (mode 0600)"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, handler).await {
                                internal!(level = WARN, error = %e, "Control connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        internal!(level = ERROR, error = %e, "Error accepting control connection");
                    }
                },
                sig = shutdown.recv() => {
                    if let Err(e) = sig {
                        internal!(level = ERROR, error = %e, "Control server shutdown channel error");
                    }
                    internal!(level = INFO, "Control server shutting down");
                    break;
                }
            }
        }

        if socket_path.exists() {
            let _ = tokio::fs::remove_file(socket_path).await;
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: UnixStream,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        let request: Request = tokio::time::timeout(
            CONNECTION_TIMEOUT,
            frame::read(&mut stream, MAX_REQUEST_SIZE),
        )
        .await
        .map_err(|_| ControlError::Timeout)??;

        internal!(level = TRACE, request = ?request.command, "Control request");

        let response = if request.is_version_compatible() {
            match handler.handle_request(request).await {
                Ok(response) => response,
                Err(e) => {
                    internal!(level = WARN, error = %e, "Control request failed");
                    Response::error(e.to_string())
                }
            }
        } else {
            Response::error(format!(
                "Incompatible protocol version: client={}, server={}",
                request.version,
                crate::PROTOCOL_VERSION
            ))
        };

        tokio::time::timeout(CONNECTION_TIMEOUT, frame::write(&mut stream, &response))
            .await
            .map_err(|_| ControlError::Timeout)??;

        Ok(())
    }
}
