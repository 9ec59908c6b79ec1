use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use smsgate_common::internal;
use tokio::net::UnixStream;

use crate::{
    ControlError, Request, RequestCommand, Response, ResponsePayload, Result,
    frame::{self, MAX_RESPONSE_SIZE},
};

/// One-shot client: every request opens its own connection.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wrap `command` in a request for the current protocol version and send it.
    ///
    /// # Errors
    /// See [`Self::send_request`].
    pub async fn send(&self, command: RequestCommand) -> Result<Response> {
        self.send_request(Request::new(command)).await
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be reached, the exchange times
    /// out, the response is malformed or from another protocol version, or
    /// the server reports a failure ([`ControlError::Server`]).
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    async fn exchange(&self, request: Request) -> Result<Response> {
        internal!(
            level = DEBUG,
            path = %self.socket_path.display(),
            "Connecting to control socket"
        );
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        frame::write(&mut stream, &request).await?;
        let response: Response = frame::read(&mut stream, MAX_RESPONSE_SIZE).await?;

        if !response.is_version_compatible() {
            return Err(ControlError::Protocol(format!(
                "Incompatible protocol version: server={}, client={}",
                response.version,
                crate::PROTOCOL_VERSION
            )));
        }

        if let ResponsePayload::Error(err) = response.payload {
            return Err(ControlError::Server(err));
        }

        Ok(response)
    }

    /// # Errors
    /// Returns [`ControlError::InvalidSocketPath`] if nothing exists at the
    /// socket path.
    pub fn check_socket_exists(&self) -> Result<()> {
        if self.socket_path.exists() {
            Ok(())
        } else {
            Err(ControlError::InvalidSocketPath(format!(
                "Socket does not exist: {}",
                self.socket_path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_a_ten_second_timeout() {
        let client = ControlClient::new("/tmp/test.sock");
        assert_eq!(client.socket_path(), Path::new("/tmp/test.sock"));
        assert_eq!(client.timeout, Duration::from_secs(10));

        let client = client.with_timeout(Duration::from_secs(2));
        assert_eq!(client.timeout, Duration::from_secs(2));
    }

    #[test]
    fn missing_socket_is_reported() {
        let client = ControlClient::new("/nonexistent/smsgate.sock");
        let err = client.check_socket_exists().expect_err("missing socket");
        assert!(err.is_unreachable());
    }
}
