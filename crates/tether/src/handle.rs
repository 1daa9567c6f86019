//! Capabilities of the connection resources a session owns.
//!
//! The registry never knows the concrete connection type. It only needs to
//! close handles, and to ask a primary connection for its auxiliary channel.

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a handle implementation.
#[derive(Error, Debug)]
pub enum HandleError {
    /// I/O error on the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end rejected or failed the operation.
    #[error("remote error: {0}")]
    Remote(String),

    /// The operation is not available for this handle.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Any other error from the connection library.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// A closable connection resource.
///
/// Implemented by both the primary connection and its auxiliary channel.
#[async_trait]
pub trait Handle: Send + 'static {
    /// Releases the resource.
    ///
    /// Called at most once by tether. Implementations should not assume the
    /// remote end is still reachable.
    async fn close(&mut self) -> Result<(), HandleError>;

    /// Short name of the resource, used in logs and errors.
    fn kind(&self) -> &'static str {
        "handle"
    }
}

/// A primary connection that can open an auxiliary channel.
///
/// The channel is opened lazily the first time a caller asks for it, then
/// reused until the session closes.
#[async_trait]
pub trait Connection: Handle {
    /// The auxiliary handle type, e.g. a file-transfer sub-channel.
    type Channel: Handle;

    /// Opens a new auxiliary channel on this connection.
    async fn open_channel(&mut self) -> Result<Self::Channel, HandleError>;
}

/// Channel type for connections that have no auxiliary channel.
///
/// It has no values, so a session over such a connection never holds one.
#[derive(Debug)]
pub enum NoChannel {}

#[async_trait]
impl Handle for NoChannel {
    async fn close(&mut self) -> Result<(), HandleError> {
        match *self {}
    }

    fn kind(&self) -> &'static str {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain {
        closed: bool,
    }

    #[async_trait]
    impl Handle for Plain {
        async fn close(&mut self) -> Result<(), HandleError> {
            self.closed = true;
            Ok(())
        }
    }

    #[async_trait]
    impl Connection for Plain {
        type Channel = NoChannel;

        async fn open_channel(&mut self) -> Result<NoChannel, HandleError> {
            Err(HandleError::Unsupported("channels"))
        }
    }

    #[tokio::test]
    async fn test_default_kind() {
        let mut plain = Plain { closed: false };
        assert_eq!(plain.kind(), "handle");
        plain.close().await.unwrap();
        assert!(plain.closed);
    }

    #[tokio::test]
    async fn test_no_channel_connection() {
        let mut plain = Plain { closed: false };
        let err = plain.open_channel().await.unwrap_err();
        assert!(matches!(err, HandleError::Unsupported("channels")));
    }

    #[test]
    fn test_handle_error_display() {
        let err = HandleError::Remote("connection reset".into());
        assert_eq!(err.to_string(), "remote error: connection reset");

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: HandleError = io.into();
        assert!(err.to_string().contains("pipe"));
    }
}
