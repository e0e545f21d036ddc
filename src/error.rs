use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Represents errors that can occur during task execution in the executor system.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Represents errors that can occur in the reactor system responsible for I/O events.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the daemon lifecycle manager and the transport engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The configured bind address is not an IPv4 or IPv6 literal
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),

    /// Creating the listening socket failed
    #[error("socket creation failed: {0}")]
    Socket(io::Error),

    /// Binding the socket to a network interface failed
    #[error("binding to interface {interface:?} failed: {source}")]
    Interface {
        interface: String,
        #[source]
        source: io::Error,
    },

    /// Binding the socket to its address failed
    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Switching the socket into listening mode failed
    #[error("listen failed: {0}")]
    Listen(io::Error),

    /// The certificate material could not be turned into a TLS configuration
    #[error("tls configuration rejected: {0}")]
    Tls(String),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Every start attempt failed
    #[error("daemon did not start after {0} attempts")]
    StartExhausted(u32),

    /// The supervising loop restarted the daemon more often than allowed
    #[error("daemon restart limit of {0} reached")]
    RestartLimit(u32),

    /// A controller or the engine dropped the connection without a response
    #[error("connection aborted without a response")]
    Aborted,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Results using ExecutorError as the error type
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// Type alias for Results using ReactorError as the error type
pub type ReactorResult<T> = std::result::Result<T, ReactorError>;

/// Type alias for Results using the crate level Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Tests the conversion and formatting of ExecutorError with IO errors
    #[test]
    fn test_executor_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let exec_err = ExecutorError::Io(io_err);

        assert!(matches!(exec_err, ExecutorError::Io(_)));
        assert_eq!(exec_err.to_string(), "io error: test error");
    }

    /// Tests the automatic conversion from io::Error to ReactorError
    #[test]
    fn test_reactor_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let reactor_err = ReactorError::from(io_err);

        assert!(matches!(reactor_err, ReactorError::Io(_)));
    }

    #[test]
    fn test_bind_error_names_address() {
        let err = Error::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "bind to 127.0.0.1:8080 failed: in use");
    }

    #[test]
    fn test_reactor_error_is_transparent() {
        let err = Error::from(ReactorError::LockPoisoned);
        assert_eq!(err.to_string(), "mutex lock poisoned");
    }
}
