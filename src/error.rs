use crate::link::ConnId;
use std::net::SocketAddr;
use thiserror::Error;

/// The error type for mqlink operations.
///
/// Only unrecoverable conditions and contract violations surface as errors.
/// Routine network events (a peer going away, a refused connect, a blocked
/// write) are recovered inside the event loop and reported through the
/// `on_connect`/`on_disconnect` callback pair instead.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    ///
    /// When returned from [`Link::run_loop`](crate::Link::run_loop) this is a
    /// fatal condition (e.g. file descriptor exhaustion), not a routine
    /// network event.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided address could not be resolved to a socket address.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// A `send` was issued while the previous send on the same connection was
    /// still in flight.
    ///
    /// Wait for `on_ready_to_send` before sending again. This is a contract
    /// violation by the caller, never a transient condition.
    #[error("previous send on {conn_id} is not finished, wait for on_ready_to_send")]
    SendNotFinished {
        /// The connection with the unfinished send.
        conn_id: ConnId,
    },

    /// A listener is already registered for this address.
    #[error("listener for {address} already registered")]
    ListenerAlreadyRegistered { address: SocketAddr },

    /// A connector is already registered for this address.
    #[error("connector for {address} already registered")]
    ConnectorAlreadyRegistered { address: SocketAddr },

    /// Attempted to remove a listener that is not registered.
    #[error("no listener registered for {address}")]
    ListenerNotFound { address: SocketAddr },

    /// Attempted to remove a connector that is not registered.
    #[error("no connector registered for {address}")]
    ConnectorNotFound { address: SocketAddr },

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load a TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load a TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// A TLS listener needs both `certfile` and `keyfile` in its
    /// [`TlsConfig`](crate::TlsConfig).
    #[error("TLS server configuration incomplete - certfile and keyfile are required to listen")]
    TlsServerConfigMissing,

    /// A TLS connector needs `ca_certs` in its
    /// [`TlsConfig`](crate::TlsConfig) to verify the peer.
    #[error("TLS client configuration incomplete - ca_certs is required to connect")]
    TlsClientConfigMissing,

    /// Failed to build the TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build the TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
