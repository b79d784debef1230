//! mqlink - a non-blocking socket link layer for message-oriented middleware.
//!
//! mqlink keeps a pool of TCP listeners and outbound connectors on a
//! single-threaded event loop, multiplexed with mio. It handles connection
//! establishment, optional TLS (rustls), partial-write buffering, and
//! automatic reconnection with per-address backoff, and reports everything
//! that happens through a small set of callbacks (`on_connect`,
//! `on_disconnect`, `on_recv`, `on_ready_to_send`, `on_loop_pass`).
//!
//! It deliberately stops below message framing: what travels over a
//! connection is an opaque byte fragment. Framing, queueing and dispatch
//! belong to the layers built on top.

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod link;

// These are the intended public API
pub use error::Error;
pub use link::{ConnId, Link, LinkInterface, TlsConfig, DEFAULT_POLL_TIMEOUT};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::link::{ConnId, Link, LinkInterface, TlsConfig, DEFAULT_POLL_TIMEOUT};
}
