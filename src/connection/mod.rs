//! The connection lifecycle engine.
//!
//! One [`ConnectionManager`] guarantees at most one attempt or open
//! connection per device. Each connect request runs a `ConnectTask` state
//! machine on the worker pool - discovery wait, optional pairing, the
//! cancellable transport open, retry with backoff - owned by a
//! `ConnectionProxy` that marshals results to the caller's event channel
//! and back to the manager. A successful attempt yields a [`Connection`],
//! optionally wrapped in a [`ConnectionClient`] for pump-driven
//! asynchronous I/O.

mod client;
mod manager;
mod proxy;
mod stream;
mod task;

pub use client::{ConnectionClient, DEFAULT_READ_BUFFER_SIZE};
pub use manager::ConnectionManager;
pub use stream::{CloseListenerId, Connection, ConnectionError};
