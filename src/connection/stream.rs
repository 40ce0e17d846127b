//! An established, open byte stream to one peer.

use crate::device::DeviceAddress;
use crate::sync::CancelToken;
use crate::transport::TransportStream;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

/// Errors raised by [`Connection`] I/O.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is closed (or was closed while the operation was
    /// pending).
    #[error("connection is closed")]
    Closed,
    /// The underlying stream failed. The connection has been closed by
    /// error before this was raised.
    #[error("stream error: {0}")]
    Io(#[from] io::Error),
}

/// Identifies a registered close listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseListenerId(u64);

type BoxedStream = Box<dyn TransportStream>;
type CloseListener = Box<dyn FnOnce(bool) + Send>;

struct ConnectionInner {
    peer: DeviceAddress,
    reader: tokio::sync::Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    open: AtomicBool,
    // Fired on close to unblock any pending read or write.
    cancel: CancelToken,
    listeners: Mutex<Vec<(u64, CloseListener)>>,
    next_listener_id: AtomicU64,
}

impl ConnectionInner {
    fn close(&self, by_error: bool) {
        // The swap makes racing close attempts (a voluntary close against
        // an error-triggered one, or two I/O errors on different halves)
        // collapse to a single notification pass.
        if self.open.swap(false, Ordering::SeqCst) {
            debug!(device = %self.peer, by_error, "closing connection");
            self.cancel.cancel();
            // Release the stream halves now if nothing holds them; a
            // pending operation drops its half when the cancel wakes it.
            if let Ok(mut reader) = self.reader.try_lock() {
                *reader = None;
            }
            if let Ok(mut writer) = self.writer.try_lock() {
                *writer = None;
            }
            let listeners = std::mem::take(&mut *self.listeners.lock().unwrap());
            for (_, listener) in listeners {
                listener(by_error);
            }
        }
    }
}

/// One live byte stream to a peer.
///
/// Cheap-clone handle; all clones refer to the same stream. Reads and
/// writes block (asynchronously) until completion and may run
/// concurrently with each other, while same-direction access is
/// serialized. Any stream error - including end-of-stream on read -
/// closes the connection by error before the error is returned.
///
/// `close` is idempotent: registered close listeners are notified exactly
/// once, with a flag distinguishing error-induced from voluntary closure,
/// and the listener set is cleared afterwards.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(peer: DeviceAddress, stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(ConnectionInner {
                peer,
                reader: tokio::sync::Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(Some(writer)),
                open: AtomicBool::new(true),
                cancel: CancelToken::new(),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    /// The peer this connection is attached to.
    pub fn peer(&self) -> DeviceAddress {
        self.inner.peer
    }

    /// Whether the connection is open.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Close the connection. Calling this on a closed connection has no
    /// effect.
    pub fn close(&self) {
        self.inner.close(false);
    }

    /// Read into `buffer`, resolving once some data arrived or the stream
    /// failed. Returns the number of bytes read, always at least one;
    /// end-of-stream is reported as an error after closing the connection
    /// by error.
    pub async fn read(&self, buffer: &mut [u8]) -> Result<usize, ConnectionError> {
        let mut guard = self.inner.reader.lock().await;
        if !self.is_open() {
            *guard = None;
            return Err(ConnectionError::Closed);
        }
        let result = {
            let Some(reader) = guard.as_mut() else {
                return Err(ConnectionError::Closed);
            };
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => None,
                result = reader.read(buffer) => Some(result),
            }
        };
        match result {
            None => {
                *guard = None;
                Err(ConnectionError::Closed)
            }
            Some(Ok(0)) => {
                *guard = None;
                drop(guard);
                self.inner.close(true);
                Err(ConnectionError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "end of stream",
                )))
            }
            Some(Ok(n)) => Ok(n),
            Some(Err(error)) => {
                *guard = None;
                drop(guard);
                self.inner.close(true);
                Err(error.into())
            }
        }
    }

    /// Write all of `data`, resolving once it is flushed or the stream
    /// failed.
    pub async fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut guard = self.inner.writer.lock().await;
        if !self.is_open() {
            *guard = None;
            return Err(ConnectionError::Closed);
        }
        let result = {
            let Some(writer) = guard.as_mut() else {
                return Err(ConnectionError::Closed);
            };
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => None,
                result = async {
                    writer.write_all(data).await?;
                    writer.flush().await
                } => Some(result),
            }
        };
        match result {
            None => {
                *guard = None;
                Err(ConnectionError::Closed)
            }
            Some(Ok(())) => Ok(()),
            Some(Err(error)) => {
                *guard = None;
                drop(guard);
                self.inner.close(true);
                Err(error.into())
            }
        }
    }

    /// Register a listener invoked once when the connection closes, with
    /// `true` if the closure was caused by an error. Listeners registered
    /// after the connection closed are never invoked.
    pub fn register_on_close(&self, listener: impl FnOnce(bool) + Send + 'static) -> CloseListenerId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .push((id, Box::new(listener)));
        CloseListenerId(id)
    }

    /// Remove a previously registered close listener.
    pub fn unregister_on_close(&self, id: CloseListenerId) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .retain(|(listener_id, _)| *listener_id != id.0);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const DEVICE: DeviceAddress = DeviceAddress::new([0, 0, 0, 0, 0, 1]);

    fn pair() -> (Connection, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(256);
        (Connection::new(DEVICE, Box::new(near)), far)
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (connection, mut far) = pair();
        connection.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        far.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 16];
        let n = connection.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_once() {
        let (connection, _far) = pair();
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = notified.clone();
        connection.register_on_close(move |by_error| {
            assert!(!by_error);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        connection.close();
        connection.close();
        assert!(!connection.is_open());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eof_closes_by_error_before_raising() {
        let (connection, far) = pair();
        let closed_by_error = Arc::new(AtomicBool::new(false));
        let seen = closed_by_error.clone();
        connection.register_on_close(move |by_error| {
            seen.store(by_error, Ordering::SeqCst);
        });
        drop(far);
        let mut buf = [0u8; 8];
        let error = connection.read(&mut buf).await.unwrap_err();
        assert!(matches!(error, ConnectionError::Io(_)));
        // The listener observed the error-closure before the error reached
        // the caller.
        assert!(closed_by_error.load(Ordering::SeqCst));
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_write_after_close_fails_without_renotifying() {
        let (connection, _far) = pair();
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = notified.clone();
        connection.register_on_close(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        connection.close();
        let error = connection.write(b"late").await.unwrap_err();
        assert!(matches!(error, ConnectionError::Closed));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (connection, _far) = pair();
        let reader = connection.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        connection.close();
        let result = timeout(Duration::from_secs(1), pending)
            .await
            .expect("read must unblock")
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_unregistered_listener_is_not_notified() {
        let (connection, _far) = pair();
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = notified.clone();
        let id = connection.register_on_close(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        connection.unregister_on_close(id);
        connection.close();
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }
}
