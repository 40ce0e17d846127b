//! Asynchronous client facade over an established [`Connection`].

use crate::connection::stream::{Connection, ConnectionError};
use crate::events::ClientEvent;
use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Default size of the buffer the read pump fills per read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Wraps a [`Connection`] in fire-and-forget operations backed by a read
/// pump and a write pump, both lazily started. Operation results, incoming
/// data and the eventual closure are delivered as [`ClientEvent`]s through
/// [`next_event`].
///
/// [`next_event`]: ConnectionClient::next_event
pub struct ConnectionClient {
    connection: Connection,
    read_buffer_size: usize,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    reading: Mutex<bool>,
    write_queue: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl ConnectionClient {
    /// Wrap `connection`, reading into buffers of
    /// [`DEFAULT_READ_BUFFER_SIZE`].
    pub fn new(connection: Connection) -> Self {
        Self::with_read_buffer_size(connection, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Wrap `connection` with a custom read buffer size.
    pub fn with_read_buffer_size(connection: Connection, read_buffer_size: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let on_close = events_tx.clone();
        connection.register_on_close(move |by_error| {
            let _ = on_close.send(ClientEvent::Closed { by_error });
        });
        Self {
            connection,
            read_buffer_size,
            events_tx,
            events_rx,
            reading: Mutex::new(false),
            write_queue: Mutex::new(None),
        }
    }

    /// Whether the underlying connection is open.
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Close the underlying connection. A [`ClientEvent::Closed`] event
    /// follows. No effect on a closed connection.
    pub fn close(&self) {
        self.connection.close();
    }

    /// Start reading continuously from the connection. Data and read
    /// errors arrive as events; reading continues until the connection
    /// closes. Calling this again has no effect.
    pub fn start_reading(&self) -> Result<(), ConnectionError> {
        let mut reading = self.reading.lock().unwrap();
        if !self.connection.is_open() {
            return Err(ConnectionError::Closed);
        }
        if *reading {
            return Ok(());
        }
        *reading = true;
        let connection = self.connection.clone();
        let events = self.events_tx.clone();
        let buffer_size = self.read_buffer_size;
        tokio::spawn(async move {
            let mut buffer = vec![0u8; buffer_size];
            loop {
                match connection.read(&mut buffer).await {
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buffer[..n]);
                        if events.send(ClientEvent::DataRead(data)).is_err() {
                            break;
                        }
                    }
                    // Voluntary closure is reported through the close
                    // listener, not as a read error.
                    Err(ConnectionError::Closed) => break,
                    Err(ConnectionError::Io(_)) => {
                        let _ = events.send(ClientEvent::ReadError);
                        break;
                    }
                }
            }
            debug!(device = %connection.peer(), "read pump finished");
        });
        Ok(())
    }

    /// Queue `data` to be written to the connection. The result arrives as
    /// a [`ClientEvent::DataWritten`] or [`ClientEvent::WriteError`]
    /// event.
    pub fn write(&self, data: Bytes) -> Result<(), ConnectionError> {
        if !self.connection.is_open() {
            return Err(ConnectionError::Closed);
        }
        let mut write_queue = self.write_queue.lock().unwrap();
        let queue = write_queue.get_or_insert_with(|| self.spawn_write_pump());
        queue.send(data).map_err(|_| ConnectionError::Closed)
    }

    /// The next client event. Resolves only when an event arrives.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events_rx.recv().await
    }

    fn spawn_write_pump(&self) -> mpsc::UnboundedSender<Bytes> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let connection = self.connection.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                match connection.write(&data).await {
                    Ok(()) => {
                        if events.send(ClientEvent::DataWritten(data)).is_err() {
                            break;
                        }
                    }
                    Err(ConnectionError::Closed) => break,
                    Err(ConnectionError::Io(_)) => {
                        let _ = events.send(ClientEvent::WriteError(data));
                        break;
                    }
                }
            }
            debug!(device = %connection.peer(), "write pump finished");
        });
        tx
    }
}
