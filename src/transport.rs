use std::{
    future::Future,
    io,
    sync::atomic::{AtomicBool, Ordering::*},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
    time::{timeout, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    session::{BoxedReader, BoxedWriter},
    Error,
};

/// The maximum time a graceful shutdown of the write half may take when closing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// The classification of an I/O failure, decided once at the transport boundary.
#[derive(Debug)]
pub enum TransportError {
    /// The remote end closed the stream, the transport failed hard or was closed locally.
    Disconnected(io::Error),
    /// Any other I/O error; the stream may still be usable.
    Transient(io::Error),
}

impl TransportError {
    /// Checks whether the error means the stream is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;

        match e.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected
            | TimedOut | WriteZero => Self::Disconnected(e),
            _ => Self::Transient(e),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected(e) => Error::Disconnected(e),
            TransportError::Transient(e) => Error::Transient(e),
        }
    }
}

/// The I/O half of a secure session: the duplex byte stream with a deadline and a close switch.
///
/// Each direction sits behind its own lock, so a single read and a single write can be in flight
/// at the same time.
pub struct Transport {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    /// The point in time after which pending and future I/O fails.
    deadline: parking_lot::Mutex<Option<Instant>>,
    /// Cancelled when the transport is closed, locally or together with its node.
    closed: CancellationToken,
    /// Set once the write half has been shut down.
    shut_down: AtomicBool,
}

impl Transport {
    /// Creates a transport over the given stream halves; cancelling `closed` closes it.
    pub fn new(reader: BoxedReader, writer: BoxedWriter, closed: CancellationToken) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            deadline: Default::default(),
            closed,
            shut_down: Default::default(),
        }
    }

    /// Sets the deadline for all the subsequent reads and writes; once it passes, they fail with
    /// a [`TransportError::Disconnected`].
    pub fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
    }

    /// Returns the current deadline, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Fills `buf` with bytes from the stream.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut reader = self.reader.lock().await;
        self.guarded(reader.read_exact(buf)).await.map(|_| ())
    }

    /// Writes the whole of `buf` to the stream and flushes it.
    pub async fn write_all(&self, buf: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        self.guarded(async {
            writer.write_all(buf).await?;
            writer.flush().await
        })
        .await
    }

    /// Closes the transport; any pending I/O is interrupted. Only the first call has any effect.
    pub async fn close(&self) -> io::Result<()> {
        self.closed.cancel();

        if self.shut_down.swap(true, AcqRel) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        match timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
            Ok(res) => res,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    /// Checks whether the transport was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Applies the deadline and the close switch to an I/O operation.
    async fn guarded<T>(
        &self,
        op: impl Future<Output = io::Result<T>>,
    ) -> Result<T, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected(
                io::ErrorKind::NotConnected.into(),
            ));
        }

        let deadline = self.deadline();
        let op = async move {
            match deadline {
                Some(deadline) => timeout_at(deadline, op)
                    .await
                    .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
                None => op.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Disconnected(io::ErrorKind::NotConnected.into())),
            res = op => res.map_err(TransportError::from),
        }
    }
}
