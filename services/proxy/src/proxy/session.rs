//! Per-connection relay between the inbound (front) and backend (back) legs.
//!
//! A [`Session`] runs two copy tasks, `front -> back` (upload) and
//! `back -> front` (download). Teardown happens in two phases:
//!
//! 1. The first task to stop (end of stream or error on its source) fires
//!    its completion signal. The session then forces the *other* task's
//!    pending read to return via [`ReadUnblocker::force_unblock_read`],
//!    without touching the socket.
//! 2. Once both tasks have returned their halves, each leg is reassembled
//!    and closed exactly once.
//!
//! The task reading from a leg owns that leg's read half; closing only
//! happens after both halves are back, so a leg can never be closed while
//! the opposite task is still blocked on it.
//!
//! ```text
//!            upload: front.read -> back.write
//!  front  <======================================>  back
//!            download: back.read -> front.write
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf,
};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info};

/// Size of the per-direction copy buffer.
const COPY_BUFFER_SIZE: usize = 8192;

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to backend.
    Upload,
    /// Backend to client.
    Download,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Upload => "front -> back",
            Direction::Download => "back -> front",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Upload => Direction::Download,
            Direction::Download => Direction::Upload,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a copy task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// The source reached end of stream.
    Eof,
    /// The read was forcibly unblocked because the other direction finished.
    Unblocked,
    /// The transport reported a timeout.
    TimedOut,
    /// Any other I/O error on read or write.
    Failed(io::ErrorKind),
}

impl CopyEnd {
    fn from_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CopyEnd::TimedOut,
            kind => CopyEnd::Failed(kind),
        }
    }

    /// Classify a read error. A TLS peer that drops the socket without
    /// sending close_notify surfaces as `UnexpectedEof`; for a relay that
    /// is an ordinary end of stream.
    fn from_read_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => CopyEnd::Eof,
            _ => CopyEnd::from_error(err),
        }
    }

    /// Returns true if this outcome is a genuine fault rather than ordinary
    /// teardown.
    pub fn is_fault(self) -> bool {
        matches!(self, CopyEnd::Failed(_))
    }
}

/// Outcome of one copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionReport {
    pub direction: Direction,
    pub bytes: u64,
    pub end: CopyEnd,
}

/// Outcome of a whole session. There is no failure verdict: a session is
/// complete once both directions have stopped, however they stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    /// The direction that stopped first.
    pub first: Direction,
    pub upload: DirectionReport,
    pub download: DirectionReport,
}

/// Forces a pending read on one leg to return.
///
/// This is the shutdown primitive of phase one: it never closes anything.
/// A request made before the reader is waiting is remembered, so the next
/// read attempt returns immediately.
#[derive(Debug, Default, Clone)]
pub struct ReadUnblocker {
    notify: Arc<Notify>,
}

impl ReadUnblocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_unblock_read(&self) {
        self.notify.notify_one();
    }

    async fn unblocked(&self) {
        self.notify.notified().await
    }
}

/// A proxied stream: one inbound leg and one backend leg.
pub struct Session<F, B> {
    front: F,
    back: B,
}

impl<F, B> Session<F, B>
where
    F: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(front: F, back: B) -> Self {
        Self { front, back }
    }

    /// Relay bytes in both directions until both have stopped, then close
    /// both legs.
    pub async fn proxy(self) -> RelayReport {
        let (front_read, front_write) = split(self.front);
        let (back_read, back_write) = split(self.back);

        let front_unblocker = ReadUnblocker::new();
        let back_unblocker = ReadUnblocker::new();

        let (upload_done, mut upload_rx) = oneshot::channel();
        let (download_done, mut download_rx) = oneshot::channel();

        let upload = tokio::spawn(pump(
            Direction::Upload,
            front_read,
            back_write,
            front_unblocker.clone(),
            upload_done,
        ));
        let download = tokio::spawn(pump(
            Direction::Download,
            back_read,
            front_write,
            back_unblocker.clone(),
            download_done,
        ));

        // First finisher wins; unblock the read on the opposite leg.
        let (first, second) = tokio::select! {
            report = &mut upload_rx => {
                back_unblocker.force_unblock_read();
                info!("Finalize backend connection");
                let first = settle(Direction::Upload, report);
                (first, settle(Direction::Download, download_rx.await))
            }
            report = &mut download_rx => {
                front_unblocker.force_unblock_read();
                info!("Finalize client connection");
                let first = settle(Direction::Download, report);
                (first, settle(Direction::Upload, upload_rx.await))
            }
        };

        debug!(
            first = %first.direction,
            unblocked = %first.direction.opposite(),
            "Both directions stopped"
        );

        let (upload, download) = tokio::join!(upload, download);
        match (upload, download) {
            (Ok((front_read, back_write)), Ok((back_read, front_write))) => {
                close_leg("front", front_read.unsplit(front_write)).await;
                close_leg("back", back_read.unsplit(back_write)).await;
            }
            // A panicked copy task dropped its halves; the remaining ones are
            // released when they go out of scope here.
            (upload, download) => {
                error!(
                    upload_ok = upload.is_ok(),
                    download_ok = download.is_ok(),
                    "Copy task aborted"
                );
            }
        }

        let (upload, download) = match first.direction {
            Direction::Upload => (first, second),
            Direction::Download => (second, first),
        };

        info!(
            first = %first.direction,
            bytes_upload = upload.bytes,
            bytes_download = download.bytes,
            "Done"
        );

        RelayReport {
            first: first.direction,
            upload,
            download,
        }
    }
}

/// Copy `src` into `dst` until end of stream, an error, or a forced unblock.
///
/// Returns the halves so the session can close each leg once.
async fn pump<R, W>(
    direction: Direction,
    mut src: ReadHalf<R>,
    mut dst: WriteHalf<W>,
    unblocker: ReadUnblocker,
    done: oneshot::Sender<DirectionReport>,
) -> (ReadHalf<R>, WriteHalf<W>)
where
    R: AsyncRead,
    W: AsyncWrite,
{
    debug!(direction = %direction, "Begin stream copy");

    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let read = tokio::select! {
            biased;
            _ = unblocker.unblocked() => break CopyEnd::Unblocked,
            read = src.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break CopyEnd::Eof,
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    break CopyEnd::from_error(&e);
                }
                if let Err(e) = dst.flush().await {
                    break CopyEnd::from_error(&e);
                }
                bytes += n as u64;
            }
            Err(e) => break CopyEnd::from_read_error(&e),
        }
    };

    match end {
        CopyEnd::Failed(kind) => {
            error!(direction = %direction, bytes, error_kind = ?kind, "Stream copy failed")
        }
        _ => info!(direction = %direction, bytes, end = ?end, "Stream copy finished"),
    }

    let _ = done.send(DirectionReport {
        direction,
        bytes,
        end,
    });

    (src, dst)
}

fn settle(
    direction: Direction,
    report: Result<DirectionReport, oneshot::error::RecvError>,
) -> DirectionReport {
    report.unwrap_or(DirectionReport {
        direction,
        bytes: 0,
        end: CopyEnd::Failed(io::ErrorKind::Other),
    })
}

/// Close a reassembled leg. Errors that only mean "the peer is already
/// gone" are expected during teardown.
async fn close_leg<S: AsyncWrite + Unpin>(leg: &'static str, mut stream: S) {
    match stream.shutdown().await {
        Ok(()) => debug!(leg, "Connection closed"),
        Err(e) if is_already_closed(&e) => debug!(leg, error = %e, "Connection already closed"),
        Err(e) => error!(leg, error = %e, "Connection close error"),
    }
}

fn is_already_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
