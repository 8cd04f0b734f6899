//! Per-connection handling (worker side).
//!
//! One connection carries one request:
//!
//! ```text
//! AwaitRequest ── DATA request ──► Running ── items ──► END
//!                                     │
//!                       <<CANCEL>> ──►│ Cancelling ──► <<CANCELLED>> ──► END
//! ```
//!
//! After the request frame, the read half belongs to a watcher task that
//! looks only for `<<CANCEL>>`. The write half stays with the handler,
//! which streams items as the session produces them.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWrite;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use super::framing::{Frame, FrameError, FrameReader, FrameWriter};
use super::protocol::{Marker, Request};
use crate::engine::ScriptEngine;
use crate::session::{ExecutionSession, ItemSink, SessionError, StreamOutcome};

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ItemSink for FrameWriter<W> {
    async fn item(&mut self, text: String) -> Result<(), FrameError> {
        self.write_frame(&Frame::Data(text)).await.map(|_| ())
    }

    async fn error(&mut self, text: String) -> Result<(), FrameError> {
        self.write_frame(&Frame::Error(text)).await.map(|_| ())
    }
}

/// Serve one accepted connection to completion.
///
/// Returns `Ok` for every outcome the protocol covers, including a client
/// that leaves early. Errors are left for the listener's fault sink.
pub async fn handle_connection<E: ScriptEngine>(
    stream: UnixStream,
    session: Arc<ExecutionSession<E>>,
    shutdown: CancellationToken,
    session_id: u64,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let first = tokio::select! {
        () = shutdown.cancelled() => {
            log::debug!("[session-{}] Shutdown before request arrived", session_id);
            return Ok(());
        }
        frame = reader.read_frame() => frame,
    };
    let request = match first {
        Ok(Frame::Data(text)) => Request::parse(&text),
        Ok(other) => {
            log::warn!("[session-{}] Expected a request, got {:?}", session_id, other);
            let _ = writer
                .write_frame(&Frame::Error("SERVER ERROR: expected a request frame".into()))
                .await;
            writer.write_frame(&Frame::Control(Marker::End)).await?;
            return Ok(());
        }
        Err(FrameError::EndOfChannel) => {
            log::debug!("[session-{}] Client left before sending a request", session_id);
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to read request frame"),
    };
    log::info!(
        "[session-{}] Request: {} bytes, depth {}",
        session_id,
        request.script.len(),
        request.depth
    );

    let cancel = shutdown.child_token();
    let watcher = tokio::spawn(watch_for_cancel(reader, cancel.clone(), session_id));

    let outcome = session
        .run_and_stream(&request.script, request.depth, &mut writer, &cancel)
        .await;
    let result = finish(&mut writer, outcome, session_id).await;
    if result.is_ok() {
        // Nothing follows END.
        let _ = writer.shutdown().await;
    }

    watcher.abort();
    result
}

/// Write the terminal frames for a run.
async fn finish<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    outcome: Result<StreamOutcome, SessionError>,
    session_id: u64,
) -> Result<()> {
    match outcome {
        Ok(StreamOutcome::Completed) => {
            log::debug!("[session-{}] Completed", session_id);
        }
        Ok(StreamOutcome::Cancelled) => {
            log::info!("[session-{}] Cancelled", session_id);
            writer
                .write_frame(&Frame::Control(Marker::Cancelled))
                .await
                .context("Failed to write cancelled marker")?;
        }
        Err(SessionError::Delivery(e)) => {
            log::debug!("[session-{}] Client went away mid-stream: {}", session_id, e);
            return Ok(());
        }
        Err(e) => {
            log::error!("[session-{}] Execution failed: {}", session_id, e);
            let _ = writer
                .write_frame(&Frame::Error(format!("SERVER ERROR: {e}")))
                .await;
        }
    }
    writer
        .write_frame(&Frame::Control(Marker::End))
        .await
        .context("Failed to write end marker")?;
    Ok(())
}

/// Own the read half for the rest of the connection, firing `cancel` when
/// the client sends `<<CANCEL>>`.
async fn watch_for_cancel(
    mut reader: FrameReader<OwnedReadHalf>,
    cancel: CancellationToken,
    session_id: u64,
) {
    let frames = reader.frames();
    tokio::pin!(frames);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Control(Marker::Cancel)) => {
                if !cancel.is_cancelled() {
                    log::info!("[session-{}] Cancel requested by client", session_id);
                    cancel.cancel();
                }
            }
            Ok(other) => {
                log::debug!("[session-{}] Ignoring unexpected frame {:?}", session_id, other);
            }
            Err(e) => {
                log::debug!("[session-{}] Cancel watcher stopped: {}", session_id, e);
                return;
            }
        }
    }
    log::trace!("[session-{}] Client closed its write side", session_id);
}
