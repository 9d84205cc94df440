//! Live build output: `GET /jobs/{id}/stream`.
//!
//! The handler hands the build thread a writer that feeds a channel; the
//! response body drains the other end. The body ends when the build drops
//! the writer.

use std::convert::Infallible;
use std::io::{self, Write};

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::info;

use crate::routes::ApiError;
use crate::state::AppState;

const CHANNEL_CAPACITY: usize = 64;

/// Blocking [`Write`] end used by the build thread.
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "viewer disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// GET /jobs/{id}/stream - raw build output for the single live viewer.
pub async fn stream_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    state
        .jobs
        .streams()
        .attach(&job_id, Box::new(ChannelWriter { tx }))?;
    info!(job_id = %job_id, "viewer attached to build stream");

    let body = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<_, Infallible>(chunk);
        }
    };
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}
