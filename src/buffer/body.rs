//! The buffered request/response artifact: an in-memory prefix up to
//! `mem_limit` bytes, with
//! anything beyond that spilled to an exclusively-owned temp file.

use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use tempfile::{NamedTempFile, TempPath};
use tokio_util::io::ReaderStream;
use tracing::trace;

use crate::error::ProxyError;

/// A fully-read body: an in-memory prefix plus an optional on-disk
/// overflow segment. Exposes the total length and a method to rebuild a
/// fresh, rewound [`Body`] stream on demand — `next` always sees a body
/// that can be read to EOF, and the buffer middleware can replay it for
/// retry without re-reading from the wire.
///
/// The spill file (if any) is reference-counted via `Arc<TempPath>`; it is
/// unlinked when the last clone of this `MultiBuffer` is dropped, which
/// covers every exit path (success, error, cancellation, panic) without
/// explicit cleanup code at each call site.
#[derive(Clone)]
pub struct MultiBuffer {
    mem: Bytes,
    spill: Option<Arc<TempPath>>,
    total_len: u64,
}

impl MultiBuffer {
    pub fn empty() -> Self {
        Self {
            mem: Bytes::new(),
            spill: None,
            total_len: 0,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn has_spill(&self) -> bool {
        self.spill.is_some()
    }

    /// Drain `body` into memory up to `mem_limit` bytes, spilling anything
    /// beyond that to a temp file. If `max_limit` is `Some` and nonzero,
    /// abort as soon as the running total exceeds it.
    pub async fn fill(
        body: Body,
        mem_limit: u64,
        max_limit: Option<u64>,
    ) -> Result<Self, ProxyError> {
        let mut body = body;
        let mut mem = BytesMut::new();
        let mut spill_file: Option<NamedTempFile> = None;
        let mut total: u64 = 0;
        // Tags the spill file's name so it can be correlated with the log
        // line emitted when it's created, without round-tripping the path
        // itself through tracing.
        let spill_id = uuid::Uuid::new_v4();

        loop {
            let frame = match body.frame().await {
                Some(Ok(f)) => f,
                Some(Err(e)) => return Err(ProxyError::Io(e.to_string())),
                None => break,
            };
            let Ok(data) = frame.into_data() else {
                continue; // trailers frame, nothing to buffer
            };
            if data.is_empty() {
                continue;
            }

            total += data.len() as u64;
            if let Some(max) = max_limit {
                if max > 0 && total > max {
                    return Err(ProxyError::RequestTooLarge {
                        limit: max,
                        actual: Some(total),
                    });
                }
            }

            let mem_remaining = mem_limit.saturating_sub(mem.len() as u64);
            if mem_remaining >= data.len() as u64 {
                mem.extend_from_slice(&data);
            } else if mem_remaining > 0 {
                let (head, tail) = data.split_at(mem_remaining as usize);
                mem.extend_from_slice(head);
                write_spill(&mut spill_file, tail, spill_id)?;
            } else {
                write_spill(&mut spill_file, &data, spill_id)?;
            }
        }

        let spill = match spill_file {
            Some(f) => Some(Arc::new(
                f.into_temp_path(),
            )),
            None => None,
        };

        Ok(Self {
            mem: mem.freeze(),
            spill,
            total_len: total,
        })
    }

    /// Build a fresh body stream starting at the beginning — used both to
    /// hand the buffered request to `next` and to rewind for a retry.
    pub fn to_body(&self) -> Result<Body, ProxyError> {
        if self.mem.is_empty() && self.spill.is_none() {
            return Ok(Body::empty());
        }
        if self.spill.is_none() {
            return Ok(Body::from(self.mem.clone()));
        }

        let path = self.spill.clone().expect("checked above");
        let mem = self.mem.clone();
        let file = std::fs::File::open(&*path).map_err(|e| ProxyError::Io(e.to_string()))?;
        let file = tokio::fs::File::from_std(file);
        let file_stream = ReaderStream::new(file).map(|r| r.map_err(axum::Error::new));
        let mem_stream =
            futures_util::stream::once(async move { Ok::<_, axum::Error>(mem) });
        let combined = mem_stream.chain(file_stream);
        Ok(Body::from_stream(combined))
    }

    /// Release any on-disk resources early instead of waiting for drop.
    /// Safe to call multiple times.
    pub fn release(&mut self) {
        self.spill = None;
        self.mem = Bytes::new();
    }
}

fn write_spill(slot: &mut Option<NamedTempFile>, data: &[u8], spill_id: uuid::Uuid) -> Result<(), ProxyError> {
    if slot.is_none() {
        let file = tempfile::Builder::new()
            .prefix(&format!("proxy-buffer-{spill_id}-"))
            .tempfile()
            .map_err(|e| ProxyError::Io(e.to_string()))?;
        trace!(%spill_id, "buffer: spilling body to disk");
        *slot = Some(file);
    }
    let file = slot.as_mut().expect("just inserted");
    file.write_all(data).map_err(|e| ProxyError::Io(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(body: Body) -> Vec<u8> {
        let mut body = body;
        let mut out = Vec::new();
        loop {
            match body.frame().await {
                Some(Ok(f)) => {
                    if let Ok(data) = f.into_data() {
                        out.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => panic!("body error: {e}"),
                None => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn small_body_stays_in_memory() {
        let body = Body::from("hello");
        let buf = MultiBuffer::fill(body, 1024, None).await.unwrap();
        assert_eq!(buf.total_len(), 5);
        assert!(!buf.has_spill());
        assert_eq!(collect(buf.to_body().unwrap()).await, b"hello");
    }

    #[tokio::test]
    async fn large_body_spills_to_disk() {
        let payload = vec![7u8; 10_000];
        let body = Body::from(payload.clone());
        let buf = MultiBuffer::fill(body, 100, None).await.unwrap();
        assert!(buf.has_spill());
        assert_eq!(buf.total_len(), 10_000);
        assert_eq!(collect(buf.to_body().unwrap()).await, payload);
    }

    #[tokio::test]
    async fn rewind_replays_identical_bytes() {
        let payload = vec![3u8; 5_000];
        let body = Body::from(payload.clone());
        let buf = MultiBuffer::fill(body, 100, None).await.unwrap();
        let first = collect(buf.to_body().unwrap()).await;
        let second = collect(buf.to_body().unwrap()).await;
        assert_eq!(first, second);
        assert_eq!(first, payload);
    }

    #[tokio::test]
    async fn exceeding_max_limit_aborts() {
        let body = Body::from(vec![1u8; 100]);
        let err = MultiBuffer::fill(body, 10, Some(50)).await.unwrap_err();
        assert!(matches!(err, ProxyError::RequestTooLarge { .. }));
    }

    #[tokio::test]
    async fn empty_body_yields_empty_reader() {
        let buf = MultiBuffer::fill(Body::empty(), 1024, None).await.unwrap();
        assert_eq!(buf.total_len(), 0);
        assert_eq!(collect(buf.to_body().unwrap()).await, Vec::<u8>::new());
    }
}
