//! Pull-style reader over a push-style byte source.
//!
//! Upstream chunks rarely line up with the buffers the core offers, so
//! chunks are queued: a chunk larger than the caller's buffer is split and
//! the remainder requeued, and upstream is only polled once the queue is
//! empty.

use std::collections::VecDeque;

use corehost_types::Errno;
use futures_util::StreamExt;

use crate::services::{ByteStream, HostFut, HostStream};

pub struct ChunkReader {
    upstream: Option<ByteStream>,
    queue: VecDeque<Vec<u8>>,
    closed: bool,
}

impl ChunkReader {
    pub fn new(upstream: ByteStream) -> Self {
        Self {
            upstream: Some(upstream),
            queue: VecDeque::new(),
            closed: false,
        }
    }

    /// Make sure a chunk is queued, pulling from upstream only when the queue
    /// is empty. Returns false at end of stream.
    async fn fill(&mut self) -> Result<bool, Errno> {
        while self.queue.is_empty() {
            let Some(upstream) = self.upstream.as_mut() else {
                return Ok(false);
            };
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    if !chunk.is_empty() {
                        self.queue.push_back(chunk);
                    }
                }
                Some(Err(errno)) => return Err(errno),
                None => {
                    self.upstream = None;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Up to `max` queued bytes. Only what is queued is allocated.
    fn take(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut chunk) = self.queue.pop_front() else {
                break;
            };
            let room = max - out.len();
            if chunk.len() > room {
                let rest = chunk.split_off(room);
                self.queue.push_front(rest);
            }
            if out.is_empty() {
                out = chunk;
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }
}

impl HostStream for ChunkReader {
    fn read(&mut self, max: usize) -> HostFut<'_, Result<Vec<u8>, Errno>> {
        Box::pin(async move {
            if self.closed {
                return Err(Errno::BadF);
            }
            if max == 0 || !self.fill().await? {
                return Ok(Vec::new());
            }
            Ok(self.take(max))
        })
    }

    fn write<'a>(&'a mut self, _data: &'a [u8]) -> HostFut<'a, Result<usize, Errno>> {
        Box::pin(async { Err(Errno::NotSup) })
    }

    fn close(&mut self) -> HostFut<'_, Result<(), Errno>> {
        self.upstream = None;
        self.queue.clear();
        self.closed = true;
        Box::pin(async { Ok(()) })
    }
}
