//! Per-stream read-ahead state.
//!
//! The broker reads every open stream continuously, buffering chunks ahead of
//! demand. A read request is answered as soon as there is something to answer
//! it with: buffered bytes, end of stream, or an error.

use std::collections::VecDeque;

/// A read waiting for data, as sent by the requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub result_ptr: u32,
    pub buf_ptr: u32,
    pub buf_len: u32,
}

/// How a read gets answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// At most `buf_len` bytes. Empty only when `buf_len` is zero.
    Data(Vec<u8>),
    Eof,
    Error,
}

#[derive(Debug, Default)]
pub struct StreamState {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the front chunk already handed out.
    front_offset: usize,
    done: bool,
    errored: bool,
    pending: Option<ReadRequest>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    /// The body ended; buffered bytes are still served before EOF.
    pub fn finish(&mut self) {
        self.done = true;
    }

    /// The body failed; the next read fails even if bytes are buffered.
    pub fn fail(&mut self) {
        self.errored = true;
    }

    pub fn buffered_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum::<usize>() - self.front_offset
    }

    pub fn has_pending_read(&self) -> bool {
        self.pending.is_some()
    }

    /// Parks `request` until it can be answered. Refuses a second pending read
    /// and hands the refused request back.
    pub fn begin_read(&mut self, request: ReadRequest) -> Result<(), ReadRequest> {
        if self.pending.is_some() {
            return Err(request);
        }
        self.pending = Some(request);
        Ok(())
    }

    /// Removes the pending read, if any, without answering it.
    pub fn take_pending(&mut self) -> Option<ReadRequest> {
        self.pending.take()
    }

    /// Answers the pending read if possible.
    pub fn try_complete(&mut self) -> Option<(ReadRequest, ReadOutcome)> {
        let request = self.pending?;
        let outcome = if self.errored {
            ReadOutcome::Error
        } else if self.chunks.is_empty() {
            if !self.done {
                return None;
            }
            ReadOutcome::Eof
        } else if request.buf_len == 0 {
            ReadOutcome::Data(Vec::new())
        } else {
            ReadOutcome::Data(self.take_bytes(request.buf_len as usize))
        };
        self.pending = None;
        Some((request, outcome))
    }

    fn take_bytes(&mut self, limit: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(limit.min(self.buffered_bytes()));
        while out.len() < limit {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let available = &front[self.front_offset..];
            let take = available.len().min(limit - out.len());
            out.extend_from_slice(&available[..take]);
            if take == available.len() {
                self.chunks.pop_front();
                self.front_offset = 0;
            } else {
                self.front_offset += take;
            }
        }
        out
    }
}
