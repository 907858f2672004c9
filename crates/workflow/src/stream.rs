//! Typed event stream over a raw workflow response body.

use std::collections::VecDeque;

use futures::StreamExt;

use crate::api::{ByteStream, WorkflowError};
use crate::frames::FrameDecoder;
use crate::messages::{parse_frame, WorkflowEvent};

/// Reads a streamed run body and yields [`WorkflowEvent`]s in order.
///
/// Keep-alive frames without a `data:` line are skipped. Every complete
/// frame is parsed exactly once, however the body was chunked.
pub struct WorkflowStream {
    body: ByteStream,
    decoder: FrameDecoder,
    frames: VecDeque<String>,
    bytes_received: usize,
    finished: bool,
}

impl WorkflowStream {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(),
            frames: VecDeque::new(),
            bytes_received: 0,
            finished: false,
        }
    }

    /// The next event, or `Ok(None)` once the body ended after
    /// `workflow_finished`.
    ///
    /// A body that ends with no bytes at all is [`WorkflowError::EmptyBody`];
    /// one that ends before `workflow_finished` is
    /// [`WorkflowError::PrematureEnd`].
    pub async fn next_event(&mut self) -> Result<Option<WorkflowEvent>, WorkflowError> {
        loop {
            while let Some(frame) = self.frames.pop_front() {
                if let Some(event) = parse_frame(&frame)? {
                    if matches!(event, WorkflowEvent::WorkflowFinished(_)) {
                        self.finished = true;
                    }
                    return Ok(Some(event));
                }
            }

            match self.body.next().await {
                Some(Ok(chunk)) => {
                    self.bytes_received += chunk.len();
                    self.frames.extend(self.decoder.push(&chunk)?);
                }
                Some(Err(e)) => return Err(e),
                None => return self.end(),
            }
        }
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    fn end(&self) -> Result<Option<WorkflowEvent>, WorkflowError> {
        if self.bytes_received == 0 {
            return Err(WorkflowError::EmptyBody);
        }
        if self.decoder.pending() > 0 {
            tracing::debug!(
                discarded_bytes = self.decoder.pending(),
                "Discarding incomplete trailing frame",
            );
        }
        if !self.finished {
            return Err(WorkflowError::PrematureEnd);
        }
        Ok(None)
    }
}
