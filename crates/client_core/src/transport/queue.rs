use std::{collections::VecDeque, fmt};

use futures::{Sink, SinkExt};
use shared::protocol::ClientFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use super::IntentRef;
use crate::error::TransportError;

#[derive(Debug)]
struct QueuedFrame {
    frame: ClientFrame,
    intent: Option<IntentRef>,
}

/// FIFO of frames waiting for an open push channel. Frames written on behalf
/// of a user intent keep a reference to it so a failure can be reported.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<QueuedFrame>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, frame: ClientFrame, intent: Option<IntentRef>) {
        self.frames.push_back(QueuedFrame { frame, intent });
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientFrame> {
        self.frames.iter().map(|queued| &queued.frame)
    }

    /// Empties the queue, returning the intents whose frames never went out.
    pub fn abandon(&mut self) -> Vec<IntentRef> {
        self.frames
            .drain(..)
            .filter_map(|queued| queued.intent)
            .collect()
    }

    /// Writes queued frames in order. On the first failed write the frame goes
    /// back to the head and the error is returned; nothing behind it is sent.
    pub async fn flush<S>(&mut self, sink: &mut S) -> Result<usize, TransportError>
    where
        S: Sink<Message> + Unpin,
        S::Error: fmt::Display,
    {
        let mut sent = 0;
        while let Some(queued) = self.frames.pop_front() {
            let text = match serde_json::to_string(&queued.frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "push: dropping frame that failed to encode");
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Text(text)).await {
                self.frames.push_front(queued);
                return Err(TransportError::Channel(err.to_string()));
            }
            sent += 1;
        }
        Ok(sent)
    }
}
