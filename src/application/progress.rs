//! Progress sink
//!
//! Units of one operation share a single sink. The underlying channel
//! serializes concurrent writers, so the consumer sees events in arrival order.

use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::ProgressEvent;

#[derive(Debug, Clone)]
pub struct ProgressSink {
    sender: mpsc::Sender<ProgressEvent>,
}

impl ProgressSink {
    /// Creates a sink and the receiver the event encoder drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }

    /// Waits for buffer space. A vanished receiver is not an error for the
    /// operation; the transport cancels the token when its client goes away.
    pub async fn emit(&self, event: ProgressEvent) {
        if self.sender.send(event).await.is_err() {
            debug!("Progress receiver dropped, event discarded");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
