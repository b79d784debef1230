//! Thread-safe handle for driving a [`Link`](super::Link) from other threads.

use super::ConnId;

use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::instrument;

/// Requests posted to the event loop from other threads.
///
/// Drained at the top of every loop iteration, before readiness dispatch.
#[derive(Debug)]
pub(super) enum LinkCommand {
    Send { conn_id: ConnId, data: Vec<u8> },
    Close { conn_id: ConnId },
}

/// Cloneable handle for commanding a [`Link`](super::Link) from outside its
/// event-loop thread.
///
/// The [`Link`](super::Link) itself is single-threaded; this is the only part
/// of the API that may be used concurrently. Commands are queued and the loop
/// is woken, so effects apply on the next loop iteration.
#[derive(Debug, Clone)]
pub struct LinkInterface {
    pub(super) sender: Sender<LinkCommand>,
    pub(super) waker: Arc<Waker>,
    pub(super) stop_requested: Arc<AtomicBool>,
}

impl LinkInterface {
    /// Queues data for sending on a connection and wakes the event loop.
    ///
    /// The send-in-flight contract still applies: if the previous send on
    /// this connection has not completed by the time the command is drained,
    /// the loop logs the violation and drops the payload.
    #[instrument(skip(self, data))]
    pub fn send(&self, conn_id: ConnId, data: Vec<u8>) {
        self.sender
            .send(LinkCommand::Send { conn_id, data })
            .expect("Failed to send request to event loop");
        self.wakeup();
    }

    /// Queues a connection close and wakes the event loop.
    #[instrument(skip(self))]
    pub fn close(&self, conn_id: ConnId) {
        self.sender
            .send(LinkCommand::Close { conn_id })
            .expect("Failed to send request to event loop");
        self.wakeup();
    }

    /// Requests the event loop to stop at the top of its next iteration.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wakeup();
    }

    /// Interrupts a blocking poll so the loop re-checks its inputs.
    pub fn wakeup(&self) {
        self.waker.wake().expect("Failed to wake event loop");
    }
}
