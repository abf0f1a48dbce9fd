//! Inbound dispatch: application threads ──► network thread.
//!
//! Anything that must run inside the engine's call context (opening a
//! stream, marking it active, resetting it) is posted here as a [`NetCmd`]
//! and the engine is woken so the network loop drains the queue promptly.

use tokio::sync::mpsc;

// ---

use moqx_domain::{ConnId, EngineWaker, FlowId, Result, StreamId, TransportError};

// ---------------------------------------------------------------------------
// NetCmd
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NetCmd {
    // ---
    /// The flow's queue has data; open a stream if needed and mark it active.
    MarkStreamActive { conn: ConnId, flow: FlowId },

    MarkDatagramReady { conn: ConnId },

    /// Push a new priority to the flow's current stream.
    SetStreamPriority { conn: ConnId, flow: FlowId },

    /// Close a stream detached from a deleted flow.
    CloseStream { conn: ConnId, stream: StreamId, reset: bool },

    CloseConnection { conn: ConnId, code: u64 },
}

// ---------------------------------------------------------------------------
// RunnerTx
// ---------------------------------------------------------------------------

/// Cheap-clone sender handle into the network thread.
#[derive(Clone)]
pub(crate) struct RunnerTx {
    // ---
    tx: mpsc::Sender<NetCmd>,
    waker: EngineWaker,
}

impl RunnerTx {
    // ---
    pub fn new(capacity: usize, waker: EngineWaker) -> (Self, mpsc::Receiver<NetCmd>) {
        // ---
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, waker }, rx)
    }

    /// Queue a command and wake the engine. Never blocks.
    pub fn send(&self, cmd: NetCmd) -> Result<()> {
        // ---
        match self.tx.try_send(cmd) {
            Ok(()) => {
                (self.waker)();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                tracing::warn!(?cmd, "runner queue full");
                Err(TransportError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::NotRunning),
        }
    }

    pub fn wake(&self) {
        (self.waker)();
    }
}

impl std::fmt::Debug for RunnerTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerTx").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn send_wakes_engine_and_reports_full_queue() {
        // ---
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        let waker: EngineWaker = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (runner, mut rx) = RunnerTx::new(1, waker);
        let cmd = NetCmd::MarkDatagramReady { conn: ConnId(1) };

        runner.send(cmd.clone()).unwrap();
        assert!(matches!(runner.send(cmd.clone()), Err(TransportError::QueueFull)));
        assert_eq!(wakes.load(Ordering::SeqCst), 1, "a rejected command must not wake");

        assert_eq!(rx.try_recv().ok(), Some(cmd.clone()));
        drop(rx);
        assert!(matches!(runner.send(cmd), Err(TransportError::NotRunning)));
    }
}
