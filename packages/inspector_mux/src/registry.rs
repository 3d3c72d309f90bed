use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::MuxError;
use crate::message::Outbound;

/// The queue ends a scenario holds for one live instance: the only producer
/// of its outbound queue and the only consumer of its inbound queue.
pub struct InstanceConnection {
    pub instance_id: u32,
    pub(crate) sender: mpsc::UnboundedSender<Outbound>,
    pub(crate) receiver: mpsc::UnboundedReceiver<String>,
}

/// The queue ends handed to an instance's pump pair: consumer of the
/// outbound queue, producer of the inbound queue.
pub(crate) struct PumpEnds {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::UnboundedSender<String>,
}

struct Entry {
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Claimed exactly once by the scenario driver; ownership enforces the
    /// one-consumer-per-direction invariant.
    inbound: Option<mpsc::UnboundedReceiver<String>>,
}

/// Maps each live instance id to its queue pair.
///
/// Entries are created and removed only by the connect channel's receive
/// loop; the scenario driver claims queue ends and reads. Newly attached
/// instance ids are handed to the driver through a single-slot rendezvous
/// channel, so the receive loop cannot run ahead of the scenario.
pub struct InstanceRegistry {
    entries: Mutex<HashMap<u32, Entry>>,
    pending_tx: mpsc::Sender<u32>,
    pending_rx: Mutex<mpsc::Receiver<u32>>,
    accepting: AtomicBool,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(1);
        Self {
            entries: Mutex::new(HashMap::new()),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            accepting: AtomicBool::new(true),
        }
    }

    /// Create the queue pair for a new instance. Returns `None` when the id
    /// is already attached (idempotent creation, no second pump).
    pub(crate) async fn attach(&self, instance_id: u32) -> Option<PumpEnds> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&instance_id) {
            debug!("instance {instance_id} already attached");
            return None;
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        entries.insert(
            instance_id,
            Entry {
                outbound: out_tx,
                inbound: Some(in_rx),
            },
        );
        Some(PumpEnds {
            outbound: out_rx,
            inbound: in_tx,
        })
    }

    /// Drop the queue pair. Pump shutdown is signaled through the outbound
    /// queue, not by this call.
    pub(crate) async fn detach(&self, instance_id: u32) {
        self.entries.lock().await.remove(&instance_id);
    }

    pub async fn is_attached(&self, instance_id: u32) -> bool {
        self.entries.lock().await.contains_key(&instance_id)
    }

    /// Claim the scenario-side queue ends for an attached instance. The
    /// inbound receiver can be claimed only once.
    pub(crate) async fn claim(&self, instance_id: u32) -> Option<InstanceConnection> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&instance_id)?;
        let receiver = entry.inbound.take()?;
        Some(InstanceConnection {
            instance_id,
            sender: entry.outbound.clone(),
            receiver,
        })
    }

    /// Enqueue the close sentinel on one instance's outbound queue.
    pub(crate) async fn close_instance(&self, instance_id: u32) {
        if let Some(entry) = self.entries.lock().await.get(&instance_id) {
            let _ = entry.outbound.send(Outbound::Close);
        }
    }

    /// Enqueue the close sentinel for every live instance. Used at session
    /// teardown so an early failure cannot leak a pump.
    pub(crate) async fn close_all(&self) {
        for entry in self.entries.lock().await.values() {
            let _ = entry.outbound.send(Outbound::Close);
        }
    }

    /// Hand a newly attached instance id to the scenario driver. Blocks until
    /// the driver has taken the previous one.
    pub(crate) async fn publish_instance(&self, instance_id: u32) -> Result<(), MuxError> {
        self.pending_tx
            .send(instance_id)
            .await
            .map_err(|_| MuxError::ChannelClosed("instance rendezvous"))
    }

    /// Next pending instance id, in attach order.
    pub(crate) async fn next_instance(&self) -> Option<u32> {
        self.pending_rx.lock().await.recv().await
    }

    /// One-way latch: stop opening pumps for late-arriving instances.
    pub fn stop_accepting_new_instances(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}
