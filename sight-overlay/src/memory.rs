//! In-process overlay: every host registered on the same [`MemoryOverlay`]
//! sees every message published to a topic it subscribed to, including its
//! own publications.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::{BootstrapPeer, OverlayError, OverlayHost, OverlayMessage, Subscription, Topic, SUBSCRIPTION_BUFFER};

struct Subscriber {
    owner: PeerId,
    sender: mpsc::Sender<OverlayMessage>,
}

#[derive(Default, Clone)]
pub struct MemoryOverlay {
    inner: Arc<Mutex<OverlayInner>>,
}

#[derive(Default)]
struct OverlayInner {
    online: HashSet<PeerId>,
    topics: HashMap<String, Vec<Subscriber>>,
}

impl MemoryOverlay {
    /// Registers a host with a random peer id.
    pub fn host(&self) -> MemoryHost {
        self.host_with_id(PeerId::random())
    }

    pub fn host_with_id(&self, peer_id: PeerId) -> MemoryHost {
        self.lock().online.insert(peer_id);
        MemoryHost {
            peer_id,
            overlay: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_online(&self, peer_id: &PeerId) -> bool {
        self.lock().online.contains(peer_id)
    }

    fn lock(&self) -> MutexGuard<'_, OverlayInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, topic: &str, owner: PeerId) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock()
            .topics
            .entry(topic.to_owned())
            .or_default()
            .push(Subscriber { owner, sender });
        Subscription::new(topic, receiver)
    }

    /// Fans a message out to every live subscriber; returns how many got it.
    fn publish(&self, topic: &str, source: PeerId, data: Vec<u8>) -> usize {
        let message = OverlayMessage {
            topic: topic.to_owned(),
            source: Some(source),
            data,
        };
        let mut guard = self.lock();
        let mut delivered = 0usize;
        if let Some(subscribers) = guard.topics.get_mut(topic) {
            subscribers.retain(|subscriber| match subscriber.sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(topic, peer = %subscriber.owner, "subscriber buffer full, dropping message");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
        delivered
    }

    fn deregister(&self, peer_id: &PeerId) {
        let mut guard = self.lock();
        guard.online.remove(peer_id);
        for subscribers in guard.topics.values_mut() {
            subscribers.retain(|subscriber| subscriber.owner != *peer_id);
        }
    }
}

pub struct MemoryHost {
    peer_id: PeerId,
    overlay: MemoryOverlay,
    closed: Arc<AtomicBool>,
}

impl MemoryHost {
    fn ensure_open(&self) -> Result<(), OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl OverlayHost for MemoryHost {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, OverlayError> {
        self.ensure_open()?;
        Ok(Arc::new(MemoryTopic {
            name: topic.to_owned(),
            peer_id: self.peer_id,
            overlay: self.overlay.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn connect(&self, peer: &BootstrapPeer) -> Result<(), OverlayError> {
        self.ensure_open()?;
        if peer.peer_id == self.peer_id {
            return Err(OverlayError::Connect {
                peer: peer.peer_id,
                reason: "cannot dial self".into(),
            });
        }
        if !self.overlay.is_online(&peer.peer_id) {
            return Err(OverlayError::Connect {
                peer: peer.peer_id,
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.overlay.deregister(&self.peer_id);
        }
    }
}

struct MemoryTopic {
    name: String,
    peer_id: PeerId,
    overlay: MemoryOverlay,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        self.overlay.publish(&self.name, self.peer_id, data);
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, OverlayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        Ok(self.overlay.subscribe(&self.name, self.peer_id))
    }
}
