//! libp2p gossipsub host.
//!
//! The swarm lives on a single driver task. Callers talk to it through a
//! command channel, which serialises concurrent publishes, subscriptions and
//! dials without sharing the swarm.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, TopicHash},
    identity,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    noise, tcp, yamux, Multiaddr, PeerId, Swarm,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BootstrapPeer, OverlayError, OverlayHost, OverlayMessage, Subscription, Topic,
    SUBSCRIPTION_BUFFER,
};

const COMMAND_BUFFER: usize = 128;

#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// TCP port the host listens on, on all IPv4 interfaces.
    pub listen_port: u16,
    pub heartbeat_interval: Duration,
    pub idle_connection_timeout: Duration,
}

impl GossipConfig {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            heartbeat_interval: Duration::from_secs(1),
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

type Reply = oneshot::Sender<Result<(), OverlayError>>;

enum Command {
    Subscribe {
        topic: String,
        sender: mpsc::Sender<OverlayMessage>,
        reply: Reply,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply,
    },
    Dial {
        peer: BootstrapPeer,
        reply: Reply,
    },
}

#[derive(Clone)]
struct CommandSender(mpsc::Sender<Command>);

impl CommandSender {
    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), OverlayError> {
        let (reply, response) = oneshot::channel();
        self.0
            .send(build(reply))
            .await
            .map_err(|_| OverlayError::Closed)?;
        response.await.map_err(|_| OverlayError::Closed)?
    }
}

pub struct GossipHost {
    peer_id: PeerId,
    commands: CommandSender,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl GossipHost {
    /// Builds the swarm, starts listening and spawns the driver task. Must be
    /// called from within a tokio runtime.
    pub fn spawn(keypair: identity::Keypair, config: GossipConfig) -> Result<Self, OverlayError> {
        let peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(keypair, &config)?;
        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|err| OverlayError::Host(format!("listen address: {err}")))?;
        swarm
            .listen_on(listen)
            .map_err(|err| OverlayError::Host(format!("listen: {err}")))?;

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();
        let driver = SwarmDriver {
            swarm,
            commands: rx,
            shutdown: shutdown.clone(),
            subscribers: HashMap::new(),
            pending_dials: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run());
        info!(%peer_id, port = config.listen_port, "overlay host started");

        Ok(Self {
            peer_id,
            commands: CommandSender(tx),
            shutdown,
            driver: Mutex::new(Some(handle)),
        })
    }
}

fn build_swarm(
    keypair: identity::Keypair,
    config: &GossipConfig,
) -> Result<Swarm<gossipsub::Behaviour>, OverlayError> {
    let gossip_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(config.heartbeat_interval)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .build()
        .map_err(|err| OverlayError::Host(format!("gossipsub config: {err}")))?;
    let behaviour = gossipsub::Behaviour::new(MessageAuthenticity::Signed(keypair.clone()), gossip_config)
        .map_err(|err| OverlayError::Host(format!("gossipsub: {err}")))?;
    let idle_timeout = config.idle_connection_timeout;

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
        .map_err(|err| OverlayError::Host(format!("tcp transport: {err}")))?
        .with_dns()
        .map_err(|err| OverlayError::Host(format!("dns transport: {err}")))?
        .with_behaviour(|_| behaviour)
        .map_err(|err| OverlayError::Host(format!("behaviour: {err}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();
    Ok(swarm)
}

#[async_trait]
impl OverlayHost for GossipHost {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, OverlayError> {
        if self.shutdown.is_cancelled() || self.commands.0.is_closed() {
            return Err(OverlayError::Join {
                topic: topic.to_owned(),
                reason: "host is closed".into(),
            });
        }
        Ok(Arc::new(GossipTopic {
            name: topic.to_owned(),
            commands: self.commands.clone(),
        }))
    }

    async fn connect(&self, peer: &BootstrapPeer) -> Result<(), OverlayError> {
        let peer = peer.clone();
        self.commands
            .request(|reply| Command::Dial { peer, reply })
            .await
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "overlay driver task failed");
            }
            info!(peer_id = %self.peer_id, "overlay host closed");
        }
    }
}

struct GossipTopic {
    name: String,
    commands: CommandSender,
}

#[async_trait]
impl Topic for GossipTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), OverlayError> {
        let topic = self.name.clone();
        self.commands
            .request(|reply| Command::Publish { topic, data, reply })
            .await
    }

    async fn subscribe(&self) -> Result<Subscription, OverlayError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let topic = self.name.clone();
        self.commands
            .request(|reply| Command::Subscribe {
                topic,
                sender,
                reply,
            })
            .await
            .map_err(|err| match err {
                OverlayError::Closed => OverlayError::Subscribe {
                    topic: self.name.clone(),
                    reason: "host is closed".into(),
                },
                other => other,
            })?;
        Ok(Subscription::new(self.name.clone(), receiver))
    }
}

struct SwarmDriver {
    swarm: Swarm<gossipsub::Behaviour>,
    commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    subscribers: HashMap<TopicHash, Vec<mpsc::Sender<OverlayMessage>>>,
    pending_dials: HashMap<PeerId, Vec<Reply>>,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
        for (peer, replies) in self.pending_dials.drain() {
            for reply in replies {
                let _ = reply.send(Err(OverlayError::Connect {
                    peer,
                    reason: "host shut down".into(),
                }));
            }
        }
        debug!("overlay driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                topic,
                sender,
                reply,
            } => {
                let ident = IdentTopic::new(topic.as_str());
                let result = match self.swarm.behaviour_mut().subscribe(&ident) {
                    Ok(_) => {
                        self.subscribers.entry(ident.hash()).or_default().push(sender);
                        debug!(topic, "subscribed");
                        Ok(())
                    }
                    Err(err) => Err(OverlayError::Subscribe {
                        topic,
                        reason: err.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::Publish { topic, data, reply } => {
                let ident = IdentTopic::new(topic.as_str());
                let hash = ident.hash();
                let result = match self.swarm.behaviour_mut().publish(ident, data.clone()) {
                    Ok(_) => Ok(()),
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        debug!(topic, "published with no connected peers");
                        Ok(())
                    }
                    Err(err) => Err(OverlayError::Publish {
                        topic,
                        reason: err.to_string(),
                    }),
                };
                // gossipsub never hands a node its own messages; loop accepted
                // publications back so local subscribers observe them too.
                if result.is_ok() {
                    let local_peer = *self.swarm.local_peer_id();
                    self.deliver(&hash, Some(local_peer), data);
                }
                let _ = reply.send(result);
            }
            Command::Dial { peer, reply } => {
                if self.swarm.is_connected(&peer.peer_id) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let opts = DialOpts::peer_id(peer.peer_id)
                    .addresses(vec![peer.address.clone()])
                    .build();
                match self.swarm.dial(opts) {
                    Ok(()) => self.pending_dials.entry(peer.peer_id).or_default().push(reply),
                    Err(err) => {
                        let _ = reply.send(Err(OverlayError::Connect {
                            peer: peer.peer_id,
                            reason: err.to_string(),
                        }));
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<gossipsub::Event>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "overlay listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(%peer_id, "connection established");
                self.resolve_dials(peer_id, Ok(()));
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(%peer_id, "connection closed");
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                self.resolve_dials(peer_id, Err(error.to_string()));
            }
            SwarmEvent::Behaviour(gossipsub::Event::Message { message, .. }) => {
                self.deliver(&message.topic, message.source, message.data);
            }
            SwarmEvent::Behaviour(gossipsub::Event::Subscribed { peer_id, topic }) => {
                debug!(%peer_id, %topic, "peer joined topic");
            }
            _ => {}
        }
    }

    fn resolve_dials(&mut self, peer_id: PeerId, outcome: Result<(), String>) {
        let Some(replies) = self.pending_dials.remove(&peer_id) else {
            return;
        };
        for reply in replies {
            let result = outcome.clone().map_err(|reason| OverlayError::Connect {
                peer: peer_id,
                reason,
            });
            let _ = reply.send(result);
        }
    }

    fn deliver(&mut self, topic: &TopicHash, source: Option<PeerId>, data: Vec<u8>) {
        let Some(senders) = self.subscribers.get_mut(topic) else {
            return;
        };
        let message = OverlayMessage {
            topic: topic.as_str().to_owned(),
            source,
            data,
        };
        senders.retain(|sender| match sender.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(topic = %message.topic, "subscriber buffer full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}
