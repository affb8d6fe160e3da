use crate::addressing::Address;
use crate::scheduler::PeerId;
use crate::swarm::{Swarm, VerificationJob, VerificationResult};
use crate::util::random::{Random, RngRandom};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};


/// The transport side of a connection to one peer. Implementations deliver whole datagrams;
///  received datagrams are passed back to the driver as [SwarmInput::Message].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerChannel: Send + Sync + 'static {
    async fn send(&self, datagram: Bytes) -> anyhow::Result<()>;
    async fn close(&self);
}

/// The transport's identifier for a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ChannelKey(pub u64);

pub enum SwarmInput {
    Opened { key: ChannelKey, channel: Arc<dyn PeerChannel>, initiator: bool },
    Message { key: ChannelKey, datagram: Bytes },
    /// the remote side or the transport closed the connection
    Closed { key: ChannelKey },
    Error { key: ChannelKey, error: anyhow::Error },
    Inject { chunks: Vec<Bytes>, reply: Option<oneshot::Sender<anyhow::Result<Address>>> },
    Shutdown,
}
impl Debug for SwarmInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmInput::Opened { key, initiator, .. } => write!(f, "Opened({:?}, initiator: {})", key, initiator),
            SwarmInput::Message { key, datagram } => write!(f, "Message({:?}, {} bytes)", key, datagram.len()),
            SwarmInput::Closed { key } => write!(f, "Closed({:?})", key),
            SwarmInput::Error { key, error } => write!(f, "Error({:?}, {})", key, error),
            SwarmInput::Inject { chunks, .. } => write!(f, "Inject({} chunks)", chunks.len()),
            SwarmInput::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct Connection {
    peer: PeerId,
    channel: Arc<dyn PeerChannel>,
}


/// Runs a [Swarm] as a tokio task: it feeds transport input into the swarm, triggers the
///  peers' scheduling cycles when they are due, runs chunk verification on the blocking pool
///  and sends the resulting datagrams.
pub struct SwarmDriver<R: Random = RngRandom> {
    swarm: Swarm<R>,
    inputs: mpsc::Receiver<SwarmInput>,
    connections: FxHashMap<ChannelKey, Connection>,
    keys_by_peer: FxHashMap<PeerId, ChannelKey>,
    closing: Vec<Arc<dyn PeerChannel>>,
    verification_sender: mpsc::UnboundedSender<VerificationResult>,
    verification_receiver: mpsc::UnboundedReceiver<VerificationResult>,
}

impl <R: Random> SwarmDriver<R> {
    pub fn new(swarm: Swarm<R>) -> (SwarmDriver<R>, mpsc::Sender<SwarmInput>) {
        let (input_sender, inputs) = mpsc::channel(swarm.config().input_buffer_size);
        let (verification_sender, verification_receiver) = mpsc::unbounded_channel();

        let driver = SwarmDriver {
            swarm,
            inputs,
            connections: FxHashMap::default(),
            keys_by_peer: FxHashMap::default(),
            closing: Vec::new(),
            verification_sender,
            verification_receiver,
        };
        (driver, input_sender)
    }

    #[tracing::instrument(name = "swarm", skip_all)]
    pub async fn run(mut self) {
        info!("starting swarm driver for {}", self.swarm.config().uri);

        loop {
            let deadline = self.next_deadline(Instant::now());

            select! {
                input = self.inputs.recv() => match input {
                    None | Some(SwarmInput::Shutdown) => break,
                    Some(input) => self.on_input(input, Instant::now()),
                },
                Some(result) = self.verification_receiver.recv() => {
                    self.swarm.complete_verification(result);
                }
                _ = sleep_until(deadline) => {
                    self.run_due_peers(Instant::now());
                }
            }

            self.flush().await;
        }

        self.shutdown().await;
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        self.swarm.peer_ids().into_iter()
            .filter_map(|peer| self.swarm.next_run(peer))
            .min()
            .unwrap_or(now + self.swarm.config().scheduler.max_loop_interval)
    }

    fn run_due_peers(&mut self, now: Instant) {
        for peer in self.swarm.peer_ids() {
            if self.swarm.next_run(peer).is_some_and(|due| due <= now) {
                self.swarm.run_peer(peer, now);
            }
        }
    }

    fn on_input(&mut self, input: SwarmInput, now: Instant) {
        match input {
            SwarmInput::Opened { key, channel, initiator } => {
                if self.connections.contains_key(&key) {
                    warn!("channel {:?} was opened twice - ignoring", key);
                    return;
                }
                match self.swarm.add_peer(initiator, now) {
                    Ok(peer) => {
                        debug!("channel {:?} belongs to {}", key, peer);
                        self.keys_by_peer.insert(peer, key);
                        self.connections.insert(key, Connection { peer, channel });
                    }
                    Err(e) => {
                        error!("cannot add peer for channel {:?}: {}", key, e);
                        self.closing.push(channel);
                    }
                }
            }
            SwarmInput::Message { key, datagram } => {
                let Some(connection) = self.connections.get(&key) else {
                    debug!("datagram on unknown channel {:?} - dropping", key);
                    return;
                };
                let peer = connection.peer;
                for job in self.swarm.handle_datagram(peer, datagram, now) {
                    self.spawn_verification(job);
                }
            }
            SwarmInput::Closed { key } => {
                debug!("channel {:?} was closed", key);
                self.disconnect(key, false);
            }
            SwarmInput::Error { key, error } => {
                warn!("error on channel {:?}: {}", key, error);
                self.disconnect(key, true);
            }
            SwarmInput::Inject { chunks, reply } => {
                let result = self.swarm.inject(chunks, now);
                if let Err(e) = &result {
                    warn!("injecting chunks failed: {}", e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            SwarmInput::Shutdown => {}
        }
    }

    fn disconnect(&mut self, key: ChannelKey, close_channel: bool) {
        let Some(connection) = self.connections.remove(&key) else {
            return;
        };
        self.keys_by_peer.remove(&connection.peer);
        self.swarm.remove_peer(connection.peer, false);
        if close_channel {
            self.closing.push(connection.channel);
        }
    }

    fn spawn_verification(&self, job: VerificationJob) {
        let sender = self.verification_sender.clone();
        let (peer, bin) = (job.peer, job.bin);

        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(result) => result,
                Err(e) => VerificationResult::failed(peer, bin, anyhow!("verification task failed: {}", e)),
            };
            let _ = sender.send(result);
        });
    }

    async fn flush(&mut self) {
        self.swarm.publish_complete_bins();

        for peer in self.swarm.take_closed_peers() {
            if let Some(key) = self.keys_by_peer.remove(&peer) {
                if let Some(connection) = self.connections.remove(&key) {
                    self.closing.push(connection.channel);
                }
            }
        }

        for (peer, datagrams) in self.swarm.flush() {
            let Some(channel) = self.keys_by_peer.get(&peer)
                .and_then(|key| self.connections.get(key))
                .map(|connection| connection.channel.clone())
            else {
                continue;
            };
            for datagram in datagrams {
                if let Err(e) = channel.send(datagram).await {
                    warn!("sending to {} failed: {}", peer, e);
                    break;
                }
            }
        }

        for channel in std::mem::take(&mut self.closing) {
            channel.close().await;
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down swarm driver");

        for (_, connection) in std::mem::take(&mut self.connections) {
            for datagram in self.swarm.remove_peer(connection.peer, true) {
                if let Err(e) = connection.channel.send(datagram).await {
                    debug!("cannot notify {} of shutdown: {}", connection.peer, e);
                }
            }
            connection.channel.close().await;
        }
        self.keys_by_peer.clear();

        for channel in std::mem::take(&mut self.closing) {
            channel.close().await;
        }
    }
}
