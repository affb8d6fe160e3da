use crate::addressing::Address;
use crate::scheduler::PeerId;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SwarmEvent {
    PeerAdded(PeerAddedData),
    PeerRemoved(PeerRemovedData),
    /// a contiguous range of verified chunks became available, each range is reported once
    DataAvailable(DataAvailableData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerAddedData {
    pub peer: PeerId,
    pub initiator: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerRemovedData {
    pub peer: PeerId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataAvailableData {
    pub address: Address,
    /// one entry per chunk in the address, empty for the padding at the end of a subtree
    pub chunks: Vec<Bytes>,
}


pub struct SwarmEventNotifier {
    sender: broadcast::Sender<SwarmEvent>,
}
impl SwarmEventNotifier {
    pub fn new(capacity: usize) -> SwarmEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        SwarmEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SwarmEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_notify_subscribers() {
        let notifier = SwarmEventNotifier::new(4);
        notifier.send_event(SwarmEvent::PeerRemoved(PeerRemovedData { peer: PeerId(1) }));

        let mut receiver = notifier.subscribe();
        let event = SwarmEvent::PeerAdded(PeerAddedData { peer: PeerId(2), initiator: true });
        notifier.send_event(event.clone());
        assert_eq!(receiver.recv().await.unwrap(), event);
        assert!(receiver.try_recv().is_err());
    }
}
