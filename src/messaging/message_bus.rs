use tokio::sync::broadcast;
use tracing::trace;

use crate::messaging::message::Message;

/// Local delivery of reassembled messages to application code. Consumers that fall behind
///  lose the oldest messages (see [broadcast::error::RecvError::Lagged]); delivery is best
///  effort like the rest of the bus.
pub struct MessageBus {
    sender: broadcast::Sender<Message>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> MessageBus {
        let (sender, _) = broadcast::channel(capacity.max(1));

        MessageBus {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    pub fn publish(&self, message: Message) {
        trace!("delivering locally: {:?}", message);
        // no subscribers is fine
        let _ = self.sender.send(message);
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        MessageBus::new(1024)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = MessageBus::default();
        bus.publish(Message::new("c1", "t", b"lost".to_vec()).unwrap());

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let msg = Message::new("c1", "t", b"x".to_vec()).unwrap();
        bus.publish(msg.clone());

        assert_eq!(a.recv().await.unwrap(), msg);
        assert_eq!(b.recv().await.unwrap(), msg);
        assert!(a.try_recv().is_err());
    }
}
