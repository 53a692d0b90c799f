// Subscriptions held on the push channel.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::link::connection::{ConnectionError, FramePublisher};
use crate::protocol::{room_destination, ClientFrame, MatchId, ResponseKind};

/// Destinations currently subscribed on the live connection.
///
/// Repeat subscribes are no-ops. A destination is recorded only after its
/// subscribe frame was handed to the transport, so a failed attempt can be
/// retried. The registry is cleared whenever the connection drops, because
/// the server forgets subscriptions with the socket.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    active: HashSet<String>,
    room: Option<MatchId>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.active.contains(destination)
    }

    pub fn room(&self) -> Option<MatchId> {
        self.room
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Subscribe to `destination`. Returns `Ok(false)` when already subscribed.
    pub fn subscribe(
        &mut self,
        destination: &str,
        publisher: &dyn FramePublisher,
    ) -> Result<bool, ConnectionError> {
        if self.active.contains(destination) {
            debug!("already subscribed to {}", destination);
            return Ok(false);
        }
        publisher.publish(ClientFrame::subscribe(destination))?;
        self.active.insert(destination.to_string());
        debug!("subscribed to {}", destination);
        Ok(true)
    }

    /// Subscribe to all four personal response queues.
    pub fn subscribe_personal(
        &mut self,
        publisher: &dyn FramePublisher,
    ) -> Result<(), ConnectionError> {
        for kind in ResponseKind::ALL {
            self.subscribe(kind.destination(), publisher)?;
        }
        Ok(())
    }

    /// Subscribe to the room topic of `match_id`, leaving any other room first.
    pub fn subscribe_room(
        &mut self,
        match_id: MatchId,
        publisher: &dyn FramePublisher,
    ) -> Result<bool, ConnectionError> {
        if let Some(previous) = self.room {
            if previous != match_id {
                self.unsubscribe_room(publisher);
            }
        }
        let subscribed = self.subscribe(&room_destination(match_id), publisher)?;
        if subscribed {
            info!("Subscribed to room {}", match_id);
        }
        self.room = Some(match_id);
        Ok(subscribed)
    }

    /// Leave the current room topic. Best effort: the local record is removed
    /// even when the unsubscribe frame cannot be sent.
    pub fn unsubscribe_room(&mut self, publisher: &dyn FramePublisher) {
        let Some(match_id) = self.room.take() else {
            return;
        };
        let destination = room_destination(match_id);
        if self.active.remove(&destination) {
            if let Err(e) = publisher.publish(ClientFrame::unsubscribe(destination.as_str())) {
                debug!("unsubscribe from {} not sent: {}", destination, e);
            }
        }
    }

    /// Forget everything (connection dropped or closed).
    pub fn clear(&mut self) {
        self.active.clear();
        self.room = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        frames: RefCell<Vec<ClientFrame>>,
        fail: bool,
    }

    impl FramePublisher for Recorder {
        fn publish(&self, frame: ClientFrame) -> Result<(), ConnectionError> {
            if self.fail {
                return Err(ConnectionError::NotConnected);
            }
            self.frames.borrow_mut().push(frame);
            Ok(())
        }
    }

    #[test]
    fn repeat_subscribe_is_noop() {
        let publisher = Recorder::default();
        let mut subs = SubscriptionRegistry::new();
        assert!(subs.subscribe("/topic/battle/1", &publisher).unwrap());
        assert!(!subs.subscribe("/topic/battle/1", &publisher).unwrap());
        assert_eq!(publisher.frames.borrow().len(), 1);
    }

    #[test]
    fn personal_queues_subscribed_once_each() {
        let publisher = Recorder::default();
        let mut subs = SubscriptionRegistry::new();
        subs.subscribe_personal(&publisher).unwrap();
        subs.subscribe_personal(&publisher).unwrap();
        assert_eq!(publisher.frames.borrow().len(), 4);
        assert!(subs.is_subscribed("/user/queue/battle/join-result"));
    }

    #[test]
    fn failed_subscribe_is_not_recorded() {
        let failing = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut subs = SubscriptionRegistry::new();
        assert!(subs.subscribe_room(5, &failing).is_err());
        assert!(subs.is_empty());

        let publisher = Recorder::default();
        assert!(subs.subscribe_room(5, &publisher).unwrap());
    }

    #[test]
    fn switching_rooms_unsubscribes_previous() {
        let publisher = Recorder::default();
        let mut subs = SubscriptionRegistry::new();
        subs.subscribe_room(1, &publisher).unwrap();
        subs.subscribe_room(2, &publisher).unwrap();
        assert_eq!(subs.room(), Some(2));
        assert!(!subs.is_subscribed("/topic/battle/1"));
        assert_eq!(
            publisher.frames.borrow()[1],
            ClientFrame::unsubscribe("/topic/battle/1")
        );
    }

    #[test]
    fn clear_allows_resubscribe_after_reconnect() {
        let publisher = Recorder::default();
        let mut subs = SubscriptionRegistry::new();
        subs.subscribe_personal(&publisher).unwrap();
        subs.subscribe_room(3, &publisher).unwrap();
        subs.clear();
        assert!(subs.room().is_none());
        subs.subscribe_room(3, &publisher).unwrap();
        assert_eq!(publisher.frames.borrow().len(), 6);
    }
}
