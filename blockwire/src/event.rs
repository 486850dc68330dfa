//! Typed notification bus. Subscribers are called synchronously, in registration 
//! order, on the thread raising the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::fmt;

use crossbeam_channel::{unbounded, Receiver};
use glam::{DVec3, IVec3};

use crate::block::Block;


/// Shared callback type of a subscriber.
type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A bus where events of type `E` are raised and dispatched to zero or more 
/// subscribers.
pub struct Bus<E> {
    /// Subscribers, in registration order.
    subscribers: RwLock<Vec<(SubscriberId, Callback<E>)>>,
    /// Next identifier to give to a subscriber.
    next_id: AtomicU64,
}

/// Handle returned when subscribing, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl<E> Bus<E> {

    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber, it will be called after every subscriber already 
    /// registered.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().expect("poisoned").push((id, Arc::new(callback)));
        id
    }

    /// Register a subscriber that forwards a clone of every event to the returned
    /// channel. Events are silently discarded once the receiver is dropped.
    pub fn subscribe_channel(&self) -> (SubscriberId, Receiver<E>)
    where
        E: Clone + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let id = self.subscribe(move |event: &E| {
            let _ = sender.send(event.clone());
        });
        (id, receiver)
    }

    /// Remove a subscriber, returning true if it was registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write().expect("poisoned");
        let len = subscribers.len();
        subscribers.retain(|&(sub_id, _)| sub_id != id);
        subscribers.len() != len
    }

    /// Return true if at least one subscriber is registered.
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.read().expect("poisoned").is_empty()
    }

    /// Raise an event to every subscriber. The subscriber list is snapshotted before
    /// dispatch, so subscribers may (un)subscribe from their callback.
    pub fn emit(&self, event: &E) {
        
        let callbacks = self.subscribers.read().expect("poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect::<Vec<_>>();

        for callback in callbacks {
            callback(event);
        }

    }

}

impl<E> Default for Bus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Bus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("subscribers", &self.subscribers.read().expect("poisoned").len())
            .finish()
    }
}


/// An event that happened in a world.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An event with a block.
    Block {
        /// The position of the block.
        pos: IVec3,
        /// Inner block event.
        inner: BlockEvent,
    },
    /// An event with an entity given its id.
    Entity {
        /// The unique id of the entity.
        id: u32,
        /// Inner entity event.
        inner: EntityEvent,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockEvent {
    /// A block has been changed in the world.
    Set {
        /// The new block.
        block: Block,
        /// The block previously at this position.
        prev: Block,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    /// The entity has been spawned at the given position.
    Spawn {
        pos: DVec3,
    },
    /// The entity has been removed.
    Remove,
}


#[cfg(test)]
mod tests {

    use std::sync::Mutex;

    use super::*;

    #[test]
    fn registration_order() {

        let bus = Bus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event: &u32| seen.lock().unwrap().push((tag, *event)));
        }

        bus.emit(&7);
        assert_eq!(*seen.lock().unwrap(), [(0, 7), (1, 7), (2, 7)]);

    }

    #[test]
    fn no_subscriber() {
        let bus = Bus::<u32>::new();
        assert!(!bus.has_subscribers());
        bus.emit(&1);
    }

    #[test]
    fn unsubscribe_and_channel() {

        let bus = Bus::<u32>::new();
        let (id, receiver) = bus.subscribe_channel();
        bus.emit(&1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&2);

        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), [1]);

    }

}
