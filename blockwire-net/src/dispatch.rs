//! Dispatch of received packets to handlers registered by packet id.

use std::fmt;

use tracing::debug;

use crate::connection::ConnectionHandle;
use crate::proto::Packet;


/// A packet handler, called on the connection's loop thread.
pub type Handler = Box<dyn Fn(&ConnectionHandle, &Packet) + Send + Sync>;


/// Builder of a handler registry, handlers can only be registered before the registry
/// is built and shared.
pub struct RegistryBuilder {
    handlers: Vec<Option<Handler>>,
}

impl RegistryBuilder {

    pub fn new() -> Self {
        Self { handlers: (0..256).map(|_| None).collect() }
    }

    /// Register the handler for the given packet id, replacing any previous one.
    pub fn on<F>(mut self, id: u8, handler: F) -> Self
    where
        F: Fn(&ConnectionHandle, &Packet) + Send + Sync + 'static,
    {
        self.handlers[id as usize] = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> Registry {
        Registry { handlers: self.handlers.into_boxed_slice() }
    }

}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}


/// Immutable table of packet handlers indexed by packet id.
pub struct Registry {
    handlers: Box<[Option<Handler>]>,
}

impl Registry {

    /// A registry without any handler.
    pub fn empty() -> Self {
        RegistryBuilder::new().build()
    }

    /// Return true if a handler is registered for this packet id.
    pub fn has_handler(&self, id: u8) -> bool {
        self.handlers[id as usize].is_some()
    }

    /// Invoke the handler of the packet, synchronously. Packets without handler are 
    /// ignored with a diagnostic.
    pub fn handle(&self, conn: &ConnectionHandle, packet: &Packet) {
        match &self.handlers[packet.id() as usize] {
            Some(handler) => handler(conn, packet),
            None => debug!("no handler for packet {:#04X} on connection #{}", packet.id(), conn.id()),
        }
    }

}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = self.handlers.iter()
            .enumerate()
            .filter(|(_, handler)| handler.is_some())
            .map(|(id, _)| id);
        f.debug_set().entries(ids).finish()
    }
}


#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::connection::ConnectionHandle;
    use crate::proto::{Packet, KeepAlivePacket};
    use super::*;

    #[test]
    fn dispatch_by_id() {

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ = Arc::clone(&calls);

        let registry = RegistryBuilder::new()
            .on(0x00, move |_, packet| {
                assert!(matches!(packet, Packet::KeepAlive(KeepAlivePacket { id: 7 })));
                calls_.fetch_add(1, Ordering::Relaxed);
            })
            .build();

        assert!(registry.has_handler(0x00));
        assert!(!registry.has_handler(0x03));

        let conn = ConnectionHandle::detached("test");
        registry.handle(&conn, &Packet::KeepAlive(KeepAlivePacket { id: 7 }));
        // No handler, ignored.
        registry.handle(&conn, &Packet::chat("hello"));
        assert_eq!(calls.load(Ordering::Relaxed), 1);

    }

}
