//! Packet-id dispatch
//!
//! Inbound frames are decoded just far enough to learn their packet id on
//! the network side. The matching handler is then queued together with the
//! packet, so handler code only ever runs on the simulation thread.

use crate::error::ServerError;
use crate::scheduler::DeferredQueue;
use log::warn;
use shared::{ClientPacket, Packet, PacketError};
use std::collections::HashMap;
use std::sync::Arc;

/// Handler for one inbound packet kind. Receives the simulation, the sender's
/// slot id and the packet positioned just after its id.
pub type PacketHandler<S> =
    Arc<dyn Fn(&mut S, u32, &mut Packet) -> Result<(), PacketError> + Send + Sync>;

pub struct HandlerTable<S> {
    handlers: HashMap<ClientPacket, PacketHandler<S>>,
}

impl<S> Default for HandlerTable<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> HandlerTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: ClientPacket, handler: F) -> &mut Self
    where
        F: Fn(&mut S, u32, &mut Packet) -> Result<(), PacketError> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn get(&self, kind: ClientPacket) -> Option<&PacketHandler<S>> {
        self.handlers.get(&kind)
    }

    /// Fails on the first inbound packet kind without a handler
    pub fn verify(&self) -> Result<(), ServerError> {
        match ClientPacket::ALL
            .into_iter()
            .find(|kind| !self.handlers.contains_key(kind))
        {
            Some(missing) => Err(ServerError::MissingHandler(missing)),
            None => Ok(()),
        }
    }
}

/// Turns complete frames into deferred handler calls
pub struct Dispatcher<S> {
    handlers: HandlerTable<S>,
    queue: Arc<DeferredQueue<S>>,
}

impl<S: 'static> Dispatcher<S> {
    pub fn new(handlers: HandlerTable<S>, queue: Arc<DeferredQueue<S>>) -> Self {
        Self { handlers, queue }
    }

    pub fn queue(&self) -> &Arc<DeferredQueue<S>> {
        &self.queue
    }

    /// Looks up the handler for `frame` and queues it for the simulation
    /// thread. Unknown ids come back as an error for the caller to log; the
    /// frame is dropped.
    pub fn dispatch(&self, slot: u32, frame: Vec<u8>) -> Result<ClientPacket, ServerError> {
        let mut packet = Packet::from_bytes(&frame);
        let kind = ClientPacket::try_from(packet.read_i32()?)?;
        let handler = Arc::clone(
            self.handlers
                .get(kind)
                .ok_or(ServerError::MissingHandler(kind))?,
        );

        self.queue.enqueue(move |sim: &mut S| {
            if let Err(e) = handler(sim, slot, &mut packet) {
                warn!("Dropped {:?} from slot {}: {}", kind, slot, e);
            }
        });
        Ok(kind)
    }

    /// Dispatches a frame, logging instead of returning failures
    pub fn dispatch_or_log(&self, slot: u32, frame: Vec<u8>) {
        if let Err(e) = self.dispatch(slot, frame) {
            warn!("Ignoring packet from slot {}: {}", slot, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(u32, ClientPacket, i32)>,
    }

    fn recording_table() -> HandlerTable<Recorder> {
        let mut table = HandlerTable::new();
        table
            .register(ClientPacket::WelcomeReceived, |r: &mut Recorder, slot, p: &mut Packet| {
                r.seen.push((slot, ClientPacket::WelcomeReceived, p.read_i32()?));
                Ok(())
            })
            .register(ClientPacket::PlayerMovement, |r: &mut Recorder, slot, p: &mut Packet| {
                r.seen.push((slot, ClientPacket::PlayerMovement, p.read_i32()?));
                Ok(())
            });
        table
    }

    fn frame(id: i32, value: Option<i32>) -> Vec<u8> {
        let mut packet = Packet::with_id(id);
        if let Some(v) = value {
            packet.write_i32(v);
        }
        packet.into_bytes()
    }

    #[test]
    fn test_verify_reports_missing_handler() {
        let mut table = HandlerTable::<Recorder>::new();
        table.register(ClientPacket::WelcomeReceived, |_, _, _| Ok(()));
        match table.verify() {
            Err(ServerError::MissingHandler(kind)) => {
                assert_eq!(kind, ClientPacket::PlayerMovement)
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_ok!(recording_table().verify());
    }

    #[test]
    fn test_dispatch_defers_until_drain() {
        let queue = Arc::new(DeferredQueue::new());
        let dispatcher = Dispatcher::new(recording_table(), Arc::clone(&queue));

        assert_eq!(
            dispatcher.dispatch(4, frame(2, Some(99))).unwrap(),
            ClientPacket::PlayerMovement
        );
        assert_ok!(dispatcher.dispatch(2, frame(1, Some(5))));

        let mut recorder = Recorder::default();
        assert!(recorder.seen.is_empty());

        let mut scratch = Vec::new();
        assert_eq!(queue.drain(&mut scratch, &mut recorder), 2);
        assert_eq!(
            recorder.seen,
            vec![
                (4, ClientPacket::PlayerMovement, 99),
                (2, ClientPacket::WelcomeReceived, 5)
            ]
        );
    }

    #[test]
    fn test_unknown_packet_id_is_dropped() {
        let queue = Arc::new(DeferredQueue::new());
        let dispatcher = Dispatcher::new(recording_table(), Arc::clone(&queue));

        match dispatcher.dispatch(1, frame(42, Some(1))) {
            Err(ServerError::UnknownPacketId(42)) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
        assert_err!(dispatcher.dispatch(1, vec![1, 0]));
        dispatcher.dispatch_or_log(1, frame(-7, None));
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_handler_decode_error_does_not_stop_drain() {
        let queue = Arc::new(DeferredQueue::new());
        let dispatcher = Dispatcher::new(recording_table(), Arc::clone(&queue));

        // Missing payload: the handler hits a decode underrun
        assert_ok!(dispatcher.dispatch(1, frame(1, None)));
        assert_ok!(dispatcher.dispatch(1, frame(1, Some(8))));

        let mut recorder = Recorder::default();
        let mut scratch = Vec::new();
        assert_eq!(queue.drain(&mut scratch, &mut recorder), 2);
        assert_eq!(recorder.seen, vec![(1, ClientPacket::WelcomeReceived, 8)]);
    }
}
