//! Engine events and their fan-out to connected clients.

use std::sync::{ Mutex, MutexGuard, PoisonError };

use serde::Serialize;
use tokio::sync::mpsc::{ self, UnboundedReceiver, UnboundedSender };

use crate::library::Song;


/// Events emitted by the engine on every state transition.
#[derive( Debug, Clone, PartialEq, Serialize )]
#[serde( tag = "event", rename_all = "snake_case" )]
pub enum EngineEvent {
    /// First event on every new subscription, sent before any real event.
    Connected,
    SongStarted { song: Song },
    Stopped,
    QueueChanged { queue: Vec<Song> },
    VolumeChanged { level: u8 },
}


/// Receiving end of a client subscription.
pub type Subscription = UnboundedReceiver<EngineEvent>;


struct Subscriber {
    id: u64,
    tx: UnboundedSender<EngineEvent>,
}


#[derive( Default )]
struct Subscribers {
    next_id: u64,
    list: Vec<Subscriber>,
}


/// Delivers engine events to every connected client.
///
/// Each subscriber gets its own channel, so delivery order per client
/// matches publish order. A client whose channel is closed is removed once
/// the publish pass has finished.
#[derive( Default )]
pub struct EventBroadcaster {
    subscribers: Mutex<Subscribers>,
}


impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }


    fn lock( &self ) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Registers a new client and sends it the `Connected` event.
    pub fn subscribe( &self ) -> Subscription {
        let ( tx, rx ) = mpsc::unbounded_channel();
        // Cannot fail: the receiver is still in hand
        let _ = tx.send( EngineEvent::Connected );

        let mut subscribers = self.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.list.push( Subscriber { id, tx } );
        tracing::debug!( "Client {} subscribed, {} connected", id, subscribers.list.len() );

        rx
    }


    /// Publishes an event to all subscribers.
    ///
    /// @returns the number of subscribers the event was delivered to
    pub fn publish( &self, event: EngineEvent ) -> usize {
        let mut subscribers = self.lock();

        let mut dead = Vec::new();
        for subscriber in &subscribers.list {
            if subscriber.tx.send( event.clone() ).is_err() {
                dead.push( subscriber.id );
            }
        }

        if !dead.is_empty() {
            subscribers.list.retain( |s| !dead.contains( &s.id ) );
            tracing::debug!( "Removed {} disconnected clients", dead.len() );
        }

        subscribers.list.len()
    }


    /// Gets the number of registered subscribers.
    pub fn subscriber_count( &self ) -> usize {
        self.lock().list.len()
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_connected_first() {
        let events = EventBroadcaster::new();
        let mut rx = events.subscribe();
        events.publish( EngineEvent::Stopped );

        assert_eq!( rx.try_recv().unwrap(), EngineEvent::Connected );
        assert_eq!( rx.try_recv().unwrap(), EngineEvent::Stopped );
        assert!( rx.try_recv().is_err() );
    }


    #[test]
    fn test_fifo_per_subscriber() {
        let events = EventBroadcaster::new();
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        for level in 0..10 {
            events.publish( EngineEvent::VolumeChanged { level } );
        }

        for rx in [ &mut a, &mut b ] {
            assert_eq!( rx.try_recv().unwrap(), EngineEvent::Connected );
            for level in 0..10 {
                assert_eq!( rx.try_recv().unwrap(), EngineEvent::VolumeChanged { level } );
            }
        }
    }


    #[test]
    fn test_dead_subscriber_removed() {
        let events = EventBroadcaster::new();
        let mut alive = events.subscribe();
        let dropped = events.subscribe();
        drop( dropped );

        assert_eq!( events.subscriber_count(), 2 );
        assert_eq!( events.publish( EngineEvent::Stopped ), 1 );
        assert_eq!( events.subscriber_count(), 1 );

        assert_eq!( alive.try_recv().unwrap(), EngineEvent::Connected );
        assert_eq!( alive.try_recv().unwrap(), EngineEvent::Stopped );
    }


    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value( EngineEvent::VolumeChanged { level: 30 } ).unwrap();
        assert_eq!( json, serde_json::json!( { "event": "volume_changed", "level": 30 } ) );

        let json = serde_json::to_value( EngineEvent::Stopped ).unwrap();
        assert_eq!( json, serde_json::json!( { "event": "stopped" } ) );
    }
}
