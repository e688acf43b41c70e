//! In-memory backend for engine tests. Nothing is spawned; tests drive
//! output and exit signals by hand.

use std::sync::atomic::{ AtomicBool, AtomicU8, Ordering };
use std::sync::mpsc::Sender;
use std::sync::{ Arc, Mutex };
use std::time::Duration;

use super::mixer::{ VolumeError, VolumeRange };
use super::{ RenderBackend, RenderError, RenderHandle, RenderId, RenderSignal, RenderTarget };
use crate::status::{ PlaybackProgress, ProgressFormat };


#[derive( Default )]
struct Shared {
    started: Vec<( RenderId, RenderTarget )>,
    stopped: Vec<RenderId>,
    /// Targets whose start should fail
    broken: Vec<RenderTarget>,
    /// Signal channel handed to the latest start
    signals: Option<Sender<RenderSignal>>,
}


/// Records starts and stops; cheap to clone so the test keeps a handle
/// after moving one into the engine.
#[derive( Clone, Default )]
pub struct FakeBackend {
    shared: Arc<Mutex<Shared>>,
    raw_volume: Arc<AtomicU8>,
    volume_broken: Arc<AtomicBool>,
}


impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }


    pub fn break_target( &self, target: RenderTarget ) {
        self.shared.lock().unwrap().broken.push( target );
    }


    pub fn break_volume( &self ) {
        self.volume_broken.store( true, Ordering::SeqCst );
    }


    pub fn started( &self ) -> Vec<( RenderId, RenderTarget )> {
        self.shared.lock().unwrap().started.clone()
    }


    pub fn stopped( &self ) -> Vec<RenderId> {
        self.shared.lock().unwrap().stopped.clone()
    }


    /// Id of the most recently started renderer.
    pub fn last_id( &self ) -> RenderId {
        self.shared.lock().unwrap().started.last().map( |( id, _ )| *id ).unwrap()
    }


    /// Sends `signal` through the engine's channel, the way a renderer
    /// thread would.
    pub fn send( &self, signal: RenderSignal ) {
        let shared = self.shared.lock().unwrap();
        shared.signals.as_ref().unwrap().send( signal ).unwrap();
    }


    pub fn raw_volume( &self ) -> u8 {
        self.raw_volume.load( Ordering::SeqCst )
    }
}


struct FakeHandle {
    id: RenderId,
    running: bool,
    shared: Arc<Mutex<Shared>>,
}


impl RenderHandle for FakeHandle {
    fn id( &self ) -> RenderId {
        self.id
    }


    fn is_running( &self ) -> bool {
        self.running
    }


    fn stop( &mut self, _timeout: Duration ) {
        if self.running {
            self.running = false;
            self.shared.lock().unwrap().stopped.push( self.id );
        }
    }
}


impl RenderBackend for FakeBackend {
    fn start(
        &self,
        id: RenderId,
        target: &RenderTarget,
        signals: Sender<RenderSignal>,
    ) -> Result<Box<dyn RenderHandle>, RenderError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.broken.contains( target ) {
            return Err( RenderError::Spawn {
                program: "fake".to_string(),
                source: std::io::Error::new( std::io::ErrorKind::NotFound, "broken target" ),
            });
        }
        shared.started.push(( id, target.clone() ));
        shared.signals = Some( signals );
        Ok( Box::new( FakeHandle { id, running: true, shared: Arc::clone( &self.shared ) } ) )
    }


    fn parse_progress( &self, line: &str ) -> Option<PlaybackProgress> {
        ProgressFormat::Bracketed.parse( line )
    }


    fn volume( &self ) -> Result<u8, VolumeError> {
        if self.volume_broken.load( Ordering::SeqCst ) {
            return Err( VolumeError::Unsupported( "fake" ) );
        }
        Ok( self.raw_volume.load( Ordering::SeqCst ) )
    }


    fn set_volume( &self, raw: u8 ) -> Result<(), VolumeError> {
        if self.volume_broken.load( Ordering::SeqCst ) {
            return Err( VolumeError::Failed { program: "fake".to_string(), stderr: "no mixer".to_string() } );
        }
        self.raw_volume.store( raw, Ordering::SeqCst );
        Ok(())
    }


    fn volume_range( &self ) -> VolumeRange {
        VolumeRange::new( 40, 100 )
    }


    fn sweep_orphans( &self ) {}


    fn probe( &self ) -> Result<(), RenderError> {
        Ok(())
    }
}
