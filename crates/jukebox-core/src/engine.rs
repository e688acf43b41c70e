//! Playback engine
//!
//! The engine owns the single renderer slot, the play queue and the player
//! status. Client commands and renderer signals both go through one engine
//! lock, so deciding "is something playing" and acting on it happen
//! atomically.

use std::path::PathBuf;
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::sync::mpsc::{ self, Sender };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak };
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::events::{ EngineEvent, EventBroadcaster, Subscription };
use crate::library::{ Library, Song, SongRef };
use crate::persistence::{ PersistenceError, StateStore };
use crate::queue::{ PlayQueue, QueueUpdate };
use crate::render::{
    ProcessBackend, RenderBackend, RenderError, RenderHandle, RenderId, RenderSignal,
    RenderTarget, VolumeError,
};
use crate::status::PlayerStatus;


/// URL schemes accepted for streams.
const STREAM_SCHEMES: &[&str] = &[ "http", "https", "rtsp", "mms" ];

/// Render id meaning "no renderer".
const NO_RENDER: RenderId = 0;


/// Errors returned by engine operations.
#[derive( Debug, Error )]
pub enum EngineError {
    #[error( "Renderer error: {0}" )]
    Render( #[from] RenderError ),

    #[error( "Volume error: {0}" )]
    Volume( #[from] VolumeError ),

    #[error( "Invalid stream URL: {0}" )]
    InvalidStream( String ),

    #[error( "Persistence error: {0}" )]
    Persistence( #[from] PersistenceError ),
}


/// Engine state machine.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Serialize )]
#[serde( rename_all = "snake_case" )]
pub enum EngineState {
    /// Nothing current, no renderer
    Idle,
    /// A song is current and its renderer is alive
    Playing,
    /// Stopped by the user; the last song is kept for resume
    Stopped,
}


/// Engine tuning.
#[derive( Debug, Clone )]
pub struct EngineOptions {
    /// How long `stop` waits for the renderer before killing it
    pub stop_timeout: Duration,
}


impl Default for EngineOptions {
    fn default() -> Self {
        Self { stop_timeout: Duration::from_secs( 3 ) }
    }
}


impl From<&Config> for EngineOptions {
    fn from( config: &Config ) -> Self {
        Self { stop_timeout: config.stop_timeout() }
    }
}


/// A song together with what the renderer is given for it.
#[derive( Debug, Clone )]
struct NowPlaying {
    song: Song,
    target: RenderTarget,
}


impl NowPlaying {
    fn song( song: Song ) -> Self {
        let target = RenderTarget::File( song.path.clone() );
        Self { song, target }
    }
}


/// State guarded by the engine lock.
struct EngineCore {
    state: EngineState,
    current: Option<NowPlaying>,
    /// Song remembered by `stop` for `resume_play`
    stopped: Option<NowPlaying>,
    process: Option<Box<dyn RenderHandle>>,
}


/// Status plus the renderer whose output may update it.
struct StatusSlot {
    render: RenderId,
    status: PlayerStatus,
}


struct EngineInner {
    backend: Box<dyn RenderBackend>,
    core: Mutex<EngineCore>,
    queue: PlayQueue,
    status: Mutex<StatusSlot>,
    events: EventBroadcaster,
    library: RwLock<Arc<Library>>,
    signals: Sender<RenderSignal>,
    /// Set while a renderer is being spawned
    starting: AtomicBool,
    next_id: AtomicU64,
    stop_timeout: Duration,
}


/// The playback engine. One instance exists per running service.
pub struct PlaybackEngine {
    inner: Arc<EngineInner>,
}


impl PlaybackEngine {
    /// Creates an engine using the process backend described by `config`.
    pub fn from_config( config: &Config, library: Library ) -> Self {
        let backend = ProcessBackend::new( &config.renderer, &config.mixer );
        Self::new( Box::new( backend ), library, EngineOptions::from( config ) )
    }


    /// Creates an engine around `backend`.
    ///
    /// Renderers leaked by an earlier run are swept before anything starts.
    pub fn new( backend: Box<dyn RenderBackend>, library: Library, options: EngineOptions ) -> Self {
        backend.sweep_orphans();

        let ( tx, rx ) = mpsc::channel::<RenderSignal>();

        let inner = Arc::new( EngineInner {
            backend,
            core: Mutex::new( EngineCore {
                state: EngineState::Idle,
                current: None,
                stopped: None,
                process: None,
            }),
            queue: PlayQueue::new(),
            status: Mutex::new( StatusSlot { render: NO_RENDER, status: PlayerStatus::empty() } ),
            events: EventBroadcaster::new(),
            library: RwLock::new( Arc::new( library ) ),
            signals: tx,
            starting: AtomicBool::new( false ),
            next_id: AtomicU64::new( NO_RENDER + 1 ),
            stop_timeout: options.stop_timeout,
        });

        // The dispatcher only holds a weak reference, so dropping the engine
        // ends it once the last renderer thread lets go of its sender.
        let weak: Weak<EngineInner> = Arc::downgrade( &inner );
        thread::spawn( move || {
            for signal in rx {
                match weak.upgrade() {
                    Some( inner ) => inner.handle_signal( signal ),
                    None => break,
                }
            }
            tracing::debug!( "Render signal dispatcher exiting" );
        });

        Self { inner }
    }


    /// Stops whatever is playing and plays `song`.
    ///
    /// If the renderer cannot start, the song is skipped and queued songs
    /// are tried in turn; the start error is still returned.
    pub fn play_song( &self, song: Song ) -> Result<(), EngineError> {
        let mut core = self.inner.lock_core();
        self.inner.start_playback( &mut core, NowPlaying::song( song ) )?;
        Ok(())
    }


    /// Queues `song` behind the current one, or plays it right away if
    /// nothing is playing.
    pub fn enqueue_song( &self, song: Song ) -> Result<(), EngineError> {
        let mut core = self.inner.lock_core();

        if core.state == EngineState::Playing {
            tracing::info!( "Queued: {}", song );
            self.inner.queue.enqueue( song );
            self.inner.publish_queue();
            Ok(())
        } else {
            self.inner.start_playback( &mut core, NowPlaying::song( song ) )?;
            Ok(())
        }
    }


    /// Plays an internet stream.
    pub fn play_stream( &self, url: &str ) -> Result<(), EngineError> {
        let url = parse_stream_url( url )?;
        let item = NowPlaying {
            song: Song::stream_placeholder( &url ),
            target: RenderTarget::Stream( url ),
        };

        let mut core = self.inner.lock_core();
        self.inner.start_playback( &mut core, item )?;
        Ok(())
    }


    /// Stops playback, remembering the song for `resume_play`.
    pub fn stop( &self ) {
        let mut core = self.inner.lock_core();
        self.inner.stop_locked( &mut core );
    }


    /// Restarts the song that was stopped, or the queue head if there is
    /// none.
    ///
    /// @returns true if playback started
    pub fn resume_play( &self ) -> Result<bool, EngineError> {
        let mut core = self.inner.lock_core();

        let state = core.state;
        let next = match state {
            EngineState::Playing => None,
            EngineState::Stopped if core.stopped.is_some() => core.stopped.take(),
            _ => self.inner.queue.try_dequeue_front().map( NowPlaying::song ),
        };

        match next {
            Some( item ) => {
                self.inner.start_playback( &mut core, item )?;
                Ok( true )
            }
            None => Ok( false ),
        }
    }


    /// Stops the current song and plays the queue head.
    ///
    /// @returns true if a queued song started
    pub fn skip_to_next( &self ) -> Result<bool, EngineError> {
        let mut core = self.inner.lock_core();
        self.inner.stop_locked( &mut core );

        match self.inner.queue.try_dequeue_front() {
            Some( song ) => {
                self.inner.start_playback( &mut core, NowPlaying::song( song ) )?;
                Ok( true )
            }
            None => Ok( false ),
        }
    }


    /// Empties the queue.
    pub fn clear_queue( &self ) {
        let _core = self.inner.lock_core();
        self.inner.queue.clear();
        self.inner.publish_queue();
    }


    /// Shuffles the queue. The current song is not affected.
    pub fn shuffle_queue( &self ) {
        let _core = self.inner.lock_core();
        self.inner.queue.shuffle();
        self.inner.publish_queue();
    }


    /// Replaces the queue with the library songs at `paths`, skipping paths
    /// no longer in the library.
    pub fn update_queue( &self, paths: &[PathBuf] ) -> QueueUpdate {
        let library = self.library();
        let _core = self.inner.lock_core();
        let update = self.inner.queue.replace_paths( paths, &library );
        self.inner.publish_queue();
        update
    }


    /// Sets the output volume. `level` is clamped to 0-100 and mapped onto
    /// the backend's usable range.
    ///
    /// @returns the applied level
    pub fn set_volume( &self, level: i32 ) -> Result<u8, EngineError> {
        let level = level.clamp( 0, 100 ) as u8;
        let raw = self.inner.backend.volume_range().to_raw( level );
        self.inner.backend.set_volume( raw )?;

        tracing::info!( "Volume: {} (raw {})", level, raw );
        self.inner.events.publish( EngineEvent::VolumeChanged { level } );
        Ok( level )
    }


    /// Reads the output volume as a client level (0-100).
    pub fn volume( &self ) -> Result<u8, EngineError> {
        let raw = self.inner.backend.volume()?;
        Ok( self.inner.backend.volume_range().to_level( raw ) )
    }


    /// Checks that the renderer and mixer programs are installed.
    pub fn probe( &self ) -> Result<(), EngineError> {
        self.inner.backend.probe()?;
        Ok(())
    }


    /// Handles a renderer notification. Called by the dispatcher thread.
    pub fn handle_signal( &self, signal: RenderSignal ) {
        self.inner.handle_signal( signal );
    }


    /// Gets the current status snapshot.
    pub fn status( &self ) -> PlayerStatus {
        self.inner.lock_status().status.clone()
    }


    pub fn state( &self ) -> EngineState {
        self.inner.lock_core().state
    }


    /// True while a renderer is being started or has not yet exited.
    pub fn is_still_playing( &self ) -> bool {
        self.inner.starting.load( Ordering::Acquire )
            || self.inner.lock_status().status.progress.still_playing
    }


    pub fn queue_snapshot( &self ) -> Vec<Song> {
        self.inner.queue.snapshot()
    }


    /// Subscribes a client to engine events.
    pub fn subscribe( &self ) -> Subscription {
        self.inner.events.subscribe()
    }


    /// Gets the current library snapshot.
    pub fn library( &self ) -> Arc<Library> {
        Arc::clone( &self.inner.library.read().unwrap_or_else( PoisonError::into_inner ) )
    }


    /// Replaces the library snapshot, e.g. after a rescan.
    pub fn set_library( &self, library: Library ) {
        tracing::info!( "Library updated: {} songs", library.len() );
        *self.inner.library.write().unwrap_or_else( PoisonError::into_inner ) = Arc::new( library );
    }


    /// Resolves a client reference against the current library.
    pub fn resolve( &self, song: &SongRef ) -> Option<Song> {
        self.library().resolve( song ).cloned()
    }


    /// Reflects changed metadata for a library song everywhere the engine
    /// holds a copy of it.
    pub fn apply_metadata_update( &self, song: Song ) {
        {
            let mut library = self.inner.library.write().unwrap_or_else( PoisonError::into_inner );
            if let Some( updated ) = library.with_updated( song.clone() ) {
                *library = Arc::new( updated );
            }
        }

        let mut guard = self.inner.lock_core();
        let core = &mut *guard;
        for item in [ core.current.as_mut(), core.stopped.as_mut() ].into_iter().flatten() {
            if item.song.id == song.id && !item.song.is_stream() {
                item.song = song.clone();
            }
        }

        {
            let mut slot = self.inner.lock_status();
            if let Some( current ) = slot.status.current_song.as_mut() {
                if current.id == song.id && !current.is_stream() {
                    *current = song.clone();
                }
            }
        }

        if self.inner.queue.update_song( &song ) {
            self.inner.publish_queue();
        }
    }


    /// Writes the current song and queue to `store`, or removes a stale
    /// snapshot if nothing is playing.
    pub fn save_state( &self, store: &StateStore ) -> Result<(), EngineError> {
        let core = self.inner.lock_core();
        let current = match core.state {
            EngineState::Playing => core.current.as_ref().map( |c| c.song.clone() ),
            _ => None,
        };
        let queue = self.inner.queue.snapshot();
        drop( core );

        store.save( current.as_ref(), &queue )?;
        Ok(())
    }


    /// Replays a saved snapshot: plays its current song, then queues the
    /// rest in order. The snapshot is removed afterwards.
    ///
    /// @returns true if a snapshot was found
    pub fn restore_state( &self, store: &StateStore ) -> bool {
        let Some( last ) = store.load() else {
            return false;
        };

        tracing::info!(
            "Restoring last state: {} + {} queued",
            last.current_song.as_ref().map( |s| s.to_string() ).unwrap_or_else( || "nothing".into() ),
            last.queue.len()
        );

        let library = self.library();
        let refresh = |song: Song| -> Song {
            library.by_path( &song.path ).cloned().unwrap_or( song )
        };

        if let Some( current ) = last.current_song {
            let result = if current.is_stream() {
                self.play_stream( &current.path.to_string_lossy() )
            } else {
                self.play_song( refresh( current ) )
            };
            if let Err( e ) = result {
                tracing::warn!( "Failed to resume last song: {}", e );
            }
        }

        for song in last.queue {
            if let Err( e ) = self.enqueue_song( refresh( song ) ) {
                tracing::warn!( "Failed to restore queued song: {}", e );
            }
        }

        if let Err( e ) = store.discard() {
            tracing::warn!( "Failed to remove restored state: {}", e );
        }
        true
    }


    /// Saves state to `store` and stops the renderer.
    pub fn shutdown( &self, store: &StateStore ) {
        if let Err( e ) = self.save_state( store ) {
            tracing::error!( "Failed to save state: {}", e );
        }

        let mut core = self.inner.lock_core();
        self.inner.halt_process( &mut core );
        tracing::info!( "Engine shut down" );
    }
}


impl Drop for PlaybackEngine {
    fn drop( &mut self ) {
        let mut core = self.inner.lock_core();
        self.inner.halt_process( &mut core );
    }
}


impl EngineInner {
    fn lock_core( &self ) -> MutexGuard<'_, EngineCore> {
        self.core.lock().unwrap_or_else( PoisonError::into_inner )
    }


    fn lock_status( &self ) -> MutexGuard<'_, StatusSlot> {
        self.status.lock().unwrap_or_else( PoisonError::into_inner )
    }


    fn set_status( &self, render: RenderId, status: PlayerStatus ) {
        *self.lock_status() = StatusSlot { render, status };
    }


    fn publish_queue( &self ) {
        if self.events.subscriber_count() == 0 {
            return;
        }
        self.events.publish( EngineEvent::QueueChanged { queue: self.queue.snapshot() } );
    }


    /// Terminates the renderer, if any. Its output no longer reaches the
    /// status from here on.
    fn halt_process( &self, core: &mut EngineCore ) {
        self.lock_status().render = NO_RENDER;
        if let Some( mut process ) = core.process.take() {
            process.stop( self.stop_timeout );
        }
    }


    /// Starts `first`. While starts fail, queued songs are tried in turn;
    /// if none starts the engine goes idle.
    ///
    /// @returns the first start error, if any
    fn start_playback( &self, core: &mut EngineCore, first: NowPlaying ) -> Result<(), RenderError> {
        let mut next = Some( first );
        let mut first_error = None;

        while let Some( item ) = next.take() {
            self.halt_process( core );
            core.current = None;

            let id = self.next_id.fetch_add( 1, Ordering::Relaxed );
            self.starting.store( true, Ordering::Release );

            match self.backend.start( id, &item.target, self.signals.clone() ) {
                Ok( process ) => {
                    core.process = Some( process );
                    core.state = EngineState::Playing;
                    core.stopped = None;
                    self.set_status( id, PlayerStatus::started( item.song.clone() ) );
                    self.starting.store( false, Ordering::Release );

                    tracing::info!( "Playing: {} ({})", item.song, item.target );
                    self.events.publish( EngineEvent::SongStarted { song: item.song.clone() } );
                    core.current = Some( item );

                    return first_error.map_or( Ok(()), Err );
                }
                Err( e ) => {
                    self.starting.store( false, Ordering::Release );
                    tracing::warn!( "Unplayable, skipping {}: {}", item.target, e );
                    if first_error.is_none() {
                        first_error = Some( e );
                    }
                    next = self.queue.try_dequeue_front().map( NowPlaying::song );
                }
            }
        }

        self.go_idle( core );
        first_error.map_or( Ok(()), Err )
    }


    fn go_idle( &self, core: &mut EngineCore ) {
        self.halt_process( core );
        core.state = EngineState::Idle;
        core.current = None;
        core.stopped = None;
        self.set_status( NO_RENDER, PlayerStatus::empty() );

        tracing::info!( "Idle" );
        self.events.publish( EngineEvent::Stopped );
    }


    fn stop_locked( &self, core: &mut EngineCore ) {
        if core.state != EngineState::Playing {
            return;
        }

        self.halt_process( core );
        core.stopped = core.current.take();
        core.state = EngineState::Stopped;

        let mut status = PlayerStatus::empty();
        status.current_song = core.stopped.as_ref().map( |s| s.song.clone() );
        self.set_status( NO_RENDER, status );

        tracing::info!( "Stopped" );
        self.events.publish( EngineEvent::Stopped );
    }


    fn handle_signal( &self, signal: RenderSignal ) {
        match signal {
            RenderSignal::Output { id, line } => self.on_output( id, &line ),
            RenderSignal::Exited { id, code } => self.on_exit( id, code ),
        }
    }


    /// Updates progress from one output line. Never blocks on the engine
    /// lock.
    fn on_output( &self, id: RenderId, line: &str ) {
        let Some( progress ) = self.backend.parse_progress( line ) else {
            tracing::trace!( "Unparsed renderer output: {:?}", line );
            return;
        };

        let mut slot = self.lock_status();
        if slot.render == id && slot.status.current_song.is_some() {
            slot.status.progress = progress;
        }
    }


    /// Advances to the next queued song when the renderer ends on its own,
    /// whether it finished or crashed.
    fn on_exit( &self, id: RenderId, code: Option<i32> ) {
        let mut core = self.lock_core();

        if core.process.as_ref().map( |p| p.id() ) != Some( id ) {
            tracing::debug!( "Ignoring exit of stale renderer {}", id );
            return;
        }

        match code {
            Some( 0 ) => tracing::debug!( "Renderer {} finished", id ),
            code => tracing::warn!( "Renderer {} exited with {:?}", id, code ),
        }

        self.halt_process( &mut core );
        core.current = None;

        match self.queue.try_dequeue_front() {
            Some( song ) => {
                // Start failures are logged and skipped inside
                let _ = self.start_playback( &mut core, NowPlaying::song( song ) );
            }
            None => self.go_idle( &mut core ),
        }
    }
}


/// Validates a stream URL before anything is spawned for it.
fn parse_stream_url( input: &str ) -> Result<Url, EngineError> {
    let url = Url::parse( input.trim() )
        .map_err( |e| EngineError::InvalidStream( format!( "{}: {}", input, e ) ) )?;

    if !STREAM_SCHEMES.contains( &url.scheme() ) {
        return Err( EngineError::InvalidStream( format!( "unsupported scheme '{}'", url.scheme() ) ) );
    }
    if url.host_str().map_or( true, str::is_empty ) {
        return Err( EngineError::InvalidStream( format!( "{}: missing host", input ) ) );
    }

    Ok( url )
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::library::SongId;
    use crate::render::fake::FakeBackend;


    fn song( id: u64 ) -> Song {
        Song::from_path( SongId( id ), PathBuf::from( format!( "/music/Artist - Song {}.mp3", id ) ) )
    }


    fn engine() -> ( PlaybackEngine, FakeBackend ) {
        let backend = FakeBackend::new();
        let library = Library::from_songs( ( 1..=5 ).map( song ) );
        let engine = PlaybackEngine::new( Box::new( backend.clone() ), library, EngineOptions::default() );
        ( engine, backend )
    }


    fn exit( engine: &PlaybackEngine, backend: &FakeBackend ) {
        engine.handle_signal( RenderSignal::Exited { id: backend.last_id(), code: Some( 0 ) } );
    }


    fn drain( rx: &mut Subscription ) -> Vec<EngineEvent> {
        std::iter::from_fn( || rx.try_recv().ok() ).collect()
    }


    fn current( engine: &PlaybackEngine ) -> Option<SongId> {
        engine.status().current_song.map( |s| s.id )
    }


    fn queued( engine: &PlaybackEngine ) -> Vec<u64> {
        engine.queue_snapshot().iter().map( |s| s.id.0 ).collect()
    }


    #[test]
    fn test_initial_state_idle() {
        let ( engine, _ ) = engine();
        assert_eq!( engine.state(), EngineState::Idle );
        assert!( engine.status().current_song.is_none() );
        assert!( !engine.is_still_playing() );
    }


    #[test]
    fn test_play_song_sets_current() {
        let ( engine, backend ) = engine();
        for id in 1..=3 {
            engine.play_song( song( id ) ).unwrap();
            assert_eq!( current( &engine ), Some( SongId( id ) ) );
            assert!( engine.is_still_playing() );
        }

        // Each play stopped the previous renderer
        assert_eq!( backend.stopped().len(), 2 );
        assert_eq!( engine.state(), EngineState::Playing );
    }


    #[test]
    fn test_enqueue_while_idle_plays() {
        let ( engine, backend ) = engine();
        engine.enqueue_song( song( 1 ) ).unwrap();

        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
        assert!( engine.queue_snapshot().is_empty() );
        assert_eq!( backend.started().len(), 1 );
    }


    #[test]
    fn test_enqueue_while_playing_appends() {
        let ( engine, _ ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();
        engine.enqueue_song( song( 3 ) ).unwrap();

        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
        assert_eq!( queued( &engine ), vec![ 2, 3 ] );
    }


    #[test]
    fn test_exit_advances_queue() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();
        engine.enqueue_song( song( 3 ) ).unwrap();

        exit( &engine, &backend );

        assert_eq!( current( &engine ), Some( SongId( 2 ) ) );
        assert_eq!( queued( &engine ), vec![ 3 ] );
    }


    #[test]
    fn test_exit_with_empty_queue_goes_idle() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        exit( &engine, &backend );

        assert_eq!( engine.state(), EngineState::Idle );
        assert!( engine.status().current_song.is_none() );
        assert!( !engine.status().progress.still_playing );
        assert!( !engine.is_still_playing() );
    }


    #[test]
    fn test_crash_handled_like_completion() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();

        engine.handle_signal( RenderSignal::Exited { id: backend.last_id(), code: Some( 139 ) } );
        assert_eq!( current( &engine ), Some( SongId( 2 ) ) );
    }


    #[test]
    fn test_stale_exit_ignored() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        let old = backend.last_id();
        engine.play_song( song( 2 ) ).unwrap();

        engine.handle_signal( RenderSignal::Exited { id: old, code: Some( 0 ) } );
        assert_eq!( current( &engine ), Some( SongId( 2 ) ) );
        assert_eq!( engine.state(), EngineState::Playing );
    }


    #[test]
    fn test_event_sequence_through_queue() {
        let ( engine, backend ) = engine();
        let mut rx = engine.subscribe();

        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();
        engine.enqueue_song( song( 3 ) ).unwrap();
        exit( &engine, &backend );
        exit( &engine, &backend );

        assert_eq!( current( &engine ), Some( SongId( 3 ) ) );
        assert!( engine.queue_snapshot().is_empty() );

        exit( &engine, &backend );

        assert_eq!( drain( &mut rx ), vec![
            EngineEvent::Connected,
            EngineEvent::SongStarted { song: song( 1 ) },
            EngineEvent::QueueChanged { queue: vec![ song( 2 ) ] },
            EngineEvent::QueueChanged { queue: vec![ song( 2 ), song( 3 ) ] },
            EngineEvent::SongStarted { song: song( 2 ) },
            EngineEvent::SongStarted { song: song( 3 ) },
            EngineEvent::Stopped,
        ]);
    }


    #[test]
    fn test_stop_then_resume_replays_same_song() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();

        engine.stop();
        assert_eq!( engine.state(), EngineState::Stopped );
        assert!( !engine.is_still_playing() );
        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );

        assert!( engine.resume_play().unwrap() );
        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
        assert_eq!( queued( &engine ), vec![ 2 ] );
        assert_eq!( backend.started().len(), 2 );
    }


    #[test]
    fn test_stop_renderer_exit_does_not_advance() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();
        let id = backend.last_id();

        engine.stop();
        engine.handle_signal( RenderSignal::Exited { id, code: None } );

        assert_eq!( engine.state(), EngineState::Stopped );
        assert_eq!( queued( &engine ), vec![ 2 ] );
    }


    #[test]
    fn test_enqueue_while_stopped_plays() {
        let ( engine, _ ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.stop();

        engine.enqueue_song( song( 4 ) ).unwrap();
        assert_eq!( current( &engine ), Some( SongId( 4 ) ) );
        assert_eq!( engine.state(), EngineState::Playing );
    }


    #[test]
    fn test_resume_from_idle_uses_queue_or_noops() {
        let ( engine, _ ) = engine();
        assert!( !engine.resume_play().unwrap() );
        assert_eq!( engine.state(), EngineState::Idle );
    }


    #[test]
    fn test_skip_to_next() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();

        assert!( engine.skip_to_next().unwrap() );
        assert_eq!( current( &engine ), Some( SongId( 2 ) ) );
        assert_eq!( backend.stopped().len(), 1 );

        // Nothing left: stays stopped on song 2
        assert!( !engine.skip_to_next().unwrap() );
        assert_eq!( engine.state(), EngineState::Stopped );
        assert_eq!( current( &engine ), Some( SongId( 2 ) ) );
    }


    #[test]
    fn test_unplayable_song_advances_queue() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();
        engine.enqueue_song( song( 3 ) ).unwrap();
        backend.break_target( RenderTarget::File( song( 2 ).path ) );

        exit( &engine, &backend );

        assert_eq!( current( &engine ), Some( SongId( 3 ) ) );
        assert!( engine.queue_snapshot().is_empty() );
    }


    #[test]
    fn test_play_unplayable_reports_error_and_goes_idle() {
        let ( engine, backend ) = engine();
        backend.break_target( RenderTarget::File( song( 1 ).path ) );
        let mut rx = engine.subscribe();

        let result = engine.play_song( song( 1 ) );
        assert!( matches!( result, Err( EngineError::Render( _ ) ) ) );
        assert_eq!( engine.state(), EngineState::Idle );
        assert!( !engine.is_still_playing() );
        assert_eq!( drain( &mut rx ), vec![ EngineEvent::Connected, EngineEvent::Stopped ] );
    }


    #[test]
    fn test_many_unplayable_entries_do_not_recurse() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        for _ in 0..2_000 {
            engine.enqueue_song( song( 2 ) ).unwrap();
        }
        backend.break_target( RenderTarget::File( song( 2 ).path ) );

        exit( &engine, &backend );
        assert_eq!( engine.state(), EngineState::Idle );
        assert!( engine.queue_snapshot().is_empty() );
    }


    #[test]
    fn test_shuffle_keeps_current_and_multiset() {
        let ( engine, _ ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        for id in 2..=5 {
            engine.enqueue_song( song( id ) ).unwrap();
        }

        engine.shuffle_queue();

        let mut ids = queued( &engine );
        ids.sort();
        assert_eq!( ids, vec![ 2, 3, 4, 5 ] );
        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
    }


    #[test]
    fn test_update_queue_skips_missing_paths() {
        let ( engine, _ ) = engine();
        engine.play_song( song( 1 ) ).unwrap();

        let update = engine.update_queue( &[
            song( 3 ).path,
            PathBuf::from( "/music/removed.mp3" ),
            song( 2 ).path,
        ]);

        assert_eq!( update.applied, 2 );
        assert_eq!( update.skipped.len(), 1 );
        assert_eq!( queued( &engine ), vec![ 3, 2 ] );
        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
    }


    #[test]
    fn test_clear_queue() {
        let ( engine, _ ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();
        let mut rx = engine.subscribe();

        engine.clear_queue();
        assert!( engine.queue_snapshot().is_empty() );
        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
        assert_eq!( drain( &mut rx ), vec![
            EngineEvent::Connected,
            EngineEvent::QueueChanged { queue: vec![] },
        ]);
    }


    #[test]
    fn test_set_volume_clamps_and_maps() {
        let ( engine, backend ) = engine();
        let mut rx = engine.subscribe();

        assert_eq!( engine.set_volume( 150 ).unwrap(), 100 );
        assert_eq!( backend.raw_volume(), 100 );
        assert_eq!( engine.set_volume( 50 ).unwrap(), 50 );
        assert_eq!( backend.raw_volume(), 70 );
        assert_eq!( engine.volume().unwrap(), 50 );
        assert_eq!( engine.set_volume( -3 ).unwrap(), 0 );
        assert_eq!( backend.raw_volume(), 0 );

        assert_eq!( drain( &mut rx ), vec![
            EngineEvent::Connected,
            EngineEvent::VolumeChanged { level: 100 },
            EngineEvent::VolumeChanged { level: 50 },
            EngineEvent::VolumeChanged { level: 0 },
        ]);
    }


    #[test]
    fn test_volume_failure_leaves_state_alone() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        backend.break_volume();

        assert!( matches!( engine.set_volume( 20 ), Err( EngineError::Volume( _ ) ) ) );
        assert!( engine.volume().is_err() );
        assert_eq!( engine.state(), EngineState::Playing );
        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
    }


    #[test]
    fn test_play_stream() {
        let ( engine, backend ) = engine();
        engine.play_stream( "http://radio.example.org/live.mp3" ).unwrap();

        let status = engine.status();
        let current = status.current_song.unwrap();
        assert!( current.is_stream() );
        assert_eq!( current.name, "radio.example.org" );
        assert!( matches!( backend.started()[ 0 ].1, RenderTarget::Stream( _ ) ) );
    }


    #[test]
    fn test_play_stream_rejects_malformed_url() {
        let ( engine, backend ) = engine();
        for bad in [ "not a url", "file:///etc/passwd", "ftp://host/x", "http://" ] {
            assert!( matches!( engine.play_stream( bad ), Err( EngineError::InvalidStream( _ ) ) ), "{}", bad );
        }
        assert!( backend.started().is_empty() );
        assert_eq!( engine.state(), EngineState::Idle );
    }


    #[test]
    fn test_output_updates_progress() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        let id = backend.last_id();

        engine.handle_signal( RenderSignal::Output { id, line: "25% [00:00:30] [00:01:30]".into() } );
        let progress = engine.status().progress;
        assert_eq!( progress.elapsed, Duration::from_secs( 30 ) );
        assert!( ( progress.percent_complete - 0.25 ).abs() < 1e-9 );

        // Garbage leaves the last good progress in place
        engine.handle_signal( RenderSignal::Output { id, line: "buffering...".into() } );
        assert_eq!( engine.status().progress, progress );

        // Output from an old renderer is ignored
        engine.play_song( song( 2 ) ).unwrap();
        engine.handle_signal( RenderSignal::Output { id, line: "90% [00:09:00] [00:01:00]".into() } );
        assert_eq!( engine.status().progress.elapsed, Duration::ZERO );
    }


    #[test]
    fn test_metadata_update_reflected() {
        let ( engine, _ ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();

        let mut renamed = song( 1 );
        renamed.name = "Live Version".to_string();
        engine.apply_metadata_update( renamed.clone() );
        let mut renamed_queued = song( 2 );
        renamed_queued.album = "Deluxe".to_string();
        engine.apply_metadata_update( renamed_queued );

        assert_eq!( engine.status().current_song.unwrap().name, "Live Version" );
        assert_eq!( engine.queue_snapshot()[ 0 ].album, "Deluxe" );
        assert_eq!( engine.library().by_id( SongId( 1 ) ).unwrap(), &renamed );
    }


    #[test]
    fn test_resolve_by_id_and_path() {
        let ( engine, _ ) = engine();
        assert_eq!( engine.resolve( &SongRef::Id( SongId( 3 ) ) ), Some( song( 3 ) ) );
        assert_eq!( engine.resolve( &SongRef::Path( song( 4 ).path ) ), Some( song( 4 ) ) );
        assert_eq!( engine.resolve( &SongRef::Id( SongId( 99 ) ) ), None );

        engine.set_library( Library::new() );
        assert_eq!( engine.resolve( &SongRef::Id( SongId( 3 ) ) ), None );
    }


    #[test]
    fn test_save_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new( dir.path().join( "last_state.json" ) );

        {
            let ( engine, _ ) = engine();
            engine.play_song( song( 1 ) ).unwrap();
            engine.enqueue_song( song( 2 ) ).unwrap();
            engine.enqueue_song( song( 3 ) ).unwrap();
            engine.shutdown( &store );
        }
        assert!( store.path().exists() );

        let ( engine, _ ) = engine();
        assert!( engine.restore_state( &store ) );
        assert_eq!( current( &engine ), Some( SongId( 1 ) ) );
        assert_eq!( queued( &engine ), vec![ 2, 3 ] );
        assert!( !store.path().exists() );
    }


    #[test]
    fn test_save_when_idle_removes_stale_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new( dir.path().join( "last_state.json" ) );
        store.save( Some( &song( 1 ) ), &[] ).unwrap();

        let ( engine, _ ) = engine();
        engine.save_state( &store ).unwrap();
        assert!( !store.path().exists() );
        assert!( !engine.restore_state( &store ) );
    }


    /// Polls until `check` holds or two seconds pass.
    fn wait_for( check: impl Fn() -> bool ) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs( 2 );
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep( Duration::from_millis( 5 ) );
        }
        check()
    }


    #[test]
    fn test_from_config_reports_missing_renderer() {
        let mut config = Config::default();
        config.renderer.program = "definitely-not-a-real-renderer".to_string();

        let engine = PlaybackEngine::from_config( &config, Library::new() );
        assert!( matches!( engine.probe(), Err( EngineError::Render( RenderError::NotFound( _ ) ) ) ) );
        assert_eq!( engine.state(), EngineState::Idle );
    }


    #[test]
    fn test_renderer_exit_through_dispatcher_advances() {
        let ( engine, backend ) = engine();
        engine.play_song( song( 1 ) ).unwrap();
        engine.enqueue_song( song( 2 ) ).unwrap();
        let id = backend.last_id();

        // Oversized times must not take the dispatcher down
        backend.send( RenderSignal::Output {
            id,
            line: "50% [18446744073709551615] [18446744073709551615]".into(),
        });
        backend.send( RenderSignal::Exited { id, code: Some( 0 ) } );

        assert!( wait_for( || current( &engine ) == Some( SongId( 2 ) ) ) );
        assert!( engine.queue_snapshot().is_empty() );

        backend.send( RenderSignal::Exited { id: backend.last_id(), code: Some( 0 ) } );
        assert!( wait_for( || engine.state() == EngineState::Idle ) );
        assert!( engine.status().current_song.is_none() );
    }


    #[test]
    fn test_concurrent_enqueue_never_loses_songs() {
        let ( engine, _ ) = engine();
        let engine = Arc::new( engine );

        let workers: Vec<_> = ( 0..8 ).map( |_| {
            let engine = Arc::clone( &engine );
            thread::spawn( move || {
                for id in 1..=5 {
                    engine.enqueue_song( song( id ) ).unwrap();
                }
            })
        }).collect();
        for w in workers {
            w.join().unwrap();
        }

        // Exactly one enqueue started playback; the rest were queued
        assert_eq!( engine.state(), EngineState::Playing );
        assert_eq!( engine.queue_snapshot().len(), 39 );
    }
}
