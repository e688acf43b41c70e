//! Command execution against the playback engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ anyhow, Result };
use serde_json::{ json, Value };

use jukebox_core::{
    command::{ self, Command },
    library::LibraryScanner,
    Library, PlaybackEngine, SongRef,
};


/// What the input loop should do after a command.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Flow {
    Continue,
    Quit,
}


/// Application state shared by the input loop.
#[derive( Clone )]
pub struct App {
    engine: Arc<PlaybackEngine>,
    roots: Vec<PathBuf>,
}


impl App {
    pub fn new( engine: Arc<PlaybackEngine>, roots: Vec<PathBuf> ) -> Self {
        Self { engine, roots }
    }


    pub fn engine( &self ) -> &Arc<PlaybackEngine> {
        &self.engine
    }


    /// Parses and runs one input line, printing the reply as a JSON line.
    /// Blocks while the engine works.
    pub fn execute_command( &self, input: &str ) -> Flow {
        if input.trim().is_empty() {
            return Flow::Continue;
        }

        match Command::parse( input ) {
            Ok( Command::Quit ) => {
                reply( json!({ "reply": "quit" }) );
                Flow::Quit
            }
            Ok( cmd ) => {
                match self.run_command( cmd ) {
                    Ok( value ) => reply( value ),
                    Err( e ) => {
                        tracing::warn!( "Command failed: {}", e );
                        reply( json!({ "error": e.to_string() }) );
                    }
                }
                Flow::Continue
            }
            Err( e ) => {
                reply( json!({ "error": e.to_string() }) );
                Flow::Continue
            }
        }
    }


    fn run_command( &self, cmd: Command ) -> Result<Value> {
        match cmd {
            Command::Play { song } => {
                let song = self.resolve( &song )?;
                self.engine.play_song( song )?;
                Ok( json!({ "reply": "ok" }) )
            }
            Command::Add { song } => {
                let song = self.resolve( &song )?;
                self.engine.enqueue_song( song )?;
                Ok( json!({ "reply": "ok" }) )
            }
            Command::Stream { url } => {
                self.engine.play_stream( &url )?;
                Ok( json!({ "reply": "ok" }) )
            }
            Command::Stop => {
                self.engine.stop();
                Ok( json!({ "reply": "ok" }) )
            }
            Command::Resume => {
                let started = self.engine.resume_play()?;
                Ok( json!({ "reply": "resume", "started": started }) )
            }
            Command::Next => {
                let started = self.engine.skip_to_next()?;
                Ok( json!({ "reply": "next", "started": started }) )
            }
            Command::Clear => {
                self.engine.clear_queue();
                Ok( json!({ "reply": "ok" }) )
            }
            Command::Shuffle => {
                self.engine.shuffle_queue();
                Ok( json!({ "reply": "ok" }) )
            }
            Command::Queue { paths } => {
                let update = self.engine.update_queue( &paths );
                Ok( json!({
                    "reply": "queue",
                    "applied": update.applied,
                    "skipped": update.skipped,
                }))
            }
            Command::Volume { level: Some( level ) } => {
                let level = self.engine.set_volume( level )?;
                Ok( json!({ "reply": "volume", "level": level }) )
            }
            Command::Volume { level: None } => {
                let level = self.engine.volume()?;
                Ok( json!({ "reply": "volume", "level": level }) )
            }
            Command::Status => {
                Ok( json!({
                    "reply": "status",
                    "state": self.engine.state(),
                    "stillPlaying": self.engine.is_still_playing(),
                    "status": self.engine.status(),
                    "queue": self.engine.queue_snapshot(),
                }))
            }
            Command::List => {
                let library = self.engine.library();
                Ok( json!({ "reply": "list", "songs": library.songs() }) )
            }
            Command::Rescan => {
                let library = scan_library( &self.roots )?;
                let count = library.len();
                self.engine.set_library( library );
                Ok( json!({ "reply": "rescan", "songs": count }) )
            }
            Command::Help => Ok( json!({ "reply": "help", "text": command::help_text() }) ),
            Command::Quit => Ok( json!({ "reply": "quit" }) ),
        }
    }


    fn resolve( &self, song: &SongRef ) -> Result<jukebox_core::Song> {
        self.engine.resolve( song ).ok_or_else( || match song {
            SongRef::Id( id ) => anyhow!( "Unknown song id: {}", id ),
            SongRef::Path( path ) => anyhow!( "Song not in library: {}", path.display() ),
        })
    }
}


/// Scans `roots` into a fresh library snapshot.
pub fn scan_library( roots: &[PathBuf] ) -> Result<Library> {
    let mut scanner = LibraryScanner::new();
    for root in roots {
        scanner.add_root( root.clone() );
    }
    let library = scanner.scan()?;
    tracing::info!( "Scanned {} songs from {} root(s)", library.len(), roots.len() );
    Ok( library )
}


/// Writes one JSON line to stdout.
pub fn reply( value: Value ) {
    println!( "{}", value );
}
