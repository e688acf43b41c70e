//! Last-state persistence
//!
//! On shutdown the current song and the queue are written to a small JSON
//! file; on the next start it is replayed and removed.

use std::fs;
use std::io::{ self, Write };
use std::path::{ Path, PathBuf };

use serde::{ Deserialize, Serialize };
use thiserror::Error;

use crate::library::Song;


/// Errors that can occur while saving state.
#[derive( Debug, Error )]
pub enum PersistenceError {
    #[error( "IO error: {0}" )]
    Io( #[from] io::Error ),

    #[error( "JSON error: {0}" )]
    Json( #[from] serde_json::Error ),
}


/// Snapshot of what was playing at shutdown.
#[derive( Debug, Clone, PartialEq, Default, Serialize, Deserialize )]
#[serde( rename_all = "camelCase" )]
pub struct LastState {
    pub current_song: Option<Song>,
    #[serde( default )]
    pub queue: Vec<Song>,
}


/// File-backed store for `LastState`.
#[derive( Debug, Clone )]
pub struct StateStore {
    path: PathBuf,
}


impl StateStore {
    pub fn new( path: impl Into<PathBuf> ) -> Self {
        Self { path: path.into() }
    }


    /// Gets the default state file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map( |d| d.join( "jukebox" ).join( "last_state.json" ) )
    }


    pub fn path( &self ) -> &Path {
        &self.path
    }


    /// Saves `current` and `queue`. With nothing current, any earlier
    /// snapshot is removed instead so it is not replayed.
    ///
    /// The file is written next to its final location and renamed into
    /// place, so a crash never leaves a half-written snapshot.
    pub fn save( &self, current: Option<&Song>, queue: &[Song] ) -> Result<(), PersistenceError> {
        let Some( current ) = current else {
            tracing::debug!( "Nothing playing, clearing saved state" );
            return self.discard();
        };

        if let Some( parent ) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all( parent )?;
            }
        }

        let state = LastState {
            current_song: Some( current.clone() ),
            queue: queue.to_vec(),
        };
        let json = serde_json::to_vec_pretty( &state )?;

        let tmp = self.path.with_extension( "json.tmp" );
        {
            let mut file = fs::File::create( &tmp )?;
            file.write_all( &json )?;
            file.sync_all()?;
        }
        fs::rename( &tmp, &self.path )?;

        tracing::info!( "Saved state: {} + {} queued", current, queue.len() );
        Ok(())
    }


    /// Loads the snapshot. A missing or unreadable file counts as absent.
    pub fn load( &self ) -> Option<LastState> {
        let contents = match fs::read_to_string( &self.path ) {
            Ok( contents ) => contents,
            Err( e ) if e.kind() == io::ErrorKind::NotFound => return None,
            Err( e ) => {
                tracing::warn!( "Failed to read state {:?}: {}", self.path, e );
                return None;
            }
        };

        match serde_json::from_str( &contents ) {
            Ok( state ) => Some( state ),
            Err( e ) => {
                tracing::warn!( "Ignoring corrupt state {:?}: {}", self.path, e );
                None
            }
        }
    }


    /// Removes the snapshot if there is one.
    pub fn discard( &self ) -> Result<(), PersistenceError> {
        match fs::remove_file( &self.path ) {
            Ok(()) => Ok(()),
            Err( e ) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err( e ) => Err( e.into() ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::library::SongId;


    fn song( id: u64 ) -> Song {
        Song::from_path( SongId( id ), PathBuf::from( format!( "/music/Band - Track {}.flac", id ) ) )
    }


    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new( dir.path().join( "state" ).join( "last_state.json" ) );

        store.save( Some( &song( 1 ) ), &[ song( 2 ), song( 3 ) ] ).unwrap();
        let state = store.load().unwrap();

        assert_eq!( state.current_song, Some( song( 1 ) ) );
        assert_eq!( state.queue, vec![ song( 2 ), song( 3 ) ] );
        assert!( !store.path().with_extension( "json.tmp" ).exists() );
    }


    #[test]
    fn test_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new( dir.path().join( "last_state.json" ) );
        store.save( Some( &song( 7 ) ), &[] ).unwrap();

        let value: serde_json::Value = serde_json::from_str( &fs::read_to_string( store.path() ).unwrap() ).unwrap();
        assert_eq!( value[ "currentSong" ][ "id" ], 7 );
        assert!( value[ "queue" ].as_array().unwrap().is_empty() );
    }


    #[test]
    fn test_save_without_current_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new( dir.path().join( "last_state.json" ) );

        store.save( Some( &song( 1 ) ), &[] ).unwrap();
        assert!( store.path().exists() );

        store.save( None, &[ song( 2 ) ] ).unwrap();
        assert!( !store.path().exists() );
        assert!( store.load().is_none() );
    }


    #[test]
    fn test_missing_and_corrupt_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new( dir.path().join( "last_state.json" ) );
        assert!( store.load().is_none() );

        fs::write( store.path(), "{ \"currentSong\": 12" ).unwrap();
        assert!( store.load().is_none() );
    }


    #[test]
    fn test_discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new( dir.path().join( "last_state.json" ) );
        store.discard().unwrap();
        store.save( Some( &song( 1 ) ), &[] ).unwrap();
        store.discard().unwrap();
        store.discard().unwrap();
        assert!( !store.path().exists() );
    }
}
