//! Library snapshot and scanning
//!
//! The library is owned outside the engine: it hands out immutable snapshots
//! of `Song` records, which the engine looks up by id or by path.

use std::collections::HashMap;
use std::fmt;
use std::path::{ Path, PathBuf };
use std::str::FromStr;

use serde::{ Deserialize, Serialize };
use thiserror::Error;
use walkdir::WalkDir;


/// Supported audio file extensions.
const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "wav", "m4a", "aac", "opus", "wma", "aiff", "alac",
];


/// Errors that can occur during library operations.
#[derive( Debug, Error )]
pub enum LibraryError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Path not found: {0}" )]
    NotFound( PathBuf ),

    #[error( "Walk error: {0}" )]
    Walk( #[from] walkdir::Error ),
}


/// Stable song identifier, unique within a library snapshot.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize )]
#[serde( transparent )]
pub struct SongId( pub u64 );


impl SongId {
    /// Id carried by synthetic records (streams) that have no library entry.
    pub const UNASSIGNED: SongId = SongId( 0 );


    pub fn is_assigned( self ) -> bool {
        self != Self::UNASSIGNED
    }
}


impl fmt::Display for SongId {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        write!( f, "{}", self.0 )
    }
}


/// A playable song as known to the library.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
#[serde( rename_all = "camelCase" )]
pub struct Song {
    pub id: SongId,
    pub path: PathBuf,
    pub name: String,
    pub artist: String,
    pub album: String,
}


impl Song {
    /// Builds a song record from a file path, deriving display fields from it.
    ///
    /// `Artist - Title.ext` yields artist and title; the parent directory
    /// name becomes the album.
    pub fn from_path( id: SongId, path: PathBuf ) -> Self {
        let stem = path.file_stem()
            .map( |s| s.to_string_lossy().into_owned() )
            .unwrap_or_default();

        let ( artist, name ) = match stem.split_once( " - " ) {
            Some(( artist, name )) => ( artist.trim().to_string(), name.trim().to_string() ),
            None => ( String::new(), stem.trim().to_string() ),
        };

        let album = path.parent()
            .and_then( |p| p.file_name() )
            .map( |s| s.to_string_lossy().into_owned() )
            .unwrap_or_default();

        Self { id, path, name, artist, album }
    }


    /// Builds the placeholder record shown while an internet stream plays.
    pub fn stream_placeholder( url: &url::Url ) -> Self {
        Self {
            id: SongId::UNASSIGNED,
            path: PathBuf::from( url.as_str() ),
            name: url.host_str().unwrap_or( "stream" ).to_string(),
            artist: "Internet Radio".to_string(),
            album: String::new(),
        }
    }


    /// Returns true if this record stands in for a stream rather than a file.
    pub fn is_stream( &self ) -> bool {
        !self.id.is_assigned()
    }
}


impl fmt::Display for Song {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        if self.artist.is_empty() {
            write!( f, "{}", self.name )
        } else {
            write!( f, "{} - {}", self.artist, self.name )
        }
    }
}


/// Reference to a song as given by a client: either its id or its path.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum SongRef {
    Id( SongId ),
    Path( PathBuf ),
}


impl FromStr for SongRef {
    type Err = std::convert::Infallible;


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<u64>() {
            Ok( id ) => Ok( SongRef::Id( SongId( id ) ) ),
            Err( _ ) => Ok( SongRef::Path( PathBuf::from( s ) ) ),
        }
    }
}


/// Immutable snapshot of the music library.
#[derive( Debug, Clone, Default )]
pub struct Library {
    songs: Vec<Song>,
    by_id: HashMap<SongId, usize>,
    by_path: HashMap<PathBuf, usize>,
}


impl Library {
    /// Creates an empty library.
    pub fn new() -> Self {
        Self::default()
    }


    /// Builds a snapshot from a list of songs. Later duplicates of an id or
    /// path are dropped.
    pub fn from_songs( songs: impl IntoIterator<Item = Song> ) -> Self {
        let mut library = Self::new();
        for song in songs {
            if library.by_id.contains_key( &song.id ) || library.by_path.contains_key( &song.path ) {
                tracing::warn!( "Duplicate library entry ignored: {:?}", song.path );
                continue;
            }
            let index = library.songs.len();
            library.by_id.insert( song.id, index );
            library.by_path.insert( song.path.clone(), index );
            library.songs.push( song );
        }
        library
    }


    /// Gets all songs in library order.
    pub fn songs( &self ) -> &[Song] {
        &self.songs
    }


    pub fn len( &self ) -> usize {
        self.songs.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.songs.is_empty()
    }


    /// Looks up a song by id.
    pub fn by_id( &self, id: SongId ) -> Option<&Song> {
        self.by_id.get( &id ).map( |&i| &self.songs[ i ] )
    }


    /// Looks up a song by path.
    pub fn by_path( &self, path: &Path ) -> Option<&Song> {
        self.by_path.get( path ).map( |&i| &self.songs[ i ] )
    }


    /// Resolves a client reference against this snapshot.
    pub fn resolve( &self, song: &SongRef ) -> Option<&Song> {
        match song {
            SongRef::Id( id ) => self.by_id( *id ),
            SongRef::Path( path ) => self.by_path( path ),
        }
    }


    /// Returns a new snapshot with one song's metadata replaced.
    ///
    /// Returns None if no song with that id exists.
    pub fn with_updated( &self, song: Song ) -> Option<Self> {
        self.by_id( song.id )?;
        let songs = self.songs.iter()
            .map( |s| if s.id == song.id { song.clone() } else { s.clone() } );
        Some( Self::from_songs( songs ) )
    }
}


/// Library scanner for discovering audio files.
pub struct LibraryScanner {
    roots: Vec<PathBuf>,
}


impl LibraryScanner {
    /// Creates a new scanner with no root directories.
    pub fn new() -> Self {
        Self { roots: Vec::new() }
    }


    /// Adds a root directory to scan.
    pub fn add_root( &mut self, path: PathBuf ) {
        if !self.roots.contains( &path ) {
            self.roots.push( path );
        }
    }


    /// Scans all roots and builds a library snapshot.
    ///
    /// Ids are assigned in sorted path order starting at 1, so a rescan of
    /// an unchanged tree yields the same ids.
    pub fn scan( &self ) -> Result<Library, LibraryError> {
        let mut paths = Vec::new();

        for root in &self.roots {
            tracing::info!( "Scanning: {:?}", root );
            self.scan_root( root, &mut paths )?;
        }

        paths.sort();
        paths.dedup();

        tracing::info!( "Found {} songs", paths.len() );

        let songs = paths.into_iter()
            .enumerate()
            .map( |( i, path )| Song::from_path( SongId( i as u64 + 1 ), path ) );

        Ok( Library::from_songs( songs ) )
    }


    fn scan_root( &self, root: &Path, paths: &mut Vec<PathBuf> ) -> Result<(), LibraryError> {
        if !root.exists() {
            return Err( LibraryError::NotFound( root.to_path_buf() ) );
        }

        for entry in WalkDir::new( root ).follow_links( true ) {
            let entry = match entry {
                Ok( e ) => e,
                Err( e ) if e.io_error().map( |io| io.kind() ) == Some( std::io::ErrorKind::PermissionDenied ) => {
                    tracing::warn!( "Access denied: {:?}", e.path() );
                    continue;
                }
                Err( e ) => return Err( LibraryError::Walk( e ) ),
            };

            if entry.file_type().is_file() && Self::is_audio_file( entry.path() ) {
                paths.push( entry.into_path() );
            }
        }

        Ok(())
    }


    /// Checks if a file has a supported audio extension.
    fn is_audio_file( path: &Path ) -> bool {
        path.extension()
            .and_then( |e| e.to_str() )
            .map( |e| SUPPORTED_EXTENSIONS.contains( &e.to_lowercase().as_str() ) )
            .unwrap_or( false )
    }
}


impl Default for LibraryScanner {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;


    fn song( id: u64, path: &str ) -> Song {
        Song::from_path( SongId( id ), PathBuf::from( path ) )
    }


    #[test]
    fn test_song_from_path_splits_artist() {
        let s = song( 1, "/music/Blue Train/John Coltrane - Moment's Notice.flac" );
        assert_eq!( s.artist, "John Coltrane" );
        assert_eq!( s.name, "Moment's Notice" );
        assert_eq!( s.album, "Blue Train" );
    }


    #[test]
    fn test_song_from_path_without_artist() {
        let s = song( 2, "/music/loose/untitled.mp3" );
        assert_eq!( s.artist, "" );
        assert_eq!( s.name, "untitled" );
        assert_eq!( s.to_string(), "untitled" );
    }


    #[test]
    fn test_song_ref_parse() {
        assert_eq!( "42".parse::<SongRef>().unwrap(), SongRef::Id( SongId( 42 ) ) );
        assert_eq!(
            "/music/a.mp3".parse::<SongRef>().unwrap(),
            SongRef::Path( PathBuf::from( "/music/a.mp3" ) )
        );
    }


    #[test]
    fn test_lookup_by_id_and_path() {
        let library = Library::from_songs( vec![ song( 1, "/m/a.mp3" ), song( 2, "/m/b.mp3" ) ] );
        assert_eq!( library.by_id( SongId( 2 ) ).unwrap().path, PathBuf::from( "/m/b.mp3" ) );
        assert_eq!( library.by_path( Path::new( "/m/a.mp3" ) ).unwrap().id, SongId( 1 ) );
        assert!( library.by_id( SongId( 3 ) ).is_none() );
    }


    #[test]
    fn test_duplicates_dropped() {
        let library = Library::from_songs( vec![ song( 1, "/m/a.mp3" ), song( 1, "/m/b.mp3" ) ] );
        assert_eq!( library.len(), 1 );
    }


    #[test]
    fn test_with_updated() {
        let library = Library::from_songs( vec![ song( 1, "/m/a.mp3" ) ] );
        let mut renamed = library.by_id( SongId( 1 ) ).unwrap().clone();
        renamed.name = "Renamed".to_string();

        let updated = library.with_updated( renamed ).unwrap();
        assert_eq!( updated.by_id( SongId( 1 ) ).unwrap().name, "Renamed" );
        assert!( library.with_updated( song( 9, "/m/z.mp3" ) ).is_none() );
    }


    #[test]
    fn test_scan_assigns_sorted_ids() {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join( "Album" );
        fs::create_dir_all( &album ).unwrap();
        fs::write( album.join( "B - two.mp3" ), b"" ).unwrap();
        fs::write( album.join( "A - one.flac" ), b"" ).unwrap();
        fs::write( album.join( "cover.jpg" ), b"" ).unwrap();

        let mut scanner = LibraryScanner::new();
        scanner.add_root( dir.path().to_path_buf() );
        let library = scanner.scan().unwrap();

        assert_eq!( library.len(), 2 );
        assert_eq!( library.by_id( SongId( 1 ) ).unwrap().name, "one" );
        assert_eq!( library.by_id( SongId( 2 ) ).unwrap().artist, "B" );
    }


    #[test]
    fn test_scan_missing_root() {
        let mut scanner = LibraryScanner::new();
        scanner.add_root( PathBuf::from( "/definitely/not/here" ) );
        assert!( matches!( scanner.scan(), Err( LibraryError::NotFound( _ ) ) ) );
    }
}
