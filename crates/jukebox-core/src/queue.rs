//! Play queue
//!
//! FIFO of songs waiting to play once the current song ends. The queue is
//! shared between the command path and the render-exit path, so every
//! operation goes through one internal lock.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{ Mutex, MutexGuard, PoisonError };

use rand::seq::SliceRandom;

use crate::library::{ Library, Song };


/// Outcome of replacing the queue from a list of paths.
#[derive( Debug, Clone, Default, PartialEq, Eq )]
pub struct QueueUpdate {
    /// Number of songs now in the queue
    pub applied: usize,
    /// Paths that are no longer in the library
    pub skipped: Vec<PathBuf>,
}


/// Thread-safe queue of pending songs.
#[derive( Debug, Default )]
pub struct PlayQueue {
    songs: Mutex<VecDeque<Song>>,
}


impl PlayQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }


    fn lock( &self ) -> MutexGuard<'_, VecDeque<Song>> {
        self.songs.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Adds a song to the end of the queue.
    pub fn enqueue( &self, song: Song ) {
        self.lock().push_back( song );
    }


    /// Removes and returns the song at the front of the queue.
    pub fn try_dequeue_front( &self ) -> Option<Song> {
        self.lock().pop_front()
    }


    /// Clears the queue.
    pub fn clear( &self ) {
        self.lock().clear();
    }


    /// Replaces the queue contents with the given songs, in order.
    pub fn replace_all( &self, songs: impl IntoIterator<Item = Song> ) {
        let songs: VecDeque<Song> = songs.into_iter().collect();
        *self.lock() = songs;
    }


    /// Replaces the queue with the songs found at `paths`.
    ///
    /// Paths missing from the library are skipped; the remaining entries are
    /// still applied in order.
    pub fn replace_paths( &self, paths: &[PathBuf], library: &Library ) -> QueueUpdate {
        let mut update = QueueUpdate::default();
        let mut songs = VecDeque::with_capacity( paths.len() );

        for path in paths {
            match library.by_path( path ) {
                Some( song ) => songs.push_back( song.clone() ),
                None => {
                    tracing::warn!( "Queue entry not in library, skipping: {:?}", path );
                    update.skipped.push( path.clone() );
                }
            }
        }

        update.applied = songs.len();
        *self.lock() = songs;
        update
    }


    /// Shuffles the queue into a uniformly random order.
    pub fn shuffle( &self ) {
        let mut songs = self.lock();
        songs.make_contiguous().shuffle( &mut rand::thread_rng() );
    }


    /// Replaces every queued copy of a song (matched by id) with new metadata.
    ///
    /// @returns true if any entry changed
    pub fn update_song( &self, song: &Song ) -> bool {
        let mut changed = false;
        for queued in self.lock().iter_mut() {
            if queued.id == song.id && queued != song {
                *queued = song.clone();
                changed = true;
            }
        }
        changed
    }


    /// Returns the queue contents in order.
    pub fn snapshot( &self ) -> Vec<Song> {
        self.lock().iter().cloned().collect()
    }


    pub fn len( &self ) -> usize {
        self.lock().len()
    }


    pub fn is_empty( &self ) -> bool {
        self.lock().is_empty()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use crate::library::SongId;


    fn song( id: u64 ) -> Song {
        Song::from_path( SongId( id ), PathBuf::from( format!( "/music/{}.mp3", id ) ) )
    }


    fn ids( songs: &[Song] ) -> Vec<u64> {
        songs.iter().map( |s| s.id.0 ).collect()
    }


    #[test]
    fn test_fifo_order() {
        let queue = PlayQueue::new();
        queue.enqueue( song( 1 ) );
        queue.enqueue( song( 2 ) );
        queue.enqueue( song( 3 ) );

        assert_eq!( queue.try_dequeue_front().unwrap().id, SongId( 1 ) );
        assert_eq!( ids( &queue.snapshot() ), vec![ 2, 3 ] );
    }


    #[test]
    fn test_dequeue_empty() {
        let queue = PlayQueue::new();
        assert!( queue.try_dequeue_front().is_none() );
        assert!( queue.is_empty() );
    }


    #[test]
    fn test_clear_and_replace() {
        let queue = PlayQueue::new();
        queue.enqueue( song( 1 ) );
        queue.clear();
        assert!( queue.is_empty() );

        queue.replace_all( vec![ song( 5 ), song( 4 ) ] );
        assert_eq!( ids( &queue.snapshot() ), vec![ 5, 4 ] );
    }


    #[test]
    fn test_shuffle_preserves_multiset() {
        let queue = PlayQueue::new();
        for id in 1..=50 {
            queue.enqueue( song( id ) );
        }
        queue.enqueue( song( 7 ) );

        queue.shuffle();

        let mut shuffled = ids( &queue.snapshot() );
        shuffled.sort();
        let mut expected: Vec<u64> = ( 1..=50 ).collect();
        expected.push( 7 );
        expected.sort();
        assert_eq!( shuffled, expected );
    }


    #[test]
    fn test_replace_paths_skips_missing() {
        let library = Library::from_songs( vec![ song( 1 ), song( 2 ) ] );
        let queue = PlayQueue::new();
        queue.enqueue( song( 9 ) );

        let update = queue.replace_paths(
            &[
                PathBuf::from( "/music/2.mp3" ),
                PathBuf::from( "/music/gone.mp3" ),
                PathBuf::from( "/music/1.mp3" ),
            ],
            &library,
        );

        assert_eq!( update.applied, 2 );
        assert_eq!( update.skipped, vec![ PathBuf::from( "/music/gone.mp3" ) ] );
        assert_eq!( ids( &queue.snapshot() ), vec![ 2, 1 ] );
    }


    #[test]
    fn test_update_song() {
        let queue = PlayQueue::new();
        queue.enqueue( song( 1 ) );
        queue.enqueue( song( 2 ) );

        let mut renamed = song( 2 );
        renamed.name = "Renamed".to_string();
        assert!( queue.update_song( &renamed ) );
        assert!( !queue.update_song( &renamed ) );
        assert_eq!( queue.snapshot()[ 1 ].name, "Renamed" );
    }


    #[test]
    fn test_concurrent_enqueue_dequeue() {
        let queue = Arc::new( PlayQueue::new() );
        let producers: Vec<_> = ( 0..4 ).map( |t| {
            let queue = Arc::clone( &queue );
            thread::spawn( move || {
                for i in 0..250 {
                    queue.enqueue( song( t * 1000 + i ) );
                }
            })
        }).collect();

        let consumer = {
            let queue = Arc::clone( &queue );
            thread::spawn( move || {
                let mut taken = 0;
                for _ in 0..500 {
                    if queue.try_dequeue_front().is_some() {
                        taken += 1;
                    }
                }
                taken
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let taken = consumer.join().unwrap();
        assert_eq!( taken + queue.len(), 1000 );
    }
}
