//! Jukebox Core - Playback engine
//!
//! This crate provides the playback engine of the household audio
//! controller: the render process supervisor, play queue, status tracking,
//! event fan-out, last-state persistence and library scanning.

pub mod command;
pub mod config;
pub mod engine;
pub mod events;
pub mod library;
pub mod persistence;
pub mod queue;
pub mod render;
pub mod status;

pub use command::{ Command, CommandError };
pub use config::{ Config, ConfigError };
pub use engine::{ EngineError, EngineOptions, EngineState, PlaybackEngine };
pub use events::{ EngineEvent, EventBroadcaster, Subscription };
pub use library::{ Library, LibraryError, LibraryScanner, Song, SongId, SongRef };
pub use persistence::{ LastState, PersistenceError, StateStore };
pub use queue::{ PlayQueue, QueueUpdate };
pub use render::{ ProcessBackend, RenderBackend, RenderError, RenderTarget };
pub use status::{ PlaybackProgress, PlayerStatus, ProgressFormat };
