//! External renderer control
//!
//! Audio output is produced by an external program, one instance per song
//! or stream. A `RenderBackend` is the platform strategy chosen at startup:
//! it knows how to start the renderer, read its progress lines, and drive
//! the volume side-channel.

pub mod backend;
pub mod mixer;
pub mod process;

#[cfg( test )]
pub( crate ) mod fake;

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::status::PlaybackProgress;

pub use backend::ProcessBackend;
pub use mixer::{ Mixer, MixerKind, VolumeError, VolumeRange };
pub use process::RenderProcess;


/// Identifies one renderer instance. Never reused within an engine.
pub type RenderId = u64;


/// Errors that can occur while starting or probing a renderer.
#[derive( Debug, Error )]
pub enum RenderError {
    #[error( "Failed to start {program}: {source}" )]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error( "Executable not found: {0}" )]
    NotFound( String ),
}


/// What a renderer is asked to play.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum RenderTarget {
    File( PathBuf ),
    Stream( Url ),
}


impl RenderTarget {
    /// Returns the target as a command-line argument.
    pub fn as_arg( &self ) -> OsString {
        match self {
            RenderTarget::File( path ) => path.clone().into_os_string(),
            RenderTarget::Stream( url ) => OsString::from( url.as_str() ),
        }
    }
}


impl fmt::Display for RenderTarget {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        match self {
            RenderTarget::File( path ) => write!( f, "{}", path.display() ),
            RenderTarget::Stream( url ) => write!( f, "{}", url ),
        }
    }
}


/// Asynchronous notifications from a running renderer.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum RenderSignal {
    /// One line of stdout or stderr output
    Output { id: RenderId, line: String },
    /// The process ended without being asked to stop
    Exited { id: RenderId, code: Option<i32> },
}


/// Handle to one running renderer.
pub trait RenderHandle: Send {
    fn id( &self ) -> RenderId;

    fn is_running( &self ) -> bool;

    /// Stops the renderer, waiting at most `timeout` before forcing it.
    /// Safe to call repeatedly and after the process has exited.
    fn stop( &mut self, timeout: Duration );
}


/// Platform strategy for rendering and volume control.
pub trait RenderBackend: Send + Sync {
    /// Starts a renderer for `target`. Output and exit are reported on
    /// `signals` tagged with `id`.
    fn start(
        &self,
        id: RenderId,
        target: &RenderTarget,
        signals: Sender<RenderSignal>,
    ) -> Result<Box<dyn RenderHandle>, RenderError>;

    /// Parses one renderer output line.
    fn parse_progress( &self, line: &str ) -> Option<PlaybackProgress>;

    /// Reads the raw mixer level.
    fn volume( &self ) -> Result<u8, VolumeError>;

    /// Sets the raw mixer level.
    fn set_volume( &self, raw: u8 ) -> Result<(), VolumeError>;

    /// Usable raw range that client levels 1-100 are spread across.
    fn volume_range( &self ) -> VolumeRange;

    /// Kills renderer processes left behind by an earlier run.
    fn sweep_orphans( &self );

    /// Checks that the required executables are present.
    fn probe( &self ) -> Result<(), RenderError>;
}
