//! Service configuration
//!
//! Loaded from `config.json` in the platform config directory. Every field
//! has a platform default, so a missing or partial file still yields a
//! working configuration.

use std::fs;
use std::path::{ Path, PathBuf };
use std::time::Duration;

use serde::{ Deserialize, Serialize };
use thiserror::Error;

use crate::persistence::StateStore;
use crate::render::{ MixerKind, VolumeRange };
use crate::status::ProgressFormat;


/// Errors that can occur while reading or writing the config file.
#[derive( Debug, Error )]
pub enum ConfigError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Invalid config: {0}" )]
    Parse( #[from] serde_json::Error ),
}


/// Renderer program and how to read its output.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct RendererConfig {
    pub program: String,
    /// Arguments; `{target}` is replaced by the song path or stream URL
    pub args: Vec<String>,
    pub progress_format: ProgressFormat,
}


impl Default for RendererConfig {
    fn default() -> Self {
        #[cfg( target_os = "windows" )]
        {
            Self {
                program: "cmdmp3".to_string(),
                args: vec![ "{target}".to_string() ],
                progress_format: ProgressFormat::Bracketed,
            }
        }
        #[cfg( target_os = "macos" )]
        {
            Self {
                program: "mplayer".to_string(),
                args: vec![ "-nolirc".to_string(), "-vo".to_string(), "null".to_string(), "{target}".to_string() ],
                progress_format: ProgressFormat::Mplayer,
            }
        }
        #[cfg( not( any( target_os = "windows", target_os = "macos" ) ) )]
        {
            Self {
                program: "mpg123".to_string(),
                args: vec![ "-v".to_string(), "{target}".to_string() ],
                progress_format: ProgressFormat::Mpg123,
            }
        }
    }
}


/// Volume helper settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct MixerConfig {
    pub kind: MixerKind,
    /// ALSA control name (amixer only)
    pub control: String,
    /// Raw level that client level 1 maps to
    pub floor: u8,
    /// Raw level that client level 100 maps to
    pub ceiling: u8,
    pub timeout_ms: u64,
}


impl MixerConfig {
    pub fn range( &self ) -> VolumeRange {
        VolumeRange::new( self.floor, self.ceiling )
    }


    pub fn timeout( &self ) -> Duration {
        Duration::from_millis( self.timeout_ms )
    }
}


impl Default for MixerConfig {
    fn default() -> Self {
        #[cfg( target_os = "windows" )]
        let ( kind, floor ) = ( MixerKind::Nircmd, 40 );
        #[cfg( target_os = "macos" )]
        let ( kind, floor ) = ( MixerKind::Osascript, 25 );
        #[cfg( not( any( target_os = "windows", target_os = "macos" ) ) )]
        let ( kind, floor ) = ( MixerKind::Amixer, 40 );

        Self {
            kind,
            control: "Master".to_string(),
            floor,
            ceiling: 100,
            timeout_ms: 2000,
        }
    }
}


/// Top-level configuration.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Config {
    pub renderer: RendererConfig,
    pub mixer: MixerConfig,
    /// How long `stop` waits for the renderer before killing it
    pub stop_timeout_ms: u64,
    /// Where the last playback state is kept across restarts
    pub state_file: Option<PathBuf>,
    pub library_roots: Vec<PathBuf>,
}


impl Default for Config {
    fn default() -> Self {
        Self {
            renderer: RendererConfig::default(),
            mixer: MixerConfig::default(),
            stop_timeout_ms: 3000,
            state_file: None,
            library_roots: dirs::audio_dir().into_iter().collect(),
        }
    }
}


impl Config {
    /// Returns the path to the default config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "jukebox" ).join( "config.json" ) )
    }


    /// Loads a config file. A missing file yields the defaults.
    pub fn load_from( path: &Path ) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!( "No config at {:?}, using defaults", path );
            return Ok( Self::default() );
        }
        let contents = fs::read_to_string( path )?;
        Ok( serde_json::from_str( &contents )? )
    }


    /// Loads the config at `path` (or the default location), falling back to
    /// defaults with a warning if it cannot be read.
    pub fn load( path: Option<&Path> ) -> Self {
        let path = match path.map( Path::to_path_buf ).or_else( Self::default_path ) {
            Some( p ) => p,
            None => return Self::default(),
        };

        match Self::load_from( &path ) {
            Ok( config ) => config,
            Err( e ) => {
                tracing::warn!( "Failed to load config {:?}: {}", path, e );
                Self::default()
            }
        }
    }


    /// Saves the config as pretty JSON, creating parent directories.
    pub fn save_to( &self, path: &Path ) -> Result<(), ConfigError> {
        if let Some( parent ) = path.parent() {
            fs::create_dir_all( parent )?;
        }
        fs::write( path, serde_json::to_string_pretty( self )? )?;
        Ok(())
    }


    pub fn stop_timeout( &self ) -> Duration {
        Duration::from_millis( self.stop_timeout_ms )
    }


    /// Resolves the state file location.
    pub fn state_file( &self ) -> PathBuf {
        self.state_file.clone()
            .or_else( StateStore::default_path )
            .unwrap_or_else( || PathBuf::from( "jukebox-state.json" ) )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from( &dir.path().join( "nope.json" ) ).unwrap();
        assert_eq!( config, Config::default() );
    }


    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "config.json" );
        fs::write( &path, r#"{ "mixer": { "floor": 30 }, "stop_timeout_ms": 500 }"# ).unwrap();

        let config = Config::load_from( &path ).unwrap();
        assert_eq!( config.mixer.floor, 30 );
        assert_eq!( config.mixer.ceiling, 100 );
        assert_eq!( config.stop_timeout(), Duration::from_millis( 500 ) );
        assert_eq!( config.renderer, RendererConfig::default() );
    }


    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "config.json" );
        fs::write( &path, "{ not json" ).unwrap();

        assert!( matches!( Config::load_from( &path ), Err( ConfigError::Parse( _ ) ) ) );
        assert_eq!( Config::load( Some( path.as_path() ) ), Config::default() );
    }


    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "nested" ).join( "config.json" );

        let mut config = Config::default();
        config.renderer.program = "/opt/bin/player".to_string();
        config.renderer.progress_format = ProgressFormat::Bracketed;
        config.state_file = Some( dir.path().join( "state.json" ) );
        config.save_to( &path ).unwrap();

        let loaded = Config::load_from( &path ).unwrap();
        assert_eq!( loaded, config );
        assert_eq!( loaded.state_file(), dir.path().join( "state.json" ) );
    }
}
