//! Process-based render backend
//!
//! Starts the configured renderer program for each target and drives the
//! configured mixer helper for volume.

use std::ffi::OsString;
use std::sync::mpsc::Sender;

use super::mixer::{ Mixer, VolumeError, VolumeRange };
use super::process::{ self, RenderProcess };
use super::{ RenderBackend, RenderError, RenderHandle, RenderId, RenderSignal, RenderTarget };
use crate::config::{ MixerConfig, RendererConfig };
use crate::status::{ PlaybackProgress, ProgressFormat };


/// Placeholder in renderer arguments replaced by the target.
const TARGET_PLACEHOLDER: &str = "{target}";


/// Render backend that spawns an external player per target.
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    format: ProgressFormat,
    mixer: Mixer,
    range: VolumeRange,
}


impl ProcessBackend {
    pub fn new( renderer: &RendererConfig, mixer: &MixerConfig ) -> Self {
        Self {
            program: renderer.program.clone(),
            args: renderer.args.clone(),
            format: renderer.progress_format,
            mixer: Mixer::new( mixer.kind, mixer.control.clone(), mixer.timeout() ),
            range: mixer.range(),
        }
    }


    /// Builds the argument list for `target`. The target is appended when
    /// no argument mentions the placeholder.
    fn target_args( &self, target: &RenderTarget ) -> Vec<OsString> {
        let target_arg = target.as_arg();
        let mut substituted = false;

        let mut args: Vec<OsString> = self.args.iter()
            .map( |arg| {
                if arg == TARGET_PLACEHOLDER {
                    substituted = true;
                    target_arg.clone()
                } else if arg.contains( TARGET_PLACEHOLDER ) {
                    substituted = true;
                    OsString::from( arg.replace( TARGET_PLACEHOLDER, &target_arg.to_string_lossy() ) )
                } else {
                    OsString::from( arg )
                }
            })
            .collect();

        if !substituted {
            args.push( target_arg );
        }
        args
    }
}


impl RenderBackend for ProcessBackend {
    fn start(
        &self,
        id: RenderId,
        target: &RenderTarget,
        signals: Sender<RenderSignal>,
    ) -> Result<Box<dyn RenderHandle>, RenderError> {
        let args = self.target_args( target );
        let process = RenderProcess::spawn( id, &self.program, &args, signals )?;
        Ok( Box::new( process ) )
    }


    fn parse_progress( &self, line: &str ) -> Option<PlaybackProgress> {
        self.format.parse( line )
    }


    fn volume( &self ) -> Result<u8, VolumeError> {
        self.mixer.get()
    }


    fn set_volume( &self, raw: u8 ) -> Result<(), VolumeError> {
        self.mixer.set( raw )
    }


    fn volume_range( &self ) -> VolumeRange {
        self.range
    }


    fn sweep_orphans( &self ) {
        process::sweep_orphans( &self.program );
    }


    fn probe( &self ) -> Result<(), RenderError> {
        for program in [ self.program.as_str(), self.mixer.kind().program() ] {
            match process::find_program( program ) {
                Some( path ) => tracing::debug!( "Found {} at {:?}", program, path ),
                None => return Err( RenderError::NotFound( program.to_string() ) ),
            }
        }
        Ok(())
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::path::PathBuf;


    fn backend( args: &[ &str ] ) -> ProcessBackend {
        let renderer = RendererConfig {
            program: "player".to_string(),
            args: args.iter().map( |s| s.to_string() ).collect(),
            progress_format: ProgressFormat::Bracketed,
        };
        ProcessBackend::new( &renderer, &MixerConfig::default() )
    }


    #[test]
    fn test_placeholder_substituted() {
        let args = backend( &[ "-v", "{target}" ] )
            .target_args( &RenderTarget::File( PathBuf::from( "/m/a b.mp3" ) ) );
        assert_eq!( args, vec![ OsString::from( "-v" ), OsString::from( "/m/a b.mp3" ) ] );
    }


    #[test]
    fn test_placeholder_inside_argument() {
        let url = url::Url::parse( "http://radio.example/live" ).unwrap();
        let args = backend( &[ "--input={target}" ] ).target_args( &RenderTarget::Stream( url ) );
        assert_eq!( args, vec![ OsString::from( "--input=http://radio.example/live" ) ] );
    }


    #[test]
    fn test_target_appended_without_placeholder() {
        let args = backend( &[ "-q" ] ).target_args( &RenderTarget::File( PathBuf::from( "/m/a.mp3" ) ) );
        assert_eq!( args, vec![ OsString::from( "-q" ), OsString::from( "/m/a.mp3" ) ] );
    }


    #[test]
    fn test_probe_missing_renderer() {
        let renderer = RendererConfig {
            program: "definitely-not-a-real-renderer".to_string(),
            ..RendererConfig::default()
        };
        let backend = ProcessBackend::new( &renderer, &MixerConfig::default() );
        assert!( matches!( backend.probe(), Err( RenderError::NotFound( _ ) ) ) );
    }
}
