//! Volume side-channel
//!
//! Volume is read and written through a short-lived helper program that is
//! independent of the renderer. Every invocation has its own timeout.

use std::io::Read;
use std::process::{ Command, Stdio };
use std::thread;
use std::time::{ Duration, Instant };

use serde::{ Deserialize, Serialize };
use thiserror::Error;


/// Errors that can occur while talking to the mixer helper.
#[derive( Debug, Error )]
pub enum VolumeError {
    #[error( "Failed to run {program}: {source}" )]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error( "{program} did not finish within {timeout:?}" )]
    Timeout { program: String, timeout: Duration },

    #[error( "{program} failed: {stderr}" )]
    Failed { program: String, stderr: String },

    #[error( "Unrecognized mixer output: {0}" )]
    Parse( String ),

    #[error( "Reading the volume is not supported by {0}" )]
    Unsupported( &'static str ),
}


/// Helper program used for volume control.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize )]
#[serde( rename_all = "snake_case" )]
pub enum MixerKind {
    /// ALSA `amixer`
    Amixer,
    /// macOS `osascript`
    Osascript,
    /// Windows `nircmd` (write only)
    Nircmd,
}


impl MixerKind {
    pub fn program( self ) -> &'static str {
        match self {
            MixerKind::Amixer => "amixer",
            MixerKind::Osascript => "osascript",
            MixerKind::Nircmd => "nircmd",
        }
    }
}


/// Raw mixer range that client levels are spread across.
///
/// Client level 0 always mutes. Levels 1-100 map linearly onto
/// `floor..=ceiling`, because the bottom of most hardware ranges is
/// inaudible.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize )]
pub struct VolumeRange {
    pub floor: u8,
    pub ceiling: u8,
}


impl VolumeRange {
    pub fn new( floor: u8, ceiling: u8 ) -> Self {
        let ceiling = ceiling.min( 100 );
        Self { floor: floor.min( ceiling ), ceiling }
    }


    /// Maps a client level (clamped to 0-100) to a raw mixer level.
    pub fn to_raw( self, level: u8 ) -> u8 {
        let level = level.min( 100 );
        if level == 0 {
            return 0;
        }
        let span = f64::from( self.ceiling - self.floor );
        self.floor + ( span * f64::from( level ) / 100.0 ).round() as u8
    }


    /// Maps a raw mixer level back to a client level.
    pub fn to_level( self, raw: u8 ) -> u8 {
        if raw == 0 || raw < self.floor {
            return 0;
        }
        let span = self.ceiling - self.floor;
        if span == 0 {
            return 100;
        }
        let level = f64::from( raw.min( self.ceiling ) - self.floor ) * 100.0 / f64::from( span );
        ( level.round() as u8 ).clamp( 1, 100 )
    }
}


/// Volume control through an external helper.
#[derive( Debug, Clone )]
pub struct Mixer {
    kind: MixerKind,
    control: String,
    timeout: Duration,
}


impl Mixer {
    /// Creates a mixer for `kind`. `control` names the ALSA control for
    /// `amixer` and is ignored otherwise.
    pub fn new( kind: MixerKind, control: impl Into<String>, timeout: Duration ) -> Self {
        Self { kind, control: control.into(), timeout }
    }


    pub fn kind( &self ) -> MixerKind {
        self.kind
    }


    /// Reads the raw level (0-100).
    pub fn get( &self ) -> Result<u8, VolumeError> {
        match self.kind {
            MixerKind::Amixer => {
                let out = self.run( &[ "sget", &self.control ] )?;
                parse_amixer_level( &out ).ok_or( VolumeError::Parse( out ) )
            }
            MixerKind::Osascript => {
                let out = self.run( &[ "-e", "output volume of (get volume settings)" ] )?;
                parse_osascript_level( &out ).ok_or( VolumeError::Parse( out ) )
            }
            MixerKind::Nircmd => Err( VolumeError::Unsupported( "nircmd" ) ),
        }
    }


    /// Writes the raw level (0-100).
    pub fn set( &self, raw: u8 ) -> Result<(), VolumeError> {
        let raw = raw.min( 100 );
        match self.kind {
            MixerKind::Amixer => {
                self.run( &[ "-q", "sset", &self.control, &format!( "{}%", raw ) ] )?;
            }
            MixerKind::Osascript => {
                self.run( &[ "-e", &format!( "set volume output volume {}", raw ) ] )?;
            }
            MixerKind::Nircmd => {
                // nircmd takes 0-65535
                let scaled = u32::from( raw ) * 65535 / 100;
                self.run( &[ "setsysvolume", &scaled.to_string() ] )?;
            }
        }
        Ok(())
    }


    fn run( &self, args: &[ &str ] ) -> Result<String, VolumeError> {
        run_helper( self.kind.program(), args, self.timeout )
    }
}


/// Runs a helper to completion, killing it if it exceeds `timeout`.
///
/// Output is drained while the helper runs, so a chatty helper cannot
/// stall on a full pipe.
///
/// @returns the helper's stdout
pub fn run_helper( program: &str, args: &[ &str ], timeout: Duration ) -> Result<String, VolumeError> {
    let mut child = Command::new( program )
        .args( args )
        .stdin( Stdio::null() )
        .stdout( Stdio::piped() )
        .stderr( Stdio::piped() )
        .spawn()
        .map_err( |source| VolumeError::Spawn { program: program.to_string(), source } )?;

    let stdout = child.stdout.take().map( drain );
    let stderr = child.stderr.take().map( drain );
    let collect = |reader: Option<thread::JoinHandle<String>>| {
        reader.and_then( |r| r.join().ok() ).unwrap_or_default()
    };

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok( Some( status ) ) => break status,
            Ok( None ) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err( VolumeError::Timeout { program: program.to_string(), timeout } );
            }
            Ok( None ) => thread::sleep( Duration::from_millis( 5 ) ),
            Err( source ) => return Err( VolumeError::Spawn { program: program.to_string(), source } ),
        }
    };

    let stdout = collect( stdout );
    let stderr = collect( stderr );

    if !status.success() {
        return Err( VolumeError::Failed { program: program.to_string(), stderr: stderr.trim().to_string() } );
    }

    Ok( stdout )
}


/// Reads `stream` to the end on its own thread.
fn drain<R: Read + Send + 'static>( mut stream: R ) -> thread::JoinHandle<String> {
    thread::spawn( move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end( &mut buf );
        String::from_utf8_lossy( &buf ).into_owned()
    })
}


/// Extracts the first `[NN%]` level from `amixer sget` output.
fn parse_amixer_level( output: &str ) -> Option<u8> {
    output.lines()
        .flat_map( |line| line.split( '[' ).skip( 1 ) )
        .find_map( |field| field.split_once( "%]" ) )
        .and_then( |( level, _ )| level.trim().parse::<u8>().ok() )
        .filter( |level| *level <= 100 )
}


fn parse_osascript_level( output: &str ) -> Option<u8> {
    output.trim().parse::<u8>().ok().filter( |level| *level <= 100 )
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_range_maps_onto_usable_band() {
        let range = VolumeRange::new( 40, 100 );
        assert_eq!( range.to_raw( 0 ), 0 );
        assert_eq!( range.to_raw( 1 ), 41 );
        assert_eq!( range.to_raw( 50 ), 70 );
        assert_eq!( range.to_raw( 100 ), 100 );
        assert_eq!( range.to_raw( 250 ), 100 );
    }


    #[test]
    fn test_range_round_trips_levels() {
        let range = VolumeRange::new( 40, 100 );
        for level in [ 0u8, 10, 50, 75, 100 ] {
            assert_eq!( range.to_level( range.to_raw( level ) ), level );
        }
        assert_eq!( range.to_level( 20 ), 0 );
    }


    #[test]
    fn test_range_normalizes_bounds() {
        let range = VolumeRange::new( 120, 150 );
        assert_eq!( range, VolumeRange { floor: 100, ceiling: 100 } );
        assert_eq!( range.to_raw( 1 ), 100 );
        assert_eq!( range.to_level( 100 ), 100 );
    }


    #[test]
    fn test_parse_amixer() {
        let output = "Simple mixer control 'Master',0\n  Capabilities: pvolume pswitch\n  \
            Front Left: Playback 42000 [64%] [on]\n  Front Right: Playback 42000 [64%] [on]\n";
        assert_eq!( parse_amixer_level( output ), Some( 64 ) );
        assert_eq!( parse_amixer_level( "Mono: [on]" ), None );
    }


    #[test]
    fn test_parse_osascript() {
        assert_eq!( parse_osascript_level( "37\n" ), Some( 37 ) );
        assert_eq!( parse_osascript_level( "missing value" ), None );
    }


    #[test]
    fn test_nircmd_get_unsupported() {
        let mixer = Mixer::new( MixerKind::Nircmd, "", Duration::from_secs( 1 ) );
        assert!( matches!( mixer.get(), Err( VolumeError::Unsupported( _ ) ) ) );
    }


    #[cfg( unix )]
    #[test]
    fn test_run_helper_timeout() {
        let started = Instant::now();
        let result = run_helper( "sleep", &[ "10" ], Duration::from_millis( 100 ) );
        assert!( matches!( result, Err( VolumeError::Timeout { .. } ) ) );
        assert!( started.elapsed() < Duration::from_secs( 5 ) );
    }


    #[cfg( unix )]
    #[test]
    fn test_run_helper_large_output() {
        let started = Instant::now();
        let out = run_helper( "sh", &[ "-c", "yes | head -c 200000" ], Duration::from_secs( 5 ) ).unwrap();
        assert_eq!( out.len(), 200_000 );
        assert!( started.elapsed() < Duration::from_secs( 4 ) );
    }


    #[cfg( unix )]
    #[test]
    fn test_run_helper_output_and_failure() {
        assert_eq!( run_helper( "echo", &[ "55" ], Duration::from_secs( 5 ) ).unwrap().trim(), "55" );
        assert!( matches!(
            run_helper( "false", &[], Duration::from_secs( 5 ) ),
            Err( VolumeError::Failed { .. } )
        ));
    }
}
