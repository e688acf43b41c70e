//! Command-line argument parsing for Jukebox.

use std::path::PathBuf;

use clap::Parser;


/// Jukebox - household audio controller playback service.
///
/// Reads control commands from stdin, one per line, and writes engine
/// events to stdout as JSON lines.
#[derive( Parser, Debug )]
#[command( name = "jukebox" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Config file to use instead of the default location.
    #[arg( short, long )]
    pub config: Option<PathBuf>,

    /// Where the last playback state is saved.
    #[arg( short, long )]
    pub state_file: Option<PathBuf>,

    /// Library directory to scan (repeatable). Overrides the config.
    #[arg( short, long = "library", value_name = "DIR" )]
    pub library: Vec<PathBuf>,

    /// Do not replay the saved state on startup.
    #[arg( long )]
    pub no_restore: bool,

    /// Write the effective config (defaults filled in) and exit.
    #[arg( long )]
    pub init_config: bool,
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_args() {
        let args = Args::parse_from([
            "jukebox", "--library", "/music", "-l", "/more", "--no-restore", "-s", "/tmp/state.json",
        ]);
        assert_eq!( args.library, vec![ PathBuf::from( "/music" ), PathBuf::from( "/more" ) ] );
        assert!( args.no_restore );
        assert_eq!( args.state_file, Some( PathBuf::from( "/tmp/state.json" ) ) );
        assert!( args.config.is_none() );
        assert!( !args.init_config );
    }


    #[test]
    fn test_parse_init_config() {
        let args = Args::parse_from([ "jukebox", "--init-config", "--config", "/etc/jukebox.json" ]);
        assert!( args.init_config );
        assert_eq!( args.config, Some( PathBuf::from( "/etc/jukebox.json" ) ) );
    }
}
