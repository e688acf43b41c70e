//! Control command parsing.
//!
//! Clients send one command per line. Commands are parsed here and mapped
//! onto engine operations by the transport.

use std::path::PathBuf;

use thiserror::Error;

use crate::library::SongRef;


/// Errors that can occur during command parsing.
#[derive( Debug, Error, PartialEq )]
pub enum CommandError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Parsed control command.
#[derive( Debug, Clone, PartialEq )]
pub enum Command {
    // Playback commands
    Play { song: SongRef },
    Add { song: SongRef },
    Stream { url: String },
    Stop,
    Resume,
    Next,

    // Queue commands
    Clear,
    Shuffle,
    Queue { paths: Vec<PathBuf> },

    // Other commands
    Volume { level: Option<i32> },
    Status,
    List,
    Rescan,
    Help,
    Quit,
}


impl Command {
    /// Parses a command line. A leading `/` is accepted and ignored.
    ///
    /// @param input - The command line to parse
    ///
    /// @returns The parsed command or an error
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let input = input.trim();
        let input = input.strip_prefix( '/' ).unwrap_or( input );
        let mut parts = input.splitn( 2, ' ' );
        let cmd = parts.next().unwrap_or( "" ).to_lowercase();
        let args = parts.next().map( |s| s.trim() ).filter( |s| !s.is_empty() );

        match cmd.as_str() {
            // Playback commands
            "play" | "p" => {
                let song = args
                    .ok_or_else( || CommandError::MissingArgument( "song id or path".into() ) )?;
                Ok( Command::Play { song: parse_song_ref( song ) } )
            }
            "add" | "a" | "enqueue" => {
                let song = args
                    .ok_or_else( || CommandError::MissingArgument( "song id or path".into() ) )?;
                Ok( Command::Add { song: parse_song_ref( song ) } )
            }
            "stream" | "radio" => {
                let url = args
                    .ok_or_else( || CommandError::MissingArgument( "stream URL".into() ) )?;
                Ok( Command::Stream { url: url.to_string() } )
            }
            "stop" | "st" => Ok( Command::Stop ),
            "resume" | "r" => Ok( Command::Resume ),
            "next" | "n" | "skip" => Ok( Command::Next ),

            // Queue commands
            "clear" | "cl" => Ok( Command::Clear ),
            "shuffle" | "sh" => Ok( Command::Shuffle ),
            "queue" => {
                let paths = args
                    .map( |s| {
                        s.split( ';' )
                            .map( str::trim )
                            .filter( |p| !p.is_empty() )
                            .map( PathBuf::from )
                            .collect()
                    })
                    .unwrap_or_default();
                Ok( Command::Queue { paths } )
            }

            // Other commands
            "vol" | "volume" => {
                let level = args
                    .map( |s| s.parse::<i32>().map_err( |_| {
                        CommandError::InvalidArgument( format!( "Invalid volume: '{}'", s ) )
                    }))
                    .transpose()?;
                Ok( Command::Volume { level } )
            }
            "status" | "s" => Ok( Command::Status ),
            "list" | "ls" => Ok( Command::List ),
            "rescan" => Ok( Command::Rescan ),
            "help" | "h" | "?" => Ok( Command::Help ),
            "quit" | "q" | "exit" => Ok( Command::Quit ),

            "" => Err( CommandError::Unknown( "empty command".into() ) ),
            other => Err( CommandError::Unknown( other.to_string() ) ),
        }
    }
}


fn parse_song_ref( s: &str ) -> SongRef {
    match s.parse() {
        Ok( song ) => song,
        Err( never ) => match never {},
    }
}


/// Returns help text listing all available commands.
pub fn help_text() -> &'static str {
    r#"Playback Commands:
  play <id|path>      Play a song now
  add <id|path>       Queue a song, or play it if idle
  stream <url>        Play an internet stream
  stop                Stop playback
  resume              Resume the stopped song
  next                Skip to the next queued song

Queue Commands:
  clear               Clear the queue
  shuffle             Shuffle the queue
  queue <p>[;<p>...]  Replace the queue with library paths

Other Commands:
  vol [0-100]         Show or set volume
  status              Show playback status
  list                List library songs
  rescan              Rescan library roots
  help                Show this help
  quit                Save state and exit"#
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::library::SongId;


    #[test]
    fn test_parse_playback_commands() {
        assert_eq!( Command::parse( "stop" ).unwrap(), Command::Stop );
        assert_eq!( Command::parse( "/next" ).unwrap(), Command::Next );
        assert_eq!( Command::parse( "skip" ).unwrap(), Command::Next );
        assert_eq!( Command::parse( "resume" ).unwrap(), Command::Resume );
    }


    #[test]
    fn test_parse_song_refs() {
        assert_eq!(
            Command::parse( "play 12" ).unwrap(),
            Command::Play { song: SongRef::Id( SongId( 12 ) ) }
        );
        assert_eq!(
            Command::parse( "add /music/Band - Song.mp3" ).unwrap(),
            Command::Add { song: SongRef::Path( PathBuf::from( "/music/Band - Song.mp3" ) ) }
        );
    }


    #[test]
    fn test_parse_stream() {
        assert_eq!(
            Command::parse( "stream http://radio.example/live" ).unwrap(),
            Command::Stream { url: "http://radio.example/live".to_string() }
        );
    }


    #[test]
    fn test_parse_queue_paths() {
        assert_eq!(
            Command::parse( "queue /a.mp3; /b.mp3 ;;/c d.mp3" ).unwrap(),
            Command::Queue { paths: vec![
                PathBuf::from( "/a.mp3" ),
                PathBuf::from( "/b.mp3" ),
                PathBuf::from( "/c d.mp3" ),
            ]}
        );
        assert_eq!( Command::parse( "queue" ).unwrap(), Command::Queue { paths: vec![] } );
    }


    #[test]
    fn test_parse_volume() {
        assert_eq!( Command::parse( "vol" ).unwrap(), Command::Volume { level: None } );
        assert_eq!( Command::parse( "volume 150" ).unwrap(), Command::Volume { level: Some( 150 ) } );
        assert_eq!( Command::parse( "vol -5" ).unwrap(), Command::Volume { level: Some( -5 ) } );
        assert!( matches!( Command::parse( "vol loud" ), Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_missing_arguments() {
        assert!( matches!( Command::parse( "play" ), Err( CommandError::MissingArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "add   " ), Err( CommandError::MissingArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "stream" ), Err( CommandError::MissingArgument( _ ) ) ) );
    }


    #[test]
    fn test_unknown_command() {
        assert_eq!( Command::parse( "dance" ), Err( CommandError::Unknown( "dance".into() ) ) );
        assert!( matches!( Command::parse( "   " ), Err( CommandError::Unknown( _ ) ) ) );
    }


    #[test]
    fn test_case_insensitive() {
        assert_eq!( Command::parse( "STOP" ).unwrap(), Command::Stop );
        assert_eq!( Command::parse( "Quit" ).unwrap(), Command::Quit );
    }
}
