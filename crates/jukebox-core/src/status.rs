//! Renderer progress parsing
//!
//! Every renderer prints a progress line while it plays. The text is
//! best-effort telemetry: anything that does not parse is reported as
//! `None` and the caller keeps assuming the process is alive.

use std::time::Duration;

use serde::{ Deserialize, Serialize };

use crate::library::Song;


/// Progress of the song currently being rendered.
#[derive( Debug, Clone, Copy, PartialEq, Default, Serialize )]
pub struct PlaybackProgress {
    pub elapsed: Duration,
    pub remaining: Duration,
    /// Fraction of the song played, 0.0 to 1.0
    pub percent_complete: f64,
    pub still_playing: bool,
}


impl PlaybackProgress {
    /// Progress reported right after a render process starts, before the
    /// first line arrives.
    pub fn started() -> Self {
        Self { still_playing: true, ..Self::default() }
    }


    /// Returns None when the two times do not add up to a representable
    /// duration.
    fn from_times( elapsed: Duration, remaining: Duration, percent: Option<f64> ) -> Option<Self> {
        let total = elapsed.checked_add( remaining )?;
        let percent = percent.unwrap_or_else( || {
            if total.is_zero() {
                0.0
            } else {
                elapsed.as_secs_f64() / total.as_secs_f64()
            }
        });

        Some( Self {
            elapsed,
            remaining,
            percent_complete: percent.clamp( 0.0, 1.0 ),
            still_playing: true,
        })
    }
}


/// Externally visible playback snapshot.
#[derive( Debug, Clone, PartialEq, Default, Serialize )]
pub struct PlayerStatus {
    pub current_song: Option<Song>,
    pub progress: PlaybackProgress,
}


impl PlayerStatus {
    /// Status with nothing playing.
    pub fn empty() -> Self {
        Self::default()
    }


    /// Status for a song whose renderer just started.
    pub fn started( song: Song ) -> Self {
        Self {
            current_song: Some( song ),
            progress: PlaybackProgress::started(),
        }
    }
}


/// Progress line format of a renderer.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize )]
#[serde( rename_all = "snake_case" )]
pub enum ProgressFormat {
    /// `Frame#  1234 [ 5678], Time: 00:32.44 [02:28.13], RVA: off, Vol: 100(100)`
    Mpg123,
    /// `A:  12.3 (12.3) of 200.0 (03:20.0)  6.1%`
    Mplayer,
    /// `42% [00:01:23] [00:02:01]`
    Bracketed,
}


impl ProgressFormat {
    /// Parses one line of renderer output.
    ///
    /// Returns None for anything that is not a well-formed progress line.
    pub fn parse( self, line: &str ) -> Option<PlaybackProgress> {
        match self {
            ProgressFormat::Mpg123 => parse_mpg123( line ),
            ProgressFormat::Mplayer => parse_mplayer( line ),
            ProgressFormat::Bracketed => parse_bracketed( line ),
        }
    }
}


fn tokens<'a>( s: &'a str, separators: &[char] ) -> Vec<&'a str> {
    s.split( |c: char| c.is_whitespace() || separators.contains( &c ) )
        .filter( |t| !t.is_empty() )
        .collect()
}


fn parse_mpg123( line: &str ) -> Option<PlaybackProgress> {
    let ( _, times ) = line.split_once( "Time:" )?;
    let fields = tokens( times, &[ '[', ']', ',' ] );
    let elapsed = parse_clock( fields.first()? )?;
    let remaining = parse_clock( fields.get( 1 )? )?;
    PlaybackProgress::from_times( elapsed, remaining, None )
}


fn parse_mplayer( line: &str ) -> Option<PlaybackProgress> {
    let line = line.trim_start().strip_prefix( "A:" )?;
    let fields = tokens( line, &[ '(', ')' ] );

    let elapsed = parse_decimal_secs( fields.first()? )?;
    let of = fields.iter().position( |t| *t == "of" )?;
    let total = parse_decimal_secs( fields.get( of + 1 )? )?;

    let percent = match fields.iter().find( |t| t.ends_with( '%' ) ) {
        Some( t ) => Some( parse_decimal( t.trim_end_matches( '%' ) )? / 100.0 ),
        None => None,
    };

    PlaybackProgress::from_times( elapsed, total.saturating_sub( elapsed ), percent )
}


fn parse_bracketed( line: &str ) -> Option<PlaybackProgress> {
    let fields = tokens( line, &[ '[', ']', '%' ] );
    if fields.len() < 3 {
        return None;
    }

    let percent = parse_decimal( fields[ 0 ] )? / 100.0;
    let elapsed = parse_clock( fields[ 1 ] )?;
    let remaining = parse_clock( fields[ 2 ] )?;
    PlaybackProgress::from_times( elapsed, remaining, Some( percent ) )
}


/// Splits an unsigned decimal like `12` or `12.75` into its digit runs,
/// using ASCII rules only.
fn split_decimal( s: &str ) -> Option<( &str, &str )> {
    let ( int, frac ) = match s.split_once( '.' ) {
        Some(( int, frac )) if !frac.is_empty() => ( int, frac ),
        Some( _ ) => return None,
        None => ( s, "" ),
    };

    let digits = |t: &str| t.bytes().all( |b| b.is_ascii_digit() );
    if int.is_empty() || !digits( int ) || !digits( frac ) {
        return None;
    }
    Some(( int, frac ))
}


fn parse_decimal( s: &str ) -> Option<f64> {
    split_decimal( s )?;
    s.parse::<f64>().ok().filter( |v| v.is_finite() )
}


fn parse_decimal_secs( s: &str ) -> Option<Duration> {
    let ( int, frac ) = split_decimal( s )?;
    let secs: u64 = int.parse().ok()?;

    let mut nanos = 0u32;
    for ( i, b ) in frac.bytes().take( 9 ).enumerate() {
        nanos += u32::from( b - b'0' ) * 10u32.pow( 8 - i as u32 );
    }

    Some( Duration::new( secs, nanos ) )
}


/// Parses `SS`, `MM:SS` or `HH:MM:SS`, each optionally with `.fraction`.
fn parse_clock( s: &str ) -> Option<Duration> {
    let parts: Vec<&str> = s.split( ':' ).collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let ( seconds, leading ) = parts.split_last()?;
    let seconds = parse_decimal_secs( seconds )?;
    if !leading.is_empty() && seconds.as_secs() >= 60 {
        return None;
    }

    let mut total = 0u64;
    for ( i, part ) in leading.iter().enumerate() {
        if part.is_empty() || !part.bytes().all( |b| b.is_ascii_digit() ) {
            return None;
        }
        let value: u64 = part.parse().ok()?;
        // Minutes following hours must stay below 60
        if i > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul( 60 )?.checked_add( value )?;
    }

    Duration::from_secs( total.checked_mul( 60 )? ).checked_add( seconds )
}


#[cfg( test )]
mod tests {
    use super::*;


    fn approx( a: f64, b: f64 ) -> bool {
        ( a - b ).abs() < 1e-6
    }


    #[test]
    fn test_parse_clock_forms() {
        assert_eq!( parse_clock( "45" ), Some( Duration::from_secs( 45 ) ) );
        assert_eq!( parse_clock( "01:30" ), Some( Duration::from_secs( 90 ) ) );
        assert_eq!( parse_clock( "01:00:05" ), Some( Duration::from_secs( 3605 ) ) );
        assert_eq!( parse_clock( "00:32.50" ), Some( Duration::from_millis( 32_500 ) ) );
    }


    #[test]
    fn test_parse_clock_rejects() {
        assert_eq!( parse_clock( "" ), None );
        assert_eq!( parse_clock( "1:75" ), None );
        assert_eq!( parse_clock( "a:10" ), None );
        assert_eq!( parse_clock( "00,32" ), None );
        assert_eq!( parse_clock( "-1:00" ), None );
        assert_eq!( parse_clock( "1:2:3:4" ), None );
    }


    #[test]
    fn test_parse_mpg123() {
        let line = "Frame#  1234 [ 5678], Time: 00:32.44 [02:28.13], RVA:   off, Vol: 100(100)";
        let progress = ProgressFormat::Mpg123.parse( line ).unwrap();
        assert_eq!( progress.elapsed, Duration::from_millis( 32_440 ) );
        assert_eq!( progress.remaining, Duration::from_millis( 148_130 ) );
        assert!( progress.percent_complete > 0.17 && progress.percent_complete < 0.19 );
        assert!( progress.still_playing );
    }


    #[test]
    fn test_parse_mplayer() {
        let line = "A:  12.3 (12.3) of 200.0 (03:20.0)  6.1% ";
        let progress = ProgressFormat::Mplayer.parse( line ).unwrap();
        assert_eq!( progress.elapsed, Duration::from_millis( 12_300 ) );
        assert_eq!( progress.remaining, Duration::from_millis( 187_700 ) );
        assert!( approx( progress.percent_complete, 0.061 ) );
    }


    #[test]
    fn test_parse_mplayer_without_percent() {
        let progress = ProgressFormat::Mplayer.parse( "A: 50.0 (50.0) of 200.0 (03:20.0)" ).unwrap();
        assert!( approx( progress.percent_complete, 0.25 ) );
    }


    #[test]
    fn test_parse_bracketed() {
        let progress = ProgressFormat::Bracketed.parse( " 42% [00:01:23] [00:02:01]" ).unwrap();
        assert_eq!( progress.elapsed, Duration::from_secs( 83 ) );
        assert_eq!( progress.remaining, Duration::from_secs( 121 ) );
        assert!( approx( progress.percent_complete, 0.42 ) );
    }


    #[test]
    fn test_percent_clamped() {
        let progress = ProgressFormat::Bracketed.parse( "250% [00:03:00] [00:00:00]" ).unwrap();
        assert!( approx( progress.percent_complete, 1.0 ) );
    }


    #[test]
    fn test_garbage_is_unparseable() {
        let garbage = [
            "",
            "High Performance MPEG 1.0/2.0/2.5 Audio Player",
            "Time: xx:yy [zz]",
            "A: twelve of 200",
            "42% [00:01:23]",
            "-5% [00:01:23] [00:02:01]",
            "NaN% [00:01:23] [00:02:01]",
            "\u{1b}[2K\r",
            "50% [18446744073709551615] [18446744073709551615]",
            "Time: 18446744073709551615 [5]",
            "50% [307445734561825860:59] [1]",
        ];
        for line in garbage {
            assert!( ProgressFormat::Mpg123.parse( line ).is_none(), "mpg123: {:?}", line );
            assert!( ProgressFormat::Mplayer.parse( line ).is_none(), "mplayer: {:?}", line );
            assert!( ProgressFormat::Bracketed.parse( line ).is_none(), "bracketed: {:?}", line );
        }
    }


    #[test]
    fn test_huge_times_are_unparseable() {
        assert!( ProgressFormat::Bracketed.parse( "50% [18446744073709551615] [1]" ).is_none() );
        assert!( ProgressFormat::Mpg123.parse( "Time: 307445734561825860:59 [00:01]" ).is_none() );
        assert_eq!( parse_clock( "307445734561825860:59" ), None );
        assert!( PlaybackProgress::from_times( Duration::MAX, Duration::from_secs( 1 ), None ).is_none() );
    }


    #[test]
    fn test_empty_status_not_playing() {
        let status = PlayerStatus::empty();
        assert!( status.current_song.is_none() );
        assert!( !status.progress.still_playing );
    }
}
