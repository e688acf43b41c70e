//! Renderer process lifecycle
//!
//! A `RenderProcess` owns one child process. Two reader threads forward its
//! output line by line and a watcher thread reports when it exits.

use std::ffi::OsString;
use std::io::{ ErrorKind, Read };
use std::path::{ Path, PathBuf };
use std::process::{ Child, Command, Stdio };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::mpsc::Sender;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::thread;
use std::time::{ Duration, Instant };

use super::{ RenderError, RenderHandle, RenderId, RenderSignal };


/// How often the watcher checks whether the child has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis( 50 );

/// How often `stop` checks for termination while waiting.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis( 10 );


/// One running renderer process.
pub struct RenderProcess {
    id: RenderId,
    program: String,
    child: Arc<Mutex<Child>>,
    stop_requested: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    watcher: Option<thread::JoinHandle<()>>,
}


impl RenderProcess {
    /// Spawns `program` with `args` and starts forwarding its output.
    pub fn spawn(
        id: RenderId,
        program: &str,
        args: &[OsString],
        signals: Sender<RenderSignal>,
    ) -> Result<Self, RenderError> {
        let mut child = Command::new( program )
            .args( args )
            .stdin( Stdio::null() )
            .stdout( Stdio::piped() )
            .stderr( Stdio::piped() )
            .spawn()
            .map_err( |source| RenderError::Spawn { program: program.to_string(), source } )?;

        tracing::debug!( "Renderer {} started: {} (pid {})", id, program, child.id() );

        if let Some( stdout ) = child.stdout.take() {
            spawn_reader( id, stdout, signals.clone() );
        }
        if let Some( stderr ) = child.stderr.take() {
            spawn_reader( id, stderr, signals.clone() );
        }

        let child = Arc::new( Mutex::new( child ) );
        let stop_requested = Arc::new( AtomicBool::new( false ) );
        let exited = Arc::new( AtomicBool::new( false ) );

        let watcher = {
            let child = Arc::clone( &child );
            let stop_requested = Arc::clone( &stop_requested );
            let exited = Arc::clone( &exited );
            thread::spawn( move || watch_exit( id, child, stop_requested, exited, signals ) )
        };

        Ok( Self {
            id,
            program: program.to_string(),
            child,
            stop_requested,
            exited,
            watcher: Some( watcher ),
        })
    }


    fn lock_child( &self ) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Waits for the child to exit until `deadline`.
    ///
    /// @returns true if the child is gone
    fn wait_until( child: &mut Child, deadline: Instant ) -> bool {
        loop {
            match child.try_wait() {
                Ok( Some( _ ) ) => return true,
                Ok( None ) => {}
                Err( e ) => {
                    tracing::warn!( "Failed to poll renderer: {}", e );
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep( STOP_POLL_INTERVAL );
        }
    }
}


impl RenderHandle for RenderProcess {
    fn id( &self ) -> RenderId {
        self.id
    }


    fn is_running( &self ) -> bool {
        if self.exited.load( Ordering::Acquire ) {
            return false;
        }
        matches!( self.lock_child().try_wait(), Ok( None ) )
    }


    fn stop( &mut self, timeout: Duration ) {
        self.stop_requested.store( true, Ordering::Release );

        {
            let mut child = self.lock_child();

            if !matches!( child.try_wait(), Ok( Some( _ ) ) ) {
                // Without a graceful request there is nothing to wait for
                let wait = if terminate( &child ) { timeout } else { Duration::ZERO };

                if Self::wait_until( &mut child, Instant::now() + wait ) {
                    tracing::debug!( "Renderer {} terminated", self.id );
                } else {
                    tracing::warn!( "Renderer {} did not exit within {:?}, killing", self.id, timeout );
                    match child.kill() {
                        Ok(()) => {
                            let _ = child.wait();
                        }
                        Err( e ) if e.kind() == ErrorKind::InvalidInput => {
                            // Already reaped
                        }
                        Err( e ) => {
                            tracing::error!( "Failed to kill renderer {}: {}", self.id, e );
                            sweep_orphans( &self.program );
                        }
                    }
                }
            }
        }

        self.exited.store( true, Ordering::Release );

        if let Some( watcher ) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}


impl Drop for RenderProcess {
    fn drop( &mut self ) {
        if self.watcher.is_some() {
            self.stop( Duration::from_millis( 500 ) );
        }
    }
}


/// Asks the child to exit on its own.
///
/// @returns true if the request was delivered
#[cfg( unix )]
fn terminate( child: &Child ) -> bool {
    use nix::sys::signal::{ kill, Signal };
    use nix::unistd::Pid;

    match kill( Pid::from_raw( child.id() as i32 ), Signal::SIGTERM ) {
        Ok(()) => true,
        Err( e ) => {
            tracing::debug!( "SIGTERM failed: {}", e );
            false
        }
    }
}


/// Windows has no graceful signal for console children, so `stop` kills
/// them right away.
#[cfg( not( unix ) )]
fn terminate( _child: &Child ) -> bool {
    false
}


fn watch_exit(
    id: RenderId,
    child: Arc<Mutex<Child>>,
    stop_requested: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    signals: Sender<RenderSignal>,
) {
    loop {
        if stop_requested.load( Ordering::Acquire ) {
            return;
        }

        let status = child.lock()
            .unwrap_or_else( PoisonError::into_inner )
            .try_wait();

        match status {
            Ok( Some( status ) ) => {
                exited.store( true, Ordering::Release );
                tracing::debug!( "Renderer {} exited: {}", id, status );
                if !stop_requested.load( Ordering::Acquire ) {
                    let _ = signals.send( RenderSignal::Exited { id, code: status.code() } );
                }
                return;
            }
            Ok( None ) => {}
            Err( e ) => {
                tracing::warn!( "Lost track of renderer {}: {}", id, e );
                exited.store( true, Ordering::Release );
                if !stop_requested.load( Ordering::Acquire ) {
                    let _ = signals.send( RenderSignal::Exited { id, code: None } );
                }
                return;
            }
        }

        thread::sleep( EXIT_POLL_INTERVAL );
    }
}


/// Forwards output from `stream`, splitting on both `\n` and `\r` since
/// renderers redraw their progress line with carriage returns.
fn spawn_reader<R: Read + Send + 'static>( id: RenderId, mut stream: R, signals: Sender<RenderSignal> ) {
    thread::spawn( move || {
        let mut buf = [ 0u8; 1024 ];
        let mut pending = Vec::new();

        let flush = |pending: &mut Vec<u8>| -> bool {
            if pending.is_empty() {
                return true;
            }
            let line = String::from_utf8_lossy( pending ).into_owned();
            pending.clear();
            signals.send( RenderSignal::Output { id, line } ).is_ok()
        };

        loop {
            let n = match stream.read( &mut buf ) {
                Ok( 0 ) => break,
                Ok( n ) => n,
                Err( e ) if e.kind() == ErrorKind::Interrupted => continue,
                Err( _ ) => break,
            };

            for &byte in &buf[ ..n ] {
                if byte == b'\n' || byte == b'\r' {
                    if !flush( &mut pending ) {
                        return;
                    }
                } else {
                    pending.push( byte );
                }
            }
        }

        flush( &mut pending );
    });
}


/// Kills every process named like `program`, left over from a crash.
pub fn sweep_orphans( program: &str ) {
    let name = Path::new( program )
        .file_name()
        .map( |n| n.to_string_lossy().into_owned() )
        .unwrap_or_else( || program.to_string() );

    #[cfg( windows )]
    let result = {
        let image = if name.to_lowercase().ends_with( ".exe" ) { name.clone() } else { format!( "{}.exe", name ) };
        Command::new( "taskkill" ).args( [ "/F", "/IM", image.as_str() ] )
            .stdout( Stdio::null() ).stderr( Stdio::null() ).status()
    };

    #[cfg( not( windows ) )]
    let result = Command::new( "pkill" ).args( [ "-x", name.as_str() ] )
        .stdout( Stdio::null() ).stderr( Stdio::null() ).status();

    match result {
        Ok( status ) if status.success() => tracing::info!( "Killed orphaned {} processes", name ),
        Ok( _ ) => tracing::debug!( "No orphaned {} processes", name ),
        Err( e ) => tracing::warn!( "Orphan sweep for {} failed: {}", name, e ),
    }
}


/// Looks up an executable the way the shell would.
pub fn find_program( program: &str ) -> Option<PathBuf> {
    let path = Path::new( program );
    if path.components().count() > 1 {
        return path.is_file().then( || path.to_path_buf() );
    }

    let search = std::env::var_os( "PATH" )?;
    std::env::split_paths( &search ).find_map( |dir| {
        let candidate = dir.join( program );
        if candidate.is_file() {
            return Some( candidate );
        }
        if cfg!( windows ) {
            let exe = candidate.with_extension( "exe" );
            if exe.is_file() {
                return Some( exe );
            }
        }
        None
    })
}


#[cfg( all( test, unix ) )]
mod tests {
    use super::*;
    use std::sync::mpsc;


    fn sh( script: &str ) -> Vec<OsString> {
        vec![ OsString::from( "-c" ), OsString::from( script ) ]
    }


    #[test]
    fn test_output_lines_and_exit() {
        let ( tx, rx ) = mpsc::channel();
        let _process = RenderProcess::spawn( 7, "sh", &sh( "printf 'one\\rtwo\\nthree'" ), tx ).unwrap();

        let mut lines = Vec::new();
        let mut exit = None;
        while let Ok( signal ) = rx.recv_timeout( Duration::from_secs( 5 ) ) {
            match signal {
                RenderSignal::Output { id, line } => {
                    assert_eq!( id, 7 );
                    lines.push( line );
                }
                RenderSignal::Exited { id, code } => {
                    assert_eq!( id, 7 );
                    exit = Some( code );
                }
            }
            if exit.is_some() && lines.len() == 3 {
                break;
            }
        }

        assert_eq!( lines, vec![ "one", "two", "three" ] );
        assert_eq!( exit, Some( Some( 0 ) ) );
    }


    #[test]
    fn test_stop_is_idempotent_and_silent() {
        let ( tx, rx ) = mpsc::channel();
        let mut process = RenderProcess::spawn( 1, "sleep", &[ OsString::from( "30" ) ], tx ).unwrap();
        assert!( process.is_running() );

        let started = Instant::now();
        process.stop( Duration::from_secs( 2 ) );
        process.stop( Duration::from_secs( 2 ) );

        assert!( started.elapsed() < Duration::from_secs( 5 ) );
        assert!( !process.is_running() );
        assert!( !rx.try_iter().any( |s| matches!( s, RenderSignal::Exited { .. } ) ) );
    }


    #[test]
    fn test_stop_forces_stubborn_process() {
        let ( tx, _rx ) = mpsc::channel();
        let mut process = RenderProcess::spawn( 2, "sh", &sh( "trap '' TERM; sleep 30" ), tx ).unwrap();
        // Give the shell time to install the trap
        thread::sleep( Duration::from_millis( 200 ) );

        let started = Instant::now();
        process.stop( Duration::from_millis( 200 ) );

        assert!( started.elapsed() < Duration::from_secs( 5 ) );
        assert!( !process.is_running() );
    }


    #[test]
    fn test_terminate_delivers_sigterm() {
        let mut child = Command::new( "sleep" ).arg( "30" ).spawn().unwrap();
        assert!( terminate( &child ) );
        assert!( RenderProcess::wait_until( &mut child, Instant::now() + Duration::from_secs( 5 ) ) );
    }


    #[test]
    fn test_spawn_missing_binary() {
        let ( tx, _rx ) = mpsc::channel();
        let result = RenderProcess::spawn( 3, "/nonexistent/renderer", &[], tx );
        assert!( matches!( result, Err( RenderError::Spawn { .. } ) ) );
    }


    #[test]
    fn test_find_program() {
        assert!( find_program( "sh" ).is_some() );
        assert!( find_program( "definitely-not-a-real-binary-name" ).is_none() );
    }
}
