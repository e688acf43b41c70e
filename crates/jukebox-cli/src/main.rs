//! Jukebox CLI - Household audio controller playback service

mod app;
mod cli;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{ AsyncBufReadExt, BufReader };
use tracing_subscriber::{ layer::SubscriberExt, util::SubscriberInitExt, EnvFilter };

use app::{ App, Flow };
use cli::Args;

use jukebox_core::{ Config, Library, PlaybackEngine, StateStore };


/// Installs the log subscriber. Logs go to stderr; stdout carries events.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else( |_| EnvFilter::new( "jukebox=info,jukebox_core=info" ) ),
        )
        .with( tracing_subscriber::fmt::layer().with_writer( std::io::stderr ) )
        .init();
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    tracing::info!( "Starting jukebox v{}", env!( "CARGO_PKG_VERSION" ) );

    let config = Config::load( args.config.as_deref() );

    if args.init_config {
        let path = args.config.clone()
            .or_else( Config::default_path )
            .ok_or_else( || anyhow::anyhow!( "No config directory on this platform" ) )?;
        config.save_to( &path )?;
        tracing::info!( "Wrote config to {:?}", path );
        return Ok(());
    }

    let roots = if args.library.is_empty() {
        config.library_roots.clone()
    } else {
        args.library.clone()
    };

    let library = {
        let roots = roots.clone();
        tokio::task::spawn_blocking( move || app::scan_library( &roots ) ).await?
            .unwrap_or_else( |e| {
                tracing::error!( "Library scan failed: {}", e );
                Library::new()
            })
    };

    let engine = Arc::new( PlaybackEngine::from_config( &config, library ) );
    if let Err( e ) = engine.probe() {
        tracing::error!( "{}; playback will fail until it is installed", e );
    }

    let store = StateStore::new( args.state_file.clone().unwrap_or_else( || config.state_file() ) );
    tracing::info!( "State file: {:?}", store.path() );

    // Forward engine events to stdout
    let mut events = engine.subscribe();
    let printer = tokio::spawn( async move {
        while let Some( event ) = events.recv().await {
            match serde_json::to_string( &event ) {
                Ok( line ) => println!( "{}", line ),
                Err( e ) => tracing::warn!( "Failed to encode event: {}", e ),
            }
        }
    });

    if !args.no_restore {
        let engine = Arc::clone( &engine );
        let store = store.clone();
        tokio::task::spawn_blocking( move || engine.restore_state( &store ) ).await?;
    }

    let app = App::new( Arc::clone( &engine ), roots );
    let mut lines = BufReader::new( tokio::io::stdin() ).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!( ctrl_c );

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!( "Interrupted" );
                break;
            }
            line = lines.next_line() => {
                let Some( line ) = line? else {
                    tracing::info!( "Input closed" );
                    break;
                };

                let app = app.clone();
                let flow = tokio::task::spawn_blocking( move || app.execute_command( &line ) ).await?;
                if flow == Flow::Quit {
                    break;
                }
            }
        }
    }

    let engine = Arc::clone( app.engine() );
    tokio::task::spawn_blocking( move || engine.shutdown( &store ) ).await?;
    printer.abort();

    Ok(())
}
