use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nbd_server::config::SessionConfig;
use nbd_server::error::FatalError;
use nbd_server::export::Export;
use nbd_server::{metrics, session};

#[derive(Parser)]
#[command(about = "NBD server: one export, one client connection per process")]
struct Args {
    /// Path to the backing file exposed as the NBD export
    #[arg(short, long)]
    export: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value_t = 10809)]
    port: u16,

    /// Reject writes and advertise NBD_FLAG_READ_ONLY during negotiation
    #[arg(long)]
    read_only: bool,

    /// I/O Request Table capacity (must be a power of two)
    #[arg(long, default_value_t = nbd_server::config::DEFAULT_MAX_IO)]
    max_io: usize,

    /// NBD Request Table capacity (must be a power of two)
    #[arg(long, default_value_t = nbd_server::config::DEFAULT_MAX_NBD)]
    max_nbd: usize,

    /// io_uring SQ/CQ entry count, per connection
    #[arg(long, default_value_t = nbd_server::config::DEFAULT_RING_ENTRIES)]
    ring_entries: u32,
}

fn run(args: Args) -> Result<(), FatalError> {
    let config = SessionConfig {
        max_io: args.max_io,
        max_nbd: args.max_nbd,
        ring_entries: args.ring_entries,
        read_only: args.read_only,
    };
    config.validate().map_err(FatalError::Config)?;

    let export = Export::open(&args.export, config.read_only)?;
    log::info!(
        "exporting {} ({} bytes, read_only={})",
        args.export.display(),
        export.size(),
        export.read_only()
    );

    let listener = TcpListener::bind(("0.0.0.0", args.port)).map_err(FatalError::Transport)?;
    log::info!("listening on port {}", args.port);

    metrics::spawn_reporter();

    // One export, one client, one process: accept exactly one connection and
    // serve it to completion, then exit. A second client gets a fresh
    // process rather than a second session sharing this one's tables.
    let (stream, peer) = listener.accept().map_err(FatalError::Transport)?;
    log::info!("accepted connection from {peer}");
    session::handle_connection(stream, &export, &config)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}
