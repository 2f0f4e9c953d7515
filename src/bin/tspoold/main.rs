mod args;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;
use tspool::server::gpu::SmiOracle;
use tspool::server::{self, dump, Config};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let socket_path = args.socket_path();
    // A daemon that died hard leaves its socket file behind; reclaim the
    // path before binding.
    let _ = std::fs::remove_file(&socket_path);
    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(error) => {
            error!(%error, path = %socket_path.display(), "failed to listen for connections");
            return ExitCode::from(111);
        },
    };

    let cancel = CancellationToken::new();
    let dump_requested = Arc::new(AtomicBool::new(false));

    // SIGTERM stops the daemon and asks for the replay dump; SIGINT just
    // stops it. KILL_SERVER over the socket cancels the same token.
    {
        let cancel = cancel.clone();
        let dump_requested = dump_requested.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    select! {
                        _ = sigterm.recv() => {
                            dump_requested.store(true, Ordering::Relaxed);
                        },
                        r = tokio::signal::ctrl_c() => {
                            if let Err(error) = r {
                                warn!(%error, "something strange with ctrl-c handling!");
                            }
                        },
                    }
                },
                Err(error) => {
                    warn!(%error, "cannot listen for SIGTERM");
                    if let Err(error) = tokio::signal::ctrl_c().await {
                        warn!(%error, "something strange with ctrl-c handling!");
                    }
                },
            }
            cancel.cancel();
        });
    }

    let cfg = Config {
        max_slots: args.slots,
        max_jobs: args.max_jobs,
        gpu_wait_time: args.gpu_wait_time,
        uid: nix::unistd::getuid().as_raw() as i32,
    };

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = match server::serve(
        listener,
        cfg,
        Box::<SmiOracle>::default(),
        cancel,
        shutdown_hold,
    )
    .await
    {
        Ok(core) => {
            if dump_requested.load(Ordering::Relaxed) {
                let path = args.dump_path();
                match dump::write(&path, core.registry()) {
                    Ok(()) => info!(path = %path.display(), "wrote job dump"),
                    Err(error) => warn!(%error, "failed to write job dump"),
                }
            }
            ExitCode::SUCCESS
        },
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    };

    // Resolves once every connection task has flushed its replies and
    // closed its socket.
    shutdown_wait.recv().await;

    let _ = std::fs::remove_file(&socket_path);

    exit_code
}
