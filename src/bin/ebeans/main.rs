mod args;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};

use crate::args::Args;
use beanstalk_rs::server::{self, Server};
use beanstalk_rs::wal;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = args.into_config();

    let (shutdown, drain) = match server::install_signal_handlers() {
        Ok(tokens) => tokens,
        Err(error) => {
            error!(%error, "failed to install signal handlers");
            return ExitCode::from(111);
        },
    };

    let (server, listener) = match Server::open(&config).await {
        Ok(pair) => pair,
        Err(server::OpenError::Wal(wal::Error::Locked(dir))) => {
            error!(dir = %dir.display(), "write-ahead log directory is locked by another process");
            return ExitCode::from(10);
        },
        Err(server::OpenError::Wal(wal::Error::Replay(reason))) => {
            error!(%reason, "write-ahead log replay failed");
            return ExitCode::from(11);
        },
        Err(error) => {
            error!(%error, "failed to start up");
            return ExitCode::from(1);
        },
    };

    match server.run(listener, shutdown, drain).await {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::SUCCESS
        },
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}
