extern crate fdbus_broker;

#[cfg(unix)]
use std::{fs::File, io::Write, os::fd::FromRawFd};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fdbus_broker::{collaborators::NullControllerChannel, config::Config, Bus, BusConfig};
#[cfg(unix)]
use tokio::{select, signal::unix::SignalKind};
use tracing::error;
#[cfg(unix)]
use tracing::{info, warn};

/// A D-Bus message bus (broker).
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// The UNIX domain socket path to listen on.
    #[clap(short = 's', long, value_parser)]
    socket_path: Option<PathBuf>,

    /// Path to a `dbus-daemon`-style XML configuration file.
    #[clap(short = 'c', long, value_parser)]
    config: Option<PathBuf>,

    /// Print the address of the message bus to standard output.
    #[clap(long)]
    print_address: bool,

    /// File descriptor to which readiness notifications are sent.
    ///
    /// Once the server is listening for connections on the specified socket, it prints
    /// `READY=1\n` to this file descriptor and closes it. Works with both systemd and s6.
    #[cfg(unix)]
    #[clap(long)]
    ready_fd: Option<i32>,
}

fn default_socket_path() -> PathBuf {
    xdg_home::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".fdbus-broker.sock")
}

#[tokio::main]
async fn main() -> Result<()> {
    fdbus_broker::tracing_subscriber::init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => BusConfig::from(Config::read_file(path)?),
        None => BusConfig::default(),
    };
    let socket_path = args.socket_path.unwrap_or_else(default_socket_path);

    let mut bus = Bus::bind(socket_path, config).await?;

    #[cfg(unix)]
    if let Some(fd) = args.ready_fd {
        // SAFETY: the parent process is responsible for passing a valid, otherwise-unused fd.
        let mut ready_file = unsafe { File::from_raw_fd(fd) };
        ready_file.write_all(b"READY=1\n")?;
    }

    if args.print_address {
        println!("{}", bus.address());
    }

    #[cfg(unix)]
    {
        let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt())?;
        let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate())?;

        select! {
            _ = sig_int.recv() => {
                info!("received SIGINT, shutting down..");
            }
            _ = sig_term.recv() => {
                info!("received SIGTERM, shutting down..");
            }
            res = bus.run(NullControllerChannel) => match res {
                Ok(()) => warn!("bus stopped, shutting down.."),
                Err(e) => error!("bus stopped with an error: {e:#}"),
            }
        }
    }
    #[cfg(not(unix))]
    bus.run(NullControllerChannel).await?;

    if let Err(e) = bus.cleanup().await {
        error!("failed to clean up: {e}");
    }

    Ok(())
}
