extern crate mapperd;

#[cfg(unix)]
use std::{fs::File, io::Write, os::fd::FromRawFd};

use mapperd::{mapper::Mapper, name_filter::NameFilter};

use anyhow::Result;
use clap::Parser;
#[cfg(unix)]
use tokio::{select, signal::unix::SignalKind};
use tracing::error;
#[cfg(unix)]
use tracing::{info, warn};

/// A D-Bus object path mapper.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Connect to the session bus instead of the system bus.
    #[clap(long)]
    session: bool,

    /// Service name prefix to index; may be given multiple times.
    ///
    /// When absent, the `xyz.openbmc_project.`, `org.openbmc.` and
    /// `com.intel.` namespaces are indexed.
    #[clap(long = "namespace", value_parser)]
    namespaces: Vec<String>,

    /// Full service name to never index; may be given multiple times.
    #[clap(long = "deny", value_parser)]
    denied: Vec<String>,

    /// File descriptor to which readiness notifications are sent.
    ///
    /// Once the mapper has claimed its name on the bus, it will print
    /// `READY=1\n` into this file descriptor and close it.
    ///
    /// This readiness notification mechanism which works on both systemd and s6.
    ///
    /// This feature is only available on unix-like platforms.
    #[cfg(unix)]
    #[clap(long)]
    ready_fd: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    mapperd::tracing_subscriber::init();

    let args = Args::parse();

    let namespaces = if args.namespaces.is_empty() {
        NameFilter::DEFAULT_PREFIXES.map(String::from).to_vec()
    } else {
        args.namespaces
    };
    let filter = NameFilter::new(namespaces, args.denied);

    let mut mapper = Mapper::new(args.session, filter).await?;

    #[cfg(unix)]
    if let Some(fd) = args.ready_fd {
        // SAFETY: We don't have any way to know if the fd is valid or not. The parent process is
        // responsible for passing a valid fd.
        let mut ready_file = unsafe { File::from_raw_fd(fd) };
        ready_file.write_all(b"READY=1\n")?;
    }

    #[cfg(unix)]
    {
        let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt())?;
        let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate())?;

        select! {
            _ = sig_int.recv() => {
                info!("Received SIGINT, shutting down..");
            }
            _ = sig_term.recv() => {
                info!("Received SIGTERM, shutting down..");
            }
            res = mapper.run() => match res {
                Ok(()) => warn!("Mapper stopped, shutting down.."),
                Err(e) => error!("Mapper stopped with an error: {}", e),
            }
        }
    }
    #[cfg(not(unix))]
    mapper.run().await?;

    Ok(())
}
