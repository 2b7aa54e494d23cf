//! `fwd`: the little forwarder that could

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use fwd_relay::config::CliArgs;
use fwd_relay::logger::{self, log};
use fwd_relay::{sysinfo, Shutdown};

use anyhow::Result;
use clap::CommandFactory;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();

    if cli.list {
        println!("Available local addresses:");
        for ip in sysinfo::local_ipv4_addrs()? {
            println!("{}", ip);
        }
        return Ok(());
    }
    if cli.build {
        println!("{}", sysinfo::build_info());
        return Ok(());
    }

    let file_config = cli.load_file_config()?;
    logger::init_logger(cli.log_level(&file_config)?);

    // No destination: usage, not a failure
    let Some(config) = cli.forward_config(&file_config)? else {
        CliArgs::command().print_help()?;
        println!();
        return Ok(());
    };

    let shutdown = Shutdown::new();
    let signals = shutdown.listen_for_signals()?;

    let handle = match fwd_relay::start_with_shutdown(config, shutdown.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            log::error!(error = %e, "Failed to start forwarder");
            return Err(e.into());
        }
    };

    let sessions = handle.sessions();
    let result = handle.wait().await;

    // Listener is closed; let established relays run to completion
    if result.is_ok() && !sessions.is_empty() {
        log::info!(
            active = sessions.len(),
            "Waiting for active sessions to finish, <CTRL+C> again to close them"
        );
        tokio::select! {
            _ = sessions.wait() => {}
            _ = shutdown.forced() => {
                log::warn!(active = sessions.len(), "Closing active sessions");
            }
        }
    }
    signals.abort();

    match result {
        Ok(()) => {
            log::info!("Forwarder stopped");
            Ok(())
        }
        Err(e) => {
            log::error!(error = %e, "Forwarder stopped with error");
            Err(e.into())
        }
    }
}
