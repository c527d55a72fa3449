use std::{
    io::{BufRead, IsTerminal},
    thread,
};

use anyhow::Result;
use clap::Parser;
use tokio::{select, sync::oneshot};
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command, ServeArgs},
    client,
    controller::Controller,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Send(args) => client::run(args).await?,
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let controller = Controller::bind(args.config())?;
    info!("relay listening on {}", controller.local_addr());
    info!("type 'quit' or press Ctrl-C to stop the relay");

    if let Err(err) = controller.run_until(shutdown_signal()).await {
        warn!("relay exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn shutdown_signal() {
    let quit = spawn_quit_listener();
    select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        }
        typed = quit => {
            if typed.is_err() {
                // stdin closed without a quit; only ctrl-c can stop us now.
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = ?err, "failed to install ctrl-c handler");
                }
            }
        }
    }
}

/// Watches stdin for a `quit` line on a plain thread. A blocking stdin read
/// on the runtime could not be cancelled and would hold up shutdown.
fn spawn_quit_listener() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let spawned = thread::Builder::new()
        .name("stdin-quit".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("quit") => {
                        let _ = tx.send(());
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = ?err, "failed to watch stdin for quit");
    }
    rx
}
