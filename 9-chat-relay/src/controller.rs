use std::{future::Future, mem, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpSocket},
    select,
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    acceptor::Acceptor,
    config::RelayConfig,
    dispatcher::{self, Dispatcher},
    registry::Registry,
};

const LISTEN_BACKLOG: u32 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("relay is already running")]
    AlreadyRunning,
    #[error("relay has already been stopped")]
    AlreadyStopped,
}

enum Lifecycle {
    Idle { listener: TcpListener },
    Running(Running),
    Stopped,
}

struct Running {
    stop: Arc<watch::Sender<bool>>,
    acceptor: JoinHandle<Result<()>>,
    dispatcher: JoinHandle<()>,
}

/// Owns the listener, the registry and the two relay loops.
///
/// The configuration is fixed at [`Controller::bind`]; after that the only
/// controls are [`Controller::start`] and [`Controller::stop`].
pub struct Controller {
    config: RelayConfig,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    lifecycle: Lifecycle,
}

impl Controller {
    /// Validates `config` and binds the listening socket.
    ///
    /// Keep-alive is enabled on the listener so accepted connections inherit
    /// it and dead peers are eventually noticed by the kernel.
    pub fn bind(config: RelayConfig) -> Result<Self> {
        config.validate().context("invalid relay configuration")?;

        let addr = config.bind_addr();
        let listener =
            bind_listener(addr).with_context(|| format!("failed to bind relay to {addr}"))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            registry: Arc::new(Registry::new(config.max_clients)),
            config,
            local_addr,
            lifecycle: Lifecycle::Idle { listener },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running(_))
    }

    pub async fn client_count(&self) -> usize {
        self.registry.count().await
    }

    /// Spawns the acceptor and dispatcher loops.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        let listener = match mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle { listener } => listener,
            Lifecycle::Running(running) => {
                self.lifecycle = Lifecycle::Running(running);
                return Err(ControllerError::AlreadyRunning);
            }
            Lifecycle::Stopped => return Err(ControllerError::AlreadyStopped),
        };

        let (stop, stop_rx) = watch::channel(false);
        let stop = Arc::new(stop);
        let (queue, events) = dispatcher::channel();

        let acceptor = Acceptor::new(listener, Arc::clone(&self.registry), queue, &self.config);
        let acceptor = {
            let stop = Arc::clone(&stop);
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                let result = acceptor.run(stop_rx).await;
                if result.is_err() {
                    // Take the dispatcher down with us; `stop` reports the error.
                    stop.send_replace(true);
                }
                result
            })
        };
        let dispatcher =
            tokio::spawn(Dispatcher::new(Arc::clone(&self.registry), events).run(stop_rx));

        info!(
            addr = %self.local_addr,
            max_clients = self.config.max_clients,
            "relay started"
        );
        self.lifecycle = Lifecycle::Running(Running {
            stop,
            acceptor,
            dispatcher,
        });
        Ok(())
    }

    /// Stops both loops and closes every registered session.
    ///
    /// Events still queued for the dispatcher are dropped and sessions closed
    /// here do not announce a disconnect. Returns the
    /// acceptor's error if it had failed. Does nothing unless running.
    pub async fn stop(&mut self) -> Result<()> {
        let running = match mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => running,
            other => {
                self.lifecycle = other;
                return Ok(());
            }
        };

        running.stop.send_replace(true);
        let accepted = running.acceptor.await;

        // A broadcast stuck on an unresponsive peer would keep holding that
        // peer's write lock, so the dispatcher is not waited on.
        running.dispatcher.abort();
        if let Err(err) = running.dispatcher.await {
            if !err.is_cancelled() {
                warn!(error = ?err, "dispatcher task failed");
            }
        }

        let sessions = self.registry.close().await;
        let mut released = 0;
        for session in &sessions {
            if session.close().await {
                released += 1;
            }
        }
        info!(sessions = sessions.len(), released, "relay stopped");

        match accepted {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err).context("acceptor task failed")),
        }
    }

    /// Starts the relay and stops it once `shutdown` resolves or the acceptor
    /// fails, whichever happens first.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.start()?;
        let mut failed = match &self.lifecycle {
            Lifecycle::Running(running) => running.stop.subscribe(),
            _ => return Err(anyhow!("relay did not start")),
        };

        select! {
            _ = shutdown => debug!("shutdown requested"),
            _ = stop_requested(&mut failed) => warn!("acceptor stopped unexpectedly"),
        }

        self.stop().await
    }
}

/// Resolves once the stop flag is raised or its sender is gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}
