pub mod admin_service;
pub mod config;
pub mod errors;
pub mod forward;
pub mod handoff;
pub mod health;
pub mod metrics_defs;
pub mod migration;
pub mod proxy_service;
pub mod realm;
pub mod router;
pub mod server;
pub mod shard_ops;
pub mod shards;
pub mod testutils;

use crate::admin_service::AdminService;
use crate::config::Config;
use crate::errors::ProxyError;
use crate::forward::Forwarder;
use crate::handoff::{HandoffPhase, Predecessor, Successor};
use crate::health::{HealthMonitor, run_health_checks};
use crate::migration::MigrationCoordinator;
use crate::proxy_service::ProxyService;
use crate::realm::RealmExtractor;
use crate::router::{Router, RouterOptions};
use crate::server::{AcceptState, serve};
use crate::shard_ops::HttpShardOperations;
use crate::shards::Shards;
use directory::Directory;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Body type for everything the client-facing service sends and receives.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub const PROXY_LISTENER: &str = "proxy";
pub const ADMIN_LISTENER: &str = "admin";

/// A running proxy: both listeners, the control socket and background tasks.
pub struct Proxy {
    directory: Directory,
    health: HealthMonitor,
    migrations: MigrationCoordinator,
    proxy_addr: SocketAddr,
    admin_addr: SocketAddr,
    accept: Arc<watch::Sender<AcceptState>>,
    servers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Takes over from a running predecessor when one answers on the control
    /// socket, otherwise binds the configured listeners. Returns once accepting.
    pub async fn start(config: Config) -> Result<Proxy, ProxyError> {
        config.validate()?;

        let shards = Arc::new(Shards::new(config.shards.clone()));
        let directory = config.directory.build(shards.specs())?;
        let health = HealthMonitor::new(
            shards.ids().cloned(),
            config.health.clone(),
            &config.buffer,
        );
        let router = Arc::new(Router::new(
            directory.clone(),
            health.clone(),
            shards.clone(),
            Forwarder::new(&config.backend, config.health.liveness_timeout()),
            RealmExtractor::new(&config.realm)?,
            RouterOptions {
                buffer_deadline: config.buffer.deadline(),
                pause_timeout: config.migration.pause_timeout(),
            },
        ));
        let ops = HttpShardOperations::new(shards.clone(), config.migration.operation_timeout())?;
        let migrations = MigrationCoordinator::new(
            directory.clone(),
            Arc::new(ops),
            config.migration.invalidation_window(),
        );

        let mut successor = Successor::connect(&config.control_socket, &config.handoff).await?;
        let (proxy_listener, admin_listener) = match successor.as_mut() {
            Some(successor) => (
                successor.take_listener(PROXY_LISTENER)?,
                successor.take_listener(ADMIN_LISTENER)?,
            ),
            None => (
                TcpListener::bind(config.listener.addr()).await?,
                TcpListener::bind(config.admin_listener.addr()).await?,
            ),
        };
        let proxy_listener = Arc::new(proxy_listener);
        let admin_listener = Arc::new(admin_listener);
        let proxy_addr = proxy_listener.local_addr()?;
        let admin_addr = admin_listener.local_addr()?;

        // Servers start paused and only accept once the directory is populated.
        let (accept, _) = watch::channel(AcceptState::Paused);
        let accept = Arc::new(accept);
        let drain_deadline = config.handoff.drain_deadline();

        let admin = AdminService::new(directory.clone(), health.clone(), migrations.clone());
        let servers = vec![
            tokio::spawn(serve(
                PROXY_LISTENER,
                proxy_listener.clone(),
                accept.subscribe(),
                drain_deadline,
                move |client_addr| ProxyService::new(router.clone(), client_addr),
            )),
            tokio::spawn(serve(
                ADMIN_LISTENER,
                admin_listener.clone(),
                accept.subscribe(),
                drain_deadline,
                move |_| admin.clone(),
            )),
        ];

        match directory.load().await {
            Ok(count) => tracing::info!(count, "Directory loaded"),
            Err(err) => {
                tracing::error!(error = %err, "Directory load failed, resolving on demand");
                directory.mark_ready();
            }
        }

        let predecessor_pid = match successor {
            Some(successor) => match successor.complete(&directory, &health).await {
                Ok(pid) => Some(pid),
                Err(err) => {
                    accept.send_replace(AcceptState::Stopped);
                    return Err(err.into());
                }
            },
            None => None,
        };
        migrations.resume_all();
        accept.send_replace(AcceptState::Accepting);
        if let Some(pid) = predecessor_pid {
            HandoffPhase::NewAccepting.log(pid);
        }
        tracing::info!(%proxy_addr, %admin_addr, "Accepting connections");

        let mut background = vec![tokio::spawn({
            let health = health.clone();
            let shards = shards.clone();
            let config = config.health.clone();
            async move {
                if let Err(err) = run_health_checks(health, shards, config).await {
                    tracing::error!(error = %err, "Health checks stopped");
                }
            }
        })];

        // The successor owns the control path from here on, for the next restart.
        match handoff::bind_control_socket(&config.control_socket) {
            Ok(control) => {
                let predecessor = Predecessor::new(
                    directory.clone(),
                    health.clone(),
                    migrations.clone(),
                    accept.clone(),
                    vec![
                        (PROXY_LISTENER.to_string(), proxy_listener),
                        (ADMIN_LISTENER.to_string(), admin_listener),
                    ],
                    config.handoff.clone(),
                );
                background.push(tokio::spawn(async move {
                    if let Err(err) = predecessor.serve(control).await {
                        tracing::error!(error = %err, "Control socket failed, handoff disabled");
                    }
                }));
            }
            Err(err) => {
                tracing::error!(error = %err, "Could not bind control socket, handoff disabled");
            }
        }

        Ok(Proxy {
            directory,
            health,
            migrations,
            proxy_addr,
            admin_addr,
            accept,
            servers,
            background,
        })
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn migrations(&self) -> &MigrationCoordinator {
        &self.migrations
    }

    /// Stops accepting and starts draining.
    pub fn shutdown(&self) {
        self.accept.send_replace(AcceptState::Stopped);
    }

    /// Resolves once accepting has stopped, either through `shutdown` or because a
    /// successor took over.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut accept = self.accept.subscribe();
        async move {
            while *accept.borrow_and_update() != AcceptState::Stopped {
                if accept.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// Waits for both listeners to drain, then stops background tasks.
    pub async fn wait(self) {
        for server in self.servers {
            if let Err(err) = server.await {
                tracing::error!(error = %err, "Server task failed");
            }
        }
        for task in self.background {
            task.abort();
        }
    }
}

pub async fn run(config: Config) -> Result<(), ProxyError> {
    let proxy = Proxy::start(config).await?;

    let handed_off = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, draining");
            proxy.shutdown();
            false
        }
        _ = proxy.stopped() => true,
    };

    proxy.wait().await;
    if handed_off {
        tracing::info!(phase = HandoffPhase::OldExited.as_str(), "Handoff phase");
    }
    tracing::info!("Proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = terminate.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "Could not install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
