//! Restart handoff: a running process passes its listening sockets and state to
//! a successor over a local control socket.
//!
//! ```text
//! successor                         predecessor
//!    Hello ------------------------->
//!          <------------------------- Hello
//!          <------------------------- SocketHandle + SCM_RIGHTS
//!    (builds its services)
//!    Ready ------------------------->
//!                                     freeze migrations, stop accepting
//!          <------------------------- Snapshot
//!    (merges snapshot)
//!    SnapshotAck ------------------->
//!    starts accepting                 drains and exits
//! ```
//!
//! The predecessor keeps accepting until `Ready` arrives, and rolls back to
//! accepting on any failure before `SnapshotAck`. A successor that fails at any
//! point exits before accepting anything.

pub mod fd;
pub mod protocol;

use crate::config::HandoffConfig;
use crate::health::HealthMonitor;
use crate::metrics_defs::HANDOFFS;
use crate::migration::MigrationCoordinator;
use crate::server::AcceptState;
use directory::Directory;
use directory::types::unix_millis;
use protocol::{ControlMessage, HandoffSnapshot, PROTOCOL_VERSION, read_message, write_message};
use shared::counter;
use std::collections::HashMap;
use std::fs::Permissions;
use std::future::Future;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::watch;

#[derive(thiserror::Error, Debug)]
pub enum HandoffError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("{0} descriptors exceed the limit")]
    TooManyDescriptors(usize),
    #[error("expected {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("peer uid {0} does not match ours")]
    PermissionDenied(u32),
    #[error("expected {expected} listener descriptors, got {got}")]
    MissingDescriptors { expected: usize, got: usize },
    #[error("no listener named {0} was handed over")]
    MissingListener(String),
    #[error("{0} path exists and is not a socket")]
    NotASocket(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("peer aborted: {0}")]
    Aborted(String),
    #[error("control channel closed")]
    Closed,
}

/// Steps of a handoff, logged as they happen on either side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffPhase {
    Listening,
    SocketTransferred,
    NewListening,
    ReadySignal,
    OldStoppedAccepting,
    StateSnapshotTransferred,
    NewAccepting,
    OldDraining,
    OldExited,
    RolledBack,
}

impl HandoffPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HandoffPhase::Listening => "listening",
            HandoffPhase::SocketTransferred => "socket_transferred",
            HandoffPhase::NewListening => "new_listening",
            HandoffPhase::ReadySignal => "ready_signal",
            HandoffPhase::OldStoppedAccepting => "old_stopped_accepting",
            HandoffPhase::StateSnapshotTransferred => "state_snapshot_transferred",
            HandoffPhase::NewAccepting => "new_accepting",
            HandoffPhase::OldDraining => "old_draining",
            HandoffPhase::OldExited => "old_exited",
            HandoffPhase::RolledBack => "rolled_back",
        }
    }

    pub fn log(self, peer_pid: u32) {
        tracing::info!(phase = self.as_str(), peer_pid, "Handoff phase");
    }
}

async fn expect<F>(
    what: &'static str,
    within: Duration,
    read: F,
) -> Result<ControlMessage, HandoffError>
where
    F: Future<Output = Result<ControlMessage, HandoffError>>,
{
    match tokio::time::timeout(within, read).await {
        Ok(Ok(ControlMessage::Abort { reason })) => Err(HandoffError::Aborted(reason)),
        Ok(result) => result,
        Err(_) => Err(HandoffError::Timeout(what)),
    }
}

fn unexpected(expected: &'static str, got: &ControlMessage) -> HandoffError {
    HandoffError::Unexpected {
        expected,
        got: got.kind(),
    }
}

/// Checks a Hello and returns the peer's pid. A mismatched version is answered with
/// `Abort` so the other side fails closed too.
async fn check_hello(
    stream: &mut UnixStream,
    message: ControlMessage,
) -> Result<u32, HandoffError> {
    match message {
        ControlMessage::Hello {
            protocol_version,
            pid,
        } if protocol_version == PROTOCOL_VERSION => Ok(pid),
        ControlMessage::Hello {
            protocol_version, ..
        } => {
            let reason = format!(
                "protocol version {protocol_version} is not supported, expected {PROTOCOL_VERSION}"
            );
            let _ = write_message(stream, &ControlMessage::Abort { reason }).await;
            Err(HandoffError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: protocol_version,
            })
        }
        other => Err(unexpected("hello", &other)),
    }
}

/// Binds the control socket with owner-only permissions, replacing a stale socket
/// file left by an earlier process.
pub fn bind_control_socket(path: &Path) -> Result<UnixListener, HandoffError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            tracing::debug!(path = %path.display(), "Removed stale control socket");
        }
        Ok(_) => return Err(HandoffError::NotASocket(path.display().to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, Permissions::from_mode(0o600))?;
    tracing::info!(path = %path.display(), "Control socket listening");
    Ok(listener)
}

fn check_peer(stream: &UnixStream) -> Result<(), HandoffError> {
    let peer = stream.peer_cred()?;
    if peer.uid() != nix::unistd::getuid().as_raw() {
        return Err(HandoffError::PermissionDenied(peer.uid()));
    }
    Ok(())
}

/// The running process's side of a handoff.
pub struct Predecessor {
    directory: Directory,
    health: HealthMonitor,
    migrations: MigrationCoordinator,
    accept: Arc<watch::Sender<AcceptState>>,
    listeners: Vec<(String, Arc<TcpListener>)>,
    config: HandoffConfig,
}

impl Predecessor {
    pub fn new(
        directory: Directory,
        health: HealthMonitor,
        migrations: MigrationCoordinator,
        accept: Arc<watch::Sender<AcceptState>>,
        listeners: Vec<(String, Arc<TcpListener>)>,
        config: HandoffConfig,
    ) -> Self {
        Predecessor {
            directory,
            health,
            migrations,
            accept,
            listeners,
            config,
        }
    }

    /// Serves handoff attempts until one succeeds. Failed attempts leave this
    /// process accepting.
    pub async fn serve(self, control: UnixListener) -> Result<(), HandoffError> {
        loop {
            let (mut stream, _) = control.accept().await?;
            if let Err(err) = check_peer(&stream) {
                tracing::warn!(error = %err, "Rejected control connection");
                let _ = write_message(
                    &mut stream,
                    &ControlMessage::Abort {
                        reason: err.to_string(),
                    },
                )
                .await;
                counter!(HANDOFFS, "side" => "old", "outcome" => "rejected").increment(1);
                continue;
            }

            match self.hand_over(stream).await {
                Ok(()) => {
                    counter!(HANDOFFS, "side" => "old", "outcome" => "completed").increment(1);
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(error = %err, "Handoff failed, still serving");
                    counter!(HANDOFFS, "side" => "old", "outcome" => "failed").increment(1);
                }
            }
        }
    }

    async fn hand_over(&self, mut stream: UnixStream) -> Result<(), HandoffError> {
        let ready_timeout = self.config.ready_timeout();

        let hello = expect("hello", ready_timeout, read_message(&mut stream)).await?;
        let peer = check_hello(&mut stream, hello).await?;
        HandoffPhase::Listening.log(peer);
        write_message(&mut stream, &ControlMessage::hello()).await?;

        let names = self.listeners.iter().map(|(name, _)| name.clone()).collect();
        let fds: Vec<_> = self
            .listeners
            .iter()
            .map(|(_, listener)| listener.as_raw_fd())
            .collect();
        write_message(&mut stream, &ControlMessage::SocketHandle { names }).await?;
        fd::send_fds(&stream, &fds).await?;
        HandoffPhase::SocketTransferred.log(peer);

        // Until the successor is ready it has no way to serve; keep accepting.
        match expect("ready", ready_timeout, read_message(&mut stream)).await? {
            ControlMessage::Ready => HandoffPhase::ReadySignal.log(peer),
            other => return Err(unexpected("ready", &other)),
        }

        self.migrations.freeze(self.config.snapshot_timeout()).await;
        self.accept.send_replace(AcceptState::Paused);
        HandoffPhase::OldStoppedAccepting.log(peer);

        if let Err(err) = self.send_snapshot(&mut stream, peer).await {
            self.accept.send_replace(AcceptState::Accepting);
            self.migrations.thaw();
            HandoffPhase::RolledBack.log(peer);
            return Err(err);
        }

        self.accept.send_replace(AcceptState::Stopped);
        HandoffPhase::OldDraining.log(peer);
        Ok(())
    }

    async fn send_snapshot(&self, stream: &mut UnixStream, peer: u32) -> Result<(), HandoffError> {
        let snapshot = HandoffSnapshot {
            directory: self.directory.snapshot(),
            health: self.health.snapshot(),
            taken_at_ms: unix_millis(),
        };
        tracing::info!(
            assignments = snapshot.directory.assignments.len(),
            migrations = snapshot.directory.migrations.len(),
            held = snapshot.health.iter().map(|s| s.held.len()).sum::<usize>(),
            "Sending handoff snapshot"
        );
        write_message(stream, &ControlMessage::Snapshot(Box::new(snapshot))).await?;

        match expect(
            "snapshot ack",
            self.config.snapshot_timeout(),
            read_message(stream),
        )
        .await?
        {
            ControlMessage::SnapshotAck => {
                HandoffPhase::StateSnapshotTransferred.log(peer);
                Ok(())
            }
            other => Err(unexpected("snapshot ack", &other)),
        }
    }
}

/// The new process's side of a handoff, holding the inherited listeners until
/// the snapshot has been merged.
pub struct Successor {
    stream: UnixStream,
    predecessor: u32,
    listeners: HashMap<String, std::net::TcpListener>,
    config: HandoffConfig,
}

impl Successor {
    /// Connects to a running predecessor and receives its listeners. Returns `None`
    /// when nothing is listening on the control socket.
    pub async fn connect(
        path: &Path,
        config: &HandoffConfig,
    ) -> Result<Option<Successor>, HandoffError> {
        let mut stream = match UnixStream::connect(path).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::info!(path = %path.display(), error = %err, "No predecessor to take over from");
                return Ok(None);
            }
        };

        write_message(&mut stream, &ControlMessage::hello()).await?;
        let hello = expect("hello", config.ready_timeout(), read_message(&mut stream)).await?;
        let predecessor = check_hello(&mut stream, hello).await?;
        HandoffPhase::Listening.log(predecessor);

        let names = match expect(
            "socket handle",
            config.ready_timeout(),
            read_message(&mut stream),
        )
        .await?
        {
            ControlMessage::SocketHandle { names } => names,
            other => return Err(unexpected("socket handle", &other)),
        };
        let fds = fd::recv_fds(&stream).await?;
        if fds.len() != names.len() {
            return Err(HandoffError::MissingDescriptors {
                expected: names.len(),
                got: fds.len(),
            });
        }
        let listeners = names
            .into_iter()
            .zip(fds)
            .map(|(name, fd)| (name, std::net::TcpListener::from(fd)))
            .collect();
        HandoffPhase::SocketTransferred.log(predecessor);

        Ok(Some(Successor {
            stream,
            predecessor,
            listeners,
            config: config.clone(),
        }))
    }

    pub fn predecessor_pid(&self) -> u32 {
        self.predecessor
    }

    pub fn take_listener(&mut self, name: &str) -> Result<TcpListener, HandoffError> {
        let listener = self
            .listeners
            .remove(name)
            .ok_or_else(|| HandoffError::MissingListener(name.to_string()))?;
        listener.set_nonblocking(true)?;
        Ok(TcpListener::from_std(listener)?)
    }

    /// Signals readiness, then merges the predecessor's snapshot. The caller may
    /// start accepting once this returns.
    pub async fn complete(
        mut self,
        directory: &Directory,
        health: &HealthMonitor,
    ) -> Result<u32, HandoffError> {
        let peer = self.predecessor;
        HandoffPhase::NewListening.log(peer);
        write_message(&mut self.stream, &ControlMessage::Ready).await?;

        // The predecessor freezes migrations before sending, which may take up to
        // the snapshot timeout on its own.
        let within = self.config.snapshot_timeout() * 2;
        let snapshot = match expect("snapshot", within, read_message(&mut self.stream)).await? {
            ControlMessage::Snapshot(snapshot) => snapshot,
            other => return Err(unexpected("snapshot", &other)),
        };

        tracing::info!(
            assignments = snapshot.directory.assignments.len(),
            migrations = snapshot.directory.migrations.len(),
            taken_at_ms = snapshot.taken_at_ms,
            "Merging handoff snapshot"
        );
        let HandoffSnapshot {
            directory: directory_snapshot,
            health: health_snapshot,
            ..
        } = *snapshot;
        directory.merge_snapshot(directory_snapshot);
        health.merge_snapshot(health_snapshot);

        write_message(&mut self.stream, &ControlMessage::SnapshotAck).await?;
        HandoffPhase::StateSnapshotTransferred.log(peer);
        counter!(HANDOFFS, "side" => "new", "outcome" => "completed").increment(1);
        Ok(peer)
    }
}
