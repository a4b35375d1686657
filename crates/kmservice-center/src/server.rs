// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Center core implementation.

use crate::config::{CenterConfig, ConfigError};
use crate::directory::{Directory, DirectoryError, DirectorySeed};
use crate::store::SharedStore;
use kmservice::codec::{self, CodecError};
use kmservice::connection::{spawn_writer, ConnectionError, FrameReader, FrameWriter};
use kmservice::pending::spawn_sweeper;
use kmservice::{
    ConnApply, DataGram, DataGramStore, Payload, PendingSet, Shutdown, ShutdownSignal,
    CENTER_SERVICE_ID,
};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod dispatch;
pub mod links;
pub mod registry;

pub use dispatch::Session;
pub use links::LinkPool;
pub use registry::{Liveness, PoolError, ServiceRegistry, SessionHandle};

/// State shared by every connection handler.
pub struct CenterState {
    pub config: CenterConfig,
    pub directory: Directory,
    pub store: SharedStore,
    pub registry: RwLock<ServiceRegistry>,
    pub links: LinkPool,
    pub archive: Arc<dyn DataGramStore>,
}

impl CenterState {
    pub fn new(config: CenterConfig, seed: &DirectorySeed, archive: Arc<dyn DataGramStore>) -> Self {
        let registry = ServiceRegistry::new(config.max_pool_size);
        Self {
            config,
            directory: Directory::from_seed(seed),
            store: SharedStore::with_data(seed.data.clone()),
            registry: RwLock::new(registry),
            links: LinkPool::new(),
            archive,
        }
    }
}

/// The center: registry, shared store and lock manager behind a TCP listener.
#[derive(Clone)]
pub struct Center {
    state: Arc<CenterState>,
    shutdown: Shutdown,
    running: Arc<AtomicBool>,
    next_conn_id: Arc<AtomicU64>,
}

impl Center {
    /// Create a center, loading the directory seed and archive named in `config`.
    pub fn new(config: CenterConfig) -> Result<Self, ServerError> {
        let seed = match &config.directory_path {
            Some(path) => DirectorySeed::from_file(path)?,
            None => DirectorySeed::default(),
        };
        Self::with_seed(config, seed)
    }

    /// Create a center from an in-memory directory seed.
    pub fn with_seed(config: CenterConfig, seed: DirectorySeed) -> Result<Self, ServerError> {
        config.validate()?;

        let archive = kmservice::open_archive(config.archive_path.as_deref())
            .map_err(|e| ServerError::Archive(format!("{:#}", e)))?;

        info!(
            "Directory: {} services, {} shared values",
            seed.services.len(),
            seed.data.len()
        );
        match archive.count() {
            Ok(count) => info!("Archive: {} datagrams", count),
            Err(e) => warn!("Archive unreadable: {:#}", e),
        }

        Ok(Self {
            state: Arc::new(CenterState::new(config, &seed, archive)),
            shutdown: Shutdown::new(),
            running: Arc::new(AtomicBool::new(false)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.state.config.bind_address, self.state.config.port);
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        info!("Center listening on {}", listener.local_addr()?);

        let heartbeat = spawn_heartbeat(self.state.clone(), self.shutdown.signal());
        let mut shutdown = self.shutdown.signal();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);

                            let state = self.state.clone();
                            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                            let shutdown = self.shutdown.signal();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    state,
                                    stream,
                                    peer_addr,
                                    conn_id,
                                    shutdown,
                                ).await {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        heartbeat.abort();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the center and every connection to stop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &Arc<CenterState> {
        &self.state
    }

    pub fn connection_count(&self) -> usize {
        self.state.registry.read().connection_count()
    }

    pub fn liveness(&self, service_id: i64) -> Liveness {
        self.state.registry.read().liveness(service_id)
    }
}

/// Ping every pooled connection and evict services that stopped answering.
fn spawn_heartbeat(state: Arc<CenterState>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
    let interval = state.config.heartbeat_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = state.registry.write().sweep_liveness(Instant::now(), interval);
                    for handle in evicted {
                        warn!(service_id = handle.service_id, "Service stopped answering, evicting");
                        handle.shutdown.trigger();
                    }

                    let sessions = state.registry.read().sessions();
                    debug!(
                        "Heartbeat: {} services, {} shared values, {} links",
                        sessions.len(),
                        state.store.len(),
                        state.links.len()
                    );
                    for session in sessions {
                        let ping = DataGram::new(
                            session.pending.fresh_tag(CENTER_SERVICE_ID),
                            CENTER_SERVICE_ID,
                            0,
                            Payload::IsActive,
                        );
                        match codec::encode(&ping) {
                            Ok(frame) => {
                                if let Err(e) = session.outbound.try_send(frame.into()) {
                                    debug!(service_id = session.service_id, "Heartbeat not sent: {}", e);
                                }
                            }
                            Err(e) => error!("Failed to encode heartbeat: {}", e),
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Heartbeat shutting down");
                    break;
                }
            }
        }
    })
}

/// Handshake, then run the read/dispatch loop of one connection.
async fn handle_connection(
    state: Arc<CenterState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: u64,
    mut server_shutdown: ShutdownSignal,
) -> Result<(), ServerError> {
    let config = &state.config;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, config.handshake_frame_size);
    let mut writer = FrameWriter::new(write_half);

    let frame = match tokio::time::timeout(config.handshake_timeout(), reader.read_frame()).await {
        Err(_) => return Err(ServerError::Handshake("no connect request in time".into())),
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e.into()),
    };

    let apply: ConnApply = match codec::decode_json(&frame) {
        Ok(apply) => apply,
        Err(e) => {
            refuse(&mut writer, "invalid connect request").await?;
            return Err(e.into());
        }
    };
    let service_id = apply.id;

    if let Err(e) = state.directory.authenticate(service_id, &apply.token) {
        warn!(service_id, "Refusing connection from {}: {}", peer_addr, e);
        refuse(&mut writer, &e.to_string()).await?;
        return Ok(());
    }

    let session_shutdown = Shutdown::new();
    let (outbound, writer_task) = spawn_writer(
        writer,
        config.outbound_capacity,
        config.max_frame_size,
        session_shutdown.signal(),
    );
    let pending = Arc::new(PendingSet::new());

    let handle = registry::SessionHandle::new(
        service_id,
        conn_id,
        peer_addr,
        outbound.clone(),
        pending.clone(),
        session_shutdown.clone(),
    );
    let registered = state.registry.write().register(handle);
    match registered {
        Ok(Some(previous)) => {
            info!(service_id, "Service reconnected, closing previous connection");
            previous.shutdown.trigger();
        }
        Ok(None) => {}
        Err(e) => {
            warn!(service_id, "Refusing connection from {}: {}", peer_addr, e);
            let failure = envelope(Payload::Failure {
                reason: e.to_string(),
            })?;
            outbound.send(failure.into()).await?;
            // The writer drains the queue once the last handle is gone.
            drop(outbound);
            let _ = writer_task.await;
            return Ok(());
        }
    }

    outbound.send(envelope(Payload::Connect)?.into()).await?;
    info!(service_id, "Service connected from {}", peer_addr);

    spawn_sweeper(
        pending.clone(),
        config.resend_policy(),
        outbound.clone(),
        session_shutdown.signal(),
        format!("service-{}", service_id),
    );

    reader.set_max_frame_size(config.max_frame_size);
    let mut session = Session::new(service_id, peer_addr, outbound, pending.clone(), config.recent_tags);
    let mut session_signal = session_shutdown.signal();

    loop {
        tokio::select! {
            result = reader.read_frame() => {
                match result {
                    Ok(Some(frame)) => {
                        state.registry.write().touch(service_id);
                        session.handle_frame(&state, &frame).await;
                    }
                    Ok(None) => {
                        info!(service_id, "Connection closed: {}", peer_addr);
                        break;
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(service_id, "Dropped frame from {}: {}", peer_addr, e);
                    }
                    Err(e) => {
                        warn!(service_id, "Read error from {}: {}", peer_addr, e);
                        break;
                    }
                }
            }
            _ = session_signal.recv() => {
                debug!(service_id, "Session closed by center");
                break;
            }
            _ = server_shutdown.recv() => {
                debug!(service_id, "Connection handler shutting down");
                break;
            }
        }
    }

    state.registry.write().unregister(service_id, conn_id);
    session_shutdown.trigger();
    let abandoned = pending.clear();
    if abandoned > 0 {
        debug!(service_id, abandoned, "Abandoned unconfirmed envelopes");
    }
    Ok(())
}

/// An untracked center envelope.
fn envelope(payload: Payload) -> Result<Vec<u8>, ServerError> {
    let gram = DataGram::new(
        kmservice::new_tag(CENTER_SERVICE_ID),
        CENTER_SERVICE_ID,
        0,
        payload,
    );
    Ok(codec::encode(&gram)?)
}

/// Answer a connect request with FAILURE and close.
async fn refuse<W>(writer: &mut FrameWriter<W>, reason: &str) -> Result<(), ServerError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = envelope(Payload::Failure {
        reason: reason.to_string(),
    })?;
    writer.write_frame(&frame).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Bind error: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}
