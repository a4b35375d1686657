// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer session with the center.
//!
//! A [`Peer`] owns one connection to the center and four tasks behind it: the
//! reader, the writer, the resend sweeper and the update worker. All of them
//! stop when the session's shutdown signal fires, either from [`Peer::close`]
//! or because the reader exhausted its error budget.
//!
//! Local state mirrors what the center said last:
//!
//! - `peer_data`: values received through `UPDATE`
//! - `get_list`: keys with an outstanding `GET`
//! - `update_requests`: outcome of the last `UPDATE` per key
//!
//! Callers observe outcomes by polling these through the accessors.

use crate::link::{Link, LinkConfig, LinkError};
use kmservice::codec::{self, CodecError};
use kmservice::connection::{spawn_writer, FrameReader, FrameWriter};
use kmservice::pending::spawn_sweeper;
use kmservice::protocol::PayloadError;
use kmservice::store::{archive, DataGramStore};
use kmservice::{
    new_tag, Api, ApiList, ConfigError, ConnApply, ConnectionError, DataGram, ExceptionKind, Frame,
    LinkApply, LinkInfo, MessageKind, Outbound, Payload, PeerConfig, PendingSet, Shutdown,
    ShutdownSignal, SubscriptionGrant, UpdateRequest,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Inbound `UPDATE` tags remembered for duplicate suppression.
const RECENT_UPDATE_TAGS: usize = 1024;

/// Called by the update worker after a value is applied.
pub type UpdateCallback = Arc<dyn Fn(i64, &UpdateRequest) + Send + Sync>;

/// Outcome of the last `UPDATE` sent for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStatus {
    #[default]
    Idle,
    Pending,
    Succeeded,
    Failed,
}

impl UpdateStatus {
    /// Numeric form: `0` idle, `1` pending, `2` succeeded, `-1` failed.
    pub fn code(&self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Pending => 1,
            Self::Succeeded => 2,
            Self::Failed => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Disconnected,
}

/// Everything the peer caches from the center.
#[derive(Debug, Clone, Default)]
pub struct PeerLocalState {
    pub peer_data: HashMap<i64, Value>,
    pub get_list: HashMap<i64, bool>,
    pub update_requests: HashMap<i64, UpdateStatus>,
    /// `None` until the first `SUBSCRIBES` reply; access is then left to the
    /// center.
    pub subscribe_keys: Option<HashMap<i64, SubscriptionGrant>>,
    pub api_lists: HashMap<i64, Vec<Api>>,
    pub link_infos: HashMap<String, LinkInfo>,
}

/// Peer error types.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection refused by center: {0}")]
    Refused(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Not connected to center")]
    NotConnected,

    #[error("No read grant for key {0}")]
    NoReadAccess(i64),

    #[error("No write grant for key {0}")]
    NoWriteAccess(i64),

    #[error("No link known for {0:?}")]
    UnknownLink(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// A frame the reader could not turn into an envelope.
#[derive(Debug, Error)]
enum FrameError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Builder for a [`Peer`].
pub struct PeerBuilder {
    config: PeerConfig,
    on_update: Option<UpdateCallback>,
    archive: Option<Arc<dyn DataGramStore>>,
    fetch_subscriptions: bool,
}

impl PeerBuilder {
    /// Invoke `f` for every applied `UPDATE`.
    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(i64, &UpdateRequest) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    /// Archive sent envelopes here instead of the store named by the config.
    pub fn archive(mut self, store: Arc<dyn DataGramStore>) -> Self {
        self.archive = Some(store);
        self
    }

    /// Send `SUBSCRIBES` right after connecting (on by default).
    pub fn fetch_subscriptions(mut self, enabled: bool) -> Self {
        self.fetch_subscriptions = enabled;
        self
    }

    /// Dial the center, authenticate and start the session tasks.
    pub async fn connect(self) -> Result<Peer, PeerError> {
        let config = self.config;
        config.validate()?;

        let archive = match self.archive {
            Some(store) => store,
            None => kmservice::open_archive(config.file_path.as_deref())
                .map_err(|e| PeerError::Archive(format!("{:#}", e)))?,
        };

        let service_id = config.service_id;
        info!(service_id, "Connecting to center at {}", config.center_addr());
        let (reader, writer) = handshake(&config).await?;

        let shutdown = Shutdown::new();
        let (outbound, _writer) = spawn_writer(
            writer,
            config.outbound_capacity,
            config.max_frame_size,
            shutdown.signal(),
        );

        let pending = Arc::new(PendingSet::new());
        spawn_sweeper(
            pending.clone(),
            config.resend_policy(),
            outbound.clone(),
            shutdown.signal(),
            format!("peer-{}", service_id),
        );

        let (update_tx, update_rx) = mpsc::channel(config.update_queue_capacity);

        let inner = Arc::new(PeerInner {
            error_times: AtomicU32::new(config.max_error_times),
            config,
            local: Mutex::new(PeerLocalState::default()),
            pending,
            outbound,
            archive,
            shutdown: shutdown.clone(),
            on_update: self.on_update,
        });

        tokio::spawn(run_worker(inner.clone(), update_rx, shutdown.signal()));
        tokio::spawn(run_reader(inner.clone(), reader, update_tx, shutdown.signal()));

        info!(service_id, "Connected to center");
        let peer = Peer { inner };

        if self.fetch_subscriptions {
            peer.refresh_subscriptions().await?;
        }
        Ok(peer)
    }
}

/// Session with the center.
///
/// Dropping the peer closes the session.
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn builder(config: PeerConfig) -> PeerBuilder {
        PeerBuilder {
            config,
            on_update: None,
            archive: None,
            fetch_subscriptions: true,
        }
    }

    /// Connect with default options.
    pub async fn connect(config: PeerConfig) -> Result<Self, PeerError> {
        Self::builder(config).connect().await
    }

    /// Ask the center for the current value of `key`.
    ///
    /// The value arrives later as an `UPDATE`; until then [`Peer::is_getting`]
    /// reports `true`. Returns the request tag.
    pub async fn get(&self, key: i64) -> Result<String, PeerError> {
        self.inner.get(key).await
    }

    /// Replace the value of `key`, conditional on `origin` when given.
    pub async fn update(
        &self,
        key: i64,
        origin: Option<Value>,
        new: Value,
    ) -> Result<String, PeerError> {
        self.inner.update(key, origin, new).await
    }

    /// Reload the subscription grants this service holds.
    pub async fn refresh_subscriptions(&self) -> Result<String, PeerError> {
        self.inner.post(0, Payload::Subscribes(Vec::new())).await
    }

    /// Ask for the API descriptors of `service_id`.
    pub async fn request_api_list(&self, service_id: i64) -> Result<String, PeerError> {
        let request = ApiList {
            service_id,
            apis: Vec::new(),
        };
        self.inner.post(0, Payload::ApiList(request)).await
    }

    /// Publish a link listener so other peers can find it under `key`.
    pub async fn submit_link(
        &self,
        key: impl Into<String>,
        port: u16,
        token: impl Into<String>,
    ) -> Result<String, PeerError> {
        let apply = LinkApply {
            key: key.into(),
            port,
            token: token.into(),
        };
        self.inner.post(0, Payload::LinkSubmit(apply)).await
    }

    /// Ask the center where the link `key` can be reached.
    pub async fn find_link(&self, key: impl Into<String>) -> Result<String, PeerError> {
        self.inner
            .post(0, Payload::FindLink { key: key.into() })
            .await
    }

    /// Dial the link `key` found earlier with [`Peer::find_link`].
    pub async fn open_link(&self, key: &str, fields: usize) -> Result<Link, PeerError> {
        let info = self
            .link_info(key)
            .ok_or_else(|| PeerError::UnknownLink(key.to_string()))?;
        let config = LinkConfig::from_peer(&self.inner.config);
        Ok(Link::connect(&info, fields, config).await?)
    }

    pub fn value(&self, key: i64) -> Option<Value> {
        self.inner.local.lock().peer_data.get(&key).cloned()
    }

    /// Whether a `GET` for `key` is still unanswered.
    pub fn is_getting(&self, key: i64) -> bool {
        self.inner
            .local
            .lock()
            .get_list
            .get(&key)
            .copied()
            .unwrap_or(false)
    }

    pub fn update_status(&self, key: i64) -> UpdateStatus {
        self.inner
            .local
            .lock()
            .update_requests
            .get(&key)
            .copied()
            .unwrap_or_default()
    }

    /// Grants from the last `SUBSCRIBES` reply, ordered by subscription id.
    pub fn grants(&self) -> Option<Vec<SubscriptionGrant>> {
        let local = self.inner.local.lock();
        let mut grants: Vec<_> = local.subscribe_keys.as_ref()?.values().cloned().collect();
        grants.sort_by_key(|g| g.id);
        Some(grants)
    }

    pub fn api_list(&self, service_id: i64) -> Option<Vec<Api>> {
        self.inner.local.lock().api_lists.get(&service_id).cloned()
    }

    pub fn link_info(&self, key: &str) -> Option<LinkInfo> {
        self.inner.local.lock().link_infos.get(key).cloned()
    }

    /// Copy of the whole local state.
    pub fn snapshot(&self) -> PeerLocalState {
        self.inner.local.lock().clone()
    }

    /// Requests not yet confirmed by the center.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Bad frames left before the session gives up.
    pub fn error_budget(&self) -> u32 {
        self.inner.error_times.load(Ordering::SeqCst)
    }

    pub fn service_id(&self) -> i64 {
        self.inner.config.service_id
    }

    pub fn archive(&self) -> &Arc<dyn DataGramStore> {
        &self.inner.archive
    }

    pub fn state(&self) -> SessionState {
        if self.inner.shutdown.is_triggered() {
            SessionState::Disconnected
        } else {
            SessionState::Active
        }
    }

    /// Stop every task of the session. Unconfirmed requests are abandoned.
    pub fn close(&self) {
        if !self.inner.shutdown.is_triggered() {
            info!(service_id = self.service_id(), "Closing session");
        }
        self.inner.shutdown.trigger();
    }

    /// Resolve once the session has ended.
    pub async fn closed(&self) {
        self.inner.shutdown.signal().recv().await;
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.inner.shutdown.trigger();
    }
}

struct PeerInner {
    config: PeerConfig,
    local: Mutex<PeerLocalState>,
    pending: Arc<PendingSet<DataGram>>,
    outbound: Outbound,
    archive: Arc<dyn DataGramStore>,
    shutdown: Shutdown,
    error_times: AtomicU32,
    on_update: Option<UpdateCallback>,
}

impl PeerInner {
    async fn get(&self, key: i64) -> Result<String, PeerError> {
        if !self.can_read(key) {
            self.local.lock().get_list.insert(key, false);
            return Err(PeerError::NoReadAccess(key));
        }

        self.local.lock().get_list.insert(key, true);
        match self.post(key, Payload::Get { key }).await {
            Ok(tag) => Ok(tag),
            Err(e) => {
                self.local.lock().get_list.insert(key, false);
                Err(e)
            }
        }
    }

    async fn update(&self, key: i64, origin: Option<Value>, new: Value) -> Result<String, PeerError> {
        if !self.can_write(key) {
            return Err(PeerError::NoWriteAccess(key));
        }

        self.local
            .lock()
            .update_requests
            .insert(key, UpdateStatus::Pending);
        match self.post(key, Payload::Update(UpdateRequest { origin, new })).await {
            Ok(tag) => Ok(tag),
            Err(e) => {
                self.set_update_status(key, UpdateStatus::Failed);
                Err(e)
            }
        }
    }

    fn can_read(&self, key: i64) -> bool {
        match &self.local.lock().subscribe_keys {
            Some(grants) => grants.get(&key).is_some_and(|g| g.read),
            None => true,
        }
    }

    fn can_write(&self, key: i64) -> bool {
        match &self.local.lock().subscribe_keys {
            Some(grants) => grants.get(&key).is_some_and(|g| g.write),
            None => true,
        }
    }

    fn set_update_status(&self, key: i64, status: UpdateStatus) {
        self.local.lock().update_requests.insert(key, status);
    }

    /// Archive, track and send a request. Returns its tag.
    async fn post(&self, key: i64, payload: Payload) -> Result<String, PeerError> {
        if self.shutdown.is_triggered() {
            return Err(PeerError::NotConnected);
        }

        let service_id = self.config.service_id;
        let tag = self.pending.fresh_tag(service_id);
        let gram = DataGram::new(tag.clone(), service_id, key, payload);
        let frame: Frame = codec::encode(&gram)?.into();
        let kind = gram.kind();

        archive(self.archive.as_ref(), &gram);
        // Tracked before it is queued so a fast CONFIRM always finds it.
        self.pending.track(tag.clone(), gram, frame.clone());

        if let Err(e) = self.outbound.send(frame).await {
            self.pending.acknowledge(&tag);
            return Err(e.into());
        }

        debug!(service_id, tag = %tag, key, "Sent {}", kind);
        Ok(tag)
    }

    /// Send an untracked envelope.
    async fn reply(&self, key: i64, payload: Payload) {
        let service_id = self.config.service_id;
        let gram = DataGram::new(new_tag(service_id), service_id, key, payload);
        match codec::encode(&gram) {
            Ok(frame) => {
                if let Err(e) = self.outbound.send(frame.into()).await {
                    warn!(service_id, "Failed to send {}: {}", gram.kind(), e);
                }
            }
            Err(e) => error!(service_id, "Failed to encode {}: {}", gram.kind(), e),
        }
    }

    fn reset_error_budget(&self) {
        self.error_times
            .store(self.config.max_error_times, Ordering::SeqCst);
    }

    /// Spend one unit of the error budget. Returns `false` once it is gone.
    fn charge_error(&self, err: &FrameError) -> bool {
        let service_id = self.config.service_id;
        let left = self
            .error_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);

        warn!(service_id, left, "Bad frame from center: {}", err);
        if left == 0 {
            error!(service_id, "Stopped after too many bad frames");
            return false;
        }
        true
    }

    async fn handle(
        self: &Arc<Self>,
        gram: DataGram,
        updates: &mpsc::Sender<(i64, UpdateRequest)>,
        recent: &mut LruCache<String, ()>,
    ) {
        let service_id = self.config.service_id;
        let kind = gram.kind();
        let key = gram.key;
        debug!(service_id, tag = %gram.tag, key, "Received {}", kind);

        match gram.payload {
            Payload::IsActive => self.reply(0, Payload::IsActive).await,
            Payload::Update(update) => {
                self.reply(
                    key,
                    Payload::Confirm {
                        tag: gram.tag.clone(),
                    },
                )
                .await;
                if recent.put(gram.tag, ()).is_some() {
                    debug!(service_id, key, "Duplicate UPDATE, confirmed again");
                    return;
                }
                if updates.send((key, update)).await.is_err() {
                    warn!(service_id, key, "Update worker gone, dropping UPDATE");
                }
            }
            Payload::Success => {
                info!(service_id, key, "Update accepted");
                self.set_update_status(key, UpdateStatus::Succeeded);
            }
            Payload::Confirm { tag } => {
                if self.pending.acknowledge(&tag).is_none() {
                    debug!(service_id, tag = %tag, "CONFIRM for unknown tag");
                }
            }
            Payload::Exception(exception) => self.handle_exception(&gram.tag, key, exception),
            Payload::Subscribes(grants) => {
                info!(service_id, count = grants.len(), "Subscription grants loaded");
                self.local.lock().subscribe_keys =
                    Some(grants.into_iter().map(|g| (g.id, g)).collect());
            }
            Payload::ApiList(list) => {
                self.local
                    .lock()
                    .api_lists
                    .insert(list.service_id, list.apis);
            }
            Payload::Link(info) => {
                self.local
                    .lock()
                    .link_infos
                    .insert(info.key.clone(), info);
            }
            Payload::Failure { reason } => {
                warn!(service_id, "Center reported failure: {}", reason);
            }
            Payload::Connect => debug!(service_id, "Ignoring repeated CONNECT"),
            Payload::Get { .. } | Payload::FindLink { .. } | Payload::LinkSubmit(_) => {
                warn!(service_id, tag = %gram.tag, "Unexpected {} from center", kind);
            }
        }
    }

    fn handle_exception(self: &Arc<Self>, tag: &str, key: i64, exception: ExceptionKind) {
        // An exception is the center's final answer to that request.
        let request = self.pending.acknowledge(tag);
        let request_kind = request.as_ref().map(DataGram::kind);
        self.log_exception(tag, key, &exception, request.as_ref());

        let refused_update = matches!(request_kind, Some(MessageKind::Update) | None);

        match exception {
            ExceptionKind::OriginalDataExpired => {
                self.set_update_status(key, UpdateStatus::Failed);
            }
            ExceptionKind::GetDataFormException => {
                self.local.lock().get_list.clear();
            }
            ExceptionKind::DataLocked => {
                if request_kind == Some(MessageKind::Update) {
                    self.set_update_status(key, UpdateStatus::Failed);
                }
                self.schedule_get_retry(key);
            }
            ExceptionKind::NoSubscribeInfo
            | ExceptionKind::WithoutPermission
            | ExceptionKind::KeyNotExist => {
                let mut local = self.local.lock();
                local.get_list.insert(key, false);
                if refused_update && local.update_requests.get(&key) == Some(&UpdateStatus::Pending) {
                    local.update_requests.insert(key, UpdateStatus::Failed);
                }
            }
            _ => {}
        }
    }

    fn log_exception(&self, tag: &str, key: i64, exception: &ExceptionKind, request: Option<&DataGram>) {
        let service_id = self.config.service_id;

        if let ExceptionKind::Other(name) = exception {
            debug!(service_id, tag, key, "Ignoring unknown exception {}", name);
            return;
        }

        if let Some(request) = request {
            warn!(service_id, tag, key, "{} for {} request", exception, request.kind());
            return;
        }

        match self.archive.lookup(service_id, tag) {
            Ok(Some(stored)) => warn!(
                service_id,
                tag,
                key,
                "{} for archived {} request: {}",
                exception,
                stored.title,
                stored.body
            ),
            Ok(None) => warn!(service_id, tag, key, "{} for unknown request", exception),
            Err(e) => warn!(
                service_id,
                tag,
                key,
                "{} (archive lookup failed: {:#})",
                exception,
                e
            ),
        }
    }

    /// Retry `GET key` after the lock delay unless the session ends first.
    fn schedule_get_retry(self: &Arc<Self>, key: i64) {
        let inner = Arc::clone(self);
        let delay = self.config.locked_retry();
        let mut shutdown = self.shutdown.signal();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = inner.get(key).await {
                        warn!(service_id = inner.config.service_id, key, "GET retry failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {}
            }
        });
    }

    fn apply_update(&self, key: i64, update: UpdateRequest) {
        {
            let mut local = self.local.lock();
            local.peer_data.insert(key, update.new.clone());
            local.get_list.insert(key, false);
        }
        info!(service_id = self.config.service_id, key, "Applied update");

        if let Some(callback) = &self.on_update {
            callback(key, &update);
        }
    }
}

/// Dial and authenticate. Returns the stream halves ready for steady state.
async fn handshake(
    config: &PeerConfig,
) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>), PeerError> {
    let addr = config.center_addr();
    let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr)).await
    {
        Err(_) => return Err(PeerError::ConnectFailed(format!("{}: timed out", addr))),
        Ok(Err(e)) => return Err(PeerError::ConnectFailed(format!("{}: {}", addr, e))),
        Ok(Ok(stream)) => stream,
    };
    stream.set_nodelay(true).ok();

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, config.handshake_frame_size);
    let mut writer = FrameWriter::new(write_half);

    let apply = ConnApply {
        id: config.service_id,
        token: config.token.clone(),
    };
    writer.write_frame(&codec::encode_json(&apply)?).await?;

    let frame = match tokio::time::timeout(config.connect_timeout(), reader.read_frame()).await {
        Err(_) => return Err(PeerError::Handshake("no reply from center".into())),
        Ok(result) => result?
            .ok_or_else(|| PeerError::Handshake("center closed the connection".into()))?,
    };

    let reply = DataGram::try_from(codec::decode(&frame)?)
        .map_err(|e| PeerError::Handshake(e.to_string()))?;
    match reply.payload {
        Payload::Connect => {}
        Payload::Failure { reason } => return Err(PeerError::Refused(reason)),
        other => {
            return Err(PeerError::Handshake(format!(
                "unexpected {} reply",
                other.kind()
            )))
        }
    }

    reader.set_max_frame_size(config.max_frame_size);
    Ok((reader, writer))
}

fn decode_frame(frame: &[u8]) -> Result<DataGram, FrameError> {
    Ok(DataGram::try_from(codec::decode(frame)?)?)
}

async fn run_reader(
    inner: Arc<PeerInner>,
    mut reader: FrameReader<OwnedReadHalf>,
    updates: mpsc::Sender<(i64, UpdateRequest)>,
    mut shutdown: ShutdownSignal,
) {
    let service_id = inner.config.service_id;
    let mut recent = LruCache::new(NonZeroUsize::new(RECENT_UPDATE_TAGS).unwrap_or(NonZeroUsize::MIN));

    loop {
        tokio::select! {
            result = reader.read_frame() => {
                let decoded = match result {
                    Ok(Some(frame)) => decode_frame(&frame),
                    Ok(None) => {
                        info!(service_id, "Center closed the connection");
                        break;
                    }
                    Err(e) if e.is_recoverable() => Err(e.into()),
                    Err(e) => {
                        error!(service_id, "Read error: {}", e);
                        break;
                    }
                };

                match decoded {
                    Ok(gram) => {
                        inner.reset_error_budget();
                        inner.handle(gram, &updates, &mut recent).await;
                    }
                    Err(e) => {
                        if !inner.charge_error(&e) {
                            break;
                        }
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!(service_id, "Reader shutting down");
                break;
            }
        }
    }

    inner.shutdown.trigger();
}

async fn run_worker(
    inner: Arc<PeerInner>,
    mut updates: mpsc::Receiver<(i64, UpdateRequest)>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            next = updates.recv() => {
                let Some((key, update)) = next else { break };
                inner.apply_update(key, update);
            }
            _ = shutdown.recv() => break,
        }
    }
    debug!(service_id = inner.config.service_id, "Update worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmservice::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Scripted center side of one connection.
    struct FakeCenter {
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
    }

    impl FakeCenter {
        async fn accept(listener: &TcpListener, reply: Payload) -> (Self, ConnApply) {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut center = Self {
                reader: FrameReader::new(r, 1 << 20),
                writer: FrameWriter::new(w),
            };
            let frame = center.reader.read_frame().await.unwrap().unwrap();
            let apply: ConnApply = codec::decode_json(&frame).unwrap();
            center.send("CENTER-0", 0, reply).await;
            (center, apply)
        }

        async fn send(&mut self, tag: &str, key: i64, payload: Payload) {
            let gram = DataGram::new(tag, 0, key, payload);
            self.writer
                .write_frame(&codec::encode(&gram).unwrap())
                .await
                .unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_frame(bytes).await.unwrap();
        }

        async fn recv(&mut self) -> DataGram {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            decode_frame(&frame).unwrap()
        }

        async fn recv_nothing(&mut self, wait: Duration) {
            assert!(tokio::time::timeout(wait, self.reader.read_frame())
                .await
                .is_err());
        }
    }

    async fn listener() -> (TcpListener, PeerConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, PeerConfig::new("127.0.0.1", port, 2, "token-2"))
    }

    async fn connected(config: PeerConfig, listener: &TcpListener) -> (Peer, FakeCenter) {
        let builder = Peer::builder(config)
            .archive(Arc::new(MemoryStore::new()))
            .fetch_subscriptions(false);
        let (peer, (center, apply)) =
            tokio::join!(builder.connect(), FakeCenter::accept(listener, Payload::Connect));
        assert_eq!(apply.id, 2);
        assert_eq!(apply.token, "token-2");
        (peer.unwrap(), center)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let (listener, config) = listener().await;
        let builder = Peer::builder(config).archive(Arc::new(MemoryStore::new()));
        let refusal = Payload::Failure {
            reason: "token mismatch for service 2".into(),
        };

        let (result, _) = tokio::join!(builder.connect(), FakeCenter::accept(&listener, refusal));
        match result {
            Err(PeerError::Refused(reason)) => assert!(reason.contains("token mismatch")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("connect should be refused"),
        }
    }

    #[tokio::test]
    async fn test_fetches_subscriptions_on_connect() {
        let (listener, config) = listener().await;
        let builder = Peer::builder(config).archive(Arc::new(MemoryStore::new()));

        let (peer, (mut center, _)) =
            tokio::join!(builder.connect(), FakeCenter::accept(&listener, Payload::Connect));
        let peer = peer.unwrap();

        let request = center.recv().await;
        assert_eq!(request.kind(), MessageKind::Subscribes);
        assert_eq!(peer.pending_count(), 1);
        assert!(peer.grants().is_none());

        center
            .send(&request.tag, 0, Payload::Confirm { tag: request.tag.clone() })
            .await;
        let grants = vec![SubscriptionGrant {
            id: 42,
            key: "shared".into(),
            read: true,
            write: false,
        }];
        center.send(&request.tag, 0, Payload::Subscribes(grants)).await;

        wait_for(|| peer.grants().is_some()).await;
        assert_eq!(peer.pending_count(), 0);

        // Only key 42 is readable now, and nothing is writable.
        assert!(matches!(peer.get(5).await, Err(PeerError::NoReadAccess(5))));
        assert!(!peer.is_getting(5));
        assert!(matches!(
            peer.update(42, None, json!(1)).await,
            Err(PeerError::NoWriteAccess(42))
        ));
        peer.get(42).await.unwrap();
        assert!(peer.is_getting(42));
    }

    #[tokio::test]
    async fn test_heartbeat_echoed_once() {
        let (listener, config) = listener().await;
        let (peer, mut center) = connected(config, &listener).await;

        center.send("BEAT-0", 0, Payload::IsActive).await;
        let echo = center.recv().await;
        assert_eq!(echo.kind(), MessageKind::IsActive);
        assert_eq!(echo.service_id, 2);
        center.recv_nothing(Duration::from_millis(200)).await;

        let state = peer.snapshot();
        assert!(state.peer_data.is_empty());
        assert!(state.get_list.is_empty());
        assert_eq!(peer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_update_applied_confirmed_and_deduplicated() {
        let (listener, config) = listener().await;
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        let builder = Peer::builder(config)
            .archive(Arc::new(MemoryStore::new()))
            .fetch_subscriptions(false)
            .on_update(move |key, update| {
                assert_eq!(key, 42);
                assert_eq!(update.new, json!("v1"));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let (peer, (mut center, _)) =
            tokio::join!(builder.connect(), FakeCenter::accept(&listener, Payload::Connect));
        let peer = peer.unwrap();

        let update = Payload::Update(UpdateRequest {
            origin: None,
            new: json!("v1"),
        });
        center.send("UPD-0", 42, update.clone()).await;
        assert_eq!(
            center.recv().await.payload,
            Payload::Confirm { tag: "UPD-0".into() }
        );
        wait_for(|| peer.value(42) == Some(json!("v1"))).await;

        // A resend of the same envelope is confirmed but not applied twice.
        center.send("UPD-0", 42, update).await;
        assert_eq!(
            center.recv().await.payload,
            Payload::Confirm { tag: "UPD-0".into() }
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert!(!peer.is_getting(42));
    }

    #[tokio::test]
    async fn test_update_outcomes() {
        let (listener, config) = listener().await;
        let (peer, mut center) = connected(config, &listener).await;

        let tag = peer.update(42, None, json!("v1")).await.unwrap();
        assert_eq!(peer.update_status(42), UpdateStatus::Pending);
        let request = center.recv().await;
        assert_eq!(request.tag, tag);
        assert_eq!(
            request.payload,
            Payload::Update(UpdateRequest {
                origin: None,
                new: json!("v1")
            })
        );

        center.send(&tag, 42, Payload::Confirm { tag: tag.clone() }).await;
        center.send(&tag, 42, Payload::Success).await;
        wait_for(|| peer.update_status(42) == UpdateStatus::Succeeded).await;
        assert_eq!(peer.update_status(42).code(), 2);
        assert_eq!(peer.pending_count(), 0);

        let tag = peer
            .update(42, Some(json!("stale")), json!("v2"))
            .await
            .unwrap();
        center.recv().await;
        center
            .send(&tag, 42, Payload::Exception(ExceptionKind::OriginalDataExpired))
            .await;
        wait_for(|| peer.update_status(42) == UpdateStatus::Failed).await;
        assert_eq!(peer.update_status(42).code(), -1);
        assert_eq!(peer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_denied_get_clears_intent() {
        let (listener, config) = listener().await;
        let (peer, mut center) = connected(config, &listener).await;

        let tag = peer.get(5).await.unwrap();
        assert!(peer.is_getting(5));
        assert_eq!(center.recv().await.payload, Payload::Get { key: 5 });

        center.send(&tag, 5, Payload::Confirm { tag: tag.clone() }).await;
        center
            .send(&tag, 5, Payload::Exception(ExceptionKind::WithoutPermission))
            .await;

        wait_for(|| !peer.is_getting(5)).await;
        assert_eq!(peer.pending_count(), 0);
        assert_eq!(peer.archive().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_update_fails() {
        let (listener, config) = listener().await;
        let (peer, mut center) = connected(config, &listener).await;

        let tag = peer.update(99, None, json!("x")).await.unwrap();
        assert_eq!(peer.update_status(99), UpdateStatus::Pending);
        center.recv().await;

        center.send(&tag, 99, Payload::Confirm { tag: tag.clone() }).await;
        center
            .send(&tag, 99, Payload::Exception(ExceptionKind::NoSubscribeInfo))
            .await;

        wait_for(|| peer.update_status(99) == UpdateStatus::Failed).await;
        assert_eq!(peer.pending_count(), 0);
        assert!(!peer.is_getting(99));
    }

    #[tokio::test]
    async fn test_get_data_form_clears_all_intents() {
        let (listener, config) = listener().await;
        let (peer, mut center) = connected(config, &listener).await;

        peer.get(1).await.unwrap();
        let tag = peer.get(2).await.unwrap();
        center.recv().await;
        center.recv().await;

        center
            .send(&tag, 2, Payload::Exception(ExceptionKind::GetDataFormException))
            .await;
        wait_for(|| !peer.is_getting(1) && !peer.is_getting(2)).await;
        assert_eq!(peer.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_locked_get_is_retried() {
        let (listener, mut config) = listener().await;
        config.locked_retry_ms = 100;
        let (peer, mut center) = connected(config, &listener).await;

        let tag = peer.get(7).await.unwrap();
        center.recv().await;
        center
            .send(&tag, 7, Payload::Exception(ExceptionKind::DataLocked))
            .await;

        let retry = center.recv().await;
        assert_eq!(retry.payload, Payload::Get { key: 7 });
        assert_ne!(retry.tag, tag);
        assert!(peer.is_getting(7));
    }

    #[tokio::test]
    async fn test_error_budget_resets_and_exhausts() {
        let (listener, mut config) = listener().await;
        config.max_error_times = 3;
        let (peer, mut center) = connected(config, &listener).await;

        center.send_raw(b"not json").await;
        center.send_raw(b"{\"Tag\":1}").await;
        center.send("BEAT-0", 0, Payload::IsActive).await;
        center.recv().await;
        assert_eq!(peer.error_budget(), 3);
        assert_eq!(peer.state(), SessionState::Active);

        for _ in 0..3 {
            center.send_raw(b"{garbage}").await;
        }
        tokio::time::timeout(Duration::from_secs(5), peer.closed())
            .await
            .unwrap();
        assert_eq!(peer.state(), SessionState::Disconnected);
        assert!(matches!(peer.get(1).await, Err(PeerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_stops_session() {
        let (listener, config) = listener().await;
        let (peer, mut center) = connected(config, &listener).await;

        peer.close();
        peer.closed().await;
        assert!(matches!(
            peer.find_link("video").await,
            Err(PeerError::NotConnected)
        ));

        // The writer shuts the stream down once the session ends.
        let eof = tokio::time::timeout(Duration::from_secs(5), center.reader.read_frame())
            .await
            .unwrap();
        assert!(matches!(eof, Ok(None) | Err(_)));
    }
}
