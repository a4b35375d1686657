// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-to-peer link tunnels.
//!
//! A [`Link`] bundles one or more [`LinkField`]s (TCP connections) under one
//! token. The listening side publishes itself through the center with
//! `LINK_SUBMIT`; the dialing side looks it up with `FIND_LINK` and opens the
//! fields.
//!
//! ```text
//! dialer                          listener
//!   | START(token)  ------------->  |
//!   | <-------------  CONFIRM(tag)  |
//!   | <-------------  SUCCESS       |
//!   | CUSTOM / TRANSFER  <------->  |   each answered with CONFIRM(tag)
//!   | STOP  ---------------------->  |
//! ```
//!
//! `CUSTOM` frames are delivered per field, routed by their custom key.
//! `TRANSFER` frames from every field of a link land in one link-wide channel.
//! Each field keeps its own pending set and error budget; a failing field
//! never affects its siblings.

use kmservice::codec::{self, CodecError};
use kmservice::connection::{spawn_writer, FrameReader, FrameWriter};
use kmservice::pending::spawn_sweeper;
use kmservice::{
    ConfigError, ConnectionError, Frame, LinkGram, LinkInfo, LinkType, Outbound, PeerConfig, PendingSet,
    ResendPolicy, Shutdown, ShutdownSignal,
};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const RECENT_LINK_TAGS: usize = 1024;

/// Link error types.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Link refused: {0}")]
    Refused(String),

    #[error("Link handshake failed: {0}")]
    Handshake(String),

    #[error("A link needs at least one field")]
    NoFields,

    #[error("Link field stopped")]
    Stopped,
}

/// Tunables shared by every field of a link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Service id embedded in generated tags.
    pub sender_id: i64,
    pub max_frame_size: usize,
    pub max_error_times: u32,
    pub outbound_capacity: usize,
    /// Capacity of the custom and transfer delivery channels.
    pub channel_capacity: usize,
    pub handshake_timeout: Duration,
    pub resend: ResendPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            sender_id: 0,
            max_frame_size: 400 * 1024,
            max_error_times: 10,
            outbound_capacity: 256,
            channel_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
            resend: ResendPolicy::default(),
        }
    }
}

impl LinkConfig {
    /// Link settings matching a peer session.
    pub fn from_peer(config: &PeerConfig) -> Self {
        Self {
            sender_id: config.service_id,
            max_frame_size: config.max_frame_size,
            max_error_times: config.max_error_times,
            outbound_capacity: config.outbound_capacity,
            channel_capacity: config.update_queue_capacity,
            handshake_timeout: config.connect_timeout(),
            resend: config.resend_policy(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::InvalidValue("max_frame_size cannot be 0".into()));
        }
        if self.max_error_times == 0 {
            return Err(ConfigError::InvalidValue(
                "max_error_times cannot be 0".into(),
            ));
        }
        if self.outbound_capacity == 0 || self.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue capacities cannot be 0".into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "handshake_timeout cannot be 0".into(),
            ));
        }
        if self.resend.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "resend sweep interval cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Accepts the fields of links opened with one token.
pub struct LinkListener {
    listener: TcpListener,
    token: String,
    config: LinkConfig,
}

impl LinkListener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        token: impl Into<String>,
        config: LinkConfig,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            token: token.into(),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Accept `fields` authenticated fields and group them into a link.
    ///
    /// Connections that fail the `START` handshake are dropped and do not
    /// count.
    pub async fn accept_link(&self, fields: usize) -> Result<Link, LinkError> {
        if fields == 0 {
            return Err(LinkError::NoFields);
        }

        let (transfer_tx, transfer_rx) = mpsc::channel(self.config.channel_capacity);
        let mut accepted = Vec::with_capacity(fields);

        while accepted.len() < fields {
            let (stream, peer_addr) = self.listener.accept().await?;
            match self.open_field(stream, peer_addr, accepted.len(), &transfer_tx).await {
                Ok(field) => accepted.push(field),
                Err(e) => warn!("Rejected link field from {}: {}", peer_addr, e),
            }
        }

        info!(fields, "Link accepted");
        Ok(Link::new(self.token.clone(), accepted, transfer_rx))
    }

    async fn open_field(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        index: usize,
        transfer_tx: &mpsc::Sender<Value>,
    ) -> Result<LinkField, LinkError> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, self.config.max_frame_size);
        let mut writer = FrameWriter::new(write_half);

        let frame = tokio::time::timeout(self.config.handshake_timeout, reader.read_frame())
            .await
            .map_err(|_| LinkError::Handshake("no START in time".into()))??
            .ok_or_else(|| LinkError::Handshake("closed before START".into()))?;
        let start: LinkGram = codec::decode_json(&frame)?;

        if start.kind != LinkType::Start {
            return Err(LinkError::Handshake(format!("expected START, got {:?}", start.kind)));
        }
        if start.body.as_str() != Some(self.token.as_str()) {
            let _ = writer.shutdown().await;
            return Err(LinkError::Refused("token mismatch".into()));
        }

        let confirm = LinkGram::confirm(
            kmservice::new_tag(self.config.sender_id),
            &start.tag,
        );
        writer.write_frame(&codec::encode_json(&confirm)?).await?;
        let success = LinkGram::new(
            kmservice::new_tag(self.config.sender_id),
            LinkType::Success,
            "",
            Value::Null,
        );
        writer.write_frame(&codec::encode_json(&success)?).await?;

        debug!(index, "Link field opened by {}", peer_addr);
        Ok(LinkField::spawn(
            index,
            peer_addr,
            reader,
            writer,
            &self.config,
            transfer_tx.clone(),
        ))
    }
}

/// A group of fields sharing one token.
pub struct Link {
    token: String,
    fields: Vec<LinkField>,
    transfers: tokio::sync::Mutex<mpsc::Receiver<Value>>,
    next: AtomicUsize,
}

impl Link {
    fn new(token: String, fields: Vec<LinkField>, transfers: mpsc::Receiver<Value>) -> Self {
        Self {
            token,
            fields,
            transfers: tokio::sync::Mutex::new(transfers),
            next: AtomicUsize::new(0),
        }
    }

    /// Dial `fields` connections to the listener described by `info`.
    pub async fn connect(info: &LinkInfo, fields: usize, config: LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;
        if fields == 0 {
            return Err(LinkError::NoFields);
        }

        let (transfer_tx, transfer_rx) = mpsc::channel(config.channel_capacity);
        let mut opened = Vec::with_capacity(fields);

        for index in 0..fields {
            let field = dial_field(info, index, &config, &transfer_tx).await;
            match field {
                Ok(field) => opened.push(field),
                Err(e) => {
                    for field in &opened {
                        field.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(key = %info.key, fields, "Link opened to {}:{}", info.host, info.port);
        Ok(Self::new(info.token.clone(), opened, transfer_rx))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Number of fields the link was opened with.
    pub fn link_number(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> Option<&LinkField> {
        self.fields.get(index)
    }

    pub fn fields(&self) -> &[LinkField] {
        &self.fields
    }

    pub fn live_fields(&self) -> usize {
        self.fields.iter().filter(|f| !f.is_stopped()).count()
    }

    /// Send a `TRANSFER` on the next live field, round-robin.
    pub async fn transfer(&self, body: Value) -> Result<String, LinkError> {
        let count = self.fields.len();
        for _ in 0..count {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % count;
            let field = &self.fields[index];
            if field.is_stopped() {
                continue;
            }
            return field.send(LinkType::Transfer, "", body).await;
        }
        Err(LinkError::Stopped)
    }

    /// Next `TRANSFER` body received on any field.
    pub async fn recv_transfer(&self) -> Option<Value> {
        self.transfers.lock().await.recv().await
    }

    /// Send `STOP` on every live field and shut them down.
    pub async fn close(&self) {
        for field in &self.fields {
            field.stop().await;
        }
        debug!(token = %self.token, "Link closed");
    }
}

async fn dial_field(
    info: &LinkInfo,
    index: usize,
    config: &LinkConfig,
    transfer_tx: &mpsc::Sender<Value>,
) -> Result<LinkField, LinkError> {
    let addr = format!("{}:{}", info.host, info.port);
    let stream = tokio::time::timeout(config.handshake_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| LinkError::Handshake(format!("{}: connect timed out", addr)))??;
    stream.set_nodelay(true).ok();
    let peer_addr = stream.peer_addr()?;

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, config.max_frame_size);
    let mut writer = FrameWriter::new(write_half);

    let start = LinkGram::new(
        kmservice::new_tag(config.sender_id),
        LinkType::Start,
        "",
        Value::from(info.token.as_str()),
    );
    writer.write_frame(&codec::encode_json(&start)?).await?;

    tokio::time::timeout(config.handshake_timeout, await_success(&mut reader))
        .await
        .map_err(|_| LinkError::Handshake("no SUCCESS in time".into()))??;

    Ok(LinkField::spawn(
        index,
        peer_addr,
        reader,
        writer,
        config,
        transfer_tx.clone(),
    ))
}

/// Read handshake replies until the listener accepts the field.
async fn await_success(reader: &mut FrameReader<OwnedReadHalf>) -> Result<(), LinkError> {
    loop {
        let Some(frame) = reader.read_frame().await? else {
            return Err(LinkError::Refused("closed during handshake".into()));
        };
        let gram: LinkGram = codec::decode_json(&frame)?;
        match gram.kind {
            LinkType::Success => return Ok(()),
            LinkType::Confirm => {}
            LinkType::Stop => return Err(LinkError::Refused("stopped by listener".into())),
            other => debug!("Ignoring {:?} during handshake", other),
        }
    }
}

/// Where a field delivers what it receives.
#[derive(Clone)]
struct FieldContext {
    index: usize,
    sender_id: i64,
    max_error_times: u32,
    outbound: Outbound,
    pending: Arc<PendingSet<LinkGram>>,
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>,
    unrouted: mpsc::Sender<LinkGram>,
    transfers: mpsc::Sender<Value>,
    stopped: Arc<AtomicBool>,
    shutdown: Shutdown,
}

/// One connection of a link.
pub struct LinkField {
    index: usize,
    peer_addr: SocketAddr,
    ctx: FieldContext,
    unrouted: tokio::sync::Mutex<mpsc::Receiver<LinkGram>>,
    channel_capacity: usize,
}

impl LinkField {
    fn spawn(
        index: usize,
        peer_addr: SocketAddr,
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
        config: &LinkConfig,
        transfers: mpsc::Sender<Value>,
    ) -> Self {
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
            config.resend,
            outbound.clone(),
            shutdown.signal(),
            format!("link-field-{}", index),
        );

        let (unrouted_tx, unrouted_rx) = mpsc::channel(config.channel_capacity);
        let ctx = FieldContext {
            index,
            sender_id: config.sender_id,
            max_error_times: config.max_error_times,
            outbound,
            pending,
            routes: Arc::new(Mutex::new(HashMap::new())),
            unrouted: unrouted_tx,
            transfers,
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: shutdown.clone(),
        };

        tokio::spawn(run_field_reader(ctx.clone(), reader, shutdown.signal()));

        Self {
            index,
            peer_addr,
            ctx,
            unrouted: tokio::sync::Mutex::new(unrouted_rx),
            channel_capacity: config.channel_capacity,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.stopped.load(Ordering::SeqCst)
    }

    /// Frames sent on this field and not yet confirmed.
    pub fn pending_count(&self) -> usize {
        self.ctx.pending.len()
    }

    /// Receive `CUSTOM` bodies sent under `custom_key` on this field.
    ///
    /// Replaces any earlier receiver for the same key.
    pub fn subscribe(&self, custom_key: impl Into<String>) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.ctx.routes.lock().insert(custom_key.into(), tx);
        rx
    }

    /// Next `CUSTOM` frame whose key has no subscriber.
    pub async fn recv_custom(&self) -> Option<LinkGram> {
        self.unrouted.lock().await.recv().await
    }

    /// Send application payload under `custom_key`.
    pub async fn send_custom(&self, custom_key: impl Into<String>, body: Value) -> Result<String, LinkError> {
        self.send(LinkType::Custom, custom_key, body).await
    }

    async fn send(&self, kind: LinkType, custom_key: impl Into<String>, body: Value) -> Result<String, LinkError> {
        if self.is_stopped() {
            return Err(LinkError::Stopped);
        }

        let tag = self.ctx.pending.fresh_tag(self.ctx.sender_id);
        let gram = LinkGram::new(tag.clone(), kind, custom_key, body);
        let frame: Frame = codec::encode_json(&gram)?.into();

        if kind.is_tracked() {
            self.ctx.pending.track(tag.clone(), gram, frame.clone());
        }
        if let Err(e) = self.ctx.outbound.send(frame).await {
            self.ctx.pending.acknowledge(&tag);
            return Err(e.into());
        }
        Ok(tag)
    }

    /// Send `STOP` and shut the field down.
    pub async fn stop(&self) {
        if !self.is_stopped() {
            if let Err(e) = self.send(LinkType::Stop, "", Value::Null).await {
                debug!(index = self.index, "STOP not sent: {}", e);
            }
        }
        self.ctx.stopped.store(true, Ordering::SeqCst);
        self.ctx.shutdown.trigger();
    }

    /// Resolve once the field has stopped.
    pub async fn stopped(&self) {
        self.ctx.shutdown.signal().recv().await;
    }
}

impl Drop for LinkField {
    fn drop(&mut self) {
        self.ctx.shutdown.trigger();
    }
}

impl FieldContext {
    async fn confirm(&self, acked: &str) {
        let reply = LinkGram::confirm(self.pending.fresh_tag(self.sender_id), acked);
        match codec::encode_json(&reply) {
            Ok(frame) => {
                if let Err(e) = self.outbound.send(frame.into()).await {
                    warn!(index = self.index, "Failed to confirm {}: {}", acked, e);
                }
            }
            Err(e) => error!(index = self.index, "Failed to encode CONFIRM: {}", e),
        }
    }

    /// Handle one frame. Returns `false` once the field must stop.
    async fn handle(&self, gram: LinkGram, recent: &mut LruCache<String, ()>) -> bool {
        match gram.kind {
            LinkType::Custom | LinkType::Transfer => {
                self.confirm(&gram.tag).await;
                if recent.put(gram.tag.clone(), ()).is_some() {
                    debug!(index = self.index, tag = %gram.tag, "Duplicate frame, confirmed again");
                    return true;
                }
                self.deliver(gram).await;
            }
            LinkType::Confirm => match gram.body.as_str() {
                Some(acked) => {
                    if self.pending.acknowledge(acked).is_none() {
                        debug!(index = self.index, tag = acked, "CONFIRM for unknown tag");
                    }
                }
                None => warn!(index = self.index, "CONFIRM without a tag"),
            },
            LinkType::Stop => {
                info!(index = self.index, "Link field stopped by remote");
                return false;
            }
            LinkType::Start | LinkType::Success => {
                debug!(index = self.index, "Ignoring {:?} on open field", gram.kind);
            }
        }
        true
    }

    async fn deliver(&self, gram: LinkGram) {
        if gram.kind == LinkType::Transfer {
            if self.transfers.send(gram.body).await.is_err() {
                debug!(index = self.index, "Link dropped, discarding TRANSFER");
            }
            return;
        }

        let route = self.routes.lock().get(&gram.custom_key).cloned();
        match route {
            Some(tx) => {
                let key = gram.custom_key;
                if tx.send(gram.body).await.is_err() {
                    debug!(index = self.index, custom_key = %key, "Subscriber gone");
                    self.routes.lock().remove(&key);
                }
            }
            None => {
                if self.unrouted.send(gram).await.is_err() {
                    debug!(index = self.index, "Field dropped, discarding CUSTOM");
                }
            }
        }
    }
}

async fn run_field_reader(
    ctx: FieldContext,
    mut reader: FrameReader<OwnedReadHalf>,
    mut shutdown: ShutdownSignal,
) {
    let mut budget = ctx.max_error_times;
    let mut recent = LruCache::new(NonZeroUsize::new(RECENT_LINK_TAGS).unwrap_or(NonZeroUsize::MIN));

    loop {
        tokio::select! {
            result = reader.read_frame() => {
                let decoded = match result {
                    Ok(Some(frame)) => codec::decode_json::<LinkGram>(&frame).map_err(LinkError::from),
                    Ok(None) => {
                        debug!(index = ctx.index, "Link field closed by remote");
                        break;
                    }
                    Err(e) if e.is_recoverable() => Err(e.into()),
                    Err(e) => {
                        warn!(index = ctx.index, "Link field read error: {}", e);
                        break;
                    }
                };

                match decoded {
                    Ok(gram) => {
                        budget = ctx.max_error_times;
                        if !ctx.handle(gram, &mut recent).await {
                            break;
                        }
                    }
                    Err(e) => {
                        budget = budget.saturating_sub(1);
                        warn!(index = ctx.index, left = budget, "Bad link frame: {}", e);
                        if budget == 0 {
                            error!(index = ctx.index, "Link field stopped after too many bad frames");
                            break;
                        }
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    ctx.stopped.store(true, Ordering::SeqCst);
    ctx.shutdown.trigger();
}
