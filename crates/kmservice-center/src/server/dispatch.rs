// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection request dispatch.
//!
//! Every request kind is confirmed first, then handled. Replies reuse the
//! request's tag; `UPDATE`s the center sends carry their own tag and stay in
//! the receiving connection's pending set until confirmed.

use super::CenterState;
use crate::directory::Access;
use kmservice::codec::{self, CodecError};
use kmservice::store::archive;
use kmservice::{
    ApiList, DataGram, DataGramStore, ExceptionKind, LinkApply, LinkInfo, Outbound, Payload,
    PendingSet, UpdateRequest, CENTER_SERVICE_ID,
};
use lru::LruCache;
use serde_json::Value;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State of one authenticated connection.
pub struct Session {
    pub service_id: i64,
    pub peer_addr: SocketAddr,
    outbound: Outbound,
    pending: Arc<PendingSet<DataGram>>,
    recent: LruCache<String, ()>,
}

impl Session {
    pub fn new(
        service_id: i64,
        peer_addr: SocketAddr,
        outbound: Outbound,
        pending: Arc<PendingSet<DataGram>>,
        recent_tags: usize,
    ) -> Self {
        Self {
            service_id,
            peer_addr,
            outbound,
            pending,
            recent: LruCache::new(NonZeroUsize::new(recent_tags).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Decode and handle one inbound frame.
    pub async fn handle_frame(&mut self, state: &CenterState, frame: &[u8]) {
        let raw = match codec::decode(frame) {
            Ok(raw) => raw,
            Err(CodecError::Envelope {
                tag: Some(tag),
                key,
                source,
            }) => {
                warn!(service_id = self.service_id, tag = %tag, "Unreadable envelope: {}", source);
                self.exception(&tag, key, ExceptionKind::RequestTypeException)
                    .await;
                return;
            }
            Err(e) => {
                warn!(service_id = self.service_id, "Failed to decode frame: {}", e);
                return;
            }
        };

        match DataGram::try_from(raw) {
            Ok(gram) => self.dispatch(state, gram).await,
            Err(e) => {
                warn!(service_id = self.service_id, "{}", e);
                if e.kind.is_request() {
                    self.confirm(&e.tag, e.key).await;
                    self.exception(&e.tag, e.key, ExceptionKind::data_form_for(e.kind))
                        .await;
                }
            }
        }
    }

    /// Handle one decoded envelope.
    pub async fn dispatch(&mut self, state: &CenterState, gram: DataGram) {
        let kind = gram.kind();
        debug!(service_id = self.service_id, tag = %gram.tag, key = gram.key, "Received {}", kind);

        if kind.is_request() {
            self.confirm(&gram.tag, gram.key).await;
            if self.recent.put(gram.tag.clone(), ()).is_some() {
                debug!(tag = %gram.tag, "Duplicate request, confirmed again");
                return;
            }
        }

        let tag = gram.tag;
        let key = gram.key;

        match gram.payload {
            Payload::Confirm { tag: acked } => {
                if self.pending.acknowledge(&acked).is_none() {
                    debug!(tag = %acked, "CONFIRM for unknown tag");
                }
            }
            Payload::IsActive => {
                debug!(service_id = self.service_id, "Heartbeat");
            }
            Payload::Get { key } => self.handle_get(state, &tag, key).await,
            Payload::Update(request) => self.handle_update(state, &tag, key, request).await,
            Payload::Subscribes(_) => {
                let grants = state.directory.grants_for(self.service_id);
                self.reply(&tag, key, Payload::Subscribes(grants)).await;
            }
            Payload::ApiList(ApiList { service_id, .. }) => {
                let apis = state.directory.apis_of(service_id).unwrap_or_default();
                self.reply(&tag, key, Payload::ApiList(ApiList { service_id, apis }))
                    .await;
            }
            Payload::LinkSubmit(apply) => self.handle_link_submit(state, apply),
            Payload::FindLink { key: link_key } => match state.links.find(&link_key) {
                Some(info) => self.reply(&tag, key, Payload::Link(info)).await,
                None => {
                    self.exception(&tag, key, ExceptionKind::LinkNotExist)
                        .await
                }
            },
            Payload::Exception(exception) => {
                warn!(service_id = self.service_id, tag = %tag, key, "Peer reported {}", exception);
            }
            Payload::Connect | Payload::Success | Payload::Failure { .. } | Payload::Link(_) => {
                self.exception(&tag, key, ExceptionKind::RequestTypeException)
                    .await;
            }
        }
    }

    async fn handle_get(&mut self, state: &CenterState, tag: &str, key: i64) {
        match state.directory.read_access(self.service_id, key) {
            Access::Granted => {}
            Access::Denied => {
                return self
                    .exception(tag, key, ExceptionKind::WithoutPermission)
                    .await
            }
            Access::NoSubscription => {
                return self
                    .exception(tag, key, ExceptionKind::NoSubscribeInfo)
                    .await
            }
        }

        match state.store.get(key) {
            Ok(Some(value)) => {
                let update = Payload::Update(UpdateRequest {
                    origin: None,
                    new: value,
                });
                post_tracked(
                    &self.outbound,
                    &self.pending,
                    state.archive.as_ref(),
                    key,
                    update,
                );
            }
            Ok(None) => self.exception(tag, key, ExceptionKind::KeyNotExist).await,
            Err(_) => self.exception(tag, key, ExceptionKind::DataLocked).await,
        }
    }

    async fn handle_update(
        &mut self,
        state: &CenterState,
        tag: &str,
        key: i64,
        request: UpdateRequest,
    ) {
        match state.directory.write_access(self.service_id, key) {
            Access::Granted => {}
            Access::Denied => {
                return self
                    .exception(tag, key, ExceptionKind::WithoutPermission)
                    .await
            }
            Access::NoSubscription => {
                return self
                    .exception(tag, key, ExceptionKind::NoSubscribeInfo)
                    .await
            }
        }

        let previous = match apply_update(state, key, &request) {
            Ok(previous) => previous,
            Err(kind) => return self.exception(tag, key, kind).await,
        };

        info!(service_id = self.service_id, key, "Updated shared value");
        self.reply(tag, key, Payload::Success).await;

        let update = UpdateRequest {
            origin: previous,
            new: request.new,
        };
        broadcast(state, key, &update);
    }

    fn handle_link_submit(&self, state: &CenterState, apply: LinkApply) {
        let info = LinkInfo {
            key: apply.key,
            host: self.peer_addr.ip().to_string(),
            port: apply.port,
            token: apply.token,
        };
        info!(
            service_id = self.service_id,
            "Link {} published at {}:{}", info.key, info.host, info.port
        );
        state.links.submit(info);
    }

    async fn reply(&self, tag: &str, key: i64, payload: Payload) {
        let gram = DataGram::new(tag, CENTER_SERVICE_ID, key, payload);
        let frame = match codec::encode(&gram) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(tag = %tag, "Failed to encode {}: {}", gram.kind(), e);
                return;
            }
        };
        if let Err(e) = self.outbound.send(frame.into()).await {
            warn!(service_id = self.service_id, tag = %tag, "Failed to send {}: {}", gram.kind(), e);
        }
    }

    async fn confirm(&self, tag: &str, key: i64) {
        let confirm_tag = self.pending.fresh_tag(CENTER_SERVICE_ID);
        self.reply(
            &confirm_tag,
            key,
            Payload::Confirm {
                tag: tag.to_string(),
            },
        )
        .await;
    }

    async fn exception(&self, tag: &str, key: i64, kind: ExceptionKind) {
        debug!(service_id = self.service_id, tag = %tag, key, "Answering {}", kind);
        self.reply(tag, key, Payload::Exception(kind)).await;
    }
}

/// Check and commit an update under the key's lock.
///
/// Returns the previous value, or the exception the writer gets.
fn apply_update(
    state: &CenterState,
    key: i64,
    request: &UpdateRequest,
) -> Result<Option<Value>, ExceptionKind> {
    let guard = state
        .store
        .try_lock(key)
        .map_err(|_| ExceptionKind::DataLocked)?;

    let current = guard.value();
    match (&current, &request.origin) {
        (_, None) => {}
        (None, Some(_)) => return Err(ExceptionKind::KeyNotExist),
        (Some(current), Some(origin)) if current != origin => {
            return Err(ExceptionKind::OriginalDataExpired)
        }
        (Some(_), Some(_)) => {}
    }

    Ok(guard.replace(request.new.clone()))
}

/// Send `update` to every subscriber of `key` with a live connection.
///
/// Delivery failures are logged; the committed value stands.
pub(crate) fn broadcast(state: &CenterState, key: i64, update: &UpdateRequest) -> usize {
    let targets: Vec<_> = {
        let registry = state.registry.read();
        state
            .directory
            .subscribers_of(key)
            .into_iter()
            .filter_map(|service_id| registry.session(service_id))
            .collect()
    };

    let mut sent = 0;
    for target in &targets {
        let payload = Payload::Update(update.clone());
        if post_tracked(
            &target.outbound,
            &target.pending,
            state.archive.as_ref(),
            key,
            payload,
        ) {
            sent += 1;
        } else {
            warn!(service_id = target.service_id, key, "Fan-out UPDATE not delivered, left for resend");
        }
    }
    debug!(key, sent, subscribers = targets.len(), "Fan-out complete");
    sent
}

/// Send a center-originated envelope that stays pending until confirmed.
///
/// Returns whether the frame was queued. It is tracked either way, so a full
/// queue only delays delivery until the next resend.
fn post_tracked(
    outbound: &Outbound,
    pending: &PendingSet<DataGram>,
    store: &dyn DataGramStore,
    key: i64,
    payload: Payload,
) -> bool {
    let gram = DataGram::new(
        pending.fresh_tag(CENTER_SERVICE_ID),
        CENTER_SERVICE_ID,
        key,
        payload,
    );
    let frame: kmservice::Frame = match codec::encode(&gram) {
        Ok(bytes) => bytes.into(),
        Err(e) => {
            error!(key, "Failed to encode {}: {}", gram.kind(), e);
            return false;
        }
    };

    let queued = match outbound.try_send(frame.clone()) {
        Ok(()) => true,
        Err(e) => {
            debug!(tag = %gram.tag, "Queueing failed: {}", e);
            false
        }
    };
    archive(store, &gram);
    pending.track(gram.tag.clone(), gram, frame);
    queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CenterConfig;
    use crate::directory::{DirectorySeed, MicroService, Subscription};
    use crate::server::registry::SessionHandle;
    use kmservice::{MemoryStore, MessageKind, Shutdown};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn service(id: i64) -> MicroService {
        MicroService {
            id,
            name: format!("svc-{}", id),
            root_path: String::new(),
            language: String::new(),
            start_command: String::new(),
            apis: Vec::new(),
            ip: String::new(),
            owner_email: Vec::new(),
            token: format!("token-{}", id),
        }
    }

    fn state() -> CenterState {
        let seed = DirectorySeed {
            services: vec![service(1), service(2)],
            subscriptions: vec![
                Subscription {
                    id: 42,
                    key: "greeting".into(),
                    subscribers: vec![2],
                    writers: vec![1],
                    description: String::new(),
                },
                Subscription {
                    id: 7,
                    key: "counter".into(),
                    subscribers: vec![1, 2],
                    writers: vec![1, 2],
                    description: String::new(),
                },
                Subscription {
                    id: 5,
                    key: "secret".into(),
                    subscribers: vec![1],
                    writers: vec![1],
                    description: String::new(),
                },
            ],
            data: HashMap::from([(7, json!(0))]),
        };
        CenterState::new(CenterConfig::default(), &seed, Arc::new(MemoryStore::new()))
    }

    struct Harness {
        session: Session,
        rx: mpsc::Receiver<kmservice::Frame>,
        pending: Arc<PendingSet<DataGram>>,
    }

    /// A session for `service_id`, pooled in the registry like a real connection.
    fn connect(state: &CenterState, service_id: i64) -> Harness {
        let (outbound, rx) = Outbound::channel(64, 1 << 20);
        let pending = Arc::new(PendingSet::new());
        let addr: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        state
            .registry
            .write()
            .register(SessionHandle::new(
                service_id,
                service_id as u64,
                addr,
                outbound.clone(),
                pending.clone(),
                Shutdown::new(),
            ))
            .unwrap();
        Harness {
            session: Session::new(service_id, addr, outbound, pending.clone(), 16),
            rx,
            pending,
        }
    }

    fn next(rx: &mut mpsc::Receiver<kmservice::Frame>) -> DataGram {
        let frame = rx.try_recv().expect("expected a frame");
        DataGram::try_from(codec::decode(&frame).unwrap()).unwrap()
    }

    fn request(service_id: i64, tag: &str, key: i64, payload: Payload) -> DataGram {
        DataGram::new(tag, service_id, key, payload)
    }

    #[tokio::test]
    async fn test_update_confirms_succeeds_and_fans_out() {
        let state = state();
        let mut writer = connect(&state, 1);
        let mut reader = connect(&state, 2);

        let update = Payload::Update(UpdateRequest {
            origin: None,
            new: json!("v1"),
        });
        writer
            .session
            .dispatch(&state, request(1, "W-1", 42, update))
            .await;

        let confirm = next(&mut writer.rx);
        assert_eq!(confirm.payload, Payload::Confirm { tag: "W-1".into() });
        let success = next(&mut writer.rx);
        assert_eq!(success.payload, Payload::Success);
        assert_eq!(success.tag, "W-1");
        assert_eq!(success.key, 42);

        let fanout = next(&mut reader.rx);
        assert_eq!(fanout.key, 42);
        assert_eq!(
            fanout.payload,
            Payload::Update(UpdateRequest {
                origin: None,
                new: json!("v1"),
            })
        );
        assert!(reader.pending.contains(&fanout.tag));
        assert_eq!(state.store.get(42).unwrap(), Some(json!("v1")));

        // Reader confirms the fan-out.
        reader
            .session
            .dispatch(
                &state,
                request(2, "R-1", 0, Payload::Confirm { tag: fanout.tag }),
            )
            .await;
        assert!(reader.pending.is_empty());
        assert!(reader.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_replies_with_tracked_update() {
        let state = state();
        let mut peer = connect(&state, 2);

        peer.session
            .dispatch(&state, request(2, "G-1", 7, Payload::Get { key: 7 }))
            .await;

        assert_eq!(next(&mut peer.rx).kind(), MessageKind::Confirm);
        let reply = next(&mut peer.rx);
        assert_eq!(reply.key, 7);
        assert_eq!(
            reply.payload,
            Payload::Update(UpdateRequest {
                origin: None,
                new: json!(0),
            })
        );
        assert!(peer.pending.contains(&reply.tag));
        assert_eq!(peer.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_only_center_updates_are_archived() {
        let state = state();
        let mut peer = connect(&state, 2);

        peer.session
            .dispatch(&state, request(2, "G-2", 7, Payload::Get { key: 7 }))
            .await;
        next(&mut peer.rx);
        let reply = next(&mut peer.rx);

        assert_eq!(state.archive.count().unwrap(), 1);
        assert!(state.archive.lookup(2, "G-2").unwrap().is_none());
        let stored = state
            .archive
            .lookup(CENTER_SERVICE_ID, &reply.tag)
            .unwrap()
            .unwrap();
        assert_eq!(stored.key, 7);
    }

    #[tokio::test]
    async fn test_locked_key_yields_data_locked() {
        let state = state();
        let mut peer = connect(&state, 2);
        let guard = state.store.try_lock(7).unwrap();

        peer.session
            .dispatch(&state, request(2, "G-7", 7, Payload::Get { key: 7 }))
            .await;
        assert_eq!(next(&mut peer.rx).kind(), MessageKind::Confirm);
        let locked = next(&mut peer.rx);
        assert_eq!(locked.tag, "G-7");
        assert_eq!(locked.payload, Payload::Exception(ExceptionKind::DataLocked));

        let update = Payload::Update(UpdateRequest {
            origin: None,
            new: json!(1),
        });
        peer.session
            .dispatch(&state, request(2, "U-7", 7, update))
            .await;
        assert_eq!(next(&mut peer.rx).kind(), MessageKind::Confirm);
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Exception(ExceptionKind::DataLocked)
        );

        drop(guard);
        assert_eq!(state.store.get(7).unwrap(), Some(json!(0)));
    }

    /// The answer to request `tag`, skipping confirms and fan-outs.
    fn answer(rx: &mut mpsc::Receiver<kmservice::Frame>, tag: &str) -> Payload {
        loop {
            let gram = next(rx);
            if gram.tag == tag {
                return gram.payload;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_updates_one_wins() {
        let state = Arc::new(state());
        let Harness { session: mut first, rx: mut first_rx, .. } = connect(&state, 1);
        let Harness { session: mut second, rx: mut second_rx, .. } = connect(&state, 2);

        for round in 0..50 {
            let origin = state.store.get(7).unwrap();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let attempt = |mut session: Session, service_id: i64| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                let update = Payload::Update(UpdateRequest {
                    origin: origin.clone(),
                    new: json!(format!("{}-{}", service_id, round)),
                });
                tokio::spawn(async move {
                    let gram = request(service_id, &format!("C{}-{}", service_id, round), 7, update);
                    barrier.wait().await;
                    session.dispatch(&state, gram).await;
                    session
                })
            };
            let (a, b) = (attempt(first, 1), attempt(second, 2));
            first = a.await.unwrap();
            second = b.await.unwrap();

            let outcomes = [
                (1, answer(&mut first_rx, &format!("C1-{}", round))),
                (2, answer(&mut second_rx, &format!("C2-{}", round))),
            ];
            while first_rx.try_recv().is_ok() {}
            while second_rx.try_recv().is_ok() {}

            let winners: Vec<i64> = outcomes
                .iter()
                .filter(|(_, payload)| *payload == Payload::Success)
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(winners.len(), 1, "round {}: {:?}", round, outcomes);
            for (_, payload) in &outcomes {
                assert!(matches!(
                    payload,
                    Payload::Success
                        | Payload::Exception(ExceptionKind::DataLocked)
                        | Payload::Exception(ExceptionKind::OriginalDataExpired)
                ));
            }
            assert_eq!(
                state.store.get(7).unwrap(),
                Some(json!(format!("{}-{}", winners[0], round)))
            );
        }
    }

    #[tokio::test]
    async fn test_authorization() {
        let state = state();
        let mut peer = connect(&state, 2);

        peer.session
            .dispatch(&state, request(2, "G-5", 5, Payload::Get { key: 5 }))
            .await;
        next(&mut peer.rx);
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Exception(ExceptionKind::WithoutPermission)
        );

        let update = Payload::Update(UpdateRequest {
            origin: None,
            new: json!("x"),
        });
        peer.session
            .dispatch(&state, request(2, "U-42", 42, update))
            .await;
        next(&mut peer.rx);
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Exception(ExceptionKind::WithoutPermission)
        );

        peer.session
            .dispatch(&state, request(2, "G-99", 99, Payload::Get { key: 99 }))
            .await;
        next(&mut peer.rx);
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Exception(ExceptionKind::NoSubscribeInfo)
        );
        assert_eq!(state.store.get(42).unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_origin_is_refused() {
        let state = state();
        let mut peer = connect(&state, 1);

        let stale = Payload::Update(UpdateRequest {
            origin: Some(json!(41)),
            new: json!(1),
        });
        peer.session.dispatch(&state, request(1, "U-1", 7, stale)).await;
        next(&mut peer.rx);
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Exception(ExceptionKind::OriginalDataExpired)
        );

        let missing = Payload::Update(UpdateRequest {
            origin: Some(json!("old")),
            new: json!("new"),
        });
        peer.session
            .dispatch(&state, request(1, "U-2", 42, missing))
            .await;
        next(&mut peer.rx);
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Exception(ExceptionKind::KeyNotExist)
        );

        let current = Payload::Update(UpdateRequest {
            origin: Some(json!(0)),
            new: json!(1),
        });
        peer.session
            .dispatch(&state, request(1, "U-3", 7, current))
            .await;
        next(&mut peer.rx);
        assert_eq!(next(&mut peer.rx).payload, Payload::Success);
        assert_eq!(state.store.get(7).unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_duplicate_request_confirmed_not_reapplied() {
        let state = state();
        let mut peer = connect(&state, 2);

        let get = request(2, "DUP-2", 7, Payload::Get { key: 7 });
        peer.session.dispatch(&state, get.clone()).await;
        peer.session.dispatch(&state, get).await;

        assert_eq!(next(&mut peer.rx).kind(), MessageKind::Confirm);
        assert_eq!(next(&mut peer.rx).kind(), MessageKind::Update);
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Confirm {
                tag: "DUP-2".into()
            }
        );
        assert!(peer.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_body_answered_with_data_form_exception() {
        let state = state();
        let mut peer = connect(&state, 2);

        let frame = br#"{"Tag":"BAD-2","ServiceId":2,"Data":{"Title":"GET","Key":7,"Body":"seven"}}"#;
        peer.session.handle_frame(&state, frame).await;
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Confirm {
                tag: "BAD-2".into()
            }
        );
        let reply = next(&mut peer.rx);
        assert_eq!(reply.tag, "BAD-2");
        assert_eq!(
            reply.payload,
            Payload::Exception(ExceptionKind::GetDataFormException)
        );

        let frame = br#"{"Tag":"ODD-2","ServiceId":2,"Data":{"Title":"REBOOT","Key":1}}"#;
        peer.session.handle_frame(&state, frame).await;
        let reply = next(&mut peer.rx);
        assert_eq!(reply.tag, "ODD-2");
        assert_eq!(
            reply.payload,
            Payload::Exception(ExceptionKind::RequestTypeException)
        );
    }

    #[tokio::test]
    async fn test_non_request_kind_rejected() {
        let state = state();
        let mut peer = connect(&state, 2);

        peer.session
            .dispatch(&state, request(2, "S-2", 0, Payload::Success))
            .await;
        assert_eq!(
            next(&mut peer.rx).payload,
            Payload::Exception(ExceptionKind::RequestTypeException)
        );
    }

    #[tokio::test]
    async fn test_subscribes_and_api_list() {
        let state = state();
        let mut peer = connect(&state, 2);

        peer.session
            .dispatch(&state, request(2, "S-1", 0, Payload::Subscribes(Vec::new())))
            .await;
        next(&mut peer.rx);
        match next(&mut peer.rx).payload {
            Payload::Subscribes(grants) => {
                let ids: Vec<_> = grants.iter().map(|g| g.id).collect();
                assert_eq!(ids, vec![7, 42]);
                assert!(grants[1].read && !grants[1].write);
            }
            other => panic!("unexpected {:?}", other),
        }

        let ask = Payload::ApiList(ApiList {
            service_id: 1,
            apis: Vec::new(),
        });
        peer.session.dispatch(&state, request(2, "A-1", 0, ask)).await;
        next(&mut peer.rx);
        assert!(matches!(
            next(&mut peer.rx).payload,
            Payload::ApiList(ApiList { service_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_link_submit_and_find() {
        let state = state();
        let mut owner = connect(&state, 1);
        let mut finder = connect(&state, 2);

        let apply = Payload::LinkSubmit(LinkApply {
            key: "video".into(),
            port: 9300,
            token: "link-token".into(),
        });
        owner.session.dispatch(&state, request(1, "L-1", 0, apply)).await;
        assert_eq!(next(&mut owner.rx).kind(), MessageKind::Confirm);
        assert!(owner.rx.try_recv().is_err());

        finder
            .session
            .dispatch(
                &state,
                request(2, "F-1", 0, Payload::FindLink { key: "video".into() }),
            )
            .await;
        next(&mut finder.rx);
        assert_eq!(
            next(&mut finder.rx).payload,
            Payload::Link(LinkInfo {
                key: "video".into(),
                host: "10.1.2.3".into(),
                port: 9300,
                token: "link-token".into(),
            })
        );

        finder
            .session
            .dispatch(
                &state,
                request(2, "F-2", 0, Payload::FindLink { key: "audio".into() }),
            )
            .await;
        next(&mut finder.rx);
        assert_eq!(
            next(&mut finder.rx).payload,
            Payload::Exception(ExceptionKind::LinkNotExist)
        );
    }
}
