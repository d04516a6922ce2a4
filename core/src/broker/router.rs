//! Message routing core.
//!
//! A single [`MessageRouter`] task owns the channel registry and the task
//! queues and consumes [`RouterEvent`]s from every connection. Exactly one
//! event is processed at a time and routing logic between suspension points
//! runs to completion, so the core data structures need no locks and broker
//! events have a total order per peer.
//!
//! Forwarded `req`/`res` traffic is routed as the received bytes, never
//! re-encoded: header string lengths use a variable-width encoding, and
//! re-encoding could normalize and change sizes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::metrics::BrokerMetrics;
use crate::protocol::{
    ChannelName, ContentType, ErrorCode, Message, MessageCodec, MessageId, MonitorMessage, Payload,
    PublishMessage, PullMessage, PushMessage, RequestMessage, ResponseMessage, TopicName,
};
use crate::queues::{PushTask, TaskQueues};
use crate::registry::{ChannelRegistry, FrameSender, NamePattern, PeerId};
use crate::{RelayError, Result};

/// In-process handler serving a response topic on the broker's own channel.
pub type LocalHandler =
    Box<dyn Fn(&RequestMessage) -> std::result::Result<Payload, ErrorCode> + Send>;

/// Input to the routing task.
pub enum RouterEvent {
    /// A peer connection is up; `sender` is its outbound frame queue.
    Connected { peer: PeerId, sender: FrameSender },
    /// One whole frame received from `peer`, length prefix included.
    Frame { peer: PeerId, frame: Bytes },
    /// The peer's connection closed; cascade channel and monitor cleanup.
    Disconnected { peer: PeerId },
    /// Broker-originated request to a registered channel.
    LocalRequest {
        target: ChannelName,
        topic: TopicName,
        payload: Payload,
        reply: oneshot::Sender<Result<ResponseMessage>>,
    },
    /// Install an in-process response handler on the broker's channel.
    AddLocalHandler {
        topic: TopicName,
        handler: LocalHandler,
    },
}

const INTERNAL_TOPICS: &[&str] = &[
    "register",
    "addResponseListener",
    "addPullListener",
    "addSubscribeListener",
    "getChannels",
    "watchChannels",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenerParams {
    topic: String,
    #[serde(default)]
    options: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PatternType {
    #[default]
    Glob,
    Regexp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetChannelsParams {
    channel_name: String,
    #[serde(rename = "type", default)]
    pattern_type: PatternType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchChannelsParams {
    channel_name: String,
}

struct PendingRequest {
    target: ChannelName,
    reply: oneshot::Sender<Result<ResponseMessage>>,
}

/// The single routing context: classifies inbound messages, runs internal
/// handlers, forwards inter-channel traffic, and drives the task queues.
pub struct MessageRouter {
    name: ChannelName,
    registry: ChannelRegistry,
    queues: TaskQueues,
    peers: HashMap<PeerId, FrameSender>,
    local_handlers: HashMap<TopicName, LocalHandler>,
    pending: HashMap<MessageId, PendingRequest>,
    codec: MessageCodec,
    next_id: MessageId,
    metrics: Arc<BrokerMetrics>,
}

impl MessageRouter {
    pub fn new(name: impl Into<ChannelName>, metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            name: name.into(),
            registry: ChannelRegistry::new(),
            queues: TaskQueues::new(),
            peers: HashMap::new(),
            local_handlers: HashMap::new(),
            pending: HashMap::new(),
            codec: MessageCodec::new(),
            next_id: 0,
            metrics,
        }
    }

    /// Consume events until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RouterEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("router event channel closed; routing task exiting");
    }

    pub(crate) fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Connected { peer, sender } => {
                self.peers.insert(peer, sender);
            }
            RouterEvent::Frame { peer, frame } => self.handle_frame(peer, frame),
            RouterEvent::Disconnected { peer } => self.cleanup_peer(peer),
            RouterEvent::LocalRequest {
                target,
                topic,
                payload,
                reply,
            } => self.handle_local_request(target, topic, payload, reply),
            RouterEvent::AddLocalHandler { topic, handler } => {
                self.local_handlers.insert(topic, handler);
            }
        }
    }

    fn handle_frame(&mut self, peer: PeerId, frame: Bytes) {
        self.metrics.frame_received();
        let message = match MessageCodec::decode(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!("closing peer {}: {}", peer, err);
                self.metrics.protocol_error();
                self.cleanup_peer(peer);
                return;
            }
        };
        debug!(
            "peer {}: {} '{}'",
            peer,
            message.kind().as_str(),
            message.topic()
        );
        match message {
            Message::Request(req) => self.handle_request(peer, req, frame),
            Message::BrokerRequest(req) => self.handle_broker_addressed(peer, req, None),
            Message::Response(res) => self.handle_response(res, frame),
            Message::Push(push) => self.handle_push(push),
            Message::Publish(publish) => self.handle_publish(publish, frame),
            Message::Ack(ack) => {
                if self.queues.ack(&ack.topic, ack.id) {
                    self.metrics.push_item_acked();
                } else {
                    debug!("ack {} on '{}' matches no in-flight item", ack.id, ack.topic);
                }
            }
            other => warn!(
                "peer {} sent '{}' as a top-level message; dropped",
                peer,
                other.kind().as_str()
            ),
        }
    }

    /// `req` dispatch: forward to the target channel's socket as the exact
    /// received bytes, or hand it to the broker's own channel.
    fn handle_request(&mut self, peer: PeerId, req: RequestMessage, frame: Bytes) {
        if req.target == self.name {
            self.handle_broker_addressed(peer, req, Some(frame));
            return;
        }
        let delivered = match self.registry.get(&req.target) {
            Some(channel) => channel.sender.send(frame).is_ok(),
            None => false,
        };
        if delivered {
            self.metrics.message_forwarded();
        } else {
            debug!(
                "req '{}' addressed to unknown channel '{}'",
                req.topic, req.target
            );
            let res = ResponseMessage::error_reply(&req, &self.name, ErrorCode::TargetChannelNonexistent);
            self.respond(peer, res);
        }
    }

    /// A request owned by the broker's channel. `frame` is present for
    /// `req` (enabling the response-topic fallback forward) and absent for
    /// `sreq`, which is restricted to broker-local handlers.
    fn handle_broker_addressed(&mut self, peer: PeerId, req: RequestMessage, frame: Option<Bytes>) {
        if INTERNAL_TOPICS.contains(&req.topic.as_str()) {
            self.handle_internal(peer, req);
            return;
        }

        if let Some(handler) = self.local_handlers.get(&req.topic) {
            let outcome = handler(&req);
            let res = match outcome {
                Ok(payload) => ResponseMessage::reply_to(&req, &self.name, payload),
                Err(code) => ResponseMessage::error_reply(&req, &self.name, code),
            };
            self.respond(peer, res);
            return;
        }

        if let Some(frame) = frame {
            let fallback = self
                .registry
                .find_response_topic(&req.target, &req.topic)
                .map(|channel| channel.sender.clone());
            if let Some(sender) = fallback {
                if sender.send(frame).is_ok() {
                    self.metrics.message_forwarded();
                    return;
                }
            }
        }

        let res = ResponseMessage::error_reply(&req, &self.name, ErrorCode::TopicNonexistent);
        self.respond(peer, res);
    }

    fn handle_response(&mut self, res: ResponseMessage, frame: Bytes) {
        if res.target == self.name {
            match self.pending.remove(&res.id) {
                Some(pending) => {
                    let _ = pending.reply.send(Ok(res));
                }
                None => debug!("response {} arrived with no waiter", res.id),
            }
            return;
        }
        let delivered = self
            .registry
            .get(&res.target)
            .map(|channel| channel.sender.send(frame).is_ok())
            .unwrap_or(false);
        if delivered {
            self.metrics.message_forwarded();
        } else {
            // The originator died while the request was in flight.
            debug!("dropping response for dead target '{}'", res.target);
        }
    }

    fn handle_push(&mut self, push: PushMessage) {
        let PushMessage {
            content_type,
            topic,
            source,
            items,
            ..
        } = push;
        self.metrics.push_items_enqueued(items.len() as u64);
        let tasks = items
            .into_iter()
            .map(|payload| PushTask {
                source: source.clone(),
                topic: topic.clone(),
                content_type,
                payload,
            })
            .collect();
        self.queues.enqueue_push(&topic, tasks);
        self.dispatch_pull(&topic);
    }

    /// Hand queued items to workers round-robin until the backlog drains or
    /// no worker is left. A member that vanished from the registry between
    /// two dispatch attempts is dropped and its task reassigned.
    fn dispatch_pull(&mut self, topic: &str) {
        let Self {
            registry,
            queues,
            codec,
            next_id,
            metrics,
            ..
        } = self;
        let Some(queue) = queues.pull_queue_mut(topic) else {
            return;
        };

        while let Some((worker, task)) = queue.next_assignment() {
            let Some(channel) = registry.get(&worker) else {
                queue.remove_member(&worker);
                queue.requeue_front(task);
                continue;
            };

            *next_id += 1;
            let id = *next_id;
            let message = Message::Pull(PullMessage {
                id,
                content_type: task.content_type,
                topic: task.topic.clone(),
                source: task.source.clone(),
                payload: task.payload.clone(),
            });
            match codec.encode(&message) {
                Ok(frame) => {
                    if channel.sender.send(frame).is_ok() {
                        metrics.push_item_dispatched();
                        queue.begin_flight(id, worker, task);
                    } else {
                        queue.remove_member(&worker);
                        queue.requeue_front(task);
                    }
                }
                Err(err) => {
                    warn!("dropping undeliverable pull item on '{}': {}", topic, err);
                }
            }
        }
    }

    /// Fan a publication out to every current subscriber. Delivery is best
    /// effort per socket: a failed write closes that subscriber only.
    fn handle_publish(&mut self, publish: PublishMessage, frame: Bytes) {
        let members = self.queues.subscribers(&publish.topic).to_vec();
        if members.is_empty() {
            debug!("publish on '{}' has no subscribers", publish.topic);
            return;
        }
        let mut dead = Vec::new();
        for name in &members {
            if let Some(channel) = self.registry.get(name) {
                if channel.sender.send(frame.clone()).is_err() {
                    warn!("failed to deliver publish to '{}'; closing it", name);
                    dead.push(channel.peer);
                }
            }
        }
        self.metrics.publish_routed();
        for peer in dead {
            self.cleanup_peer(peer);
        }
    }

    fn handle_internal(&mut self, peer: PeerId, req: RequestMessage) {
        match req.topic.as_str() {
            "register" => {
                let res = self.internal_register(peer, &req);
                self.respond(peer, res);
            }
            "addResponseListener" => {
                let res = match self.parse_params::<ListenerParams>(&req) {
                    Ok(params) => {
                        let result = self.registry.add_response(peer, &params.topic);
                        self.listener_reply(&req, result)
                    }
                    Err(res) => res,
                };
                self.respond(peer, res);
            }
            "addPullListener" => {
                let (res, dispatch) = match self.parse_params::<ListenerParams>(&req) {
                    Ok(params) => {
                        match self.registry.add_pull(peer, &params.topic, params.options) {
                            Some(name) => {
                                self.queues.add_pull_member(&params.topic, &name);
                                (self.listener_reply(&req, true), Some(params.topic))
                            }
                            None => (self.listener_reply(&req, false), None),
                        }
                    }
                    Err(res) => (res, None),
                };
                self.respond(peer, res);
                // A fresh worker may pick up tasks held while the queue was
                // empty; the confirmation above is already in its queue.
                if let Some(topic) = dispatch {
                    self.dispatch_pull(&topic);
                }
            }
            "addSubscribeListener" => {
                let res = match self.parse_params::<ListenerParams>(&req) {
                    Ok(params) => {
                        match self
                            .registry
                            .add_subscribe(peer, &params.topic, params.options)
                        {
                            Some(name) => {
                                self.queues.add_subscribe_member(&params.topic, &name);
                                self.listener_reply(&req, true)
                            }
                            None => self.listener_reply(&req, false),
                        }
                    }
                    Err(res) => res,
                };
                self.respond(peer, res);
            }
            "getChannels" => {
                let res = self.internal_get_channels(&req);
                self.respond(peer, res);
            }
            "watchChannels" => {
                let res = self.internal_watch_channels(peer, &req);
                self.respond(peer, res);
            }
            other => {
                debug!("internal dispatch missed topic '{}'", other);
                let res = ResponseMessage::error_reply(&req, &self.name, ErrorCode::TopicNonexistent);
                self.respond(peer, res);
            }
        }
    }

    fn internal_register(&mut self, peer: PeerId, req: &RequestMessage) -> ResponseMessage {
        let Some(sender) = self.peers.get(&peer).cloned() else {
            return ResponseMessage::error_reply(req, &self.name, ErrorCode::RegisterFail);
        };
        match self.registry.register(&req.source, peer, sender) {
            Some(name) => {
                self.emit_channel_event("register", &name);
                ResponseMessage {
                    id: req.id,
                    content_type: ContentType::Json,
                    error: ErrorCode::None,
                    topic: req.topic.clone(),
                    source: self.name.clone(),
                    target: name.clone(),
                    payload: Payload::json(json!({ "channelName": name })),
                }
            }
            None => ResponseMessage::error_reply(req, &self.name, ErrorCode::RegisterFail),
        }
    }

    fn internal_get_channels(&mut self, req: &RequestMessage) -> ResponseMessage {
        let params: GetChannelsParams = match self.parse_params(req) {
            Ok(params) => params,
            Err(res) => return res,
        };
        let pattern = match params.pattern_type {
            PatternType::Glob => NamePattern::glob(&params.channel_name),
            PatternType::Regexp => NamePattern::regexp(&params.channel_name),
        };
        match pattern {
            Ok(pattern) => {
                let channels = self.registry.find_channel_names(&pattern);
                ResponseMessage::reply_to(req, &self.name, Payload::json(json!({ "channels": channels })))
            }
            Err(err) => {
                debug!("unparseable channel pattern '{}': {}", params.channel_name, err);
                ResponseMessage::error_reply(req, &self.name, ErrorCode::InvalidParameter)
            }
        }
    }

    fn internal_watch_channels(&mut self, peer: PeerId, req: &RequestMessage) -> ResponseMessage {
        let params: WatchChannelsParams = match self.parse_params(req) {
            Ok(params) => params,
            Err(res) => return res,
        };
        let Some(sender) = self.peers.get(&peer).cloned() else {
            return ResponseMessage::error_reply(req, &self.name, ErrorCode::InvalidParameter);
        };
        match NamePattern::glob(&params.channel_name) {
            Ok(pattern) => {
                let names = self.registry.add_monitor(pattern, peer, sender);
                ResponseMessage::reply_to(
                    req,
                    &self.name,
                    Payload::json(json!({
                        "result": true,
                        "channelPattern": params.channel_name,
                        "channelNames": names,
                    })),
                )
            }
            Err(err) => {
                debug!("unparseable watch pattern '{}': {}", params.channel_name, err);
                ResponseMessage::error_reply(req, &self.name, ErrorCode::InvalidParameter)
            }
        }
    }

    fn handle_local_request(
        &mut self,
        target: ChannelName,
        topic: TopicName,
        payload: Payload,
        reply: oneshot::Sender<Result<ResponseMessage>>,
    ) {
        let Some(sender) = self.registry.get(&target).map(|c| c.sender.clone()) else {
            let _ = reply.send(Err(RelayError::ChannelNotFound(target)));
            return;
        };
        self.next_id += 1;
        let id = self.next_id;
        let message = Message::Request(RequestMessage {
            id,
            content_type: payload.content_type(),
            error: ErrorCode::None,
            topic,
            source: self.name.clone(),
            target: target.clone(),
            payload,
        });
        match self.codec.encode(&message) {
            Ok(frame) => {
                if sender.send(frame).is_ok() {
                    self.pending.insert(id, PendingRequest { target, reply });
                } else {
                    let _ = reply.send(Err(RelayError::ChannelNotFound(target)));
                }
            }
            Err(err) => {
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    /// Tear down everything owned by `peer`: its outbound queue, its
    /// channel, its queue memberships, and its monitors. Reclaimed pull
    /// work is redispatched to surviving workers afterwards. Idempotent.
    fn cleanup_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        let Some(channel) = self.registry.remove_peer(peer) else {
            return;
        };
        let name = channel.name.clone();
        drop(channel);

        let requeued = self.queues.remove_channel(&name);
        self.emit_channel_event("unregister", &name);
        self.fail_pending_for(&name);
        for topic in requeued {
            self.dispatch_pull(&topic);
        }
        info!("channel '{}' unregistered (peer {})", name, peer);
    }

    fn fail_pending_for(&mut self, target: &str) {
        let stale: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.target == target)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending
                    .reply
                    .send(Err(RelayError::ChannelNotFound(target.to_string())));
            }
        }
    }

    fn emit_channel_event(&mut self, event: &str, name: &str) {
        let senders = self.registry.monitors_matching(name);
        for sender in senders {
            self.next_id += 1;
            let message = Message::Monitor(MonitorMessage {
                id: self.next_id,
                content_type: ContentType::Json,
                payload: Payload::json(json!({ "event": event, "channel": name })),
            });
            match self.codec.encode(&message) {
                Ok(frame) => {
                    let _ = sender.send(frame);
                }
                Err(err) => warn!("failed to encode monitor event: {}", err),
            }
        }
    }

    fn listener_reply(&self, req: &RequestMessage, result: bool) -> ResponseMessage {
        ResponseMessage::reply_to(req, &self.name, Payload::json(json!({ "result": result })))
    }

    fn parse_params<T: DeserializeOwned>(
        &self,
        req: &RequestMessage,
    ) -> std::result::Result<T, ResponseMessage> {
        let Some(value) = req.payload.as_json() else {
            return Err(ResponseMessage::error_reply(
                req,
                &self.name,
                ErrorCode::InvalidParameter,
            ));
        };
        serde_json::from_value(value.clone()).map_err(|err| {
            debug!("invalid payload for internal '{}': {}", req.topic, err);
            ResponseMessage::error_reply(req, &self.name, ErrorCode::InvalidParameter)
        })
    }

    fn respond(&mut self, peer: PeerId, res: ResponseMessage) {
        let Some(sender) = self.peers.get(&peer).cloned() else {
            debug!("response for departed peer {} dropped", peer);
            return;
        };
        match self.codec.encode(&Message::Response(res)) {
            Ok(frame) => {
                let _ = sender.send(frame);
            }
            Err(err) => warn!("failed to encode response: {}", err),
        }
    }
}
