//! End-to-end broker scenarios over real TCP sockets.
//!
//! Each test spawns a broker on a free port and drives it with wire-level
//! clients built on the crate's own codec.

use bytes::Bytes;
use futures::SinkExt;
use relaymq::protocol::{
    AckMessage, ContentType, ErrorCode, FrameCodec, Message, MessageCodec, Payload, PublishMessage,
    PushMessage, RequestMessage, ResponseMessage,
};
use relaymq::{BrokerConfig, BrokerHandle, BrokerServer};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind probe")
        .local_addr()
        .expect("local addr")
        .port()
}

async fn spawn_broker() -> (SocketAddr, BrokerHandle) {
    let port = free_port();
    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..Default::default()
    };
    let server = BrokerServer::new(config).expect("broker server");
    let handle = server.handle();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().expect("addr");
    (addr, handle)
}

struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
    codec: MessageCodec,
    name: String,
    next_id: u64,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        // The broker task may still be binding; retry briefly.
        for _ in 0..50 {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    return Self {
                        framed: Framed::new(stream, FrameCodec::new()),
                        codec: MessageCodec::new(),
                        name: String::new(),
                        next_id: 0,
                    }
                }
                Err(_) => sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("broker at {} never came up", addr);
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Encode and send, returning the exact frame that went on the wire.
    async fn send(&mut self, message: &Message) -> Bytes {
        let frame = self.codec.encode(message).expect("encode");
        self.framed.send(frame.clone()).await.expect("send");
        frame
    }

    async fn recv_raw(&mut self) -> Bytes {
        timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("frame error")
    }

    async fn recv(&mut self) -> Message {
        let frame = self.recv_raw().await;
        MessageCodec::decode(&frame).expect("decode")
    }

    /// Assert that nothing arrives for a little while.
    async fn recv_none(&mut self, wait: Duration) {
        if let Ok(frame) = timeout(wait, self.framed.next()).await {
            panic!("expected silence, got {:?}", frame);
        }
    }

    async fn broker_request(&mut self, topic: &str, payload: Payload) -> ResponseMessage {
        let id = self.next_id();
        self.send(&Message::Request(RequestMessage {
            id,
            content_type: payload.content_type(),
            error: ErrorCode::None,
            topic: topic.to_string(),
            source: self.name.clone(),
            target: "broker".to_string(),
            payload,
        }))
        .await;
        match self.recv().await {
            Message::Response(res) => {
                assert_eq!(res.id, id, "response correlates by id");
                res
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    async fn register(&mut self, requested: &str) -> String {
        let id = self.next_id();
        self.send(&Message::Request(RequestMessage {
            id,
            content_type: ContentType::Json,
            error: ErrorCode::None,
            topic: "register".to_string(),
            source: requested.to_string(),
            target: "broker".to_string(),
            payload: Payload::empty_json(),
        }))
        .await;
        match self.recv().await {
            Message::Response(res) => {
                assert!(!res.has_error(), "register failed: {:?}", res.error);
                let name = res.payload.as_json().expect("json")["channelName"]
                    .as_str()
                    .expect("channelName")
                    .to_string();
                self.name = name.clone();
                name
            }
            other => panic!("expected register response, got {:?}", other),
        }
    }

    async fn add_listener(&mut self, internal_topic: &str, topic: &str) {
        let res = self
            .broker_request(internal_topic, Payload::json(json!({ "topic": topic })))
            .await;
        assert!(!res.has_error());
        assert_eq!(res.payload.as_json().expect("json")["result"], json!(true));
    }

    async fn expect_pull(&mut self) -> (u64, String) {
        match self.recv().await {
            Message::Pull(pull) => match pull.payload {
                Payload::Text(text) => (pull.id, text),
                other => panic!("unexpected pull payload {:?}", other),
            },
            other => panic!("expected pull item, got {:?}", other),
        }
    }

    async fn ack(&mut self, id: u64, topic: &str) {
        self.send(&Message::Ack(AckMessage {
            id,
            topic: topic.to_string(),
        }))
        .await;
    }
}

#[tokio::test]
async fn register_and_respond() {
    let (addr, _handle) = spawn_broker().await;

    let mut alpha = TestClient::connect(addr).await;
    assert_eq!(alpha.register("alpha").await, "alpha");
    alpha.add_listener("addResponseListener", "ping").await;

    let mut beta = TestClient::connect(addr).await;
    assert_eq!(beta.register("beta").await, "beta");

    let req_id = beta.next_id();
    let sent = beta
        .send(&Message::Request(RequestMessage {
            id: req_id,
            content_type: ContentType::Json,
            error: ErrorCode::None,
            topic: "ping".to_string(),
            source: "beta".to_string(),
            target: "alpha".to_string(),
            payload: Payload::json(json!({ "n": 1 })),
        }))
        .await;

    // alpha receives the request byte for byte.
    let forwarded = alpha.recv_raw().await;
    assert_eq!(forwarded, sent);
    let req = match MessageCodec::decode(&forwarded).expect("decode") {
        Message::Request(req) => req,
        other => panic!("expected request, got {:?}", other),
    };
    assert_eq!(req.id, req_id);
    assert_eq!(req.payload.as_json().expect("json")["n"], json!(1));

    alpha
        .send(&Message::Response(ResponseMessage {
            id: req.id,
            content_type: ContentType::Json,
            error: ErrorCode::None,
            topic: req.topic.clone(),
            source: "alpha".to_string(),
            target: req.source.clone(),
            payload: Payload::json(json!({ "n": 2 })),
        }))
        .await;

    match beta.recv().await {
        Message::Response(res) => {
            assert_eq!(res.id, req_id);
            assert!(!res.has_error());
            assert_eq!(res.payload.as_json().expect("json")["n"], json!(2));
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn request_to_unknown_target_is_answered_with_error() {
    let (addr, _handle) = spawn_broker().await;

    let mut beta = TestClient::connect(addr).await;
    beta.register("beta").await;

    let id = beta.next_id();
    beta.send(&Message::Request(RequestMessage {
        id,
        content_type: ContentType::Json,
        error: ErrorCode::None,
        topic: "ping".to_string(),
        source: "beta".to_string(),
        target: "gamma".to_string(),
        payload: Payload::empty_json(),
    }))
    .await;

    match beta.recv().await {
        Message::Response(res) => {
            assert_eq!(res.id, id);
            assert!(res.is_error(ErrorCode::TargetChannelNonexistent));
            assert_eq!(res.payload, Payload::empty_json());
        }
        other => panic!("expected error response, got {:?}", other),
    }
}

#[tokio::test]
async fn push_items_are_dispatched_round_robin() {
    let (addr, _handle) = spawn_broker().await;

    let mut w1 = TestClient::connect(addr).await;
    w1.register("w1").await;
    w1.add_listener("addPullListener", "job").await;

    let mut w2 = TestClient::connect(addr).await;
    w2.register("w2").await;
    w2.add_listener("addPullListener", "job").await;

    let mut producer = TestClient::connect(addr).await;
    producer
        .send(&Message::Push(PushMessage {
            id: 1,
            content_type: ContentType::String,
            topic: "job".to_string(),
            source: "producer".to_string(),
            target: "broker".to_string(),
            items: vec![
                Payload::text("a"),
                Payload::text("b"),
                Payload::text("c"),
                Payload::text("d"),
            ],
        }))
        .await;

    let (id_a, item_a) = w1.expect_pull().await;
    let (id_c, item_c) = w1.expect_pull().await;
    let (id_b, item_b) = w2.expect_pull().await;
    let (id_d, item_d) = w2.expect_pull().await;
    assert_eq!((item_a.as_str(), item_c.as_str()), ("a", "c"));
    assert_eq!((item_b.as_str(), item_d.as_str()), ("b", "d"));

    w1.ack(id_a, "job").await;
    w1.ack(id_c, "job").await;
    w2.ack(id_b, "job").await;
    w2.ack(id_d, "job").await;

    // Acked items are never redelivered.
    w1.recv_none(Duration::from_millis(200)).await;
    w2.recv_none(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unacked_item_is_redelivered_when_worker_dies() {
    let (addr, _handle) = spawn_broker().await;

    let mut w1 = TestClient::connect(addr).await;
    w1.register("w1").await;
    w1.add_listener("addPullListener", "job").await;

    let mut w2 = TestClient::connect(addr).await;
    w2.register("w2").await;
    w2.add_listener("addPullListener", "job").await;

    let mut producer = TestClient::connect(addr).await;
    producer
        .send(&Message::Push(PushMessage {
            id: 1,
            content_type: ContentType::String,
            topic: "job".to_string(),
            source: "producer".to_string(),
            target: "broker".to_string(),
            items: vec![Payload::text("a"), Payload::text("b")],
        }))
        .await;

    let (_, item_a) = w1.expect_pull().await;
    assert_eq!(item_a, "a");
    let (id_b, item_b) = w2.expect_pull().await;
    assert_eq!(item_b, "b");
    w2.ack(id_b, "job").await;

    // w1 dies before acking; "a" goes to the surviving worker.
    drop(w1);
    let (id_a2, redelivered) = w2.expect_pull().await;
    assert_eq!(redelivered, "a");
    w2.ack(id_a2, "job").await;
    w2.recv_none(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn publish_reaches_every_subscriber_in_order() {
    let (addr, _handle) = spawn_broker().await;

    let mut s1 = TestClient::connect(addr).await;
    s1.register("s1").await;
    s1.add_listener("addSubscribeListener", "news").await;

    let mut s2 = TestClient::connect(addr).await;
    s2.register("s2").await;
    s2.add_listener("addSubscribeListener", "news").await;

    let mut publisher = TestClient::connect(addr).await;
    for n in 1..=2u64 {
        publisher
            .send(&Message::Publish(PublishMessage {
                id: n,
                content_type: ContentType::String,
                topic: "news".to_string(),
                source: "press".to_string(),
                target: "broker".to_string(),
                payload: Payload::text(format!("p{}", n)),
            }))
            .await;
    }

    for subscriber in [&mut s1, &mut s2] {
        for expected in ["p1", "p2"] {
            match subscriber.recv().await {
                Message::Publish(publish) => {
                    assert_eq!(publish.payload, Payload::text(expected));
                    assert_eq!(publish.source, "press");
                }
                other => panic!("expected publish, got {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn wildcard_registration_yields_distinct_live_names() {
    let (addr, _handle) = spawn_broker().await;

    let mut first = TestClient::connect(addr).await;
    let first_name = first.register("worker-#").await;
    let mut second = TestClient::connect(addr).await;
    let second_name = second.register("worker-#").await;

    assert_ne!(first_name, second_name);
    for name in [&first_name, &second_name] {
        assert!(name.starts_with("worker-"));
        assert!(!name.contains('#'));
    }

    let res = first
        .broker_request(
            "getChannels",
            Payload::json(json!({ "channelName": "worker-*", "type": "glob" })),
        )
        .await;
    let channels = res.payload.as_json().expect("json")["channels"]
        .as_array()
        .expect("channels")
        .iter()
        .map(|v| v.as_str().expect("name").to_string())
        .collect::<Vec<_>>();
    assert_eq!(channels.len(), 2);
    assert!(channels.contains(&first_name));
    assert!(channels.contains(&second_name));
}

#[tokio::test]
async fn monitors_observe_lifecycle_events() {
    let (addr, _handle) = spawn_broker().await;

    let mut observer = TestClient::connect(addr).await;
    let res = observer
        .broker_request("watchChannels", Payload::json(json!({ "channelName": "job-*" })))
        .await;
    let body = res.payload.as_json().expect("json");
    assert_eq!(body["result"], json!(true));
    assert_eq!(body["channelPattern"], json!("job-*"));
    assert_eq!(body["channelNames"], json!([]));

    let mut worker = TestClient::connect(addr).await;
    worker.register("job-1").await;

    match observer.recv().await {
        Message::Monitor(mon) => {
            let body = mon.payload.as_json().expect("json");
            assert_eq!(body["event"], json!("register"));
            assert_eq!(body["channel"], json!("job-1"));
        }
        other => panic!("expected monitor event, got {:?}", other),
    }

    drop(worker);
    match observer.recv().await {
        Message::Monitor(mon) => {
            let body = mon.payload.as_json().expect("json");
            assert_eq!(body["event"], json!("unregister"));
            assert_eq!(body["channel"], json!("job-1"));
        }
        other => panic!("expected monitor event, got {:?}", other),
    }
}

#[tokio::test]
async fn broker_handle_request_round_trips_through_a_channel() {
    let (addr, handle) = spawn_broker().await;

    let mut alpha = TestClient::connect(addr).await;
    alpha.register("alpha").await;

    let request_task = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .request("alpha", "ping", Payload::json(json!({ "n": 1 })))
                .await
        }
    });

    // alpha sees a broker-originated request and answers it.
    let req = match alpha.recv().await {
        Message::Request(req) => req,
        other => panic!("expected request, got {:?}", other),
    };
    assert_eq!(req.source, "broker");
    assert_eq!(req.topic, "ping");
    alpha
        .send(&Message::Response(ResponseMessage {
            id: req.id,
            content_type: ContentType::Json,
            error: ErrorCode::None,
            topic: req.topic.clone(),
            source: "alpha".to_string(),
            target: "broker".to_string(),
            payload: Payload::json(json!({ "n": 2 })),
        }))
        .await;

    let res = request_task
        .await
        .expect("join")
        .expect("broker request succeeds");
    assert_eq!(res.payload.as_json().expect("json")["n"], json!(2));
}

#[tokio::test]
async fn local_response_handler_serves_wire_requests() {
    let (addr, handle) = spawn_broker().await;
    handle
        .add_response_handler("stats", |_req| Ok(Payload::json(json!({ "up": true }))))
        .expect("install handler");

    let mut client = TestClient::connect(addr).await;
    client.register("cli").await;
    let res = client.broker_request("stats", Payload::empty_json()).await;
    assert!(!res.has_error());
    assert_eq!(res.payload.as_json().expect("json")["up"], json!(true));
}

#[tokio::test]
async fn sreq_is_restricted_to_broker_topics() {
    let (addr, _handle) = spawn_broker().await;

    let mut client = TestClient::connect(addr).await;
    client.register("cli").await;

    let id = client.next_id();
    client
        .send(&Message::BrokerRequest(RequestMessage {
            id,
            content_type: ContentType::Json,
            error: ErrorCode::None,
            topic: "nosuch".to_string(),
            source: "cli".to_string(),
            target: "broker".to_string(),
            payload: Payload::empty_json(),
        }))
        .await;

    match client.recv().await {
        Message::Response(res) => {
            assert_eq!(res.id, id);
            assert!(res.is_error(ErrorCode::TopicNonexistent));
        }
        other => panic!("expected error response, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_name_registration_fails() {
    let (addr, _handle) = spawn_broker().await;

    let mut first = TestClient::connect(addr).await;
    first.register("alpha").await;

    let mut second = TestClient::connect(addr).await;
    let id = second.next_id();
    second
        .send(&Message::Request(RequestMessage {
            id,
            content_type: ContentType::Json,
            error: ErrorCode::None,
            topic: "register".to_string(),
            source: "alpha".to_string(),
            target: "broker".to_string(),
            payload: Payload::empty_json(),
        }))
        .await;
    match second.recv().await {
        Message::Response(res) => assert!(res.is_error(ErrorCode::RegisterFail)),
        other => panic!("expected error response, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_frame_closes_the_connection() {
    let (addr, _handle) = spawn_broker().await;

    let mut client = TestClient::connect(addr).await;
    client.register("cli").await;

    // totalLen below the frame overhead is a framing violation.
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&4u32.to_be_bytes());
    client
        .framed
        .send(Bytes::from(garbage))
        .await
        .expect("send");

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match client.framed.next().await {
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "peer was not closed after malformed frame");
}
