use bytes::Bytes;
use serde_json::Value;

pub type ChannelName = String;
pub type TopicName = String;
pub type MessageId = u64;

/// Message kind tag carried in every header.
///
/// The numeric codes are fixed by the wire format and must never be
/// renumbered: deployed peers dispatch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Point-to-point request expecting a correlated response.
    Req,
    /// Response correlated to a request by `id`.
    Res,
    /// Batch of work items for a pull queue.
    Push,
    /// A single work item handed to one worker.
    Pull,
    /// Publication fanned out to all subscribers of a topic.
    Pub,
    /// Subscription announcement (internal use, not a top-level wire message).
    Sub,
    /// Acknowledgement of a delivered pull item.
    Ack,
    /// Channel lifecycle notification sent to monitors.
    Mon,
    /// Request addressed to the broker itself (administrative).
    Sreq,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            MessageKind::Req => 1,
            MessageKind::Res => 2,
            MessageKind::Push => 3,
            MessageKind::Pull => 4,
            MessageKind::Pub => 5,
            MessageKind::Sub => 6,
            MessageKind::Ack => 7,
            MessageKind::Mon => 0xF0,
            MessageKind::Sreq => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageKind::Req),
            2 => Some(MessageKind::Res),
            3 => Some(MessageKind::Push),
            4 => Some(MessageKind::Pull),
            5 => Some(MessageKind::Pub),
            6 => Some(MessageKind::Sub),
            7 => Some(MessageKind::Ack),
            0xF0 => Some(MessageKind::Mon),
            0xFF => Some(MessageKind::Sreq),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Req => "req",
            MessageKind::Res => "res",
            MessageKind::Push => "push",
            MessageKind::Pull => "pull",
            MessageKind::Pub => "pub",
            MessageKind::Sub => "sub",
            MessageKind::Ack => "ack",
            MessageKind::Mon => "mon",
            MessageKind::Sreq => "sreq",
        }
    }
}

/// Payload encoding tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Raw,
    Json,
    String,
}

impl ContentType {
    pub fn code(self) -> u8 {
        match self {
            ContentType::Raw => 1,
            ContentType::Json => 2,
            ContentType::String => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ContentType::Raw),
            2 => Some(ContentType::Json),
            3 => Some(ContentType::String),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Raw => "raw",
            ContentType::Json => "json",
            ContentType::String => "string",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(ContentType::Raw),
            "json" => Some(ContentType::Json),
            "string" => Some(ContentType::String),
            _ => None,
        }
    }
}

/// Closed table of wire error codes carried on `res` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    None,
    RegisterFail,
    TargetChannelNonexistent,
    TopicNonexistent,
    InvalidParameter,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::RegisterFail => 1,
            ErrorCode::TargetChannelNonexistent => 2,
            ErrorCode::TopicNonexistent => 3,
            ErrorCode::InvalidParameter => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::None),
            1 => Some(ErrorCode::RegisterFail),
            2 => Some(ErrorCode::TargetChannelNonexistent),
            3 => Some(ErrorCode::TopicNonexistent),
            4 => Some(ErrorCode::InvalidParameter),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(ErrorCode::None),
            "registerFail" => Some(ErrorCode::RegisterFail),
            "targetChannelNonexistent" => Some(ErrorCode::TargetChannelNonexistent),
            "topicNonexistent" => Some(ErrorCode::TopicNonexistent),
            "invalidParameter" => Some(ErrorCode::InvalidParameter),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::None => "none",
            ErrorCode::RegisterFail => "registerFail",
            ErrorCode::TargetChannelNonexistent => "targetChannelNonexistent",
            ErrorCode::TopicNonexistent => "topicNonexistent",
            ErrorCode::InvalidParameter => "invalidParameter",
        }
    }
}

/// Typed payload.
///
/// Payloads keep their decoded form so malformed JSON is refused at decode
/// time instead of surfacing downstream as an opaque byte blob.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Bytes),
    Text(String),
    Json(Value),
}

impl Payload {
    pub fn content_type(&self) -> ContentType {
        match self {
            Payload::Raw(_) => ContentType::Raw,
            Payload::Text(_) => ContentType::String,
            Payload::Json(_) => ContentType::Json,
        }
    }

    /// The empty JSON object, used for error responses with no body.
    pub fn empty_json() -> Self {
        Payload::Json(Value::Object(serde_json::Map::new()))
    }

    pub fn json(value: Value) -> Self {
        Payload::Json(value)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Payload::Text(value.into())
    }

    pub fn raw(value: impl Into<Bytes>) -> Self {
        Payload::Raw(value.into())
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Header record shared by `req` and `sreq`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub id: MessageId,
    pub content_type: ContentType,
    pub error: ErrorCode,
    pub topic: TopicName,
    pub source: ChannelName,
    pub target: ChannelName,
    pub payload: Payload,
}

/// Response correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub id: MessageId,
    pub content_type: ContentType,
    pub error: ErrorCode,
    pub topic: TopicName,
    pub source: ChannelName,
    pub target: ChannelName,
    pub payload: Payload,
}

impl ResponseMessage {
    /// Build the reply to `req`, swapping source and target.
    pub fn reply_to(req: &RequestMessage, from: &str, payload: Payload) -> Self {
        ResponseMessage {
            id: req.id,
            content_type: payload.content_type(),
            error: ErrorCode::None,
            topic: req.topic.clone(),
            source: from.to_string(),
            target: req.source.clone(),
            payload,
        }
    }

    /// Build an error reply carrying the empty JSON payload.
    pub fn error_reply(req: &RequestMessage, from: &str, error: ErrorCode) -> Self {
        ResponseMessage {
            id: req.id,
            content_type: ContentType::Json,
            error,
            topic: req.topic.clone(),
            source: from.to_string(),
            target: req.source.clone(),
            payload: Payload::empty_json(),
        }
    }

    pub fn has_error(&self) -> bool {
        self.error != ErrorCode::None
    }

    /// True iff the header's error equals the given code.
    pub fn is_error(&self, error: ErrorCode) -> bool {
        self.error == error
    }

    /// Name-based variant of [`is_error`](Self::is_error); unknown names
    /// never match.
    pub fn is_error_named(&self, name: &str) -> bool {
        ErrorCode::from_name(name).is_some_and(|code| self.error == code)
    }
}

/// Batch of work items addressed to a pull queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub id: MessageId,
    pub content_type: ContentType,
    pub topic: TopicName,
    pub source: ChannelName,
    pub target: ChannelName,
    pub items: Vec<Payload>,
}

/// A single work item handed to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PullMessage {
    pub id: MessageId,
    pub content_type: ContentType,
    pub topic: TopicName,
    pub source: ChannelName,
    pub payload: Payload,
}

/// Publication fanned out to every subscriber of `topic`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub id: MessageId,
    pub content_type: ContentType,
    pub topic: TopicName,
    pub source: ChannelName,
    pub target: ChannelName,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeMessage {
    pub id: MessageId,
    pub content_type: ContentType,
    pub topic: TopicName,
    pub source: ChannelName,
    pub payload: Payload,
}

/// Acknowledgement of a delivered pull item, correlated by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct AckMessage {
    pub id: MessageId,
    pub topic: TopicName,
}

/// Channel lifecycle notification sent to monitors.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorMessage {
    pub id: MessageId,
    pub content_type: ContentType,
    pub payload: Payload,
}

/// The single unit on the wire, tagged by kind.
///
/// `Req` and `Sreq` share one header schema, so both variants wrap
/// [`RequestMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(RequestMessage),
    BrokerRequest(RequestMessage),
    Response(ResponseMessage),
    Push(PushMessage),
    Pull(PullMessage),
    Publish(PublishMessage),
    Subscribe(SubscribeMessage),
    Ack(AckMessage),
    Monitor(MonitorMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Req,
            Message::BrokerRequest(_) => MessageKind::Sreq,
            Message::Response(_) => MessageKind::Res,
            Message::Push(_) => MessageKind::Push,
            Message::Pull(_) => MessageKind::Pull,
            Message::Publish(_) => MessageKind::Pub,
            Message::Subscribe(_) => MessageKind::Sub,
            Message::Ack(_) => MessageKind::Ack,
            Message::Monitor(_) => MessageKind::Mon,
        }
    }

    pub fn id(&self) -> MessageId {
        match self {
            Message::Request(m) | Message::BrokerRequest(m) => m.id,
            Message::Response(m) => m.id,
            Message::Push(m) => m.id,
            Message::Pull(m) => m.id,
            Message::Publish(m) => m.id,
            Message::Subscribe(m) => m.id,
            Message::Ack(m) => m.id,
            Message::Monitor(m) => m.id,
        }
    }

    /// Topic label, empty for kinds that do not carry one.
    pub fn topic(&self) -> &str {
        match self {
            Message::Request(m) | Message::BrokerRequest(m) => &m.topic,
            Message::Response(m) => &m.topic,
            Message::Push(m) => &m.topic,
            Message::Pull(m) => &m.topic,
            Message::Publish(m) => &m.topic,
            Message::Subscribe(m) => &m.topic,
            Message::Ack(m) => &m.topic,
            Message::Monitor(_) => "",
        }
    }
}
