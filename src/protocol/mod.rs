use crate::error::{ControlError, ControlResult, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub mod codec;

/// Correlation id chosen by the sender of an envelope.
pub type Tag = u64;
/// Registered worker endpoint id, registry-monotonic from 1.
pub type InstanceId = u64;
/// Stream id assigned at accept time; doubles as the machine id.
pub type StreamId = u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Request,
    Response,
    Update,
    Error,
    Disconnect,
}

/// Envelope carried on the bidirectional event stream.
///
/// `tag` correlates request and response: a responder echoes the
/// request's tag, while server-initiated updates carry a fresh tag
/// drawn from the target instance's update cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub tag: Tag,
    pub kind: EventKind,
    pub body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Body {
    Message(Message),
    Error(ErrorBody),
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<ControlError> for ErrorBody {
    fn from(err: ControlError) -> Self {
        Self {
            code: err.code,
            message: err.message,
        }
    }
}

/// Typed payloads exchanged over the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    RegisterWorkers(RegisterWorkers),
    RegisterWorkersResponse(RegisterWorkersResponse),
    CreateSubscriptionService(CreateSubscriptionService),
    RegisterSubscriptionService(RegisterSubscriptionService),
    RegisterSubscriptionServiceResponse(RegisterSubscriptionServiceResponse),
    DropFromSubscriptionService(DropFromSubscriptionService),
    SubscriptionServiceUpdate(SubscriptionServiceUpdate),
    Ack(Ack),
}

impl Message {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::RegisterWorkers(_) => "RegisterWorkers",
            Message::RegisterWorkersResponse(_) => "RegisterWorkersResponse",
            Message::CreateSubscriptionService(_) => "CreateSubscriptionService",
            Message::RegisterSubscriptionService(_) => "RegisterSubscriptionService",
            Message::RegisterSubscriptionServiceResponse(_) => "RegisterSubscriptionServiceResponse",
            Message::DropFromSubscriptionService(_) => "DropFromSubscriptionService",
            Message::SubscriptionServiceUpdate(_) => "SubscriptionServiceUpdate",
            Message::Ack(_) => "Ack",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterWorkers {
    pub ucx_worker_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterWorkersResponse {
    pub machine_id: StreamId,
    /// One id per requested address, in request order.
    pub instance_ids: Vec<InstanceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSubscriptionService {
    pub service_name: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterSubscriptionService {
    pub service_name: String,
    pub instance_id: InstanceId,
    /// Role the instance joins as a member.
    pub role: String,
    /// Roles whose membership the instance wants diffused to it.
    pub subscribe_to_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterSubscriptionServiceResponse {
    pub service_name: String,
    pub role: String,
    pub tag: Tag,
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropFromSubscriptionService {
    pub service_name: String,
    pub instance_id: InstanceId,
    pub tag: Tag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionServiceUpdate {
    pub service_name: String,
    pub role: String,
    pub nonce: u64,
    /// Current members of the role, in tag order.
    pub entries: Vec<UpdateEntry>,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateEntry {
    pub tag: Tag,
    pub instance_id: InstanceId,
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack;

impl Event {
    pub fn request(tag: Tag, msg: Message) -> Self {
        Self {
            tag,
            kind: EventKind::Request,
            body: Body::Message(msg),
        }
    }

    pub fn response(tag: Tag, msg: Message) -> Self {
        Self {
            tag,
            kind: EventKind::Response,
            body: Body::Message(msg),
        }
    }

    pub fn update(tag: Tag, msg: Message) -> Self {
        Self {
            tag,
            kind: EventKind::Update,
            body: Body::Message(msg),
        }
    }

    pub fn error(tag: Tag, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            tag,
            kind: EventKind::Error,
            body: Body::Error(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn disconnect() -> Self {
        Self {
            tag: 0,
            kind: EventKind::Disconnect,
            body: Body::Empty,
        }
    }
}

/// Payload types extractable from an envelope. `Err` hands the message
/// back so the caller can report what actually arrived.
pub trait FromMessage: Sized {
    fn from_message(msg: Message) -> Result<Self, Message>;
}

macro_rules! from_message {
    ($ty:ident) => {
        impl FromMessage for $ty {
            fn from_message(msg: Message) -> Result<Self, Message> {
                match msg {
                    Message::$ty(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }
    };
}

from_message!(RegisterWorkers);
from_message!(RegisterWorkersResponse);
from_message!(CreateSubscriptionService);
from_message!(RegisterSubscriptionService);
from_message!(RegisterSubscriptionServiceResponse);
from_message!(DropFromSubscriptionService);
from_message!(SubscriptionServiceUpdate);
from_message!(Ack);

/// Extract the typed payload of an envelope. An error payload is
/// surfaced as that error; anything else that does not unpack cleanly
/// fails with "unexpected message type".
pub fn unpack<T: FromMessage>(event: Event) -> ControlResult<T> {
    match event.body {
        Body::Message(msg) => T::from_message(msg).map_err(|other| {
            ControlError::instance(format!(
                "unable to unpack payload; unexpected message type {}",
                other.kind_name()
            ))
        }),
        Body::Error(err) => Err(ControlError::new(err.code, err.message)),
        Body::Empty => Err(ControlError::instance("unable to unpack payload; empty body")),
    }
}

/// Materialize a repeated field as a set, failing on duplicates.
pub fn check_unique_repeated<T: Ord + Clone>(items: &[T]) -> ControlResult<BTreeSet<T>> {
    let unique: BTreeSet<T> = items.iter().cloned().collect();
    if unique.len() != items.len() {
        return Err(ControlError::instance(
            "non-unique repeated field; duplicate detected",
        ));
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_typed_payload() {
        let event = Event::response(
            7,
            Message::Ack(Ack),
        );
        let ack: Ack = unpack(event).expect("ack unpacks");
        assert_eq!(ack, Ack);
    }

    #[test]
    fn unpack_reports_unexpected_type() {
        let event = Event::response(7, Message::Ack(Ack));
        let err = unpack::<RegisterWorkersResponse>(event).unwrap_err();
        assert_eq!(err.code, ErrorCode::InstanceError);
        assert!(err.message.contains("Ack"), "message was: {}", err.message);
    }

    #[test]
    fn unpack_surfaces_error_payload() {
        let event = Event::error(3, ErrorCode::InvalidRole, "no such role");
        let err = unpack::<Ack>(event).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRole);
        assert_eq!(err.message, "no such role");
    }

    #[test]
    fn unique_repeated_rejects_duplicates() {
        let ok = check_unique_repeated(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(ok.len(), 2);

        let err = check_unique_repeated(&["a".to_string(), "a".to_string()]).unwrap_err();
        assert!(err.message.contains("duplicate"));
    }
}
