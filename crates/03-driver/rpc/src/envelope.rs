//! What travels over a channel, and its JSON shape:
//!
//! ```text
//! request   {"topic": <name>, "id": <u32>, "data": <payload>?}
//! response  {"topic": "$$RESPONSE", "id": <u32>, "data": <payload>?}
//! failure   {"topic": "$$RESPONSE", "id": <u32>,
//!            "data": {"$$ERROR": true, "name": .., "message": .., "stack": ..}}
//! ```
//!
//! The transfer list is not part of the JSON; it moves out of band.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use zerde::BufferDescriptor;

use crate::protocol::{Payload, Protocol, Topic};
use crate::{RemoteError, RpcError, RpcResult};

/// Topic name reserved for responses.
pub const RESPONSE_TOPIC: &str = "$$RESPONSE";

/// Marker key of a failed response's data.
pub const ERROR_KEY: &str = "$$ERROR";

pub enum Message<P: Protocol> {
    Request {
        topic: P::Topic,
        id: u32,
        data: Option<P::Data>,
    },
    Response {
        id: u32,
        result: Result<Option<P::Data>, RemoteError>,
    },
}

impl<P: Protocol> std::fmt::Debug for Message<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Request { topic, id, data } => f
                .debug_struct("Request")
                .field("topic", topic)
                .field("id", id)
                .field("data", data)
                .finish(),
            Message::Response { id, result } => f
                .debug_struct("Response")
                .field("id", id)
                .field("result", result)
                .finish(),
        }
    }
}

/// A message plus the buffers moving with it.
pub struct Envelope<P: Protocol> {
    pub message: Message<P>,
    pub transfer: Vec<BufferDescriptor>,
}

impl<P: Protocol> Envelope<P> {
    pub fn request(topic: P::Topic, id: u32, payload: Payload<P>) -> Self {
        Self {
            message: Message::Request {
                topic,
                id,
                data: payload.data,
            },
            transfer: payload.transfer,
        }
    }

    pub fn response(id: u32, result: Result<Payload<P>, RemoteError>) -> Self {
        match result {
            Ok(payload) => Self {
                message: Message::Response {
                    id,
                    result: Ok(payload.data),
                },
                transfer: payload.transfer,
            },
            Err(err) => Self {
                message: Message::Response {
                    id,
                    result: Err(err),
                },
                transfer: Vec::new(),
            },
        }
    }

    pub fn id(&self) -> u32 {
        match self.message {
            Message::Request { id, .. } | Message::Response { id, .. } => id,
        }
    }
}

impl<P: Protocol> std::fmt::Debug for Envelope<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("transfer", &self.transfer)
            .finish()
    }
}

impl<P> Envelope<P>
where
    P: Protocol,
    P::Data: Serialize + DeserializeOwned,
{
    pub fn to_json(&self) -> RpcResult<Value> {
        let mut obj = Map::new();
        let (topic, id, data) = match &self.message {
            Message::Request { topic, id, data } => {
                let data = data.as_ref().map(serde_json::to_value).transpose()?;
                (topic.name(), *id, data)
            }
            Message::Response { id, result } => {
                let data = match result {
                    Ok(data) => data.as_ref().map(serde_json::to_value).transpose()?,
                    Err(err) => Some(error_value(err)?),
                };
                (RESPONSE_TOPIC, *id, data)
            }
        };
        obj.insert("topic".to_owned(), Value::from(topic));
        obj.insert("id".to_owned(), Value::from(id));
        if let Some(data) = data {
            obj.insert("data".to_owned(), data);
        }
        Ok(Value::Object(obj))
    }

    /// Parses the JSON shape back. A request naming a topic this protocol does
    /// not know fails with [`RpcError::UnknownTopic`], which carries the id so
    /// the receiver can still answer with a HandlerNotFound response.
    pub fn from_json(value: Value) -> RpcResult<Self> {
        let Value::Object(mut obj) = value else {
            return Err(RpcError::protocol("envelope is not a JSON object"));
        };
        let topic = match obj.remove("topic") {
            Some(Value::String(topic)) => topic,
            _ => return Err(RpcError::protocol("envelope has no topic")),
        };
        let id = obj
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| RpcError::protocol("envelope has no valid id"))?;
        let data = obj.remove("data").filter(|data| !data.is_null());

        let message = if topic == RESPONSE_TOPIC {
            let result = match data {
                Some(Value::Object(fields)) if is_error(&fields) => {
                    Err(serde_json::from_value::<RemoteError>(Value::Object(fields))?)
                }
                Some(data) => Ok(Some(serde_json::from_value(data)?)),
                None => Ok(None),
            };
            Message::Response { id, result }
        } else {
            let Some(topic) = P::Topic::from_name(&topic) else {
                return Err(RpcError::UnknownTopic { name: topic, id });
            };
            let data = data.map(serde_json::from_value).transpose()?;
            Message::Request { topic, id, data }
        };
        Ok(Self {
            message,
            transfer: Vec::new(),
        })
    }
}

fn is_error(fields: &Map<String, Value>) -> bool {
    fields.get(ERROR_KEY).and_then(Value::as_bool) == Some(true)
}

fn error_value(err: &RemoteError) -> RpcResult<Value> {
    let mut value = serde_json::to_value(err)?;
    if let Value::Object(fields) = &mut value {
        fields.insert(ERROR_KEY.to_owned(), Value::Bool(true));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum Op {
        Echo,
    }

    impl Topic for Op {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn from_name(name: &str) -> Option<Self> {
            (name == "echo").then_some(Op::Echo)
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Body {
        n: u32,
    }

    struct Test;

    impl Protocol for Test {
        type Topic = Op;
        type Data = Body;
    }

    #[test]
    fn request_shape() {
        let env = Envelope::<Test>::request(Op::Echo, 7, Payload::new(Body { n: 3 }));
        assert_eq!(
            env.to_json().expect("json"),
            json!({"topic": "echo", "id": 7, "data": {"n": 3}})
        );
    }

    #[test]
    fn empty_response_omits_data() {
        let env = Envelope::<Test>::response(2, Ok(Payload::empty()));
        let value = env.to_json().expect("json");
        assert_eq!(value, json!({"topic": "$$RESPONSE", "id": 2}));
        let back = Envelope::<Test>::from_json(value).expect("parse");
        assert!(matches!(back.message, Message::Response { id: 2, result: Ok(None) }));
    }

    #[test]
    fn error_response_round_trips() {
        let err = RemoteError {
            name: "TypeError".into(),
            message: "bad".into(),
            stack: "at here".into(),
        };
        let value = Envelope::<Test>::response(9, Err(err.clone()))
            .to_json()
            .expect("json");
        assert_eq!(
            value,
            json!({
                "topic": "$$RESPONSE",
                "id": 9,
                "data": {"$$ERROR": true, "name": "TypeError", "message": "bad", "stack": "at here"}
            })
        );
        let back = Envelope::<Test>::from_json(value).expect("parse");
        match back.message {
            Message::Response { id, result } => {
                assert_eq!(id, 9);
                assert_eq!(result.unwrap_err(), err);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_keeps_the_id() {
        let err = Envelope::<Test>::from_json(json!({"topic": "nope", "id": 4})).unwrap_err();
        assert!(matches!(err, RpcError::UnknownTopic { ref name, id: 4 } if name == "nope"));
        assert!(err.is_protocol());
    }

    #[test]
    fn missing_id_is_a_protocol_error() {
        let err = Envelope::<Test>::from_json(json!({"topic": "echo"})).unwrap_err();
        assert!(err.is_protocol());
    }
}
