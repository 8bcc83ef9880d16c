//! Wire protocol types for supervisor-worker communication.
//!
//! Every frame on the channel is an [`Envelope`]: `{ name, args, metadata }`.
//! `metadata` is absent on one-way notifies, and carries a correlation id
//! plus an `isResponse` flag on requests and their replies. The flag is what
//! keeps a bidirectional channel from feeding its own replies back into its
//! router.
//!
//! Payloads are typed by the closed [`Message`] enum. Envelopes are validated
//! into a `Message` at the channel boundary; responses carry a [`Reply`].

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    #[serde(rename = "isResponse")]
    pub is_response: bool,
}

impl Metadata {
    pub fn request(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_response: false,
        }
    }

    pub fn response(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_response: true,
        }
    }
}

/// Raw frame as it travels over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Envelope {
    /// One-way envelope; the receiver never answers it.
    pub fn notify(message: &Message) -> Self {
        let (name, args) = message.to_parts();
        Self {
            name,
            args,
            metadata: None,
        }
    }

    pub fn request(message: &Message, id: impl Into<String>) -> Self {
        let (name, args) = message.to_parts();
        Self {
            name,
            args,
            metadata: Some(Metadata::request(id)),
        }
    }

    pub fn response(name: impl Into<String>, id: impl Into<String>, reply: &Reply) -> Self {
        Self {
            name: name.into(),
            args: serde_json::to_value(reply).unwrap_or(Value::Null),
            metadata: Some(Metadata::response(id)),
        }
    }

    pub fn is_response(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.is_response)
    }

    /// Correlation id, if the sender expects (or this is) a reply.
    pub fn id(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.id.as_str())
    }

    /// Validate the payload against the message set.
    pub fn message(&self) -> Result<Message, serde_json::Error> {
        Message::from_parts(&self.name, self.args.clone())
    }

    /// Interpret the payload of a response envelope.
    pub fn reply(&self) -> Reply {
        serde_json::from_value(self.args.clone()).unwrap_or_else(|e| {
            Reply::failure(ErrorLike::new(
                ErrorLike::INVALID_MESSAGE,
                format!("malformed reply to '{}': {}", self.name, e),
            ))
        })
    }
}

/// Every message the session exchanges, keyed on the wire by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum Message {
    /// Worker lifecycle event, echoed to the supervisor console.
    Lifecycle { event: String },

    /// The health route answered after a period of not answering.
    #[serde(rename_all = "camelCase")]
    ServerRunning { is_first_time: bool },

    /// Sent by a worker right before an unplanned exit.
    CrashDetected { error: ErrorLike },

    /// Ask the supervisor to end the whole session.
    #[serde(rename_all = "camelCase")]
    Kill {
        reason: String,
        graceful: bool,
        error_code: i32,
    },

    /// Host-defined message routed by its `action` name.
    Action {
        action: String,
        #[serde(default)]
        args: Value,
    },

    /// Ask the worker to run its exit handlers and exit 0.
    #[serde(rename_all = "camelCase")]
    ManualExit { is_session_end: bool },

    #[serde(rename_all = "camelCase")]
    UpdatePollingInterval { new_polling_interval_seconds: u64 },
}

impl Message {
    pub const LIFECYCLE: &'static str = "lifecycle";
    pub const SERVER_RUNNING: &'static str = "server_running";
    pub const CRASH_DETECTED: &'static str = "crash_detected";
    pub const KILL: &'static str = "kill";
    pub const ACTION: &'static str = "action";
    pub const MANUAL_EXIT: &'static str = "manual_exit";
    pub const UPDATE_POLLING_INTERVAL: &'static str = "update_polling_interval";

    /// Wire names of every built-in message.
    pub const NAMES: [&'static str; 7] = [
        Self::LIFECYCLE,
        Self::SERVER_RUNNING,
        Self::CRASH_DETECTED,
        Self::KILL,
        Self::ACTION,
        Self::MANUAL_EXIT,
        Self::UPDATE_POLLING_INTERVAL,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lifecycle { .. } => Self::LIFECYCLE,
            Self::ServerRunning { .. } => Self::SERVER_RUNNING,
            Self::CrashDetected { .. } => Self::CRASH_DETECTED,
            Self::Kill { .. } => Self::KILL,
            Self::Action { .. } => Self::ACTION,
            Self::ManualExit { .. } => Self::MANUAL_EXIT,
            Self::UpdatePollingInterval { .. } => Self::UPDATE_POLLING_INTERVAL,
        }
    }

    /// Key used by handler maps: the wire name, or the action name for
    /// host-defined actions.
    pub fn route_key(&self) -> &str {
        match self {
            Self::Action { action, .. } => action,
            other => other.name(),
        }
    }

    pub fn action(action: impl Into<String>, args: Value) -> Self {
        Self::Action {
            action: action.into(),
            args,
        }
    }

    fn to_parts(&self) -> (String, Value) {
        let name = self.name().to_string();
        let args = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("args").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        (name, args)
    }

    fn from_parts(name: &str, args: Value) -> Result<Self, serde_json::Error> {
        let mut map = serde_json::Map::new();
        map.insert("name".to_string(), Value::String(name.to_string()));
        if !args.is_null() {
            map.insert("args".to_string(), args);
        }
        serde_json::from_value(Value::Object(map))
    }
}

/// Transferable shape of an error. Native error values do not cross the
/// process boundary, so only these three fields are carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLike {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorLike {
    pub const ERROR: &'static str = "Error";
    pub const PANIC: &'static str = "Panic";
    pub const FAILED_DISPATCH: &'static str = "FailedDispatch";
    pub const MANAGER_DESTROYED: &'static str = "ManagerDestroyed";
    pub const TIMED_OUT: &'static str = "TimedOut";
    pub const INVALID_MESSAGE: &'static str = "InvalidMessage";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture a handler error. The debug rendering (cause chain and, when
    /// enabled, backtrace) stands in for the stack.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        Self::new(Self::ERROR, error.to_string()).with_stack(format!("{error:?}"))
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(Self::PANIC, message)
    }

    pub fn failed_dispatch(message: impl Into<String>) -> Self {
        Self::new(Self::FAILED_DISPATCH, message)
    }

    pub fn manager_destroyed() -> Self {
        Self::new(
            Self::MANAGER_DESTROYED,
            "The IPC manager was destroyed before the response could be returned.",
        )
    }

    pub fn timed_out(after: std::time::Duration) -> Self {
        Self::new(
            Self::TIMED_OUT,
            format!("No response within {:.1}s", after.as_secs_f64()),
        )
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl fmt::Display for ErrorLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorLike {}

/// Payload of a response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorLike>,
}

impl Reply {
    pub fn success(results: Vec<Value>) -> Self {
        Self {
            results: Some(results),
            error: None,
        }
    }

    pub fn failure(error: ErrorLike) -> Self {
        Self {
            results: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<Value>, ErrorLike> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.results.unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manual_exit_request_wire_shape() {
        let envelope = Envelope::request(
            &Message::ManualExit {
                is_session_end: false,
            },
            "req-1",
        );
        insta::assert_json_snapshot!(envelope, @r###"
        {
          "name": "manual_exit",
          "args": {
            "isSessionEnd": false
          },
          "metadata": {
            "id": "req-1",
            "isResponse": false
          }
        }
        "###);
    }

    #[test]
    fn notify_has_no_metadata() {
        let envelope = Envelope::notify(&Message::Lifecycle {
            event: "booting".to_string(),
        });
        insta::assert_json_snapshot!(envelope, @r###"
        {
          "name": "lifecycle",
          "args": {
            "event": "booting"
          }
        }
        "###);
        assert!(!envelope.is_response());
        assert!(envelope.id().is_none());
    }

    #[test]
    fn kill_uses_camel_case_fields() {
        let envelope = Envelope::notify(&Message::Kill {
            reason: "remote".to_string(),
            graceful: true,
            error_code: 3,
        });
        assert_eq!(envelope.args["errorCode"], json!(3));
        assert_eq!(envelope.args["graceful"], json!(true));
    }

    #[test]
    fn envelope_validates_into_message() {
        let envelope = Envelope {
            name: "update_polling_interval".to_string(),
            args: json!({"newPollingIntervalSeconds": 12}),
            metadata: Some(Metadata::request("x")),
        };
        assert_eq!(
            envelope.message().unwrap(),
            Message::UpdatePollingInterval {
                new_polling_interval_seconds: 12
            }
        );
    }

    #[test]
    fn unknown_name_is_rejected() {
        let envelope = Envelope {
            name: "reboot_universe".to_string(),
            args: json!({}),
            metadata: None,
        };
        assert!(envelope.message().is_err());
    }

    #[test]
    fn wrong_payload_shape_is_rejected() {
        let envelope = Envelope {
            name: "manual_exit".to_string(),
            args: json!({"isSessionEnd": "yes"}),
            metadata: None,
        };
        assert!(envelope.message().is_err());
    }

    #[test]
    fn action_routes_by_action_name() {
        let msg = Message::action("backup", json!({"to": "ops"}));
        assert_eq!(msg.name(), Message::ACTION);
        assert_eq!(msg.route_key(), "backup");

        let envelope = Envelope::notify(&msg);
        assert_eq!(envelope.message().unwrap(), msg);
    }

    #[test]
    fn names_cover_every_variant() {
        let samples = [
            Message::Lifecycle { event: String::new() },
            Message::ServerRunning { is_first_time: true },
            Message::CrashDetected {
                error: ErrorLike::new("Error", "x"),
            },
            Message::Kill {
                reason: String::new(),
                graceful: true,
                error_code: 0,
            },
            Message::action("a", Value::Null),
            Message::ManualExit {
                is_session_end: true,
            },
            Message::UpdatePollingInterval {
                new_polling_interval_seconds: 1,
            },
        ];
        let names: Vec<&str> = samples.iter().map(Message::name).collect();
        assert_eq!(names, Message::NAMES);
    }

    #[test]
    fn action_without_args_defaults_to_null() {
        let envelope = Envelope {
            name: "action".to_string(),
            args: json!({"action": "backup"}),
            metadata: None,
        };
        assert_eq!(
            envelope.message().unwrap(),
            Message::action("backup", Value::Null)
        );
    }

    #[test]
    fn response_carries_reply() {
        let reply = Reply::failure(ErrorLike::new("Error", "boom").with_stack("at handler"));
        let envelope = Envelope::response("action", "id-9", &reply);

        assert!(envelope.is_response());
        assert_eq!(envelope.id(), Some("id-9"));
        assert_eq!(envelope.reply(), reply);
    }

    #[test]
    fn malformed_reply_becomes_invalid_message_error() {
        let envelope = Envelope {
            name: "action".to_string(),
            args: json!({"error": 42}),
            metadata: Some(Metadata::response("id")),
        };
        let reply = envelope.reply();
        assert!(reply.error.unwrap().is(ErrorLike::INVALID_MESSAGE));
    }

    #[test]
    fn error_like_from_anyhow_keeps_message() {
        let err = anyhow::anyhow!("boom");
        let like = ErrorLike::from_anyhow(&err);
        assert_eq!(like.name, "Error");
        assert_eq!(like.message, "boom");
        assert!(like.stack.unwrap().contains("boom"));
    }

    #[test]
    fn error_like_from_panic_payloads() {
        let static_payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(ErrorLike::from_panic(static_payload.as_ref()).message, "static str");

        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(ErrorLike::from_panic(owned_payload.as_ref()).message, "owned");
    }

    #[test]
    fn reply_into_result() {
        assert_eq!(
            Reply::success(vec![json!(1)]).into_result().unwrap(),
            vec![json!(1)]
        );
        assert_eq!(Reply::default().into_result().unwrap(), Vec::<Value>::new());
        assert!(Reply::failure(ErrorLike::manager_destroyed()).into_result().is_err());
    }
}
