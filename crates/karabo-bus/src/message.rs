//! # Broker Messages
//!
//! Every message is a `(header, body)` pair of Hashes. The header carries
//! the routing fields; the body carries positional arguments `a1..a4`.
//!
//! ```text
//! signalInstanceId  sender
//! signalFunction    signal name | "__call__" | "__reply__"
//! slotInstanceIds   "id1,id2" | "*"
//! slotFunctions     "id1:slotA,id2:slotB" | "*:slotX"
//! ```

use karabo_data::io::{decode_hash, encode_hash};
use karabo_data::{ErrorKind, Hash, KaraboError, Result, Value, Violation, ViolationKind};

/// Header keys.
pub mod header {
    pub const SIGNAL_INSTANCE_ID: &str = "signalInstanceId";
    pub const SIGNAL_FUNCTION: &str = "signalFunction";
    pub const SLOT_INSTANCE_IDS: &str = "slotInstanceIds";
    pub const SLOT_FUNCTIONS: &str = "slotFunctions";
    pub const REPLY_ID: &str = "replyId";
    pub const REPLY_TO: &str = "__replyTo__";
    pub const REPLY_FUNCTION: &str = "__replyFunction__";
    pub const ERROR: &str = "error";
    /// Set on instance-id uniqueness checks; the checking instance ignores its own.
    pub const UNIQUENESS_TOKEN: &str = "uniquenessToken";
    /// Access level of the caller, when it declares one.
    pub const ACCESS_LEVEL: &str = "accessLevel";
}

pub const CALL: &str = "__call__";
pub const REPLY: &str = "__reply__";
pub const BROADCAST: &str = "*";
pub const HEARTBEAT_SIGNAL: &str = "signalHeartbeat";

/// Positional argument keys.
pub const ARG_KEYS: [&str; 4] = ["a1", "a2", "a3", "a4"];

/// One broker message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Hash,
    pub body: Hash,
}

fn routing(sender: &str, function: &str, targets: &[(&str, &str)]) -> Hash {
    let ids: Vec<&str> = targets.iter().map(|(id, _)| *id).collect();
    let functions: Vec<String> = targets.iter().map(|(id, f)| format!("{id}:{f}")).collect();
    Hash::new()
        .with(header::SIGNAL_INSTANCE_ID, sender)
        .with(header::SIGNAL_FUNCTION, function)
        .with(header::SLOT_INSTANCE_IDS, ids.join(","))
        .with(header::SLOT_FUNCTIONS, functions.join(","))
}

impl Message {
    #[must_use]
    pub fn new(header: Hash, body: Hash) -> Self {
        Self { header, body }
    }

    /// Point-to-point call of `slot` on `target`.
    #[must_use]
    pub fn call(sender: &str, target: &str, slot: &str, body: Hash) -> Self {
        Self::new(routing(sender, CALL, &[(target, slot)]), body)
    }

    /// Call of `slot` on every instance.
    #[must_use]
    pub fn broadcast(sender: &str, slot: &str, body: Hash) -> Self {
        Self::call(sender, BROADCAST, slot, body)
    }

    /// Emission of `signal` to its subscribers `(instance, slot)`.
    #[must_use]
    pub fn signal(sender: &str, signal: &str, subscribers: &[(String, String)], body: Hash) -> Self {
        let targets: Vec<(&str, &str)> = subscribers
            .iter()
            .map(|(i, s)| (i.as_str(), s.as_str()))
            .collect();
        Self::new(routing(sender, signal, &targets), body)
    }

    /// Reply to the request `reply_id` issued by `target`.
    #[must_use]
    pub fn reply(sender: &str, target: &str, reply_id: &str, result: Result<Hash>) -> Self {
        let mut head = routing(sender, REPLY, &[(target, REPLY)]);
        head.set(header::REPLY_ID, reply_id);
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                head.set(header::ERROR, true);
                error_to_body(&e)
            }
        };
        Self::new(head, body)
    }

    fn header_str(&self, key: &str) -> &str {
        self.header
            .get_value(key)
            .ok()
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Instance id of the sender.
    #[must_use]
    pub fn sender(&self) -> &str {
        self.header_str(header::SIGNAL_INSTANCE_ID)
    }

    #[must_use]
    pub fn signal_function(&self) -> &str {
        self.header_str(header::SIGNAL_FUNCTION)
    }

    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.signal_function() == REPLY
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.header.get::<bool>(header::ERROR).unwrap_or(false)
    }

    /// The request id, if this is a request or a reply.
    #[must_use]
    pub fn reply_id(&self) -> Option<&str> {
        Some(self.header_str(header::REPLY_ID)).filter(|s| !s.is_empty())
    }

    /// Whether `instance_id` (or everyone) is among the recipients.
    #[must_use]
    pub fn is_addressed_to(&self, instance_id: &str) -> bool {
        self.header_str(header::SLOT_INSTANCE_IDS)
            .split(',')
            .any(|id| id == instance_id || id == BROADCAST)
    }

    /// Slots to invoke on `instance_id`, in header order.
    #[must_use]
    pub fn slots_for(&self, instance_id: &str) -> Vec<String> {
        self.header_str(header::SLOT_FUNCTIONS)
            .split(',')
            .filter_map(|entry| entry.rsplit_once(':'))
            .filter(|(id, _)| *id == instance_id || *id == BROADCAST)
            .map(|(_, slot)| slot.to_string())
            .collect()
    }

    /// Body of a reply as a result.
    pub fn into_result(self) -> Result<Hash> {
        if self.is_error() {
            Err(error_from_body(&self.body))
        } else {
            Ok(self.body)
        }
    }

    /// Serialized form used on the TCP broker wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut envelope = Hash::new();
        envelope.set_key("header", self.header.clone());
        envelope.set_key("body", self.body.clone());
        encode_hash(&envelope)
    }

    pub fn decode(bytes: &[u8]) -> Result<Message> {
        let envelope = decode_hash(bytes)?;
        Ok(Message::new(
            envelope.get_hash("header")?.clone(),
            envelope.get_hash("body")?.clone(),
        ))
    }
}

/// `Hash("a1", kindTag, "a2", detail, "a3", violations)`.
#[must_use]
pub fn error_to_body(error: &KaraboError) -> Hash {
    let violations: Vec<Hash> = error
        .violations()
        .iter()
        .map(|v| {
            Hash::new()
                .with("path", v.path.as_str())
                .with("kind", v.kind.as_str())
                .with("message", v.message.as_str())
        })
        .collect();
    Hash::new()
        .with("a1", error.kind().as_str())
        .with("a2", error.detail())
        .with("a3", violations)
}

/// Inverse of [`error_to_body`]; malformed bodies become `Protocol` errors.
#[must_use]
pub fn error_from_body(body: &Hash) -> KaraboError {
    let Ok(kind) = body
        .get::<String>("a1")
        .and_then(|tag| tag.parse::<ErrorKind>())
    else {
        return KaraboError::Protocol(format!("malformed error reply: {body}"));
    };
    let detail = body.get::<String>("a2").unwrap_or_default();
    if kind == ErrorKind::Validation {
        let violations: Vec<Violation> = body
            .get_vector_hash("a3")
            .map(|items| {
                items
                    .iter()
                    .filter_map(|h| {
                        Some(Violation::new(
                            h.get::<String>("path").ok()?,
                            h.get::<String>("kind").ok()?.parse::<ViolationKind>().ok()?,
                            h.get::<String>("message").unwrap_or_default(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !violations.is_empty() {
            return KaraboError::Validation(violations);
        }
    }
    KaraboError::from_kind(kind, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_routing() {
        let m = Message::call("a", "b", "slotFoo", Hash::new().with("a1", 1i32));
        assert_eq!(m.sender(), "a");
        assert_eq!(m.signal_function(), CALL);
        assert!(m.is_addressed_to("b"));
        assert!(!m.is_addressed_to("c"));
        assert_eq!(m.slots_for("b"), vec!["slotFoo"]);
        assert!(m.slots_for("c").is_empty());
    }

    #[test]
    fn test_signal_fans_out_to_subscribers() {
        let subs = vec![
            ("x".to_string(), "slotOne".to_string()),
            ("y".to_string(), "slotTwo".to_string()),
            ("x".to_string(), "slotThree".to_string()),
        ];
        let m = Message::signal("dev", "signalChanged", &subs, Hash::new());
        assert_eq!(m.slots_for("x"), vec!["slotOne", "slotThree"]);
        assert_eq!(m.slots_for("y"), vec!["slotTwo"]);
        assert!(Message::broadcast("dev", "slotPing", Hash::new()).is_addressed_to("anyone"));
    }

    #[test]
    fn test_error_reply_round_trips_violations() {
        let err = KaraboError::Validation(vec![Violation::new(
            "speed",
            ViolationKind::OutOfRange,
            "too fast",
        )]);
        let m = Message::reply("dev", "caller", "r1", Err(err.clone()));
        assert!(m.is_reply());
        assert_eq!(m.reply_id(), Some("r1"));
        let decoded = Message::decode(&m.encode().unwrap()).unwrap();
        assert_eq!(decoded.into_result(), Err(err));

        let timeout = Message::reply("dev", "caller", "r2", Err(KaraboError::Timeout("late".into())));
        assert_eq!(timeout.into_result(), Err(KaraboError::Timeout("late".into())));
    }
}
