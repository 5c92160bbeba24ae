use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::identity::Identity;


/// Per-channel sequence number of an envelope, assigned by the sending channel. Ids start at 1;
///  [MessageId::NONE] marks envelopes that were not (yet) assigned an id.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const NONE: MessageId = MessageId(0);
    pub const FIRST: MessageId = MessageId(1);

    pub fn next(self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}


/// The operation tag of an envelope: distinguishes application payloads from control frames.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    /// application payload
    #[default]
    Msg,
    /// acknowledges the envelope with the same id
    Ack,
    /// announces the sender's identity on a freshly opened channel
    Registration,
    /// first location report of a session
    InitLocation,
    /// subsequent location reports
    Location,
    /// asks the relay for the current roster
    Nearby,
    /// wraps a retransmitted envelope in its `content`
    Resend,
    /// roster notification: a participant registered
    Joined,
    /// roster notification: a participant went away
    Left,
}


/// The unit of transport. On the wire, this is a JSON text frame
///  `{"op": ..., "from": ..., "to": ..., "id": ..., "content": ...}` with `from` and `to`
///  omitted when absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Identity>,
    #[serde(default)]
    pub id: MessageId,
    #[serde(default)]
    pub content: Value,
}

impl Envelope {
    pub fn new(op: Op, to: Option<Identity>, content: Value) -> Envelope {
        Envelope {
            op,
            from: None,
            to,
            id: MessageId::NONE,
            content,
        }
    }

    pub fn message(to: Identity, content: Value) -> Envelope {
        Self::new(Op::Msg, Some(to), content)
    }

    pub fn registration(myself: Identity) -> Envelope {
        let mut result = Self::new(Op::Registration, None, Value::Null);
        result.from = Some(myself);
        result
    }

    pub fn ack(id: MessageId) -> Envelope {
        let mut result = Self::new(Op::Ack, None, Value::Null);
        result.id = id;
        result
    }

    /// Wraps this envelope for retransmission: same id and addressing, the original envelope
    ///  goes into `content`.
    pub fn resend_wrapper(&self) -> anyhow::Result<Envelope> {
        Ok(Envelope {
            op: Op::Resend,
            from: self.from.clone(),
            to: self.to.clone(),
            id: self.id,
            content: serde_json::to_value(self)?,
        })
    }

    /// Returns the envelope itself, or - for a resend wrapper - the original envelope it carries.
    pub fn unwrap_resend(self) -> anyhow::Result<Envelope> {
        if self.op != Op::Resend {
            return Ok(self);
        }

        let inner: Envelope = serde_json::from_value(self.content)?;
        if inner.op == Op::Resend {
            return Err(anyhow!("nested resend wrapper for {:?}", inner.id));
        }
        Ok(inner)
    }

    pub fn is_resend(&self) -> bool {
        self.op == Op::Resend
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn try_from_frame(frame: &str) -> anyhow::Result<Envelope> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Interprets the content as a `T`, returning `None` if it has a different shape.
    pub fn content_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.content.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::msg(Op::Msg, "\"msg\"")]
    #[case::ack(Op::Ack, "\"ack\"")]
    #[case::registration(Op::Registration, "\"registration\"")]
    #[case::init_location(Op::InitLocation, "\"init-location\"")]
    #[case::resend(Op::Resend, "\"resend\"")]
    #[case::left(Op::Left, "\"left\"")]
    fn test_op_wire_names(#[case] op: Op, #[case] expected: &str) {
        assert_eq!(serde_json::to_string(&op).unwrap(), expected);
    }

    #[test]
    fn test_frame_omits_missing_addresses() {
        let frame = Envelope::ack(MessageId(17)).to_frame().unwrap();
        assert_eq!(frame, r#"{"op":"ack","id":17,"content":null}"#);
    }

    #[rstest]
    #[case::minimal(r#"{"id":3}"#, Envelope { op: Op::Msg, from: None, to: None, id: MessageId(3), content: Value::Null })]
    #[case::full(r#"{"op":"msg","from":"a","to":"b","id":5,"content":{"x":1}}"#, Envelope {
        op: Op::Msg,
        from: Some("a".into()),
        to: Some("b".into()),
        id: MessageId(5),
        content: json!({"x": 1}),
    })]
    #[case::ack(r#"{"op":"ack","id":9}"#, Envelope::ack(MessageId(9)))]
    fn test_try_from_frame(#[case] frame: &str, #[case] expected: Envelope) {
        assert_eq!(Envelope::try_from_frame(frame).unwrap(), expected);
    }

    #[rstest]
    #[case::not_json("hello")]
    #[case::unknown_op(r#"{"op":"frobnicate","id":1}"#)]
    #[case::bad_id(r#"{"op":"msg","id":"x"}"#)]
    fn test_try_from_frame_invalid(#[case] frame: &str) {
        assert!(Envelope::try_from_frame(frame).is_err());
    }

    #[test]
    fn test_resend_wrapper() {
        let mut original = Envelope::message("b".into(), json!("hi"));
        original.from = Some("a".into());
        original.id = MessageId(4);

        let wrapper = original.resend_wrapper().unwrap();
        assert_eq!(wrapper.op, Op::Resend);
        assert_eq!(wrapper.id, MessageId(4));
        assert_eq!(wrapper.to, original.to);
        assert!(wrapper.is_resend());

        let frame = wrapper.to_frame().unwrap();
        let unwrapped = Envelope::try_from_frame(&frame).unwrap()
            .unwrap_resend().unwrap();
        assert_eq!(unwrapped, original);
    }

    #[test]
    fn test_unwrap_resend_rejects_nested_wrappers() {
        let original = Envelope::message("b".into(), json!(1));
        let twice = original.resend_wrapper().unwrap()
            .resend_wrapper().unwrap();
        assert!(twice.unwrap_resend().is_err());
    }

    #[test]
    fn test_message_id_sequence() {
        assert_eq!(MessageId::NONE.next(), MessageId::FIRST);
        assert_eq!(MessageId::FIRST.next(), MessageId(2));
        assert_eq!(format!("{:?}", MessageId(12)), "#12");
    }
}
