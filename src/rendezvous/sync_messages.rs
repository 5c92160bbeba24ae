use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    Request,
    Response,
}

/// Content of the messages a rendezvous handshake exchanges: `{"sync": "request"}` or
///  `{"sync": "response"}`. Anything else is application traffic and ignored by the handshake.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub sync: SyncKind,
}

impl SyncMessage {
    pub const REQUEST: SyncMessage = SyncMessage { sync: SyncKind::Request };
    pub const RESPONSE: SyncMessage = SyncMessage { sync: SyncKind::Response };
}
