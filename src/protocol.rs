use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Discriminator carried in the `type` field of every frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    // Server -> client control
    Init,
    Match,

    // Peer -> peer negotiation, relayed untouched
    Offer,
    Answer,
    IceCandidate,
    Bye,

    // Anything else a newer client might send. Parsed, never routed.
    #[serde(other)]
    Unknown,
}

impl SignalKind {
    /// Kinds a client may address to another client.
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate | SignalKind::Bye
        )
    }
}

/// One JSON object per frame: `{ "type", "payload", "to", "from" }`.
///
/// The payload is kept as raw JSON so negotiation data (SDP, ICE candidates)
/// passes through the relay byte-for-byte without being interpreted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    // `None` only when the key is absent; an explicit `null` is kept and relayed.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    // Filled by the server for security
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Overwrite whatever sender the client claimed with its authenticated identity.
    pub fn stamp_sender(&mut self, client_id: &str) {
        self.from = Some(client_id.to_owned());
    }

    /// Destination identity, if the frame is addressed at all.
    pub fn recipient(&self) -> Option<&str> {
        self.to.as_deref().filter(|to| !to.is_empty())
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

/// Control messages the server itself constructs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerSignal {
    /// The client's own identity, sent once right after the upgrade.
    Init(String),
    /// The identity of the peer the client has been paired with.
    Match(String),
}
