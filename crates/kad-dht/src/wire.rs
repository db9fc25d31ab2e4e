//! Wire-protocol envelope and typed request/response records.
//!
//! Every record below is CBOR-encoded (via `ciborium`) and carried inside a
//! small versioned [`Envelope`], modeled on the request/response-correlated
//! message envelopes used elsewhere in this stack: a fixed header the
//! receiver can validate before even attempting to parse the inner payload.

use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::{DhtError, Result};

/// Current wire protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Outer envelope wrapping every request and response on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire protocol version, checked before the payload is parsed.
    pub version: u8,
    /// Correlates a response to its originating request ([`crate::rpc`]).
    pub request_id: u32,
    /// CBOR-encoded [`Message`].
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a [`Message`] for transmission.
    pub fn new(request_id: u32, message: &Message) -> Result<Self> {
        Ok(Self {
            version: WIRE_VERSION,
            request_id,
            payload: to_vec(message)?,
        })
    }

    /// Serialize this envelope to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_vec(self)
    }

    /// Parse an envelope from CBOR bytes and validate its version.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let envelope: Self = from_slice(data)?;
        if envelope.version != WIRE_VERSION {
            return Err(DhtError::Serialization(format!(
                "unsupported wire version {}, expected {WIRE_VERSION}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    /// Decode the inner payload as a [`Message`].
    pub fn decode(&self) -> Result<Message> {
        from_slice(&self.payload)
    }
}

/// A signed value: a payload plus an Ed25519 signature over it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedValue {
    /// The value bytes that were signed.
    pub payload: Vec<u8>,
    /// Signature over `payload`, verified against `public_key` in [`StoreRequest`].
    pub signature: Vec<u8>,
}

/// Every typed request or response this node exchanges with peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    StoreRequest(StoreRequest),
    StoreResponse(StoreResponse),
    FindNodeRequest(FindNodeRequest),
    FindNodeResponse(FindNodeResponse),
    FindValueRequest(FindValueRequest),
    FindValueResponse(FindValueResponse),
    DownlistRequest(DownlistRequest),
    DownlistResponse(DownlistResponse),
    BootstrapRequest(BootstrapRequest),
    BootstrapResponse(BootstrapResponse),
    NatDetectionPingRequest(NatDetectionPingRequest),
    NatDetectionPingResponse(NatDetectionPingResponse),
}

/// Common header every request carries: the sender's claimed contact info.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SenderInfo {
    pub contact: Contact,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub sender: SenderInfo,
    /// Must equal the literal `"ping"` to be honored.
    pub body: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
    /// `"pong"` on success.
    pub body: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRequest {
    pub sender: SenderInfo,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub signed_value: Option<SignedValue>,
    pub public_key: Option<Vec<u8>>,
    pub signed_public_key: Option<Vec<u8>>,
    pub signed_request: Option<Vec<u8>>,
    pub ttl: u64,
    pub publish: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub ok: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub sender: SenderInfo,
    pub key: Vec<u8>,
    pub is_bootstrap: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub contacts: Vec<Contact>,
    /// Filled in only when the request had `is_bootstrap = true` and the
    /// server has an opinion about the requester's external address.
    pub requester_ext_addr: Option<(String, u16)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub sender: SenderInfo,
    pub key: Vec<u8>,
    pub is_bootstrap: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueResponse {
    pub values: Vec<Vec<u8>>,
    pub contacts: Vec<Contact>,
    pub alternative_value_holder: Option<Contact>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownlistRequest {
    pub sender: SenderInfo,
    pub dead_contacts: Vec<Contact>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownlistResponse {
    pub ok: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub newcomer_id: crate::id::NodeId,
    pub newcomer_local_ip: String,
    pub newcomer_local_port: u16,
    pub claimed_ext_ip: String,
    pub claimed_ext_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub responder_id: crate::id::NodeId,
    /// `1` = fully reachable, `2` = restricted (rendezvous), `3` = symmetric.
    pub nat_type: u8,
    pub observed_ext_ip: String,
    pub observed_ext_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NatDetectionPingRequest {
    pub sender: SenderInfo,
    /// Must equal the literal `"nat_detection_ping"` to be honored.
    pub body: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NatDetectionPingResponse {
    pub ok: bool,
    pub body: String,
}

fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| DhtError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

fn from_slice<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data)
        .map_err(|e| DhtError::Serialization(format!("CBOR deserialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;

    fn sender() -> SenderInfo {
        SenderInfo {
            contact: Contact::new(
                NodeId::random(),
                "127.0.0.1".to_string(),
                9000,
                "10.0.0.1".to_string(),
                9000,
            ),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = Message::PingRequest(PingRequest {
            sender: sender(),
            body: "ping".to_string(),
        });
        let envelope = Envelope::new(42, &msg).expect("build envelope");
        let bytes = envelope.to_bytes().expect("serialize");
        let restored = Envelope::from_bytes(&bytes).expect("deserialize");
        assert_eq!(restored.request_id, 42);
        match restored.decode().expect("decode payload") {
            Message::PingRequest(req) => assert_eq!(req.body, "ping"),
            other => panic!("unexpected message variant: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_version_rejected() {
        let msg = Message::PingRequest(PingRequest {
            sender: sender(),
            body: "ping".to_string(),
        });
        let mut envelope = Envelope::new(1, &msg).expect("build envelope");
        envelope.version = 99;
        let bytes = envelope.to_bytes().expect("serialize");
        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_store_request_roundtrip() {
        let msg = Message::StoreRequest(StoreRequest {
            sender: sender(),
            key: b"key".to_vec(),
            value: Some(b"value".to_vec()),
            signed_value: None,
            public_key: None,
            signed_public_key: None,
            signed_request: None,
            ttl: 3600,
            publish: true,
        });
        let envelope = Envelope::new(7, &msg).expect("build envelope");
        let bytes = envelope.to_bytes().expect("serialize");
        let restored = Envelope::from_bytes(&bytes).expect("deserialize");
        match restored.decode().expect("decode") {
            Message::StoreRequest(req) => {
                assert_eq!(req.key, b"key".to_vec());
                assert_eq!(req.value, Some(b"value".to_vec()));
                assert!(req.publish);
            }
            other => panic!("unexpected message variant: {other:?}"),
        }
    }

    #[test]
    fn test_find_value_response_with_alternative_holder() {
        let holder = Contact::new(NodeId::random(), "1.2.3.4".to_string(), 1, "0.0.0.0".to_string(), 0);
        let msg = Message::FindValueResponse(FindValueResponse {
            values: vec![],
            contacts: vec![],
            alternative_value_holder: Some(holder.clone()),
        });
        let envelope = Envelope::new(3, &msg).expect("build envelope");
        let bytes = envelope.to_bytes().expect("serialize");
        let restored = Envelope::from_bytes(&bytes).expect("deserialize");
        match restored.decode().expect("decode") {
            Message::FindValueResponse(resp) => {
                assert_eq!(resp.alternative_value_holder.expect("holder present").id, holder.id);
            }
            other => panic!("unexpected message variant: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(Envelope::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }
}
