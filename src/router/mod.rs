//! §4.B `MediaRouter` — the abstract boundary to the SFU media engine.
//!
//! The core never assumes a particular media library (§4.B, §9 "the
//! source mentions... out of scope" companion note in §1): it only needs
//! this capability set. `MockMediaRouter` is a deterministic in-memory
//! stand-in used by tests and by the bundled binary when no real SFU is
//! wired in; a production deployment supplies its own
//! `Box<dyn MediaRouter>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use confcore_proto::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters,
    RouterObjectId, TransportDirection, UserId,
};
use derive_more::Display;
use serde_json::Value;

/// Opus stereo 48kHz parameters the core must understand at the
/// parameter level (§4.B): payload type 111, in-band FEC, DTX enabled.
/// These are wire/interface constants, not implementation hints (§9).
pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const OPUS_CLOCK_RATE_HZ: u32 = 48_000;
pub const OPUS_CHANNELS: u8 = 2;
pub const OPUS_USE_INBAND_FEC: bool = true;
pub const OPUS_USE_DTX: bool = true;

/// One side (send or recv) of a session's WebRTC transport pair.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportDescriptor {
    pub id: RouterObjectId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Both transports created for a session in one `MediaRouter` call.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportPair {
    pub send: TransportDescriptor,
    pub recv: TransportDescriptor,
}

/// A created consumer, as returned to the `consume` handler (§6
/// `consumed`).
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerDescriptor {
    pub id: RouterObjectId,
    pub producer_id: RouterObjectId,
    pub kind: String,
    pub rtp_parameters: Value,
}

/// Errors a `MediaRouter` implementation can report. `NotConsumable` maps
/// to wire `400`; everything else maps to wire `500` (§6, §7).
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum RouterError {
    #[display(fmt = "receiver capabilities are incompatible with producer")]
    NotConsumable,
    #[display(fmt = "unknown transport, producer, or consumer id")]
    NotFound,
    #[display(fmt = "media router failure: {}", _0)]
    Failure(String),
}

impl std::error::Error for RouterError {}

/// Capability set the `SessionCoordinator` needs from the SFU, per
/// §4.B. Implementations must be safely shareable across the
/// coordinator's actor tasks (`Send + Sync`).
#[async_trait]
pub trait MediaRouter: Send + Sync {
    async fn create_transports(
        &self,
        user_id: &UserId,
    ) -> Result<TransportPair, RouterError>;

    async fn connect_transport(
        &self,
        user_id: &UserId,
        direction: TransportDirection,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), RouterError>;

    async fn create_producer(
        &self,
        user_id: &UserId,
        send_transport_id: &RouterObjectId,
        rtp_parameters: &Value,
    ) -> Result<RouterObjectId, RouterError>;

    async fn create_consumer(
        &self,
        receiver_user_id: &UserId,
        sender_user_id: &UserId,
        producer_id: &RouterObjectId,
        receiver_rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, RouterError>;

    async fn set_consumer_preferred_layer(
        &self,
        consumer_id: &RouterObjectId,
        spatial_layer: u8,
    ) -> Result<(), RouterError>;

    async fn cleanup_user(&self, user_id: &UserId);
}

/// The router's advertised receive capabilities: a fixed, single-codec
/// (Opus) capability set, since this is an audio-only SFU and there is no
/// per-deployment codec negotiation (§4.B, §9). Returned verbatim for
/// both `join`'s `routerRtpCapabilities` and `getRouterRtpCapabilities`.
#[must_use]
pub fn router_rtp_capabilities() -> Value {
    serde_json::json!({
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": OPUS_PAYLOAD_TYPE,
            "clockRate": OPUS_CLOCK_RATE_HZ,
            "channels": OPUS_CHANNELS,
            "parameters": {
                "useinbandfec": OPUS_USE_INBAND_FEC as u8,
                "usedtx": OPUS_USE_DTX as u8,
            },
        }],
    })
}

/// Deterministic in-memory `MediaRouter`, sufficient for exercising the
/// signaling/coordinator/quality-controller logic without a real SFU.
#[derive(Default)]
pub struct MockMediaRouter {
    next_id: AtomicU64,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    producers_by_user: HashMap<UserId, RouterObjectId>,
    producer_owner: HashMap<RouterObjectId, UserId>,
    consumers: HashMap<RouterObjectId, RouterObjectId>,
}

impl MockMediaRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self, prefix: &str) -> RouterObjectId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        RouterObjectId(format!("{}-{}", prefix, n))
    }

    fn opus_rtp_parameters() -> Value {
        serde_json::json!({
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": OPUS_PAYLOAD_TYPE,
                "clockRate": OPUS_CLOCK_RATE_HZ,
                "channels": OPUS_CHANNELS,
                "parameters": {
                    "useinbandfec": OPUS_USE_INBAND_FEC as u8,
                    "usedtx": OPUS_USE_DTX as u8,
                },
            }],
        })
    }
}

#[async_trait]
impl MediaRouter for MockMediaRouter {
    async fn create_transports(
        &self,
        _user_id: &UserId,
    ) -> Result<TransportPair, RouterError> {
        let make = |id: RouterObjectId| TransportDescriptor {
            id,
            ice_parameters: IceParameters {
                username_fragment: "icefrag".into(),
                password: "icepwd".into(),
            },
            ice_candidates: vec![IceCandidate {
                foundation: "1".into(),
                protocol: "udp".into(),
                priority: 2_113_667_327,
                ip: "127.0.0.1".into(),
                port: 10000,
                r#type: "host".into(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("server".into()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".into(),
                    value: "00:11:22:33".into(),
                }],
            },
        };
        Ok(TransportPair {
            send: make(self.fresh_id("transport")),
            recv: make(self.fresh_id("transport")),
        })
    }

    async fn connect_transport(
        &self,
        _user_id: &UserId,
        _direction: TransportDirection,
        _dtls_parameters: &DtlsParameters,
    ) -> Result<(), RouterError> {
        Ok(())
    }

    async fn create_producer(
        &self,
        user_id: &UserId,
        _send_transport_id: &RouterObjectId,
        _rtp_parameters: &Value,
    ) -> Result<RouterObjectId, RouterError> {
        let id = self.fresh_id("producer");
        let mut state = self.state.lock().unwrap();
        state.producers_by_user.insert(user_id.clone(), id.clone());
        state.producer_owner.insert(id.clone(), user_id.clone());
        Ok(id)
    }

    async fn create_consumer(
        &self,
        _receiver_user_id: &UserId,
        _sender_user_id: &UserId,
        producer_id: &RouterObjectId,
        _receiver_rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, RouterError> {
        let mut state = self.state.lock().unwrap();
        if !state.producer_owner.contains_key(producer_id) {
            return Err(RouterError::NotFound);
        }
        let id = self.fresh_id("consumer");
        state.consumers.insert(id.clone(), producer_id.clone());
        Ok(ConsumerDescriptor {
            id,
            producer_id: producer_id.clone(),
            kind: "audio".into(),
            rtp_parameters: Self::opus_rtp_parameters(),
        })
    }

    async fn set_consumer_preferred_layer(
        &self,
        consumer_id: &RouterObjectId,
        _spatial_layer: u8,
    ) -> Result<(), RouterError> {
        let state = self.state.lock().unwrap();
        if state.consumers.contains_key(consumer_id) {
            Ok(())
        } else {
            Err(RouterError::NotFound)
        }
    }

    async fn cleanup_user(&self, user_id: &UserId) {
        let mut state = self.state.lock().unwrap();
        if let Some(producer_id) = state.producers_by_user.remove(user_id) {
            state.producer_owner.remove(&producer_id);
            state
                .consumers
                .retain(|_, owner_producer| owner_producer != &producer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_consumer_for_unknown_producer_is_not_consumable_like() {
        let router = MockMediaRouter::new();
        let err = router
            .create_consumer(
                &UserId("r".into()),
                &UserId("s".into()),
                &RouterObjectId("does-not-exist".into()),
                &Value::Null,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::NotFound);
    }

    #[tokio::test]
    async fn cleanup_user_removes_their_producer() {
        let router = MockMediaRouter::new();
        let producer_id = router
            .create_producer(
                &UserId("s".into()),
                &RouterObjectId("t".into()),
                &Value::Null,
            )
            .await
            .unwrap();
        router.cleanup_user(&UserId("s".into())).await;
        let err = router
            .create_consumer(
                &UserId("r".into()),
                &UserId("s".into()),
                &producer_id,
                &Value::Null,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::NotFound);
    }
}
