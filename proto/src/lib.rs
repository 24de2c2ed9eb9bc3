//! Wire protocol for the audio conferencing control plane.
//!
//! Every signaling frame is a single UTF-8 JSON object carrying a `type`
//! discriminator, exchanged over a reliable, ordered, message-framed
//! channel (logically a WebSocket). This crate defines the `Command`
//! (client → server) and `Event` (server → client) enums plus every value
//! type they carry, so that both `confcore` (the server) and
//! `confcore-client` (the `ClientEngine`) link against one shared
//! definition instead of hand-duplicating JSON shapes.

#![forbid(unsafe_code)]

use confcore_macro::dispatchable;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Opaque, process-unique meeting identifier.
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MeetingId(pub String);

/// Identifier of a user, unique within a single live meeting.
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Opaque, per-connection session identifier minted by the server.
#[derive(
    Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

/// Sender-assigned identifier of a 20ms PCM frame, stable across the
/// network so a receiver can echo it back verbatim.
#[derive(
    Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FrameId(pub u64);

/// Opaque identifier of a `MediaRouter` transport, producer, or consumer.
#[derive(
    Clone, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RouterObjectId(pub String);

/// Quality tier a meeting is currently running at, mapped 1:1 to a
/// simulcast spatial layer by `MediaRouter::set_consumer_preferred_layer`.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "LOW")]
    #[display(fmt = "LOW")]
    Low,
    #[serde(rename = "MED")]
    #[display(fmt = "MED")]
    Med,
    #[serde(rename = "HIGH")]
    #[display(fmt = "HIGH")]
    High,
}

impl Tier {
    /// Simulcast spatial layer this tier is forwarded on: LOW=0, MED=1,
    /// HIGH=2, per §4.H.
    #[must_use]
    pub fn spatial_layer(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Med => 1,
            Self::High => 2,
        }
    }

    /// Simulcast encoding max bitrate in bits/second for this tier's layer,
    /// per the client's fixed encoding ceilings (§4.I): these are wire
    /// constants and MUST NOT vary.
    #[must_use]
    pub fn max_bitrate_bps(self) -> u32 {
        match self {
            Self::Low => 16_000,
            Self::Med => 32_000,
            Self::High => 64_000,
        }
    }
}

impl Default for Tier {
    /// A meeting starts at `HIGH` per §3 "Meeting" lifecycle.
    fn default() -> Self {
        Self::High
    }
}

/// Direction of a `MediaRouter` WebRTC transport.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Role a `frame-fingerprint` report is made in: the sender of the audio,
/// or one of its receivers.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintRole {
    Sender,
    Receiver,
}

/// A participant as returned in the `joined` participant roster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
}

/// [RTCIceCandidateInit][1]-shaped candidate handed back by the router.
///
/// [1]: https://www.w3.org/TR/webrtc/#dom-rtcicecandidateinit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub protocol: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub r#type: String,
}

/// ICE parameters for a transport, as produced by `MediaRouter`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
}

/// A single DTLS fingerprint entry of `dtlsParameters.fingerprints`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters exchanged to establish SRTP keying, §6 "SDP semantics":
/// the core never relies on custom SDP attributes, only this structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    pub role: Option<String>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// RTCP statistics payload as emitted by the client every 5s (§4.I).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpData {
    /// Fraction of packets lost in `[0, 1]`.
    pub packets_lost: f64,
    pub jitter: f64,
    pub rtt: f64,
    pub timestamp: i64,
}

/// Message from a Web Client to the Media Server. One variant per row of
/// §6's client→server table; `type` is the wire discriminator.
#[dispatchable]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    Join {
        meeting_id: MeetingId,
        user_id: UserId,
        display_name: String,
    },
    GetRouterRtpCapabilities,
    CreateWebRtcTransport {
        direction: TransportDirection,
    },
    ConnectWebRtcTransport {
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: String,
        rtp_parameters: serde_json::Value,
    },
    Consume {
        producer_id: RouterObjectId,
    },
    Leave {
        meeting_id: MeetingId,
        user_id: UserId,
    },
    FrameFingerprint {
        role: FingerprintRole,
        frame_id: FrameId,
        crc32: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtp_timestamp: Option<u32>,
    },
    RtcpReport {
        meeting_id: MeetingId,
        user_id: UserId,
        rtcp_data: RtcpData,
    },
}

/// Reason a session's connection was closed, echoed on the WebSocket close
/// frame. A superset of §7's taxonomy plus the supplemental reasons in
/// `SPEC_FULL.md` §11.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The session left normally (`leave` or clean disconnect).
    Finished,
    /// A second connection for the same `(meeting, user_id)` replaced this
    /// one.
    Reconnected,
    /// No frames were received within the idle timeout.
    Idle,
    /// `join` was rejected (duplicate user, malformed, pre-auth).
    Rejected,
    /// A `MediaRouter` call failed or timed out.
    InternalError,
    /// The outbound queue exceeded its high-water mark.
    Evicted,
}

/// Error codes per §6 "Error codes".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Malformed = 400,
    Unauthorized = 401,
    NotFound = 404,
    ServerError = 500,
}

/// Message from the Media Server to a Web Client. One variant per row of
/// §6's server→client table.
#[dispatchable]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Joined {
        success: bool,
        participants: Vec<Participant>,
        router_rtp_capabilities: serde_json::Value,
        timestamp: i64,
    },
    RouterRtpCapabilities {
        rtp_capabilities: serde_json::Value,
    },
    WebRtcTransportCreated {
        id: RouterObjectId,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    WebRtcTransportConnected {
        direction: TransportDirection,
    },
    Produced {
        producer_id: RouterObjectId,
    },
    NewProducer {
        producer_user_id: UserId,
        producer_id: RouterObjectId,
    },
    Consumed {
        id: RouterObjectId,
        producer_id: RouterObjectId,
        kind: String,
        rtp_parameters: serde_json::Value,
    },
    UserJoined {
        user_id: UserId,
    },
    UserLeft {
        user_id: UserId,
    },
    TierChange {
        tier: Tier,
        timestamp: i64,
    },
    AckSummary {
        meeting_id: MeetingId,
        sender_user_id: UserId,
        acked_users: Vec<UserId>,
        missing_users: Vec<UserId>,
        match_rate: f64,
        timestamp: i64,
    },
    Error {
        code: u16,
        message: String,
    },
}

impl Event {
    /// Builds the `error{code, message}` frame described in §6/§7.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: code as u16,
            message: message.into(),
        }
    }
}

/// Flattens `meeting_id`/`sender_user_id` out of a `HashMap` key; kept
/// here because both `FingerprintVerifier` and `AckAggregator` key state
/// by this exact pair (§3 "FrameFingerprint", "AckWindow").
pub type MeetingSenderKey = (MeetingId, UserId);

/// A roster snapshot as seen by `AckAggregator`/`RtcpCollector`: ordered
/// by join time per §4.A `list_recipients`.
pub type Roster = Vec<UserId>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_serializes_to_spec_literal() {
        assert_eq!(serde_json::to_string(&Tier::Low).unwrap(), "\"LOW\"");
        assert_eq!(serde_json::to_string(&Tier::Med).unwrap(), "\"MED\"");
        assert_eq!(serde_json::to_string(&Tier::High).unwrap(), "\"HIGH\"");
    }

    #[test]
    fn tier_maps_to_spatial_layer() {
        assert_eq!(Tier::Low.spatial_layer(), 0);
        assert_eq!(Tier::Med.spatial_layer(), 1);
        assert_eq!(Tier::High.spatial_layer(), 2);
    }

    #[test]
    fn command_join_round_trips_through_json() {
        let cmd = Command::Join {
            meeting_id: MeetingId("m1".into()),
            user_id: UserId("u1".into()),
            display_name: "Alice".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"join\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        let err = serde_json::from_str::<Command>(r#"{"type":"doTheThing"}"#)
            .unwrap_err();
        assert!(err.is_data());
    }

    #[test]
    fn event_error_frame_carries_numeric_code() {
        let ev = Event::error(ErrorCode::Malformed, "bad frame");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["code"], 400);
    }
}
