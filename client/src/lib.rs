//! `ClientEngine` (§4.I): the client half of the signaling protocol —
//! connection lifecycle, fingerprint emission/matching, RTCP emission,
//! and tier reception. Audio capture/playback and the underlying peer
//! connection are abstracted behind `MediaEngine`, the client-side
//! mirror of the server's `MediaRouter` trait, exactly as the real media
//! engine is kept external to the server core.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use actix::prelude::*;
use actix::SpawnHandle;
use async_trait::async_trait;
use confcore_proto::{
    Command, DtlsParameters, FingerprintRole, FrameId, MeetingId, RouterObjectId,
    TransportDirection, UserId,
};
use serde_json::Value;
use slog::{debug, info};

/// One 20ms PCM frame, tagged with the RTP timestamp it was captured or
/// decoded at (§4.I "Fingerprint emission").
#[derive(Clone, Debug, PartialEq)]
pub struct PcmFrame {
    pub rtp_timestamp: u32,
    pub samples: Vec<i16>,
}

/// WebRTC stats sample as collected client-side every 5s (§4.I "RTCP
/// emission"). Field names mirror `confcore_proto::RtcpData` but this
/// type belongs to the capture layer, not the wire protocol.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RtcpStats {
    pub packets_lost: f64,
    pub jitter: f64,
    pub rtt: f64,
}

/// The client-side mirror of `MediaRouter`: capture, decode, and local
/// peer-connection/statistics access, kept external to this crate's
/// signaling logic (§4.I, §1 "real media engine out of scope").
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Returns the next 20ms PCM frame to fingerprint and send, or `None`
    /// if capture has not produced one yet.
    async fn capture_frame(&self) -> Option<PcmFrame>;

    /// Returns the next decoded PCM frame received from `sender_user_id`,
    /// or `None` if nothing new has arrived.
    async fn decode_frame(&self, sender_user_id: &UserId) -> Option<PcmFrame>;

    /// Current WebRTC statistics for the peer connection as a whole.
    async fn webrtc_stats(&self) -> RtcpStats;

    /// Tears down local capture/playback and the peer connection.
    async fn close(&self);
}

/// Sends one `Command` frame on behalf of `ClientEngine`. The concrete
/// transport (a WebSocket client, a test harness feeding `Event`s back
/// in) lives outside this crate, mirroring `MediaRouter`'s boundary on
/// the server side.
pub trait SignalingChannel: Send + Sync {
    fn send_command(&self, command: Command);
}

/// CRC-32 over the little-endian byte layout of a PCM frame's samples
/// (§4.I "compute CRC-32 over the little-endian byte layout").
#[must_use]
pub fn fingerprint_pcm(samples: &[i16]) -> u32 {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    crc32fast::hash(&bytes)
}

/// Window within which a receiver frame is matched to a sender frame by
/// RTP timestamp proximity (§4.I "`|rtp_ts - sample_rtp_ts| ≤ 50 ms`").
const FINGERPRINT_MATCH_WINDOW_MS: u32 = 50;

/// How long a sender's `(frame_id → rtp_timestamp)` mapping survives
/// before it is pruned (§4.I "a short (≤ 2s) map").
const SENDER_FRAME_MEMORY: Duration = Duration::from_secs(2);

/// §4.I fixed simulcast encoding ceilings the client requests from its
/// peer connection when producing. Wire constants; MUST NOT vary.
pub const SIMULCAST_MAX_BITRATE_BPS: [u32; 3] = [16_000, 32_000, 64_000];

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum ConnectionState {
    Idle,
    Joined,
    Producing,
}

struct RememberedFrame {
    rtp_timestamp: u32,
    remembered_at: std::time::Instant,
}

/// The client engine actor. One instance per joined meeting.
pub struct ClientEngine {
    signaling: std::sync::Arc<dyn SignalingChannel>,
    media: std::sync::Arc<dyn MediaEngine>,
    meeting_id: MeetingId,
    user_id: UserId,
    state: ConnectionState,
    next_frame_id: u64,
    sender_frames: HashMap<FrameId, RememberedFrame>,
    /// Known remote producers this engine has started consuming, so a
    /// receiver fingerprint can be attributed to the right sender.
    known_senders: Vec<UserId>,
    fingerprint_send_timer: Option<SpawnHandle>,
    fingerprint_receive_timer: Option<SpawnHandle>,
    rtcp_timer: Option<SpawnHandle>,
    /// Direction of the `CreateWebRtcTransport` command last sent, so the
    /// matching `WebRtcTransportCreated` reply (which carries no direction
    /// of its own on the wire) can be connected with the right direction.
    pending_create_direction: Option<TransportDirection>,
    /// Set once the recv transport has been requested, so a burst of
    /// `NewProducer` events only triggers its creation once (§4.I).
    recv_transport_requested: bool,
    recv_transport_ready: bool,
    /// Producers announced before the recv transport finished connecting;
    /// flushed into `Consume` commands once it is ready.
    pending_consumes: Vec<RouterObjectId>,
}

impl ClientEngine {
    #[must_use]
    pub fn new(
        signaling: std::sync::Arc<dyn SignalingChannel>,
        media: std::sync::Arc<dyn MediaEngine>,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Self {
        Self {
            signaling,
            media,
            meeting_id,
            user_id,
            state: ConnectionState::Idle,
            next_frame_id: 0,
            sender_frames: HashMap::new(),
            known_senders: Vec::new(),
            fingerprint_send_timer: None,
            fingerprint_receive_timer: None,
            rtcp_timer: None,
            pending_create_direction: None,
            recv_transport_requested: false,
            recv_transport_ready: false,
            pending_consumes: Vec::new(),
        }
    }

    fn fresh_frame_id(&mut self) -> FrameId {
        let id = FrameId(self.next_frame_id);
        self.next_frame_id += 1;
        id
    }

    /// §4.I "Target rate 25 Hz (down-sampled from 50 Hz)": captures are
    /// produced at 50Hz but only every other one is fingerprinted and
    /// sent, via this 40ms tick.
    fn start_fingerprint_emission(&mut self, ctx: &mut Context<Self>) {
        let handle = ctx.run_interval(Duration::from_millis(40), |act, ctx| {
            act.emit_sender_fingerprint(ctx);
        });
        self.fingerprint_send_timer = Some(handle);
    }

    fn start_fingerprint_reception(&mut self, ctx: &mut Context<Self>) {
        let handle = ctx.run_interval(Duration::from_millis(20), |act, ctx| {
            act.emit_receiver_fingerprints(ctx);
        });
        self.fingerprint_receive_timer = Some(handle);
    }

    fn start_rtcp_emission(&mut self, ctx: &mut Context<Self>) {
        let handle = ctx.run_interval(Duration::from_secs(5), |act, ctx| {
            act.emit_rtcp_report(ctx);
        });
        self.rtcp_timer = Some(handle);
    }

    fn emit_sender_fingerprint(&mut self, ctx: &mut Context<Self>) {
        let media = self.media.clone();
        let fut = async move { media.capture_frame().await };
        ctx.spawn(fut.into_actor(self).map(|frame, act, _ctx| {
            let Some(frame) = frame else { return };
            let frame_id = act.fresh_frame_id();
            let crc32 = fingerprint_pcm(&frame.samples);
            act.sender_frames.insert(
                frame_id,
                RememberedFrame {
                    rtp_timestamp: frame.rtp_timestamp,
                    remembered_at: std::time::Instant::now(),
                },
            );
            act.sender_frames
                .retain(|_, f| f.remembered_at.elapsed() < SENDER_FRAME_MEMORY);
            act.signaling.send_command(Command::FrameFingerprint {
                role: FingerprintRole::Sender,
                frame_id,
                crc32,
                sender_user_id: None,
                receiver_user_id: None,
                rtp_timestamp: Some(frame.rtp_timestamp),
            });
        }));
    }

    fn emit_receiver_fingerprints(&mut self, ctx: &mut Context<Self>) {
        for sender_user_id in self.known_senders.clone() {
            let media = self.media.clone();
            let sender_user_id_for_decode = sender_user_id.clone();
            let fut = async move { media.decode_frame(&sender_user_id_for_decode).await };
            ctx.spawn(fut.into_actor(self).map(move |frame, act, _ctx| {
                let Some(frame) = frame else { return };
                let closest = act
                    .sender_frames
                    .iter()
                    .map(|(id, f)| (id, f.rtp_timestamp.abs_diff(frame.rtp_timestamp)))
                    .filter(|(_, diff)| *diff <= FINGERPRINT_MATCH_WINDOW_MS)
                    .min_by_key(|(_, diff)| *diff)
                    .map(|(id, _)| *id);

                let Some(frame_id) = closest else {
                    debug!(
                        slog_scope::logger(),
                        "no sender frame within the fingerprint match window, dropping";
                        "sender_user_id" => sender_user_id.to_string(),
                    );
                    return;
                };
                let crc32 = fingerprint_pcm(&frame.samples);
                act.signaling.send_command(Command::FrameFingerprint {
                    role: FingerprintRole::Receiver,
                    frame_id,
                    crc32,
                    sender_user_id: Some(sender_user_id.clone()),
                    receiver_user_id: Some(act.user_id.clone()),
                    rtp_timestamp: Some(frame.rtp_timestamp),
                });
            }));
        }
    }

    fn emit_rtcp_report(&mut self, ctx: &mut Context<Self>) {
        let media = self.media.clone();
        let fut = async move { media.webrtc_stats().await };
        ctx.spawn(fut.into_actor(self).map(|stats, act, _ctx| {
            act.signaling.send_command(Command::RtcpReport {
                meeting_id: act.meeting_id.clone(),
                user_id: act.user_id.clone(),
                rtcp_data: confcore_proto::RtcpData {
                    packets_lost: stats.packets_lost,
                    jitter: stats.jitter,
                    rtt: stats.rtt,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
            });
        }));
    }

    /// §4.I "Cancellation": stops every timer. Cancelling an
    /// already-stopped or already-fired handle is a no-op, so calling
    /// this more than once is safe.
    fn stop_timers(&mut self, ctx: &mut Context<Self>) {
        for handle in [
            self.fingerprint_send_timer.take(),
            self.fingerprint_receive_timer.take(),
            self.rtcp_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            ctx.cancel_future(handle);
        }
    }
}

impl Actor for ClientEngine {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        self.signaling.send_command(Command::Join {
            meeting_id: self.meeting_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.user_id.0.clone(),
        });
    }
}

/// Feeds one inbound `Event` frame into the engine, driving the
/// connection lifecycle forward (§4.I).
#[derive(Message)]
#[rtype(result = "()")]
pub struct InboundEvent(pub confcore_proto::Event);

impl Handler<InboundEvent> for ClientEngine {
    type Result = ();

    fn handle(&mut self, msg: InboundEvent, ctx: &mut Self::Context) {
        use confcore_proto::Event;
        match msg.0 {
            Event::Joined {
                router_rtp_capabilities,
                ..
            } => {
                self.state = ConnectionState::Joined;
                info!(slog_scope::logger(), "joined meeting"; "meeting_id" => self.meeting_id.to_string());
                let _ = router_rtp_capabilities;
                self.pending_create_direction = Some(TransportDirection::Send);
                self.signaling.send_command(Command::CreateWebRtcTransport {
                    direction: TransportDirection::Send,
                });
            }
            Event::WebRtcTransportCreated {
                dtls_parameters, ..
            } => {
                let direction = self
                    .pending_create_direction
                    .take()
                    .unwrap_or(TransportDirection::Send);
                self.signaling
                    .send_command(Command::ConnectWebRtcTransport {
                        direction,
                        dtls_parameters: dummy_local_dtls(&dtls_parameters),
                    });
            }
            Event::WebRtcTransportConnected { direction } => match direction {
                TransportDirection::Send => {
                    self.signaling.send_command(Command::Produce {
                        kind: "audio".into(),
                        rtp_parameters: simulcast_rtp_parameters(),
                    });
                }
                TransportDirection::Recv => {
                    self.recv_transport_ready = true;
                    for producer_id in self.pending_consumes.drain(..) {
                        self.signaling
                            .send_command(Command::Consume { producer_id });
                    }
                }
            },
            Event::Produced { .. } => {
                self.state = ConnectionState::Producing;
                self.start_fingerprint_emission(ctx);
                self.start_fingerprint_reception(ctx);
                self.start_rtcp_emission(ctx);
            }
            Event::NewProducer {
                producer_user_id,
                producer_id,
            } => {
                self.known_senders.push(producer_user_id);
                if self.recv_transport_ready {
                    self.signaling
                        .send_command(Command::Consume { producer_id });
                } else {
                    self.pending_consumes.push(producer_id);
                    if !self.recv_transport_requested {
                        self.recv_transport_requested = true;
                        self.pending_create_direction = Some(TransportDirection::Recv);
                        self.signaling.send_command(Command::CreateWebRtcTransport {
                            direction: TransportDirection::Recv,
                        });
                    }
                }
            }
            Event::TierChange { tier, .. } => {
                debug!(slog_scope::logger(), "tier changed"; "tier" => tier.to_string());
            }
            _ => {}
        }
    }
}

/// Leaves the meeting: cancels every timer, tells the server, and closes
/// the local peer connection (§4.I "Cancellation").
#[derive(Message)]
#[rtype(result = "()")]
pub struct Leave;

impl Handler<Leave> for ClientEngine {
    type Result = ();

    fn handle(&mut self, _: Leave, ctx: &mut Self::Context) {
        self.stop_timers(ctx);
        self.signaling.send_command(Command::Leave {
            meeting_id: self.meeting_id.clone(),
            user_id: self.user_id.clone(),
        });
        let media = self.media.clone();
        ctx.spawn(async move { media.close().await }.into_actor(self).map(
            |(), _act, ctx| {
                ctx.stop();
            },
        ));
    }
}

/// Real transports negotiate DTLS via the peer connection; lacking one
/// here, this engine echoes the role/fingerprint pair the router handed
/// back, which is sufficient for `MockMediaRouter`'s round trip.
fn dummy_local_dtls(remote: &DtlsParameters) -> DtlsParameters {
    DtlsParameters {
        role: Some("client".into()),
        fingerprints: remote.fingerprints.clone(),
    }
}

/// §4.I "requests Opus encoding with three simulcast encodings at fixed
/// ceilings".
fn simulcast_rtp_parameters() -> Value {
    serde_json::json!({
        "codecs": [{ "mimeType": "audio/opus" }],
        "encodings": SIMULCAST_MAX_BITRATE_BPS
            .iter()
            .enumerate()
            .map(|(layer, max_bitrate)| serde_json::json!({
                "rid": layer.to_string(),
                "maxBitrate": max_bitrate,
            }))
            .collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fingerprint_matches_identical_pcm_and_differs_on_change() {
        let a = fingerprint_pcm(&[1, 2, 3, 4]);
        let b = fingerprint_pcm(&[1, 2, 3, 4]);
        let c = fingerprint_pcm(&[1, 2, 3, 5]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    struct CapturingChannel {
        sent: Mutex<Vec<Command>>,
    }
    impl SignalingChannel for CapturingChannel {
        fn send_command(&self, command: Command) {
            self.sent.lock().unwrap().push(command);
        }
    }

    struct SilentMedia;
    #[async_trait]
    impl MediaEngine for SilentMedia {
        async fn capture_frame(&self) -> Option<PcmFrame> {
            None
        }
        async fn decode_frame(&self, _sender_user_id: &UserId) -> Option<PcmFrame> {
            None
        }
        async fn webrtc_stats(&self) -> RtcpStats {
            RtcpStats::default()
        }
        async fn close(&self) {}
    }

    #[actix_rt::test]
    async fn started_sends_join() {
        let signaling = std::sync::Arc::new(CapturingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let engine = ClientEngine::new(
            signaling.clone(),
            std::sync::Arc::new(SilentMedia),
            MeetingId("m".into()),
            UserId("u".into()),
        );
        let _addr = engine.start();
        actix_rt::time::sleep(Duration::from_millis(20)).await;

        let sent = signaling.sent.lock().unwrap();
        assert!(matches!(sent.first(), Some(Command::Join { .. })));
    }

    #[actix_rt::test]
    async fn produced_event_starts_emitters_without_panicking() {
        let signaling = std::sync::Arc::new(CapturingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let engine = ClientEngine::new(
            signaling,
            std::sync::Arc::new(SilentMedia),
            MeetingId("m".into()),
            UserId("u".into()),
        );
        let addr = engine.start();
        addr.send(InboundEvent(confcore_proto::Event::Produced {
            producer_id: RouterObjectId("p".into()),
        }))
        .await
        .unwrap();
        addr.send(Leave).await.unwrap();
    }

    #[actix_rt::test]
    async fn new_producer_drives_recv_transport_before_consuming() {
        let signaling = std::sync::Arc::new(CapturingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let engine = ClientEngine::new(
            signaling.clone(),
            std::sync::Arc::new(SilentMedia),
            MeetingId("m".into()),
            UserId("u".into()),
        );
        let addr = engine.start();

        addr.send(InboundEvent(confcore_proto::Event::NewProducer {
            producer_user_id: UserId("other".into()),
            producer_id: RouterObjectId("p".into()),
        }))
        .await
        .unwrap();

        {
            let sent = signaling.sent.lock().unwrap();
            assert!(matches!(
                sent.last(),
                Some(Command::CreateWebRtcTransport {
                    direction: TransportDirection::Recv
                })
            ));
            assert!(!sent.iter().any(|c| matches!(c, Command::Consume { .. })));
        }

        addr.send(InboundEvent(confcore_proto::Event::WebRtcTransportCreated {
            id: RouterObjectId("t-recv".into()),
            ice_parameters: confcore_proto::IceParameters {
                username_fragment: "uf".into(),
                password: "pw".into(),
            },
            ice_candidates: Vec::new(),
            dtls_parameters: confcore_proto::DtlsParameters {
                role: None,
                fingerprints: Vec::new(),
            },
        }))
        .await
        .unwrap();
        {
            let sent = signaling.sent.lock().unwrap();
            assert!(matches!(
                sent.last(),
                Some(Command::ConnectWebRtcTransport {
                    direction: TransportDirection::Recv,
                    ..
                })
            ));
        }

        addr.send(InboundEvent(confcore_proto::Event::WebRtcTransportConnected {
            direction: TransportDirection::Recv,
        }))
        .await
        .unwrap();

        let sent = signaling.sent.lock().unwrap();
        assert!(matches!(
            sent.last(),
            Some(Command::Consume { producer_id }) if producer_id.0 == "p"
        ));
    }
}
