//! §4.D `SessionCoordinator` — one actor per accepted WebSocket
//! connection, implementing the signaling protocol state machine and
//! orchestrating `MediaRouter` and the downstream verification/quality
//! subsystems on the session's behalf.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web_actors::ws;
use confcore_proto::{
    Command, CommandHandler, CloseReason, DtlsParameters, ErrorCode, Event,
    FingerprintRole, MeetingId, RouterObjectId, SessionId, TransportDirection,
    UserId,
};
use serde_json::Value;
use slog::warn;

use crate::ack::EnsureWindow;
use crate::app::AppState;
use crate::fingerprint::{AddReceiverFingerprint, AddSenderFingerprint};
use crate::messages::{ApplyTier, Deliver, SessionRecipients};
use crate::registry::{ListRecipients, Register, Remove};
use crate::router::{router_rtp_capabilities, RouterError, TransportPair};
use crate::rtcp::{AddReport, RtcpSample};

/// A session's coarse progress through the signaling protocol (§3
/// "Session"). Production/consumption are tracked separately from this
/// (a session can do both at once, and either before the other), by the
/// presence of `producer_id`/entries in `consumers` rather than by a
/// dedicated state here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ConnectionState {
    /// Accepted, not yet joined. There is no real authentication step
    /// (out of scope), so every connection starts here and is treated as
    /// already authenticated.
    Authenticated,
    Joined,
    TransportsCreated,
    Leaving,
    Closed,
}

/// A `MediaRouter` call outcome translated into the wire error taxonomy
/// (§6 "Error codes", §7).
enum Failed {
    NotConsumable,
    NotFound,
    Failure(String),
    Timeout,
}

impl Failed {
    /// Second element is whether this failure must also close the
    /// session (§5 "router timeouts also force session close").
    fn into_event(self) -> (Event, bool) {
        match self {
            Self::NotConsumable => {
                (Event::error(ErrorCode::Malformed, "NotConsumable"), false)
            }
            Self::NotFound => {
                (Event::error(ErrorCode::NotFound, "not found"), false)
            }
            Self::Failure(msg) => {
                (Event::error(ErrorCode::ServerError, msg), false)
            }
            Self::Timeout => (
                Event::error(ErrorCode::ServerError, "MediaRouterTimeout"),
                true,
            ),
        }
    }
}

/// Runs a `MediaRouter` call under the configured per-call deadline (§5
/// "suggest 5s"), translating a timeout or router error into `Failed`.
async fn call_router<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, RouterError>>,
) -> Result<T, Failed> {
    match tokio::time::timeout(deadline, fut).await {
        Err(_) => Err(Failed::Timeout),
        Ok(Err(RouterError::NotConsumable)) => Err(Failed::NotConsumable),
        Ok(Err(RouterError::NotFound)) => Err(Failed::NotFound),
        Ok(Err(RouterError::Failure(msg))) => Err(Failed::Failure(msg)),
        Ok(Ok(v)) => Ok(v),
    }
}

pub struct SessionCoordinator {
    app: AppState,
    session_id: SessionId,
    state: ConnectionState,
    meeting_id: Option<MeetingId>,
    user_id: Option<UserId>,
    transports: Option<TransportPair>,
    send_dtls: Option<DtlsParameters>,
    recv_dtls: Option<DtlsParameters>,
    producer_id: Option<RouterObjectId>,
    /// Cached from the most recent `produce`, reused as this session's
    /// receive capabilities on `consume` (§9 Open Questions: the wire
    /// protocol carries no separate receive-capability negotiation
    /// message).
    receive_rtp_capabilities: Option<Value>,
    /// `sender_user_id -> consumer_id` for consumers this session owns;
    /// iterated by `Handler<ApplyTier>` (§4.H "Application").
    consumers: HashMap<UserId, RouterObjectId>,
    /// `producer_id -> owning user_id`, learned from `Event::NewProducer`
    /// broadcasts as they pass through this session's `Handler<Deliver>`.
    known_producers: HashMap<RouterObjectId, UserId>,
    outbound_bytes: usize,
    last_activity: Instant,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(app: AppState) -> Self {
        let session_id = app.next_session_id();
        Self {
            app,
            session_id,
            state: ConnectionState::Authenticated,
            meeting_id: None,
            user_id: None,
            transports: None,
            send_dtls: None,
            recv_dtls: None,
            producer_id: None,
            receive_rtp_capabilities: None,
            consumers: HashMap::new(),
            known_producers: HashMap::new(),
            outbound_bytes: 0,
            last_activity: Instant::now(),
        }
    }

    fn deadline(&self) -> Duration {
        self.app.conf.timers.router_call_deadline
    }

    /// Sends one wire frame, force-closing the session if doing so would
    /// push the un-flushed byte count past the configured high-water mark
    /// (§4.C, §5 "resource caps").
    fn send_event(&mut self, ctx: &mut ws::WebsocketContext<Self>, event: Event) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let Ok(json) = serde_json::to_string(&event) else {
            return;
        };
        if self.outbound_bytes + json.len() > self.app.conf.server.outbound_high_water_bytes {
            warn!(
                crate::log::logger(),
                "outbound queue high-water exceeded, evicting session";
                "session_id" => self.session_id.0,
            );
            self.begin_leave(ctx, CloseReason::Evicted);
            return;
        }
        self.outbound_bytes += json.len();
        ctx.text(json);
    }

    fn close_socket(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some(reason.to_string()),
        }));
        ctx.stop();
    }

    fn fail(&mut self, ctx: &mut ws::WebsocketContext<Self>, failed: Failed) {
        let (event, should_close) = failed.into_event();
        self.send_event(ctx, event);
        if should_close {
            self.begin_leave(ctx, CloseReason::InternalError);
        }
    }

    /// Tears down this session's media resources and registry entry
    /// (if any), then closes the socket (§4.D `leave`/disconnect).
    fn begin_leave(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: CloseReason) {
        if matches!(self.state, ConnectionState::Leaving | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Leaving;

        let Some(meeting_id) = self.meeting_id.clone() else {
            self.close_socket(ctx, reason);
            return;
        };
        let user_id = self.user_id.clone().expect("meeting_id implies user_id");

        let router = self.app.media_router.clone();
        let registry = self.app.registry.clone();
        let rtcp = self.app.rtcp.clone();
        let ack = self.app.ack.clone();
        let fut = async move {
            router.cleanup_user(&user_id).await;
            let destroyed = registry
                .send(Remove {
                    meeting_id: meeting_id.clone(),
                    user_id,
                })
                .await
                .unwrap_or(false);
            if destroyed {
                rtcp.do_send(crate::rtcp::ForgetMeeting {
                    meeting_id: meeting_id.clone(),
                });
                ack.do_send(crate::ack::ForgetMeeting { meeting_id });
            }
        };
        ctx.spawn(fut.into_actor(self).map(move |(), act, ctx| {
            act.close_socket(ctx, reason);
        }));
    }

    fn handle_join(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        meeting_id: MeetingId,
        user_id: UserId,
        display_name: String,
    ) {
        if self.state != ConnectionState::Authenticated {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "already joined"));
            return;
        }

        let recipients = SessionRecipients {
            deliver: ctx.address().recipient(),
            apply_tier: ctx.address().recipient(),
        };
        let registry = self.app.registry.clone();
        let fut = {
            let meeting_id = meeting_id.clone();
            let user_id = user_id.clone();
            async move {
                registry
                    .send(Register {
                        meeting_id,
                        user_id,
                        display_name,
                        recipients,
                    })
                    .await
            }
        };

        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| {
            match result {
                Ok(Ok(participants)) => {
                    act.meeting_id = Some(meeting_id.clone());
                    act.user_id = Some(user_id.clone());
                    act.state = ConnectionState::Joined;
                    act.send_event(
                        ctx,
                        Event::Joined {
                            success: true,
                            participants,
                            router_rtp_capabilities: router_rtp_capabilities(),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        },
                    );
                }
                Ok(Err(_duplicate)) => {
                    act.send_event(ctx, Event::error(ErrorCode::Malformed, "DuplicateUser"));
                    act.begin_leave(ctx, CloseReason::Rejected);
                }
                Err(_mailbox) => {
                    act.send_event(
                        ctx,
                        Event::error(ErrorCode::ServerError, "registry unavailable"),
                    );
                    act.begin_leave(ctx, CloseReason::InternalError);
                }
            }
        }));
    }

    fn handle_get_router_rtp_capabilities(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.send_event(
            ctx,
            Event::RouterRtpCapabilities {
                rtp_capabilities: router_rtp_capabilities(),
            },
        );
    }

    fn handle_create_web_rtc_transport(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        direction: TransportDirection,
    ) {
        let Some(user_id) = self.user_id.clone() else {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "join required"));
            return;
        };

        if let Some(pair) = self.transports.clone() {
            let descriptor = match direction {
                TransportDirection::Send => pair.send,
                TransportDirection::Recv => pair.recv,
            };
            self.send_event(
                ctx,
                Event::WebRtcTransportCreated {
                    id: descriptor.id,
                    ice_parameters: descriptor.ice_parameters,
                    ice_candidates: descriptor.ice_candidates,
                    dtls_parameters: descriptor.dtls_parameters,
                },
            );
            return;
        }

        let router = self.app.media_router.clone();
        let deadline = self.deadline();
        let fut = async move { call_router(deadline, router.create_transports(&user_id)).await };

        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| match result {
            Ok(pair) => {
                act.transports = Some(pair.clone());
                act.state = ConnectionState::TransportsCreated;
                let descriptor = match direction {
                    TransportDirection::Send => pair.send,
                    TransportDirection::Recv => pair.recv,
                };
                act.send_event(
                    ctx,
                    Event::WebRtcTransportCreated {
                        id: descriptor.id,
                        ice_parameters: descriptor.ice_parameters,
                        ice_candidates: descriptor.ice_candidates,
                        dtls_parameters: descriptor.dtls_parameters,
                    },
                );
            }
            Err(failed) => act.fail(ctx, failed),
        }));
    }

    fn handle_connect_web_rtc_transport(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) {
        let Some(user_id) = self.user_id.clone() else {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "join required"));
            return;
        };
        if self.transports.is_none() {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "InvalidState"));
            return;
        }

        let cached = match direction {
            TransportDirection::Send => &self.send_dtls,
            TransportDirection::Recv => &self.recv_dtls,
        };
        if let Some(existing) = cached {
            if existing == &dtls_parameters {
                self.send_event(ctx, Event::WebRtcTransportConnected { direction });
            } else {
                self.send_event(ctx, Event::error(ErrorCode::Malformed, "InvalidState"));
            }
            return;
        }

        let router = self.app.media_router.clone();
        let deadline = self.deadline();
        let fut = {
            let dtls_parameters = dtls_parameters.clone();
            async move {
                call_router(
                    deadline,
                    router.connect_transport(&user_id, direction, &dtls_parameters),
                )
                .await
            }
        };

        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| match result {
            Ok(()) => {
                match direction {
                    TransportDirection::Send => act.send_dtls = Some(dtls_parameters),
                    TransportDirection::Recv => act.recv_dtls = Some(dtls_parameters),
                }
                act.send_event(ctx, Event::WebRtcTransportConnected { direction });
            }
            Err(failed) => act.fail(ctx, failed),
        }));
    }

    fn handle_produce(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        _kind: String,
        rtp_parameters: Value,
    ) {
        let (Some(user_id), Some(meeting_id)) = (self.user_id.clone(), self.meeting_id.clone())
        else {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "join required"));
            return;
        };
        let Some(send_transport_id) = self.transports.as_ref().map(|p| p.send.id.clone()) else {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "InvalidState"));
            return;
        };
        if self.send_dtls.is_none() {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "InvalidState"));
            return;
        }

        let router = self.app.media_router.clone();
        let registry = self.app.registry.clone();
        let ack = self.app.ack.clone();
        let deadline = self.deadline();
        let fut = {
            let rtp_parameters = rtp_parameters.clone();
            async move {
                let created = call_router(
                    deadline,
                    router.create_producer(&user_id, &send_transport_id, &rtp_parameters),
                )
                .await;
                let Ok(producer_id) = created else {
                    return (created.err(), Vec::new());
                };

                ack.do_send(EnsureWindow {
                    meeting_id: meeting_id.clone(),
                    sender_user_id: user_id.clone(),
                });
                let others = registry
                    .send(ListRecipients {
                        meeting_id,
                        exclude_user_id: Some(user_id.clone()),
                    })
                    .await
                    .unwrap_or_default();
                for (_, recipients) in &others {
                    let _ = recipients.deliver.do_send(Deliver(Event::NewProducer {
                        producer_user_id: user_id.clone(),
                        producer_id: producer_id.clone(),
                    }));
                }
                (None, vec![producer_id])
            }
        };

        ctx.spawn(fut.into_actor(self).map(move |(failed, ids), act, ctx| {
            if let Some(failed) = failed {
                act.fail(ctx, failed);
                return;
            }
            let producer_id = ids.into_iter().next().expect("Ok path always yields one id");
            act.producer_id = Some(producer_id.clone());
            act.receive_rtp_capabilities = Some(rtp_parameters.clone());
            act.send_event(ctx, Event::Produced { producer_id });
        }));
    }

    fn handle_consume(&mut self, ctx: &mut ws::WebsocketContext<Self>, producer_id: RouterObjectId) {
        let Some(user_id) = self.user_id.clone() else {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "join required"));
            return;
        };
        if self.recv_dtls.is_none() {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "InvalidState"));
            return;
        }
        let Some(sender_user_id) = self.known_producers.get(&producer_id).cloned() else {
            self.send_event(ctx, Event::error(ErrorCode::NotFound, "unknown producer"));
            return;
        };

        let router = self.app.media_router.clone();
        let deadline = self.deadline();
        let capabilities = self
            .receive_rtp_capabilities
            .clone()
            .unwrap_or(Value::Null);
        let fut = async move {
            call_router(
                deadline,
                router.create_consumer(&user_id, &sender_user_id, &producer_id, &capabilities),
            )
            .await
            .map(|descriptor| (sender_user_id, descriptor))
        };

        ctx.spawn(fut.into_actor(self).map(move |result, act, ctx| match result {
            Ok((sender_user_id, descriptor)) => {
                act.consumers.insert(sender_user_id, descriptor.id.clone());
                act.send_event(
                    ctx,
                    Event::Consumed {
                        id: descriptor.id,
                        producer_id: descriptor.producer_id,
                        kind: descriptor.kind,
                        rtp_parameters: descriptor.rtp_parameters,
                    },
                );
            }
            Err(failed) => act.fail(ctx, failed),
        }));
    }

    fn handle_leave(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        meeting_id: MeetingId,
        user_id: UserId,
    ) {
        if self.meeting_id.as_ref() != Some(&meeting_id) || self.user_id.as_ref() != Some(&user_id)
        {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "not a member"));
            return;
        }
        self.begin_leave(ctx, CloseReason::Finished);
    }

    fn handle_frame_fingerprint(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        role: FingerprintRole,
        frame_id: confcore_proto::FrameId,
        crc32: u32,
        sender_user_id: Option<UserId>,
        receiver_user_id: Option<UserId>,
        _rtp_timestamp: Option<u32>,
    ) {
        let (Some(self_user_id), Some(meeting_id)) = (self.user_id.clone(), self.meeting_id.clone())
        else {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "join required"));
            return;
        };

        match role {
            FingerprintRole::Sender => {
                self.app.fingerprint.do_send(AddSenderFingerprint {
                    meeting_id,
                    sender_user_id: self_user_id,
                    frame_id,
                    crc32,
                });
            }
            FingerprintRole::Receiver => {
                let Some(sender_user_id) = sender_user_id else {
                    self.send_event(
                        ctx,
                        Event::error(ErrorCode::Malformed, "senderUserId required"),
                    );
                    return;
                };
                self.app.fingerprint.do_send(AddReceiverFingerprint {
                    meeting_id,
                    sender_user_id,
                    frame_id,
                    receiver_user_id: receiver_user_id.unwrap_or(self_user_id),
                    crc32,
                });
            }
        }
    }

    fn handle_rtcp_report(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        meeting_id: MeetingId,
        user_id: UserId,
        rtcp_data: confcore_proto::RtcpData,
    ) {
        if self.meeting_id.as_ref() != Some(&meeting_id) || self.user_id.as_ref() != Some(&user_id)
        {
            self.send_event(ctx, Event::error(ErrorCode::Malformed, "not a member"));
            return;
        }
        self.app.rtcp.do_send(AddReport {
            meeting_id,
            receiver_user_id: user_id,
            sample: RtcpSample {
                packets_lost_pct: rtcp_data.packets_lost,
                jitter_ms: rtcp_data.jitter,
                rtt_ms: rtcp_data.rtt,
            },
        });
    }
}

impl Actor for SessionCoordinator {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let idle_timeout = self.app.conf.timers.idle_timeout;
        ctx.run_interval(Duration::from_secs(1), move |act, ctx| {
            if act.last_activity.elapsed() > idle_timeout {
                act.begin_leave(ctx, CloseReason::Idle);
            }
        });
        // Approximates flush completion: `actix-web-actors`'s
        // `WebsocketContext` does not expose a real write-drain signal in
        // this version, so the high-water counter is periodically reset
        // rather than decremented as bytes actually leave the socket.
        ctx.run_interval(Duration::from_millis(250), |act, _ctx| {
            act.outbound_bytes = 0;
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionCoordinator {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let Ok(msg) = item else {
            self.begin_leave(ctx, CloseReason::InternalError);
            return;
        };
        match msg {
            ws::Message::Text(text) => {
                if self.state == ConnectionState::Closed {
                    return;
                }
                self.last_activity = Instant::now();
                match serde_json::from_str::<Command>(&text) {
                    Ok(cmd) => cmd.dispatch_with(&mut Dispatch(self, ctx)),
                    Err(err) => {
                        self.send_event(ctx, Event::error(ErrorCode::Malformed, err.to_string()));
                    }
                }
            }
            ws::Message::Ping(bytes) => {
                self.last_activity = Instant::now();
                ctx.pong(&bytes);
            }
            ws::Message::Pong(_) => {
                self.last_activity = Instant::now();
            }
            ws::Message::Close(_) => {
                self.begin_leave(ctx, CloseReason::Finished);
            }
            _ => {}
        }
    }
}

impl Handler<Deliver> for SessionCoordinator {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        if let Event::NewProducer {
            ref producer_user_id,
            ref producer_id,
        } = msg.0
        {
            self.known_producers
                .insert(producer_id.clone(), producer_user_id.clone());
        }
        self.send_event(ctx, msg.0);
    }
}

impl Handler<ApplyTier> for SessionCoordinator {
    type Result = ();

    fn handle(&mut self, msg: ApplyTier, ctx: &mut Self::Context) {
        let router = self.app.media_router.clone();
        let spatial_layer = msg.0.spatial_layer();
        for consumer_id in self.consumers.values().cloned() {
            let router = router.clone();
            let fut = async move {
                router
                    .set_consumer_preferred_layer(&consumer_id, spatial_layer)
                    .await
            };
            ctx.spawn(fut.into_actor(self).map(move |result, _act, _ctx| {
                if let Err(err) = result {
                    warn!(
                        crate::log::logger(),
                        "failed to apply tier to consumer";
                        "error" => err.to_string(),
                    );
                }
            }));
        }
    }
}

/// Adapts the synchronous `CommandHandler` trait (only `&mut self`, no
/// room for a `Context`) to `SessionCoordinator`'s handler methods, which
/// need `ctx` to spawn the async `MediaRouter` calls those commands
/// trigger. Built as `Dispatch(self, ctx)` from inside
/// `StreamHandler::handle`, where `self` and `ctx` are already two
/// independent `&mut` borrows.
struct Dispatch<'a>(&'a mut SessionCoordinator, &'a mut ws::WebsocketContext<SessionCoordinator>);

impl CommandHandler for Dispatch<'_> {
    fn on_join(&mut self, meeting_id: MeetingId, user_id: UserId, display_name: String) {
        self.0.handle_join(self.1, meeting_id, user_id, display_name);
    }

    fn on_get_router_rtp_capabilities(&mut self) {
        self.0.handle_get_router_rtp_capabilities(self.1);
    }

    fn on_create_web_rtc_transport(&mut self, direction: TransportDirection) {
        self.0.handle_create_web_rtc_transport(self.1, direction);
    }

    fn on_connect_web_rtc_transport(
        &mut self,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) {
        self.0
            .handle_connect_web_rtc_transport(self.1, direction, dtls_parameters);
    }

    fn on_produce(&mut self, kind: String, rtp_parameters: Value) {
        self.0.handle_produce(self.1, kind, rtp_parameters);
    }

    fn on_consume(&mut self, producer_id: RouterObjectId) {
        self.0.handle_consume(self.1, producer_id);
    }

    fn on_leave(&mut self, meeting_id: MeetingId, user_id: UserId) {
        self.0.handle_leave(self.1, meeting_id, user_id);
    }

    fn on_frame_fingerprint(
        &mut self,
        role: FingerprintRole,
        frame_id: confcore_proto::FrameId,
        crc32: u32,
        sender_user_id: Option<UserId>,
        receiver_user_id: Option<UserId>,
        rtp_timestamp: Option<u32>,
    ) {
        self.0.handle_frame_fingerprint(
            self.1,
            role,
            frame_id,
            crc32,
            sender_user_id,
            receiver_user_id,
            rtp_timestamp,
        );
    }

    fn on_rtcp_report(
        &mut self,
        meeting_id: MeetingId,
        user_id: UserId,
        rtcp_data: confcore_proto::RtcpData,
    ) {
        self.0.handle_rtcp_report(self.1, meeting_id, user_id, rtcp_data);
    }
}
