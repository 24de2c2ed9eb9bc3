//! Shared process state: the addresses of every long-lived actor plus the
//! `MediaRouter` collaborator, cloned into each new `SessionCoordinator`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actix::prelude::*;
use confcore_proto::SessionId;

use crate::ack::AckAggregator;
use crate::conf::Conf;
use crate::fingerprint::FingerprintVerifier;
use crate::quality::QualityController;
use crate::registry::MeetingRegistry;
use crate::router::MediaRouter;
use crate::rtcp::RtcpCollector;

/// Everything a freshly accepted `SessionCoordinator` needs a handle to.
/// Cloning this is cheap: every field is an `Addr`/`Arc`.
#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub registry: Addr<MeetingRegistry>,
    pub fingerprint: Addr<FingerprintVerifier>,
    pub ack: Addr<AckAggregator>,
    pub rtcp: Addr<RtcpCollector>,
    /// Kept alive for the process lifetime; nothing queries it directly,
    /// it drives itself off `conf.timers.quality_decision_interval`.
    pub quality: Addr<QualityController>,
    pub media_router: Arc<dyn MediaRouter>,
    session_ids: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(conf: Conf, media_router: Arc<dyn MediaRouter>) -> Self {
        let conf = Arc::new(conf);
        let registry = MeetingRegistry::new().start();
        let ack = AckAggregator::new(registry.clone(), conf.timers.ack_window).start();
        let fingerprint = FingerprintVerifier::new(
            ack.clone().recipient(),
            conf.timers.fingerprint_ttl,
            conf.timers.fingerprint_sweep_interval,
        )
        .start();
        let rtcp = RtcpCollector::new().start();
        let quality = QualityController::new(
            registry.clone(),
            rtcp.clone(),
            media_router.clone(),
            conf.timers.quality_decision_interval,
            conf.timers.quality_anti_flap,
        )
        .start();

        Self {
            conf,
            registry,
            fingerprint,
            ack,
            rtcp,
            quality,
            media_router,
            session_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mints a process-unique `SessionId` for a newly accepted connection.
    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.session_ids.fetch_add(1, Ordering::Relaxed))
    }
}
