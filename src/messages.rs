//! Cross-actor message types that do not belong to any single component.
//!
//! Per §9 "Cyclic references": components never hold a direct mutable
//! handle to another component's internals. Everything that crosses an
//! actor boundary is a typed `actix::Message`, addressed through an
//! `actix::Recipient<M>` rather than a concrete `Addr<SomeActor>`, so a
//! sender (e.g. `MeetingRegistry`, `AckAggregator`, `QualityController`)
//! only depends on the message shape, not on who ultimately handles it.

use actix::prelude::*;
use confcore_proto::{Event, Tier};

/// Pushes one outbound protocol frame to a single session's
/// `SessionCoordinator`, which serializes it and writes it to that
/// session's `SignalingTransport`.
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct Deliver(pub Event);

/// Instructs a session's `SessionCoordinator` to apply a new tier to
/// every consumer it currently owns, via `MediaRouter`
/// `set_consumer_preferred_layer` (§4.H "Application"). Sent by
/// `QualityController`; distinct from `Deliver(Event::TierChange)`
/// because this is an internal instruction, not a wire frame — the
/// coordinator is the only component that knows which consumer ids it
/// owns (§3 "Session").
#[derive(Message, Clone, Copy, Debug)]
#[rtype(result = "()")]
pub struct ApplyTier(pub Tier);

/// The pair of recipients a `SessionCoordinator` exposes to the rest of
/// the system: one for wire-frame delivery, one for internal tier
/// application. Bundled so `MeetingRegistry::ListRecipients` stays a
/// single lookup.
#[derive(Clone)]
pub struct SessionRecipients {
    pub deliver: Recipient<Deliver>,
    pub apply_tier: Recipient<ApplyTier>,
}
