//! §4.A `MeetingRegistry` — the authoritative, single-writer map of
//! `meeting_id → Meeting → sessions`.
//!
//! Implemented as a single [`actix::Actor`] so every mutation is
//! serialized through one mailbox, giving the "register unique user or
//! fail" atomicity §5 requires without an explicit lock.

use std::collections::HashMap;
use std::time::Instant;

use actix::prelude::*;
use confcore_proto::{MeetingId, Participant, Tier, UserId};
use derive_more::Display;

use crate::messages::{Deliver, SessionRecipients};

/// One live meeting: participants in join order, plus the currently
/// applied quality tier (§3 "Meeting").
#[derive(Debug)]
pub struct Meeting {
    pub created_at: Instant,
    pub tier: Tier,
    participants: Vec<ParticipantEntry>,
}

impl Meeting {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            tier: Tier::default(),
            participants: Vec::new(),
        }
    }

    fn find(&self, user_id: &UserId) -> Option<&ParticipantEntry> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }
}

struct ParticipantEntry {
    user_id: UserId,
    display_name: String,
    recipients: SessionRecipients,
}

/// §4.A error returned when a `user_id` is already registered live in the
/// meeting.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "user is already registered in this meeting")]
pub struct DuplicateUser;

impl std::error::Error for DuplicateUser {}

/// The registry actor itself.
#[derive(Default)]
pub struct MeetingRegistry {
    meetings: HashMap<MeetingId, Meeting>,
}

impl MeetingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of currently-live meetings; exposed for diagnostics/tests.
    #[must_use]
    pub fn meeting_count(&self) -> usize {
        self.meetings.len()
    }
}

impl Actor for MeetingRegistry {
    type Context = Context<Self>;
}

/// Registers a session's user into a meeting, creating the meeting on
/// first join. Broadcasts `user-joined` to every session already in the
/// meeting, in their per-recipient FIFO order (§4.D, §5).
#[derive(Message)]
#[rtype(result = "Result<Vec<Participant>, DuplicateUser>")]
pub struct Register {
    pub meeting_id: MeetingId,
    pub user_id: UserId,
    pub display_name: String,
    pub recipients: SessionRecipients,
}

impl Handler<Register> for MeetingRegistry {
    type Result = Result<Vec<Participant>, DuplicateUser>;

    fn handle(&mut self, msg: Register, _: &mut Self::Context) -> Self::Result {
        let meeting = self
            .meetings
            .entry(msg.meeting_id)
            .or_insert_with(Meeting::new);

        if meeting.find(&msg.user_id).is_some() {
            return Err(DuplicateUser);
        }

        let roster: Vec<Participant> = meeting
            .participants
            .iter()
            .map(|p| Participant {
                user_id: p.user_id.clone(),
                display_name: p.display_name.clone(),
            })
            .collect();

        for p in &meeting.participants {
            let _ = p.recipients.deliver.do_send(Deliver(
                confcore_proto::Event::UserJoined {
                    user_id: msg.user_id.clone(),
                },
            ));
        }

        meeting.participants.push(ParticipantEntry {
            user_id: msg.user_id.clone(),
            display_name: msg.display_name,
            recipients: msg.recipients,
        });

        Ok(roster)
    }
}

/// Removes a session's user from a meeting; if it was the last
/// participant, the meeting is destroyed (§3 "Meeting" lifecycle, grace
/// = 0). Broadcasts `user-left` to the remaining sessions exactly once,
/// in departure order. Resolves to whether the meeting was destroyed by
/// this removal, so callers can tell `RtcpCollector`/`AckAggregator` to
/// drop their per-meeting state instead of waiting for it to decay on
/// its own (§3 "grace = 0; no cleanup delay required").
#[derive(Message)]
#[rtype(result = "bool")]
pub struct Remove {
    pub meeting_id: MeetingId,
    pub user_id: UserId,
}

impl Handler<Remove> for MeetingRegistry {
    type Result = bool;

    fn handle(&mut self, msg: Remove, _: &mut Self::Context) -> Self::Result {
        let destroy = if let Some(meeting) = self.meetings.get_mut(&msg.meeting_id) {
            let before = meeting.participants.len();
            meeting.participants.retain(|p| p.user_id != msg.user_id);
            if meeting.participants.len() != before {
                for p in &meeting.participants {
                    let _ = p.recipients.deliver.do_send(Deliver(
                        confcore_proto::Event::UserLeft {
                            user_id: msg.user_id.clone(),
                        },
                    ));
                }
            }
            meeting.participants.is_empty()
        } else {
            false
        };

        if destroy {
            self.meetings.remove(&msg.meeting_id);
        }
        destroy
    }
}

/// Returns `(user_id, recipients)` pairs for a meeting, ordered by join
/// time, optionally excluding one user (§4.A `list_recipients`).
#[derive(Message)]
#[rtype(result = "Vec<(UserId, SessionRecipients)>")]
pub struct ListRecipients {
    pub meeting_id: MeetingId,
    pub exclude_user_id: Option<UserId>,
}

impl Handler<ListRecipients> for MeetingRegistry {
    type Result = MessageResult<ListRecipients>;

    fn handle(&mut self, msg: ListRecipients, _: &mut Self::Context) -> Self::Result {
        let out = self
            .meetings
            .get(&msg.meeting_id)
            .map(|m| {
                m.participants
                    .iter()
                    .filter(|p| Some(&p.user_id) != msg.exclude_user_id.as_ref())
                    .map(|p| (p.user_id.clone(), p.recipients.clone()))
                    .collect()
            })
            .unwrap_or_default();
        MessageResult(out)
    }
}

/// Returns the `user_id`s currently in a meeting, in join order, used by
/// `AckAggregator`/`RtcpCollector` to compute rosters without needing a
/// delivery recipient.
#[derive(Message)]
#[rtype(result = "Vec<UserId>")]
pub struct RosterOf {
    pub meeting_id: MeetingId,
}

impl Handler<RosterOf> for MeetingRegistry {
    type Result = MessageResult<RosterOf>;

    fn handle(&mut self, msg: RosterOf, _: &mut Self::Context) -> Self::Result {
        let out = self
            .meetings
            .get(&msg.meeting_id)
            .map(|m| m.participants.iter().map(|p| p.user_id.clone()).collect())
            .unwrap_or_default();
        MessageResult(out)
    }
}

/// Sets a meeting's current tier (§4.H "Application").
#[derive(Message)]
#[rtype(result = "()")]
pub struct SetTier {
    pub meeting_id: MeetingId,
    pub tier: Tier,
}

impl Handler<SetTier> for MeetingRegistry {
    type Result = ();

    fn handle(&mut self, msg: SetTier, _: &mut Self::Context) {
        if let Some(meeting) = self.meetings.get_mut(&msg.meeting_id) {
            meeting.tier = msg.tier;
        }
    }
}

/// Reads a meeting's current tier, defaulting to `HIGH` for a meeting
/// that (no longer) exists, matching `Meeting`'s initial tier.
#[derive(Message)]
#[rtype(result = "Tier")]
pub struct GetTier {
    pub meeting_id: MeetingId,
}

impl Handler<GetTier> for MeetingRegistry {
    type Result = MessageResult<GetTier>;

    fn handle(&mut self, msg: GetTier, _: &mut Self::Context) -> Self::Result {
        let tier = self
            .meetings
            .get(&msg.meeting_id)
            .map_or_else(Tier::default, |m| m.tier);
        MessageResult(tier)
    }
}

/// Lists every currently-live meeting, used by `QualityController` to
/// drive its per-meeting decision loop (§4.H) without a separate
/// meeting-lifecycle notification channel.
#[derive(Message)]
#[rtype(result = "Vec<MeetingId>")]
pub struct ActiveMeetings;

impl Handler<ActiveMeetings> for MeetingRegistry {
    type Result = MessageResult<ActiveMeetings>;

    fn handle(&mut self, _: ActiveMeetings, _: &mut Self::Context) -> Self::Result {
        MessageResult(self.meetings.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DropRecipientActor;
    impl Actor for DropRecipientActor {
        type Context = Context<Self>;
    }
    impl Handler<Deliver> for DropRecipientActor {
        type Result = ();
        fn handle(&mut self, _: Deliver, _: &mut Self::Context) {}
    }
    impl Handler<crate::messages::ApplyTier> for DropRecipientActor {
        type Result = ();
        fn handle(&mut self, _: crate::messages::ApplyTier, _: &mut Self::Context) {}
    }

    fn stub_recipients() -> SessionRecipients {
        let addr = DropRecipientActor.start();
        SessionRecipients {
            deliver: addr.clone().recipient(),
            apply_tier: addr.recipient(),
        }
    }

    #[actix_rt::test]
    async fn register_then_duplicate_join_fails() {
        let registry = MeetingRegistry::new().start();
        let meeting_id = MeetingId("m1".into());

        let ok = registry
            .send(Register {
                meeting_id: meeting_id.clone(),
                user_id: UserId("dup".into()),
                display_name: "A".into(),
                recipients: stub_recipients(),
            })
            .await
            .unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.unwrap().len(), 0);

        let dup = registry
            .send(Register {
                meeting_id,
                user_id: UserId("dup".into()),
                display_name: "B".into(),
                recipients: stub_recipients(),
            })
            .await
            .unwrap();
        assert_eq!(dup, Err(DuplicateUser));
    }

    #[actix_rt::test]
    async fn join_then_leave_empties_the_registry() {
        let registry = MeetingRegistry::new().start();
        let meeting_id = MeetingId("m2".into());

        registry
            .send(Register {
                meeting_id: meeting_id.clone(),
                user_id: UserId("solo".into()),
                display_name: "Solo".into(),
                recipients: stub_recipients(),
            })
            .await
            .unwrap()
            .unwrap();

        let destroyed = registry
            .send(Remove {
                meeting_id: meeting_id.clone(),
                user_id: UserId("solo".into()),
            })
            .await
            .unwrap();
        assert!(destroyed, "last participant leaving must destroy the meeting");

        let roster = registry.send(RosterOf { meeting_id }).await.unwrap();
        assert!(roster.is_empty());
    }

    #[actix_rt::test]
    async fn remove_reports_destroyed_only_when_last_participant_leaves() {
        let registry = MeetingRegistry::new().start();
        let meeting_id = MeetingId("m5".into());

        for name in ["a", "b"] {
            registry
                .send(Register {
                    meeting_id: meeting_id.clone(),
                    user_id: UserId(name.into()),
                    display_name: name.into(),
                    recipients: stub_recipients(),
                })
                .await
                .unwrap()
                .unwrap();
        }

        let destroyed = registry
            .send(Remove {
                meeting_id: meeting_id.clone(),
                user_id: UserId("a".into()),
            })
            .await
            .unwrap();
        assert!(!destroyed, "one remaining participant must not destroy the meeting");

        let destroyed = registry
            .send(Remove {
                meeting_id: meeting_id.clone(),
                user_id: UserId("b".into()),
            })
            .await
            .unwrap();
        assert!(destroyed, "last remaining participant must destroy the meeting");
    }

    #[actix_rt::test]
    async fn list_recipients_is_join_ordered_and_excludes() {
        let registry = MeetingRegistry::new().start();
        let meeting_id = MeetingId("m3".into());

        for name in ["a", "b", "c"] {
            registry
                .send(Register {
                    meeting_id: meeting_id.clone(),
                    user_id: UserId(name.into()),
                    display_name: name.into(),
                    recipients: stub_recipients(),
                })
                .await
                .unwrap()
                .unwrap();
        }

        let all: Vec<_> = registry
            .send(RosterOf {
                meeting_id: meeting_id.clone(),
            })
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.0)
            .collect();
        assert_eq!(all, vec!["a", "b", "c"]);

        let without_a: Vec<_> = registry
            .send(ListRecipients {
                meeting_id,
                exclude_user_id: Some(UserId("a".into())),
            })
            .await
            .unwrap()
            .into_iter()
            .map(|(u, _)| u.0)
            .collect();
        assert_eq!(without_a, vec!["b", "c"]);
    }

    #[actix_rt::test]
    async fn tier_defaults_high_and_is_settable() {
        let registry = MeetingRegistry::new().start();
        let meeting_id = MeetingId("m4".into());
        registry
            .send(Register {
                meeting_id: meeting_id.clone(),
                user_id: UserId("u".into()),
                display_name: "U".into(),
                recipients: stub_recipients(),
            })
            .await
            .unwrap()
            .unwrap();

        let tier = registry
            .send(GetTier {
                meeting_id: meeting_id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(tier, Tier::High);

        registry
            .send(SetTier {
                meeting_id: meeting_id.clone(),
                tier: Tier::Low,
            })
            .await
            .unwrap();
        let tier = registry.send(GetTier { meeting_id }).await.unwrap();
        assert_eq!(tier, Tier::Low);
    }

    #[actix_rt::test]
    async fn active_meetings_reflects_live_set() {
        let registry = MeetingRegistry::new().start();
        registry
            .send(Register {
                meeting_id: MeetingId("only".into()),
                user_id: UserId("u".into()),
                display_name: "U".into(),
                recipients: stub_recipients(),
            })
            .await
            .unwrap()
            .unwrap();

        let active = registry.send(ActiveMeetings).await.unwrap();
        assert_eq!(active, vec![MeetingId("only".into())]);
    }
}
