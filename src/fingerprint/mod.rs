//! §4.E `FingerprintVerifier` — cross-checks sender and receiver CRC-32
//! fingerprints per frame to infer successful delivery to each receiver.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use actix::prelude::*;
use confcore_proto::{FrameId, MeetingId, UserId};
use slog::{debug, warn};

use crate::ack::FingerprintOutcome;

type RecordKey = (MeetingId, UserId, FrameId);

/// §3 "FrameFingerprint": sender CRC is write-once; receiver CRCs arrive
/// independently and are decided against the sender CRC as soon as both
/// are known, in whichever order they show up.
struct Record {
    sender_crc32: Option<u32>,
    pending_receivers: HashMap<UserId, u32>,
    seen_receivers: HashSet<UserId>,
    first_seen_at: Instant,
}

impl Record {
    fn new() -> Self {
        Self {
            sender_crc32: None,
            pending_receivers: HashMap::new(),
            seen_receivers: HashSet::new(),
            first_seen_at: Instant::now(),
        }
    }
}

pub struct FingerprintVerifier {
    records: HashMap<RecordKey, Record>,
    ack_aggregator: Recipient<FingerprintOutcome>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl FingerprintVerifier {
    #[must_use]
    pub fn new(
        ack_aggregator: Recipient<FingerprintOutcome>,
        ttl: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            records: HashMap::new(),
            ack_aggregator,
            ttl,
            sweep_interval,
        }
    }

    fn decide(
        &self,
        meeting_id: &MeetingId,
        sender_user_id: &UserId,
        receiver_user_id: UserId,
        sender_crc32: u32,
        receiver_crc32: u32,
    ) {
        let matched = sender_crc32 == receiver_crc32;
        let _ = self.ack_aggregator.do_send(FingerprintOutcome {
            meeting_id: meeting_id.clone(),
            sender_user_id: sender_user_id.clone(),
            receiver_user_id,
            matched,
        });
    }
}

impl Actor for FingerprintVerifier {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(self.sweep_interval, |act, _ctx| act.sweep());
    }
}

impl FingerprintVerifier {
    /// Removes every record whose `first_seen_at` is older than the TTL
    /// (§3 "FrameFingerprint" lifecycle, §8 boundary behavior).
    fn sweep(&mut self) {
        let ttl = self.ttl;
        self.records.retain(|_, r| r.first_seen_at.elapsed() < ttl);
    }
}

/// `add_sender` (§4.E).
#[derive(Message)]
#[rtype(result = "()")]
pub struct AddSenderFingerprint {
    pub meeting_id: MeetingId,
    pub sender_user_id: UserId,
    pub frame_id: FrameId,
    pub crc32: u32,
}

impl Handler<AddSenderFingerprint> for FingerprintVerifier {
    type Result = ();

    fn handle(&mut self, msg: AddSenderFingerprint, _: &mut Self::Context) {
        let key = (msg.meeting_id.clone(), msg.sender_user_id.clone(), msg.frame_id);
        let record = self.records.entry(key).or_insert_with(Record::new);

        if record.sender_crc32.is_some() {
            warn!(
                crate::log::logger(),
                "duplicate sender fingerprint dropped";
                "meeting_id" => msg.meeting_id.to_string(),
                "sender_user_id" => msg.sender_user_id.to_string(),
                "frame_id" => msg.frame_id.0,
            );
            return;
        }

        record.sender_crc32 = Some(msg.crc32);
        let pending = std::mem::take(&mut record.pending_receivers);
        for (receiver_user_id, receiver_crc32) in pending {
            self.decide(
                &msg.meeting_id,
                &msg.sender_user_id,
                receiver_user_id,
                msg.crc32,
                receiver_crc32,
            );
        }
    }
}

/// `add_receiver` (§4.E).
#[derive(Message)]
#[rtype(result = "()")]
pub struct AddReceiverFingerprint {
    pub meeting_id: MeetingId,
    pub sender_user_id: UserId,
    pub frame_id: FrameId,
    pub receiver_user_id: UserId,
    pub crc32: u32,
}

impl Handler<AddReceiverFingerprint> for FingerprintVerifier {
    type Result = ();

    fn handle(&mut self, msg: AddReceiverFingerprint, _: &mut Self::Context) {
        let key = (msg.meeting_id.clone(), msg.sender_user_id.clone(), msg.frame_id);
        let record = self.records.entry(key).or_insert_with(Record::new);

        if !record.seen_receivers.insert(msg.receiver_user_id.clone()) {
            debug!(
                crate::log::logger(),
                "duplicate receiver fingerprint dropped";
                "meeting_id" => msg.meeting_id.to_string(),
                "receiver_user_id" => msg.receiver_user_id.to_string(),
                "frame_id" => msg.frame_id.0,
            );
            return;
        }

        match record.sender_crc32 {
            Some(sender_crc32) => self.decide(
                &msg.meeting_id,
                &msg.sender_user_id,
                msg.receiver_user_id,
                sender_crc32,
                msg.crc32,
            ),
            None => {
                record
                    .pending_receivers
                    .insert(msg.receiver_user_id, msg.crc32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CaptureOutcomes(std::sync::Arc<std::sync::Mutex<Vec<FingerprintOutcome>>>);
    impl Actor for CaptureOutcomes {
        type Context = Context<Self>;
    }
    impl Handler<FingerprintOutcome> for CaptureOutcomes {
        type Result = ();
        fn handle(&mut self, msg: FingerprintOutcome, _: &mut Self::Context) {
            self.0.lock().unwrap().push(msg);
        }
    }

    #[actix_rt::test]
    async fn sender_then_receiver_decides_match() {
        let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let capture = CaptureOutcomes(captured.clone()).start().recipient();
        let verifier = FingerprintVerifier::new(
            capture,
            Duration::from_secs(15),
            Duration::from_secs(5),
        )
        .start();

        let meeting_id = MeetingId("m".into());
        let sender = UserId("s".into());
        let receiver = UserId("r".into());
        let frame_id = FrameId(1);

        verifier
            .send(AddSenderFingerprint {
                meeting_id: meeting_id.clone(),
                sender_user_id: sender.clone(),
                frame_id,
                crc32: 42,
            })
            .await
            .unwrap();
        verifier
            .send(AddReceiverFingerprint {
                meeting_id,
                sender_user_id: sender,
                frame_id,
                receiver_user_id: receiver,
                crc32: 42,
            })
            .await
            .unwrap();

        actix_rt::time::sleep(Duration::from_millis(20)).await;
        let outcomes = captured.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].matched);
    }

    #[actix_rt::test]
    async fn receiver_then_sender_decides_mismatch() {
        let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let capture = CaptureOutcomes(captured.clone()).start().recipient();
        let verifier = FingerprintVerifier::new(
            capture,
            Duration::from_secs(15),
            Duration::from_secs(5),
        )
        .start();

        let meeting_id = MeetingId("m".into());
        let sender = UserId("s".into());
        let receiver = UserId("r".into());
        let frame_id = FrameId(7);

        verifier
            .send(AddReceiverFingerprint {
                meeting_id: meeting_id.clone(),
                sender_user_id: sender.clone(),
                frame_id,
                receiver_user_id: receiver,
                crc32: 99,
            })
            .await
            .unwrap();
        verifier
            .send(AddSenderFingerprint {
                meeting_id,
                sender_user_id: sender,
                frame_id,
                crc32: 1,
            })
            .await
            .unwrap();

        actix_rt::time::sleep(Duration::from_millis(20)).await;
        let outcomes = captured.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].matched);
    }

    #[actix_rt::test]
    async fn duplicate_sender_crc_is_dropped() {
        let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let capture = CaptureOutcomes(captured.clone()).start().recipient();
        let verifier = FingerprintVerifier::new(
            capture,
            Duration::from_secs(15),
            Duration::from_secs(5),
        )
        .start();

        let meeting_id = MeetingId("m".into());
        let sender = UserId("s".into());
        let frame_id = FrameId(3);

        verifier
            .send(AddSenderFingerprint {
                meeting_id: meeting_id.clone(),
                sender_user_id: sender.clone(),
                frame_id,
                crc32: 5,
            })
            .await
            .unwrap();
        // Duplicate: first report wins and this one is dropped.
        verifier
            .send(AddSenderFingerprint {
                meeting_id: meeting_id.clone(),
                sender_user_id: sender.clone(),
                frame_id,
                crc32: 999,
            })
            .await
            .unwrap();
        verifier
            .send(AddReceiverFingerprint {
                meeting_id,
                sender_user_id: sender,
                frame_id,
                receiver_user_id: UserId("r".into()),
                crc32: 5,
            })
            .await
            .unwrap();

        actix_rt::time::sleep(Duration::from_millis(20)).await;
        let outcomes = captured.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].matched, "first sender CRC (5) should win, not the duplicate (999)");
    }
}
