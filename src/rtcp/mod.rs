//! §4.G `RtcpCollector` — a short sliding window of per-receiver RTCP
//! statistics, used by `QualityController` to pick a meeting-wide tier.

use std::collections::{HashMap, VecDeque};

use actix::prelude::*;
use confcore_proto::{MeetingId, UserId};

/// Ring-buffer capacity per `(meeting, receiver)` (§3 "RtcpSample").
const RING_SIZE: usize = 5;

/// One RTCP report from a receiver (§3 "RtcpSample").
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RtcpSample {
    pub packets_lost_pct: f64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
}

/// Averaged statistics for one receiver, across its ring buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ReceiverStats {
    pub loss_pct_avg: f64,
    pub jitter_ms_avg: f64,
    pub rtt_ms_avg: f64,
}

/// Independent per-metric maxima across all reporting receivers in a
/// meeting (§4.G "a conservative worst-case").
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct WorstStats {
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
}

#[derive(Default)]
struct Ring(VecDeque<RtcpSample>);

impl Ring {
    fn push(&mut self, sample: RtcpSample) {
        self.0.push_back(sample);
        while self.0.len() > RING_SIZE {
            self.0.pop_front();
        }
    }

    fn stats(&self) -> ReceiverStats {
        let n = self.0.len() as f64;
        if n == 0.0 {
            return ReceiverStats::default();
        }
        let (mut loss, mut jitter, mut rtt) = (0.0, 0.0, 0.0);
        for s in &self.0 {
            loss += s.packets_lost_pct;
            jitter += s.jitter_ms;
            rtt += s.rtt_ms;
        }
        ReceiverStats {
            loss_pct_avg: loss / n,
            jitter_ms_avg: jitter / n,
            rtt_ms_avg: rtt / n,
        }
    }
}

/// The collector actor: one ring buffer per `(meeting, receiver)`.
#[derive(Default)]
pub struct RtcpCollector {
    rings: HashMap<(MeetingId, UserId), Ring>,
}

impl RtcpCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every ring for a meeting; used when a meeting is torn down
    /// so a departed receiver's stale samples never contribute again.
    pub fn forget_meeting(&mut self, meeting_id: &MeetingId) {
        self.rings.retain(|(m, _), _| m != meeting_id);
    }
}

impl Actor for RtcpCollector {
    type Context = Context<Self>;
}

/// `add_report` (§4.G).
#[derive(Message)]
#[rtype(result = "()")]
pub struct AddReport {
    pub meeting_id: MeetingId,
    pub receiver_user_id: UserId,
    pub sample: RtcpSample,
}

impl Handler<AddReport> for RtcpCollector {
    type Result = ();

    fn handle(&mut self, msg: AddReport, _: &mut Self::Context) {
        self.rings
            .entry((msg.meeting_id, msg.receiver_user_id))
            .or_default()
            .push(msg.sample);
    }
}

/// `snapshot` (§4.G).
#[derive(Message)]
#[rtype(result = "HashMap<UserId, ReceiverStats>")]
pub struct Snapshot {
    pub meeting_id: MeetingId,
}

impl Handler<Snapshot> for RtcpCollector {
    type Result = MessageResult<Snapshot>;

    fn handle(&mut self, msg: Snapshot, _: &mut Self::Context) -> Self::Result {
        let out = self
            .rings
            .iter()
            .filter(|((m, _), _)| m == &msg.meeting_id)
            .map(|((_, u), ring)| (u.clone(), ring.stats()))
            .collect();
        MessageResult(out)
    }
}

/// Drops every ring for a meeting (§3 "Meeting" lifecycle, grace = 0):
/// sent by the coordinator once `MeetingRegistry::Remove` reports the
/// meeting was destroyed, so a departed receiver's stale samples never
/// contribute to a future meeting reusing the same id.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ForgetMeeting {
    pub meeting_id: MeetingId,
}

impl Handler<ForgetMeeting> for RtcpCollector {
    type Result = ();

    fn handle(&mut self, msg: ForgetMeeting, _: &mut Self::Context) {
        self.forget_meeting(&msg.meeting_id);
    }
}

/// `worst` (§4.G). A meeting with no reporting receivers yet is `0,0,0`
/// (§4.G "a silent receiver does not degrade quality").
#[derive(Message)]
#[rtype(result = "WorstStats")]
pub struct Worst {
    pub meeting_id: MeetingId,
}

impl Handler<Worst> for RtcpCollector {
    type Result = MessageResult<Worst>;

    fn handle(&mut self, msg: Worst, _: &mut Self::Context) -> Self::Result {
        let mut worst = WorstStats::default();
        for ((m, _), ring) in &self.rings {
            if m != &msg.meeting_id {
                continue;
            }
            let s = ring.stats();
            worst.loss_pct = worst.loss_pct.max(s.loss_pct_avg);
            worst.jitter_ms = worst.jitter_ms.max(s.jitter_ms_avg);
            worst.rtt_ms = worst.rtt_ms.max(s.rtt_ms_avg);
        }
        MessageResult(worst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn forget_meeting_drops_its_rings_but_not_others() {
        let collector = RtcpCollector::new().start();
        let gone = MeetingId("gone".into());
        let stays = MeetingId("stays".into());
        let sample = RtcpSample {
            packets_lost_pct: 0.08,
            jitter_ms: 40.0,
            rtt_ms: 300.0,
        };
        for meeting_id in [&gone, &stays] {
            collector
                .send(AddReport {
                    meeting_id: meeting_id.clone(),
                    receiver_user_id: UserId("r".into()),
                    sample,
                })
                .await
                .unwrap();
        }

        collector
            .send(ForgetMeeting {
                meeting_id: gone.clone(),
            })
            .await
            .unwrap();

        assert_eq!(collector.send(Worst { meeting_id: gone }).await.unwrap(), WorstStats::default());
        assert_ne!(
            collector.send(Worst { meeting_id: stays }).await.unwrap(),
            WorstStats::default()
        );
    }

    #[actix_rt::test]
    async fn worst_is_zero_with_no_reports() {
        let collector = RtcpCollector::new().start();
        let worst = collector
            .send(Worst {
                meeting_id: MeetingId("m".into()),
            })
            .await
            .unwrap();
        assert_eq!(worst, WorstStats::default());
    }

    #[actix_rt::test]
    async fn ring_buffer_caps_at_five_and_averages() {
        let collector = RtcpCollector::new().start();
        let meeting_id = MeetingId("m".into());
        let receiver = UserId("r".into());
        for i in 0..8 {
            collector
                .send(AddReport {
                    meeting_id: meeting_id.clone(),
                    receiver_user_id: receiver.clone(),
                    sample: RtcpSample {
                        packets_lost_pct: f64::from(i) / 100.0,
                        jitter_ms: f64::from(i),
                        rtt_ms: f64::from(i) * 10.0,
                    },
                })
                .await
                .unwrap();
        }
        let snap = collector
            .send(Snapshot {
                meeting_id: meeting_id.clone(),
            })
            .await
            .unwrap();
        let stats = snap.get(&receiver).unwrap();
        // Only the last 5 samples (values 3..=7) survive the ring.
        assert!((stats.jitter_ms_avg - 5.0).abs() < 1e-9);
    }

    #[actix_rt::test]
    async fn worst_takes_independent_per_metric_maxima() {
        let collector = RtcpCollector::new().start();
        let meeting_id = MeetingId("m".into());
        collector
            .send(AddReport {
                meeting_id: meeting_id.clone(),
                receiver_user_id: UserId("a".into()),
                sample: RtcpSample {
                    packets_lost_pct: 0.08,
                    jitter_ms: 5.0,
                    rtt_ms: 20.0,
                },
            })
            .await
            .unwrap();
        collector
            .send(AddReport {
                meeting_id: meeting_id.clone(),
                receiver_user_id: UserId("b".into()),
                sample: RtcpSample {
                    packets_lost_pct: 0.0,
                    jitter_ms: 40.0,
                    rtt_ms: 300.0,
                },
            })
            .await
            .unwrap();
        let worst = collector.send(Worst { meeting_id }).await.unwrap();
        assert!((worst.loss_pct - 0.08).abs() < 1e-9);
        assert!((worst.jitter_ms - 40.0).abs() < 1e-9);
        assert!((worst.rtt_ms - 300.0).abs() < 1e-9);
    }
}
