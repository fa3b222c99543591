//! Visit lifecycle state machine.
//!
//! Converts per-tick detection snapshots into visit lifecycle events. Four
//! states, one timer per owning state:
//!
//! - `Idle` -> `Present` on a qualifying detection (new session, first photo)
//! - `Present` -> `AbsentGrace` when detections disappear (grace timer starts)
//! - `AbsentGrace` -> `Present` if the subject returns, else -> `Complete`
//!   once the grace period elapses
//! - `Complete` -> `Idle` after the cooldown; detections during cooldown do
//!   not start a new visit (they may reopen the held session when the merge
//!   window is enabled)
//!
//! The machine is deterministic: every tick carries its own wall-clock epoch
//! milliseconds and the machine performs no clock reads, sleeping, or I/O.
//! Ticks are driven by the poll loop; within a visit they are processed
//! strictly in order.

use crate::capture::CaptureRef;
use crate::config::VisitSettings;
use crate::detect::Detection;

/// Machine state. `Complete` is terminal for the session, not the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisitState {
    Idle,
    Present,
    AbsentGrace,
    Complete,
}

impl VisitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitState::Idle => "idle",
            VisitState::Present => "present",
            VisitState::AbsentGrace => "absent_grace",
            VisitState::Complete => "complete",
        }
    }
}

/// One continuous presence of a subject, from first qualifying detection to
/// confirmed departure.
#[derive(Clone, Debug)]
pub struct VisitSession {
    /// Unique id: 128 random bits, hex. Generated at visit start; this is the
    /// primary dedup key for store commits.
    pub id: String,
    pub start_ms: u64,
    pub last_seen_ms: u64,
    pub end_ms: Option<u64>,
    /// Ordered captures taken during the visit, bounded by the capture policy.
    pub captures: Vec<CaptureRef>,
    /// Index into `captures` of the most representative photo
    /// (largest confidence x bbox area).
    pub best_capture: Option<usize>,
    /// Max simultaneous detections observed on any single tick, not a sum.
    pub bird_count: u32,
}

impl VisitSession {
    fn new(now_ms: u64, bird_count: u32) -> Self {
        Self {
            id: format!("{:032x}", rand::random::<u128>()),
            start_ms: now_ms,
            last_seen_ms: now_ms,
            end_ms: None,
            captures: Vec::new(),
            best_capture: None,
            bird_count,
        }
    }

    pub fn duration_secs(&self) -> Option<u64> {
        self.end_ms
            .map(|end| end.saturating_sub(self.start_ms) / 1000)
    }

    pub fn best_capture(&self) -> Option<&CaptureRef> {
        self.best_capture.and_then(|i| self.captures.get(i))
    }
}

/// Events emitted by a tick, in occurrence order.
#[derive(Debug)]
pub enum TickEvent {
    VisitStarted { id: String },
    /// The subject was seen while a visit is active; the capture policy
    /// decides whether a photo is actually taken.
    CaptureRequested,
    /// A held session was reopened within the merge window.
    VisitReopened { id: String },
    /// The session is finished and ready for analysis. The machine no longer
    /// references it.
    VisitCompleted(VisitSession),
}

pub struct VisitStateMachine {
    settings: VisitSettings,
    state: VisitState,
    current: Option<VisitSession>,
    /// Finished session held through cooldown when the merge window is
    /// enabled; dispatched on the Complete -> Idle transition.
    held: Option<VisitSession>,
    grace_started_ms: Option<u64>,
    cooldown_started_ms: Option<u64>,
}

impl VisitStateMachine {
    pub fn new(settings: VisitSettings) -> Self {
        Self {
            settings,
            state: VisitState::Idle,
            current: None,
            held: None,
            grace_started_ms: None,
            cooldown_started_ms: None,
        }
    }

    pub fn state(&self) -> VisitState {
        self.state
    }

    pub fn current_session(&self) -> Option<&VisitSession> {
        self.current.as_ref()
    }

    pub fn current_session_mut(&mut self) -> Option<&mut VisitSession> {
        self.current.as_mut()
    }

    /// Advance the machine by one detection tick.
    ///
    /// `detections` must already be qualified (ROI, class, confidence, area);
    /// the machine only looks at how many there are.
    pub fn on_tick(&mut self, now_ms: u64, detections: &[Detection]) -> Vec<TickEvent> {
        let present = !detections.is_empty();
        let count = detections.len() as u32;
        let mut events = Vec::new();

        match self.state {
            VisitState::Idle => {
                if present {
                    self.start_visit(now_ms, count, &mut events);
                }
            }
            VisitState::Present => {
                if present {
                    self.note_presence(now_ms, count);
                    events.push(TickEvent::CaptureRequested);
                } else {
                    self.state = VisitState::AbsentGrace;
                    self.grace_started_ms = Some(now_ms);
                    log::debug!("subject absent, grace period started");
                }
            }
            VisitState::AbsentGrace => {
                if present {
                    self.state = VisitState::Present;
                    self.grace_started_ms = None;
                    self.note_presence(now_ms, count);
                    events.push(TickEvent::CaptureRequested);
                    log::debug!("subject returned during grace period");
                } else if self
                    .grace_started_ms
                    .is_some_and(|start| now_ms.saturating_sub(start) >= self.grace_ms())
                {
                    self.complete_visit(now_ms, &mut events);
                }
            }
            VisitState::Complete => {
                if present && self.can_reopen(now_ms) {
                    let mut session = self.held.take().unwrap_or_else(|| {
                        // can_reopen checked held.is_some()
                        unreachable!("reopen without a held session")
                    });
                    session.end_ms = None;
                    self.cooldown_started_ms = None;
                    log::info!("visit reopened within merge window: {}", session.id);
                    events.push(TickEvent::VisitReopened {
                        id: session.id.clone(),
                    });
                    self.current = Some(session);
                    self.state = VisitState::Present;
                    self.note_presence(now_ms, count);
                    events.push(TickEvent::CaptureRequested);
                } else if self
                    .cooldown_started_ms
                    .is_some_and(|start| now_ms.saturating_sub(start) >= self.cooldown_ms())
                {
                    self.state = VisitState::Idle;
                    self.cooldown_started_ms = None;
                    if let Some(held) = self.held.take() {
                        log::info!("visit dispatched after cooldown: {}", held.id);
                        events.push(TickEvent::VisitCompleted(held));
                    }
                    if present {
                        self.start_visit(now_ms, count, &mut events);
                    }
                }
            }
        }
        events
    }

    fn start_visit(&mut self, now_ms: u64, count: u32, events: &mut Vec<TickEvent>) {
        let session = VisitSession::new(now_ms, count);
        log::info!("visit started: {}", session.id);
        events.push(TickEvent::VisitStarted {
            id: session.id.clone(),
        });
        events.push(TickEvent::CaptureRequested);
        self.current = Some(session);
        self.state = VisitState::Present;
    }

    fn note_presence(&mut self, now_ms: u64, count: u32) {
        if let Some(session) = self.current.as_mut() {
            session.last_seen_ms = now_ms;
            session.bird_count = session.bird_count.max(count);
        }
    }

    fn complete_visit(&mut self, now_ms: u64, events: &mut Vec<TickEvent>) {
        let Some(mut session) = self.current.take() else {
            return;
        };
        // The visit ends when the subject was last seen plus the grace
        // tolerance, independent of when the expiry tick happens to land.
        session.end_ms = Some(session.last_seen_ms + self.grace_ms());
        self.state = VisitState::Complete;
        self.grace_started_ms = None;
        self.cooldown_started_ms = Some(now_ms);

        log::info!(
            "visit completed: {}, duration: {}s, captures: {}",
            session.id,
            session.duration_secs().unwrap_or(0),
            session.captures.len()
        );

        if self.settings.merge_window.is_zero() {
            events.push(TickEvent::VisitCompleted(session));
        } else {
            self.held = Some(session);
        }
    }

    fn can_reopen(&self, now_ms: u64) -> bool {
        let Some(held) = self.held.as_ref() else {
            return false;
        };
        let Some(end_ms) = held.end_ms else {
            return false;
        };
        now_ms.saturating_sub(end_ms) <= self.settings.merge_window.as_millis() as u64
    }

    fn grace_ms(&self) -> u64 {
        self.settings.grace.as_millis() as u64
    }

    fn cooldown_ms(&self) -> u64 {
        self.settings.cooldown.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(merge_window_secs: u64) -> VisitSettings {
        VisitSettings {
            grace: Duration::from_secs(5),
            cooldown: Duration::from_secs(15),
            capture_interval: Duration::from_secs(3),
            max_captures_per_visit: 5,
            merge_window: Duration::from_secs(merge_window_secs),
            jpeg_quality: 85,
        }
    }

    fn detection() -> Detection {
        Detection {
            bbox: [10, 10, 50, 50],
            confidence: 0.8,
            class_name: "bird".to_string(),
            area_ratio: 0.05,
        }
    }

    fn tick(machine: &mut VisitStateMachine, t_secs: u64, present: usize) -> Vec<TickEvent> {
        let detections: Vec<Detection> = (0..present).map(|_| detection()).collect();
        machine.on_tick(t_secs * 1000, &detections)
    }

    fn completed(events: &[TickEvent]) -> Option<&VisitSession> {
        events.iter().find_map(|e| match e {
            TickEvent::VisitCompleted(session) => Some(session),
            _ => None,
        })
    }

    #[test]
    fn idle_detection_starts_a_visit() {
        let mut m = VisitStateMachine::new(settings(0));
        let events = tick(&mut m, 0, 1);

        assert!(matches!(events[0], TickEvent::VisitStarted { .. }));
        assert!(matches!(events[1], TickEvent::CaptureRequested));
        assert_eq!(m.state(), VisitState::Present);
    }

    #[test]
    fn grace_recovery_yields_one_session() {
        let mut m = VisitStateMachine::new(settings(0));
        tick(&mut m, 0, 1);
        tick(&mut m, 1, 0); // grace starts
        assert_eq!(m.state(), VisitState::AbsentGrace);
        tick(&mut m, 3, 1); // back within grace
        assert_eq!(m.state(), VisitState::Present);

        // Now leave for good: absent from t=4 until past the grace period.
        tick(&mut m, 4, 0);
        let events = tick(&mut m, 9, 0);
        let session = completed(&events).expect("visit completed");
        assert_eq!(session.start_ms, 0);
        assert_eq!(session.last_seen_ms, 3000);
    }

    #[test]
    fn grace_expiry_completes_the_visit_with_end_time() {
        let mut m = VisitStateMachine::new(settings(0));
        tick(&mut m, 0, 1);
        tick(&mut m, 2, 0);
        assert!(tick(&mut m, 6, 0).is_empty()); // 4s < 5s grace

        let events = tick(&mut m, 7, 0); // 5s elapsed
        let session = completed(&events).expect("visit completed");
        // End time is last seen (t=0) plus grace, not the expiry tick.
        assert_eq!(session.end_ms, Some(5000));
        assert_eq!(m.state(), VisitState::Complete);
    }

    #[test]
    fn cooldown_blocks_new_visits_until_it_expires() {
        let mut m = VisitStateMachine::new(settings(0));
        tick(&mut m, 0, 1);
        tick(&mut m, 1, 0);
        tick(&mut m, 6, 0); // complete at t=6, cooldown until t=21

        assert!(tick(&mut m, 10, 1).is_empty());
        assert!(tick(&mut m, 20, 1).is_empty());
        assert_eq!(m.state(), VisitState::Complete);

        let events = tick(&mut m, 21, 1);
        assert!(matches!(events[0], TickEvent::VisitStarted { .. }));
    }

    #[test]
    fn bird_count_is_max_simultaneous_not_sum() {
        let mut m = VisitStateMachine::new(settings(0));
        tick(&mut m, 0, 1);
        tick(&mut m, 1, 3);
        tick(&mut m, 2, 2);
        assert_eq!(m.current_session().unwrap().bird_count, 3);
    }

    #[test]
    fn tick_sequences_are_deterministic() {
        let script: &[(u64, usize)] = &[
            (0, 1),
            (1, 0),
            (2, 1),
            (3, 0),
            (9, 0),
            (10, 1),
            (25, 1),
            (26, 0),
            (32, 0),
        ];

        let run = |mut m: VisitStateMachine| -> Vec<VisitState> {
            let mut states = Vec::new();
            for &(t, n) in script {
                tick(&mut m, t, n);
                states.push(m.state());
            }
            states
        };

        let a = run(VisitStateMachine::new(settings(0)));
        let b = run(VisitStateMachine::new(settings(0)));
        assert_eq!(a, b);
    }

    #[test]
    fn merge_window_reopens_the_held_session() {
        let mut m = VisitStateMachine::new(settings(60));
        tick(&mut m, 0, 1);
        tick(&mut m, 1, 0);
        let events = tick(&mut m, 6, 0); // complete; session held, not dispatched
        assert!(completed(&events).is_none());

        let events = tick(&mut m, 10, 1); // within merge window and cooldown
        assert!(matches!(events[0], TickEvent::VisitReopened { .. }));
        assert_eq!(m.state(), VisitState::Present);
        assert_eq!(m.current_session().unwrap().start_ms, 0);
    }

    #[test]
    fn held_session_is_dispatched_once_cooldown_expires() {
        let mut m = VisitStateMachine::new(settings(60));
        tick(&mut m, 0, 1);
        tick(&mut m, 1, 0);
        tick(&mut m, 6, 0); // complete at t=6

        let events = tick(&mut m, 21, 0); // cooldown elapsed
        let session = completed(&events).expect("held session dispatched");
        assert_eq!(session.end_ms, Some(5000));
        assert_eq!(m.state(), VisitState::Idle);
    }

    #[test]
    fn spec_scenario_single_visit_with_grace_end() {
        // Detections present at t in {0,1,2,8,9,10}, absent elsewhere,
        // grace=5s, cooldown=15s. Expect exactly one session: the t=3..7 gap
        // is within grace, the visit ends at t=15 (last seen 10 + grace 5).
        let mut m = VisitStateMachine::new(settings(0));
        let mut sessions = Vec::new();
        for t in 0..=20u64 {
            let present = matches!(t, 0..=2 | 8..=10);
            let events = tick(&mut m, t, usize::from(present));
            for e in events {
                if let TickEvent::VisitCompleted(s) = e {
                    sessions.push(s);
                }
            }
        }

        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.start_ms, 0);
        assert_eq!(session.last_seen_ms, 10_000);
        assert_eq!(session.end_ms, Some(15_000));
    }
}
