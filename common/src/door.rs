use std::sync::atomic::{AtomicU32, Ordering};

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::error::{RelayError, SensorError};
use crate::types::DoorState;

pub const RELAY_ASSERT_MS: u64 = 2_000;
pub const RELAY_RELEASE_MS: u64 = 1_000;
pub const SONAR_ATTEMPTS: u32 = 2;
pub const SONAR_RETRY_DELAY_MS: u32 = 500;
pub const MAX_PENDING_ACTUATIONS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorAction {
    Assert,
    Release,
    Delay(u64),
}

pub fn actuation_sequence() -> Vec<DoorAction> {
    vec![
        DoorAction::Assert,
        DoorAction::Delay(RELAY_ASSERT_MS),
        DoorAction::Release,
        DoorAction::Delay(RELAY_RELEASE_MS),
    ]
}

pub trait DoorRelay {
    fn set_asserted(&mut self, asserted: bool) -> Result<(), RelayError>;
}

// Runs a full actuation on a blocking runtime. The relay is released even
// if asserting it failed part way.
pub fn run_actuation<R, D>(relay: &mut R, delay: &mut D) -> Result<(), RelayError>
where
    R: DoorRelay,
    D: DelayNs,
{
    info!("door actuation started");
    let mut outcome = Ok(());
    for action in actuation_sequence() {
        let step = match action {
            DoorAction::Assert => relay.set_asserted(true),
            DoorAction::Release => relay.set_asserted(false),
            DoorAction::Delay(ms) => {
                delay.delay_ms(u32::try_from(ms).unwrap_or(u32::MAX));
                Ok(())
            }
        };
        if let Err(err) = step {
            warn!("{err}");
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }
    outcome
}

#[derive(Debug, Default)]
pub struct ActuationQueue {
    pending: AtomicU32,
}

impl ActuationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns false when the queue is full and the press was dropped.
    pub fn request(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_PENDING_ACTUATIONS).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn take(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

pub trait SonarProbe {
    fn distance_cm(&mut self) -> Result<f32, SensorError>;
}

pub fn classify_distance(distance_cm: f32, trigger_distance_cm: f32) -> DoorState {
    // The open door panel sits close above the sensor.
    if distance_cm < trigger_distance_cm {
        DoorState::Open
    } else {
        DoorState::Closed
    }
}

pub fn check_door_state<S, D>(sonar: Option<&mut S>, trigger_distance_cm: f32, delay: &mut D) -> DoorState
where
    S: SonarProbe,
    D: DelayNs,
{
    let Some(sonar) = sonar else {
        return DoorState::Unknown;
    };

    for attempt in 1..=SONAR_ATTEMPTS {
        match sonar.distance_cm() {
            Ok(distance) if distance.is_finite() => {
                let state = classify_distance(distance, trigger_distance_cm);
                info!("sonar {distance:.1}cm -> {}", state.as_str());
                return state;
            }
            Ok(distance) => warn!("sonar returned {distance} (attempt {attempt})"),
            Err(err) => warn!("{err} (attempt {attempt})"),
        }
        delay.delay_ms(SONAR_RETRY_DELAY_MS);
    }
    DoorState::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDelay;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct RecordingRelay {
        writes: Vec<bool>,
        fail_assert: bool,
    }

    impl DoorRelay for RecordingRelay {
        fn set_asserted(&mut self, asserted: bool) -> Result<(), RelayError> {
            self.writes.push(asserted);
            if asserted && self.fail_assert {
                return Err(RelayError::Write("gpio".into()));
            }
            Ok(())
        }
    }

    struct ScriptedSonar(VecDeque<Result<f32, SensorError>>);

    impl SonarProbe for ScriptedSonar {
        fn distance_cm(&mut self) -> Result<f32, SensorError> {
            self.0.pop_front().unwrap_or_else(|| {
                Err(SensorError::Read {
                    model: "HC-SR04".into(),
                    reason: "no echo".into(),
                })
            })
        }
    }

    fn echo_timeout() -> SensorError {
        SensorError::Read {
            model: "HC-SR04".into(),
            reason: "echo timeout".into(),
        }
    }

    #[test]
    fn actuation_holds_relay_for_two_seconds() {
        assert_eq!(
            actuation_sequence(),
            vec![
                DoorAction::Assert,
                DoorAction::Delay(2_000),
                DoorAction::Release,
                DoorAction::Delay(1_000),
            ]
        );

        let mut relay = RecordingRelay::default();
        let mut delay = RecordingDelay::default();
        run_actuation(&mut relay, &mut delay).unwrap();

        assert_eq!(relay.writes, vec![true, false]);
        assert_eq!(delay.delays_ms, vec![2_000, 1_000]);
    }

    #[test]
    fn failed_assert_still_releases() {
        let mut relay = RecordingRelay {
            fail_assert: true,
            ..RecordingRelay::default()
        };
        let result = run_actuation(&mut relay, &mut RecordingDelay::default());

        assert!(result.is_err());
        assert_eq!(relay.writes, vec![true, false]);
    }

    #[test]
    fn queue_counts_and_caps_requests() {
        let queue = ActuationQueue::new();
        assert!(!queue.take());

        for _ in 0..MAX_PENDING_ACTUATIONS {
            assert!(queue.request());
        }
        assert!(!queue.request());
        assert_eq!(queue.pending(), MAX_PENDING_ACTUATIONS);

        assert!(queue.take());
        assert_eq!(queue.pending(), MAX_PENDING_ACTUATIONS - 1);
    }

    #[test]
    fn near_reading_means_open() {
        assert_eq!(classify_distance(12.0, 20.0), DoorState::Open);
        assert_eq!(classify_distance(20.0, 20.0), DoorState::Closed);
        assert_eq!(classify_distance(180.0, 20.0), DoorState::Closed);
    }

    #[test]
    fn sonar_retries_once_then_gives_up() {
        let mut sonar = ScriptedSonar(VecDeque::from(vec![Err(echo_timeout()), Ok(8.5)]));
        let mut delay = RecordingDelay::default();
        assert_eq!(
            check_door_state(Some(&mut sonar), 20.0, &mut delay),
            DoorState::Open
        );
        assert_eq!(delay.delays_ms, vec![SONAR_RETRY_DELAY_MS]);

        let mut silent = ScriptedSonar(VecDeque::new());
        let mut delay = RecordingDelay::default();
        assert_eq!(
            check_door_state(Some(&mut silent), 20.0, &mut delay),
            DoorState::Unknown
        );
        assert_eq!(delay.delays_ms.len(), SONAR_ATTEMPTS as usize);
    }

    #[test]
    fn missing_sonar_is_unknown() {
        assert_eq!(
            check_door_state(None::<&mut ScriptedSonar>, 20.0, &mut RecordingDelay::default()),
            DoorState::Unknown
        );
    }
}
