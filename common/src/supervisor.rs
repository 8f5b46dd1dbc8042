use std::net::Ipv4Addr;

use embedded_hal::delay::DelayNs;
use log::{error, info, warn};

use crate::config::WifiCredentials;
use crate::error::{FatalError, RadioError};

pub const MAX_CONNECT_ATTEMPTS: u32 = 5;
pub const SETTLE_DELAY_MS: u32 = 5_000;
pub const CONNECTION_RETRY_DELAY_MS: u32 = 5_000;
pub const OTHER_RETRY_DELAY_MS: u32 = 3_000;
pub const INTER_ATTEMPT_DELAY_MS: u32 = 2_000;
pub const RADIO_TOGGLE_DELAY_MS: u32 = 1_000;
pub const REBOOT_DELAY_MS: u32 = 5_000;
pub const SERVICE_LOOP_YIELD_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCause {
    PowerOn,
    Software,
    Panic,
    Watchdog,
    Brownout,
    Unknown,
}

impl ResetCause {
    pub fn is_fault(self) -> bool {
        matches!(self, Self::Panic | Self::Watchdog | Self::Brownout)
    }
}

pub trait WifiRadio {
    fn is_connected(&mut self) -> bool;
    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), RadioError>;
    fn disconnect(&mut self) -> Result<(), RadioError>;
    fn set_enabled(&mut self, enabled: bool) -> Result<(), RadioError>;
    fn ipv4_address(&mut self) -> Option<Ipv4Addr>;
}

pub trait SystemReset {
    // Restarts the device. Implementations do not return in practice.
    fn hard_reset(&mut self);
}

pub struct ConnectionSupervisor<W, D> {
    radio: W,
    delay: D,
    state: ConnectionState,
    address: Option<Ipv4Addr>,
    attempts: u32,
}

impl<W, D> ConnectionSupervisor<W, D>
where
    W: WifiRadio,
    D: DelayNs,
{
    pub fn new(radio: W, delay: D) -> Self {
        Self {
            radio,
            delay,
            state: ConnectionState::Disconnected,
            address: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn radio(&self) -> &W {
        &self.radio
    }

    pub fn recover_radio(&mut self, cause: ResetCause) {
        if !cause.is_fault() {
            return;
        }
        info!("reset cause {cause:?}; power-cycling wifi radio");
        if let Err(err) = self.cycle_radio() {
            warn!("wifi radio reset failed: {err}");
        }
    }

    fn cycle_radio(&mut self) -> Result<(), RadioError> {
        if self.radio.is_connected() {
            self.radio.disconnect()?;
        }
        self.radio.set_enabled(false)?;
        self.delay.delay_ms(RADIO_TOGGLE_DELAY_MS);
        self.radio.set_enabled(true)?;
        self.delay.delay_ms(RADIO_TOGGLE_DELAY_MS);
        Ok(())
    }

    pub fn connect(
        &mut self,
        credentials: Option<&WifiCredentials>,
    ) -> Result<Ipv4Addr, FatalError> {
        let Some(credentials) = credentials else {
            self.state = ConnectionState::Failed;
            return Err(FatalError::MissingCredentials);
        };

        self.state = ConnectionState::Connecting;
        self.attempts = 0;
        self.delay.delay_ms(SETTLE_DELAY_MS);

        while !self.radio.is_connected() {
            if self.attempts >= MAX_CONNECT_ATTEMPTS {
                self.state = ConnectionState::Failed;
                return Err(FatalError::ConnectionFatal(
                    "exceeded max attempts".into(),
                ));
            }
            self.attempts += 1;
            info!(
                "connecting to {} (attempt {}/{})",
                credentials.ssid, self.attempts, MAX_CONNECT_ATTEMPTS
            );

            match self.radio.connect(credentials) {
                Ok(()) => {}
                Err(err @ RadioError::Connection(_)) => {
                    warn!("{err}; retrying");
                    self.delay.delay_ms(CONNECTION_RETRY_DELAY_MS);
                }
                Err(err) => {
                    warn!("{err}; retrying");
                    self.delay.delay_ms(OTHER_RETRY_DELAY_MS);
                }
            }
            self.delay.delay_ms(INTER_ATTEMPT_DELAY_MS);
        }

        let address = self.radio.ipv4_address().unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.address = Some(address);
        self.state = ConnectionState::Connected;
        info!("connected to {} as {address}", credentials.ssid);
        Ok(address)
    }

    // Only a supervisor that reached Connected may keep serving.
    pub fn check_link(&mut self) -> Result<(), FatalError> {
        if self.state != ConnectionState::Connected {
            return Err(FatalError::ConnectionFatal(format!(
                "link checked while {:?}",
                self.state
            )));
        }
        if self.radio.is_connected() {
            return Ok(());
        }
        self.state = ConnectionState::Disconnected;
        Err(FatalError::ConnectionFatal("wifi connection lost".into()))
    }

    pub fn fail_safe_reboot<R: SystemReset>(&mut self, reset: &mut R, reason: &FatalError) {
        fail_safe_reboot(&mut self.delay, reset, reason);
    }
}

pub fn fail_safe_reboot<D, R>(delay: &mut D, reset: &mut R, reason: &FatalError)
where
    D: DelayNs,
    R: SystemReset,
{
    error!("{reason}; rebooting in {}s", REBOOT_DELAY_MS / 1_000);
    delay.delay_ms(REBOOT_DELAY_MS);
    reset.hard_reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDelay;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedRadio {
        outcomes: VecDeque<Result<(), RadioError>>,
        connected: bool,
        connect_calls: u32,
        toggles: Vec<bool>,
        disconnects: u32,
    }

    impl ScriptedRadio {
        fn with_outcomes(outcomes: Vec<Result<(), RadioError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                ..Self::default()
            }
        }
    }

    impl WifiRadio for ScriptedRadio {
        fn is_connected(&mut self) -> bool {
            self.connected
        }

        fn connect(&mut self, _credentials: &WifiCredentials) -> Result<(), RadioError> {
            self.connect_calls += 1;
            let outcome = self
                .outcomes
                .pop_front()
                .unwrap_or_else(|| Err(RadioError::Connection("no ap".into())));
            if outcome.is_ok() {
                self.connected = true;
            }
            outcome
        }

        fn disconnect(&mut self) -> Result<(), RadioError> {
            self.disconnects += 1;
            self.connected = false;
            Ok(())
        }

        fn set_enabled(&mut self, enabled: bool) -> Result<(), RadioError> {
            self.toggles.push(enabled);
            Ok(())
        }

        fn ipv4_address(&mut self) -> Option<Ipv4Addr> {
            self.connected.then_some(Ipv4Addr::new(192, 168, 1, 50))
        }
    }

    #[derive(Default)]
    struct CountingReset {
        resets: u32,
    }

    impl SystemReset for CountingReset {
        fn hard_reset(&mut self) {
            self.resets += 1;
        }
    }

    fn credentials() -> WifiCredentials {
        WifiCredentials {
            ssid: "garage-net".into(),
            password: "hunter2".into(),
        }
    }

    #[test]
    fn connects_after_transient_failures() {
        let radio = ScriptedRadio::with_outcomes(vec![
            Err(RadioError::Connection("auth timeout".into())),
            Err(RadioError::Other("internal".into())),
            Ok(()),
        ]);
        let mut supervisor = ConnectionSupervisor::new(radio, RecordingDelay::default());

        let address = supervisor.connect(Some(&credentials())).unwrap();

        assert_eq!(address, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.attempts(), 3);
        assert_eq!(
            supervisor.delay.delays_ms,
            vec![
                SETTLE_DELAY_MS,
                CONNECTION_RETRY_DELAY_MS,
                INTER_ATTEMPT_DELAY_MS,
                OTHER_RETRY_DELAY_MS,
                INTER_ATTEMPT_DELAY_MS,
                INTER_ATTEMPT_DELAY_MS,
            ]
        );
    }

    #[test]
    fn five_failures_reboot_exactly_once() {
        let radio = ScriptedRadio::default();
        let mut supervisor = ConnectionSupervisor::new(radio, RecordingDelay::default());
        let mut reset = CountingReset::default();

        let err = supervisor.connect(Some(&credentials())).unwrap_err();
        assert_eq!(
            err,
            FatalError::ConnectionFatal("exceeded max attempts".into())
        );
        assert_eq!(supervisor.state(), ConnectionState::Failed);
        assert_eq!(supervisor.radio().connect_calls, MAX_CONNECT_ATTEMPTS);

        supervisor.fail_safe_reboot(&mut reset, &err);

        assert_eq!(reset.resets, 1);
        assert_eq!(supervisor.radio().connect_calls, MAX_CONNECT_ATTEMPTS);
        assert_eq!(supervisor.delay.delays_ms.last(), Some(&REBOOT_DELAY_MS));
        // settle + five (retry + inter-attempt) pairs + reboot wait
        assert_eq!(supervisor.delay.total_ms(), 5_000 + 5 * 7_000 + 5_000);
    }

    #[test]
    fn missing_credentials_are_fatal_without_attempts() {
        let mut supervisor =
            ConnectionSupervisor::new(ScriptedRadio::default(), RecordingDelay::default());

        assert_eq!(supervisor.connect(None), Err(FatalError::MissingCredentials));
        assert_eq!(supervisor.radio().connect_calls, 0);
    }

    #[test]
    fn already_associated_radio_skips_attempts() {
        let radio = ScriptedRadio {
            connected: true,
            ..ScriptedRadio::default()
        };
        let mut supervisor = ConnectionSupervisor::new(radio, RecordingDelay::default());

        assert!(supervisor.connect(Some(&credentials())).is_ok());
        assert_eq!(supervisor.attempts(), 0);
        assert_eq!(supervisor.delay.delays_ms, vec![SETTLE_DELAY_MS]);
    }

    #[test]
    fn lost_link_is_fatal() {
        let radio = ScriptedRadio::with_outcomes(vec![Ok(())]);
        let mut supervisor = ConnectionSupervisor::new(radio, RecordingDelay::default());
        supervisor.connect(Some(&credentials())).unwrap();
        assert_eq!(supervisor.check_link(), Ok(()));

        supervisor.radio.connected = false;

        assert!(matches!(
            supervisor.check_link(),
            Err(FatalError::ConnectionFatal(_))
        ));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn link_check_before_connect_is_fatal() {
        let radio = ScriptedRadio {
            connected: true,
            ..ScriptedRadio::default()
        };
        let mut supervisor = ConnectionSupervisor::new(radio, RecordingDelay::default());

        assert_eq!(
            supervisor.check_link(),
            Err(FatalError::ConnectionFatal(
                "link checked while Disconnected".into()
            ))
        );

        supervisor.connect(Some(&credentials())).unwrap();
        assert_eq!(supervisor.check_link(), Ok(()));
    }

    #[test]
    fn failed_connect_stays_failed() {
        let mut supervisor =
            ConnectionSupervisor::new(ScriptedRadio::default(), RecordingDelay::default());
        assert!(supervisor.connect(Some(&credentials())).is_err());

        supervisor.radio.connected = true;

        assert!(supervisor.check_link().is_err());
        assert_eq!(supervisor.state(), ConnectionState::Failed);
    }

    #[test]
    fn fault_boot_power_cycles_radio() {
        let radio = ScriptedRadio {
            connected: true,
            ..ScriptedRadio::default()
        };
        let mut supervisor = ConnectionSupervisor::new(radio, RecordingDelay::default());

        supervisor.recover_radio(ResetCause::Watchdog);

        assert_eq!(supervisor.radio().disconnects, 1);
        assert_eq!(supervisor.radio().toggles, vec![false, true]);
        assert_eq!(
            supervisor.delay.delays_ms,
            vec![RADIO_TOGGLE_DELAY_MS, RADIO_TOGGLE_DELAY_MS]
        );
    }

    #[test]
    fn clean_boot_leaves_radio_alone() {
        let mut supervisor =
            ConnectionSupervisor::new(ScriptedRadio::default(), RecordingDelay::default());
        supervisor.recover_radio(ResetCause::PowerOn);
        assert!(supervisor.radio().toggles.is_empty());
    }
}
