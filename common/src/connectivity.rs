use log::{debug, info, warn};

use crate::{
    board::{Board, BrokerOptions},
    config::{NetworkConfig, TimingConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    LinkJoining,
    BrokerConnecting,
    Connected,
}

/// Result of one state-machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing further to do; the session is usable.
    Ready,
    /// A broker session was just established and the command channel subscribed.
    Established,
    /// Sleep this long, then step again.
    Wait(u64),
    /// Step again immediately.
    Continue,
    /// The join poll budget ran out; the link stays down until the next call.
    JoinExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    AlreadyConnected,
    Established,
    LinkUnavailable,
}

/// Owns the link/broker state machine and its retry policy.
#[derive(Debug, Clone)]
pub struct ConnectivityManager {
    state: ConnectionState,
    client_id: String,
    command_topic: String,
    timing: TimingConfig,
    join_started: bool,
    join_polls: u32,
    has_joined: bool,
    settle_pending: bool,
    broker_attempts: u32,
}

impl ConnectivityManager {
    pub fn new(client_id: String, command_topic: String, timing: TimingConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            client_id,
            command_topic,
            timing,
            join_started: false,
            join_polls: 0,
            has_joined: false,
            settle_pending: false,
            broker_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn broker_options(&self, network: &NetworkConfig) -> BrokerOptions {
        let credentials = (!network.mqtt_user.is_empty())
            .then(|| (network.mqtt_user.clone(), network.mqtt_pass.clone()));
        BrokerOptions {
            host: network.mqtt_host.clone(),
            port: network.mqtt_port,
            client_id: self.client_id.clone(),
            credentials,
        }
    }

    /// Drives the state machine until the session is usable or the join budget
    /// is spent, sleeping between attempts on `board.system`.
    pub fn ensure_connected(&mut self, board: &mut Board<'_>, network: &NetworkConfig) -> ConnectOutcome {
        loop {
            match self.step(board, network) {
                Step::Ready => return ConnectOutcome::AlreadyConnected,
                Step::Established => return ConnectOutcome::Established,
                Step::JoinExhausted => return ConnectOutcome::LinkUnavailable,
                Step::Wait(ms) => board.system.sleep_ms(ms),
                Step::Continue => {}
            }
        }
    }

    /// Advances by at most one transition. Never sleeps.
    pub fn step(&mut self, board: &mut Board<'_>, network: &NetworkConfig) -> Step {
        match self.state {
            ConnectionState::Connected => {
                if !board.link.is_up() {
                    warn!("wifi link lost");
                    self.enter(ConnectionState::Disconnected);
                    Step::Continue
                } else if !board.session.is_connected() {
                    warn!("broker session lost");
                    self.enter(ConnectionState::BrokerConnecting);
                    Step::Continue
                } else {
                    Step::Ready
                }
            }
            ConnectionState::Disconnected => {
                self.join_started = false;
                self.join_polls = 0;
                self.settle_pending = self.has_joined;
                self.enter(ConnectionState::LinkJoining);
                Step::Continue
            }
            ConnectionState::LinkJoining => self.step_join(board, network),
            ConnectionState::BrokerConnecting => self.step_broker(board, network),
        }
    }

    fn step_join(&mut self, board: &mut Board<'_>, network: &NetworkConfig) -> Step {
        if !self.join_started {
            if board.link.is_up() {
                self.enter(ConnectionState::BrokerConnecting);
                return Step::Continue;
            }
            if self.settle_pending {
                self.settle_pending = false;
                board.link.disconnect();
                return Step::Wait(self.timing.link_rejoin_settle_ms);
            }

            info!("joining wifi network '{}'", network.wifi_ssid);
            if let Err(err) = board.link.begin_join(&network.wifi_ssid, &network.wifi_pass) {
                warn!("wifi join could not start: {err}");
            }
            self.join_started = true;
            self.has_joined = true;
        }

        if board.link.is_up() {
            let link = board.link.info();
            info!(
                "wifi connected after {} polls, ip {} rssi {}",
                self.join_polls, link.ip_address, link.rssi
            );
            self.enter(ConnectionState::BrokerConnecting);
            return Step::Continue;
        }

        if self.join_polls >= self.timing.link_poll_attempts {
            warn!(
                "wifi join gave up after {} polls; retrying on next iteration",
                self.join_polls
            );
            self.enter(ConnectionState::Disconnected);
            return Step::JoinExhausted;
        }

        self.join_polls += 1;
        Step::Wait(self.timing.link_poll_interval_ms)
    }

    fn step_broker(&mut self, board: &mut Board<'_>, network: &NetworkConfig) -> Step {
        if !board.link.is_up() {
            warn!("wifi link dropped while connecting to broker");
            self.enter(ConnectionState::Disconnected);
            return Step::Continue;
        }

        let options = self.broker_options(network);
        self.broker_attempts += 1;
        info!(
            "connecting to broker {}:{} as {} (attempt {})",
            options.host, options.port, options.client_id, self.broker_attempts
        );

        match board.session.connect(&options) {
            Ok(()) => {
                self.broker_attempts = 0;
                if let Err(err) = board.session.subscribe(&self.command_topic) {
                    warn!("subscribe to {} failed: {err}", self.command_topic);
                } else {
                    info!("subscribed to {}", self.command_topic);
                }
                self.enter(ConnectionState::Connected);
                Step::Established
            }
            Err(err) => {
                warn!(
                    "broker connect failed: {err}; retrying in {} ms",
                    self.timing.broker_retry_delay_ms
                );
                Step::Wait(self.timing.broker_retry_delay_ms)
            }
        }
    }

    fn enter(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("connection {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{error::SessionError, testing::Rig};

    const COMMAND: &str = "medication/devices/ESP32_001/command";

    fn manager() -> ConnectivityManager {
        ConnectivityManager::new(
            "ESP32_ESP32_001".to_string(),
            COMMAND.to_string(),
            TimingConfig::default(),
        )
    }

    fn network() -> NetworkConfig {
        NetworkConfig {
            wifi_ssid: "clinic".to_string(),
            wifi_pass: "hunter22".to_string(),
            mqtt_host: "broker.local".to_string(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn cold_start_joins_then_connects_and_subscribes() {
        let mut rig = Rig::default();
        rig.link.polls_to_join = Some(3);
        let mut conn = manager();

        let outcome = conn.ensure_connected(&mut rig.board(), &network());

        assert_eq!(outcome, ConnectOutcome::Established);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(rig.link.joins, vec![("clinic".to_string(), "hunter22".to_string())]);
        assert_eq!(rig.link.disconnects, 0);
        assert_eq!(rig.system.slept, vec![500, 500]);
        assert_eq!(rig.session.connects.len(), 1);
        assert_eq!(rig.session.connects[0].client_id, "ESP32_ESP32_001");
        assert_eq!(rig.session.connects[0].credentials, None);
        assert_eq!(rig.session.subscriptions, vec![COMMAND.to_string()]);
    }

    #[test]
    fn connected_call_is_a_no_op() {
        let mut rig = Rig::default();
        let mut conn = manager();
        conn.ensure_connected(&mut rig.board(), &network());
        let slept = rig.system.slept.len();

        let outcome = conn.ensure_connected(&mut rig.board(), &network());

        assert_eq!(outcome, ConnectOutcome::AlreadyConnected);
        assert_eq!(rig.session.connects.len(), 1);
        assert_eq!(rig.session.subscriptions.len(), 1);
        assert_eq!(rig.system.slept.len(), slept);
    }

    #[test]
    fn join_exhaustion_stays_disconnected_without_broker_attempts() {
        let mut rig = Rig::default();
        rig.link.polls_to_join = None;
        let mut conn = manager();

        let outcome = conn.ensure_connected(&mut rig.board(), &network());

        assert_eq!(outcome, ConnectOutcome::LinkUnavailable);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(rig.system.slept, vec![500; 20]);
        assert!(rig.session.connects.is_empty());

        // The next call starts over immediately, after the rejoin settle.
        conn.ensure_connected(&mut rig.board(), &network());
        assert_eq!(rig.link.disconnects, 1);
        assert_eq!(rig.link.joins.len(), 2);
        assert_eq!(rig.system.slept[20], 1_000);
    }

    #[test]
    fn broker_retries_every_five_seconds_until_accepted() {
        let mut rig = Rig::default();
        rig.session.connect_results = (0..4)
            .map(|_| Err(SessionError::Refused(5)))
            .chain([Ok(())])
            .collect();
        let mut conn = manager();

        let outcome = conn.ensure_connected(&mut rig.board(), &network());

        assert_eq!(outcome, ConnectOutcome::Established);
        assert_eq!(rig.session.connects.len(), 5);
        assert_eq!(rig.system.slept, vec![5_000; 4]);
        assert_eq!(rig.session.subscriptions.len(), 1);
    }

    #[test]
    fn credentials_are_sent_only_with_a_username() {
        let conn = manager();
        let mut net = network();
        assert_eq!(conn.broker_options(&net).credentials, None);

        net.mqtt_user = "device".to_string();
        net.mqtt_pass = "pw".to_string();
        assert_eq!(
            conn.broker_options(&net).credentials,
            Some(("device".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn lost_session_resubscribes_on_reconnect() {
        let mut rig = Rig::default();
        let mut conn = manager();
        conn.ensure_connected(&mut rig.board(), &network());

        rig.session.connected = false;
        let outcome = conn.ensure_connected(&mut rig.board(), &network());

        assert_eq!(outcome, ConnectOutcome::Established);
        assert_eq!(rig.link.joins.len(), 1);
        assert_eq!(rig.session.subscriptions, vec![COMMAND.to_string(); 2]);
    }

    #[test]
    fn lost_link_is_detected_and_rejoined() {
        let mut rig = Rig::default();
        let mut conn = manager();
        conn.ensure_connected(&mut rig.board(), &network());

        rig.link.set_up(false);
        rig.session.connected = false;
        let outcome = conn.ensure_connected(&mut rig.board(), &network());

        assert_eq!(outcome, ConnectOutcome::Established);
        assert_eq!(rig.link.disconnects, 1);
        assert_eq!(rig.link.joins.len(), 2);
        assert_eq!(rig.session.connects.len(), 2);
    }

    #[test]
    fn link_drop_during_broker_retry_returns_to_join() {
        let mut rig = Rig::default();
        rig.session.connect_results = [Err(SessionError::Timeout)].into();
        let mut conn = manager();
        let net = network();
        let mut board = rig.board();

        while conn.state() != ConnectionState::BrokerConnecting {
            conn.step(&mut board, &net);
        }
        assert_eq!(conn.step(&mut board, &net), Step::Wait(5_000));

        board.link.disconnect();
        assert_eq!(conn.step(&mut board, &net), Step::Continue);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn never_connects_without_the_link() {
        let mut rig = Rig::default();
        rig.link.polls_to_join = None;
        let mut conn = manager();
        let net = network();
        let mut board = rig.board();

        for _ in 0..100 {
            conn.step(&mut board, &net);
            assert_ne!(conn.state(), ConnectionState::BrokerConnecting);
            assert_ne!(conn.state(), ConnectionState::Connected);
        }
        drop(board);
        assert!(rig.session.connects.is_empty());
    }
}
