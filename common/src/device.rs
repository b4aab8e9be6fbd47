use log::{info, warn};

use crate::{
    board::Board,
    config::{DeviceConfig, NetworkConfig, RuntimeConfig, TimingConfig},
    connectivity::{ConnectOutcome, ConnectivityManager},
    dispatcher::{CommandDispatcher, Dispatch},
    lights::CompartmentLights,
    telemetry::TelemetryReporter,
    topics::{client_id, Topics},
};

/// Inbound messages handled per iteration before the telemetry check runs.
pub const MAX_MESSAGES_PER_TICK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Running,
    /// The link could not be joined this iteration.
    Offline,
    Restarting,
}

/// Everything the firmware owns, driven one cooperative iteration at a time.
pub struct Device {
    identity: DeviceConfig,
    topics: Topics,
    network: NetworkConfig,
    timing: TimingConfig,
    connectivity: ConnectivityManager,
    telemetry: TelemetryReporter,
    lights: CompartmentLights,
}

impl Device {
    pub fn new(mut config: RuntimeConfig) -> Self {
        config.sanitize();
        let RuntimeConfig {
            device,
            network,
            timing,
        } = config;

        let topics = Topics::for_device(&device.base_topic, &device.device_id);
        let connectivity = ConnectivityManager::new(
            client_id(&device.client_id_prefix, &device.device_id),
            topics.command.clone(),
            timing.clone(),
        );
        let telemetry = TelemetryReporter::new(
            device.device_id.clone(),
            device.firmware_version.clone(),
            topics.status.clone(),
            timing.status_interval_ms,
        );

        Self {
            identity: device,
            topics,
            network,
            timing,
            connectivity,
            telemetry,
            lights: CompartmentLights::new(),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn lights(&self) -> &CompartmentLights {
        &self.lights
    }

    pub fn connectivity(&self) -> &ConnectivityManager {
        &self.connectivity
    }

    /// Loads persisted credentials, blanks the strip, connects and announces.
    pub fn boot(&mut self, board: &mut Board<'_>) -> Tick {
        info!(
            "booting {} firmware {}",
            self.identity.device_id, self.identity.firmware_version
        );

        match NetworkConfig::load(board.store, self.network.clone()) {
            Ok(network) => self.network = network,
            Err(err) => warn!("stored network settings unreadable, using defaults: {err}"),
        }

        if let Err(err) = board.strip.clear() {
            warn!("could not clear led strip: {err}");
        }

        let tick = self.connect(board);
        if tick == Tick::Running {
            let _ = self.telemetry.publish(board);
        }
        tick
    }

    /// One loop iteration: connectivity, inbound commands, periodic telemetry.
    pub fn tick(&mut self, board: &mut Board<'_>) -> Tick {
        let tick = self.connect(board);
        if tick != Tick::Running {
            return tick;
        }

        for _ in 0..MAX_MESSAGES_PER_TICK {
            let Some(message) = board.session.poll() else {
                break;
            };
            let mut dispatcher = CommandDispatcher {
                topics: &self.topics,
                timing: &self.timing,
                network: &mut self.network,
                lights: &mut self.lights,
                telemetry: &mut self.telemetry,
            };
            if dispatcher.on_message(board, &message.topic, &message.payload) == Dispatch::Restarting {
                return Tick::Restarting;
            }
        }

        self.telemetry.publish_if_due(board);
        Tick::Running
    }

    /// Boots, then iterates until a restart is requested.
    pub fn run(&mut self, board: &mut Board<'_>) {
        let mut tick = self.boot(board);
        while tick != Tick::Restarting {
            board.system.sleep_ms(self.timing.loop_idle_ms);
            tick = self.tick(board);
        }
        info!("device loop stopped for restart");
    }

    fn connect(&mut self, board: &mut Board<'_>) -> Tick {
        match self.connectivity.ensure_connected(board, &self.network) {
            ConnectOutcome::AlreadyConnected => Tick::Running,
            ConnectOutcome::Established => {
                let _ = self.telemetry.publish(board);
                Tick::Running
            }
            ConnectOutcome::LinkUnavailable => Tick::Offline,
        }
    }
}
