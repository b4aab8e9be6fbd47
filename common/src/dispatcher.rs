use log::{debug, info, warn};

use crate::{
    board::Board,
    config::{NetworkConfig, TimingConfig},
    error::LightError,
    lights::CompartmentLights,
    ota::{self, OtaRequest, UpdateState},
    telemetry::TelemetryReporter,
    topics::Topics,
    types::{Command, ResponsePayload, ResponseStatus},
};

pub const MSG_REBOOTING: &str = "Device will reboot now";
pub const MSG_WIFI_UPDATED: &str = "WiFi credentials updated, rebooting";
pub const MSG_WIFI_SAVE_FAILED: &str = "Failed to save WiFi credentials";
pub const MSG_LED_UPDATED: &str = "LED updated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The command ran to completion.
    Handled,
    /// Decoding or validation failed; nothing was published.
    Dropped,
    /// The message did not arrive on the command channel.
    Ignored,
    /// A restart was requested; the caller should stop iterating.
    Restarting,
}

/// Borrowed view of the device state a command may touch.
pub struct CommandDispatcher<'d> {
    pub topics: &'d Topics,
    pub timing: &'d TimingConfig,
    pub network: &'d mut NetworkConfig,
    pub lights: &'d mut CompartmentLights,
    pub telemetry: &'d mut TelemetryReporter,
}

impl CommandDispatcher<'_> {
    /// Handles one inbound message to completion before returning.
    pub fn on_message(&mut self, board: &mut Board<'_>, topic: &str, payload: &[u8]) -> Dispatch {
        if topic != self.topics.command {
            debug!("ignoring message on {topic}");
            return Dispatch::Ignored;
        }

        let command = match Command::decode(payload) {
            Ok(command) => command,
            Err(err) => {
                warn!("dropping command: {err}");
                return Dispatch::Dropped;
            }
        };
        info!("command received: {}", command.name());

        match command {
            Command::Reboot => {
                self.respond(board, ResponsePayload::new(ResponseStatus::Rebooting, MSG_REBOOTING));
                board.restart_after(self.timing.restart_flush_ms);
                Dispatch::Restarting
            }
            Command::OtaUpdate {
                url,
                version,
                sha256,
            } => {
                let request = OtaRequest {
                    url,
                    version,
                    sha256,
                };
                match ota::run(
                    board,
                    &self.topics.response,
                    self.timing.restart_flush_ms,
                    &request,
                ) {
                    UpdateState::Succeeded => Dispatch::Restarting,
                    _ => Dispatch::Handled,
                }
            }
            Command::WifiChange { ssid, password } => self.change_wifi(board, ssid, password),
            Command::LedControl {
                compartment,
                color,
                brightness,
            } => match self.lights.apply(board.strip, compartment, &color, brightness) {
                Ok(slot) => {
                    let response = ResponsePayload::new(ResponseStatus::Success, MSG_LED_UPDATED)
                        .with_compartment(slot as u8);
                    self.respond(board, response);
                    Dispatch::Handled
                }
                Err(LightError::InvalidCompartment(index)) => {
                    warn!("led_control: compartment {index} out of range");
                    Dispatch::Dropped
                }
                Err(err) => {
                    warn!("led_control: {err}");
                    Dispatch::Dropped
                }
            },
            Command::GetStatus => {
                let _ = self.telemetry.publish(board);
                Dispatch::Handled
            }
            Command::Unknown(name) => {
                warn!("unknown command '{name}'");
                Dispatch::Dropped
            }
        }
    }

    fn change_wifi(&mut self, board: &mut Board<'_>, ssid: String, password: String) -> Dispatch {
        let mut network = self.network.clone();
        network.wifi_ssid = ssid;
        network.wifi_pass = password;
        network.sanitize();

        if let Err(err) = network.save_replacing(&*self.network, board.store) {
            warn!("wifi_change: could not persist credentials: {err}");
            self.respond(board, ResponsePayload::failed(MSG_WIFI_SAVE_FAILED));
            return Dispatch::Handled;
        }

        info!("wifi credentials updated to '{}'", network.wifi_ssid);
        *self.network = network;
        self.respond(board, ResponsePayload::new(ResponseStatus::Success, MSG_WIFI_UPDATED));
        board.restart_after(self.timing.restart_flush_ms);
        Dispatch::Restarting
    }

    fn respond(&self, board: &mut Board<'_>, response: ResponsePayload) {
        let _ = board.publish_json(&self.topics.response, &response);
    }
}
