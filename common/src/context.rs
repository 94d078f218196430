use serde::Deserialize;

use crate::{
    bootstrap::Transition,
    command::TransmitCommand,
    config::BridgeConfig,
    credentials::{CredentialStore, KeyValueStore},
    error::{ValidationError, ValidationReason},
    identity::DeviceIdentity,
    logbuf::LogBuffer,
    relay::{IrReceiver, IrTransmitter, RelayEngine, RelayOutcome},
    types::{
        ApiBody, ApiResponse, CredentialsReply, ForgetReply, NetworkStatus, RelayReply,
        RestartReply, StatusPayload, TransmitReply,
    },
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CredentialsUpdate {
    #[serde(default)]
    pub ssid: String,
    #[serde(default, alias = "pass", alias = "passphrase")]
    pub password: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

// Same names the JSON body accepts through its serde aliases.
const PASSWORD_PARAMS: [&str; 3] = ["password", "pass", "passphrase"];

impl CredentialsUpdate {
    /// Builds an update from flat request parameters such as a query string.
    pub fn from_params<F>(mut param: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        Self {
            ssid: param("ssid").unwrap_or_default(),
            password: PASSWORD_PARAMS.into_iter().find_map(&mut param),
            label: param("label"),
        }
    }
}

/// Everything the HTTP layer can ask of the device. Parameters arrive as raw
/// text and are validated here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRequest {
    Status,
    Transmit {
        address: Option<String>,
        command: Option<String>,
        repeats: Option<String>,
    },
    SetRelay {
        enabled: Option<String>,
    },
    SetCredentials(CredentialsUpdate),
    ForgetCredentials,
    Restart,
}

#[derive(Debug, Clone)]
pub struct Handled {
    pub response: ApiResponse,
    pub transition: Option<Transition>,
}

impl Handled {
    fn reply(response: ApiResponse) -> Self {
        Self {
            response,
            transition: None,
        }
    }
}

/// All mutable device state, owned by the control loop.
///
/// Request handlers never hold a copy of any of this; they send an
/// [`ApiRequest`] to the loop and get back a fully built response, so every
/// read observes the state after the last mutation.
pub struct DeviceContext<S> {
    config: BridgeConfig,
    hardware_id: u64,
    boot_ms: u64,
    store: CredentialStore<S>,
    identity: DeviceIdentity,
    network: NetworkStatus,
    relay: RelayEngine,
    log: LogBuffer,
}

impl<S: KeyValueStore> DeviceContext<S> {
    pub fn new(
        config: BridgeConfig,
        hardware_id: u64,
        mut store: CredentialStore<S>,
        network: NetworkStatus,
        boot_ms: u64,
    ) -> Self {
        let stored = store.load();
        let identity = DeviceIdentity::derive(hardware_id, &stored.device_label);
        let relay = RelayEngine::new(config.relay_cooldown_ms);
        let log = LogBuffer::new(config.log_lines);

        let mut context = Self {
            config,
            hardware_id,
            boot_ms,
            store,
            identity,
            network,
            relay,
            log,
        };
        let line = match context.network.provisioning_reason {
            Some(reason) => format!(
                "provisioning AP `{}` up ({})",
                context.network.ssid,
                reason.as_str()
            ),
            None => format!(
                "joined `{}` as {}.local",
                context.network.ssid, context.identity.host_name
            ),
        };
        context.log.push(boot_ms, line);
        context
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub fn relay(&self) -> &RelayEngine {
        &self.relay
    }

    pub fn log(&mut self, now_ms: u64, message: impl AsRef<str>) {
        self.log.push(now_ms, message);
    }

    /// Polls the receiver once and relays whatever it produced.
    pub fn poll_ir<P>(&mut self, port: &mut P, now_ms: u64) -> Option<RelayOutcome>
    where
        P: IrReceiver + IrTransmitter,
    {
        let frame = port.poll_frame()?;
        let outcome = self.relay.on_frame(&frame, now_ms, port);

        let summary = self
            .relay
            .last_received()
            .map(|last| last.describe())
            .unwrap_or_default();
        match &outcome {
            RelayOutcome::SkippedRepeat => {}
            RelayOutcome::Relayed(_) => self.log.push(now_ms, format!("RX {summary} -> relayed")),
            RelayOutcome::SkippedCooldown => {
                self.log.push(now_ms, format!("RX {summary} (echo suppressed)"))
            }
            RelayOutcome::Failed(err) => {
                self.log.push(now_ms, format!("RX {summary} relay failed: {err}"))
            }
            RelayOutcome::SkippedDisabled | RelayOutcome::SkippedEmpty => {
                self.log.push(now_ms, format!("RX {summary}"))
            }
        }
        Some(outcome)
    }

    pub fn handle<P>(&mut self, request: ApiRequest, now_ms: u64, port: &mut P) -> Handled
    where
        P: IrReceiver + IrTransmitter,
    {
        match request {
            ApiRequest::Status => {
                Handled::reply(ApiResponse::ok(ApiBody::Status(Box::new(self.status(now_ms)))))
            }
            ApiRequest::Transmit {
                address,
                command,
                repeats,
            } => self.handle_transmit(
                address.as_deref(),
                command.as_deref(),
                repeats.as_deref(),
                now_ms,
                port,
            ),
            ApiRequest::SetRelay { enabled } => self.handle_set_relay(enabled.as_deref(), now_ms),
            ApiRequest::SetCredentials(update) => self.handle_set_credentials(update, now_ms),
            ApiRequest::ForgetCredentials => self.handle_forget(now_ms),
            ApiRequest::Restart => {
                self.log.push(now_ms, "restart requested");
                Handled {
                    response: ApiResponse::ok(ApiBody::Restarting(RestartReply {
                        restarting: true,
                        reboot_in_ms: self.config.reboot_delay_ms,
                    })),
                    transition: Some(self.reboot()),
                }
            }
        }
    }

    pub fn status(&self, now_ms: u64) -> StatusPayload {
        let last_received = self.relay.last_received().cloned();
        StatusPayload {
            mode: self.network.mode.as_str(),
            provisioning_reason: self.network.provisioning_reason.map(|reason| reason.as_str()),
            ssid: self.network.ssid.clone(),
            ip: self.network.ip.clone(),
            host_name: self.identity.host_name.clone(),
            ap_ssid: self.identity.provisioning_ssid(),
            relay_enabled: self.relay.is_enabled(),
            last_received_text: last_received.as_ref().map(|last| last.describe()),
            last_received,
            ir: self.relay.stats().clone(),
            logs: self.log.lines(),
            uptime_ms: now_ms.saturating_sub(self.boot_ms),
        }
    }

    fn handle_transmit<P>(
        &mut self,
        address: Option<&str>,
        command: Option<&str>,
        repeats: Option<&str>,
        now_ms: u64,
        port: &mut P,
    ) -> Handled
    where
        P: IrReceiver + IrTransmitter,
    {
        let command = match TransmitCommand::from_params(address, command, repeats, &self.config) {
            Ok(command) => command,
            Err(err) => return Handled::reply(validation_response(&err)),
        };

        let line = format!(
            "TX NEC addr=0x{:02X} cmd=0x{:02X} repeats={}",
            command.address, command.command, command.repeats
        );
        match self.relay.transmit(&command, now_ms, port) {
            Ok(()) => {
                self.log.push(now_ms, line);
                Handled::reply(ApiResponse::ok(ApiBody::Transmitted(TransmitReply {
                    sent: true,
                    address: command.address,
                    command: command.command,
                    repeats: command.repeats,
                })))
            }
            Err(err) => {
                self.log.push(now_ms, format!("{line} failed: {err}"));
                Handled::reply(ApiResponse::error(503, err.to_string(), None))
            }
        }
    }

    fn handle_set_relay(&mut self, enabled: Option<&str>, now_ms: u64) -> Handled {
        let requested = match enabled.map(str::trim) {
            None | Some("") => None,
            Some(text) => match parse_switch(text) {
                Some(value) => Some(value),
                None => {
                    let err = ValidationError::new("enabled", ValidationReason::Malformed);
                    return Handled::reply(ApiResponse::error(
                        400,
                        "invalid `enabled`: use on/off, true/false or 1/0",
                        Some(err.field),
                    ));
                }
            },
        };

        let changed = requested.is_some_and(|value| self.relay.set_enabled(value));
        if changed {
            let state = if self.relay.is_enabled() { "on" } else { "off" };
            self.log.push(now_ms, format!("relay {state}"));
        }

        Handled::reply(ApiResponse::ok(ApiBody::Relay(RelayReply {
            relay_enabled: self.relay.is_enabled(),
            changed,
        })))
    }

    fn handle_set_credentials(&mut self, update: CredentialsUpdate, now_ms: u64) -> Handled {
        let ssid = update.ssid.trim();
        if ssid.is_empty() {
            let err = ValidationError::new("ssid", ValidationReason::Missing);
            return Handled::reply(validation_response(&err));
        }

        let label = match update.label {
            Some(label) => label,
            None => self.store.load().device_label,
        };
        let password = update.password.unwrap_or_default();

        if let Err(err) = self.store.save(ssid, &password, &label) {
            self.log.push(now_ms, format!("saving credentials failed: {err}"));
            return Handled::reply(ApiResponse::error(
                500,
                "failed to persist credentials",
                None,
            ));
        }
        self.refresh_identity();
        self.log.push(
            now_ms,
            format!(
                "credentials for `{ssid}` saved; rebooting as {}",
                self.identity.host_name
            ),
        );

        Handled {
            response: ApiResponse::ok(ApiBody::CredentialsSaved(CredentialsReply {
                saved: true,
                ssid: ssid.to_string(),
                host_name: self.identity.host_name.clone(),
                reboot_in_ms: self.config.reboot_delay_ms,
            })),
            transition: Some(self.reboot()),
        }
    }

    fn handle_forget(&mut self, now_ms: u64) -> Handled {
        if let Err(err) = self.store.clear() {
            self.log.push(now_ms, format!("forgetting credentials failed: {err}"));
            return Handled::reply(ApiResponse::error(
                500,
                "failed to clear credentials",
                None,
            ));
        }
        self.refresh_identity();
        self.log.push(now_ms, "credentials forgotten; rebooting");

        Handled {
            response: ApiResponse::ok(ApiBody::CredentialsForgotten(ForgetReply {
                forgotten: true,
                reboot_in_ms: self.config.reboot_delay_ms,
            })),
            transition: Some(self.reboot()),
        }
    }

    fn refresh_identity(&mut self) {
        let stored = self.store.load();
        self.identity = DeviceIdentity::derive(self.hardware_id, &stored.device_label);
    }

    fn reboot(&self) -> Transition {
        Transition::Reboot {
            delay_ms: self.config.reboot_delay_ms,
        }
    }

    /// Gives the storage back, e.g. to re-run the boot sequence in-process.
    pub fn into_store(self) -> CredentialStore<S> {
        self.store
    }
}

fn validation_response(err: &ValidationError) -> ApiResponse {
    ApiResponse::error(400, err.to_string(), Some(err.field))
}

fn parse_switch(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}
