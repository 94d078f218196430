use serde::Serialize;

use crate::{config::BridgeConfig, credentials::NetworkCredentials, error::LinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootstrapState {
    ProvisioningMode,
    ConnectingMode,
    ConnectedMode,
    ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningReason {
    OverrideInput,
    NoCredentials,
    ConnectFailed,
}

impl ProvisioningReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OverrideInput => "OVERRIDE_INPUT",
            Self::NoCredentials => "NO_CREDENTIALS",
            Self::ConnectFailed => "CONNECT_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPlan {
    Provision(ProvisioningReason),
    Join,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Connected,
    Failed,
}

/// Station side of the radio, driven by [`Bootstrap::join`].
pub trait StationLink {
    /// Starts an association attempt without waiting for it.
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError>;

    fn poll(&mut self) -> LinkStatus;
}

pub trait Clock {
    fn now_ms(&self) -> u64;

    fn sleep_ms(&self, ms: u64);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinFailure {
    Timeout { elapsed_ms: u64 },
    Rejected,
    Driver(LinkError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Connected { elapsed_ms: u64 },
    Failed(JoinFailure),
}

/// Ends the current boot. Carried out by the frontend after the HTTP
/// response has had `delay_ms` to flush; the next boot re-reads storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Reboot { delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    pub visited: Vec<BootstrapState>,
    pub provisioning: Option<ProvisioningReason>,
    pub join: Option<JoinOutcome>,
}

impl BootReport {
    pub fn final_state(&self) -> BootstrapState {
        self.visited
            .last()
            .copied()
            .unwrap_or(BootstrapState::ProvisioningMode)
    }
}

#[derive(Debug, Clone)]
pub struct Bootstrap {
    connect_timeout_ms: u64,
    poll_interval_ms: u64,
}

impl Bootstrap {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            connect_timeout_ms: config.connect_timeout_ms,
            poll_interval_ms: config.connect_poll_interval_ms.max(1),
        }
    }

    /// The override input wins over stored credentials.
    pub fn plan(override_asserted: bool, credentials: &NetworkCredentials) -> BootPlan {
        if override_asserted {
            BootPlan::Provision(ProvisioningReason::OverrideInput)
        } else if !credentials.has_network() {
            BootPlan::Provision(ProvisioningReason::NoCredentials)
        } else {
            BootPlan::Join
        }
    }

    /// Polls the link until it connects, fails, or the timeout elapses.
    pub fn join<L, C>(&self, link: &mut L, clock: &C, credentials: &NetworkCredentials) -> JoinOutcome
    where
        L: StationLink,
        C: Clock,
    {
        if let Err(err) = link.begin_join(credentials) {
            return JoinOutcome::Failed(JoinFailure::Driver(err));
        }

        let started = clock.now_ms();
        loop {
            let elapsed_ms = clock.now_ms().saturating_sub(started);
            match link.poll() {
                LinkStatus::Connected => return JoinOutcome::Connected { elapsed_ms },
                LinkStatus::Failed => return JoinOutcome::Failed(JoinFailure::Rejected),
                LinkStatus::Pending => {}
            }

            if elapsed_ms >= self.connect_timeout_ms {
                return JoinOutcome::Failed(JoinFailure::Timeout { elapsed_ms });
            }
            clock.sleep_ms(
                self.poll_interval_ms
                    .min(self.connect_timeout_ms - elapsed_ms),
            );
        }
    }

    /// Runs the whole boot decision. Always ends in a serving state:
    /// [`BootstrapState::ConnectedMode`] or [`BootstrapState::ProvisioningMode`].
    pub fn run<L, C>(
        &self,
        override_asserted: bool,
        credentials: &NetworkCredentials,
        link: &mut L,
        clock: &C,
    ) -> BootReport
    where
        L: StationLink,
        C: Clock,
    {
        if let BootPlan::Provision(reason) = Self::plan(override_asserted, credentials) {
            return BootReport {
                visited: vec![BootstrapState::ProvisioningMode],
                provisioning: Some(reason),
                join: None,
            };
        }

        let outcome = self.join(link, clock, credentials);
        match outcome {
            JoinOutcome::Connected { .. } => BootReport {
                visited: vec![BootstrapState::ConnectingMode, BootstrapState::ConnectedMode],
                provisioning: None,
                join: Some(outcome),
            },
            JoinOutcome::Failed(_) => BootReport {
                visited: vec![
                    BootstrapState::ConnectingMode,
                    BootstrapState::ConnectFailed,
                    BootstrapState::ProvisioningMode,
                ],
                provisioning: Some(ProvisioningReason::ConnectFailed),
                join: Some(outcome),
            },
        }
    }
}
