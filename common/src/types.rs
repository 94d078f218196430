use serde::Serialize;

use crate::{
    bootstrap::ProvisioningReason,
    relay::{FrameSummary, RelayStats},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkMode {
    Provisioning,
    Station,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Station => "STATION",
        }
    }
}

/// What the frontend established at boot; fixed until the next reboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatus {
    pub mode: NetworkMode,
    pub ssid: String,
    pub ip: Option<String>,
    pub provisioning_reason: Option<ProvisioningReason>,
}

impl NetworkStatus {
    pub fn station(ssid: impl Into<String>, ip: Option<String>) -> Self {
        Self {
            mode: NetworkMode::Station,
            ssid: ssid.into(),
            ip,
            provisioning_reason: None,
        }
    }

    pub fn provisioning(
        ap_ssid: impl Into<String>,
        ip: Option<String>,
        reason: ProvisioningReason,
    ) -> Self {
        Self {
            mode: NetworkMode::Provisioning,
            ssid: ap_ssid.into(),
            ip,
            provisioning_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub mode: &'static str,
    #[serde(rename = "provisioningReason")]
    pub provisioning_reason: Option<&'static str>,
    pub ssid: String,
    pub ip: Option<String>,
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "apSsid")]
    pub ap_ssid: String,
    #[serde(rename = "relayEnabled")]
    pub relay_enabled: bool,
    #[serde(rename = "lastReceived")]
    pub last_received: Option<FrameSummary>,
    #[serde(rename = "lastReceivedText")]
    pub last_received_text: Option<String>,
    pub ir: RelayStats,
    pub logs: Vec<String>,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TransmitReply {
    pub sent: bool,
    pub address: u8,
    pub command: u8,
    pub repeats: u8,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelayReply {
    #[serde(rename = "relayEnabled")]
    pub relay_enabled: bool,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CredentialsReply {
    pub saved: bool,
    pub ssid: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "rebootInMs")]
    pub reboot_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ForgetReply {
    pub forgotten: bool,
    #[serde(rename = "rebootInMs")]
    pub reboot_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RestartReply {
    pub restarting: bool,
    #[serde(rename = "rebootInMs")]
    pub reboot_in_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ApiBody {
    Status(Box<StatusPayload>),
    Transmitted(TransmitReply),
    Relay(RelayReply),
    CredentialsSaved(CredentialsReply),
    CredentialsForgotten(ForgetReply),
    Restarting(RestartReply),
    Error(ErrorBody),
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ApiBody,
}

impl ApiResponse {
    pub fn ok(body: ApiBody) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>, field: Option<&'static str>) -> Self {
        Self {
            status,
            body: ApiBody::Error(ErrorBody {
                error: message.into(),
                field,
            }),
        }
    }
}
