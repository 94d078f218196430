pub mod bootstrap;
pub mod capture;
pub mod command;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod logbuf;
pub mod nec;
pub mod relay;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use bootstrap::{
    BootPlan, BootReport, Bootstrap, BootstrapState, Clock, JoinFailure, JoinOutcome, LinkStatus,
    ProvisioningReason, StationLink, Transition,
};
pub use capture::RawPulses;
pub use command::TransmitCommand;
pub use config::{BridgeConfig, IrHardwareConfig, RAW_PULSE_CAP};
pub use context::{ApiRequest, CredentialsUpdate, DeviceContext, Handled};
pub use credentials::{CredentialStore, KeyValueStore, NetworkCredentials};
pub use error::{LinkError, StoreError, TransmitError, ValidationError, ValidationReason};
pub use identity::DeviceIdentity;
pub use nec::{NecAddress, NecDecoder};
pub use relay::{IrFrame, IrProtocol, IrReceiver, IrTransmitter, RelayEngine, RelayOutcome};
pub use types::{ApiBody, ApiResponse, NetworkMode, NetworkStatus, StatusPayload};
