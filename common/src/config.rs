use serde::{Deserialize, Serialize};

/// Upper bound on the number of raw mark/space durations kept from one capture.
pub const RAW_PULSE_CAP: usize = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub relay_cooldown_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_poll_interval_ms: u64,
    pub reboot_delay_ms: u64,
    pub default_address: u8,
    pub default_repeats: u8,
    pub log_lines: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_cooldown_ms: 200,
            connect_timeout_ms: 15_000,
            connect_poll_interval_ms: 250,
            reboot_delay_ms: 1_500,
            default_address: 0x01,
            default_repeats: 0,
            log_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IrHardwareConfig {
    pub tx_pin: i32,
    pub rx_pin: i32,
    pub tx_rmt_channel: u8,
    pub rx_rmt_channel: u8,
    pub carrier_khz: u32,
    pub override_pin: i32,
}

impl Default for IrHardwareConfig {
    fn default() -> Self {
        Self {
            tx_pin: 4,
            rx_pin: 15,
            tx_rmt_channel: 0,
            rx_rmt_channel: 4,
            carrier_khz: 38,
            override_pin: 0,
        }
    }
}

impl IrHardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.tx_pin < 0 {
            self.tx_pin = defaults.tx_pin;
        }
        if self.rx_pin < 0 || self.rx_pin == self.tx_pin {
            self.rx_pin = defaults.rx_pin;
        }
        if self.override_pin < 0 {
            self.override_pin = defaults.override_pin;
        }

        if self.tx_rmt_channel > 7 {
            self.tx_rmt_channel = defaults.tx_rmt_channel;
        }
        if self.rx_rmt_channel > 7 || self.rx_rmt_channel == self.tx_rmt_channel {
            self.rx_rmt_channel = defaults.rx_rmt_channel;
        }

        self.carrier_khz = self.carrier_khz.clamp(10, 100);
    }
}
