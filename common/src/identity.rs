use serde::Serialize;

/// Label used when the stored one sanitizes to nothing usable.
pub const FALLBACK_LABEL: &str = "irbridge";

/// Provisioning access point name prefix; the hardware suffix is appended.
pub const AP_SSID_PREFIX: &str = "ESP32-Setup-";

// Leaves room for "-" plus the six suffix digits inside a 63 byte DNS label.
pub const MAX_LABEL_LEN: usize = 56;

/// Six upper-case hex digits taken from the low 24 bits of the hardware id.
pub fn hardware_suffix(hardware_id: u64) -> String {
    format!("{:06X}", hardware_id & 0x00FF_FFFF)
}

/// Reduces any user text to `[a-z][a-z0-9-]*`, or [`FALLBACK_LABEL`].
pub fn sanitize_label(raw: &str) -> String {
    let mut label: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter_map(|ch| match ch {
            ' ' | '_' | '.' => Some('-'),
            'a'..='z' | '0'..='9' | '-' => Some(ch),
            _ => None,
        })
        .take(MAX_LABEL_LEN)
        .collect();

    while label.ends_with('-') {
        label.pop();
    }

    match label.chars().next() {
        Some(first) if first.is_ascii_lowercase() => label,
        _ => FALLBACK_LABEL.to_string(),
    }
}

/// `<sanitized label>-<suffix>`, lower-cased for use as an mDNS host name.
pub fn resolve_host_name(label: &str, hardware_id: u64) -> String {
    format!(
        "{}-{}",
        sanitize_label(label),
        hardware_suffix(hardware_id).to_ascii_lowercase()
    )
}

pub fn provisioning_ssid(hardware_id: u64) -> String {
    format!("{AP_SSID_PREFIX}{}", hardware_suffix(hardware_id))
}

/// Recomputed every boot and after every credential change; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    #[serde(rename = "hardwareSuffix")]
    pub hardware_suffix: String,
    #[serde(rename = "label")]
    pub sanitized_label: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
}

impl DeviceIdentity {
    pub fn derive(hardware_id: u64, stored_label: &str) -> Self {
        Self {
            hardware_suffix: hardware_suffix(hardware_id),
            sanitized_label: sanitize_label(stored_label),
            host_name: resolve_host_name(stored_label, hardware_id),
        }
    }

    pub fn provisioning_ssid(&self) -> String {
        format!("{AP_SSID_PREFIX}{}", self.hardware_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT_A: u64 = 0x24_0A_C4_A1_B2_C3;
    const UNIT_B: u64 = 0x24_0A_C4_A1_B2_C4;

    fn is_valid_label(label: &str) -> bool {
        let mut chars = label.chars();
        matches!(chars.next(), Some('a'..='z'))
            && chars.all(|ch| matches!(ch, 'a'..='z' | '0'..='9' | '-'))
    }

    #[test]
    fn suffix_is_low_24_bits_in_upper_hex() {
        assert_eq!(hardware_suffix(UNIT_A), "A1B2C3");
        assert_eq!(hardware_suffix(0x5), "000005");
        assert_eq!(hardware_suffix(u64::MAX), "FFFFFF");
    }

    #[test]
    fn sanitize_maps_separators_and_drops_junk() {
        assert_eq!(sanitize_label("  Living Room  "), "living-room");
        assert_eq!(sanitize_label("den_tv.box"), "den-tv-box");
        assert_eq!(sanitize_label("Kitchen!!#2"), "kitchen2");
        assert_eq!(sanitize_label("office---"), "office");
        assert_eq!(sanitize_label("Zürich"), "zrich");
    }

    #[test]
    fn sanitize_falls_back_for_unusable_input() {
        for raw in ["", "   ", "123abc", "-den", "!!!", "___", "ü"] {
            assert_eq!(sanitize_label(raw), FALLBACK_LABEL, "input {raw:?}");
        }
    }

    #[test]
    fn sanitize_output_is_valid_and_idempotent() {
        let inputs = [
            "den",
            "Den TV",
            "a.b_c d",
            "9lives",
            "x-",
            "\u{0}\u{7f}tab\there",
            "UPPER.lower_Mixed 42",
            "ꙮꙮꙮ",
            &"long".repeat(40),
        ];

        for raw in inputs {
            let once = sanitize_label(raw);
            assert!(is_valid_label(&once), "{raw:?} -> {once:?}");
            assert!(once.len() <= MAX_LABEL_LEN);
            assert_eq!(sanitize_label(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn host_name_is_deterministic_and_unit_specific() {
        assert_eq!(resolve_host_name("den", UNIT_A), "den-a1b2c3");
        assert_eq!(
            resolve_host_name("den", UNIT_A),
            resolve_host_name("den", UNIT_A)
        );
        assert_ne!(
            resolve_host_name("den", UNIT_A),
            resolve_host_name("den", UNIT_B)
        );
        assert_eq!(resolve_host_name("", UNIT_A), "irbridge-a1b2c3");
    }

    #[test]
    fn identity_bundles_derived_names() {
        let identity = DeviceIdentity::derive(UNIT_A, "Den");
        assert_eq!(identity.hardware_suffix, "A1B2C3");
        assert_eq!(identity.sanitized_label, "den");
        assert_eq!(identity.host_name, "den-a1b2c3");
        assert_eq!(identity.provisioning_ssid(), "ESP32-Setup-A1B2C3");
        assert_eq!(provisioning_ssid(UNIT_A), identity.provisioning_ssid());
    }
}
