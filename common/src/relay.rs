use serde::Serialize;

use crate::{capture::RawPulses, command::TransmitCommand, error::TransmitError, nec::NecAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IrProtocol {
    Nec,
    Unknown,
}

impl IrProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nec => "NEC",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One completed decode from the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFrame {
    pub is_repeat: bool,
    pub protocol: IrProtocol,
    pub address: NecAddress,
    pub command: u8,
    /// Only replayed when `protocol` is [`IrProtocol::Unknown`].
    pub raw: RawPulses,
}

impl IrFrame {
    pub fn unknown(raw: RawPulses) -> Self {
        Self {
            is_repeat: false,
            protocol: IrProtocol::Unknown,
            address: NecAddress::default(),
            command: 0,
            raw,
        }
    }
}

/// Pull-based receive side.
///
/// Each `poll` yields at most one frame. A frame that completes while nobody
/// polls may be overwritten by the next one; that loss is accepted.
pub trait IrReceiver {
    fn poll_frame(&mut self) -> Option<IrFrame>;

    /// Re-arms reception after a transmit burst.
    fn resume(&mut self);
}

pub trait IrTransmitter {
    fn send_nec(
        &mut self,
        address: NecAddress,
        command: u8,
        repeats: u8,
    ) -> Result<(), TransmitError>;

    fn send_raw(&mut self, pulses_us: &[u32]) -> Result<(), TransmitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayState {
    pub enabled: bool,
    pub last_transmit_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Relayed(IrProtocol),
    SkippedRepeat,
    SkippedDisabled,
    SkippedCooldown,
    SkippedEmpty,
    Failed(TransmitError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FrameSummary {
    pub protocol: IrProtocol,
    pub address: u16,
    pub extended: bool,
    pub command: u8,
    pub repeat: bool,
    pub pulses: usize,
    pub truncated: bool,
    #[serde(rename = "atMs")]
    pub at_ms: u64,
}

impl FrameSummary {
    fn from_frame(frame: &IrFrame, at_ms: u64) -> Self {
        Self {
            protocol: frame.protocol,
            address: frame.address.value(),
            extended: frame.address.is_extended(),
            command: frame.command,
            repeat: frame.is_repeat,
            pulses: frame.raw.len(),
            truncated: frame.raw.truncated(),
            at_ms,
        }
    }

    pub fn describe(&self) -> String {
        let address = if self.extended {
            format!("0x{:04X}", self.address)
        } else {
            format!("0x{:02X}", self.address)
        };
        match self.protocol {
            IrProtocol::Nec if self.repeat => {
                format!("NEC repeat addr={address} cmd=0x{:02X}", self.command)
            }
            IrProtocol::Nec => format!("NEC addr={address} cmd=0x{:02X}", self.command),
            IrProtocol::Unknown if self.truncated => {
                format!("UNKNOWN raw {} pulses (truncated)", self.pulses)
            }
            IrProtocol::Unknown => format!("UNKNOWN raw {} pulses", self.pulses),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub relayed: u64,
    #[serde(rename = "suppressedRepeat")]
    pub suppressed_repeat: u64,
    #[serde(rename = "suppressedCooldown")]
    pub suppressed_cooldown: u64,
    pub transmitted: u64,
    #[serde(rename = "transmitFailures")]
    pub transmit_failures: u64,
}

/// Re-emits received frames and enforces a silence window after every
/// transmit, relayed or manual, so the device does not relay its own output.
#[derive(Debug)]
pub struct RelayEngine {
    state: RelayState,
    cooldown_ms: u64,
    stats: RelayStats,
    last_received: Option<FrameSummary>,
}

impl RelayEngine {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            state: RelayState {
                enabled: false,
                last_transmit_ms: None,
            },
            cooldown_ms,
            stats: RelayStats::default(),
            last_received: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let changed = self.state.enabled != enabled;
        self.state.enabled = enabled;
        changed
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn last_received(&self) -> Option<&FrameSummary> {
        self.last_received.as_ref()
    }

    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        self.state
            .last_transmit_ms
            .is_some_and(|last| now_ms.saturating_sub(last) <= self.cooldown_ms)
    }

    pub fn on_frame<P>(&mut self, frame: &IrFrame, now_ms: u64, port: &mut P) -> RelayOutcome
    where
        P: IrReceiver + IrTransmitter,
    {
        self.stats.received = self.stats.received.saturating_add(1);
        self.last_received = Some(FrameSummary::from_frame(frame, now_ms));

        if frame.is_repeat {
            self.stats.suppressed_repeat = self.stats.suppressed_repeat.saturating_add(1);
            return RelayOutcome::SkippedRepeat;
        }
        if !self.state.enabled {
            return RelayOutcome::SkippedDisabled;
        }
        if self.in_cooldown(now_ms) {
            self.stats.suppressed_cooldown = self.stats.suppressed_cooldown.saturating_add(1);
            return RelayOutcome::SkippedCooldown;
        }

        let result = match frame.protocol {
            IrProtocol::Nec => port.send_nec(frame.address, frame.command, 0),
            IrProtocol::Unknown if frame.raw.is_empty() => return RelayOutcome::SkippedEmpty,
            IrProtocol::Unknown => port.send_raw(frame.raw.as_slice()),
        };
        self.finish_transmit(now_ms, port);

        match result {
            Ok(()) => {
                self.stats.relayed = self.stats.relayed.saturating_add(1);
                RelayOutcome::Relayed(frame.protocol)
            }
            Err(err) => {
                self.stats.transmit_failures = self.stats.transmit_failures.saturating_add(1);
                RelayOutcome::Failed(err)
            }
        }
    }

    /// Manual send; restarts the cooldown exactly like a relayed frame.
    pub fn transmit<P>(
        &mut self,
        command: &TransmitCommand,
        now_ms: u64,
        port: &mut P,
    ) -> Result<(), TransmitError>
    where
        P: IrReceiver + IrTransmitter,
    {
        let result = port.send_nec(
            NecAddress::Standard(command.address),
            command.command,
            command.repeats,
        );
        self.finish_transmit(now_ms, port);

        match &result {
            Ok(()) => self.stats.transmitted = self.stats.transmitted.saturating_add(1),
            Err(_) => {
                self.stats.transmit_failures = self.stats.transmit_failures.saturating_add(1)
            }
        }
        result
    }

    // A failed burst may still have been partially emitted.
    fn finish_transmit<P: IrReceiver>(&mut self, now_ms: u64, port: &mut P) {
        self.state.last_transmit_ms = Some(now_ms);
        port.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{nec, testing::FakePort};

    const COOLDOWN_MS: u64 = 200;

    fn nec_frame(address: u8, command: u8) -> IrFrame {
        let address = NecAddress::Standard(address);
        IrFrame {
            is_repeat: false,
            protocol: IrProtocol::Nec,
            address,
            command,
            raw: nec::encode(address, command, 0).into_iter().collect(),
        }
    }

    fn enabled_engine() -> RelayEngine {
        let mut engine = RelayEngine::new(COOLDOWN_MS);
        engine.set_enabled(true);
        engine
    }

    #[test]
    fn relays_nec_natively_without_repeats() {
        let mut engine = enabled_engine();
        let mut port = FakePort::default();

        let outcome = engine.on_frame(&nec_frame(0x01, 0x1B), 1_000, &mut port);

        assert_eq!(outcome, RelayOutcome::Relayed(IrProtocol::Nec));
        assert_eq!(port.nec_sent, vec![(NecAddress::Standard(0x01), 0x1B, 0)]);
        assert!(port.raw_sent.is_empty());
        assert_eq!(port.resumes, 1);
        assert_eq!(engine.state().last_transmit_ms, Some(1_000));
    }

    #[test]
    fn relays_extended_address_frame_bit_for_bit() {
        let mut engine = enabled_engine();
        let mut port = FakePort::default();
        let received = nec::encode(NecAddress::Extended(0x0005), 0x1B, 0);
        let frame = nec::NecDecoder::new().decode(received.iter().copied().collect());

        let outcome = engine.on_frame(&frame, 1_000, &mut port);

        assert_eq!(outcome, RelayOutcome::Relayed(IrProtocol::Nec));
        let [(address, command, repeats)] = port.nec_sent[..] else {
            panic!("expected one NEC send, got {:?}", port.nec_sent);
        };
        assert_eq!(address, NecAddress::Extended(0x0005));
        assert_eq!(nec::encode(address, command, repeats), received);
        assert_eq!(
            engine.last_received().map(FrameSummary::describe),
            Some("NEC addr=0x0005 cmd=0x1B".to_string())
        );
    }

    #[test]
    fn relays_unknown_as_raw_waveform() {
        let mut engine = enabled_engine();
        let mut port = FakePort::default();
        let frame = IrFrame::unknown([2_400, 600, 1_200, 600].into_iter().collect());

        let outcome = engine.on_frame(&frame, 50, &mut port);

        assert_eq!(outcome, RelayOutcome::Relayed(IrProtocol::Unknown));
        assert_eq!(port.raw_sent, vec![vec![2_400, 600, 1_200, 600]]);
        assert_eq!(port.resumes, 1);
    }

    #[test]
    fn repeat_frames_are_never_relayed() {
        for enabled in [true, false] {
            let mut engine = RelayEngine::new(COOLDOWN_MS);
            engine.set_enabled(enabled);
            let mut port = FakePort::default();
            let mut frame = nec_frame(0x01, 0x1B);
            frame.is_repeat = true;

            assert_eq!(
                engine.on_frame(&frame, 10_000, &mut port),
                RelayOutcome::SkippedRepeat
            );
            assert!(port.nec_sent.is_empty());
            assert!(engine.last_received().is_some_and(|last| last.repeat));
        }
    }

    #[test]
    fn disabled_relay_only_updates_display() {
        let mut engine = RelayEngine::new(COOLDOWN_MS);
        let mut port = FakePort::default();

        assert_eq!(
            engine.on_frame(&nec_frame(0x02, 0x03), 5, &mut port),
            RelayOutcome::SkippedDisabled
        );
        assert!(port.nec_sent.is_empty());
        assert_eq!(port.resumes, 0);
        assert_eq!(
            engine.last_received().map(FrameSummary::describe),
            Some("NEC addr=0x02 cmd=0x03".to_string())
        );
    }

    #[test]
    fn cooldown_window_is_inclusive_of_200ms() {
        let mut engine = enabled_engine();
        let mut port = FakePort::default();
        let command = TransmitCommand {
            address: 0x01,
            command: 0x1B,
            repeats: 0,
        };
        engine.transmit(&command, 10_000, &mut port).unwrap();

        for offset in [1, 100, 200] {
            assert_eq!(
                engine.on_frame(&nec_frame(0x01, 0x1B), 10_000 + offset, &mut port),
                RelayOutcome::SkippedCooldown,
                "offset {offset}"
            );
        }
        assert_eq!(
            engine.on_frame(&nec_frame(0x01, 0x1B), 10_201, &mut port),
            RelayOutcome::Relayed(IrProtocol::Nec)
        );
        assert_eq!(engine.stats().suppressed_cooldown, 3);
    }

    #[test]
    fn relayed_frame_restarts_cooldown() {
        let mut engine = enabled_engine();
        let mut port = FakePort::default();

        engine.on_frame(&nec_frame(0x01, 0x01), 0, &mut port);
        // Our own emission coming back through the receiver.
        assert_eq!(
            engine.on_frame(&nec_frame(0x01, 0x01), 120, &mut port),
            RelayOutcome::SkippedCooldown
        );
        assert_eq!(port.nec_sent.len(), 1);
    }

    #[test]
    fn manual_transmit_failure_still_rearms_receiver() {
        let mut engine = RelayEngine::new(COOLDOWN_MS);
        let mut port = FakePort {
            fail_sends: true,
            ..FakePort::default()
        };
        let command = TransmitCommand {
            address: 0x01,
            command: 0x02,
            repeats: 3,
        };

        assert!(engine.transmit(&command, 42, &mut port).is_err());
        assert_eq!(port.resumes, 1);
        assert!(engine.in_cooldown(242));
        assert!(!engine.in_cooldown(243));
        assert_eq!(engine.stats().transmit_failures, 1);
    }

    #[test]
    fn empty_unknown_capture_is_not_sent() {
        let mut engine = enabled_engine();
        let mut port = FakePort::default();

        assert_eq!(
            engine.on_frame(&IrFrame::unknown(RawPulses::new()), 0, &mut port),
            RelayOutcome::SkippedEmpty
        );
        assert_eq!(engine.state().last_transmit_ms, None);
    }
}
