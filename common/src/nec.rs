//! NEC infrared protocol: 9 ms header mark, 4.5 ms space, 32 pulse-distance
//! bits sent LSB first (address, address or its inverse, command, inverted
//! command) and a closing 560 us mark. Held buttons send a short repeat burst
//! every 108 ms instead of the full frame.

use crate::{
    capture::RawPulses,
    relay::{IrFrame, IrProtocol},
};

pub const HEADER_MARK_US: u32 = 9_000;
pub const HEADER_SPACE_US: u32 = 4_500;
pub const REPEAT_SPACE_US: u32 = 2_250;
pub const BIT_MARK_US: u32 = 560;
pub const ONE_SPACE_US: u32 = 1_690;
pub const ZERO_SPACE_US: u32 = 560;
pub const FRAME_PERIOD_US: u32 = 108_000;

const DATA_BITS: usize = 32;
const FRAME_PULSES: usize = 2 + DATA_BITS * 2 + 1;

/// The two address bytes as they travel: a standard address is followed by
/// its inverse, an extended one carries a free second byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NecAddress {
    Standard(u8),
    Extended(u16),
}

impl NecAddress {
    pub fn value(self) -> u16 {
        match self {
            Self::Standard(address) => u16::from(address),
            Self::Extended(address) => address,
        }
    }

    pub fn is_extended(self) -> bool {
        matches!(self, Self::Extended(_))
    }

    fn bytes(self) -> [u8; 2] {
        match self {
            Self::Standard(address) => [address, !address],
            Self::Extended(address) => address.to_le_bytes(),
        }
    }

    fn from_bytes(low: u8, high: u8) -> Self {
        if high == !low {
            Self::Standard(low)
        } else {
            Self::Extended(u16::from_le_bytes([low, high]))
        }
    }
}

impl Default for NecAddress {
    fn default() -> Self {
        Self::Standard(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NecSignal {
    Frame { address: NecAddress, command: u8 },
    Repeat,
}

/// Mark/space train for one frame followed by `repeats` repeat bursts.
pub fn encode(address: NecAddress, command: u8, repeats: u8) -> Vec<u32> {
    let mut pulses = Vec::with_capacity(FRAME_PULSES + usize::from(repeats) * 4);
    pulses.push(HEADER_MARK_US);
    pulses.push(HEADER_SPACE_US);

    let word = frame_word(address, command);
    for bit in 0..DATA_BITS {
        pulses.push(BIT_MARK_US);
        pulses.push(if word >> bit & 1 == 1 {
            ONE_SPACE_US
        } else {
            ZERO_SPACE_US
        });
    }
    pulses.push(BIT_MARK_US);

    let mut elapsed: u32 = pulses.iter().sum();
    for _ in 0..repeats {
        pulses.push(FRAME_PERIOD_US.saturating_sub(elapsed));
        pulses.push(HEADER_MARK_US);
        pulses.push(REPEAT_SPACE_US);
        pulses.push(BIT_MARK_US);
        elapsed = HEADER_MARK_US + REPEAT_SPACE_US + BIT_MARK_US;
    }

    pulses
}

pub fn decode(pulses: &[u32]) -> Option<NecSignal> {
    let [mark, space, rest @ ..] = pulses else {
        return None;
    };
    if !matches(*mark, HEADER_MARK_US) {
        return None;
    }

    if matches(*space, REPEAT_SPACE_US) {
        return match rest.first() {
            Some(&stop) if matches(stop, BIT_MARK_US) => Some(NecSignal::Repeat),
            _ => None,
        };
    }

    if !matches(*space, HEADER_SPACE_US) || rest.len() < DATA_BITS * 2 + 1 {
        return None;
    }

    let mut word: u32 = 0;
    for bit in 0..DATA_BITS {
        let mark = rest[bit * 2];
        let space = rest[bit * 2 + 1];
        if !matches(mark, BIT_MARK_US) {
            return None;
        }
        if matches(space, ONE_SPACE_US) {
            word |= 1 << bit;
        } else if !matches(space, ZERO_SPACE_US) {
            return None;
        }
    }
    if !matches(rest[DATA_BITS * 2], BIT_MARK_US) {
        return None;
    }

    let [address_low, address_high, command, command_inverse] = word.to_le_bytes();
    if command != !command_inverse {
        return None;
    }
    let address = NecAddress::from_bytes(address_low, address_high);

    Some(NecSignal::Frame { address, command })
}

/// Receive-side decoder. Repeat bursts carry no payload, so the last full
/// frame is remembered to label them.
#[derive(Debug, Default)]
pub struct NecDecoder {
    last: Option<(NecAddress, u8)>,
}

impl NecDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, raw: RawPulses) -> IrFrame {
        match decode(raw.as_slice()) {
            Some(NecSignal::Frame { address, command }) => {
                self.last = Some((address, command));
                IrFrame {
                    is_repeat: false,
                    protocol: IrProtocol::Nec,
                    address,
                    command,
                    raw,
                }
            }
            Some(NecSignal::Repeat) => {
                let (address, command) = self.last.unwrap_or_default();
                IrFrame {
                    is_repeat: true,
                    protocol: IrProtocol::Nec,
                    address,
                    command,
                    raw,
                }
            }
            None => IrFrame::unknown(raw),
        }
    }
}

fn frame_word(address: NecAddress, command: u8) -> u32 {
    let [low, high] = address.bytes();
    u32::from_le_bytes([low, high, command, !command])
}

fn matches(actual: u32, expected: u32) -> bool {
    actual.abs_diff(expected) <= expected / 4
}
