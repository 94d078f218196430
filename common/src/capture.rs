use heapless::Vec;

use crate::config::RAW_PULSE_CAP;

/// Alternating mark/space durations in microseconds, starting with a mark.
///
/// Fixed capacity; anything past [`RAW_PULSE_CAP`] is dropped and only
/// remembered through [`RawPulses::truncated`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPulses {
    pulses: Vec<u32, RAW_PULSE_CAP>,
    truncated: bool,
}

impl RawPulses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts receiver ticks to microseconds.
    pub fn from_ticks(ticks: &[u16], us_per_tick: u32) -> Self {
        ticks
            .iter()
            .map(|&tick| u32::from(tick).saturating_mul(us_per_tick))
            .collect()
    }

    /// Converts receiver items (mark ticks, space ticks). A zero duration ends
    /// the capture. `overflowed` is the receiver's own report that it dropped
    /// the tail of the signal.
    pub fn from_capture<I>(items: I, us_per_tick: u32, overflowed: bool) -> Self
    where
        I: IntoIterator<Item = (u16, u16)>,
    {
        let mut raw = Self::new();
        let ticks = items
            .into_iter()
            .flat_map(|(mark, space)| [mark, space])
            .take_while(|&tick| tick != 0);
        for tick in ticks {
            raw.push(u32::from(tick).saturating_mul(us_per_tick));
        }
        if overflowed {
            raw.mark_truncated();
        }
        raw
    }

    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    pub fn push(&mut self, duration_us: u32) {
        if self.pulses.push(duration_us).is_err() {
            self.truncated = true;
        }
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.pulses
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl FromIterator<u32> for RawPulses {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut raw = Self::new();
        for duration in iter {
            raw.push(duration);
        }
        raw
    }
}
