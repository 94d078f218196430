use anyhow::{anyhow, Context};
use esp_idf_hal::{
    gpio::{AnyInputPin, AnyOutputPin, InputPin, OutputPin},
    peripheral::Peripheral,
    rmt::{
        config::{CarrierConfig, DutyPercent, ReceiveConfig, TransmitConfig},
        PinState, Pulse, PulseTicks, Receive, RmtChannel, RxRmtDriver, TxRmtDriver,
        VariableLengthSignal, CHANNEL0, CHANNEL1, CHANNEL2, CHANNEL3, RMT,
    },
    units::FromValueType,
};
#[cfg(any(esp32, esp32s3))]
use esp_idf_hal::rmt::{CHANNEL4, CHANNEL5, CHANNEL6, CHANNEL7};
use log::warn;

use irbridge_common::{
    nec, IrFrame, IrHardwareConfig, IrReceiver, IrTransmitter, NecAddress, NecDecoder, RawPulses,
    TransmitError, RAW_PULSE_CAP,
};

// 80 MHz APB / 80 = one tick per microsecond.
const IR_TICK_DIVIDER: u8 = 80;
const US_PER_TICK: u32 = 1;
const MAX_PULSE_TICKS: u32 = 32_767;
// Longer than the 9 ms NEC header mark, shorter than the inter-frame gap.
const RX_IDLE_THRESHOLD_TICKS: u16 = 12_000;
const RX_FILTER_TICKS: u8 = 100;
const RX_RING_BUFFER_ITEMS: usize = 1_000;
// A capture shorter than a repeat burst is line noise.
const MIN_CAPTURE_PULSES: usize = 3;

/// RMT-backed IR front end.
///
/// Either half may be missing when its driver failed to initialise; the
/// bridge keeps serving HTTP either way.
pub struct IrTransceiver {
    tx: Option<TxRmtDriver<'static>>,
    rx: Option<RxRmtDriver<'static>>,
    decoder: NecDecoder,
    rx_items: Vec<(Pulse, Pulse)>,
}

impl IrTransceiver {
    pub fn new(rmt: RMT, ir: &IrHardwareConfig) -> Self {
        let mut channels = RmtChannels::from(rmt);
        let tx = match init_tx(&mut channels, ir) {
            Ok(tx) => Some(tx),
            Err(err) => {
                warn!("IR transmitter unavailable: {err:#}");
                None
            }
        };
        let rx = match init_rx(&mut channels, ir) {
            Ok(rx) => Some(rx),
            Err(err) => {
                warn!("IR receiver unavailable: {err:#}");
                None
            }
        };

        Self {
            tx,
            rx,
            decoder: NecDecoder::new(),
            rx_items: vec![(Pulse::zero(), Pulse::zero()); RAW_PULSE_CAP / 2],
        }
    }

    pub fn tx_ready(&self) -> bool {
        self.tx.is_some()
    }

    pub fn rx_ready(&self) -> bool {
        self.rx.is_some()
    }

    fn send_pulses(&mut self, pulses_us: &[u32]) -> Result<(), TransmitError> {
        let Some(tx) = self.tx.as_mut() else {
            return Err(TransmitError::Disabled);
        };
        if let Some(rx) = self.rx.as_ref() {
            if let Err(err) = rx.stop() {
                warn!("failed to pause IR receiver before transmit: {err}");
            }
        }

        let signal =
            build_signal(pulses_us).map_err(|err| TransmitError::Driver(format!("{err:#}")))?;
        tx.start_blocking(&signal)
            .map_err(|err| TransmitError::Driver(err.to_string()))
    }
}

impl IrReceiver for IrTransceiver {
    fn poll_frame(&mut self) -> Option<IrFrame> {
        let rx = self.rx.as_mut()?;
        let (items, overflowed) = match rx.receive(&mut self.rx_items, 0) {
            Ok(Receive::Read(len)) => (len, false),
            Ok(Receive::Overflow(len)) => (len, true),
            Ok(Receive::Timeout) => return None,
            Err(err) => {
                warn!("IR receive failed: {err}");
                return None;
            }
        };

        let captured = self.rx_items[..items]
            .iter()
            .map(|(mark, space)| (mark.ticks.ticks(), space.ticks.ticks()));
        let raw = RawPulses::from_capture(captured, US_PER_TICK, overflowed);
        if raw.len() < MIN_CAPTURE_PULSES {
            return None;
        }
        Some(self.decoder.decode(raw))
    }

    fn resume(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if let Err(err) = rx.start() {
                warn!("failed to re-arm IR receiver: {err}");
            }
        }
    }
}

impl IrTransmitter for IrTransceiver {
    fn send_nec(
        &mut self,
        address: NecAddress,
        command: u8,
        repeats: u8,
    ) -> Result<(), TransmitError> {
        self.send_pulses(&nec::encode(address, command, repeats))
    }

    fn send_raw(&mut self, pulses_us: &[u32]) -> Result<(), TransmitError> {
        self.send_pulses(pulses_us)
    }
}

/// Marks on even indices, spaces on odd. Durations above the RMT item limit
/// are split into several items of the same level.
fn build_signal(pulses_us: &[u32]) -> anyhow::Result<VariableLengthSignal> {
    let mut pulses = Vec::with_capacity(pulses_us.len());
    for (index, duration_us) in pulses_us.iter().enumerate() {
        let level = if index % 2 == 0 {
            PinState::High
        } else {
            PinState::Low
        };

        let mut remaining = duration_us / US_PER_TICK;
        while remaining > 0 {
            let chunk = remaining.min(MAX_PULSE_TICKS);
            let ticks = u16::try_from(chunk).context("IR pulse does not fit an RMT item")?;
            pulses.push(Pulse::new(
                level,
                PulseTicks::new(ticks).context("invalid IR pulse duration")?,
            ));
            remaining -= chunk;
        }
    }

    let mut signal = VariableLengthSignal::with_capacity(pulses.len());
    signal
        .push(pulses.iter())
        .context("failed to convert IR timings to RMT signal")?;
    Ok(signal)
}

fn tx_driver<C: RmtChannel>(
    channel: impl Peripheral<P = C> + 'static,
    pin: impl Peripheral<P = impl OutputPin> + 'static,
    carrier_khz: u32,
) -> anyhow::Result<TxRmtDriver<'static>> {
    let carrier = CarrierConfig::new()
        .frequency(carrier_khz.kHz().into())
        .carrier_level(PinState::High)
        .duty_percent(DutyPercent::new(33)?);
    let config = TransmitConfig::new()
        .clock_divider(IR_TICK_DIVIDER)
        .carrier(Some(carrier))
        .idle(Some(PinState::Low));

    TxRmtDriver::new(channel, pin, &config).context("failed to init RMT IR transmitter")
}

fn rx_driver<C: RmtChannel>(
    channel: impl Peripheral<P = C> + 'static,
    pin: impl Peripheral<P = impl InputPin> + 'static,
) -> anyhow::Result<RxRmtDriver<'static>> {
    let config = ReceiveConfig::new()
        .clock_divider(IR_TICK_DIVIDER)
        .idle_threshold(RX_IDLE_THRESHOLD_TICKS)
        .filter_ticks_thresh(RX_FILTER_TICKS);

    let rx = RxRmtDriver::new(channel, pin, &config, RX_RING_BUFFER_ITEMS)
        .context("failed to init RMT IR receiver")?;
    rx.start().context("failed to start RMT IR receiver")?;
    Ok(rx)
}

/// RMT channels not yet claimed by a driver.
struct RmtChannels {
    channel0: Option<CHANNEL0>,
    channel1: Option<CHANNEL1>,
    channel2: Option<CHANNEL2>,
    channel3: Option<CHANNEL3>,
    #[cfg(any(esp32, esp32s3))]
    channel4: Option<CHANNEL4>,
    #[cfg(any(esp32, esp32s3))]
    channel5: Option<CHANNEL5>,
    #[cfg(any(esp32, esp32s3))]
    channel6: Option<CHANNEL6>,
    #[cfg(any(esp32, esp32s3))]
    channel7: Option<CHANNEL7>,
}

impl From<RMT> for RmtChannels {
    fn from(rmt: RMT) -> Self {
        Self {
            channel0: Some(rmt.channel0),
            channel1: Some(rmt.channel1),
            channel2: Some(rmt.channel2),
            channel3: Some(rmt.channel3),
            #[cfg(any(esp32, esp32s3))]
            channel4: Some(rmt.channel4),
            #[cfg(any(esp32, esp32s3))]
            channel5: Some(rmt.channel5),
            #[cfg(any(esp32, esp32s3))]
            channel6: Some(rmt.channel6),
            #[cfg(any(esp32, esp32s3))]
            channel7: Some(rmt.channel7),
        }
    }
}

fn claim<C>(slot: &mut Option<C>, index: u8) -> anyhow::Result<C> {
    slot.take()
        .ok_or_else(|| anyhow!("RMT channel{index} is already in use"))
}

fn init_tx(
    channels: &mut RmtChannels,
    ir: &IrHardwareConfig,
) -> anyhow::Result<TxRmtDriver<'static>> {
    let pin = unsafe { AnyOutputPin::new(ir.tx_pin) };
    let carrier_khz = ir.carrier_khz;

    match ir.tx_rmt_channel {
        0 => tx_driver(claim(&mut channels.channel0, 0)?, pin, carrier_khz),
        1 => tx_driver(claim(&mut channels.channel1, 1)?, pin, carrier_khz),
        2 => tx_driver(claim(&mut channels.channel2, 2)?, pin, carrier_khz),
        3 => tx_driver(claim(&mut channels.channel3, 3)?, pin, carrier_khz),
        #[cfg(any(esp32, esp32s3))]
        4 => tx_driver(claim(&mut channels.channel4, 4)?, pin, carrier_khz),
        #[cfg(any(esp32, esp32s3))]
        5 => tx_driver(claim(&mut channels.channel5, 5)?, pin, carrier_khz),
        #[cfg(any(esp32, esp32s3))]
        6 => tx_driver(claim(&mut channels.channel6, 6)?, pin, carrier_khz),
        #[cfg(any(esp32, esp32s3))]
        7 => tx_driver(claim(&mut channels.channel7, 7)?, pin, carrier_khz),
        channel => Err(anyhow!("unsupported RMT tx channel: {channel}")),
    }
}

fn init_rx(
    channels: &mut RmtChannels,
    ir: &IrHardwareConfig,
) -> anyhow::Result<RxRmtDriver<'static>> {
    let pin = unsafe { AnyInputPin::new(ir.rx_pin) };

    match ir.rx_rmt_channel {
        0 => rx_driver(claim(&mut channels.channel0, 0)?, pin),
        1 => rx_driver(claim(&mut channels.channel1, 1)?, pin),
        2 => rx_driver(claim(&mut channels.channel2, 2)?, pin),
        3 => rx_driver(claim(&mut channels.channel3, 3)?, pin),
        #[cfg(any(esp32, esp32s3))]
        4 => rx_driver(claim(&mut channels.channel4, 4)?, pin),
        #[cfg(any(esp32, esp32s3))]
        5 => rx_driver(claim(&mut channels.channel5, 5)?, pin),
        #[cfg(any(esp32, esp32s3))]
        6 => rx_driver(claim(&mut channels.channel6, 6)?, pin),
        #[cfg(any(esp32, esp32s3))]
        7 => rx_driver(claim(&mut channels.channel7, 7)?, pin),
        channel => Err(anyhow!("unsupported RMT rx channel: {channel}")),
    }
}
