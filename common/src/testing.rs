//! In-memory doubles shared by the unit tests.

use std::{
    cell::Cell,
    collections::{BTreeMap, VecDeque},
};

use crate::{
    bootstrap::{Clock, LinkStatus, StationLink},
    credentials::{KeyValueStore, NetworkCredentials},
    error::{LinkError, StoreError, TransmitError},
    nec::NecAddress,
    relay::{IrFrame, IrReceiver, IrTransmitter},
};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Accepts a fixed number of writes, then fails every later one as if power
/// was lost mid-save.
#[derive(Debug)]
pub struct CrashingStore {
    inner: MemoryStore,
    writes_left: usize,
}

impl CrashingStore {
    pub fn new(inner: MemoryStore, writes_left: usize) -> Self {
        Self { inner, writes_left }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn spend_write(&mut self) -> Result<(), StoreError> {
        if self.writes_left == 0 {
            return Err(StoreError::Backend("power lost".to_string()));
        }
        self.writes_left -= 1;
        Ok(())
    }
}

impl KeyValueStore for CrashingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.spend_write()?;
        self.inner.set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.spend_write()?;
        self.inner.remove(key)
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Cell::new(start_ms),
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

#[derive(Debug)]
pub struct ScriptedLink {
    pending_polls: Option<usize>,
    outcome: LinkStatus,
    begin_error: Option<LinkError>,
    pub joined_with: Option<String>,
}

impl ScriptedLink {
    pub fn connect_after(pending_polls: usize) -> Self {
        Self {
            pending_polls: Some(pending_polls),
            outcome: LinkStatus::Connected,
            begin_error: None,
            joined_with: None,
        }
    }

    pub fn reject_after(pending_polls: usize) -> Self {
        Self {
            outcome: LinkStatus::Failed,
            ..Self::connect_after(pending_polls)
        }
    }

    pub fn never() -> Self {
        Self {
            pending_polls: None,
            ..Self::connect_after(0)
        }
    }

    pub fn broken(reason: &str) -> Self {
        Self {
            begin_error: Some(LinkError::Configuration(reason.to_string())),
            ..Self::connect_after(0)
        }
    }
}

impl StationLink for ScriptedLink {
    fn begin_join(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError> {
        if let Some(err) = self.begin_error.clone() {
            return Err(err);
        }
        self.joined_with = Some(credentials.ssid.clone());
        Ok(())
    }

    fn poll(&mut self) -> LinkStatus {
        match self.pending_polls.as_mut() {
            None => LinkStatus::Pending,
            Some(0) => self.outcome,
            Some(left) => {
                *left -= 1;
                LinkStatus::Pending
            }
        }
    }
}

/// Receiver queue plus a record of everything transmitted.
#[derive(Debug, Default)]
pub struct FakePort {
    pub incoming: VecDeque<IrFrame>,
    pub nec_sent: Vec<(NecAddress, u8, u8)>,
    pub raw_sent: Vec<Vec<u32>>,
    pub resumes: usize,
    pub fail_sends: bool,
}

impl IrReceiver for FakePort {
    fn poll_frame(&mut self) -> Option<IrFrame> {
        self.incoming.pop_front()
    }

    fn resume(&mut self) {
        self.resumes += 1;
    }
}

impl IrTransmitter for FakePort {
    fn send_nec(
        &mut self,
        address: NecAddress,
        command: u8,
        repeats: u8,
    ) -> Result<(), TransmitError> {
        if self.fail_sends {
            return Err(TransmitError::Driver("rmt busy".to_string()));
        }
        self.nec_sent.push((address, command, repeats));
        Ok(())
    }

    fn send_raw(&mut self, pulses_us: &[u32]) -> Result<(), TransmitError> {
        if self.fail_sends {
            return Err(TransmitError::Driver("rmt busy".to_string()));
        }
        self.raw_sent.push(pulses_us.to_vec());
        Ok(())
    }
}
