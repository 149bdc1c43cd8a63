//! Scripted fake bus for tests and simulation.
//!
//! Replies are served in FIFO order; an exhausted script answers every
//! command with GOOD status and a zero-filled data phase. A gate allows
//! tests to park submissions mid-flight.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::{Completion, CommandDescriptor, DataXfer, DeviceStatus, ScsiBus, TargetId, TransportStatus};
use crate::sense::{SenseData, SenseKey};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted reply
#[derive(Debug, Clone)]
pub struct Reply {
    pub completion: Completion,
    /// Bytes served to an incoming data phase
    pub data: Vec<u8>,
}

impl Reply {
    pub fn good() -> Self {
        Self {
            completion: Completion::good(0),
            data: Vec::new(),
        }
    }

    pub fn good_data(data: Vec<u8>) -> Self {
        Self {
            completion: Completion::good(0),
            data,
        }
    }

    pub fn sense(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self {
            completion: Completion::check_condition(SenseData::new(key, asc, ascq)),
            data: Vec::new(),
        }
    }

    pub fn device_status(status: DeviceStatus) -> Self {
        Self {
            completion: Completion::device_status(status),
            data: Vec::new(),
        }
    }

    pub fn transport(transport: TransportStatus) -> Self {
        Self {
            completion: Completion::transport_error(transport),
            data: Vec::new(),
        }
    }

    fn is_good(&self) -> bool {
        self.completion.transport == TransportStatus::Completed
            && self.completion.status == DeviceStatus::Good as u8
    }
}

/// READ CAPACITY(10) parameter data for a given last LBA and block size
pub fn capacity10_data(last_lba: u32, block_size: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&last_lba.to_be_bytes());
    data.extend_from_slice(&block_size.to_be_bytes());
    data
}

/// READ CAPACITY(16) parameter data for a given last LBA and block size
pub fn capacity16_data(last_lba: u64, block_size: u32) -> Vec<u8> {
    let mut data = vec![0u8; 32];
    data[0..8].copy_from_slice(&last_lba.to_be_bytes());
    data[8..12].copy_from_slice(&block_size.to_be_bytes());
    data
}

/// One observed submission
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub target: TargetId,
    pub cmd: CommandDescriptor,
    pub data_len: usize,
}

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    waiting: usize,
}

#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut st = lock(&self.state);
        if !st.held {
            return;
        }
        st.waiting += 1;
        self.cond.notify_all();
        while st.held {
            st = self.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        st.waiting -= 1;
    }
}

pub struct Scriptbus {
    script: Mutex<VecDeque<Reply>>,
    trace: Mutex<Vec<TraceEntry>>,
    gate: Gate,
}

impl Scriptbus {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            trace: Mutex::new(Vec::new()),
            gate: Gate::default(),
        }
    }

    /// Queues one reply
    pub fn push(&self, reply: Reply) {
        lock(&self.script).push_back(reply);
    }

    /// Queues several replies in order
    pub fn push_all(&self, replies: impl IntoIterator<Item = Reply>) {
        lock(&self.script).extend(replies);
    }

    /// All submissions observed so far
    pub fn trace(&self) -> Vec<TraceEntry> {
        lock(&self.trace).clone()
    }

    /// Command descriptors observed so far, in submission order
    pub fn commands(&self) -> Vec<CommandDescriptor> {
        lock(&self.trace).iter().map(|e| e.cmd.clone()).collect()
    }

    pub fn submissions(&self) -> usize {
        lock(&self.trace).len()
    }

    /// Parks all subsequent submissions until [`Self::release`]
    pub fn hold(&self) {
        lock(&self.gate.state).held = true;
    }

    /// Releases parked submissions
    pub fn release(&self) {
        lock(&self.gate.state).held = false;
        self.gate.cond.notify_all();
    }

    /// Blocks until at least one submission is parked at the gate
    pub fn wait_for_parked(&self) {
        let mut st = lock(&self.gate.state);
        while st.held && st.waiting == 0 {
            st = self.gate.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl ScsiBus for Scriptbus {
    fn submit(&self, target: TargetId, cmd: &CommandDescriptor, data: DataXfer<'_>) -> Completion {
        self.gate.pass();

        lock(&self.trace).push(TraceEntry {
            target,
            cmd: cmd.clone(),
            data_len: data.len(),
        });

        let reply = lock(&self.script).pop_front().unwrap_or_else(Reply::good);
        let mut completion = reply.completion.clone();
        if reply.is_good() {
            completion.transferred = match data {
                DataXfer::None => 0,
                DataXfer::In(buf) => {
                    if reply.data.is_empty() {
                        buf.fill(0);
                        buf.len()
                    } else {
                        let n = reply.data.len().min(buf.len());
                        buf[..n].copy_from_slice(&reply.data[..n]);
                        n
                    }
                }
                DataXfer::Out(buf) => buf.len(),
            };
        }
        completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    const TARGET: TargetId = TargetId { target: 3, lun: 0 };

    #[test]
    fn scripted_replies_in_order() {
        let bus = Scriptbus::new();
        bus.push(Reply::sense(SenseKey::NotReady, 0x3A, 0));
        bus.push(Reply::device_status(DeviceStatus::Busy));

        let first = bus.submit(TARGET, &CommandDescriptor::TestUnitReady, DataXfer::None);
        assert_eq!(first.status, DeviceStatus::CheckCondition as u8);
        assert_eq!(first.sense, Some(SenseData::new(SenseKey::NotReady, 0x3A, 0)));

        let second = bus.submit(TARGET, &CommandDescriptor::TestUnitReady, DataXfer::None);
        assert_eq!(second.status, DeviceStatus::Busy as u8);

        // Script exhausted: default reply
        let third = bus.submit(TARGET, &CommandDescriptor::TestUnitReady, DataXfer::None);
        assert_eq!(third.status, DeviceStatus::Good as u8);
        assert_eq!(bus.submissions(), 3);
    }

    #[test]
    fn data_phase_fill() {
        let bus = Scriptbus::new();
        bus.push(Reply::good_data(capacity10_data(2047, 512)));

        let mut buf = [0xAAu8; 8];
        let completion = bus.submit(
            TARGET,
            &CommandDescriptor::ReadCapacity10,
            DataXfer::In(&mut buf),
        );
        assert_eq!(completion.transferred, 8);
        assert_eq!(&buf[0..4], &2047u32.to_be_bytes());
        assert_eq!(&buf[4..8], &512u32.to_be_bytes());
    }

    #[test]
    fn default_reply_zero_fills_reads() {
        let bus = Scriptbus::new();
        let mut buf = [0xAAu8; 16];
        let completion = bus.submit(
            TARGET,
            &CommandDescriptor::Read { lba: 0, blocks: 1 },
            DataXfer::In(&mut buf),
        );
        assert_eq!(completion.transferred, 16);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn failed_reply_transfers_nothing() {
        let bus = Scriptbus::new();
        bus.push(Reply::transport(TransportStatus::CommandTimeout));
        let mut buf = [0xAAu8; 4];
        let completion = bus.submit(
            TARGET,
            &CommandDescriptor::Read { lba: 0, blocks: 1 },
            DataXfer::In(&mut buf),
        );
        assert_eq!(completion.transferred, 0);
        assert_eq!(buf, [0xAAu8; 4]);
    }

    #[test]
    fn gate_parks_and_releases() {
        let bus = Scriptbus::new();
        bus.hold();

        thread::scope(|s| {
            let parked = s.spawn(|| {
                bus.submit(TARGET, &CommandDescriptor::TestUnitReady, DataXfer::None)
            });
            bus.wait_for_parked();
            assert_eq!(bus.submissions(), 0);
            bus.release();
            let completion = parked.join().unwrap();
            assert_eq!(completion.status, DeviceStatus::Good as u8);
        });
        assert_eq!(bus.submissions(), 1);
    }
}
