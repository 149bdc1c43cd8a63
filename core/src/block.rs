//! Default block read/write path and the media control operations

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::*;

use crate::bus::{CommandDescriptor, DataXfer, ScsiBus};
use crate::device::{Device, DeviceId, Handle, HandleId, Periph, lock};
use crate::error::ErrorKind;
use crate::exec::CommandOutcome;
use crate::media::MediaStatus;

/// Media control operations multiplexed through the ioctl entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum IoctlOp {
    GetMediaStatus,
    Eject,
    Load,
}

/// Payload coming back from an ioctl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlOutput {
    None,
    MediaStatus(MediaStatus),
}

/// Holds a handle's busy latch for one in-flight request
struct IoTicket {
    handle: Arc<Handle>,
}

impl IoTicket {
    fn acquire(handle: Arc<Handle>) -> Result<Self, ErrorKind> {
        if handle
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ErrorKind::Busy);
        }
        Ok(Self { handle })
    }
}

impl Drop for IoTicket {
    fn drop(&mut self) {
        self.handle.busy.store(false, Ordering::Release);
    }
}

impl<B: ScsiBus> Periph<B> {
    /// Common entry checks for block I/O: busy latch, media gate, block
    /// size and buffer agreement
    fn begin_io(
        &self,
        handle: HandleId,
        buf_len: usize,
        num_blocks: u32,
        block_size: u32,
    ) -> Result<IoTicket, ErrorKind> {
        let handle = self.handle(handle)?;
        let ticket = IoTicket::acquire(handle)?;

        match ticket.handle.device.media_gate() {
            MediaStatus::Ready => (),
            MediaStatus::MediaChangeRequested => return Err(ErrorKind::MediaChanged),
            MediaStatus::Pending(kind) => return Err(kind),
        }

        let negotiated = lock(&ticket.handle.device.state).block_size;
        if negotiated == 0 || block_size != negotiated {
            return Err(ErrorKind::InvalidRequest);
        }
        if buf_len as u64 != u64::from(num_blocks) * u64::from(block_size) {
            return Err(ErrorKind::InvalidRequest);
        }
        Ok(ticket)
    }

    /// Reads whole blocks; `pos` is a block address. At most one request
    /// per handle may be in flight through this path.
    pub fn read(
        &self,
        handle: HandleId,
        buf: &mut [u8],
        pos: u64,
        num_blocks: u32,
        block_size: u32,
    ) -> Result<usize, ErrorKind> {
        let ticket = self.begin_io(handle, buf.len(), num_blocks, block_size)?;
        let device = &ticket.handle.device;
        let chunk = device.max_transfer_blocks.unwrap_or(u32::MAX).max(1);

        let mut done = 0usize;
        let mut lba = pos;
        let mut remaining = num_blocks;
        while remaining > 0 {
            let blocks = remaining.min(chunk);
            let bytes = blocks as usize * block_size as usize;
            let cmd = CommandDescriptor::Read { lba, blocks };
            let segment = &mut buf[done..done + bytes];
            match self.execute_on(device, &cmd, DataXfer::In(segment))? {
                CommandOutcome::MediaChangeDetected => return Err(ErrorKind::MediaChanged),
                CommandOutcome::Done(n) => {
                    let n = n.min(bytes);
                    done += n;
                    if n < bytes {
                        // GOOD status but a short data phase; do not run
                        // past what the device delivered
                        warn!("{}: short read ({}/{} bytes)", device.target, n, bytes);
                        return Ok(done);
                    }
                }
            }
            lba += u64::from(blocks);
            remaining -= blocks;
        }
        Ok(done)
    }

    /// Writes whole blocks; the counterpart of [`Self::read`]
    pub fn write(
        &self,
        handle: HandleId,
        buf: &[u8],
        pos: u64,
        num_blocks: u32,
        block_size: u32,
    ) -> Result<usize, ErrorKind> {
        let ticket = self.begin_io(handle, buf.len(), num_blocks, block_size)?;
        let device = &ticket.handle.device;
        let chunk = device.max_transfer_blocks.unwrap_or(u32::MAX).max(1);

        let mut done = 0usize;
        let mut lba = pos;
        let mut remaining = num_blocks;
        while remaining > 0 {
            let blocks = remaining.min(chunk);
            let bytes = blocks as usize * block_size as usize;
            let cmd = CommandDescriptor::Write { lba, blocks };
            let segment = &buf[done..done + bytes];
            match self.execute_on(device, &cmd, DataXfer::Out(segment))? {
                CommandOutcome::MediaChangeDetected => return Err(ErrorKind::MediaChanged),
                CommandOutcome::Done(n) => {
                    let n = n.min(bytes);
                    done += n;
                    if n < bytes {
                        warn!("{}: short write ({}/{} bytes)", device.target, n, bytes);
                        return Ok(done);
                    }
                }
            }
            lba += u64::from(blocks);
            remaining -= blocks;
        }
        Ok(done)
    }

    /// The classic media ioctls. The status query blocks until the unit
    /// settles; eject and load are start/stop variants.
    pub fn ioctl(&self, handle: HandleId, op: IoctlOp) -> Result<IoctlOutput, ErrorKind> {
        match op {
            IoctlOp::GetMediaStatus => {
                Ok(IoctlOutput::MediaStatus(self.media_status(handle)?))
            }
            IoctlOp::Eject => {
                let handle = self.handle(handle)?;
                self.start_stop_on(&handle.device, false, true)?;
                Ok(IoctlOutput::None)
            }
            IoctlOp::Load => {
                let handle = self.handle(handle)?;
                self.start_stop_on(&handle.device, true, true)?;
                Ok(IoctlOutput::None)
            }
        }
    }

    /// Spins the unit up or down; `load_eject` also moves the medium
    pub fn send_start_stop(
        &self,
        device: DeviceId,
        start: bool,
        load_eject: bool,
    ) -> Result<(), ErrorKind> {
        let device = self.device(device)?;
        self.start_stop_on(&device, start, load_eject)
    }

    fn start_stop_on(
        &self,
        device: &Device,
        start: bool,
        load_eject: bool,
    ) -> Result<(), ErrorKind> {
        let cmd = CommandDescriptor::StartStop { start, load_eject };
        match self.execute_on(device, &cmd, DataXfer::None)? {
            CommandOutcome::Done(_) => Ok(()),
            CommandOutcome::MediaChangeDetected => Err(ErrorKind::MediaChanged),
        }
    }

    /// Flushes the device's write cache. Devices without the command
    /// report an illegal request; that counts as a successful flush.
    pub fn synchronize_cache(&self, device: DeviceId) -> Result<(), ErrorKind> {
        let device = self.device(device)?;
        match self.execute_on(&device, &CommandDescriptor::SynchronizeCache, DataXfer::None) {
            Ok(CommandOutcome::Done(_)) => Ok(()),
            Ok(CommandOutcome::MediaChangeDetected) => Err(ErrorKind::MediaChanged),
            Err(ErrorKind::ProtocolViolation) => {
                debug!("{}: no cache flushing support", device.target);
                Ok(())
            }
            Err(kind) => Err(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::scriptbus::{Reply, Scriptbus, capacity10_data};
    use crate::bus::{Completion, TargetId};
    use crate::device::{Callbacks, DeviceOptions};
    use crate::retry::Tuning;
    use crate::sense::{ASC_ILLEGAL_COMMAND, SenseKey};

    /// Engine with one removable device, capacity (512, 2048) already
    /// negotiated and one open handle
    fn ready_engine(max_transfer_blocks: Option<u32>) -> (Periph<Scriptbus>, DeviceId, HandleId) {
        let periph = Periph::new(Scriptbus::new(), 0, Tuning::immediate());
        let options = DeviceOptions {
            removable: true,
            max_transfer_blocks,
        };
        let dev = periph
            .register_device(TargetId::new(3, 0), Callbacks::default(), options)
            .unwrap();
        periph.bus().push(Reply::good());
        periph.bus().push(Reply::good_data(capacity10_data(2047, 512)));
        periph.check_capacity(dev).unwrap();

        let handle = periph.handle_open(dev).unwrap();
        (periph, dev, handle)
    }

    fn submissions_after(periph: &Periph<Scriptbus>) -> usize {
        // The negotiation in ready_engine used two submissions
        periph.bus().submissions() - 2
    }

    /// Answers everything GOOD but claims 512 bytes more moved than the
    /// data phase holds
    struct OverreportBus;

    impl ScsiBus for OverreportBus {
        fn submit(
            &self,
            _target: TargetId,
            cmd: &CommandDescriptor,
            data: DataXfer<'_>,
        ) -> Completion {
            let claimed = data.len() + 512;
            if let DataXfer::In(buf) = data {
                if *cmd == CommandDescriptor::ReadCapacity10 {
                    buf.copy_from_slice(&capacity10_data(2047, 512));
                } else {
                    buf.fill(0);
                }
            }
            Completion::good(claimed)
        }
    }

    fn overreport_engine(
        max_transfer_blocks: Option<u32>,
    ) -> (Periph<OverreportBus>, DeviceId, HandleId) {
        let periph = Periph::new(OverreportBus, 0, Tuning::immediate());
        let options = DeviceOptions {
            removable: false,
            max_transfer_blocks,
        };
        let callbacks = Callbacks {
            set_capacity: Some(Box::new(|_, _| {})),
            ..Callbacks::default()
        };
        let dev = periph
            .register_device(TargetId::new(1, 0), callbacks, options)
            .unwrap();
        periph.check_capacity(dev).unwrap();
        let handle = periph.handle_open(dev).unwrap();
        (periph, dev, handle)
    }

    #[test]
    fn read_requires_negotiated_capacity() {
        let periph = Periph::new(Scriptbus::new(), 0, Tuning::immediate());
        let options = DeviceOptions {
            removable: true,
            ..DeviceOptions::default()
        };
        let dev = periph
            .register_device(TargetId::new(0, 0), Callbacks::default(), options)
            .unwrap();
        let handle = periph.handle_open(dev).unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(
            periph.read(handle, &mut buf, 0, 1, 512),
            Err(ErrorKind::InvalidRequest)
        );
        assert_eq!(periph.bus().submissions(), 0);
    }

    #[test]
    fn block_size_must_match_negotiation() {
        let (periph, _, handle) = ready_engine(None);
        let mut buf = [0u8; 2048];
        assert_eq!(
            periph.read(handle, &mut buf, 0, 1, 2048),
            Err(ErrorKind::InvalidRequest)
        );
    }

    #[test]
    fn buffer_must_cover_the_transfer() {
        let (periph, _, handle) = ready_engine(None);
        let mut buf = [0u8; 1024];
        assert_eq!(
            periph.read(handle, &mut buf, 0, 4, 512),
            Err(ErrorKind::InvalidRequest)
        );
    }

    #[test]
    fn zero_length_transfer() {
        let (periph, _, handle) = ready_engine(None);
        assert_eq!(periph.read(handle, &mut [], 0, 0, 512), Ok(0));
        assert_eq!(submissions_after(&periph), 0);
    }

    #[test]
    fn large_transfers_are_split() {
        let (periph, _, handle) = ready_engine(Some(4));
        let mut buf = vec![0u8; 10 * 512];

        assert_eq!(periph.read(handle, &mut buf, 100, 10, 512), Ok(10 * 512));
        assert_eq!(
            periph.bus().commands()[2..],
            [
                CommandDescriptor::Read {
                    lba: 100,
                    blocks: 4
                },
                CommandDescriptor::Read {
                    lba: 104,
                    blocks: 4
                },
                CommandDescriptor::Read {
                    lba: 108,
                    blocks: 2
                }
            ]
        );
    }

    #[test]
    fn write_path_issues_write_commands() {
        let (periph, _, handle) = ready_engine(None);
        let buf = vec![0xA5u8; 3 * 512];

        assert_eq!(periph.write(handle, &buf, 7, 3, 512), Ok(3 * 512));
        assert_eq!(
            periph.bus().commands()[2..],
            [CommandDescriptor::Write { lba: 7, blocks: 3 }]
        );
        assert_eq!(periph.bus().trace()[2].data_len, 3 * 512);
    }

    #[test]
    fn overreported_transfer_counts_are_clamped() {
        let (periph, _, handle) = overreport_engine(Some(1));

        // Segment advance follows the real segment size, not the claim
        let mut buf = [0u8; 1024];
        assert_eq!(periph.read(handle, &mut buf, 0, 2, 512), Ok(1024));
        assert_eq!(periph.write(handle, &buf, 0, 2, 512), Ok(1024));
    }

    #[test]
    fn reported_count_never_exceeds_the_buffer() {
        let (periph, _, handle) = overreport_engine(None);

        let mut buf = [0u8; 512];
        assert_eq!(periph.read(handle, &mut buf, 0, 1, 512), Ok(512));
    }

    #[test]
    fn pending_change_gates_io_without_bus_traffic() {
        let (periph, dev, handle) = ready_engine(None);
        periph.notify_media_changed(dev).unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(
            periph.read(handle, &mut buf, 0, 1, 512),
            Err(ErrorKind::MediaChanged)
        );
        assert_eq!(
            periph.write(handle, &buf, 0, 1, 512),
            Err(ErrorKind::MediaChanged)
        );
        assert_eq!(submissions_after(&periph), 0);
    }

    #[test]
    fn change_detected_mid_transfer_aborts() {
        let (periph, _, handle) = ready_engine(Some(1));
        periph.bus().push(Reply::good());
        periph
            .bus()
            .push(Reply::sense(SenseKey::UnitAttention, 0x28, 0));

        let mut buf = [0u8; 1024];
        assert_eq!(
            periph.read(handle, &mut buf, 0, 2, 512),
            Err(ErrorKind::MediaChanged)
        );
        assert_eq!(submissions_after(&periph), 2);
    }

    #[test]
    fn eject_and_load_are_start_stop_variants() {
        let (periph, _, handle) = ready_engine(None);

        assert_eq!(periph.ioctl(handle, IoctlOp::Eject), Ok(IoctlOutput::None));
        assert_eq!(periph.ioctl(handle, IoctlOp::Load), Ok(IoctlOutput::None));
        assert_eq!(
            periph.bus().commands()[2..],
            [
                CommandDescriptor::StartStop {
                    start: false,
                    load_eject: true
                },
                CommandDescriptor::StartStop {
                    start: true,
                    load_eject: true
                }
            ]
        );
    }

    #[test]
    fn media_status_ioctl() {
        let (periph, dev, handle) = ready_engine(None);
        periph.notify_media_changed(dev).unwrap();

        assert_eq!(
            periph.ioctl(handle, IoctlOp::GetMediaStatus),
            Ok(IoctlOutput::MediaStatus(MediaStatus::MediaChangeRequested))
        );
    }

    #[test]
    fn unsupported_cache_flush_is_success() {
        let (periph, dev, _) = ready_engine(None);
        periph
            .bus()
            .push(Reply::sense(SenseKey::IllegalRequest, ASC_ILLEGAL_COMMAND, 0));

        assert_eq!(periph.synchronize_cache(dev), Ok(()));
    }

    #[test]
    fn failed_cache_flush_propagates() {
        let (periph, dev, _) = ready_engine(None);
        periph
            .bus()
            .push(Reply::sense(SenseKey::MediumError, 0x0C, 0));

        assert_eq!(periph.synchronize_cache(dev), Err(ErrorKind::Persistent));
    }
}
