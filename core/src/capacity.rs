use log::*;

use crate::bus::{CommandDescriptor, DataXfer, ScsiBus, TargetId};
use crate::device::{Device, DeviceId, Periph, lock};
use crate::error::ErrorKind;
use crate::exec::CommandOutcome;
use crate::media::MediaStatus;

/// Largest block size accepted before the device's answer is treated as
/// garbage
const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

enum Negotiation {
    Done { block_size: u32, blocks: u64 },
    Restart,
}

impl<B: ScsiBus> Periph<B> {
    /// Queries the device for block size and capacity, stores both in the
    /// device record, reports them through the `set_capacity` callback and
    /// confirms a pending media change.
    ///
    /// Restarts once if the medium changes mid-query, so the values
    /// reported belong to the medium present at the end.
    pub fn check_capacity(&self, device: DeviceId) -> Result<(u32, u64), ErrorKind> {
        let device = self.device(device)?;
        for _ in 0..2 {
            match self.negotiate(&device)? {
                Negotiation::Done { block_size, blocks } => {
                    {
                        let mut state = lock(&device.state);
                        state.block_size = block_size;
                        state.capacity_blocks = blocks;
                    }
                    self.clear_media_change(&device);
                    if let Some(cb) = &device.callbacks.set_capacity {
                        cb(block_size, blocks);
                    }
                    debug!(
                        "{}: {} blocks of {} bytes",
                        device.target, blocks, block_size
                    );
                    return Ok((block_size, blocks));
                }
                Negotiation::Restart => (),
            }
        }
        Err(ErrorKind::MediaChanged)
    }

    fn negotiate(&self, device: &Device) -> Result<Negotiation, ErrorKind> {
        // An absent device stays absent until re-registration; no probing
        if let MediaStatus::Pending(kind) = device.media_gate() {
            return Err(kind);
        }
        match self.wait_for_ready(device) {
            // A pending change does not stop the negotiator; confirming
            // the new medium is what this query is for
            MediaStatus::Ready | MediaStatus::MediaChangeRequested => (),
            MediaStatus::Pending(kind) => return Err(kind),
        }

        let mut data = [0u8; 8];
        let outcome = self.execute_on(
            device,
            &CommandDescriptor::ReadCapacity10,
            DataXfer::In(&mut data),
        )?;
        let (last_lba, mut block_size) = match outcome {
            CommandOutcome::MediaChangeDetected => return Ok(Negotiation::Restart),
            CommandOutcome::Done(n) => match parse_capacity10(&data[..n.min(data.len())]) {
                Some(parsed) => parsed,
                None => {
                    warn!("{}: short READ CAPACITY(10) response", device.target);
                    return Err(ErrorKind::ProtocolViolation);
                }
            },
        };

        let mut blocks = u64::from(last_lba) + 1;
        if last_lba == u32::MAX {
            // The 32-bit address space saturated; ask again with the
            // 16-byte form
            let mut data = [0u8; 32];
            let outcome = self.execute_on(
                device,
                &CommandDescriptor::ReadCapacity16,
                DataXfer::In(&mut data),
            )?;
            (blocks, block_size) = match outcome {
                CommandOutcome::MediaChangeDetected => return Ok(Negotiation::Restart),
                CommandOutcome::Done(n) => match parse_capacity16(&data[..n.min(data.len())]) {
                    Some((last_lba, block_size)) => match last_lba.checked_add(1) {
                        Some(blocks) => (blocks, block_size),
                        None => {
                            warn!("{}: absurd READ CAPACITY(16) address", device.target);
                            return Err(ErrorKind::ProtocolViolation);
                        }
                    },
                    None => {
                        warn!("{}: short READ CAPACITY(16) response", device.target);
                        return Err(ErrorKind::ProtocolViolation);
                    }
                },
            };
        }

        validate_block_size(device.target, block_size)?;
        Ok(Negotiation::Done { block_size, blocks })
    }
}

fn parse_capacity10(data: &[u8]) -> Option<(u32, u32)> {
    let last_lba = u32::from_be_bytes(data.get(0..4)?.try_into().ok()?);
    let block_size = u32::from_be_bytes(data.get(4..8)?.try_into().ok()?);
    Some((last_lba, block_size))
}

fn parse_capacity16(data: &[u8]) -> Option<(u64, u32)> {
    let last_lba = u64::from_be_bytes(data.get(0..8)?.try_into().ok()?);
    let block_size = u32::from_be_bytes(data.get(8..12)?.try_into().ok()?);
    Some((last_lba, block_size))
}

fn validate_block_size(target: TargetId, block_size: u32) -> Result<(), ErrorKind> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        warn!("{}: unusable block size {}", target, block_size);
        return Err(ErrorKind::ProtocolViolation);
    }
    if !block_size.is_power_of_two() {
        // Raw CD frames and similar oddities exist; accepted, but worth a
        // note in the log
        warn!("{}: block size {} is not a power of two", target, block_size);
    }
    Ok(())
}
