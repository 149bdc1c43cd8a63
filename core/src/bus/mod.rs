//! Bus-manager seam: command descriptors, data phases and completions

pub mod scriptbus;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::sense::SenseData;

/// Address of a logical unit on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId {
    pub target: u8,
    pub lun: u8,
}

impl TargetId {
    pub fn new(target: u8, lun: u8) -> Self {
        Self { target, lun }
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target, self.lun)
    }
}

/// One command, described semantically. The transport owns the wire-level
/// CDB encoding (and the choice of 6/10/16-byte forms where it applies).
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
pub enum CommandDescriptor {
    TestUnitReady,
    ReadCapacity10,
    ReadCapacity16,
    Read { lba: u64, blocks: u32 },
    Write { lba: u64, blocks: u32 },
    StartStop { start: bool, load_eject: bool },
    SynchronizeCache,
    /// Caller-built CDB passed through unmodified
    Raw { cdb: [u8; 16], cdb_len: u8 },
}

impl CommandDescriptor {
    /// Wraps a raw CDB of up to 16 bytes. Returns `None` for empty or
    /// oversized slices.
    pub fn raw(cdb: &[u8]) -> Option<Self> {
        if cdb.is_empty() || cdb.len() > 16 {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes[..cdb.len()].copy_from_slice(cdb);
        Some(Self::Raw {
            cdb: bytes,
            cdb_len: cdb.len() as u8,
        })
    }
}

/// Data phase of one command, from the initiator's point of view
pub enum DataXfer<'a> {
    /// No data phase
    None,
    /// Device to initiator
    In(&'a mut [u8]),
    /// Initiator to device
    Out(&'a [u8]),
}

impl DataXfer<'_> {
    /// Reborrows the buffers for one attempt of a possibly retried command
    pub fn reborrow(&mut self) -> DataXfer<'_> {
        match self {
            Self::None => DataXfer::None,
            Self::In(buf) => DataXfer::In(&mut **buf),
            Self::Out(buf) => DataXfer::Out(*buf),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the transport itself fared with a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum TransportStatus {
    /// The command reached the device and a status phase completed;
    /// consult the device status
    Completed,
    /// Nobody answered at the target address
    SelectionTimeout,
    /// The device accepted the command but never finished it
    CommandTimeout,
    /// A bus reset interrupted the command
    BusReset,
    /// Parity or similar low-level transfer error
    ParityError,
    /// The transport aborted the command
    Aborted,
    /// Host adapter failure
    ControllerError,
}

/// Device status byte values (SAM)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum::IntoStaticStr)]
pub enum DeviceStatus {
    Good = 0x00,
    CheckCondition = 0x02,
    ConditionMet = 0x04,
    Busy = 0x08,
    ReservationConflict = 0x18,
    TaskSetFull = 0x28,
    AcaActive = 0x30,
    TaskAborted = 0x40,
}

/// Completion of one submitted command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub transport: TransportStatus,
    /// Raw device status byte; only meaningful when the transport completed
    pub status: u8,
    /// Autosense data, where the transport captured it
    pub sense: Option<SenseData>,
    /// Bytes moved in the data phase
    pub transferred: usize,
}

impl Completion {
    pub fn good(transferred: usize) -> Self {
        Self {
            transport: TransportStatus::Completed,
            status: DeviceStatus::Good as u8,
            sense: None,
            transferred,
        }
    }

    pub fn check_condition(sense: SenseData) -> Self {
        Self {
            transport: TransportStatus::Completed,
            status: DeviceStatus::CheckCondition as u8,
            sense: Some(sense),
            transferred: 0,
        }
    }

    pub fn device_status(status: DeviceStatus) -> Self {
        Self {
            transport: TransportStatus::Completed,
            status: status as u8,
            sense: None,
            transferred: 0,
        }
    }

    pub fn transport_error(transport: TransportStatus) -> Self {
        Self {
            transport,
            status: 0,
            sense: None,
            transferred: 0,
        }
    }

    /// Decoded device status, if the raw byte is a known value
    pub fn device_status_decoded(&self) -> Option<DeviceStatus> {
        DeviceStatus::from_u8(self.status)
    }
}

/// Bus-manager interface the engine drives commands through.
///
/// One call per attempt; blocks the calling thread until the transport
/// resolves the command one way or the other. Implementations serialize
/// internally as needed.
pub trait ScsiBus: Send + Sync {
    fn submit(&self, target: TargetId, cmd: &CommandDescriptor, data: DataXfer<'_>) -> Completion;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_descriptor_bounds() {
        assert_eq!(CommandDescriptor::raw(&[]), None);
        assert_eq!(CommandDescriptor::raw(&[0u8; 17]), None);

        let Some(CommandDescriptor::Raw { cdb, cdb_len }) = CommandDescriptor::raw(&[0x12, 0, 0, 0, 36, 0]) else {
            panic!("expected raw descriptor");
        };
        assert_eq!(cdb_len, 6);
        assert_eq!(&cdb[..6], &[0x12, 0, 0, 0, 36, 0]);
        assert_eq!(&cdb[6..], &[0u8; 10]);
    }

    #[test]
    fn reborrow_keeps_buffer_contents() {
        let mut buf = [0u8; 4];
        let mut xfer = DataXfer::In(&mut buf);
        {
            let DataXfer::In(inner) = xfer.reborrow() else {
                panic!("expected In");
            };
            inner.copy_from_slice(&[1, 2, 3, 4]);
        }
        assert_eq!(xfer.len(), 4);
        assert!(!xfer.is_empty());
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn device_status_decoding() {
        assert_eq!(
            Completion::device_status(DeviceStatus::Busy).device_status_decoded(),
            Some(DeviceStatus::Busy)
        );
        let odd = Completion {
            transport: TransportStatus::Completed,
            status: 0x55,
            sense: None,
            transferred: 0,
        };
        assert_eq!(odd.device_status_decoded(), None);
    }
}
