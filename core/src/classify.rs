//! Completion classification into retry actions.
//!
//! Everything here is a pure function of the completion; side effects
//! (media state transitions, device-gone marking) belong to the executor.

use crate::bus::{Completion, DeviceStatus, TransportStatus};
use crate::sense::{
    ASC_LUN_NOT_READY, ASC_MEDIUM_CHANGED, ASC_RESET, ASCQ_BECOMING_READY,
    ASCQ_INIT_COMMAND_REQUIRED, SenseData, SenseKey,
};

/// Abstract retry class of one completed command attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum RetryAction {
    /// The command succeeded
    Ok,
    /// Worth a small number of immediate reissues
    Retry,
    /// Worth a larger number of delayed reissues
    ManyRetries,
    /// Not worth reissuing
    Fail,
    /// The unit wants a START UNIT before it will cooperate
    NeedsStart,
    /// The device rejected the command as illegal
    InvalidRequest,
}

/// Classifier output. A medium change is not a retry class; it aborts the
/// command sequence through its own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Action(RetryAction),
    MediaChanged,
}

/// Classifies one completion. `removable` widens the set of conditions
/// read as a possible medium change.
pub fn classify(completion: &Completion, removable: bool) -> Verdict {
    use TransportStatus::*;

    match completion.transport {
        Completed => classify_device_status(completion, removable),
        SelectionTimeout => Verdict::Action(RetryAction::Fail),
        CommandTimeout | BusReset | ParityError | Aborted => Verdict::Action(RetryAction::Retry),
        ControllerError => Verdict::Action(RetryAction::ManyRetries),
    }
}

fn classify_device_status(completion: &Completion, removable: bool) -> Verdict {
    use DeviceStatus::*;

    match completion.device_status_decoded() {
        Some(Good | ConditionMet) => Verdict::Action(RetryAction::Ok),
        Some(CheckCondition) => match completion.sense {
            Some(sense) => classify_sense(&sense, removable),
            // Check condition without sense data leaves nothing to go on
            None => Verdict::Action(RetryAction::Fail),
        },
        Some(Busy | TaskSetFull) => Verdict::Action(RetryAction::ManyRetries),
        Some(TaskAborted) => Verdict::Action(RetryAction::Retry),
        Some(ReservationConflict | AcaActive) | None => Verdict::Action(RetryAction::Fail),
    }
}

fn classify_sense(sense: &SenseData, removable: bool) -> Verdict {
    use RetryAction::*;

    let action = match sense.sense_key() {
        Some(SenseKey::NoSense | SenseKey::RecoveredError | SenseKey::Completed) => Ok,
        Some(SenseKey::NotReady) => match (sense.asc, sense.ascq) {
            (ASC_LUN_NOT_READY, ASCQ_BECOMING_READY | ASCQ_INIT_COMMAND_REQUIRED) => NeedsStart,
            // No medium, manual intervention, or an unknown variety of
            // not-ready: retrying gets us nowhere
            _ => Fail,
        },
        Some(SenseKey::HardwareError) => ManyRetries,
        Some(SenseKey::UnitAttention) => match sense.asc {
            ASC_MEDIUM_CHANGED => return Verdict::MediaChanged,
            // After power-on or reset a removable medium may have been
            // swapped while we were not looking
            ASC_RESET if removable => return Verdict::MediaChanged,
            // Any other unit attention is acknowledged by one reissue
            _ => Retry,
        },
        Some(SenseKey::AbortedCommand) => Retry,
        Some(SenseKey::IllegalRequest) => InvalidRequest,
        Some(
            SenseKey::MediumError
            | SenseKey::DataProtect
            | SenseKey::BlankCheck
            | SenseKey::VendorSpecific
            | SenseKey::CopyAborted
            | SenseKey::Equal
            | SenseKey::VolumeOverflow
            | SenseKey::Miscompare,
        )
        | None => Fail,
    };
    Verdict::Action(action)
}
