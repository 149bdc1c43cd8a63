//! Removable-media lifecycle tracking

use std::thread;

use log::*;

use crate::bus::{CommandDescriptor, DataXfer, ScsiBus};
use crate::device::{Device, DeviceId, HandleId, Periph, lock};
use crate::error::ErrorKind;
use crate::exec::CommandOutcome;

/// Media lifecycle of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum MediaState {
    /// A usable medium is assumed present
    Present,
    /// A change was detected; ordinary I/O is refused until the new medium
    /// is confirmed by a successful capacity negotiation
    ChangePending,
    /// The device itself stopped answering; terminal until re-registration
    Absent,
}

/// Result of a media-status query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStatus {
    Ready,
    MediaChangeRequested,
    /// Not usable right now, for the given reason
    Pending(ErrorKind),
}

impl Device {
    /// Non-blocking gate consulted before ordinary I/O touches the bus
    pub(crate) fn media_gate(&self) -> MediaStatus {
        match lock(&self.state).media {
            MediaState::Present => MediaStatus::Ready,
            MediaState::ChangePending => MediaStatus::MediaChangeRequested,
            MediaState::Absent => MediaStatus::Pending(ErrorKind::Persistent),
        }
    }
}

impl<B: ScsiBus> Periph<B> {
    /// Reports a medium change observed out of band (interrupt, poll).
    /// The engine's own classification path feeds into the same transition.
    pub fn notify_media_changed(&self, device: DeviceId) -> Result<(), ErrorKind> {
        let device = self.device(device)?;
        self.note_media_change(&device);
        Ok(())
    }

    /// Transitions Present -> ChangePending; the driver callback fires on
    /// that edge only
    pub(crate) fn note_media_change(&self, device: &Device) {
        let transitioned = {
            let mut state = lock(&device.state);
            if state.media == MediaState::Present {
                state.media = MediaState::ChangePending;
                true
            } else {
                false
            }
        };
        if transitioned {
            debug!("{}: media change pending", device.target);
            if let Some(cb) = &device.callbacks.media_changed {
                cb();
            }
        }
    }

    /// The device stopped answering selection
    pub(crate) fn mark_absent(&self, device: &Device) {
        let mut state = lock(&device.state);
        if state.media != MediaState::Absent {
            error!("{}: device gone", device.target);
            state.media = MediaState::Absent;
        }
    }

    /// Confirms the present medium after a successful capacity negotiation
    pub(crate) fn clear_media_change(&self, device: &Device) {
        let mut state = lock(&device.state);
        if state.media == MediaState::ChangePending {
            debug!("{}: media change cleared", device.target);
            state.media = MediaState::Present;
        }
    }

    /// Polls the unit until it is ready, a media change surfaces, or the
    /// poll budget runs out. Sleeps with doubling backoff between polls.
    pub(crate) fn wait_for_ready(&self, device: &Device) -> MediaStatus {
        let mut delay = self.tuning.ready_poll_initial;
        for attempt in 0..self.tuning.ready_poll_limit {
            match self.execute_on(device, &CommandDescriptor::TestUnitReady, DataXfer::None) {
                Ok(CommandOutcome::Done(_)) => return MediaStatus::Ready,
                Ok(CommandOutcome::MediaChangeDetected) => {
                    return MediaStatus::MediaChangeRequested;
                }
                Err(ErrorKind::Transient) => {
                    trace!("{}: not ready (poll {})", device.target, attempt);
                    if attempt + 1 == self.tuning.ready_poll_limit {
                        break;
                    }
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    delay = (delay * 2).min(self.tuning.ready_poll_max);
                }
                Err(kind) => return MediaStatus::Pending(kind),
            }
        }
        MediaStatus::Pending(ErrorKind::Transient)
    }

    /// Blocking media-status query backing the get-media-status ioctl.
    /// A pending change is reported without touching the bus.
    pub fn media_status(&self, handle: HandleId) -> Result<MediaStatus, ErrorKind> {
        let handle = self.handle(handle)?;
        match handle.device.media_gate() {
            MediaStatus::Ready => Ok(self.wait_for_ready(&handle.device)),
            other => Ok(other),
        }
    }
}
