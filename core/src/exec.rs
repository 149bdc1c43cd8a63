//! Command execution: the retry loop around the bus manager

use std::thread;

use log::*;

use crate::bus::{CommandDescriptor, DataXfer, ScsiBus, TransportStatus};
use crate::classify::{RetryAction, Verdict, classify};
use crate::device::{Device, DeviceId, Periph};
use crate::error::ErrorKind;
use crate::retry::{AttemptCounters, Step, next_step};

/// Terminal outcome of one command sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Success; bytes moved in the data phase
    Done(usize),
    /// A medium change surfaced. The command did not complete and the
    /// device is gated until the change is confirmed.
    MediaChangeDetected,
}

impl<B: ScsiBus> Periph<B> {
    /// Drives one command to a terminal outcome, absorbing retryable
    /// conditions along the way. Takes semantically described commands and
    /// raw CDBs alike.
    pub fn execute(
        &self,
        device: DeviceId,
        cmd: &CommandDescriptor,
        data: DataXfer<'_>,
    ) -> Result<CommandOutcome, ErrorKind> {
        let device = self.device(device)?;
        self.execute_on(&device, cmd, data)
    }

    pub(crate) fn execute_on(
        &self,
        device: &Device,
        cmd: &CommandDescriptor,
        mut data: DataXfer<'_>,
    ) -> Result<CommandOutcome, ErrorKind> {
        let req = self.next_request_id();
        let mut counters = AttemptCounters::default();
        loop {
            let completion = self.bus.submit(device.target, cmd, data.reborrow());
            let verdict = classify(&completion, device.removable);
            trace!(
                "req {}: {} on {} -> {:?}",
                req,
                <&'static str>::from(cmd),
                device.target,
                verdict
            );
            match verdict {
                Verdict::Action(RetryAction::Ok) => {
                    return Ok(CommandOutcome::Done(completion.transferred));
                }
                Verdict::MediaChanged => {
                    self.note_media_change(device);
                    return Ok(CommandOutcome::MediaChangeDetected);
                }
                Verdict::Action(action) => {
                    if completion.transport == TransportStatus::SelectionTimeout {
                        self.mark_absent(device);
                    }
                    match next_step(action, &mut counters, &self.tuning) {
                        Step::Continue(delay) => {
                            debug!(
                                "req {}: {:?}, reissuing ({}+{} attempts)",
                                req, action, counters.retries, counters.many_retries
                            );
                            if !delay.is_zero() {
                                thread::sleep(delay);
                            }
                        }
                        Step::Escalate => {
                            debug!("req {}: starting unit on {}", req, device.target);
                            self.run_start_unit(device, req);
                        }
                        Step::GiveUp(kind) => {
                            let sense = completion
                                .sense
                                .map_or_else(String::new, |s| format!(" (sense {s})"));
                            warn!(
                                "req {}: {} on {} failed: {}{}",
                                req,
                                <&'static str>::from(cmd),
                                device.target,
                                kind,
                                sense
                            );
                            return Err(kind);
                        }
                    }
                }
            }
        }
    }

    /// One plain start-unit submission. Classified for bookkeeping but
    /// never itself escalated or retried.
    fn run_start_unit(&self, device: &Device, req: u64) {
        let start = CommandDescriptor::StartStop {
            start: true,
            load_eject: false,
        };
        let completion = self.bus.submit(device.target, &start, DataXfer::None);
        match classify(&completion, device.removable) {
            Verdict::MediaChanged => self.note_media_change(device),
            Verdict::Action(action) => {
                trace!("req {}: start unit -> {:?}", req, action);
            }
        }
    }
}
