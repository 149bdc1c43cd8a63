//! Engine state: the per-bus engine value and its device/handle registries

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::*;

use crate::bus::{ScsiBus, TargetId};
use crate::error::ErrorKind;
use crate::media::MediaState;
use crate::retry::Tuning;

/// Poison-tolerant lock acquisition; a panicked holder does not take the
/// engine down with it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub type SetCapacityFn = dyn Fn(u32, u64) + Send + Sync;
pub type MediaChangedFn = dyn Fn() + Send + Sync;

/// Callbacks into the owning driver, supplied at registration
#[derive(Default)]
pub struct Callbacks {
    /// Invoked after every successful capacity negotiation with
    /// (block size, capacity in blocks)
    pub set_capacity: Option<Box<SetCapacityFn>>,
    /// Invoked when a medium change is first detected
    pub media_changed: Option<Box<MediaChangedFn>>,
}

/// Per-device registration options
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    pub removable: bool,
    /// Preferred upper bound on blocks per transfer command; `None` issues
    /// transfers as large as the caller asks for
    pub max_transfer_blocks: Option<u32>,
}

/// Mutable per-device state, guarded by the device's own lock
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub(crate) media: MediaState,
    /// Negotiated block size in bytes; 0 until the first successful
    /// capacity negotiation
    pub(crate) block_size: u32,
    pub(crate) capacity_blocks: u64,
}

pub(crate) struct Device {
    pub(crate) target: TargetId,
    pub(crate) removable: bool,
    pub(crate) max_transfer_blocks: Option<u32>,
    pub(crate) callbacks: Callbacks,
    pub(crate) state: Mutex<DeviceState>,
}

pub(crate) struct Handle {
    pub(crate) device: Arc<Device>,
    /// Latch for the single-outstanding-request rule
    pub(crate) busy: AtomicBool,
}

/// Registry id of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

/// Registry id of an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u32);

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Index arena with generation-tagged ids; a stale id never aliases a
/// reused slot
struct Arena<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn id(index: u16, generation: u16) -> u32 {
        (u32::from(generation) << 16) | u32::from(index)
    }

    fn split(id: u32) -> (usize, u16) {
        ((id & 0xFFFF) as usize, (id >> 16) as u16)
    }

    fn insert(&mut self, value: T) -> Option<u32> {
        if let Some(index) = self.slots.iter().position(|slot| slot.value.is_none()) {
            let slot = &mut self.slots[index];
            slot.value = Some(value);
            Some(Self::id(index as u16, slot.generation))
        } else if self.slots.len() <= usize::from(u16::MAX) {
            let index = self.slots.len() as u16;
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            Some(Self::id(index, 0))
        } else {
            None
        }
    }

    fn get(&self, id: u32) -> Option<&T> {
        let (index, generation) = Self::split(id);
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    fn remove(&mut self, id: u32) -> Option<T> {
        let (index, generation) = Self::split(id);
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(value)
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}

/// The peripheral engine. One instance serves one bus; devices and handles
/// live inside it, there are no ambient globals.
pub struct Periph<B: ScsiBus> {
    pub(crate) bus: B,
    pub(crate) tuning: Tuning,
    bus_index: u8,
    devices: Mutex<Arena<Arc<Device>>>,
    handles: Mutex<Arena<Arc<Handle>>>,
    request_ids: AtomicU64,
}

impl<B: ScsiBus> Periph<B> {
    pub fn new(bus: B, bus_index: u8, tuning: Tuning) -> Self {
        Self {
            bus,
            tuning,
            bus_index,
            devices: Mutex::new(Arena::new()),
            handles: Mutex::new(Arena::new()),
            request_ids: AtomicU64::new(0),
        }
    }

    /// The bus manager this engine drives
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Registers a device. Block-addressable (non-removable) devices must
    /// supply a `set_capacity` callback.
    pub fn register_device(
        &self,
        target: TargetId,
        callbacks: Callbacks,
        options: DeviceOptions,
    ) -> Result<DeviceId, ErrorKind> {
        if !options.removable && callbacks.set_capacity.is_none() {
            return Err(ErrorKind::InvalidRequest);
        }
        let device = Arc::new(Device {
            target,
            removable: options.removable,
            max_transfer_blocks: options.max_transfer_blocks,
            callbacks,
            state: Mutex::new(DeviceState {
                media: MediaState::Present,
                block_size: 0,
                capacity_blocks: 0,
            }),
        });
        let id = lock(&self.devices)
            .insert(device)
            .ok_or(ErrorKind::NoMemory)?;
        debug!(
            "registered device {} (removable: {})",
            target, options.removable
        );
        Ok(DeviceId(id))
    }

    /// Unregisters a device. The caller must have freed all handles on it
    /// first.
    pub fn unregister_device(&self, id: DeviceId) -> Result<(), ErrorKind> {
        let mut devices = lock(&self.devices);
        let Some(device) = devices.get(id.0) else {
            return Err(ErrorKind::InvalidRequest);
        };
        let live_handles = lock(&self.handles)
            .iter()
            .filter(|handle| Arc::ptr_eq(&handle.device, device))
            .count();
        debug_assert!(live_handles == 0, "device unregistered with open handles");
        if live_handles > 0 {
            return Err(ErrorKind::InvalidRequest);
        }
        let target = device.target;
        devices.remove(id.0);
        debug!("unregistered device {}", target);
        Ok(())
    }

    pub fn handle_open(&self, device: DeviceId) -> Result<HandleId, ErrorKind> {
        let device = self.device(device)?;
        let target = device.target;
        let handle = Arc::new(Handle {
            device,
            busy: AtomicBool::new(false),
        });
        let id = lock(&self.handles)
            .insert(handle)
            .ok_or(ErrorKind::NoMemory)?;
        trace!("opened handle on {}", target);
        Ok(HandleId(id))
    }

    /// Close is a notification, not a release; it may be repeated. The
    /// handle stays valid until [`Self::handle_free`].
    pub fn handle_close(&self, id: HandleId) -> Result<(), ErrorKind> {
        let handle = self.handle(id)?;
        trace!("closed handle on {}", handle.device.target);
        Ok(())
    }

    /// Releases a handle. Exactly once per open; a second free reports
    /// `InvalidRequest`.
    pub fn handle_free(&self, id: HandleId) -> Result<(), ErrorKind> {
        match lock(&self.handles).remove(id.0) {
            Some(handle) => {
                trace!("freed handle on {}", handle.device.target);
                Ok(())
            }
            None => Err(ErrorKind::InvalidRequest),
        }
    }

    /// Composes the device-node name the owning driver publishes under,
    /// e.g. `disk/scsi/0/3/0/raw`.
    pub fn device_name(&self, device: DeviceId, prefix: &str) -> Result<String, ErrorKind> {
        let device = self.device(device)?;
        Ok(format!(
            "{}/{}/{}/{}/raw",
            prefix, self.bus_index, device.target.target, device.target.lun
        ))
    }

    pub(crate) fn device(&self, id: DeviceId) -> Result<Arc<Device>, ErrorKind> {
        lock(&self.devices)
            .get(id.0)
            .cloned()
            .ok_or(ErrorKind::InvalidRequest)
    }

    pub(crate) fn handle(&self, id: HandleId) -> Result<Arc<Handle>, ErrorKind> {
        lock(&self.handles)
            .get(id.0)
            .cloned()
            .ok_or(ErrorKind::InvalidRequest)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }
}
