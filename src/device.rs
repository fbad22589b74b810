// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug};
use std::sync::{Arc, MutexGuard};

use log::{debug, error, warn};

use crate::config::AttachFlags;
use crate::context::IommuFd;
use crate::error::{Error, ErrorKind, Result};
use crate::hwpt::{Change, HwPageTable};
use crate::ioas::{Ioas, IoasInner};
use crate::iommu::{Capability, GroupId, PhysDevice, Platform, UnitId};
use crate::object::{Object, ObjectId};
use crate::pasid::{Outcome, Pasid, PasidTable};
use crate::refcount::RefCount;
use crate::sync::Mutex;

/* ---------------------------------------------------------------------------------------------- */

/// A physical device bound to an [`IommuFd`] context, which owns its DMA until unbound.
pub struct Device {
    id: ObjectId,
    phys: PhysDevice,
    group: GroupId,
    unit: UnitId,
    enforce_cache_coherency: bool,
    pasid_capable: bool,
    /// The binder's reference plus one while the default context is attached.
    users: RefCount,
    /// The default-context hwpt.
    hwpt: Mutex<Option<Arc<HwPageTable>>>,
    pasids: PasidTable,
    /// Serializes attach, replace, and detach of this device's default context and PASIDs.
    change: Mutex<()>,
}

impl Device {
    fn new(id: ObjectId, phys: PhysDevice, group: GroupId, platform: &dyn Platform) -> Device {
        let unit = platform.unit_of(phys);

        Device {
            id,
            phys,
            group,
            unit,
            enforce_cache_coherency: platform
                .device_supports(phys, Capability::EnforceCacheCoherency),
            pasid_capable: platform.unit_supports_pasid(unit),
            users: RefCount::new(1),
            hwpt: Mutex::new(None),
            pasids: PasidTable::default(),
            change: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn phys(&self) -> PhysDevice {
        self.phys
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Whether this device needs no-snoop DMA blocked by whatever domain it is attached to.
    pub fn enforce_cache_coherency(&self) -> bool {
        self.enforce_cache_coherency
    }

    pub fn pasid_capable(&self) -> bool {
        self.pasid_capable
    }

    pub fn users(&self) -> u32 {
        self.users.get()
    }

    /// The id of the hwpt the default context is attached to.
    pub fn hwpt_id(&self) -> Option<ObjectId> {
        self.hwpt.lock().as_ref().map(|hwpt| hwpt.id())
    }

    /// Whether no-snoop DMA is currently blocked for this device's default context.
    ///
    /// Only meaningful while attached; racing this with attach or detach of the same device gives
    /// a stale answer.
    pub fn enforced_coherent(&self) -> Result<bool> {
        match self.hwpt.lock().as_ref() {
            Some(hwpt) => Ok(hwpt.enforces_cache_coherency()),
            None => Err(Error::NotAttached {
                device: self.id,
                pasid: Pasid::NONE,
            }),
        }
    }

    pub(crate) fn refs(&self) -> &RefCount {
        &self.users
    }

    pub(crate) fn pasid_table(&self) -> &PasidTable {
        &self.pasids
    }

    pub(crate) fn change_lock(&self) -> MutexGuard<()> {
        self.change.lock()
    }

    /* ------------------------------------------------------------------------------------------ */

    pub(crate) fn slot_load(&self, pasid: Pasid) -> Option<Arc<HwPageTable>> {
        if pasid.is_none() {
            self.hwpt.lock().clone()
        } else {
            self.pasids.load(pasid)
        }
    }

    /// Fills an empty slot. Returns the occupant if there is one.
    pub(crate) fn slot_insert(
        &self,
        pasid: Pasid,
        hwpt: Arc<HwPageTable>,
    ) -> std::result::Result<(), Arc<HwPageTable>> {
        if !pasid.is_none() {
            return self.pasids.compare_exchange_absent(pasid, hwpt);
        }

        let mut slot = self.hwpt.lock();
        match slot.as_ref() {
            Some(current) => Err(Arc::clone(current)),
            None => {
                *slot = Some(hwpt);
                Ok(())
            }
        }
    }

    pub(crate) fn slot_store(
        &self,
        pasid: Pasid,
        hwpt: Arc<HwPageTable>,
    ) -> Option<Arc<HwPageTable>> {
        if pasid.is_none() {
            self.hwpt.lock().replace(hwpt)
        } else {
            self.pasids.store(pasid, hwpt)
        }
    }

    pub(crate) fn slot_take(&self, pasid: Pasid) -> Option<Arc<HwPageTable>> {
        if pasid.is_none() {
            self.hwpt.lock().take()
        } else {
            self.pasids.erase(pasid)
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Attaches or replaces the `pasid` slot onto `pt_id`, which may name a hwpt or an IOAS to pick
    /// an auto-domain from. Returns the hwpt now in use and whether the slot was previously empty.
    pub(crate) fn change_pt(
        self: &Arc<Self>,
        ictx: &IommuFd,
        pasid: Pasid,
        pt_id: ObjectId,
        change: Change,
        flags: AttachFlags,
    ) -> Result<(Arc<HwPageTable>, bool)> {
        let _change = self.change_lock();

        if change == Change::Replace && self.slot_load(pasid).is_none() {
            return Err(Error::ReplaceWithoutAttach {
                device: self.id,
                pasid,
            });
        }

        let (hwpt, outcome) = match ictx.objects().get(pt_id)? {
            Object::Hwpt(hwpt) => {
                let outcome = self.change_slot(ictx, &hwpt, None, pasid, change, flags)?;
                (hwpt, outcome)
            }
            Object::Ioas(ioas) => self.auto_domain(ictx, &ioas, pasid, change, flags)?,
            Object::Device(_) => return Err(Error::WrongObjectType(pt_id, "ioas or hwpt")),
        };

        let attached = matches!(outcome, Outcome::Attached);
        if let Outcome::Replaced(old) = outcome {
            old.detach(self, pasid, false);
            ictx.hwpt_put(old);
        }

        Ok((hwpt, attached))
    }

    fn change_slot(
        self: &Arc<Self>,
        ictx: &IommuFd,
        hwpt: &Arc<HwPageTable>,
        space: Option<&mut IoasInner>,
        pasid: Pasid,
        change: Change,
        flags: AttachFlags,
    ) -> Result<Outcome> {
        match change {
            Change::Attach => self.slot_attach(ictx, hwpt, space, pasid, flags),
            Change::Replace => self.slot_replace(ictx, hwpt, space, pasid, flags),
        }
    }

    /// Uses the first auto-domain of `ioas` that can take this device, or allocates a new one.
    ///
    /// Auto-domains carry nothing user space can tell apart, so any compatible one will do.
    fn auto_domain(
        self: &Arc<Self>,
        ictx: &IommuFd,
        ioas: &Arc<Ioas>,
        pasid: Pasid,
        change: Change,
        flags: AttachFlags,
    ) -> Result<(Arc<HwPageTable>, Outcome)> {
        let mut space = ioas.lock();

        for hwpt in space.auto_hwpts() {
            // Being destroyed concurrently.
            if !hwpt.refs().inc_not_zero() {
                continue;
            }

            let result = self.change_slot(ictx, &hwpt, Some(&mut *space), pasid, change, flags);
            ictx.hwpt_put(Arc::clone(&hwpt));

            match result {
                Ok(outcome) => return Ok((hwpt, outcome)),
                Err(e) if e.kind() == ErrorKind::InvalidArgument => {
                    warn!("auto-domain hwpt {} rejected {}: {}", hwpt.id(), self.id, e);
                }
                Err(e) => return Err(e),
            }
        }

        let hwpt = ictx.alloc_paging_hwpt(ioas, self, true)?;

        // On failure the attempt dropped the only reference, which destroyed the new hwpt.
        let outcome = self.change_slot(ictx, &hwpt, Some(&mut *space), pasid, change, flags)?;

        ictx.objects()
            .finalize(hwpt.id(), Object::Hwpt(Arc::clone(&hwpt)));
        debug!("allocated auto-domain hwpt {} for {}", hwpt.id(), self.id);

        Ok((hwpt, outcome))
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("phys", &self.phys)
            .field("group", &self.group)
            .field("unit", &self.unit)
            .field("users", &self.users.get())
            .finish_non_exhaustive()
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl IommuFd {
    /// Takes exclusive DMA ownership of `phys` and makes it addressable by the returned id.
    pub fn bind(&self, phys: PhysDevice) -> Result<Arc<Device>> {
        let platform = self.platform();

        if !platform.device_supports(phys, Capability::CacheCoherency) {
            return Err(Error::NoCacheCoherency(phys));
        }

        let group = platform.group_of(phys).ok_or(Error::NoGroup(phys))?;
        platform.claim_exclusive(phys, group)?;

        let id = match self.objects().reserve() {
            Ok(id) => id,
            Err(e) => {
                platform.release(phys, group);
                return Err(e);
            }
        };

        let device = Arc::new(Device::new(id, phys, group, &**platform));
        self.objects()
            .finalize(id, Object::Device(Arc::clone(&device)));

        debug!("bound {:?} as {}", phys, id);
        Ok(device)
    }

    /// Gives up ownership of the device. The default context must be detached first; PASIDs that
    /// are still attached are detached here.
    pub fn unbind(&self, device: &Arc<Device>) -> Result<()> {
        {
            let _change = device.change_lock();

            if device.slot_load(Pasid::NONE).is_some() {
                return Err(Error::ObjectInUse(device.id()));
            }

            for pasid in device.pasid_table().pasids() {
                warn!("unbinding {} with {} still attached", device.id(), pasid);
                device.slot_detach(self, pasid)?;
            }
        }

        self.objects().remove(device.id())?;

        if device.refs().dec() {
            self.platform().release(device.phys(), device.group());
            debug!("unbound {:?} ({})", device.phys(), device.id());
        } else {
            error!(
                "{} unbound with {} references left",
                device.id(),
                device.users()
            );
        }

        Ok(())
    }

    /// Attaches the default context of `device` to the hwpt `pt_id`, or to an auto-domain of the
    /// IOAS `pt_id`. Returns the id of the hwpt in use.
    pub fn device_attach(&self, device: &Arc<Device>, pt_id: ObjectId) -> Result<ObjectId> {
        self.device_attach_with_flags(device, pt_id, AttachFlags::empty())
    }

    /// Like [`IommuFd::device_attach`], with `flags` on top of those the configuration implies.
    pub fn device_attach_with_flags(
        &self,
        device: &Arc<Device>,
        pt_id: ObjectId,
        flags: AttachFlags,
    ) -> Result<ObjectId> {
        let flags = self.attach_flags(flags);
        let (hwpt, attached) =
            device.change_pt(self, Pasid::NONE, pt_id, Change::Attach, flags)?;

        if attached {
            device.refs().inc();
        }

        Ok(hwpt.id())
    }

    /// Moves the attached default context of `device` onto `pt_id` without blocking DMA in between.
    pub fn device_replace(&self, device: &Arc<Device>, pt_id: ObjectId) -> Result<ObjectId> {
        self.device_replace_with_flags(device, pt_id, AttachFlags::empty())
    }

    pub fn device_replace_with_flags(
        &self,
        device: &Arc<Device>,
        pt_id: ObjectId,
        flags: AttachFlags,
    ) -> Result<ObjectId> {
        let flags = self.attach_flags(flags);
        let (hwpt, _) = device.change_pt(self, Pasid::NONE, pt_id, Change::Replace, flags)?;

        Ok(hwpt.id())
    }

    pub fn device_detach(&self, device: &Arc<Device>) -> Result<()> {
        {
            let _change = device.change_lock();
            device.slot_detach(self, Pasid::NONE)?;
        }

        device.refs().dec();
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
