// SPDX-License-Identifier: MIT OR Apache-2.0

//! PASID-scoped attachment.
//!
//! Every `{device, pasid}` pair is either unattached or attached to exactly one hwpt:
//!
//! ```text
//!               attach                 replace
//!  Unattached ---------> Attached(a) ----------> Attached(b)
//!       ^                    |
//!       +------ detach ------+
//! ```
//!
//! The slot update is a compare-and-swap (attach) or a swap with rollback (replace) on the
//! device's [`PasidTable`], so the table always says which hwpt the hardware is using, and a failed
//! replace leaves both the table and the hardware exactly as they were.
//!
//! The same two primitives also drive the default context ([`Pasid::NONE`]), which is kept in the
//! device's own slot rather than in the table.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use log::{debug, error};

use crate::config::AttachFlags;
use crate::context::IommuFd;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::hwpt::{Change, HwPageTable};
use crate::ioas::IoasInner;
use crate::object::ObjectId;
use crate::sync::Mutex;

/* ---------------------------------------------------------------------------------------------- */

/// A process address space id. [`Pasid::NONE`] is the device's default (RID) context.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pasid(pub u32);

impl Pasid {
    pub const NONE: Pasid = Pasid(0);

    pub fn is_none(self) -> bool {
        self == Pasid::NONE
    }
}

impl Display for Pasid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "the default context")
        } else {
            write!(f, "pasid {}", self.0)
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Maps each attached PASID of one device to the hwpt it holds a reference on.
#[derive(Debug, Default)]
pub struct PasidTable {
    entries: Mutex<BTreeMap<Pasid, Arc<HwPageTable>>>,
}

impl PasidTable {
    pub fn load(&self, pasid: Pasid) -> Option<Arc<HwPageTable>> {
        self.entries.lock().get(&pasid).cloned()
    }

    /// Inserts `hwpt` only if the slot is empty; otherwise returns the current occupant.
    pub fn compare_exchange_absent(
        &self,
        pasid: Pasid,
        hwpt: Arc<HwPageTable>,
    ) -> std::result::Result<(), Arc<HwPageTable>> {
        let mut entries = self.entries.lock();

        match entries.get(&pasid) {
            Some(current) => Err(Arc::clone(current)),
            None => {
                entries.insert(pasid, hwpt);
                Ok(())
            }
        }
    }

    /// Unconditionally stores `hwpt`, returning the previous occupant.
    pub fn store(&self, pasid: Pasid, hwpt: Arc<HwPageTable>) -> Option<Arc<HwPageTable>> {
        self.entries.lock().insert(pasid, hwpt)
    }

    pub fn erase(&self, pasid: Pasid) -> Option<Arc<HwPageTable>> {
        self.entries.lock().remove(&pasid)
    }

    pub fn pasids(&self) -> Vec<Pasid> {
        self.entries.lock().keys().copied().collect()
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// What a successful slot change did.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The slot was empty and now holds the hwpt.
    Attached,
    /// The slot already held this very hwpt.
    Unchanged,
    /// The slot moved off this hwpt. Its reference now belongs to the caller, which must finish
    /// the old side's bookkeeping and release it.
    Replaced(Arc<HwPageTable>),
}

impl Device {
    /// `space` is the locked address space of `hwpt` if the caller already holds it.
    pub(crate) fn slot_attach(
        self: &Arc<Self>,
        ictx: &IommuFd,
        hwpt: &Arc<HwPageTable>,
        space: Option<&mut IoasInner>,
        pasid: Pasid,
        flags: AttachFlags,
    ) -> Result<Outcome> {
        if !hwpt.refs().inc_not_zero() {
            return Err(Error::NoSuchObject(hwpt.id()));
        }

        if let Err(current) = self.slot_insert(pasid, Arc::clone(hwpt)) {
            if Arc::ptr_eq(&current, hwpt) {
                hwpt.refs().dec();
                return Ok(Outcome::Unchanged);
            }
            ictx.hwpt_put(Arc::clone(hwpt));
            return Err(Error::PasidInUse {
                device: self.id(),
                pasid,
                current: current.id(),
            });
        }

        if let Err(e) = hwpt.attach(space, self, pasid, Change::Attach, flags) {
            self.slot_take(pasid);
            ictx.hwpt_put(Arc::clone(hwpt));
            return Err(e);
        }

        debug!("{} at {} attached to hwpt {}", self.id(), pasid, hwpt.id());
        Ok(Outcome::Attached)
    }

    pub(crate) fn slot_replace(
        self: &Arc<Self>,
        ictx: &IommuFd,
        hwpt: &Arc<HwPageTable>,
        space: Option<&mut IoasInner>,
        pasid: Pasid,
        flags: AttachFlags,
    ) -> Result<Outcome> {
        if !hwpt.refs().inc_not_zero() {
            return Err(Error::NoSuchObject(hwpt.id()));
        }

        let old = match self.slot_store(pasid, Arc::clone(hwpt)) {
            Some(old) => old,
            None => {
                self.slot_take(pasid);
                ictx.hwpt_put(Arc::clone(hwpt));
                return Err(Error::ReplaceWithoutAttach {
                    device: self.id(),
                    pasid,
                });
            }
        };

        if Arc::ptr_eq(&old, hwpt) {
            hwpt.refs().dec();
            return Ok(Outcome::Unchanged);
        }

        if pasid.is_none() && old.group_shared_with_others(self) {
            self.slot_store(pasid, old);
            ictx.hwpt_put(Arc::clone(hwpt));
            return Err(Error::ReplaceSharedGroup(self.group()));
        }

        if let Err(e) = hwpt.attach(space, self, pasid, Change::Replace, flags) {
            self.slot_store(pasid, old);
            ictx.hwpt_put(Arc::clone(hwpt));
            return Err(e);
        }

        debug!(
            "{} at {} replaced hwpt {} with hwpt {}",
            self.id(),
            pasid,
            old.id(),
            hwpt.id()
        );
        Ok(Outcome::Replaced(old))
    }

    /// Empties the slot and tears the attachment down.
    pub(crate) fn slot_detach(self: &Arc<Self>, ictx: &IommuFd, pasid: Pasid) -> Result<()> {
        let hwpt = match self.slot_take(pasid) {
            Some(hwpt) => hwpt,
            None => {
                error!("detaching {} at {} which is not attached", self.id(), pasid);
                return Err(Error::NotAttached {
                    device: self.id(),
                    pasid,
                });
            }
        };

        hwpt.detach(self, pasid, true);
        debug!("{} at {} detached from hwpt {}", self.id(), pasid, hwpt.id());
        ictx.hwpt_put(hwpt);

        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl IommuFd {
    fn check_pasid(&self, device: &Device, pasid: Pasid) -> Result<()> {
        if pasid.is_none() || pasid.0.checked_shr(self.config().max_pasid_bits).unwrap_or(0) != 0 {
            return Err(Error::InvalidPasid(pasid.0));
        }
        if !device.pasid_capable() {
            return Err(Error::NotSupported("PASID on this device's IOMMU"));
        }
        Ok(())
    }

    /// Connects `{device, pasid}` to a hwpt, or to an automatically selected domain if `pt_id` is
    /// an IOAS. Returns the id of the hwpt now in use.
    ///
    /// Re-attaching to the hwpt the pair is already attached to succeeds without taking another
    /// reference. Attaching to a different one fails with
    /// [`Error::PasidInUse`]; use [`IommuFd::device_pasid_replace`] for that.
    pub fn device_pasid_attach(
        &self,
        device: &Arc<Device>,
        pasid: Pasid,
        pt_id: ObjectId,
    ) -> Result<ObjectId> {
        self.device_pasid_attach_with_flags(device, pasid, pt_id, AttachFlags::empty())
    }

    /// Like [`IommuFd::device_pasid_attach`], with `flags` on top of those the configuration
    /// implies.
    pub fn device_pasid_attach_with_flags(
        &self,
        device: &Arc<Device>,
        pasid: Pasid,
        pt_id: ObjectId,
        flags: AttachFlags,
    ) -> Result<ObjectId> {
        self.check_pasid(device, pasid)?;

        let flags = self.attach_flags(flags);
        let (hwpt, _) = device.change_pt(self, pasid, pt_id, Change::Attach, flags)?;
        Ok(hwpt.id())
    }

    /// Moves an attached `{device, pasid}` to another hwpt without a window where DMA with that
    /// PASID is untranslated. If this fails nothing changes.
    pub fn device_pasid_replace(
        &self,
        device: &Arc<Device>,
        pasid: Pasid,
        pt_id: ObjectId,
    ) -> Result<ObjectId> {
        self.device_pasid_replace_with_flags(device, pasid, pt_id, AttachFlags::empty())
    }

    pub fn device_pasid_replace_with_flags(
        &self,
        device: &Arc<Device>,
        pasid: Pasid,
        pt_id: ObjectId,
        flags: AttachFlags,
    ) -> Result<ObjectId> {
        self.check_pasid(device, pasid)?;

        let flags = self.attach_flags(flags);
        let (hwpt, _) = device.change_pt(self, pasid, pt_id, Change::Replace, flags)?;
        Ok(hwpt.id())
    }

    pub fn device_pasid_detach(&self, device: &Arc<Device>, pasid: Pasid) -> Result<()> {
        self.check_pasid(device, pasid)?;

        let _change = device.change_lock();
        device.slot_detach(self, pasid)
    }

    /// The hwpt `{device, pasid}` is currently attached to.
    pub fn device_pasid_hwpt(&self, device: &Device, pasid: Pasid) -> Result<Option<ObjectId>> {
        self.check_pasid(device, pasid)?;

        Ok(device.pasid_table().load(pasid).map(|hwpt| hwpt.id()))
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::iommu::DomainHandle;
    use crate::mocks::tests::{Fixture, DEV_A, DEV_B};

    #[test]
    fn test_attach_is_idempotent() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);
        let hwpt = fx.manual_hwpt(&device);
        let users = fx.hwpt(hwpt).users();

        assert_eq!(
            fx.ictx.device_pasid_attach(&device, Pasid(5), hwpt).unwrap(),
            hwpt
        );
        assert_eq!(fx.hwpt(hwpt).users(), users + 1);

        assert_eq!(
            fx.ictx.device_pasid_attach(&device, Pasid(5), hwpt).unwrap(),
            hwpt
        );
        assert_eq!(fx.hwpt(hwpt).users(), users + 1);
        assert_eq!(fx.platform_calls("install_pasid_context"), 1);
    }

    #[test]
    fn test_attach_to_other_hwpt_conflicts() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);
        let h1 = fx.manual_hwpt(&device);
        let h2 = fx.manual_hwpt(&device);

        fx.ictx.device_pasid_attach(&device, Pasid(5), h1).unwrap();
        let users = fx.hwpt(h2).users();

        let err = fx
            .ictx
            .device_pasid_attach(&device, Pasid(5), h2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(fx.hwpt(h2).users(), users);
        assert_eq!(
            fx.ictx.device_pasid_hwpt(&device, Pasid(5)).unwrap(),
            Some(h1)
        );
    }

    #[test]
    fn test_refcount_tracks_attached_pairs() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let b = fx.bind(DEV_B);
        let hwpt = fx.manual_hwpt(&a);

        // one reference held by the object table
        assert_eq!(fx.hwpt(hwpt).users(), 1);

        fx.ictx.device_pasid_attach(&a, Pasid(1), hwpt).unwrap();
        fx.ictx.device_pasid_attach(&a, Pasid(2), hwpt).unwrap();
        fx.ictx.device_pasid_attach(&b, Pasid(1), hwpt).unwrap();
        assert_eq!(fx.hwpt(hwpt).users(), 4);

        fx.ictx.device_pasid_detach(&a, Pasid(2)).unwrap();
        assert_eq!(fx.hwpt(hwpt).users(), 3);
        fx.ictx.device_pasid_detach(&a, Pasid(1)).unwrap();
        fx.ictx.device_pasid_detach(&b, Pasid(1)).unwrap();
        assert_eq!(fx.hwpt(hwpt).users(), 1);
        assert!(fx.hwpt(hwpt).attached_pasids().is_empty());
    }

    #[test]
    fn test_replace_reports_new_hwpt() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);
        let h1 = fx.manual_hwpt(&device);
        let h2 = fx.manual_hwpt(&device);

        fx.ictx.device_pasid_attach(&device, Pasid(5), h1).unwrap();
        assert_eq!(
            fx.ictx.device_pasid_replace(&device, Pasid(5), h2).unwrap(),
            h2
        );

        assert_eq!(
            fx.ictx.device_pasid_hwpt(&device, Pasid(5)).unwrap(),
            Some(h2)
        );
        assert_eq!(fx.hwpt(h1).users(), 1);
        assert_eq!(fx.hwpt(h2).users(), 2);
        assert_eq!(fx.platform_calls("replace_pasid_context"), 1);
        assert_eq!(fx.platform_calls("teardown_pasid_context"), 0);
    }

    #[test]
    fn test_slot_replace_hands_back_old_hwpt() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);
        let h1 = fx.hwpt(fx.manual_hwpt(&device));
        let h2 = fx.hwpt(fx.manual_hwpt(&device));

        let _change = device.change_lock();
        device
            .slot_attach(&fx.ictx, &h1, None, Pasid(5), AttachFlags::empty())
            .unwrap();

        match device
            .slot_replace(&fx.ictx, &h2, None, Pasid(5), AttachFlags::empty())
            .unwrap()
        {
            Outcome::Replaced(old) => {
                assert!(Arc::ptr_eq(&old, &h1));
                // still held: the pair's reference moved to us
                assert_eq!(h1.users(), 2);
                old.detach(&device, Pasid(5), false);
                fx.ictx.hwpt_put(old);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h1.users(), 1);
    }

    #[test]
    fn test_replace_failure_restores_old() {
        let fx = Fixture::with_failing_pasid_replace();
        let device = fx.bind(DEV_A);
        let h1 = fx.manual_hwpt(&device);
        let h2 = fx.manual_hwpt(&device);

        fx.ictx.device_pasid_attach(&device, Pasid(5), h1).unwrap();
        let (users_1, users_2) = (fx.hwpt(h1).users(), fx.hwpt(h2).users());

        let err = fx
            .ictx
            .device_pasid_replace(&device, Pasid(5), h2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFailure);

        assert_eq!(
            fx.ictx.device_pasid_hwpt(&device, Pasid(5)).unwrap(),
            Some(h1)
        );
        assert_eq!(fx.hwpt(h1).users(), users_1);
        assert_eq!(fx.hwpt(h2).users(), users_2);
        assert!(fx.hwpt(h2).attached_pasids().is_empty());
        assert_eq!(fx.hwpt(h1).attached_pasids(), vec![(device.id(), Pasid(5))]);
    }

    #[test]
    fn test_replace_requires_prior_attach() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);
        let hwpt = fx.manual_hwpt(&device);

        let err = fx
            .ictx
            .device_pasid_replace(&device, Pasid(9), hwpt)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(fx.ictx.device_pasid_hwpt(&device, Pasid(9)).unwrap(), None);
        assert_eq!(fx.hwpt(hwpt).users(), 1);
    }

    #[test]
    fn test_detach_unattached_is_reported() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);

        let err = fx.ictx.device_pasid_detach(&device, Pasid(3)).unwrap_err();
        assert_eq!(
            err,
            Error::NotAttached {
                device: device.id(),
                pasid: Pasid(3)
            }
        );
    }

    #[test]
    fn test_pasid_validation() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);
        let hwpt = fx.manual_hwpt(&device);

        assert_eq!(
            fx.ictx
                .device_pasid_attach(&device, Pasid::NONE, hwpt)
                .unwrap_err(),
            Error::InvalidPasid(0)
        );
        assert_eq!(
            fx.ictx
                .device_pasid_attach(&device, Pasid(1 << 20), hwpt)
                .unwrap_err(),
            Error::InvalidPasid(1 << 20)
        );
    }

    #[test]
    fn test_hardware_failure_rolls_back_attach() {
        let fx = Fixture::with_failing_pasid_install();
        let device = fx.bind(DEV_A);
        let hwpt = fx.manual_hwpt(&device);

        let err = fx
            .ictx
            .device_pasid_attach(&device, Pasid(5), hwpt)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFailure);
        assert_eq!(fx.ictx.device_pasid_hwpt(&device, Pasid(5)).unwrap(), None);
        assert_eq!(fx.hwpt(hwpt).users(), 1);
        assert_eq!(fx.reservations(), 0);
    }

    #[test]
    fn test_table_primitives() {
        let fx = Fixture::new();
        let device = fx.bind(DEV_A);
        let h1 = fx.hwpt(fx.manual_hwpt(&device));
        let h2 = fx.hwpt(fx.manual_hwpt(&device));
        let table = PasidTable::default();

        assert!(table.compare_exchange_absent(Pasid(1), h1.clone()).is_ok());
        let current = table
            .compare_exchange_absent(Pasid(1), h2.clone())
            .unwrap_err();
        assert!(Arc::ptr_eq(&current, &h1));

        let previous = table.store(Pasid(1), h2.clone()).unwrap();
        assert!(Arc::ptr_eq(&previous, &h1));
        assert_eq!(table.pasids(), vec![Pasid(1)]);
        assert!(Arc::ptr_eq(&table.erase(Pasid(1)).unwrap(), &h2));
        assert!(table.load(Pasid(1)).is_none());
        assert_ne!(h1.domain(), DomainHandle(0));
    }
}

/* ---------------------------------------------------------------------------------------------- */
