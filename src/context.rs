// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug};
use std::sync::Arc;

use log::debug;

use crate::config::{AttachFlags, Config};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::hwpt::HwPageTable;
use crate::ioas::Ioas;
use crate::iommu::{IoPageTable, Platform};
use crate::nested::{InvalidateReport, NestedDomain};
use crate::object::{Object, ObjectId, ObjectTable};
use crate::uapi::{UserData, UserDataArray};

/* ---------------------------------------------------------------------------------------------- */

/// One iommufd context: the objects a user created and the platform they drive.
///
/// Device binding and default-context attachment live in [`crate::device`], PASID attachment in
/// [`crate::pasid`].
pub struct IommuFd {
    objects: ObjectTable,
    platform: Arc<dyn Platform>,
    config: Config,
}

impl IommuFd {
    pub fn new(platform: Arc<dyn Platform>, config: Config) -> IommuFd {
        IommuFd {
            objects: ObjectTable::new(),
            platform,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub(crate) fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// `flags` of one call plus whatever the context's configuration always allows.
    pub(crate) fn attach_flags(&self, flags: AttachFlags) -> AttachFlags {
        flags | self.config.attach_flags()
    }

    pub fn device(&self, id: ObjectId) -> Result<Arc<Device>> {
        match self.objects.get(id)? {
            Object::Device(device) => Ok(device),
            _ => Err(Error::WrongObjectType(id, "device")),
        }
    }

    pub fn hwpt(&self, id: ObjectId) -> Result<Arc<HwPageTable>> {
        match self.objects.get(id)? {
            Object::Hwpt(hwpt) => Ok(hwpt),
            _ => Err(Error::WrongObjectType(id, "hwpt")),
        }
    }

    pub fn ioas(&self, id: ObjectId) -> Result<Arc<Ioas>> {
        match self.objects.get(id)? {
            Object::Ioas(ioas) => Ok(ioas),
            _ => Err(Error::WrongObjectType(id, "ioas")),
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    pub fn ioas_alloc(&self, iopt: Box<dyn IoPageTable>) -> Result<ObjectId> {
        let id = self.objects.reserve()?;
        self.objects
            .finalize(id, Object::Ioas(Arc::new(Ioas::new(id, iopt))));

        debug!("allocated ioas {}", id);
        Ok(id)
    }

    /// Fails while any hwpt still uses the IOAS.
    pub fn ioas_destroy(&self, id: ObjectId) -> Result<()> {
        let ioas = self.ioas(id)?;

        if !ioas.refs().dec_if_last(1) {
            return Err(Error::ObjectInUse(id));
        }
        self.objects.remove(id)?;

        debug!("destroyed ioas {}", id);
        Ok(())
    }

    /// Allocates a paging hwpt on `ioas_id` suitable for the device `device_id`. It lives until
    /// [`IommuFd::hwpt_destroy`].
    pub fn hwpt_alloc(&self, device_id: ObjectId, ioas_id: ObjectId) -> Result<ObjectId> {
        let device = self.device(device_id)?;
        let ioas = self.ioas(ioas_id)?;

        let hwpt = self.alloc_paging_hwpt(&ioas, &device, false)?;
        self.objects
            .finalize(hwpt.id(), Object::Hwpt(Arc::clone(&hwpt)));

        debug!("allocated hwpt {} on ioas {}", hwpt.id(), ioas_id);
        Ok(hwpt.id())
    }

    /// Allocates a nested hwpt whose stage 1 is described by `data`, on top of the paging hwpt
    /// `s2_id`. The parent cannot be destroyed before the nested hwpt.
    pub fn hwpt_alloc_nested(
        &self,
        device_id: ObjectId,
        s2_id: ObjectId,
        data: &UserData,
    ) -> Result<ObjectId> {
        let device = self.device(device_id)?;
        let s2 = self.hwpt(s2_id)?;

        // An auto-domain may go away under the nested hwpt.
        if s2.is_auto() {
            return Err(Error::WrongObjectType(s2_id, "user-allocated hwpt"));
        }
        if !s2.refs().inc_not_zero() {
            return Err(Error::NoSuchObject(s2_id));
        }

        let hwpt = match self.alloc_nested_hwpt(&s2, &device, data) {
            Ok(hwpt) => hwpt,
            Err(e) => {
                self.hwpt_put(s2);
                return Err(e);
            }
        };
        self.objects
            .finalize(hwpt.id(), Object::Hwpt(Arc::clone(&hwpt)));

        debug!("allocated nested hwpt {} on hwpt {}", hwpt.id(), s2_id);
        Ok(hwpt.id())
    }

    /// Destroys a hwpt allocated by [`IommuFd::hwpt_alloc`] or [`IommuFd::hwpt_alloc_nested`]. Fails
    /// while anything is attached to it or nested on it.
    pub fn hwpt_destroy(&self, id: ObjectId) -> Result<()> {
        let hwpt = self.hwpt(id)?;

        if hwpt.is_auto() {
            return Err(Error::WrongObjectType(id, "user-allocated hwpt"));
        }
        if !hwpt.refs().dec_if_last(1) {
            return Err(Error::ObjectInUse(id));
        }

        self.destroy_hwpt(&hwpt);
        Ok(())
    }

    /// Submits a batch of stage-1 invalidation requests to a nested hwpt.
    pub fn hwpt_invalidate(
        &self,
        hwpt_id: ObjectId,
        array: &UserDataArray,
    ) -> Result<InvalidateReport> {
        let hwpt = self.hwpt(hwpt_id)?;
        let nested = hwpt
            .nested()
            .ok_or(Error::NotSupported("invalidation of a paging hwpt"))?;

        Ok(nested.cache_invalidate_user(&*self.platform, hwpt.domain(), array))
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Allocates an unpublished paging hwpt holding one reference, which belongs to the object
    /// table once the caller finalizes its id.
    pub(crate) fn alloc_paging_hwpt(
        &self,
        ioas: &Arc<Ioas>,
        device: &Device,
        auto_domain: bool,
    ) -> Result<Arc<HwPageTable>> {
        if !ioas.refs().inc_not_zero() {
            return Err(Error::NoSuchObject(ioas.id()));
        }

        let result = self.objects.reserve().and_then(|id| {
            match self.platform.alloc_domain(device.phys()) {
                Ok(domain) => Ok((id, domain)),
                Err(e) => {
                    self.objects.abort(id);
                    Err(e)
                }
            }
        });

        let (id, domain) = match result {
            Ok(allocated) => allocated,
            Err(e) => {
                ioas.refs().dec();
                return Err(e);
            }
        };

        Ok(Arc::new(HwPageTable::new_paging(
            id,
            Arc::clone(&self.platform),
            Arc::clone(ioas),
            domain,
            auto_domain,
        )))
    }

    /// The caller's reference on `s2` moves into the new hwpt.
    fn alloc_nested_hwpt(
        &self,
        s2: &Arc<HwPageTable>,
        device: &Device,
        data: &UserData,
    ) -> Result<Arc<HwPageTable>> {
        let nested = NestedDomain::new(Arc::clone(s2), data)?;

        let id = self.objects.reserve()?;
        let domain = match self
            .platform
            .alloc_nested_domain(s2.domain(), device.phys())
        {
            Ok(domain) => domain,
            Err(e) => {
                self.objects.abort(id);
                return Err(e);
            }
        };

        Ok(Arc::new(HwPageTable::new_nested(
            id,
            Arc::clone(&self.platform),
            nested,
            domain,
        )))
    }

    /// Drops one reference on `hwpt`. An auto-domain is destroyed as soon as only the object
    /// table's reference would remain; others wait for [`IommuFd::hwpt_destroy`].
    pub(crate) fn hwpt_put(&self, hwpt: Arc<HwPageTable>) {
        let dead = if hwpt.is_auto() {
            hwpt.refs().dec_or_kill_at(2)
        } else {
            hwpt.refs().dec()
        };

        if dead {
            self.destroy_hwpt(&hwpt);
        }
    }

    fn destroy_hwpt(&self, hwpt: &Arc<HwPageTable>) {
        // Never published if the attach that created it failed.
        if self.objects.remove(hwpt.id()).is_err() {
            self.objects.abort(hwpt.id());
        }

        hwpt.destroy();

        if let Some(nested) = hwpt.nested() {
            self.hwpt_put(Arc::clone(nested.parent()));
        }
    }
}

impl Debug for IommuFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IommuFd")
            .field("objects", &self.objects)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::iommu::UnitId;
    use crate::mocks::tests::{vtd_s1_data, Fixture, DEV_A, DEV_B, DEV_C, DEV_D};
    use crate::pasid::Pasid;
    use crate::uapi::{
        HwptVtdS1Invalidate, UserStruct, IOMMU_HWPT_INVALIDATE_DATA_VTD_S1,
    };

    #[test]
    fn test_lookup_checks_type() {
        let fx = Fixture::new();

        assert!(fx.ictx.ioas(fx.ioas).is_ok());
        assert_eq!(
            fx.ictx.hwpt(fx.ioas).unwrap_err(),
            Error::WrongObjectType(fx.ioas, "hwpt")
        );
        assert_eq!(
            fx.ictx.device(ObjectId::from_raw(12345)).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_ioas_busy_while_hwpt_exists() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let hwpt = fx.manual_hwpt(&a);

        assert_eq!(
            fx.ictx.ioas_destroy(fx.ioas).unwrap_err(),
            Error::ObjectInUse(fx.ioas)
        );

        fx.ictx.hwpt_destroy(hwpt).unwrap();
        fx.ictx.ioas_destroy(fx.ioas).unwrap();
        assert!(fx.ictx.ioas(fx.ioas).is_err());
    }

    #[test]
    fn test_hwpt_destroy_busy_while_attached() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let hwpt = fx.manual_hwpt(&a);

        fx.ictx.device_attach(&a, hwpt).unwrap();
        assert_eq!(
            fx.ictx.hwpt_destroy(hwpt).unwrap_err().kind(),
            ErrorKind::Busy
        );

        fx.ictx.device_detach(&a).unwrap();
        fx.ictx.hwpt_destroy(hwpt).unwrap();
        assert_eq!(fx.platform_calls("free_domain"), 1);
        assert!(fx.ictx.hwpt(hwpt).is_err());
    }

    #[test]
    fn test_auto_hwpt_not_user_destroyable() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let hwpt = fx.ictx.device_attach(&a, fx.ioas).unwrap();

        assert_eq!(
            fx.ictx.hwpt_destroy(hwpt).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_hwpt_alloc_failure() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        fx.set(|b| b.fail_alloc_domain = true);

        assert_eq!(
            fx.ictx.hwpt_alloc(a.id(), fx.ioas).unwrap_err().kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(fx.ioas().refs().get(), 1);
    }

    #[test]
    fn test_nested_hwpt_holds_parent() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let s2 = fx.manual_hwpt(&a);
        let data = vtd_s1_data(48, 0);

        let s1 = fx
            .ictx
            .hwpt_alloc_nested(a.id(), s2, &data.user_data())
            .unwrap();
        assert_eq!(fx.hwpt(s2).users(), 2);
        assert_eq!(
            fx.ictx.hwpt_destroy(s2).unwrap_err(),
            Error::ObjectInUse(s2)
        );

        fx.ictx.hwpt_destroy(s1).unwrap();
        assert_eq!(fx.hwpt(s2).users(), 1);
        fx.ictx.hwpt_destroy(s2).unwrap();
    }

    #[test]
    fn test_nested_on_nested_rejected() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let s2 = fx.manual_hwpt(&a);
        let data = vtd_s1_data(48, 0);
        let s1 = fx
            .ictx
            .hwpt_alloc_nested(a.id(), s2, &data.user_data())
            .unwrap();

        assert_eq!(
            fx.ictx
                .hwpt_alloc_nested(a.id(), s1, &data.user_data())
                .unwrap_err(),
            Error::WrongObjectType(s1, "paging hwpt")
        );
        assert_eq!(fx.hwpt(s1).users(), 1);
    }

    #[test]
    fn test_nested_attach_checks_address_width() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let d = fx.bind(DEV_D);
        let s2 = fx.manual_hwpt(&a);
        let data = vtd_s1_data(48, 0);
        let s1 = fx
            .ictx
            .hwpt_alloc_nested(a.id(), s2, &data.user_data())
            .unwrap();

        fx.ictx.device_attach(&a, s1).unwrap();
        assert_eq!(fx.platform_calls("prepare_attach"), 1);

        let err = fx.ictx.device_attach(&d, s1).unwrap_err();
        assert_eq!(
            err,
            Error::AddressWidth {
                unit: UnitId(2),
                required: 48,
                supported: 39
            }
        );
        assert_eq!(fx.platform_calls("install_nested_context"), 1);
    }

    #[test]
    fn test_nested_attach_maps_parent() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let b = fx.bind(DEV_B);
        let s2 = fx.manual_hwpt(&a);
        let data = vtd_s1_data(48, 0);
        let s1 = fx
            .ictx
            .hwpt_alloc_nested(a.id(), s2, &data.user_data())
            .unwrap();

        fx.ictx.device_attach(&a, s1).unwrap();
        fx.ictx.device_attach(&b, s1).unwrap();
        assert_eq!(fx.iopt_calls("add_domain"), 1);
        assert_eq!(fx.ioas().hwpt_ids(), vec![s2]);

        fx.ictx.device_detach(&a).unwrap();
        assert_eq!(fx.iopt_calls("remove_domain"), 0);
        fx.ictx.device_detach(&b).unwrap();
        assert_eq!(fx.iopt_calls("remove_domain"), 1);
        assert!(fx.ioas().hwpt_ids().is_empty());
        assert_eq!(fx.reservations(), 0);
    }

    #[test]
    fn test_replace_into_nested_keeps_parent_mapped() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let s2 = fx.manual_hwpt(&a);
        let data = vtd_s1_data(48, 0);
        let s1 = fx
            .ictx
            .hwpt_alloc_nested(a.id(), s2, &data.user_data())
            .unwrap();

        fx.ictx.device_attach(&a, s2).unwrap();
        assert_eq!(fx.ictx.device_replace(&a, s1).unwrap(), s1);
        assert_eq!(fx.iopt_calls("add_domain"), 1);
        assert_eq!(fx.iopt_calls("remove_domain"), 0);
        assert_eq!(fx.ioas().hwpt_ids(), vec![s2]);

        assert_eq!(fx.ictx.device_replace(&a, s2).unwrap(), s2);
        assert_eq!(fx.iopt_calls("add_domain"), 1);
        assert_eq!(fx.iopt_calls("remove_domain"), 0);

        fx.ictx.device_detach(&a).unwrap();
        assert_eq!(fx.iopt_calls("remove_domain"), 1);
        assert!(fx.ioas().hwpt_ids().is_empty());
        assert_eq!(fx.reservations(), 0);
    }

    #[test]
    fn test_nested_map_failure_unwinds() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let s2 = fx.manual_hwpt(&a);
        let data = vtd_s1_data(48, 0);
        let s1 = fx
            .ictx
            .hwpt_alloc_nested(a.id(), s2, &data.user_data())
            .unwrap();

        fx.set(|b| b.fail_add_domain = true);
        assert!(fx.ictx.device_attach(&a, s1).is_err());
        assert!(fx.hwpt(s1).nested().unwrap().units().is_empty());
        assert_eq!(fx.platform_calls("teardown_pasid_context"), 1);
        assert_eq!(fx.reservations(), 0);

        fx.set(|b| b.fail_add_domain = false);
        fx.ictx.device_attach(&a, s1).unwrap();
        fx.ictx.device_detach(&a).unwrap();
        assert_eq!(fx.iopt_calls("remove_domain"), 1);
    }

    #[test]
    fn test_nested_invalidation_reaches_attached_units() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let b = fx.bind(DEV_B);
        let c = fx.bind(DEV_C);
        let s2 = fx.manual_hwpt(&a);
        let data = vtd_s1_data(39, 0);
        let s1 = fx
            .ictx
            .hwpt_alloc_nested(a.id(), s2, &data.user_data())
            .unwrap();

        fx.ictx.device_attach(&a, s1).unwrap();
        fx.ictx.device_attach(&b, s1).unwrap();
        fx.ictx.device_pasid_attach(&a, Pasid(4), s1).unwrap();
        fx.ictx.device_attach(&c, s1).unwrap();
        assert_eq!(
            fx.hwpt(s1).nested().unwrap().units(),
            vec![UnitId(0), UnitId(1)]
        );

        let mut bytes = vec![0; HwptVtdS1Invalidate::SIZE];
        HwptVtdS1Invalidate {
            addr: 0x10000,
            npages: 16,
            ..Default::default()
        }
        .write_to(&mut bytes);
        let array = UserDataArray {
            data_type: IOMMU_HWPT_INVALIDATE_DATA_VTD_S1,
            entry_len: HwptVtdS1Invalidate::SIZE as u32,
            entry_num: 1,
            bytes: &bytes,
        };

        let report = fx.ictx.hwpt_invalidate(s1, &array).unwrap();
        assert_eq!(report.entries_processed, 1);
        assert_eq!(fx.platform_calls("flush_iotlb"), 2);

        fx.ictx.device_detach(&c).unwrap();
        fx.ictx.hwpt_invalidate(s1, &array).unwrap();
        assert_eq!(fx.platform_calls("flush_iotlb"), 3);

        // s1 still translates through s2
        assert_eq!(fx.ioas().hwpt_ids(), vec![s2]);
        assert_eq!(
            fx.ictx.hwpt_invalidate(s2, &array).unwrap_err().kind(),
            ErrorKind::NotSupported
        );
    }
}

/* ---------------------------------------------------------------------------------------------- */
