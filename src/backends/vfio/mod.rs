// SPDX-License-Identifier: MIT OR Apache-2.0

//! The VFIO device-file side of iommufd: binding a device file to an iommufd context, and the
//! `VFIO_DEVICE_{ATTACH,DETACH}_IOMMUFD_PT` ioctls on top of it.

/* ---------------------------------------------------------------------------------------------- */

mod ioctl;

use std::fmt::{self, Debug};
use std::sync::Arc;

use log::{debug, warn};

use crate::backends::vfio::ioctl::{
    copy_from_user, copy_to_user, ATTACH_MINSZ, ATTACH_PT_ID, ATTACH_XEND, BIND_MINSZ,
    BIND_OUT_DEVID, DETACH_MINSZ, DETACH_XEND,
};
use crate::context::IommuFd;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::iommu::PhysDevice;
use crate::object::ObjectId;
use crate::pasid::Pasid;
use crate::sync::Mutex;

pub use ioctl::{
    VfioDeviceAttachIommufdPt, VfioDeviceBindIommufd, VfioDeviceDetachIommufdPt,
    VFIO_DEVICE_ATTACH_PASID, VFIO_DEVICE_DETACH_PASID,
};

/* ---------------------------------------------------------------------------------------------- */

/// Devices whose files must not be bound, attached, or detached concurrently, such as the functions
/// of one slot sharing a reset.
#[derive(Debug, Default)]
pub struct DeviceSet {
    lock: Mutex<()>,
}

impl DeviceSet {
    pub fn new() -> DeviceSet {
        DeviceSet::default()
    }
}

struct Binding {
    ictx: Arc<IommuFd>,
    device: Arc<Device>,
}

/// An open VFIO device file.
///
/// Every ioctl takes its argument as the raw bytes user space passed, following the VFIO
/// `argsz`/`flags` conventions, and writes output fields back into them.
pub struct VfioDeviceFile {
    phys: PhysDevice,
    /// Whether the driver behind the file implements PASID attachment.
    pasid_ops: bool,
    dev_set: Arc<DeviceSet>,
    binding: Mutex<Option<Binding>>,
}

impl VfioDeviceFile {
    pub fn new(phys: PhysDevice, dev_set: Arc<DeviceSet>, pasid_ops: bool) -> VfioDeviceFile {
        VfioDeviceFile {
            phys,
            pasid_ops,
            dev_set,
            binding: Mutex::new(None),
        }
    }

    pub fn phys(&self) -> PhysDevice {
        self.phys
    }

    /// The iommufd device object this file is bound to, if any.
    pub fn device_id(&self) -> Option<ObjectId> {
        self.binding.lock().as_ref().map(|b| b.device.id())
    }

    /// `VFIO_DEVICE_BIND_IOMMUFD`.
    ///
    /// `ctx_from_fd` resolves the `iommufd` file descriptor in the argument to its context. On
    /// success the new device id is written to `out_devid`.
    pub fn bind_iommufd<F>(&self, arg: &mut [u8], ctx_from_fd: F) -> Result<()>
    where
        F: FnOnce(i32) -> Result<Arc<IommuFd>>,
    {
        let bind: VfioDeviceBindIommufd = copy_from_user(arg, BIND_MINSZ, 0, 0, 0)?;

        let fd = bind.iommufd as i32;
        if fd < 0 {
            return Err(Error::BadFd(fd));
        }

        let _set = self.dev_set.lock.lock();
        let mut binding = self.binding.lock();

        // one bind per file
        if binding.is_some() {
            return Err(Error::AlreadyBound(self.phys));
        }

        let ictx = ctx_from_fd(fd)?;
        let device = ictx.bind(self.phys)?;

        if let Err(e) = copy_to_user(arg, BIND_OUT_DEVID, device.id().as_raw()) {
            if let Err(unbind_error) = ictx.unbind(&device) {
                warn!("failed to unwind bind of {:?}: {}", self.phys, unbind_error);
            }
            return Err(e);
        }

        debug!("vfio device {:?} bound as {}", self.phys, device.id());
        *binding = Some(Binding { ictx, device });
        Ok(())
    }

    /// `VFIO_DEVICE_ATTACH_IOMMUFD_PT`.
    ///
    /// Attaching an already attached context replaces its page table. The id of the hwpt actually
    /// used is written back to `pt_id`.
    pub fn attach_pt(&self, arg: &mut [u8]) -> Result<()> {
        let attach: VfioDeviceAttachIommufdPt = copy_from_user(
            arg,
            ATTACH_MINSZ,
            ATTACH_XEND,
            VFIO_DEVICE_ATTACH_PASID,
            VFIO_DEVICE_ATTACH_PASID,
        )?;

        let pasid = self.pasid_arg(attach.flags & VFIO_DEVICE_ATTACH_PASID, attach.pasid)?;
        let pt_id = ObjectId::from_raw(attach.pt_id);

        let _set = self.dev_set.lock.lock();
        let binding = self.binding.lock();
        let Binding { ictx, device } = binding.as_ref().ok_or(Error::NotBound)?;

        let hwpt_id = match pasid {
            Some(pasid) => {
                if ictx.device_pasid_hwpt(device, pasid)?.is_some() {
                    ictx.device_pasid_replace(device, pasid, pt_id)?
                } else {
                    ictx.device_pasid_attach(device, pasid, pt_id)?
                }
            }
            None => {
                if device.hwpt_id().is_some() {
                    ictx.device_replace(device, pt_id)?
                } else {
                    ictx.device_attach(device, pt_id)?
                }
            }
        };

        copy_to_user(arg, ATTACH_PT_ID, hwpt_id.as_raw())
    }

    /// `VFIO_DEVICE_DETACH_IOMMUFD_PT`. Detaching a context that is not attached does nothing.
    pub fn detach_pt(&self, arg: &[u8]) -> Result<()> {
        let detach: VfioDeviceDetachIommufdPt = copy_from_user(
            arg,
            DETACH_MINSZ,
            DETACH_XEND,
            VFIO_DEVICE_DETACH_PASID,
            VFIO_DEVICE_DETACH_PASID,
        )?;

        let pasid = self.pasid_arg(detach.flags & VFIO_DEVICE_DETACH_PASID, detach.pasid)?;

        let _set = self.dev_set.lock.lock();
        let binding = self.binding.lock();
        let Binding { ictx, device } = binding.as_ref().ok_or(Error::NotBound)?;

        match pasid {
            Some(pasid) => {
                if ictx.device_pasid_hwpt(device, pasid)?.is_some() {
                    ictx.device_pasid_detach(device, pasid)?;
                }
            }
            None => {
                if device.hwpt_id().is_some() {
                    ictx.device_detach(device)?;
                }
            }
        }

        Ok(())
    }

    /// Detaches the default context and releases the device, as closing the file does. Does nothing
    /// if the file is not bound.
    pub fn unbind(&self) -> Result<()> {
        let _set = self.dev_set.lock.lock();
        let mut binding = self.binding.lock();

        let Binding { ictx, device } = match binding.take() {
            Some(bound) => bound,
            None => return Ok(()),
        };

        let result = if device.hwpt_id().is_some() {
            ictx.device_detach(&device)
        } else {
            Ok(())
        }
        .and_then(|()| ictx.unbind(&device));

        if let Err(e) = result {
            *binding = Some(Binding { ictx, device });
            return Err(e);
        }

        debug!("vfio device {:?} unbound", self.phys);
        Ok(())
    }

    fn pasid_arg(&self, flag: u32, pasid: u32) -> Result<Option<Pasid>> {
        if flag == 0 {
            return Ok(None);
        }
        if !self.pasid_ops {
            return Err(Error::NotSupported("pasid attachment by this driver"));
        }
        Ok(Some(Pasid(pasid)))
    }
}

impl Drop for VfioDeviceFile {
    fn drop(&mut self) {
        if let Err(e) = self.unbind() {
            warn!("failed to unbind {:?} on close: {}", self.phys, e);
        }
    }
}

impl Debug for VfioDeviceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfioDeviceFile")
            .field("phys", &self.phys)
            .field("pasid_ops", &self.pasid_ops)
            .field("device_id", &self.device_id())
            .finish()
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mocks::tests::{Fixture, DEV_A, DEV_A2};
    use crate::uapi::UserStruct;

    fn bind_arg(iommufd: i32, flags: u32) -> Vec<u8> {
        let mut arg = vec![0; VfioDeviceBindIommufd::SIZE];
        VfioDeviceBindIommufd {
            argsz: VfioDeviceBindIommufd::SIZE as u32,
            flags,
            iommufd: iommufd as u32,
            out_devid: 0,
        }
        .write_to(&mut arg);
        arg
    }

    fn attach_arg(pt_id: ObjectId, pasid: Option<u32>) -> Vec<u8> {
        let mut arg = vec![0; VfioDeviceAttachIommufdPt::SIZE];
        VfioDeviceAttachIommufdPt {
            argsz: VfioDeviceAttachIommufdPt::SIZE as u32,
            flags: pasid.map_or(0, |_| VFIO_DEVICE_ATTACH_PASID),
            pt_id: pt_id.as_raw(),
            pasid: pasid.unwrap_or(0),
        }
        .write_to(&mut arg);
        arg
    }

    fn detach_arg(pasid: Option<u32>) -> Vec<u8> {
        let mut arg = vec![0; VfioDeviceDetachIommufdPt::SIZE];
        VfioDeviceDetachIommufdPt {
            argsz: VfioDeviceDetachIommufdPt::SIZE as u32,
            flags: pasid.map_or(0, |_| VFIO_DEVICE_DETACH_PASID),
            pasid: pasid.unwrap_or(0),
        }
        .write_to(&mut arg);
        arg
    }

    fn bound_file(fx: &Fixture, pasid_ops: bool) -> VfioDeviceFile {
        let file = VfioDeviceFile::new(DEV_A, Arc::new(DeviceSet::new()), pasid_ops);
        file.bind_iommufd(&mut bind_arg(3, 0), |_| Ok(Arc::clone(&fx.ictx)))
            .unwrap();
        file
    }

    fn pt_id_of(arg: &[u8]) -> ObjectId {
        ObjectId::from_raw(VfioDeviceAttachIommufdPt::read_from(arg).pt_id)
    }

    #[test]
    fn test_bind_reports_device_id() {
        let fx = Fixture::new();
        let file = VfioDeviceFile::new(DEV_A, Arc::new(DeviceSet::new()), false);
        let mut arg = bind_arg(3, 0);

        file.bind_iommufd(&mut arg, |fd| {
            assert_eq!(fd, 3);
            Ok(Arc::clone(&fx.ictx))
        })
        .unwrap();

        let id = ObjectId::from_raw(VfioDeviceBindIommufd::read_from(&arg).out_devid);
        assert_eq!(file.device_id(), Some(id));
        assert!(fx.ictx.device(id).is_ok());

        assert_eq!(
            file.bind_iommufd(&mut bind_arg(3, 0), |_| Ok(Arc::clone(&fx.ictx)))
                .unwrap_err(),
            Error::AlreadyBound(DEV_A)
        );
    }

    #[test]
    fn test_bind_argument_checks() {
        let fx = Fixture::new();
        let file = VfioDeviceFile::new(DEV_A, Arc::new(DeviceSet::new()), false);
        let resolve = |_: i32| -> Result<Arc<IommuFd>> { Ok(Arc::clone(&fx.ictx)) };

        assert_eq!(
            file.bind_iommufd(&mut bind_arg(-1, 0), resolve)
                .unwrap_err(),
            Error::BadFd(-1)
        );
        assert_eq!(
            file.bind_iommufd(&mut bind_arg(3, 1), resolve)
                .unwrap_err(),
            Error::UnknownFlags(1)
        );
        assert_eq!(
            file.bind_iommufd(&mut bind_arg(3, 0)[..12], resolve)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(file.device_id(), None);
        assert_eq!(fx.platform_calls("claim_exclusive"), 0);
    }

    #[test]
    fn test_attach_then_replace() {
        let fx = Fixture::new();
        let file = bound_file(&fx, false);
        let device = fx.ictx.device(file.device_id().unwrap()).unwrap();
        let manual = fx.manual_hwpt(&device);

        let mut arg = attach_arg(fx.ioas, None);
        file.attach_pt(&mut arg).unwrap();
        let auto = pt_id_of(&arg);
        assert_eq!(device.hwpt_id(), Some(auto));

        let mut arg = attach_arg(manual, None);
        file.attach_pt(&mut arg).unwrap();
        assert_eq!(pt_id_of(&arg), manual);
        assert_eq!(fx.platform_calls("replace_group"), 1);
        assert!(fx.ictx.hwpt(auto).is_err());
    }

    #[test]
    fn test_pasid_needs_driver_support() {
        let fx = Fixture::new();
        let file = bound_file(&fx, false);

        let err = file
            .attach_pt(&mut attach_arg(fx.ioas, Some(5)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!(
            file.detach_pt(&detach_arg(Some(5))).unwrap_err().kind(),
            ErrorKind::NotSupported
        );
    }

    #[test]
    fn test_pasid_attach_and_detach() {
        let fx = Fixture::new();
        let file = bound_file(&fx, true);
        let device = fx.ictx.device(file.device_id().unwrap()).unwrap();

        let mut arg = attach_arg(fx.ioas, Some(5));
        file.attach_pt(&mut arg).unwrap();
        let hwpt = pt_id_of(&arg);
        assert_eq!(
            fx.ictx.device_pasid_hwpt(&device, Pasid(5)).unwrap(),
            Some(hwpt)
        );
        assert_eq!(device.hwpt_id(), None);

        file.detach_pt(&detach_arg(Some(5))).unwrap();
        assert_eq!(fx.ictx.device_pasid_hwpt(&device, Pasid(5)).unwrap(), None);

        // already detached
        file.detach_pt(&detach_arg(Some(5))).unwrap();
        file.detach_pt(&detach_arg(None)).unwrap();
        assert_eq!(fx.platform_calls("teardown_pasid_context"), 1);
    }

    #[test]
    fn test_unbound_file() {
        let fx = Fixture::new();
        let file = VfioDeviceFile::new(DEV_A, Arc::new(DeviceSet::new()), true);

        assert_eq!(
            file.detach_pt(&detach_arg(None)).unwrap_err(),
            Error::NotBound
        );
        assert_eq!(
            file.attach_pt(&mut attach_arg(fx.ioas, None))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        file.unbind().unwrap();
    }

    #[test]
    fn test_close_detaches_and_releases() {
        let fx = Fixture::new();
        let set = Arc::new(DeviceSet::new());

        let file = VfioDeviceFile::new(DEV_A, Arc::clone(&set), false);
        file.bind_iommufd(&mut bind_arg(3, 0), |_| Ok(Arc::clone(&fx.ictx)))
            .unwrap();
        let sibling = VfioDeviceFile::new(DEV_A2, set, false);
        sibling
            .bind_iommufd(&mut bind_arg(3, 0), |_| Ok(Arc::clone(&fx.ictx)))
            .unwrap();

        file.attach_pt(&mut attach_arg(fx.ioas, None)).unwrap();
        let id = file.device_id().unwrap();

        drop(file);
        assert!(fx.ictx.device(id).is_err());
        assert_eq!(fx.platform_calls("detach_group"), 1);
        assert_eq!(fx.platform_calls("release"), 1);
        assert!(sibling.device_id().is_some());
    }
}

/* ---------------------------------------------------------------------------------------------- */
