// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use crate::error::{Error, Result};
use crate::uapi::{UserStruct, UserValue};

/* ---------------------------------------------------------------------------------------------- */

/// `pasid` is valid and the attachment is PASID-scoped.
pub const VFIO_DEVICE_ATTACH_PASID: u32 = 1 << 0;

/// `pasid` is valid and the detachment is PASID-scoped.
pub const VFIO_DEVICE_DETACH_PASID: u32 = 1 << 0;

crate::user_struct! {
    /// Argument of `VFIO_DEVICE_BIND_IOMMUFD`. `iommufd` is a signed file descriptor.
    pub struct VfioDeviceBindIommufd: 16 {
        argsz @ 0: u32,
        flags @ 4: u32,
        iommufd @ 8: u32,
        out_devid @ 12: u32,
    }

    /// Argument of `VFIO_DEVICE_ATTACH_IOMMUFD_PT`.
    pub struct VfioDeviceAttachIommufdPt: 16 {
        argsz @ 0: u32,
        flags @ 4: u32,
        pt_id @ 8: u32,
        pasid @ 12: u32,
    }

    /// Argument of `VFIO_DEVICE_DETACH_IOMMUFD_PT`.
    pub struct VfioDeviceDetachIommufdPt: 12 {
        argsz @ 0: u32,
        flags @ 4: u32,
        pasid @ 8: u32,
    }
}

pub(crate) const BIND_MINSZ: usize = 16;
pub(crate) const BIND_OUT_DEVID: usize = 12;

pub(crate) const ATTACH_MINSZ: usize = 12;
pub(crate) const ATTACH_XEND: usize = 16;
pub(crate) const ATTACH_PT_ID: usize = 8;

pub(crate) const DETACH_MINSZ: usize = 8;
pub(crate) const DETACH_XEND: usize = 12;

/* ---------------------------------------------------------------------------------------------- */

/// Reads a VFIO ioctl argument that starts with `argsz` and `flags` and may have grown fields over
/// time.
///
/// `minsz` is the size of the first version of the struct and `xend` the end of the newest field.
/// Fields past `minsz` are only read when a flag in `xflags_mask` says they are valid, in which
/// case `argsz` must cover them. Everything not read is zero.
pub(crate) fn copy_from_user<T: UserStruct>(
    arg: &[u8],
    minsz: usize,
    xend: usize,
    flags_mask: u32,
    xflags_mask: u32,
) -> Result<T> {
    if arg.len() < minsz {
        return Err(Error::ArgSize {
            argsz: arg.len() as u32,
            minsz: minsz as u32,
        });
    }

    let argsz = u32::read_le(arg, 0);
    let flags = u32::read_le(arg, 4);

    if (argsz as usize) < minsz {
        return Err(Error::ArgSize {
            argsz,
            minsz: minsz as u32,
        });
    }
    if flags & !flags_mask != 0 {
        return Err(Error::UnknownFlags(u64::from(flags & !flags_mask)));
    }

    let mut len = minsz;
    if flags & xflags_mask != 0 && xend != 0 {
        if (argsz as usize) < xend || arg.len() < xend {
            return Err(Error::ArgSize {
                argsz,
                minsz: xend as u32,
            });
        }
        len = xend;
    }

    let mut buffer = vec![0; T::SIZE];
    buffer[..len].copy_from_slice(&arg[..len]);

    Ok(T::read_from(&buffer))
}

/// Writes an output field back into the user's argument.
pub(crate) fn copy_to_user(arg: &mut [u8], offset: usize, value: u32) -> Result<()> {
    if arg.len() < offset + 4 {
        return Err(Error::ArgSize {
            argsz: arg.len() as u32,
            minsz: (offset + 4) as u32,
        });
    }

    value.write_le(arg, offset);
    Ok(())
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
