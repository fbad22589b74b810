// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::io;

use remain::sorted;
use thiserror::Error;

use crate::iommu::{GroupId, PhysDevice, UnitId};
use crate::object::ObjectId;
use crate::pasid::Pasid;

/* ---------------------------------------------------------------------------------------------- */

/// The broad class of an [`Error`], which is what callers are expected to branch on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyExists,
    Busy,
    NotSupported,
    PermissionDenied,
    ResourceExhausted,
    NotFound,
    HardwareFailure,
}

#[sorted]
#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("stage-1 address width {required} exceeds the {supported}-bit width of unit {unit:?}")]
    AddressWidth {
        unit: UnitId,
        required: u32,
        supported: u32,
    },
    #[error("device {0:?} is already bound")]
    AlreadyBound(PhysDevice),
    #[error("user struct size {argsz} is smaller than the required {minsz} bytes")]
    ArgSize { argsz: u32, minsz: u32 },
    #[error("{0} is not a valid file descriptor")]
    BadFd(i32),
    #[error("hwpt {hwpt} cannot enforce cache coherency for this device")]
    CacheCoherency { hwpt: ObjectId },
    #[error("user data type {got} does not match the expected type {expected}")]
    DataType { expected: u32, got: u32 },
    #[error("device {0:?} is owned by another DMA user")]
    DmaOwnerBusy(PhysDevice),
    #[error("hardware programming failed: {op} (errno {errno})")]
    Hardware { op: &'static str, errno: i32 },
    #[error("domain cannot admit device {0:?}")]
    Incompatible(PhysDevice),
    #[error("{0} is not a valid PASID")]
    InvalidPasid(u32),
    #[error("invalidation entry address {addr:#x} is not page aligned")]
    MisalignedAddress { addr: u64 },
    #[error("device {0:?} does not report cache coherency")]
    NoCacheCoherency(PhysDevice),
    #[error("device {0:?} has no IOMMU group")]
    NoGroup(PhysDevice),
    #[error("no such object: {0}")]
    NoSuchObject(ObjectId),
    #[error("{device} is not attached at {pasid}")]
    NotAttached { device: ObjectId, pasid: Pasid },
    #[error("the device is not bound")]
    NotBound,
    #[error("operation is not supported: {0}")]
    NotSupported(&'static str),
    #[error("{0} is still in use")]
    ObjectInUse(ObjectId),
    #[error("object table is full")]
    OutOfIds,
    #[error("allocation failed: {0}")]
    OutOfMemory(&'static str),
    #[error("{device} at {pasid} is already attached to hwpt {current}")]
    PasidInUse {
        device: ObjectId,
        pasid: Pasid,
        current: ObjectId,
    },
    #[error("group {0:?} is shared with devices still on the old hwpt")]
    ReplaceSharedGroup(GroupId),
    #[error("{device} at {pasid} has no attachment to replace")]
    ReplaceWithoutAttach { device: ObjectId, pasid: Pasid },
    #[error("reserved field `{field}` must be zero")]
    ReservedField { field: &'static str },
    #[error("unknown flags {0:#x}")]
    UnknownFlags(u64),
    #[error("trailing user data beyond {0} bytes must be zero")]
    UnknownTrailingData(usize),
    #[error("unsafe interrupts are not allowed for device {0:?}")]
    UnsafeInterrupts(PhysDevice),
    #[error("{0} is not of the expected type `{1}`")]
    WrongObjectType(ObjectId, &'static str),
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        use Error::*;

        match self {
            AddressWidth { .. }
            | AlreadyBound(_)
            | ArgSize { .. }
            | BadFd(_)
            | CacheCoherency { .. }
            | DataType { .. }
            | Incompatible(_)
            | InvalidPasid(_)
            | MisalignedAddress { .. }
            | NoCacheCoherency(_)
            | NotBound
            | ReplaceWithoutAttach { .. }
            | ReservedField { .. }
            | UnknownFlags(_)
            | UnknownTrailingData(_)
            | WrongObjectType(..) => ErrorKind::InvalidArgument,
            PasidInUse { .. } => ErrorKind::AlreadyExists,
            DmaOwnerBusy(_) | ObjectInUse(_) | ReplaceSharedGroup(_) => ErrorKind::Busy,
            NotSupported(_) => ErrorKind::NotSupported,
            UnsafeInterrupts(_) => ErrorKind::PermissionDenied,
            OutOfIds | OutOfMemory(_) => ErrorKind::ResourceExhausted,
            NoGroup(_) | NoSuchObject(_) | NotAttached { .. } => ErrorKind::NotFound,
            Hardware { .. } => ErrorKind::HardwareFailure,
        }
    }

    /// The errno value reported to user space for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NoGroup(_) => libc::ENODEV,
            Error::PasidInUse { .. } => libc::EBUSY,
            Error::Hardware { errno, .. } if *errno > 0 => *errno,
            _ => match self.kind() {
                ErrorKind::InvalidArgument => libc::EINVAL,
                ErrorKind::AlreadyExists => libc::EEXIST,
                ErrorKind::Busy => libc::EBUSY,
                ErrorKind::NotSupported => libc::EOPNOTSUPP,
                ErrorKind::PermissionDenied => libc::EPERM,
                ErrorKind::ResourceExhausted => libc::ENOMEM,
                ErrorKind::NotFound => libc::ENOENT,
                ErrorKind::HardwareFailure => libc::EIO,
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        io::Error::from_raw_os_error(error.errno())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_errno() {
        let e = Error::Incompatible(PhysDevice(3));
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(e.errno(), libc::EINVAL);

        let e = Error::UnsafeInterrupts(PhysDevice(3));
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
        assert_eq!(e.errno(), libc::EPERM);

        assert_eq!(Error::NoGroup(PhysDevice(1)).errno(), libc::ENODEV);
        assert_eq!(
            Error::Hardware {
                op: "attach_group",
                errno: libc::ETIMEDOUT
            }
            .errno(),
            libc::ETIMEDOUT
        );
        assert_eq!(
            Error::Hardware {
                op: "attach_group",
                errno: 0
            }
            .errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_into_io_error() {
        let e: io::Error = Error::DmaOwnerBusy(PhysDevice(7)).into();
        assert_eq!(e.raw_os_error(), Some(libc::EBUSY));
    }
}

/* ---------------------------------------------------------------------------------------------- */
