// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured data handed in by user space.
//!
//! User-space ABI structs are extensible: a newer caller may pass a longer struct than this crate
//! knows about, and an older one a shorter struct. The rules, shared by every struct here, are:
//!
//! - Bytes beyond what the crate knows must all be zero, so new fields are opt-in.
//! - Known bytes beyond what the caller passed read as zero.
//! - The caller must pass at least some per-call minimum.
//!
//! Structs are declared with the [`user_struct!`](crate::user_struct) macro.

/* ---------------------------------------------------------------------------------------------- */

mod struct_macros;

use num_traits::{PrimInt, Unsigned};
use std::fmt::{Debug, LowerHex};

use crate::error::{Error, Result};

/* ---------------------------------------------------------------------------------------------- */

use private::Sealed;
mod private {
    /// Keeps [`UserValue`](super::UserValue) implementations inside this crate.
    pub trait Sealed {}
}

/// Trait for types that can be fields of a [`UserStruct`].
///
/// This is implemented for [`u8`], [`u16`], [`u32`], and [`u64`].
///
/// This trait is _sealed_, and thus cannot be implemented by users of the crate.
pub trait UserValue: PrimInt + Unsigned + Debug + LowerHex + Sealed {
    /// Panics if `bytes` is too short.
    fn read_le(bytes: &[u8], offset: usize) -> Self;

    /// Panics if `bytes` is too short.
    fn write_le(self, bytes: &mut [u8], offset: usize);
}

macro_rules! impl_user_value {
    ($($ty:ty),*) => {
        $(
            impl Sealed for $ty {}
            impl UserValue for $ty {
                fn read_le(bytes: &[u8], offset: usize) -> Self {
                    let mut raw = [0; std::mem::size_of::<$ty>()];
                    let len = raw.len();
                    raw.copy_from_slice(&bytes[offset..offset + len]);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le(self, bytes: &mut [u8], offset: usize) {
                    let raw = self.to_le_bytes();
                    bytes[offset..offset + raw.len()].copy_from_slice(&raw);
                }
            }
        )*
    };
}

impl_user_value!(u8, u16, u32, u64);

/// A struct whose layout is shared with user space. Implemented by [`user_struct!`](crate::user_struct).
pub trait UserStruct: Sized {
    /// Size of the struct as this crate knows it.
    const SIZE: usize;

    /// `bytes` must be exactly [`UserStruct::SIZE`] long.
    fn read_from(bytes: &[u8]) -> Self;

    /// `bytes` must be at least [`UserStruct::SIZE`] long.
    fn write_to(&self, bytes: &mut [u8]);

    /// Checks that every reserved field holds its required value.
    fn validate(&self) -> Result<()>;
}

pub fn is_aligned<T: PrimInt>(value: T, alignment: T) -> bool {
    value & (alignment - T::one()) == T::zero()
}

/// Reads a `T` out of a user buffer of any length following the extensible-struct rules. `bytes`
/// must be at least `min_size` long.
pub fn read_extensible<T: UserStruct>(bytes: &[u8], min_size: usize) -> Result<T> {
    if bytes.len() < min_size {
        return Err(Error::ArgSize {
            argsz: bytes.len() as u32,
            minsz: min_size as u32,
        });
    }

    if bytes.len() > T::SIZE && bytes[T::SIZE..].iter().any(|&b| b != 0) {
        return Err(Error::UnknownTrailingData(T::SIZE));
    }

    let mut known = vec![0; T::SIZE];
    let len = bytes.len().min(T::SIZE);
    known[..len].copy_from_slice(&bytes[..len]);

    Ok(T::read_from(&known))
}

/* ---------------------------------------------------------------------------------------------- */

/// Type tag of [`HwptVtdS1`] user data.
pub const IOMMU_HWPT_DATA_VTD_S1: u32 = 1;

/// Type tag of [`HwptVtdS1Invalidate`] user data arrays.
pub const IOMMU_HWPT_INVALIDATE_DATA_VTD_S1: u32 = 1;

/// Only invalidate leaf entries.
pub const IOMMU_VTD_INV_FLAGS_LEAF: u32 = 1 << 0;

crate::user_struct! {
    /// Stage-1 page table description for a nested VT-d domain.
    pub struct HwptVtdS1: 24 {
        flags @ 0: u64,
        pgtbl_addr @ 8: u64,
        addr_width @ 16: u32,
        reserved @ 20: u32 = 0,
    }

    /// One stage-1 IOTLB invalidation request.
    pub struct HwptVtdS1Invalidate: 24 {
        addr @ 0: u64,
        npages @ 8: u64,
        flags @ 16: u32,
        reserved @ 20: u32 = 0,
    }
}

/// A single typed struct passed in by user space.
#[derive(Clone, Copy, Debug)]
pub struct UserData<'a> {
    pub data_type: u32,
    pub bytes: &'a [u8],
}

impl UserData<'_> {
    /// Reads a `T` of type `data_type`, requiring at least `min_size` bytes. The result is not
    /// [validated](UserStruct::validate).
    pub fn read<T: UserStruct>(&self, data_type: u32, min_size: usize) -> Result<T> {
        if self.data_type != data_type {
            return Err(Error::DataType {
                expected: data_type,
                got: self.data_type,
            });
        }

        read_extensible(self.bytes, min_size)
    }
}

/// An array of same-typed structs passed in by user space, each `entry_len` bytes long.
#[derive(Clone, Copy, Debug)]
pub struct UserDataArray<'a> {
    pub data_type: u32,
    pub entry_len: u32,
    pub entry_num: u32,
    pub bytes: &'a [u8],
}

impl UserDataArray<'_> {
    pub fn read<T: UserStruct>(&self, data_type: u32, index: u32, min_size: usize) -> Result<T> {
        if self.data_type != data_type {
            return Err(Error::DataType {
                expected: data_type,
                got: self.data_type,
            });
        }

        let entry_len = self.entry_len as usize;
        let start = index as usize * entry_len;
        let entry = self
            .bytes
            .get(start..start + entry_len)
            .ok_or(Error::ArgSize {
                argsz: self.bytes.len() as u32,
                minsz: (start + entry_len) as u32,
            })?;

        read_extensible(entry, min_size)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
