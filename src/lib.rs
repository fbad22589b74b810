// SPDX-License-Identifier: MIT OR Apache-2.0

//! The device-binding core of an iommufd-style IOMMU interface.
//!
//! This crate keeps track of which DMA-capable devices translate through which hardware page
//! tables, and keeps every reference and reservation involved balanced across failures. It does
//! not touch hardware itself: everything that programs an IOMMU, owns a topology group, or maps
//! IOVA goes through the collaborator traits in [`iommu`], bundled as [`Platform`](iommu::Platform)
//! and [`IoPageTable`](iommu::IoPageTable).
//!
//! Everything hangs off an [`IommuFd`](context::IommuFd) context, which owns a table of objects
//! addressed by [`ObjectId`](object::ObjectId):
//!
//! - **IOAS**: an I/O address space, i.e., a set of IOVA mappings ([`ioas::Ioas`]);
//! - **hwpt**: a hardware page table (translation domain) fed by an IOAS, either allocated
//!   explicitly or created on demand as an _auto-domain_ ([`hwpt::HwPageTable`]);
//! - **device**: a device bound for exclusive DMA ownership ([`device::Device`]).
//!
//! Typical usage looks like:
//!
//! ```no_run
//! use std::sync::Arc;
//! use iommufd_core::config::Config;
//! use iommufd_core::context::IommuFd;
//! use iommufd_core::iommu::{IoPageTable, PhysDevice, Platform};
//! use iommufd_core::pasid::Pasid;
//!
//! fn run(platform: Arc<dyn Platform>, iopt: Box<dyn IoPageTable>) -> iommufd_core::Result<()> {
//!     let ictx = IommuFd::new(platform, Config::default());
//!     let ioas = ictx.ioas_alloc(iopt)?;
//!
//!     // bind a device and have it translate through a domain picked for it
//!     let device = ictx.bind(PhysDevice(0x10))?;
//!     let hwpt = ictx.device_attach(&device, ioas)?;
//!
//!     // a PASID of the same device can share that domain
//!     ictx.device_pasid_attach(&device, Pasid(1), hwpt)?;
//!
//!     ictx.device_pasid_detach(&device, Pasid(1))?;
//!     ictx.device_detach(&device)?;
//!     ictx.unbind(&device)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Attaching
//!
//! A device translates through at most one hwpt in its default context, and through at most one
//! more per PASID. Attaching to an IOAS id reuses an existing auto-domain of that IOAS when the
//! device's translation unit can use it, and allocates a new one otherwise; auto-domains are freed
//! when their last attachment goes away. Replacing moves an attachment to another hwpt without
//! passing through "unattached". See [`device`] and [`pasid`].
//!
//! ## Nesting
//!
//! A nested hwpt puts a user-managed stage-1 table, described by user data in the layout of
//! [`uapi::HwptVtdS1`], on top of a paging hwpt. Its stage-1 IOTLB is invalidated in batches with
//! [`IommuFd::hwpt_invalidate`](context::IommuFd::hwpt_invalidate). See [`nested`].
//!
//! ## VFIO
//!
//! With the `vfio` feature (enabled by default), [`backends::vfio`] provides the device-file layer
//! on top: the bind / attach / detach ioctls with their argument validation.
//!
//! ## Testing
//!
//! With the `test-mocks` feature, [`mocks`] provides `mockall` implementations of the collaborator
//! traits.

/* ---------------------------------------------------------------------------------------------- */

pub mod backends;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod hwpt;
mod interrupts;
pub mod ioas;
pub mod iommu;
pub mod nested;
pub mod object;
pub mod pasid;
mod refcount;
mod sync;
pub mod uapi;

#[cfg(any(test, feature = "test-mocks"))]
pub mod mocks;

pub use crate::error::{Error, ErrorKind, Result};

/* ---------------------------------------------------------------------------------------------- */
