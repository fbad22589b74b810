// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layers through which user space reaches an iommufd context.

/* ---------------------------------------------------------------------------------------------- */

#[cfg(feature = "vfio")]
pub mod vfio;

/* ---------------------------------------------------------------------------------------------- */
