// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the platform code that actually owns devices and programs IOMMU hardware.
//!
//! This crate only does the bookkeeping: which device is attached where, who holds which
//! reference, and what must be undone on failure. Everything that touches a register, a group, or
//! an interrupt domain goes through the traits below, bundled as [`Platform`].
//!
//! All handles are plain `Copy` identifiers. Implementations are expected to be internally
//! synchronized, but this crate never calls into the same hwpt's hardware state from two threads
//! at once: every attach/detach on a hwpt runs under that hwpt's device-list lock.

/* ---------------------------------------------------------------------------------------------- */

use crate::error::Result;
use crate::pasid::Pasid;

/* ---------------------------------------------------------------------------------------------- */

/// A physical DMA-capable device.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysDevice(pub u64);

/// A topology group: devices that can only ever share one translation context.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupId(pub u32);

/// A physical translation unit (one IOMMU instance).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UnitId(pub u32);

/// A translation-unit domain allocated by [`DomainOps::alloc_domain`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DomainHandle(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Capability {
    /// DMA through the IOMMU is cache coherent.
    CacheCoherency,
    /// The IOMMU can block no-snoop transactions, making coherency enforceable.
    EnforceCacheCoherency,
    /// The platform isolates MSI writes on its own (interrupt remapping).
    InterruptRemap,
}

/// What a two-stage context is built from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NestedContext {
    pub s2_domain: DomainHandle,
    pub s1_pgtbl: u64,
    pub s1_flags: u64,
    pub s1_addr_width: u32,
}

/* ---------------------------------------------------------------------------------------------- */

/// Exclusive DMA ownership of devices and their topology groups.
pub trait GroupOwnership {
    /// The device's topology group, or `None` if it is not behind an IOMMU.
    fn group_of(&self, device: PhysDevice) -> Option<GroupId>;

    /// Fails with [`Error::DmaOwnerBusy`](crate::error::Error::DmaOwnerBusy) if another owner
    /// already holds the device.
    fn claim_exclusive(&self, device: PhysDevice, group: GroupId) -> Result<()>;

    fn release(&self, device: PhysDevice, group: GroupId);
}

pub trait DeviceCapabilities {
    fn device_supports(&self, device: PhysDevice, capability: Capability) -> bool;

    /// The translation unit the device sits behind.
    fn unit_of(&self, device: PhysDevice) -> UnitId;

    /// Guest address width the unit can walk, in bits.
    fn unit_address_width(&self, unit: UnitId) -> u32;

    fn unit_supports_pasid(&self, unit: UnitId) -> bool;
}

/// Translation-unit domain operations.
pub trait DomainOps {
    /// Allocates a paging domain suitable for `device`.
    fn alloc_domain(&self, device: PhysDevice) -> Result<DomainHandle>;

    fn free_domain(&self, domain: DomainHandle);

    /// Tries to make the domain block no-snoop DMA. Returns whether it now does.
    fn enforce_cache_coherency(&self, domain: DomainHandle) -> bool;

    /// Allocates the stage-1 half of a nested domain on top of the paging domain `s2`.
    fn alloc_nested_domain(&self, s2: DomainHandle, device: PhysDevice) -> Result<DomainHandle>;

    /// Checks that `domain` could be used by `device` without attaching anything.
    fn prepare_attach(&self, domain: DomainHandle, device: PhysDevice) -> Result<()>;

    fn attach_group(&self, domain: DomainHandle, group: GroupId) -> Result<()>;

    fn detach_group(&self, domain: DomainHandle, group: GroupId);

    /// Moves `group` from whatever domain it is attached to onto `domain` without a window of
    /// blocked translation.
    fn replace_group(&self, domain: DomainHandle, group: GroupId) -> Result<()>;

    fn install_pasid_context(
        &self,
        unit: UnitId,
        device: PhysDevice,
        pasid: Pasid,
        domain: DomainHandle,
    ) -> Result<()>;

    /// Installs a two-stage context. `pasid` may be [`Pasid::NONE`] for the default context.
    fn install_nested_context(
        &self,
        unit: UnitId,
        device: PhysDevice,
        pasid: Pasid,
        context: NestedContext,
    ) -> Result<()>;

    /// Re-routes an installed PASID entry to `domain` atomically.
    fn replace_pasid_context(
        &self,
        unit: UnitId,
        device: PhysDevice,
        pasid: Pasid,
        domain: DomainHandle,
    ) -> Result<()>;

    fn teardown_pasid_context(&self, unit: UnitId, device: PhysDevice, pasid: Pasid);

    fn flush_iotlb(&self, unit: UnitId, domain: DomainHandle, address: u64, page_count: u64);

    fn flush_iotlb_all(&self, unit: UnitId, domain: DomainHandle);
}

/// Interrupt-remapping / MSI window handling.
pub trait MsiPlatform {
    /// Whether every allocated domain blocks MSI until an MSI window is installed into it.
    fn msi_remap_required(&self) -> bool;

    /// Installs the software MSI window at `window`. A second call for the same domain is a no-op
    /// success.
    fn install_msi_cookie(&self, domain: DomainHandle, window: u64) -> Result<()>;
}

/// Everything this crate needs from the platform.
pub trait Platform: GroupOwnership + DeviceCapabilities + DomainOps + MsiPlatform + Send + Sync {}

impl<T> Platform for T where
    T: GroupOwnership + DeviceCapabilities + DomainOps + MsiPlatform + Send + Sync
{
}

/* ---------------------------------------------------------------------------------------------- */

/// The mapping side of one I/O address space.
///
/// Owned by an [`Ioas`](crate::ioas::Ioas) and only called with that IOAS's mutex held.
pub trait IoPageTable: Send {
    /// Reserves the IOVA ranges `device` must never have mapped (bridge windows, MSI doorbells,
    /// ...). Returns the base of the software MSI window, if the platform uses one.
    ///
    /// Reservations are counted: a device may hold several at once (one per attached PASID, or two
    /// for the length of a replace), and each is dropped by one
    /// [`release_reservation`](IoPageTable::release_reservation).
    fn reserve_iova_for_device(
        &mut self,
        device: PhysDevice,
        pasid: Pasid,
        group: GroupId,
    ) -> Result<Option<u64>>;

    fn release_reservation(&mut self, device: PhysDevice, pasid: Pasid);

    /// Makes map/unmap on this address space propagate into `domain`, filling it with every
    /// existing mapping first.
    fn add_domain(&mut self, domain: DomainHandle) -> Result<()>;

    fn remove_domain(&mut self, domain: DomainHandle);
}

/* ---------------------------------------------------------------------------------------------- */
