// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use mockall::mock;

use crate::error::Result;
use crate::iommu::{
    Capability, DeviceCapabilities, DomainHandle, DomainOps, GroupId, GroupOwnership,
    IoPageTable, MsiPlatform, NestedContext, PhysDevice, UnitId,
};
use crate::pasid::Pasid;

/* ---------------------------------------------------------------------------------------------- */

mock! {
    /// A [`Platform`](crate::iommu::Platform) whose every hook can be scripted, for testing code
    /// built on this crate without IOMMU hardware.
    pub Platform {}

    impl GroupOwnership for Platform {
        fn group_of(&self, device: PhysDevice) -> Option<GroupId>;
        fn claim_exclusive(&self, device: PhysDevice, group: GroupId) -> Result<()>;
        fn release(&self, device: PhysDevice, group: GroupId);
    }

    impl DeviceCapabilities for Platform {
        fn device_supports(&self, device: PhysDevice, capability: Capability) -> bool;
        fn unit_of(&self, device: PhysDevice) -> UnitId;
        fn unit_address_width(&self, unit: UnitId) -> u32;
        fn unit_supports_pasid(&self, unit: UnitId) -> bool;
    }

    impl DomainOps for Platform {
        fn alloc_domain(&self, device: PhysDevice) -> Result<DomainHandle>;
        fn free_domain(&self, domain: DomainHandle);
        fn enforce_cache_coherency(&self, domain: DomainHandle) -> bool;
        fn alloc_nested_domain(&self, s2: DomainHandle, device: PhysDevice) -> Result<DomainHandle>;
        fn prepare_attach(&self, domain: DomainHandle, device: PhysDevice) -> Result<()>;
        fn attach_group(&self, domain: DomainHandle, group: GroupId) -> Result<()>;
        fn detach_group(&self, domain: DomainHandle, group: GroupId);
        fn replace_group(&self, domain: DomainHandle, group: GroupId) -> Result<()>;
        fn install_pasid_context(
            &self,
            unit: UnitId,
            device: PhysDevice,
            pasid: Pasid,
            domain: DomainHandle,
        ) -> Result<()>;
        fn install_nested_context(
            &self,
            unit: UnitId,
            device: PhysDevice,
            pasid: Pasid,
            context: NestedContext,
        ) -> Result<()>;
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

    impl MsiPlatform for Platform {
        fn msi_remap_required(&self) -> bool;
        fn install_msi_cookie(&self, domain: DomainHandle, window: u64) -> Result<()>;
    }
}

mock! {
    pub IoPageTable {}

    impl IoPageTable for IoPageTable {
        fn reserve_iova_for_device(
            &mut self,
            device: PhysDevice,
            pasid: Pasid,
            group: GroupId,
        ) -> Result<Option<u64>>;
        fn release_reservation(&mut self, device: PhysDevice, pasid: Pasid);
        fn add_domain(&mut self, domain: DomainHandle) -> Result<()>;
        fn remove_domain(&mut self, domain: DomainHandle);
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
