// SPDX-License-Identifier: MIT OR Apache-2.0

//! Two-stage translation: a user-managed stage-1 table on top of a kernel-managed stage-2 hwpt.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::hwpt::HwPageTable;
use crate::iommu::{DomainHandle, DomainOps, NestedContext, Platform, UnitId};
use crate::sync::Mutex;
use crate::uapi::{
    is_aligned, HwptVtdS1, HwptVtdS1Invalidate, UserData, UserDataArray, UserStruct,
    IOMMU_HWPT_DATA_VTD_S1, IOMMU_HWPT_INVALIDATE_DATA_VTD_S1, IOMMU_VTD_INV_FLAGS_LEAF,
};

/* ---------------------------------------------------------------------------------------------- */

const VTD_PAGE_SIZE: u64 = 4096;

/// The stage-1 half of a nested hwpt.
#[derive(Debug)]
pub struct NestedDomain {
    s2: Arc<HwPageTable>,
    s1_cfg: HwptVtdS1,
    /// Units with something attached, and how many attachments each has. Invalidations go to all of
    /// them.
    units: Mutex<BTreeMap<UnitId, usize>>,
}

impl NestedDomain {
    /// Only checks that `data` is well formed. Whether the stage-1 table fits a unit is checked on
    /// every attach, since the units behind `s2` change over time.
    pub(crate) fn new(s2: Arc<HwPageTable>, data: &UserData) -> Result<NestedDomain> {
        if s2.nested().is_some() {
            return Err(Error::WrongObjectType(s2.id(), "paging hwpt"));
        }

        let s1_cfg: HwptVtdS1 = data.read(IOMMU_HWPT_DATA_VTD_S1, HwptVtdS1::SIZE)?;
        s1_cfg.validate()?;

        Ok(NestedDomain {
            s2,
            s1_cfg,
            units: Mutex::default(),
        })
    }

    /// The stage-2 hwpt.
    pub fn parent(&self) -> &Arc<HwPageTable> {
        &self.s2
    }

    pub fn s1_pgtbl(&self) -> u64 {
        self.s1_cfg.pgtbl_addr
    }

    pub fn addr_width(&self) -> u32 {
        self.s1_cfg.addr_width
    }

    pub fn units(&self) -> Vec<UnitId> {
        self.units.lock().keys().copied().collect()
    }

    pub(crate) fn context(&self) -> NestedContext {
        NestedContext {
            s2_domain: self.s2.domain(),
            s1_pgtbl: self.s1_cfg.pgtbl_addr,
            s1_flags: self.s1_cfg.flags,
            s1_addr_width: self.s1_cfg.addr_width,
        }
    }

    /// Checks that `device`'s unit can walk the stage-1 table and use the stage-2 domain.
    pub(crate) fn check_attach(&self, platform: &dyn Platform, device: &Device) -> Result<()> {
        let supported = platform.unit_address_width(device.unit());
        if self.s1_cfg.addr_width > supported {
            error!(
                "{:?} cannot walk a {}-bit stage-1 table",
                device.unit(),
                self.s1_cfg.addr_width
            );
            return Err(Error::AddressWidth {
                unit: device.unit(),
                required: self.s1_cfg.addr_width,
                supported,
            });
        }

        platform.prepare_attach(self.s2.domain(), device.phys())
    }

    pub(crate) fn attach_unit(&self, unit: UnitId) {
        *self.units.lock().entry(unit).or_insert(0) += 1;
    }

    pub(crate) fn detach_unit(&self, unit: UnitId) {
        let mut units = self.units.lock();

        match units.get_mut(&unit) {
            Some(1) => {
                units.remove(&unit);
            }
            Some(count) => *count -= 1,
            None => error!("{:?} is not attached to this nested domain", unit),
        }
    }

    /// Runs the stage-1 invalidation requests in `array` against every unit `domain` spans.
    ///
    /// Processing stops at the first bad entry. The report says how many entries were processed so
    /// the caller can resubmit the rest.
    pub fn cache_invalidate_user<O: DomainOps + ?Sized>(
        &self,
        ops: &O,
        domain: DomainHandle,
        array: &UserDataArray,
    ) -> InvalidateReport {
        let units = self.units();

        for index in 0..array.entry_num {
            let result = array
                .read::<HwptVtdS1Invalidate>(
                    IOMMU_HWPT_INVALIDATE_DATA_VTD_S1,
                    index,
                    HwptVtdS1Invalidate::SIZE,
                )
                .and_then(|entry| {
                    check_invalidation(&entry)?;
                    Ok(entry)
                });

            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("invalidation entry {} rejected: {}", index, e);
                    return InvalidateReport {
                        entries_processed: index,
                        result: Err(e),
                    };
                }
            };

            for &unit in &units {
                if entry.addr == 0 && entry.npages == u64::MAX {
                    ops.flush_iotlb_all(unit, domain);
                } else {
                    ops.flush_iotlb(unit, domain, entry.addr, entry.npages);
                }
            }
        }

        InvalidateReport {
            entries_processed: array.entry_num,
            result: Ok(()),
        }
    }
}

fn check_invalidation(entry: &HwptVtdS1Invalidate) -> Result<()> {
    entry.validate()?;

    if entry.flags & !IOMMU_VTD_INV_FLAGS_LEAF != 0 {
        return Err(Error::UnknownFlags(u64::from(entry.flags)));
    }
    if !is_aligned(entry.addr, VTD_PAGE_SIZE) {
        return Err(Error::MisalignedAddress { addr: entry.addr });
    }

    Ok(())
}

/// Outcome of a batch invalidation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidateReport {
    /// Entries fully handled before processing stopped.
    pub entries_processed: u32,
    pub result: Result<()>,
}

impl InvalidateReport {
    /// Index of the entry that stopped processing.
    pub fn failed_index(&self) -> Option<u32> {
        self.result.as_ref().err().map(|_| self.entries_processed)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
