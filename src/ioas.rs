// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug};
use std::sync::{Arc, MutexGuard};

use crate::hwpt::HwPageTable;
use crate::iommu::IoPageTable;
use crate::object::ObjectId;
use crate::refcount::RefCount;
use crate::sync::Mutex;

/* ---------------------------------------------------------------------------------------------- */

/// An I/O address space: the mappings user space set up, plus every hwpt currently realizing them.
///
/// Lock order: an IOAS's lock is always taken before the device-list lock of any of its hwpts.
pub struct Ioas {
    id: ObjectId,
    /// The table's reference plus one per hwpt allocated on this IOAS.
    users: RefCount,
    inner: Mutex<IoasInner>,
}

/// What the IOAS lock protects.
pub struct IoasInner {
    pub(crate) iopt: Box<dyn IoPageTable>,
    /// Paging hwpts the IOAS maps into, directly attached or carrying nested hwpts. Each appears
    /// at most once.
    hwpts: Vec<Arc<HwPageTable>>,
}

impl Ioas {
    pub fn new(id: ObjectId, iopt: Box<dyn IoPageTable>) -> Ioas {
        Ioas {
            id,
            users: RefCount::new(1),
            inner: Mutex::new(IoasInner {
                iopt,
                hwpts: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Ids of the hwpts currently realizing this address space.
    pub fn hwpt_ids(&self) -> Vec<ObjectId> {
        self.lock().hwpts.iter().map(|hwpt| hwpt.id()).collect()
    }

    pub(crate) fn refs(&self) -> &RefCount {
        &self.users
    }

    pub(crate) fn lock(&self) -> MutexGuard<IoasInner> {
        self.inner.lock()
    }
}

impl Debug for Ioas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ioas")
            .field("id", &self.id)
            .field("users", &self.users.get())
            .finish_non_exhaustive()
    }
}

impl IoasInner {
    /// Lists `hwpt` unless it already is.
    pub(crate) fn publish(&mut self, hwpt: &Arc<HwPageTable>) {
        if !self.hwpts.iter().any(|listed| Arc::ptr_eq(listed, hwpt)) {
            self.hwpts.push(Arc::clone(hwpt));
        }
    }

    pub(crate) fn unpublish(&mut self, hwpt: &HwPageTable) {
        self.hwpts.retain(|listed| !std::ptr::eq(Arc::as_ptr(listed), hwpt));
    }

    /// Auto-domain candidates, in the order they were listed.
    pub(crate) fn auto_hwpts(&self) -> Vec<Arc<HwPageTable>> {
        self.hwpts
            .iter()
            .filter(|hwpt| hwpt.is_auto())
            .cloned()
            .collect()
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use crate::mocks::tests::{Fixture, DEV_A, DEV_B};

    #[test]
    fn test_hwpt_listed_while_attached() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let b = fx.bind(DEV_B);
        let ioas = fx.ioas();

        assert!(ioas.hwpt_ids().is_empty());

        let hwpt = fx.ictx.device_attach(&a, fx.ioas).unwrap();
        assert_eq!(fx.ictx.device_attach(&b, fx.ioas).unwrap(), hwpt);
        assert_eq!(ioas.hwpt_ids(), vec![hwpt]);

        fx.ictx.device_detach(&a).unwrap();
        assert_eq!(ioas.hwpt_ids(), vec![hwpt]);
        fx.ictx.device_detach(&b).unwrap();
        assert!(ioas.hwpt_ids().is_empty());
    }

    #[test]
    fn test_manual_hwpt_listed_once() {
        let fx = Fixture::new();
        let a = fx.bind(DEV_A);
        let b = fx.bind(DEV_B);
        let hwpt = fx.manual_hwpt(&a);

        fx.ictx.device_attach(&a, hwpt).unwrap();
        fx.ictx.device_attach(&b, hwpt).unwrap();
        assert_eq!(fx.ioas().hwpt_ids(), vec![hwpt]);
        assert_eq!(fx.iopt_calls("add_domain"), 1);
    }
}

/* ---------------------------------------------------------------------------------------------- */
