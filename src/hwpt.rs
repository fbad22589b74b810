// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hardware page tables and the accounting of who is attached to them.

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::{self, Debug};
use std::ptr;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::config::AttachFlags;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::interrupts::setup_msi;
use crate::ioas::{Ioas, IoasInner};
use crate::iommu::{DomainHandle, GroupId, Platform};
use crate::nested::NestedDomain;
use crate::object::ObjectId;
use crate::pasid::Pasid;
use crate::refcount::RefCount;
use crate::sync::Mutex;

/* ---------------------------------------------------------------------------------------------- */

/// Whether an attach starts from nothing or moves an existing attachment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Change {
    Attach,
    Replace,
}

#[derive(Debug)]
pub enum HwptKind {
    /// Translates through the mappings of its IOAS.
    Paging,
    /// Stage-1 on top of a paging hwpt.
    Nested(NestedDomain),
}

#[derive(Debug, Default)]
struct HwptState {
    /// Only ever goes from `false` to `true`.
    enforce_cache_coherency: bool,
    msi_cookie: bool,
    /// Default-context attachments.
    devices: Vec<Arc<Device>>,
    pasid_devices: Vec<(Arc<Device>, Pasid)>,
    /// Nested hwpts on top of this one that have attachments of their own.
    nested_users: u32,
}

impl HwptState {
    fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.pasid_devices.is_empty() && self.nested_users == 0
    }

    fn has_group(&self, group: GroupId) -> bool {
        self.devices.iter().any(|device| device.group() == group)
    }

    fn insert(&mut self, device: &Arc<Device>, pasid: Pasid) {
        if pasid.is_none() {
            self.devices.push(Arc::clone(device));
        } else {
            self.pasid_devices.push((Arc::clone(device), pasid));
        }
    }

    fn remove(&mut self, device: &Device, pasid: Pasid) -> bool {
        let before = self.devices.len() + self.pasid_devices.len();

        if pasid.is_none() {
            self.devices.retain(|d| !ptr::eq(Arc::as_ptr(d), device));
        } else {
            self.pasid_devices
                .retain(|(d, p)| !(ptr::eq(Arc::as_ptr(d), device) && *p == pasid));
        }

        self.devices.len() + self.pasid_devices.len() != before
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A translation-unit domain plus everything attached to it.
///
/// `users` counts the object table's reference (if published) and one reference per attached
/// `{device, pasid}` pair. Auto-domains are destroyed when only the table's reference is left.
pub struct HwPageTable {
    id: ObjectId,
    users: RefCount,
    platform: Arc<dyn Platform>,
    /// `None` for nested hwpts, which live in their parent's IOAS.
    ioas: Option<Arc<Ioas>>,
    domain: DomainHandle,
    kind: HwptKind,
    auto_domain: bool,
    state: Mutex<HwptState>,
}

impl HwPageTable {
    /// The caller must have taken a reference on `ioas` for the new hwpt.
    pub(crate) fn new_paging(
        id: ObjectId,
        platform: Arc<dyn Platform>,
        ioas: Arc<Ioas>,
        domain: DomainHandle,
        auto_domain: bool,
    ) -> HwPageTable {
        HwPageTable {
            id,
            users: RefCount::new(1),
            platform,
            ioas: Some(ioas),
            domain,
            kind: HwptKind::Paging,
            auto_domain,
            state: Mutex::default(),
        }
    }

    /// The caller must have taken a reference on the nested domain's parent for the new hwpt.
    pub(crate) fn new_nested(
        id: ObjectId,
        platform: Arc<dyn Platform>,
        nested: NestedDomain,
        domain: DomainHandle,
    ) -> HwPageTable {
        HwPageTable {
            id,
            users: RefCount::new(1),
            platform,
            ioas: None,
            domain,
            kind: HwptKind::Nested(nested),
            auto_domain: false,
            state: Mutex::default(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn domain(&self) -> DomainHandle {
        self.domain
    }

    pub fn kind(&self) -> &HwptKind {
        &self.kind
    }

    pub fn nested(&self) -> Option<&NestedDomain> {
        match &self.kind {
            HwptKind::Paging => None,
            HwptKind::Nested(nested) => Some(nested),
        }
    }

    pub fn is_auto(&self) -> bool {
        self.auto_domain
    }

    pub fn ioas(&self) -> Option<&Arc<Ioas>> {
        self.ioas.as_ref()
    }

    pub fn users(&self) -> u32 {
        self.users.get()
    }

    pub fn enforces_cache_coherency(&self) -> bool {
        self.state.lock().enforce_cache_coherency
    }

    /// Devices attached through their default context.
    pub fn attached_devices(&self) -> Vec<ObjectId> {
        self.state.lock().devices.iter().map(|d| d.id()).collect()
    }

    pub fn attached_pasids(&self) -> Vec<(ObjectId, Pasid)> {
        self.state
            .lock()
            .pasid_devices
            .iter()
            .map(|(d, pasid)| (d.id(), *pasid))
            .collect()
    }

    pub(crate) fn refs(&self) -> &RefCount {
        &self.users
    }

    /// The IOAS whose lock guards attachments to this hwpt.
    fn space(&self) -> Option<&Arc<Ioas>> {
        match &self.kind {
            HwptKind::Paging => self.ioas.as_ref(),
            HwptKind::Nested(nested) => nested.parent().space(),
        }
    }

    fn coherency_domain(&self) -> DomainHandle {
        match &self.kind {
            HwptKind::Paging => self.domain,
            HwptKind::Nested(nested) => nested.parent().domain(),
        }
    }

    /// Whether devices other than `device` in its group are attached here by default context.
    pub(crate) fn group_shared_with_others(&self, device: &Device) -> bool {
        self.state
            .lock()
            .devices
            .iter()
            .any(|d| d.group() == device.group() && !ptr::eq(Arc::as_ptr(d), device))
    }

    /// Counts a nested hwpt on top of this one gaining its first attachment. Translation through
    /// the nested hwpt walks this domain, so the IOAS maps into it from then on.
    fn retain_for_nested(self: &Arc<Self>, space: &mut IoasInner) -> Result<()> {
        let mut state = self.state.lock();

        if state.is_empty() {
            space.iopt.add_domain(self.domain)?;
            space.publish(self);
        }
        state.nested_users += 1;

        Ok(())
    }

    fn release_for_nested(&self, space: &mut IoasInner) {
        let mut state = self.state.lock();

        match state.nested_users.checked_sub(1) {
            Some(left) => state.nested_users = left,
            None => {
                error!("hwpt {} released by a nested hwpt it does not carry", self.id);
                return;
            }
        }

        if state.is_empty() {
            space.iopt.remove_domain(self.domain);
            space.unpublish(self);
        }
    }

    /// Makes the IOAS map into the domain that translation through this hwpt ends in.
    fn map_domain(self: &Arc<Self>, space: &mut IoasInner) -> Result<()> {
        match &self.kind {
            HwptKind::Paging => {
                space.iopt.add_domain(self.domain)?;
                space.publish(self);
                Ok(())
            }
            HwptKind::Nested(nested) => nested.parent().retain_for_nested(space),
        }
    }

    fn unmap_domain(&self, space: &mut IoasInner) {
        match &self.kind {
            HwptKind::Paging => {
                space.iopt.remove_domain(self.domain);
                space.unpublish(self);
            }
            HwptKind::Nested(nested) => nested.parent().release_for_nested(space),
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Makes `device` translate through this hwpt at `pasid` and records the attachment. The caller
    /// owns the reference the attachment holds.
    ///
    /// `space` is the already locked IOAS of this hwpt, or `None` to lock it here. With
    /// [`Change::Replace`] the hardware is switched over from whatever the pair used before, and
    /// the previous hwpt's bookkeeping is left to the caller.
    ///
    /// On failure nothing has changed.
    pub(crate) fn attach(
        self: &Arc<Self>,
        space: Option<&mut IoasInner>,
        device: &Arc<Device>,
        pasid: Pasid,
        change: Change,
        flags: AttachFlags,
    ) -> Result<()> {
        match space {
            Some(space) => self.attach_locked(Some(space), device, pasid, change, flags),
            None => {
                let ioas = self.space().cloned();
                let mut guard = ioas.as_ref().map(|ioas| ioas.lock());
                self.attach_locked(guard.as_deref_mut(), device, pasid, change, flags)
            }
        }
    }

    fn attach_locked(
        self: &Arc<Self>,
        mut space: Option<&mut IoasInner>,
        device: &Arc<Device>,
        pasid: Pasid,
        change: Change,
        flags: AttachFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if let HwptKind::Nested(nested) = &self.kind {
            nested.check_attach(&*self.platform, device)?;
        }

        if device.enforce_cache_coherency() && !state.enforce_cache_coherency {
            if !self
                .platform
                .enforce_cache_coherency(self.coherency_domain())
            {
                if !state.is_empty() {
                    warn!(
                        "hwpt {} failed to enforce cache coherency with devices attached",
                        self.id
                    );
                }
                return Err(Error::CacheCoherency { hwpt: self.id });
            }
            state.enforce_cache_coherency = true;
        }

        let sw_msi_start = match space.as_mut() {
            Some(space) => {
                space
                    .iopt
                    .reserve_iova_for_device(device.phys(), pasid, device.group())?
            }
            None => None,
        };

        let result = self.attach_reserved(
            &mut state,
            space.as_mut().map(|space| &mut **space),
            device,
            pasid,
            change,
            flags,
            sw_msi_start,
        );

        if result.is_err() {
            if let Some(space) = space {
                space.iopt.release_reservation(device.phys(), pasid);
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_reserved(
        self: &Arc<Self>,
        state: &mut HwptState,
        mut space: Option<&mut IoasInner>,
        device: &Arc<Device>,
        pasid: Pasid,
        change: Change,
        flags: AttachFlags,
        sw_msi_start: Option<u64>,
    ) -> Result<()> {
        setup_msi(
            &*self.platform,
            device.phys(),
            self.domain,
            &mut state.msi_cookie,
            sw_msi_start,
            flags,
        )?;

        // The first attachment makes the IOAS start mapping into the domain.
        let map = state.is_empty();

        match change {
            Change::Attach => {
                let attached = self.hw_attach(state, device, pasid)?;

                if let (true, Some(space)) = (map, space.as_mut()) {
                    if let Err(e) = self.map_domain(space) {
                        if attached {
                            self.hw_detach(state, device, pasid);
                        }
                        return Err(e);
                    }
                }
            }
            Change::Replace => {
                // Mappings must be in place before translation switches over.
                if let (true, Some(space)) = (map, space.as_mut()) {
                    self.map_domain(space)?;
                }

                if let Err(e) = self.hw_replace(state, device, pasid) {
                    if let (true, Some(space)) = (map, space.as_mut()) {
                        self.unmap_domain(space);
                    }
                    return Err(e);
                }
            }
        }

        state.insert(device, pasid);

        Ok(())
    }

    /// Returns whether anything was programmed.
    fn hw_attach(&self, state: &HwptState, device: &Device, pasid: Pasid) -> Result<bool> {
        match &self.kind {
            HwptKind::Paging if pasid.is_none() => {
                // Once per group.
                if state.has_group(device.group()) {
                    return Ok(false);
                }
                self.platform.attach_group(self.domain, device.group())?;
            }
            HwptKind::Paging => {
                self.platform.install_pasid_context(
                    device.unit(),
                    device.phys(),
                    pasid,
                    self.domain,
                )?;
            }
            HwptKind::Nested(nested) => {
                self.platform.install_nested_context(
                    device.unit(),
                    device.phys(),
                    pasid,
                    nested.context(),
                )?;
                nested.attach_unit(device.unit());
            }
        }

        Ok(true)
    }

    fn hw_replace(&self, state: &HwptState, device: &Device, pasid: Pasid) -> Result<()> {
        match &self.kind {
            HwptKind::Paging if pasid.is_none() => {
                if !state.has_group(device.group()) {
                    self.platform.replace_group(self.domain, device.group())?;
                }
            }
            HwptKind::Paging => {
                self.platform.replace_pasid_context(
                    device.unit(),
                    device.phys(),
                    pasid,
                    self.domain,
                )?;
            }
            HwptKind::Nested(nested) => {
                self.platform.install_nested_context(
                    device.unit(),
                    device.phys(),
                    pasid,
                    nested.context(),
                )?;
                nested.attach_unit(device.unit());
            }
        }

        Ok(())
    }

    /// `state` must no longer list the attachment.
    fn hw_detach(&self, state: &HwptState, device: &Device, pasid: Pasid) {
        match &self.kind {
            HwptKind::Paging if pasid.is_none() => {
                if !state.has_group(device.group()) {
                    self.platform.detach_group(self.domain, device.group());
                }
            }
            HwptKind::Paging => {
                self.platform
                    .teardown_pasid_context(device.unit(), device.phys(), pasid);
            }
            HwptKind::Nested(nested) => {
                self.platform
                    .teardown_pasid_context(device.unit(), device.phys(), pasid);
                nested.detach_unit(device.unit());
            }
        }
    }

    /// Removes the attachment of `device` at `pasid`. With `hw == false` only the bookkeeping is
    /// undone, because a replace already moved the hardware elsewhere.
    ///
    /// The caller still owns the attachment's reference and must release it.
    pub(crate) fn detach(&self, device: &Device, pasid: Pasid, hw: bool) {
        let ioas = self.space().cloned();
        let mut space = ioas.as_ref().map(|ioas| ioas.lock());
        let mut state = self.state.lock();

        if !state.remove(device, pasid) {
            error!("{} at {} is not on hwpt {}", device.id(), pasid, self.id);
        }

        if hw {
            self.hw_detach(&state, device, pasid);
        } else if let HwptKind::Nested(nested) = &self.kind {
            nested.detach_unit(device.unit());
        }

        if let Some(space) = space.as_mut() {
            if state.is_empty() {
                self.unmap_domain(space);
            }
            space.iopt.release_reservation(device.phys(), pasid);
        }
    }

    /// Frees the domain. Only called once `users` dropped to zero.
    pub(crate) fn destroy(&self) {
        debug!("destroying hwpt {}", self.id);

        self.platform.free_domain(self.domain);
        if let Some(ioas) = &self.ioas {
            ioas.refs().dec();
        }
    }
}

impl Debug for HwPageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwPageTable")
            .field("id", &self.id)
            .field("users", &self.users.get())
            .field("domain", &self.domain)
            .field("auto_domain", &self.auto_domain)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
