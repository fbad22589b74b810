// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use log::error;

use crate::config::AttachFlags;
use crate::error::{Error, Result};
use crate::iommu::{Capability, DomainHandle, PhysDevice, Platform};

/* ---------------------------------------------------------------------------------------------- */

/// Makes sure `device`'s MSI writes will work and stay isolated once it is attached to `domain`.
///
/// `msi_cookie` is the hwpt's record of whether the software MSI window was already installed into
/// `domain`, and `sw_msi_start` is the window base reported by the IOVA reservation.
pub(crate) fn setup_msi(
    platform: &dyn Platform,
    device: PhysDevice,
    domain: DomainHandle,
    msi_cookie: &mut bool,
    sw_msi_start: Option<u64>,
    flags: AttachFlags,
) -> Result<()> {
    // The platform isolates MSI and maps the window into every domain itself.
    if platform.device_supports(device, Capability::InterruptRemap) {
        return Ok(());
    }

    // Every domain blocks MSI until the window is installed, at most once per domain.
    if platform.msi_remap_required() {
        let window = match sw_msi_start {
            Some(window) => window,
            None => {
                error!("no software MSI window reserved for device {:?}", device);
                return Err(Error::UnsafeInterrupts(device));
            }
        };

        if !*msi_cookie {
            platform.install_msi_cookie(domain, window)?;
            *msi_cookie = true;
        }
        return Ok(());
    }

    // MSI writes are not isolated at all.
    if !flags.contains(AttachFlags::ALLOW_UNSAFE_INTERRUPT) {
        return Err(Error::UnsafeInterrupts(device));
    }

    Ok(())
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
