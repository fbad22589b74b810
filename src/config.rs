// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use bitflags::bitflags;

/* ---------------------------------------------------------------------------------------------- */

/// Largest PASID width any translation unit implements.
pub const MAX_PASID_BITS: u32 = 20;

/// Policy knobs of an [`IommuFd`](crate::context::IommuFd) context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// Admit devices whose MSI writes the platform cannot isolate.
    pub allow_unsafe_interrupts: bool,
    /// PASIDs at or above `1 << max_pasid_bits` are rejected.
    pub max_pasid_bits: u32,
}

impl Config {
    pub fn with_allow_unsafe_interrupts(mut self, allow: bool) -> Config {
        self.allow_unsafe_interrupts = allow;
        self
    }

    /// Clamped to [`MAX_PASID_BITS`].
    pub fn with_max_pasid_bits(mut self, bits: u32) -> Config {
        self.max_pasid_bits = bits.min(MAX_PASID_BITS);
        self
    }

    pub(crate) fn attach_flags(&self) -> AttachFlags {
        if self.allow_unsafe_interrupts {
            AttachFlags::ALLOW_UNSAFE_INTERRUPT
        } else {
            AttachFlags::empty()
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            allow_unsafe_interrupts: false,
            max_pasid_bits: MAX_PASID_BITS,
        }
    }
}

bitflags! {
    /// Per-attachment policy.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct AttachFlags: u32 {
        /// Proceed even if MSI writes of the device cannot be isolated.
        const ALLOW_UNSAFE_INTERRUPT = 1 << 0;
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_allow_unsafe_interrupts(true)
            .with_max_pasid_bits(32);

        assert!(config.allow_unsafe_interrupts);
        assert_eq!(config.max_pasid_bits, MAX_PASID_BITS);
        assert_eq!(config.attach_flags(), AttachFlags::ALLOW_UNSAFE_INTERRUPT);
        assert!(Config::default().attach_flags().is_empty());
    }
}

/* ---------------------------------------------------------------------------------------------- */
