// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

/// Defines plain structs laid out like a user-space ABI struct, with little-endian fields at fixed
/// offsets, and implements [`UserStruct`](crate::uapi::UserStruct) for them.
///
/// A field declared with `= value` is reserved: [`UserStruct::validate`] fails unless it holds
/// exactly that value.
///
/// ```
/// iommufd_core::user_struct! {
///     pub struct Example: 16 {
///         flags @ 0: u64,
///         addr_width @ 8: u32,
///         reserved @ 12: u32 = 0,
///     }
/// }
/// ```
///
/// [`UserStruct::validate`]: crate::uapi::UserStruct::validate
#[macro_export]
macro_rules! user_struct {
    (
        $(
            $(#[$attr:meta])*
            $vis:vis struct $name:ident : $length:literal {
                $(
                    $(#[$field_attr:meta])*
                    $field_name:ident @ $field_offset:literal : $field_type:ty
                    $(= $reserved_value:literal)?
                ),* $(,)?
            }
        )*
    ) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
            $vis struct $name {
                $(
                    $(#[$field_attr])*
                    pub $field_name: $field_type,
                )*
            }

            impl $crate::uapi::UserStruct for $name {
                const SIZE: usize = $length;

                fn read_from(bytes: &[u8]) -> Self {
                    $name {
                        $(
                            $field_name: <$field_type as $crate::uapi::UserValue>::read_le(
                                bytes,
                                $field_offset,
                            ),
                        )*
                    }
                }

                fn write_to(&self, bytes: &mut [u8]) {
                    $(
                        $crate::uapi::UserValue::write_le(self.$field_name, bytes, $field_offset);
                    )*
                }

                fn validate(&self) -> $crate::error::Result<()> {
                    $($(
                        if self.$field_name != $reserved_value {
                            return ::std::result::Result::Err($crate::error::Error::ReservedField {
                                field: ::std::stringify!($field_name),
                            });
                        }
                    )?)*
                    ::std::result::Result::Ok(())
                }
            }
        )*
    };
}

/* ---------------------------------------------------------------------------------------------- */
