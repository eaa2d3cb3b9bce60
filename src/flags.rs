//! Small bitflag-struct macros, ported from `Vector35-idb-rs/src/lib.rs`'s
//! `flag_to_function!`/`flags_to_struct!` (there used for IDA function/
//! netnode flags; here for call-graph vertex flags, basic-block flags, and
//! the classifier's change-bit vector). Kept because it is exactly the
//! teacher's idiom for "a handful of named, independently-OR-able bits" and
//! rejects unknown bits at construction time the same way.

#[macro_export]
macro_rules! flag_to_function {
    ($flag_name:ident $fun_name:ident $comment:literal) => {
        #[doc = $comment]
        pub fn $fun_name(&self) -> bool {
            self.0 & $flag_name != 0
        }
    };
}

#[macro_export]
macro_rules! flags_to_struct {
    ($struct_name:ident, $struct_type:ty, $($flag_name:ident $flag_fun_name:ident $flag_doc:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
        pub struct $struct_name($struct_type);
        impl $struct_name {
            pub const NONE: $struct_name = $struct_name(0);

            pub fn from_raw(value: $struct_type) -> $crate::error::Result<Self> {
                let invalid_bits = value & !(0 $(| $flag_name)*);
                if invalid_bits != 0 {
                    Err($crate::invalid_argument!(
                        "flags {} with invalid bits {:X}",
                        stringify!($struct_name),
                        invalid_bits
                    ))
                } else {
                    Ok(Self(value))
                }
            }

            pub fn into_raw(self) -> $struct_type {
                self.0
            }

            pub fn with(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            $(
                pub const $flag_name: $struct_name = $struct_name($flag_name);
            )*

            $(
                $crate::flag_to_function!($flag_name $flag_fun_name $flag_doc);
            )*
        }

        impl std::ops::BitOr for $struct_name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    }
}
