#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod protocol;
pub mod state;

pub use state::{Buttons, ControllerState, DpadPosition, Gyro, GyroAxis, StateDiff, Stick};

/// The TCP port on which the console-side relay listens for line commands
pub const TCP_RELAY_PORT: u16 = 6000;

/// Baud rate of the USB-serial relay microcontroller
pub const SERIAL_BAUD_RATE: u32 = 115_200;

/// Tick length of the wired USB-serial relay, in milliseconds
pub const WIRED_TICK_MS: u64 = 8;

/// Tick length of the wireless USB-serial relay, in milliseconds
pub const WIRELESS_TICK_MS: u64 = 15;

/// Derive To/From with an added "Unknown" variant catch-all for converting
/// from numerical values that do not match a valid variant in order to
/// avoid either panicking or cumbersome error handling.
#[macro_export]
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr
            ),+ $(,)?
        }
    ) => {
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            /// Catch-all for values that do not match a variant
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}
