//! This file ensures that defmt is optional, providing stubs if it's not available

#![macro_use]
#![allow(unused_macros, unused_imports)]

#[cfg(feature = "defmt")]
pub use defmt::{bitflags, debug, error, info, warn};

#[cfg(not(feature = "defmt"))]
pub use bitflags::bitflags;

// The stubs still borrow their arguments so that values only used for logging
// don't trigger unused warnings in non-defmt builds
#[cfg(not(feature = "defmt"))]
macro_rules! info {
    ($($item:expr),* $(,)?) => {{ $( let _ = &$item; )* }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! debug {
    ($($item:expr),* $(,)?) => {{ $( let _ = &$item; )* }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! warn {
    ($($item:expr),* $(,)?) => {{ $( let _ = &$item; )* }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! error {
    ($($item:expr),* $(,)?) => {{ $( let _ = &$item; )* }};
}
