//! Logging shim.
//!
//! With the `log` feature enabled, every macro here forwards to the macro of the same name in the
//! `log` crate. Without it, the arguments are still type-checked, but nothing is emitted.

#[cfg(feature = "log")]
macro_rules! emit {
    ($level:ident, $($t:tt)*) => {{ ::log::$level!($($t)*); }};
}

#[cfg(not(feature = "log"))]
macro_rules! emit {
    ($level:ident, $($t:tt)*) => {{ format_args!($($t)*); }};
}

macro_rules! error {
    ($($t:tt)*) => { emit!(error, $($t)*) };
}

macro_rules! warn {
    ($($t:tt)*) => { emit!(warn, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { emit!(info, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { emit!(debug, $($t)*) };
}

macro_rules! trace {
    ($($t:tt)*) => { emit!(trace, $($t)*) };
}
