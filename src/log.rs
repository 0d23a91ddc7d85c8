use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

/// Mute all bridge log output (`--quiet`).
pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

#[macro_export]
macro_rules! cb_info {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::info!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::info!(target: "bridge", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! cb_warn {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::warn!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::warn!(target: "bridge", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! cb_error {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::error!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::error!(target: "bridge", $($arg)+)
        }
    };
}

#[macro_export]
macro_rules! cb_debug {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::debug!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::debug!(target: "bridge", $($arg)+)
        }
    };
}
