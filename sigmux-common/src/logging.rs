// Sigmux logging
//
// Control-plane code logs through the `log` facade. Nothing reachable from a
// signal handler may log: the facade can take locks and allocate.

use std::borrow::Cow;

use nix::sys::signal::Signal;

/// Environment variable holding the `env_logger` filter
pub const LOG_ENV: &str = "SIGMUX_LOG";

/// Filter used when `SIGMUX_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn";

/// Install `env_logger` with the given default filter
///
/// Returns `false` if a logger was already installed, which is the normal
/// case when several tests in one binary call this.
pub fn try_init(default_filter: &str) -> bool {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_ENV, default_filter))
        .format_timestamp_micros()
        .is_test(cfg!(test))
        .try_init()
        .is_ok()
}

/// Install `env_logger` with [`DEFAULT_FILTER`], ignoring repeat calls
pub fn init() {
    let _ = try_init(DEFAULT_FILTER);
}

/// Human readable signal name for log messages
pub fn signal_name(signum: i32) -> Cow<'static, str> {
    match Signal::try_from(signum) {
        Ok(sig) => Cow::Borrowed(sig.as_str()),
        Err(_) => Cow::Owned(format!("signal {}", signum)),
    }
}
