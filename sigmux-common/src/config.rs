// Sigmux configuration
//
// Runtime knobs for the OS-level trampoline and for how signals are seized.
// The phaser wait/wake backend is chosen at build time (see the
// `pipe-backend` feature of sigmux-phaser), not here.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which dispatch passes the OS trampoline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Try handlers registered without `LOW_PRIORITY`
    pub normal_priority: bool,
    /// Try handlers registered with `LOW_PRIORITY`
    pub low_priority: bool,
    /// Fall back to the pre-seizure disposition when nobody claims the signal
    pub invoke_default: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            normal_priority: true,
            low_priority: true,
            invoke_default: true,
        }
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigmuxConfig {
    /// Clear the thread signal mask when the trampoline is entered.
    ///
    /// Some Android `sigchain` versions call handlers with an arbitrary mask
    /// despite `SA_NODEFER` and an empty `sa_mask`.
    pub reset_mask_on_entry: bool,
    /// Request `SA_ONSTACK` when seizing a signal
    pub on_alt_stack: bool,
    /// Request `SA_RESTART` when seizing a signal
    pub restart_syscalls: bool,
    /// Passes run for every delivered signal
    pub dispatch: DispatchConfig,
}

impl Default for SigmuxConfig {
    fn default() -> Self {
        Self {
            reset_mask_on_entry: cfg!(target_os = "android"),
            on_alt_stack: true,
            restart_syscalls: true,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl SigmuxConfig {
    /// Parse a configuration from TOML; missing keys keep their defaults
    ///
    /// # 示例
    /// ```
    /// use sigmux_common::SigmuxConfig;
    ///
    /// let cfg = SigmuxConfig::from_toml_str("on_alt_stack = false").unwrap();
    /// assert!(!cfg.on_alt_stack);
    /// assert!(cfg.dispatch.invoke_default);
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
