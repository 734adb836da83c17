use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Global flag to control per-tick pacing debug logging
pub static PACING_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set pacing debug logging on/off
pub fn set_pacing_debug(enabled: bool) {
    PACING_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    info!("🔧 Pacing debug logging {}", if enabled { "ENABLED" } else { "DISABLED" });
}

/// Check if pacing debug logging is enabled
pub fn is_pacing_debug_enabled() -> bool {
    PACING_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Install the fmt subscriber, filtered by `RUST_LOG` (defaults to `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

/// Pacing debug macro - only emits if pacing debug is enabled
#[macro_export]
macro_rules! pacing_debug {
    ($($arg:tt)*) => {
        if $crate::log::PACING_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_debug_toggle() {
        init_tracing();
        init_tracing();

        set_pacing_debug(true);
        assert!(is_pacing_debug_enabled());
        crate::pacing_debug!("visible only with the switch on");

        set_pacing_debug(false);
        assert!(!is_pacing_debug_enabled());
    }
}
