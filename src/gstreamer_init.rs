//! One-time GStreamer initialization
//!
//! The GStreamer encoder platform calls [`init_gstreamer`] before building
//! any pipeline. Repeated calls are cheap and report the first outcome.

use std::sync::OnceLock;

static GSTREAMER_INIT: OnceLock<bool> = OnceLock::new();

/// Initialize GStreamer once; returns whether it is usable
pub fn init_gstreamer() -> bool {
    *GSTREAMER_INIT.get_or_init(|| match gstreamer::init() {
        Ok(()) => {
            log::info!("GStreamer initialized successfully");
            log_gstreamer_version();
            true
        }
        Err(e) => {
            log::error!("Failed to initialize GStreamer: {}", e);
            log::error!("Hardware and software video encoding will not be available");
            false
        }
    })
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gstreamer::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (CVS)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("GStreamer version: {}.{}.{}{}", major, minor, micro, nano_str);
}
