//! Built-in modules shipped with the console
//!
//! - [`SystemInfo`]: periodic host facts gathered from every monitor

mod system_info;

pub use system_info::{HostFacts, SystemInfo, SYSTEM_INFO_MODULE_ID};

use tracing::debug;

use crate::config::ModulesSettings;
use crate::service::{ConsoleService, Schedule};

/// Register the built-in modules enabled in `settings`
pub fn register_builtin(service: &ConsoleService, settings: &ModulesSettings) {
    let system_info = &settings.system_info;
    if system_info.enabled {
        let schedule = Schedule::pull(system_info.delay_secs, system_info.interval_secs);
        service.register(SYSTEM_INFO_MODULE_ID, SystemInfo::with_schedule(schedule));
        debug!(
            module_id = SYSTEM_INFO_MODULE_ID,
            interval_secs = system_info.interval_secs,
            "Registered built-in module"
        );
    }
}
