use lazy_static::lazy_static;
use std::sync::RwLock;

/// Runtime toggles affecting the install pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Store installed contents inside seekable-compressed containers.
    pub compress_installs: bool,

    /// Run catalogue scans inline instead of on a background task.
    pub deterministic_async: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            compress_installs: false,
            deterministic_async: false,
        }
    }
}

lazy_static! {
    static ref SETTINGS: RwLock<Settings> = RwLock::new(Settings::default());
}

pub fn get() -> Settings {
    *SETTINGS.read().unwrap()
}

pub fn set(settings: Settings) {
    *SETTINGS.write().unwrap() = settings;
}

pub fn set_compress_installs(enabled: bool) {
    SETTINGS.write().unwrap().compress_installs = enabled;
}

pub fn set_deterministic_async(enabled: bool) {
    SETTINGS.write().unwrap().deterministic_async = enabled;
}
