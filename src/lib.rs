//! titlevault: the title-installation and content-container core of a CTR
//! (3DS-family) emulator. It ingests installable archives, validates and
//! persists their tickets and title metadata, decrypts content containers
//! on the fly, stores contents per-console encrypted and optionally
//! seekable-compressed, and maintains the installed-title registry.

pub mod crypto;
pub mod ctr;
pub mod dirs;
pub mod error;
pub mod install;
pub mod keys;
pub mod registry;
pub mod settings;
pub mod unique;
pub mod vfs;

pub use error::{TitleVaultError, TitleVaultResult};
pub use install::{InstallStatus, check_archive, install_archive};
pub use registry::commands::AmService;
pub use registry::{MediaType, TitleRegistry};

#[cfg(test)]
pub(crate) mod testing {
    use lazy_static::lazy_static;
    use std::sync::{Mutex, MutexGuard};

    lazy_static! {
        static ref ENV_LOCK: Mutex<()> = Mutex::new(());
    }

    /// Tests that touch process-wide state (key store, unique data, user
    /// directories) serialize on this lock.
    pub fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
