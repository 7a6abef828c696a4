use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Base directories for persisted state. The NAND root holds system titles,
/// the ticket database and console-unique files; the SDMC root holds user
/// titles; the sysdata root holds the key table, OTP and seed database.
#[derive(Debug, Clone)]
pub struct UserDirs {
    pub sys_data: PathBuf,
    pub nand: PathBuf,
    pub sdmc: PathBuf,
}

impl Default for UserDirs {
    fn default() -> Self {
        UserDirs {
            sys_data: PathBuf::from("user/sysdata"),
            nand: PathBuf::from("user/nand"),
            sdmc: PathBuf::from("user/sdmc"),
        }
    }
}

lazy_static! {
    static ref DIRS: RwLock<UserDirs> = RwLock::new(UserDirs::default());
}

pub fn set(dirs: UserDirs) {
    *DIRS.write().unwrap() = dirs;
}

/// Points all three roots below a single base directory.
pub fn set_user_root(root: &Path) {
    set(UserDirs {
        sys_data: root.join("sysdata"),
        nand: root.join("nand"),
        sdmc: root.join("sdmc"),
    });
}

pub fn sys_data_dir() -> PathBuf {
    DIRS.read().unwrap().sys_data.clone()
}

pub fn nand_dir() -> PathBuf {
    DIRS.read().unwrap().nand.clone()
}

pub fn sdmc_dir() -> PathBuf {
    DIRS.read().unwrap().sdmc.clone()
}
