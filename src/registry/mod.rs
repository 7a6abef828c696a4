//! Installed-title registry: the directory-backed database of installed
//! titles and tickets, keyed by media type and title id, plus the import
//! context bookkeeping used while installs are in flight.

pub mod commands;
pub mod import;

use crate::ctr::models::title_metadata::TitleMetadata;
use crate::dirs;
use crate::error::{TitleVaultError, TitleVaultResult};
use import::{ImportContentContext, ImportState, ImportTitleContext};
use log::{debug, error};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Persistence target for a title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MediaType {
    Nand = 0,
    Sdmc = 1,
    GameCard = 2,
}

pub const TID_HIGH_UPDATE: u32 = 0x0004000E;
pub const TID_HIGH_DLC: u32 = 0x0004008C;
pub const TWL_TITLE_ID_FLAG: u64 = 0x0000_8000_0000_0000;

const PLATFORM_CTR: u16 = 0x0004;
const CATEGORY_SYSTEM: u16 = 0x0010;
const CATEGORY_DLP: u16 = 0x0001;
const VARIATION_SYSTEM: u8 = 0x02;

const TITLE_ID_VALID_LENGTH: usize = 16;

/// Installed-title summary returned by the program queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TitleInfo {
    pub title_id: u64,
    pub size: u64,
    pub version: u16,
    pub title_type: u32,
}

/// Where a title installs to, judged from its id bits alone.
pub fn title_media_type(title_id: u64) -> MediaType {
    let platform = (title_id >> 48) as u16;
    let category = ((title_id >> 32) & 0xFFFF) as u16;
    let variation = (title_id & 0xFF) as u8;

    if platform != PLATFORM_CTR {
        return MediaType::Nand;
    }
    if category & CATEGORY_SYSTEM != 0
        || category & CATEGORY_DLP != 0
        || variation & VARIATION_SYSTEM != 0
    {
        return MediaType::Nand;
    }
    MediaType::Sdmc
}

/// The update title for a given title: the high word is simply replaced.
pub fn title_update_id(title_id: u64) -> u64 {
    (title_id & 0xFFFF_FFFF) | ((TID_HIGH_UPDATE as u64) << 32)
}

pub fn is_dlc_title(title_id: u64) -> bool {
    (title_id >> 32) as u32 == TID_HIGH_DLC
}

pub fn is_system_title(title_id: u64) -> bool {
    ((title_id >> 32) & CATEGORY_SYSTEM as u64) != 0
}

pub fn ticket_directory() -> PathBuf {
    dirs::nand_dir().join("dbs/ticket.db")
}

pub fn ticket_path(title_id: u64, ticket_id: u64) -> PathBuf {
    ticket_directory().join(format!("{title_id:016X}.{ticket_id:016X}.tik"))
}

/// The `title/` root for a storage medium. GameCard titles have no backing
/// directory here.
pub fn media_title_path(media_type: MediaType) -> PathBuf {
    match media_type {
        MediaType::Nand => dirs::nand_dir().join("title"),
        MediaType::Sdmc => dirs::sdmc_dir().join("title"),
        MediaType::GameCard => {
            error!("Invalid request for a gamecard title path!");
            PathBuf::new()
        }
    }
}

pub fn title_path(media_type: MediaType, title_id: u64) -> PathBuf {
    let high = (title_id >> 32) as u32;
    let low = (title_id & 0xFFFF_FFFF) as u32;
    media_title_path(media_type).join(format!("{high:08x}/{low:08x}"))
}

pub fn title_content_dir(media_type: MediaType, title_id: u64) -> PathBuf {
    title_path(media_type, title_id).join("content")
}

fn scan_tmd_ids(content_dir: &PathBuf) -> (Option<u32>, Option<u32>) {
    let mut base: Option<u32> = None;
    let mut update: Option<u32> = None;
    if let Ok(entries) = std::fs::read_dir(content_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".tmd") else {
                continue;
            };
            let Ok(id) = u32::from_str_radix(stem, 16) else {
                continue;
            };
            base = Some(base.map_or(id, |current| current.min(id)));
            update = Some(update.map_or(id, |current| current.max(id)));
        }
    }
    (base, update)
}

/// Path of the authoritative (or incoming, with `update`) TMD for a title.
///
/// The slot ids are not tracked in a database; the directory is scanned and
/// the smallest id is the base, the largest the update. A fresh install
/// starts at slot zero; an update writes one past the current slot.
pub fn title_metadata_path(media_type: MediaType, title_id: u64, update: bool) -> PathBuf {
    let content_dir = title_content_dir(media_type, title_id);
    let (base, max) = scan_tmd_ids(&content_dir);

    let base_id = base.unwrap_or(0);
    let mut update_id = max.unwrap_or(0);
    if base_id == update_id {
        update_id += 1;
    }

    content_dir.join(format!("{:08x}.tmd", if update { update_id } else { base_id }))
}

/// Path of a content file by position in the authoritative TMD. DLC stores
/// all of its contents below an extra `00000000/` directory.
pub fn title_content_path(
    media_type: MediaType,
    title_id: u64,
    position: usize,
    update: bool,
) -> PathBuf {
    let mut content_dir = title_content_dir(media_type, title_id);
    let tmd_path = title_metadata_path(media_type, title_id, update);

    let mut content_id = 0u32;
    if let Ok(tmd) = TitleMetadata::load(&tmd_path) {
        match tmd.content_id(position) {
            Some(id) => content_id = id,
            None => {
                error!("Attempted to get path for non-existent content index {position:04x}.");
                return PathBuf::new();
            }
        }
        if tmd.content_count() > 1
            && tmd
                .content_type(1)
                .is_some_and(|content_type| content_type.is_optional())
        {
            content_dir = content_dir.join("00000000");
        }
    }

    content_dir.join(format!("{content_id:08x}.app"))
}

#[derive(Default)]
struct RegistryLists {
    /// Installed titles per media type (NAND, SDMC, GameCard).
    titles: [Vec<u64>; 3],
    /// title id -> installed ticket ids
    tickets: BTreeMap<u64, Vec<u64>>,
    import_titles: BTreeMap<u64, ImportTitleContext>,
    /// title id -> per-content contexts
    import_contents: BTreeMap<u64, Vec<ImportContentContext>>,
}

/// In-memory side of the registry. All lists share one mutex; scans and
/// commands take it for their whole critical section.
pub struct TitleRegistry {
    lists: Mutex<RegistryLists>,
    stop_scan: AtomicBool,
    /// Serializes the archive-install critical section against itself.
    pub(crate) cia_installing: AtomicBool,
}

impl Default for TitleRegistry {
    fn default() -> Self {
        TitleRegistry::new()
    }
}

impl TitleRegistry {
    pub fn new() -> TitleRegistry {
        TitleRegistry {
            lists: Mutex::new(RegistryLists::default()),
            stop_scan: AtomicBool::new(false),
            cia_installing: AtomicBool::new(false),
        }
    }

    pub fn stop_scans(&self) {
        self.stop_scan.store(true, Ordering::Relaxed);
    }

    pub fn scan_for_tickets(&self) {
        let mut lists = self.lists.lock().unwrap();
        self.scan_for_tickets_locked(&mut lists);
    }

    fn scan_for_tickets_locked(&self, lists: &mut RegistryLists) {
        lists.tickets.clear();
        debug!("Starting ticket scan");

        if let Ok(entries) = std::fs::read_dir(ticket_directory()) {
            for entry in entries.flatten() {
                if self.stop_scan.load(Ordering::Relaxed) {
                    break;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(stem) = name.strip_suffix(".tik") else {
                    continue;
                };
                let Some((title_part, ticket_part)) = stem.split_once('.') else {
                    continue;
                };
                let (Ok(title_id), Ok(ticket_id)) = (
                    u64::from_str_radix(title_part, 16),
                    u64::from_str_radix(ticket_part, 16),
                ) else {
                    continue;
                };
                lists.tickets.entry(title_id).or_default().push(ticket_id);
            }
        }
        debug!("Finished ticket scan");
    }

    pub fn scan_for_titles(&self, media_type: MediaType) {
        let mut lists = self.lists.lock().unwrap();
        self.scan_for_titles_locked(&mut lists, media_type);
    }

    fn scan_for_titles_locked(&self, lists: &mut RegistryLists, media_type: MediaType) {
        lists.titles[media_type as usize].clear();
        debug!("Starting title scan for media_type={media_type:?}");

        let root = media_title_path(media_type);
        let Ok(high_entries) = std::fs::read_dir(&root) else {
            debug!("Finished title scan for media_type={media_type:?}");
            return;
        };
        for high_entry in high_entries.flatten() {
            if self.stop_scan.load(Ordering::Relaxed) {
                break;
            }
            let Ok(low_entries) = std::fs::read_dir(high_entry.path()) else {
                continue;
            };
            for low_entry in low_entries.flatten() {
                if self.stop_scan.load(Ordering::Relaxed) {
                    break;
                }
                let high_name = high_entry.file_name();
                let low_name = low_entry.file_name();
                let tid_string =
                    format!("{}{}", high_name.to_string_lossy(), low_name.to_string_lossy());
                if tid_string.len() != TITLE_ID_VALID_LENGTH {
                    continue;
                }
                let Ok(title_id) = u64::from_str_radix(&tid_string, 16) else {
                    continue;
                };

                let content = title_content_path(media_type, title_id, 0, false);
                if !content.as_os_str().is_empty() && content.exists() {
                    lists.titles[media_type as usize].push(title_id);
                }
            }
        }
        debug!("Finished title scan for media_type={media_type:?}");
    }

    pub fn scan_all(&self) {
        let mut lists = self.lists.lock().unwrap();
        self.scan_for_tickets_locked(&mut lists);
        if !self.stop_scan.load(Ordering::Relaxed) {
            self.scan_for_titles_locked(&mut lists, MediaType::Nand);
        }
        if !self.stop_scan.load(Ordering::Relaxed) {
            self.scan_for_titles_locked(&mut lists, MediaType::Sdmc);
        }
    }

    pub fn title_list(&self, media_type: MediaType) -> Vec<u64> {
        self.lists.lock().unwrap().titles[media_type as usize].clone()
    }

    pub fn title_count(&self, media_type: MediaType) -> usize {
        self.lists.lock().unwrap().titles[media_type as usize].len()
    }

    pub fn register_title(&self, media_type: MediaType, title_id: u64) {
        let mut lists = self.lists.lock().unwrap();
        let titles = &mut lists.titles[media_type as usize];
        if !titles.contains(&title_id) {
            titles.push(title_id);
        }
    }

    pub fn register_ticket(&self, title_id: u64, ticket_id: u64) {
        let mut lists = self.lists.lock().unwrap();
        let entry = lists.tickets.entry(title_id).or_default();
        if !entry.contains(&ticket_id) {
            entry.push(ticket_id);
        }
    }

    pub fn unregister_ticket(&self, title_id: u64, ticket_id: u64) -> bool {
        let mut lists = self.lists.lock().unwrap();
        let Some(entry) = lists.tickets.get_mut(&title_id) else {
            return false;
        };
        let Some(position) = entry.iter().position(|&id| id == ticket_id) else {
            return false;
        };
        entry.remove(position);
        if entry.is_empty() {
            lists.tickets.remove(&title_id);
        }
        true
    }

    pub fn ticket_count(&self) -> usize {
        self.lists
            .lock()
            .unwrap()
            .tickets
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn ticket_list(&self) -> Vec<(u64, u64)> {
        self.lists
            .lock()
            .unwrap()
            .tickets
            .iter()
            .flat_map(|(&title_id, ticket_ids)| {
                ticket_ids.iter().map(move |&ticket_id| (title_id, ticket_id))
            })
            .collect()
    }

    pub fn ticket_ids_for_title(&self, title_id: u64) -> Vec<u64> {
        self.lists
            .lock()
            .unwrap()
            .tickets
            .get(&title_id)
            .cloned()
            .unwrap_or_default()
    }

    // ---- import title contexts ----

    pub fn create_import_title_context(&self, context: ImportTitleContext) {
        self.lists
            .lock()
            .unwrap()
            .import_titles
            .insert(context.title_id, context);
    }

    pub fn import_title_context(&self, title_id: u64) -> Option<ImportTitleContext> {
        self.lists
            .lock()
            .unwrap()
            .import_titles
            .get(&title_id)
            .copied()
    }

    pub fn set_import_title_state(
        &self,
        title_id: u64,
        state: ImportState,
    ) -> TitleVaultResult<()> {
        let mut lists = self.lists.lock().unwrap();
        let context = lists
            .import_titles
            .get_mut(&title_id)
            .ok_or(TitleVaultError::InvalidState)?;
        context.state = state;
        Ok(())
    }

    /// `resume` only applies to resumable contexts.
    pub fn resume_import_title_context(&self, title_id: u64) -> TitleVaultResult<()> {
        let mut lists = self.lists.lock().unwrap();
        let context = lists
            .import_titles
            .get_mut(&title_id)
            .ok_or(TitleVaultError::InvalidState)?;
        if context.state != ImportState::Resumable {
            return Err(TitleVaultError::InvalidState);
        }
        context.state = ImportState::WaitingForImport;
        Ok(())
    }

    pub fn delete_import_title_context(&self, title_id: u64) {
        let mut lists = self.lists.lock().unwrap();
        lists.import_titles.remove(&title_id);
        lists.import_contents.remove(&title_id);
    }

    pub fn import_title_contexts_matching(
        &self,
        filter: impl Fn(&ImportTitleContext) -> bool,
    ) -> Vec<ImportTitleContext> {
        self.lists
            .lock()
            .unwrap()
            .import_titles
            .values()
            .filter(|context| filter(context))
            .copied()
            .collect()
    }

    // ---- import content contexts ----

    pub fn create_import_content_contexts(
        &self,
        title_id: u64,
        contexts: Vec<ImportContentContext>,
    ) {
        self.lists
            .lock()
            .unwrap()
            .import_contents
            .insert(title_id, contexts);
    }

    pub fn import_content_contexts(&self, title_id: u64) -> Vec<ImportContentContext> {
        self.lists
            .lock()
            .unwrap()
            .import_contents
            .get(&title_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_import_content_context(
        &self,
        title_id: u64,
        index: u16,
        f: impl FnOnce(&mut ImportContentContext),
    ) -> TitleVaultResult<()> {
        let mut lists = self.lists.lock().unwrap();
        let contexts = lists
            .import_contents
            .get_mut(&title_id)
            .ok_or(TitleVaultError::InvalidState)?;
        let context = contexts
            .iter_mut()
            .find(|context| context.index == index)
            .ok_or(TitleVaultError::InvalidState)?;
        f(context);
        Ok(())
    }

    /// Commit: titles waiting for commit become needs-cleanup; with
    /// `cleanup`, every resumable / waiting / needs-cleanup context is
    /// pruned outright.
    pub fn commit_import_titles(&self, title_ids: &[u64], cleanup: bool) {
        let mut lists = self.lists.lock().unwrap();

        for &title_id in title_ids {
            if let Some(contexts) = lists.import_contents.get_mut(&title_id) {
                for context in contexts.iter_mut() {
                    if context.state == ImportState::WaitingForCommit {
                        context.state = ImportState::NeedsCleanup;
                    }
                }
            }
            if let Some(context) = lists.import_titles.get_mut(&title_id) {
                if context.state == ImportState::WaitingForCommit {
                    context.state = ImportState::NeedsCleanup;
                }
            }
        }

        if cleanup {
            let prunable = |state: ImportState| {
                matches!(
                    state,
                    ImportState::Resumable
                        | ImportState::WaitingForImport
                        | ImportState::NeedsCleanup
                )
            };
            for contexts in lists.import_contents.values_mut() {
                contexts.retain(|context| !prunable(context.state));
            }
            lists.import_contents.retain(|_, contexts| !contexts.is_empty());
            lists.import_titles.retain(|_, context| !prunable(context.state));
        }
    }

    pub fn needs_cleanup(&self) -> bool {
        self.lists
            .lock()
            .unwrap()
            .import_titles
            .values()
            .any(|context| context.state == ImportState::NeedsCleanup)
    }

    pub fn do_cleanup(&self) {
        let mut lists = self.lists.lock().unwrap();
        lists
            .import_titles
            .retain(|_, context| context.state != ImportState::NeedsCleanup);
        for contexts in lists.import_contents.values_mut() {
            contexts.retain(|context| context.state != ImportState::NeedsCleanup);
        }
        lists.import_contents.retain(|_, contexts| !contexts.is_empty());
    }
}

/// Builds a [`TitleInfo`] for an installed title from its authoritative TMD.
pub fn installed_title_info(media_type: MediaType, title_id: u64) -> TitleVaultResult<TitleInfo> {
    let tmd_path = title_metadata_path(media_type, title_id, false);
    let tmd = TitleMetadata::load(&tmd_path)?;
    Ok(TitleInfo {
        title_id,
        size: tmd.combined_content_size(),
        version: tmd.title_version(),
        title_type: tmd.title_type(),
    })
}

/// Deletes a title's contents, keeping the title directory so save data
/// survives.
pub fn uninstall_program(media_type: MediaType, title_id: u64) -> TitleVaultResult<()> {
    let content_dir = title_content_dir(media_type, title_id);
    if !content_dir.exists() {
        return Err(TitleVaultError::NotFound(
            content_dir.display().to_string(),
        ));
    }
    std::fs::remove_dir_all(&content_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctr::models::title_metadata::tests::sample_tmd;
    use crate::testing::env_lock;
    use tempfile::TempDir;

    fn with_user_root(dir: &TempDir) {
        dirs::set_user_root(dir.path());
    }

    #[test]
    fn media_type_classification() {
        // User application
        assert_eq!(title_media_type(0x0004000000030000), MediaType::Sdmc);
        // System title category
        assert_eq!(title_media_type(0x0004001000020000), MediaType::Nand);
        // DLP child
        assert_eq!(title_media_type(0x0004000100020000), MediaType::Nand);
        // System variation bit
        assert_eq!(title_media_type(0x0004000000010002), MediaType::Nand);
        // Foreign platform
        assert_eq!(title_media_type(0x0001000000000000), MediaType::Nand);
    }

    #[test]
    fn update_id_replaces_high_word() {
        assert_eq!(title_update_id(0x0004000000030000), 0x0004000E00030000);
        assert!(is_dlc_title(0x0004008C00030000));
        assert!(!is_dlc_title(0x0004000000030000));
    }

    #[test]
    fn ticket_path_layout() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        with_user_root(&dir);

        let path = ticket_path(0x000400000F700C00, 0x0000000100000002);
        assert!(
            path.ends_with("dbs/ticket.db/000400000F700C00.0000000100000002.tik"),
            "{path:?}"
        );
    }

    #[test]
    fn tmd_update_slot_resolution() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        with_user_root(&dir);

        let title_id = 0x0004000000030000u64;
        let content_dir = title_content_dir(MediaType::Sdmc, title_id);
        std::fs::create_dir_all(&content_dir).unwrap();

        // Empty directory: base is slot 0, the incoming update slot 1.
        assert!(
            title_metadata_path(MediaType::Sdmc, title_id, false).ends_with("00000000.tmd")
        );
        assert!(title_metadata_path(MediaType::Sdmc, title_id, true).ends_with("00000001.tmd"));

        // A single installed TMD: it is both base and max, update goes one past.
        std::fs::write(content_dir.join("00000000.tmd"), b"x").unwrap();
        assert!(
            title_metadata_path(MediaType::Sdmc, title_id, false).ends_with("00000000.tmd")
        );
        assert!(title_metadata_path(MediaType::Sdmc, title_id, true).ends_with("00000001.tmd"));

        // Base and pending update present: no further slot is invented.
        std::fs::write(content_dir.join("00000001.tmd"), b"y").unwrap();
        assert!(
            title_metadata_path(MediaType::Sdmc, title_id, false).ends_with("00000000.tmd")
        );
        assert!(title_metadata_path(MediaType::Sdmc, title_id, true).ends_with("00000001.tmd"));
    }

    #[test]
    fn content_paths_follow_the_tmd() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        with_user_root(&dir);

        let title_id = 0x0004000000030000u64;
        let content_dir = title_content_dir(MediaType::Sdmc, title_id);
        std::fs::create_dir_all(&content_dir).unwrap();

        let tmd = sample_tmd(&[(0x1A, 0, 0, 16), (0x2B, 1, 0, 16)]);
        tmd.save(&title_metadata_path(MediaType::Sdmc, title_id, false))
            .unwrap();

        let first = title_content_path(MediaType::Sdmc, title_id, 0, false);
        assert!(first.ends_with("content/0000001a.app"), "{first:?}");
        let second = title_content_path(MediaType::Sdmc, title_id, 1, false);
        assert!(second.ends_with("content/0000002b.app"), "{second:?}");
    }

    #[test]
    fn dlc_contents_live_in_a_subdirectory() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        with_user_root(&dir);

        let title_id = 0x0004008C00030000u64;
        let content_dir = title_content_dir(MediaType::Sdmc, title_id);
        std::fs::create_dir_all(&content_dir).unwrap();

        use crate::ctr::models::title_metadata::ContentType;
        let tmd = sample_tmd(&[(0, 0, 0, 16), (1, 1, ContentType::OPTIONAL, 16)]);
        tmd.save(&title_metadata_path(MediaType::Sdmc, title_id, false))
            .unwrap();

        let path = title_content_path(MediaType::Sdmc, title_id, 0, false);
        assert!(path.ends_with("content/00000000/00000000.app"), "{path:?}");
    }

    #[test]
    fn scans_pick_up_tickets_and_titles() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        with_user_root(&dir);

        std::fs::create_dir_all(ticket_directory()).unwrap();
        std::fs::write(
            ticket_directory().join("0004000000030000.0000000000000001.tik"),
            b"t",
        )
        .unwrap();
        std::fs::write(
            ticket_directory().join("0004000000030000.0000000000000002.tik"),
            b"t",
        )
        .unwrap();
        std::fs::write(ticket_directory().join("garbage.txt"), b"x").unwrap();

        let title_id = 0x0004000000030000u64;
        let content_dir = title_content_dir(MediaType::Sdmc, title_id);
        std::fs::create_dir_all(&content_dir).unwrap();
        let tmd = sample_tmd(&[(5, 0, 0, 16)]);
        tmd.save(&content_dir.join("00000000.tmd")).unwrap();
        std::fs::write(content_dir.join("00000005.app"), b"app").unwrap();

        let registry = TitleRegistry::new();
        registry.scan_all();

        let mut ticket_ids = registry.ticket_ids_for_title(title_id);
        ticket_ids.sort_unstable();
        assert_eq!(ticket_ids, vec![1, 2]);
        assert_eq!(registry.ticket_count(), 2);
        assert_eq!(registry.title_list(MediaType::Sdmc), vec![title_id]);
        assert_eq!(registry.title_count(MediaType::Nand), 0);
    }

    #[test]
    fn import_state_machine_walkthrough() {
        let registry = TitleRegistry::new();
        let title_id = 0x000400000AAAA000u64;

        registry.create_import_title_context(ImportTitleContext::new(title_id));
        assert_eq!(
            registry.import_title_context(title_id).unwrap().state,
            ImportState::WaitingForImport
        );

        // stop -> resumable -> resume -> waiting again
        registry
            .set_import_title_state(title_id, ImportState::Resumable)
            .unwrap();
        registry.resume_import_title_context(title_id).unwrap();
        assert_eq!(
            registry.import_title_context(title_id).unwrap().state,
            ImportState::WaitingForImport
        );

        // resume only applies to resumable contexts
        assert!(registry.resume_import_title_context(title_id).is_err());

        registry
            .set_import_title_state(title_id, ImportState::WaitingForCommit)
            .unwrap();
        registry.commit_import_titles(&[title_id], false);
        assert_eq!(
            registry.import_title_context(title_id).unwrap().state,
            ImportState::NeedsCleanup
        );
        assert!(registry.needs_cleanup());

        registry.do_cleanup();
        assert!(registry.import_title_context(title_id).is_none());
        assert!(!registry.needs_cleanup());
    }

    #[test]
    fn commit_with_cleanup_prunes_stale_contexts() {
        let registry = TitleRegistry::new();

        registry.create_import_title_context(ImportTitleContext::new(1));
        registry.create_import_title_context(ImportTitleContext::new(2));
        registry.create_import_title_context(ImportTitleContext::new(3));
        registry
            .set_import_title_state(2, ImportState::Resumable)
            .unwrap();
        registry
            .set_import_title_state(3, ImportState::WaitingForCommit)
            .unwrap();
        registry.create_import_content_contexts(
            3,
            vec![{
                let mut context = ImportContentContext::new(0, 0, 16);
                context.state = ImportState::WaitingForCommit;
                context
            }],
        );

        registry.commit_import_titles(&[3], true);

        // 1 (waiting) and 2 (resumable) pruned, 3 went through needs-cleanup
        // and was pruned as well.
        assert!(registry.import_title_context(1).is_none());
        assert!(registry.import_title_context(2).is_none());
        assert!(registry.import_title_context(3).is_none());
        assert!(registry.import_content_contexts(3).is_empty());
    }

    #[test]
    fn uninstall_keeps_the_title_directory() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        with_user_root(&dir);

        let title_id = 0x0004000000031000u64;
        let content_dir = title_content_dir(MediaType::Sdmc, title_id);
        std::fs::create_dir_all(&content_dir).unwrap();
        std::fs::write(content_dir.join("00000000.app"), b"app").unwrap();

        uninstall_program(MediaType::Sdmc, title_id).unwrap();
        assert!(!content_dir.exists());
        assert!(title_path(MediaType::Sdmc, title_id).exists());

        // Deleting again reports not-found.
        assert!(matches!(
            uninstall_program(MediaType::Sdmc, title_id),
            Err(TitleVaultError::NotFound(_))
        ));
    }
}
