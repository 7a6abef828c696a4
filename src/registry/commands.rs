//! Typed command surface over the registry. Requests that touch the disk or
//! do crypto run on the blocking pool; the in-memory bookkeeping stays on
//! the caller's task.

use crate::crypto;
use crate::ctr::models::certificate::Certificate;
use crate::ctr::models::cia::MetaData;
use crate::ctr::models::ticket::Ticket;
use crate::ctr::models::title_metadata::TitleMetadata;
use crate::error::{TitleVaultError, TitleVaultResult};
use crate::install::cia_file::{CiaFile, InstallResult};
use crate::install::{self, InstallStatus};
use crate::registry::import::{ImportContentContext, ImportState, ImportTitleContext};
use crate::registry::{self, MediaType, TitleInfo, TitleRegistry};
use crate::settings;
use crate::unique;
use log::{debug, warn};
use rand::RngCore;
use rand::rngs::OsRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task;

/// Buffer for a ticket delivered over the import interface.
#[derive(Debug, Default)]
pub struct TicketImport {
    data: Vec<u8>,
}

impl TicketImport {
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> TitleVaultResult<usize> {
        if offset != self.data.len() as u64 {
            return Err(TitleVaultError::InvalidState);
        }
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }
}

struct ImportingTitle {
    title_id: u64,
    media_type: MediaType,
    cia_file: CiaFile,
}

/// The title-management service: owns the registry, the current piecewise
/// import and the system-updater advisory mutex.
pub struct AmService {
    registry: Arc<TitleRegistry>,
    importing_title: tokio::sync::Mutex<Option<ImportingTitle>>,
    system_updater_mutex: Arc<tokio::sync::Mutex<()>>,
}

impl Default for AmService {
    fn default() -> Self {
        AmService::new()
    }
}

impl AmService {
    pub fn new() -> AmService {
        let _ = std::fs::create_dir_all(registry::ticket_directory());
        let registry = Arc::new(TitleRegistry::new());

        if settings::get().deterministic_async {
            registry.scan_all();
        } else {
            let scan_registry = Arc::clone(&registry);
            std::thread::spawn(move || scan_registry.scan_all());
        }

        AmService {
            registry,
            importing_title: tokio::sync::Mutex::new(None),
            system_updater_mutex: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &Arc<TitleRegistry> {
        &self.registry
    }

    pub fn system_updater_mutex(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.system_updater_mutex)
    }

    // ---- whole-archive program install ----

    /// Claims the archive-install critical section and hands out the
    /// streaming installer the caller writes archive bytes into.
    pub fn begin_import_program(&self, media_type: MediaType) -> TitleVaultResult<CiaFile> {
        if self
            .registry
            .cia_installing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TitleVaultError::InvalidState);
        }
        Ok(CiaFile::new(media_type))
    }

    pub async fn end_import_program(
        &self,
        cia_file: CiaFile,
    ) -> TitleVaultResult<Vec<InstallResult>> {
        self.finish_import_program(cia_file, false).await
    }

    pub async fn end_import_program_without_commit(
        &self,
        cia_file: CiaFile,
    ) -> TitleVaultResult<Vec<InstallResult>> {
        self.finish_import_program(cia_file, true).await
    }

    async fn finish_import_program(
        &self,
        mut cia_file: CiaFile,
        discard: bool,
    ) -> TitleVaultResult<Vec<InstallResult>> {
        let media_type = cia_file.media_type();
        let result = task::spawn_blocking(move || {
            if discard {
                cia_file.cancel();
            }
            let close_result = cia_file.close();
            (close_result, cia_file.install_results().to_vec())
        })
        .await
        .expect("blocking install task panicked");

        self.registry.cia_installing.store(false, Ordering::SeqCst);
        self.rescan(media_type).await;

        result.0?;
        Ok(result.1)
    }

    pub async fn install_archive(
        &self,
        path: PathBuf,
        decryption_authorized: bool,
    ) -> InstallStatus {
        if self
            .registry
            .cia_installing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return InstallStatus::ErrorAborted;
        }

        let status = task::spawn_blocking(move || {
            install::install_archive(&path, decryption_authorized, None)
        })
        .await
        .expect("blocking install task panicked");

        self.registry.cia_installing.store(false, Ordering::SeqCst);
        self.rescan(MediaType::Nand).await;
        self.rescan(MediaType::Sdmc).await;
        status
    }

    async fn rescan(&self, media_type: MediaType) {
        let registry = Arc::clone(&self.registry);
        if settings::get().deterministic_async {
            registry.scan_for_titles(media_type);
            registry.scan_for_tickets();
        } else {
            task::spawn_blocking(move || {
                registry.scan_for_titles(media_type);
                registry.scan_for_tickets();
            })
            .await
            .expect("blocking scan task panicked");
        }
    }

    // ---- ticket import ----

    pub fn begin_import_ticket(&self) -> TicketImport {
        TicketImport::default()
    }

    /// Parses, fixes up and persists an imported ticket, then registers it.
    pub async fn end_import_ticket(&self, import: TicketImport) -> TitleVaultResult<(u64, u64)> {
        let registry = Arc::clone(&self.registry);
        task::spawn_blocking(move || {
            let mut ticket = Ticket::from_bytes(&import.data)?;
            ticket.do_titlekey_fixup()?;

            let path = registry::ticket_path(ticket.title_id(), ticket.ticket_id());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            ticket.save(&path)?;
            registry.register_ticket(ticket.title_id(), ticket.ticket_id());

            debug!(
                "end_import_ticket: title_id={:016X} ticket_id={:016X}",
                ticket.title_id(),
                ticket.ticket_id()
            );
            Ok((ticket.title_id(), ticket.ticket_id()))
        })
        .await
        .expect("blocking ticket task panicked")
    }

    // ---- piecewise title import ----

    /// Starts importing a title whose ticket is already installed.
    pub async fn begin_import_title(
        &self,
        media_type: MediaType,
        title_id: u64,
        decryption_authorized: bool,
    ) -> TitleVaultResult<()> {
        let ticket_ids = self.registry.ticket_ids_for_title(title_id);
        let &ticket_id = ticket_ids
            .first()
            .ok_or(TitleVaultError::NotFound("ticket".into()))?;
        let ticket = Ticket::load(&registry::ticket_path(title_id, ticket_id))?;

        let mut cia_file = CiaFile::new_from_cdn(media_type);
        cia_file.decryption_authorized = decryption_authorized;
        cia_file.provide_ticket(ticket)?;

        self.registry
            .create_import_title_context(ImportTitleContext::new(title_id));

        let mut importing = self.importing_title.lock().await;
        *importing = Some(ImportingTitle {
            title_id,
            media_type,
            cia_file,
        });
        Ok(())
    }

    /// Persists the TMD of the importing title and opens its per-content
    /// contexts.
    pub async fn provide_import_tmd(&self, tmd: TitleMetadata) -> TitleVaultResult<()> {
        let mut importing = self.importing_title.lock().await;
        let importing = importing.as_mut().ok_or(TitleVaultError::InvalidState)?;

        let contexts: Vec<ImportContentContext> = (0..tmd.content_count())
            .map(|position| {
                ImportContentContext::new(
                    tmd.content_id(position).unwrap_or(0),
                    tmd.content_index(position).unwrap_or(0),
                    tmd.content_size(position).unwrap_or(0),
                )
            })
            .collect();

        let version = tmd.title_version();
        let title_type = tmd.title_type();
        let size = tmd.combined_content_size();
        importing.cia_file.provide_tmd(tmd, false)?;

        let title_id = importing.title_id;
        self.registry.create_import_content_contexts(title_id, contexts);
        if let Some(mut context) = self.registry.import_title_context(title_id) {
            context.version = version;
            context.title_type = title_type;
            context.size = size;
            self.registry.create_import_title_context(context);
        }
        Ok(())
    }

    /// Streams bytes into one content of the importing title. Writes that
    /// observe a stopped or cancelled context are refused.
    pub async fn write_import_content(
        &self,
        position: usize,
        data: &[u8],
    ) -> TitleVaultResult<usize> {
        let mut importing = self.importing_title.lock().await;
        let importing = importing.as_mut().ok_or(TitleVaultError::InvalidState)?;

        let context = self
            .registry
            .import_title_context(importing.title_id)
            .ok_or(TitleVaultError::InvalidState)?;
        match context.state {
            ImportState::WaitingForImport => {}
            ImportState::Deleting => return Err(TitleVaultError::NotAuthorized),
            _ => return Err(TitleVaultError::InvalidState),
        }

        let written = importing.cia_file.write_content_indexed(position, data)?;
        let index = importing
            .cia_file
            .tmd()?
            .content_index(position)
            .ok_or(TitleVaultError::InvalidArgument("bad content position"))?;
        let title_id = importing.title_id;
        self.registry
            .update_import_content_context(title_id, index, |content| {
                content.current_size += written as u64;
            })?;
        Ok(written)
    }

    pub async fn stop_import_title(&self) -> TitleVaultResult<()> {
        let importing = self.importing_title.lock().await;
        let importing = importing.as_ref().ok_or(TitleVaultError::InvalidState)?;
        self.registry
            .set_import_title_state(importing.title_id, ImportState::Resumable)
    }

    pub async fn resume_import_title(
        &self,
        media_type: MediaType,
        title_id: u64,
    ) -> TitleVaultResult<()> {
        let importing = self.importing_title.lock().await;
        let importing = importing.as_ref().ok_or(TitleVaultError::InvalidState)?;
        if importing.title_id != title_id || importing.media_type != media_type {
            return Err(TitleVaultError::InvalidState);
        }
        self.registry.resume_import_title_context(title_id)
    }

    pub async fn cancel_import_title(&self) -> TitleVaultResult<()> {
        let mut importing = self.importing_title.lock().await;
        let mut importing = importing.take().ok_or(TitleVaultError::InvalidState)?;
        self.registry
            .set_import_title_state(importing.title_id, ImportState::Deleting)?;

        task::spawn_blocking(move || {
            importing.cia_file.cancel();
            let _ = importing.cia_file.close();
        })
        .await
        .expect("blocking cancel task panicked");
        Ok(())
    }

    /// Finishes the piecewise import: contents that received all of their
    /// bytes move to waiting-for-commit along with the title context.
    pub async fn end_import_title(&self) -> TitleVaultResult<()> {
        let mut importing = self.importing_title.lock().await;
        let mut importing = importing.take().ok_or(TitleVaultError::InvalidState)?;
        let title_id = importing.title_id;

        self.registry
            .set_import_title_state(title_id, ImportState::WaitingForCommit)?;
        for content in self.registry.import_content_contexts(title_id) {
            if content.current_size >= content.size {
                let _ = self
                    .registry
                    .update_import_content_context(title_id, content.index, |c| {
                        c.state = ImportState::WaitingForCommit;
                    });
            }
        }

        importing.cia_file.set_done();
        task::spawn_blocking(move || importing.cia_file.close())
            .await
            .expect("blocking close task panicked")
    }

    pub async fn commit_import_titles(
        &self,
        media_type: MediaType,
        title_ids: &[u64],
        cleanup: bool,
    ) -> TitleVaultResult<()> {
        warn!("commit_import_titles cleanup={cleanup}");
        self.registry.commit_import_titles(title_ids, cleanup);
        self.rescan(media_type).await;
        Ok(())
    }

    /// Program installs share the title commit path.
    pub async fn commit_import_programs(
        &self,
        media_type: MediaType,
        title_ids: &[u64],
        cleanup: bool,
    ) -> TitleVaultResult<()> {
        self.commit_import_titles(media_type, title_ids, cleanup).await
    }

    pub fn delete_import_title_context(&self, title_id: u64) {
        self.registry.delete_import_title_context(title_id);
    }

    pub fn get_num_import_title_contexts(&self, states: &[ImportState]) -> usize {
        self.registry
            .import_title_contexts_matching(|context| states.contains(&context.state))
            .len()
    }

    pub fn get_import_title_context_list(&self, states: &[ImportState]) -> Vec<ImportTitleContext> {
        self.registry
            .import_title_contexts_matching(|context| states.contains(&context.state))
    }

    pub fn get_import_content_contexts(&self, title_id: u64) -> Vec<ImportContentContext> {
        self.registry.import_content_contexts(title_id)
    }

    pub fn needs_cleanup(&self) -> bool {
        self.registry.needs_cleanup()
    }

    pub fn do_cleanup(&self) {
        self.registry.do_cleanup()
    }

    // ---- installed-title queries ----

    pub fn get_num_programs(&self, media_type: MediaType) -> usize {
        self.registry.title_count(media_type)
    }

    pub fn get_program_list(&self, media_type: MediaType) -> Vec<u64> {
        self.registry.title_list(media_type)
    }

    /// Resolves infos for explicit title ids; any missing title fails the
    /// whole request.
    pub async fn get_program_infos(
        &self,
        media_type: MediaType,
        title_ids: Vec<u64>,
    ) -> TitleVaultResult<Vec<TitleInfo>> {
        task::spawn_blocking(move || {
            title_ids
                .iter()
                .map(|&title_id| registry::installed_title_info(media_type, title_id))
                .collect()
        })
        .await
        .expect("blocking query task panicked")
    }

    pub async fn delete_user_program(
        &self,
        media_type: MediaType,
        title_id: u64,
    ) -> TitleVaultResult<()> {
        if registry::is_system_title(title_id) {
            return Err(TitleVaultError::InvalidArgument(
                "refusing to delete a system title",
            ));
        }
        task::spawn_blocking(move || registry::uninstall_program(media_type, title_id))
            .await
            .expect("blocking delete task panicked")?;
        self.rescan(media_type).await;
        Ok(())
    }

    // ---- archive queries ----

    pub async fn get_program_info_from_cia(&self, path: PathBuf) -> TitleVaultResult<TitleInfo> {
        task::spawn_blocking(move || install::archive_title_info(&path))
            .await
            .expect("blocking query task panicked")
    }

    pub async fn get_required_size_from_cia(&self, path: PathBuf) -> TitleVaultResult<u64> {
        self.get_program_info_from_cia(path).await.map(|info| info.size)
    }

    pub async fn get_meta_data_from_cia(&self, path: PathBuf) -> TitleVaultResult<MetaData> {
        task::spawn_blocking(move || {
            let (mut file, _) = install::open_archive_reader(&path)?;
            let container = install::load_archive_prefix(file.as_mut())?;
            container
                .meta()
                .cloned()
                .ok_or(TitleVaultError::NotFound("archive has no meta block".into()))
        })
        .await
        .expect("blocking query task panicked")
    }

    /// The system-menu icon block from an archive's meta section.
    pub async fn get_system_menu_data_from_cia(&self, path: PathBuf) -> TitleVaultResult<Vec<u8>> {
        self.get_meta_data_from_cia(path)
            .await
            .map(|meta| meta.icon_data)
    }

    pub async fn get_dependency_list_from_cia(&self, path: PathBuf) -> TitleVaultResult<Vec<u8>> {
        self.get_meta_data_from_cia(path)
            .await
            .map(|meta| meta.dependency_list)
    }

    // ---- ticket queries ----

    pub fn get_num_tickets(&self) -> usize {
        self.registry.ticket_count()
    }

    pub fn get_ticket_list(&self) -> Vec<(u64, u64)> {
        self.registry.ticket_list()
    }

    pub fn get_num_ticket_ids(&self, title_id: u64) -> usize {
        self.registry.ticket_ids_for_title(title_id).len()
    }

    pub fn get_ticket_id_list(&self, title_id: u64) -> Vec<u64> {
        self.registry.ticket_ids_for_title(title_id)
    }

    /// Deleting an absent ticket is an idempotent no-op reported as
    /// already-done.
    pub async fn delete_ticket(&self, title_id: u64, ticket_id: u64) -> TitleVaultResult<()> {
        if !self.registry.unregister_ticket(title_id, ticket_id) {
            return Err(TitleVaultError::AlreadyDone);
        }
        task::spawn_blocking(move || {
            let _ = std::fs::remove_file(registry::ticket_path(title_id, ticket_id));
        })
        .await
        .expect("blocking delete task panicked");
        Ok(())
    }

    /// Exports a ticket for transfer: the serialized ticket is encrypted
    /// with a fresh AES key/IV, which in turn leave RSA-wrapped with the
    /// ticket-wrap key.
    pub async fn export_ticket_wrapped(
        &self,
        title_id: u64,
        ticket_id: u64,
    ) -> TitleVaultResult<(Vec<u8>, Vec<u8>)> {
        let tid_high = (title_id >> 32) as u32;
        if (tid_high & 0x0004_8001) == 0x0004_8001
            || tid_high == 0x0004_0001
            || (tid_high & 0x10) != 0
        {
            return Err(TitleVaultError::InvalidArgument(
                "title class cannot be exported",
            ));
        }
        if !self
            .registry
            .ticket_ids_for_title(title_id)
            .contains(&ticket_id)
        {
            return Err(TitleVaultError::NotFound("ticket".into()));
        }

        task::spawn_blocking(move || {
            let ticket = Ticket::load(&registry::ticket_path(title_id, ticket_id))?;
            let serialized = ticket.serialize();
            let mut ticket_data = serialized.clone();
            ticket_data.resize(
                crate::ctr::util::align_up(serialized.len() as u64, 0x10) as usize,
                0,
            );

            let mut key = [0u8; 16];
            let mut iv = [0u8; 16];
            OsRng.fill_bytes(&mut key);
            OsRng.fill_bytes(&mut iv);
            crypto::cbc_encrypt(&key, &iv, &mut ticket_data);

            let wrap_slot = crate::keys::with_store(|store| store.ticket_wrap_slot());
            if !wrap_slot.is_ready() {
                return Err(TitleVaultError::UnsupportedCrypto("no ticket wrap key"));
            }

            // PKCS#1 v1.5-style framing: 00 01 FF..FF 00 | key | iv
            let modulus_len = wrap_slot.modulus().len();
            let padding_len = modulus_len - (key.len() + iv.len()) - 3;
            let mut message = Vec::with_capacity(modulus_len);
            message.push(0x00);
            message.push(0x01);
            message.resize(2 + padding_len, 0xFF);
            message.push(0x00);
            message.extend_from_slice(&key);
            message.extend_from_slice(&iv);

            let wrapped = wrap_slot.modular_exponentiation(&message, Some(message.len()));
            Ok((ticket_data, wrapped))
        })
        .await
        .expect("blocking export task panicked")
    }

    // ---- device identity ----

    pub fn get_device_id(&self) -> Option<u32> {
        unique::otp().map(|otp| otp.device_id())
    }

    pub fn get_device_cert(&self) -> Option<Vec<u8>> {
        unique::ct_cert().map(|cert| cert.serialize())
    }

    /// Signs arbitrary data with an ephemeral per-title certificate chained
    /// under the device certificate. Returns the signature and the
    /// serialized sub-certificate.
    pub async fn sign(&self, data: Vec<u8>, title_id: u64) -> TitleVaultResult<(Vec<u8>, Vec<u8>)> {
        task::spawn_blocking(move || {
            let ct_cert =
                unique::ct_cert().ok_or(TitleVaultError::NotFound("device certificate".into()))?;

            let issuer = format!("{}-{}", ct_cert.issuer_str(), ct_cert.name_str());
            let name = format!("AP{title_id:016x}");
            let ap_cert = Certificate::build_ecc(&ct_cert, &issuer, &name, 0);

            let signature = ap_cert.sign(&data);
            Ok((signature.rs().to_vec(), ap_cert.serialize()))
        })
        .await
        .expect("blocking sign task panicked")
    }
}
