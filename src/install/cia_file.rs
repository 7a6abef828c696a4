use crate::crypto::{self, Aes128Ctr};
use crate::ctr::models::cia::{CIA_HEADER_SIZE, CiaContainer, CiaHeader};
use crate::ctr::models::ncch::NCCH_MAGIC;
use crate::ctr::models::ticket::Ticket;
use crate::ctr::models::title_metadata::TitleMetadata;
use crate::error::{TitleVaultError, TitleVaultResult};
use crate::install::ncch_sink::NcchCryptoFile;
use crate::registry::{self, MediaType};
use crate::settings;
use crate::unique::UniqueCryptoFileId;
use crate::vfs::crypto_file::CryptoFile;
use crate::vfs::z3ds::{DEFAULT_CIA_FRAME_SIZE, Z3dsWriteFile};
use crate::vfs::{ByteFile, PlainFile};
use aes::cipher::StreamCipher;
use log::{debug, error};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallState {
    InstallStarted,
    HeaderLoaded,
    TicketLoaded,
    TmdLoaded,
    ContentWritten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallResultKind {
    Ticket,
    Tmd,
    Content,
}

/// Outcome of one sub-install (ticket, TMD or a single content).
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub kind: InstallResultKind,
    pub path: PathBuf,
    pub error: Option<String>,
}

impl InstallResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Streaming installer for one installable archive. Bytes must arrive
/// strictly sequentially; the leading sections are buffered until they can
/// be parsed, content payloads are routed into per-content crypto sinks.
pub struct CiaFile {
    media_type: MediaType,
    from_cdn: bool,
    pub decryption_authorized: bool,

    install_state: InstallState,
    written: u64,
    data: Vec<u8>,
    container: CiaContainer,

    content_written: Vec<u64>,
    content_paths: Vec<PathBuf>,
    content_ciphers: Vec<Option<Aes128Ctr>>,
    current_index: Option<usize>,
    current_file: Option<NcchCryptoFile>,
    current_result: Option<InstallResult>,
    install_results: Vec<InstallResult>,

    is_update: bool,
    is_additional_content: bool,
    is_done: bool,
    aborted: bool,
    closed: bool,
}

impl CiaFile {
    pub fn new(media_type: MediaType) -> CiaFile {
        CiaFile {
            media_type,
            from_cdn: false,
            decryption_authorized: false,
            install_state: InstallState::InstallStarted,
            written: 0,
            data: Vec::new(),
            container: CiaContainer::default(),
            content_written: Vec::new(),
            content_paths: Vec::new(),
            content_ciphers: Vec::new(),
            current_index: None,
            current_file: None,
            current_result: None,
            install_results: Vec::new(),
            is_update: false,
            is_additional_content: false,
            is_done: false,
            aborted: false,
            closed: false,
        }
    }

    /// Piecewise install (ticket, TMD and contents delivered separately).
    /// A placeholder header keeps the container initialized.
    pub fn new_from_cdn(media_type: MediaType) -> CiaFile {
        let mut cia = CiaFile::new(media_type);
        cia.from_cdn = true;
        let fake_header = CiaHeader::empty();
        let mut raw = Vec::new();
        use binrw::BinWrite;
        fake_header
            .write(&mut std::io::Cursor::new(&mut raw))
            .expect("header serialization cannot fail");
        cia.container
            .load_header(&raw)
            .expect("placeholder header is always valid");
        cia.install_state = InstallState::HeaderLoaded;
        cia
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn state(&self) -> InstallState {
        self.install_state
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn install_results(&self) -> &[InstallResult] {
        &self.install_results
    }

    pub fn tmd(&self) -> TitleVaultResult<&TitleMetadata> {
        self.container.tmd()
    }

    pub fn ticket(&self) -> TitleVaultResult<&Ticket> {
        self.container.ticket()
    }

    /// Marks a piecewise install as finished so close() commits it.
    pub fn set_done(&mut self) {
        self.is_done = true;
    }

    /// Forces the abort path on close, discarding written contents.
    pub fn cancel(&mut self) {
        self.aborted = true;
    }

    pub fn write(&mut self, offset: u64, buf: &[u8]) -> TitleVaultResult<usize> {
        if offset != self.written {
            error!(
                "Non-sequential archive write (expected {:#x}, got {:#x})",
                self.written, offset
            );
            return Err(TitleVaultError::InvalidState);
        }
        self.written += buf.len() as u64;

        // The archive layout is header > certs > ticket > TMD > contents >
        // meta. Everything before the content block is buffered at absolute
        // offsets so each section can be parsed once enough has arrived.
        if self.install_state == InstallState::InstallStarted {
            self.data.extend_from_slice(buf);
            if self.written < CIA_HEADER_SIZE {
                return Ok(buf.len());
            }
            self.container.load_header(&self.data)?;
            self.install_state = InstallState::HeaderLoaded;
        } else if (self.data.len() as u64) < self.container.content_offset() {
            let wanted = (self.container.content_offset() - self.data.len() as u64) as usize;
            self.data.extend_from_slice(&buf[..wanted.min(buf.len())]);
        }

        let content_offset = self.container.content_offset();
        if self.written >= content_offset && self.install_state == InstallState::HeaderLoaded {
            self.write_ticket()?;
            self.write_title_metadata()?;
        }

        if self.install_state < InstallState::TmdLoaded {
            return Ok(buf.len());
        }

        self.write_content_data(offset, buf)?;
        Ok(buf.len())
    }

    fn record(
        &mut self,
        kind: InstallResultKind,
        path: PathBuf,
        result: TitleVaultResult<()>,
    ) -> TitleVaultResult<()> {
        self.install_results.push(InstallResult {
            kind,
            path,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    fn write_ticket(&mut self) -> TitleVaultResult<()> {
        let result = self.install_ticket();
        let path = self
            .container
            .ticket()
            .map(|ticket| registry::ticket_path(ticket.title_id(), ticket.ticket_id()))
            .unwrap_or_default();
        self.record(InstallResultKind::Ticket, path, result)
    }

    fn install_ticket(&mut self) -> TitleVaultResult<()> {
        let ticket_offset = self.container.header()?.ticket_offset() as usize;
        self.container.load_ticket(&self.data, ticket_offset)?;

        let ticket = self.container.ticket_mut()?;
        ticket.do_titlekey_fixup()?;

        let ticket_path = registry::ticket_path(ticket.title_id(), ticket.ticket_id());
        if let Some(parent) = ticket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.container.ticket()?.save(&ticket_path)?;

        self.install_state = InstallState::TicketLoaded;
        Ok(())
    }

    fn write_title_metadata(&mut self) -> TitleVaultResult<()> {
        let result = self.install_title_metadata();
        let path = match self.container.tmd() {
            Ok(tmd) => registry::title_metadata_path(self.media_type, tmd.title_id(), self.is_update),
            Err(_) => PathBuf::new(),
        };
        self.record(InstallResultKind::Tmd, path, result)
    }

    fn install_title_metadata(&mut self) -> TitleVaultResult<()> {
        let tmd_offset = self.container.header()?.tmd_offset() as usize;
        self.container.load_title_metadata(&self.data, tmd_offset)?;
        let tmd = self.container.tmd()?.clone();
        self.save_and_prepare_tmd(&tmd)
    }

    /// If a TMD already exists for the title, the incoming one goes into
    /// the next update slot; both stay on disk until the install commits
    /// and stale contents can be discarded.
    fn save_and_prepare_tmd(&mut self, tmd: &TitleMetadata) -> TitleVaultResult<()> {
        if registry::title_metadata_path(self.media_type, tmd.title_id(), false).exists() {
            self.is_update = true;
        }

        let tmd_path = registry::title_metadata_path(self.media_type, tmd.title_id(), self.is_update);
        if let Some(parent) = tmd_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tmd.save(&tmd_path)?;

        self.prepare_to_import_content(tmd)
    }

    fn prepare_to_import_content(&mut self, tmd: &TitleMetadata) -> TitleVaultResult<()> {
        let content_count = tmd.content_count();
        self.content_written = vec![0; content_count];
        self.current_file = None;
        self.current_index = None;
        self.content_paths = (0..content_count)
            .map(|position| {
                registry::title_content_path(
                    self.media_type,
                    tmd.title_id(),
                    position,
                    self.is_update,
                )
            })
            .collect();

        if tmd.has_encrypted_content() {
            if !self.decryption_authorized {
                error!("Blocked unauthorized encrypted archive installation.");
                return Err(TitleVaultError::NotAuthorized);
            }
            let title_key = self
                .container
                .ticket()?
                .title_key()
                .ok_or(TitleVaultError::NotFound("title key".into()))?;
            self.content_ciphers = (0..content_count)
                .map(|position| {
                    tmd.content_ctr(position)
                        .map(|ctr| crypto::ctr_cipher(&title_key, &ctr))
                })
                .collect();
        } else {
            debug!("Title has no encrypted content, skipping decryption state.");
            self.content_ciphers = (0..content_count).map(|_| None).collect();
        }

        self.install_state = InstallState::TmdLoaded;
        Ok(())
    }

    /// Ticket delivered out of band instead of from the archive bytes.
    pub fn provide_ticket(&mut self, mut ticket: Ticket) -> TitleVaultResult<()> {
        debug_assert!(self.from_cdn, "only piecewise installs provide tickets");
        ticket.do_titlekey_fixup()?;
        self.container.provide_ticket(ticket);
        self.install_state = InstallState::TicketLoaded;
        Ok(())
    }

    /// TMD delivered out of band; persists it and prepares content state.
    pub fn provide_tmd(&mut self, tmd: TitleMetadata, additional_content: bool) -> TitleVaultResult<()> {
        debug_assert!(self.from_cdn, "only piecewise installs provide TMDs");
        if self.install_state != InstallState::TicketLoaded {
            error!("Ticket not provided yet");
            return Err(TitleVaultError::InvalidState);
        }
        self.is_additional_content = additional_content;
        self.container.provide_title_metadata(tmd.clone());
        self.save_and_prepare_tmd(&tmd)
    }

    fn open_content_file(&mut self, path: &PathBuf) -> TitleVaultResult<NcchCryptoFile> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let base: Box<dyn ByteFile> = Box::new(PlainFile::create(path)?);

        // Decrypted contents are stored wrapped with per-console crypto so
        // installed files are not directly shareable.
        let file: Box<dyn ByteFile> = if self.decryption_authorized {
            Box::new(CryptoFile::wrap(base, UniqueCryptoFileId::Ncch)?)
        } else {
            base
        };

        let file: Box<dyn ByteFile> = if settings::get().compress_installs {
            Box::new(Z3dsWriteFile::new(file, NCCH_MAGIC, DEFAULT_CIA_FRAME_SIZE))
        } else {
            file
        };

        Ok(NcchCryptoFile::new(file, self.decryption_authorized))
    }

    fn finish_current_content(&mut self) {
        if let Some(mut file) = self.current_file.take() {
            file.close();
            if file.is_error() {
                if let Some(result) = self.current_result.as_mut() {
                    result.error = Some("content sink failed".into());
                }
            }
        }
        if let Some(result) = self.current_result.take() {
            self.install_results.push(result);
        }
        self.current_index = None;
    }

    fn switch_to_content(&mut self, position: usize) -> TitleVaultResult<()> {
        self.finish_current_content();

        let path = self.content_paths[position].clone();
        match self.open_content_file(&path) {
            Ok(file) => {
                self.current_file = Some(file);
                self.current_index = Some(position);
                self.current_result = Some(InstallResult {
                    kind: InstallResultKind::Content,
                    path,
                    error: None,
                });
                Ok(())
            }
            Err(err) => {
                self.install_results.push(InstallResult {
                    kind: InstallResultKind::Content,
                    path,
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    fn fail_current_content(&mut self, message: &str) {
        if let Some(result) = self.current_result.as_mut() {
            result.error = Some(message.into());
        }
        self.finish_current_content();
    }

    /// Routes the byte range `[offset, offset + buf.len())` into every
    /// content it overlaps. Bookkeeping tracks how much of each content has
    /// been written since a buffer may span several contents or only part
    /// of a large one.
    fn write_content_data(&mut self, offset: u64, buf: &[u8]) -> TitleVaultResult<usize> {
        let offset_max = offset + buf.len() as u64;

        for position in 0..self.content_written.len() {
            let size = self.container.content_size(position);
            if self.content_written[position] >= size {
                continue;
            }
            let content_start = self
                .container
                .content_data_offset(position)
                .ok_or(TitleVaultError::InvalidState)?;
            let range_min = content_start + self.content_written[position];
            let range_max = content_start + size;
            if range_min >= offset_max || range_max < offset {
                continue;
            }

            let available = offset_max.min(range_max) - range_min;
            if available == 0 {
                continue;
            }

            if self.current_index != Some(position) {
                self.switch_to_content(position)?;
            }

            let buf_start = (range_min - offset) as usize;
            let mut temp = buf[buf_start..buf_start + available as usize].to_vec();

            let encrypted = self
                .container
                .tmd()?
                .content_type(position)
                .is_some_and(|content_type| content_type.is_encrypted());
            if encrypted {
                if !self.decryption_authorized {
                    error!("Blocked unauthorized encrypted archive installation.");
                    self.fail_current_content("not authorized");
                    return Err(TitleVaultError::NotAuthorized);
                }
                self.content_ciphers[position]
                    .as_mut()
                    .ok_or(TitleVaultError::InvalidState)?
                    .apply_keystream(&mut temp);
            }

            let file = self.current_file.as_mut().expect("sink was just opened");
            file.write(&temp);
            if file.is_error() {
                self.fail_current_content("invalid import state");
                return Err(TitleVaultError::InvalidState);
            }

            self.content_written[position] += available;
            debug!(
                "Wrote {available} to content {position}, total {}",
                self.content_written[position]
            );
        }

        Ok(buf.len())
    }

    /// Piecewise content write addressed by TMD position instead of archive
    /// offsets.
    pub fn write_content_indexed(&mut self, position: usize, buf: &[u8]) -> TitleVaultResult<usize> {
        debug_assert!(self.from_cdn, "indexed writes are for piecewise installs");
        if self.install_state < InstallState::TmdLoaded {
            return Err(TitleVaultError::InvalidState);
        }
        let size = self.container.content_size(position);
        let remaining = size.saturating_sub(self.content_written[position]);
        let take = (buf.len() as u64).min(remaining) as usize;
        if take == 0 {
            return Ok(0);
        }

        if self.current_index != Some(position) {
            self.switch_to_content(position)?;
        }

        let mut temp = buf[..take].to_vec();
        let encrypted = self
            .container
            .tmd()?
            .content_type(position)
            .is_some_and(|content_type| content_type.is_encrypted());
        if encrypted {
            if !self.decryption_authorized {
                self.fail_current_content("not authorized");
                return Err(TitleVaultError::NotAuthorized);
            }
            self.content_ciphers[position]
                .as_mut()
                .ok_or(TitleVaultError::InvalidState)?
                .apply_keystream(&mut temp);
        }

        let file = self.current_file.as_mut().expect("sink was just opened");
        file.write(&temp);
        if file.is_error() {
            self.fail_current_content("invalid import state");
            return Err(TitleVaultError::InvalidState);
        }

        self.content_written[position] += take as u64;
        Ok(take)
    }

    pub fn content_bytes_written(&self, position: usize) -> u64 {
        self.content_written.get(position).copied().unwrap_or(0)
    }

    fn is_complete(&self) -> bool {
        if self.aborted {
            return false;
        }
        if self.from_cdn {
            return self.is_done;
        }
        self.install_state >= InstallState::TmdLoaded
            && (0..self.content_written.len())
                .all(|position| self.content_written[position] >= self.container.content_size(position))
    }

    /// Finalizes the install. A complete install prunes contents the old
    /// TMD referenced but the new one does not and removes the old TMD; an
    /// aborted one deletes the whole content directory (save data under the
    /// title directory is kept).
    pub fn close(&mut self) -> TitleVaultResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.finish_current_content();

        if !self.is_complete() {
            error!("Archive closed prematurely, aborting install...");
            if !self.is_additional_content {
                if let Ok(tmd) = self.container.tmd() {
                    let content_dir =
                        registry::title_content_dir(self.media_type, tmd.title_id());
                    let _ = std::fs::remove_dir_all(content_dir);
                }
            }
            return Ok(());
        }
        self.install_state = InstallState::ContentWritten;

        let Ok(tmd) = self.container.tmd() else {
            return Ok(());
        };
        let title_id = tmd.title_id();

        let old_tmd_path = registry::title_metadata_path(self.media_type, title_id, false);
        let new_tmd_path = self
            .install_results
            .iter()
            .find(|result| result.kind == InstallResultKind::Tmd && result.is_success())
            .map(|result| result.path.clone())
            .unwrap_or_else(|| old_tmd_path.clone());

        if new_tmd_path.exists() && old_tmd_path != new_tmd_path {
            let old_tmd = TitleMetadata::load(&old_tmd_path)?;
            let new_tmd = TitleMetadata::load(&new_tmd_path)?;

            for old_position in 0..old_tmd.content_count() {
                let old_id = old_tmd.content_id(old_position);
                let kept = (0..new_tmd.content_count())
                    .any(|new_position| new_tmd.content_id(new_position) == old_id);
                if kept {
                    continue;
                }
                let stale =
                    registry::title_content_path(self.media_type, title_id, old_position, false);
                if !stale.as_os_str().is_empty() {
                    let _ = std::fs::remove_file(stale);
                }
            }

            std::fs::remove_file(&old_tmd_path)?;
        }
        Ok(())
    }
}

impl Drop for CiaFile {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
