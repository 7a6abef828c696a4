//! Top-level archive installation: transparent decompression of the input,
//! preflight checks, and the streaming drive of [`CiaFile`].

pub mod cia_file;
pub mod ncch_sink;

use crate::ctr::models::cia::{CIA_HEADER_SIZE, CiaContainer};
use crate::error::{TitleVaultError, TitleVaultResult};
use crate::registry::{self, TitleInfo};
use crate::vfs::z3ds::Z3dsReadFile;
use crate::vfs::{ByteFile, PlainFile};
use cia_file::CiaFile;
use log::{error, info};
use std::path::Path;

const INSTALL_CHUNK: usize = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    Success,
    ErrorFailedToOpenFile,
    ErrorFileNotFound,
    ErrorAborted,
    ErrorInvalid,
    ErrorEncrypted,
}

/// Preflight result for an archive on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveCheck {
    pub status: InstallStatus,
    pub is_compressed: bool,
}

pub type ProgressCallback<'a> = dyn FnMut(u64, u64) + 'a;

/// Opens an archive, unwrapping a seekable-compressed container when the
/// magic probe identifies one.
pub(crate) fn open_archive_reader(path: &Path) -> TitleVaultResult<(Box<dyn ByteFile>, bool)> {
    let mut plain = PlainFile::open(path)?;
    if Z3dsReadFile::peek_underlying_magic(&mut plain).is_some() {
        let reader = Z3dsReadFile::open(Box::new(plain))?;
        Ok((Box::new(reader), true))
    } else {
        Ok((Box::new(plain), false))
    }
}

/// Parses everything before the content block (header, ticket, TMD) plus
/// the trailing meta block when present.
pub fn load_archive_prefix(file: &mut dyn ByteFile) -> TitleVaultResult<CiaContainer> {
    let mut head = vec![0u8; CIA_HEADER_SIZE as usize];
    if file.read_at(0, &mut head)? != head.len() {
        return Err(TitleVaultError::InvalidFormat("truncated archive"));
    }
    let mut container = CiaContainer::default();
    container.load_header(&head)?;

    let header = container.header()?.clone();
    let prefix_len = header.content_offset() as usize;
    let mut data = vec![0u8; prefix_len];
    if file.read_at(0, &mut data)? != prefix_len {
        return Err(TitleVaultError::InvalidFormat("truncated archive"));
    }
    container.load_ticket(&data, header.ticket_offset() as usize)?;
    container.load_title_metadata(&data, header.tmd_offset() as usize)?;

    if header.meta_size != 0 {
        let mut meta = vec![0u8; header.meta_size as usize];
        if file.read_at(header.meta_offset(), &mut meta)? == meta.len() {
            container.load_meta(&meta, 0)?;
        }
    }

    Ok(container)
}

/// Installs an archive from disk, driving the streaming installer with
/// sequential chunks. Encrypted content requires the caller to have passed
/// the out-of-band authorization check.
pub fn install_archive(
    path: &Path,
    decryption_authorized: bool,
    mut progress: Option<&mut ProgressCallback<'_>>,
) -> InstallStatus {
    info!("Installing {}...", path.display());

    if !path.exists() {
        error!("File {} does not exist!", path.display());
        return InstallStatus::ErrorFileNotFound;
    }

    let Ok((mut file, _)) = open_archive_reader(path) else {
        return InstallStatus::ErrorFailedToOpenFile;
    };
    let Ok(container) = load_archive_prefix(file.as_mut()) else {
        error!("Archive {} is invalid!", path.display());
        return InstallStatus::ErrorInvalid;
    };
    let Ok(tmd) = container.tmd() else {
        return InstallStatus::ErrorInvalid;
    };

    if tmd.has_encrypted_content() && !decryption_authorized {
        error!("File {} is encrypted! Aborting...", path.display());
        return InstallStatus::ErrorEncrypted;
    }

    let media_type = registry::title_media_type(tmd.title_id());
    let mut install_file = CiaFile::new(media_type);
    install_file.decryption_authorized = decryption_authorized;

    let total = file.size().unwrap_or(0);
    let mut buffer = vec![0u8; INSTALL_CHUNK];
    let mut offset = 0u64;
    loop {
        let read = match file.read_at(offset, &mut buffer) {
            Ok(read) => read,
            Err(_) => return InstallStatus::ErrorAborted,
        };
        if read == 0 {
            break;
        }
        if let Err(err) = install_file.write(offset, &buffer[..read]) {
            error!("Archive installation aborted: {err}");
            return InstallStatus::ErrorAborted;
        }
        offset += read as u64;
        if let Some(callback) = progress.as_deref_mut() {
            callback(offset, total);
        }
    }
    if install_file.close().is_err() {
        return InstallStatus::ErrorAborted;
    }

    if install_file
        .install_results()
        .iter()
        .all(|result| result.is_success())
    {
        info!("Installed {} successfully.", path.display());
        InstallStatus::Success
    } else {
        InstallStatus::ErrorAborted
    }
}

/// Checks whether an archive can install without authorization: both the
/// TMD's content flags and each container's own crypto flag are consulted.
pub fn check_archive(path: &Path, check_encryption: bool) -> ArchiveCheck {
    if !path.exists() {
        return ArchiveCheck {
            status: InstallStatus::ErrorFileNotFound,
            is_compressed: false,
        };
    }
    let Ok((mut file, is_compressed)) = open_archive_reader(path) else {
        return ArchiveCheck {
            status: InstallStatus::ErrorFailedToOpenFile,
            is_compressed: false,
        };
    };
    let Ok(container) = load_archive_prefix(file.as_mut()) else {
        return ArchiveCheck {
            status: InstallStatus::ErrorInvalid,
            is_compressed,
        };
    };

    let mut status = InstallStatus::Success;
    if check_encryption {
        let tmd = container.tmd().expect("prefix always carries a TMD");
        if tmd.has_encrypted_content() {
            status = InstallStatus::ErrorEncrypted;
        } else {
            use crate::ctr::models::ncch::{NCCH_HEADER_SIZE, NcchHeader};
            for position in 0..tmd.content_count() {
                let Some(offset) = container.content_data_offset(position) else {
                    status = InstallStatus::ErrorInvalid;
                    break;
                };
                let mut head = vec![0u8; NCCH_HEADER_SIZE];
                let Ok(read) = file.read_at(offset, &mut head) else {
                    status = InstallStatus::ErrorInvalid;
                    break;
                };
                if read != head.len() {
                    status = InstallStatus::ErrorInvalid;
                    break;
                }
                let Ok(header) = NcchHeader::from_bytes(&head) else {
                    status = InstallStatus::ErrorInvalid;
                    break;
                };
                if !header.is_ncch() {
                    status = InstallStatus::ErrorInvalid;
                    break;
                }
                if !header.no_crypto() {
                    status = InstallStatus::ErrorEncrypted;
                    break;
                }
            }
        }
    }

    ArchiveCheck {
        status,
        is_compressed,
    }
}

/// Title information straight out of an archive on disk.
pub fn archive_title_info(path: &Path) -> TitleVaultResult<TitleInfo> {
    let (mut file, _) = open_archive_reader(path)?;
    let container = load_archive_prefix(file.as_mut())?;
    let tmd = container.tmd()?;
    Ok(TitleInfo {
        title_id: tmd.title_id(),
        size: tmd.combined_content_size(),
        version: tmd.title_version(),
        title_type: tmd.title_type(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::ctr::models::cia::CiaHeader;
    use crate::ctr::models::signature::{SignatureData, SignatureType};
    use crate::ctr::models::ticket::{ContentIndex, Ticket, TicketBody};
    use crate::ctr::models::title_metadata::{ContentType, TitleMetadata, tests::sample_tmd};
    use crate::ctr::util::align_64;
    use crate::dirs;
    use crate::install::ncch_sink::tests::build_encrypted_container;
    use crate::keys::{self, KeyStore, slot_id};
    use crate::registry::MediaType;
    use crate::testing::env_lock;
    use crate::unique;
    use crate::vfs::crypto_file::CryptoFile;
    use crate::vfs::z3ds::{DEFAULT_FRAME_SIZE, Z3dsWriteFile};
    use byteorder::{BigEndian, ByteOrder};
    use tempfile::TempDir;

    const TITLE_ID: u64 = 0x0004000000030000;

    const FULL_TABLE: &str = "\
:AES
generatorConstant=1FF9E9AAC5FE0408024591DC5D52768A
slot0x2CKeyX=B98E95CECA3E4D171F76A94DE934C053
slot0x25KeyX=CEE7D8AB30C00DAE850EF5E382AC5AF3
slot0x18KeyX=82E9C9BEBFB8BDB875ECC0A07D474374
slot0x1BKeyX=45AD04953992C7C893724A9A7BCE6182
slot0x3DKeyX=0123456789ABCDEF0123456789ABCDEF
common0=64C5FD55DD3AD988325BAAEC5243DB98
";

    fn make_ticket(title_id: u64, title_key_field: [u8; 16]) -> Ticket {
        Ticket {
            signature_data: SignatureData::new(SignatureType::Rsa2048Sha256, vec![0xAA; 0x100]),
            body: TicketBody {
                issuer: {
                    let mut issuer = b"Root-CA00000003-XS0000000c".to_vec();
                    issuer.resize(0x40, 0);
                    issuer
                },
                ecc_public_key: vec![0x00; 0x3C],
                version: 1,
                ca_crl_version: 0,
                signer_crl_version: 0,
                title_key: title_key_field.to_vec(),
                reserved1: 0,
                ticket_id: 0x0000000100000042,
                console_id: 0,
                title_id,
                reserved2: 0,
                ticket_title_version: 0,
                reserved3: 0,
                license_type: 0,
                common_key_index: 0,
                reserved4: vec![0x00; 0x2A],
                eshop_account_id: 0,
                reserved5: 0,
                audit: 0,
                reserved6: vec![0x00; 0x42],
                limits: vec![0x00; 0x40],
            },
            content_index: ContentIndex::empty(),
        }
    }

    /// Wraps a title key the way tickets store it: AES-CBC with the common
    /// key and the title id as IV.
    fn wrap_title_key(title_key: [u8; 16], title_id: u64) -> [u8; 16] {
        let mut store = KeyStore::from_table(FULL_TABLE);
        store.select_common_key_index(0);
        let common = store.normal_key(slot_id::TICKET_COMMON_KEY).unwrap();
        let mut iv = [0u8; 16];
        BigEndian::write_u64(&mut iv[..8], title_id);
        let mut wrapped = title_key;
        crypto::cbc_encrypt(&common, &iv, &mut wrapped);
        wrapped
    }

    fn build_cia(ticket: &Ticket, tmd: &TitleMetadata, contents: &[Vec<u8>]) -> Vec<u8> {
        let ticket_bytes = ticket.serialize();
        let tmd_bytes = tmd.serialize();

        let mut header = CiaHeader::empty();
        header.ticket_size = ticket_bytes.len() as u32;
        header.tmd_size = tmd_bytes.len() as u32;
        header.content_size = contents
            .iter()
            .map(|content| align_64(content.len() as u64))
            .sum();
        for position in 0..contents.len() {
            header.set_content_present(position);
        }

        let mut out = Vec::new();
        use binrw::BinWrite;
        header
            .write(&mut std::io::Cursor::new(&mut out))
            .unwrap();

        out.resize(header.ticket_offset() as usize, 0);
        out.extend_from_slice(&ticket_bytes);
        out.resize(header.tmd_offset() as usize, 0);
        out.extend_from_slice(&tmd_bytes);
        out.resize(header.content_offset() as usize, 0);
        for content in contents {
            out.extend_from_slice(content);
            out.resize(align_64(out.len() as u64) as usize, 0);
        }
        out
    }

    fn patterned_content(seed: u8, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        out[..4].copy_from_slice(b"NOPE");
        for (i, byte) in out.iter_mut().enumerate().skip(4) {
            *byte = seed.wrapping_add(i as u8);
        }
        out
    }

    fn setup_env(dir: &TempDir) {
        dirs::set_user_root(dir.path());
        keys::install_store(KeyStore::from_table(FULL_TABLE));
        unique::invalidate();
    }

    fn install_bytes(cia: &[u8], chunk_size: usize) -> TitleVaultResult<CiaFile> {
        let mut install = CiaFile::new(MediaType::Sdmc);
        let mut offset = 0u64;
        for chunk in cia.chunks(chunk_size) {
            install.write(offset, chunk)?;
            offset += chunk.len() as u64;
        }
        install.close()?;
        Ok(install)
    }

    #[test]
    fn plain_archive_installs_identically_for_any_chunking() {
        let _guard = env_lock();

        let content_a = patterned_content(0x11, 0x345);
        let content_b = patterned_content(0x77, 0x1201);
        let tmd = sample_tmd(&[
            (0x1A, 0, 0, content_a.len() as u64),
            (0x2B, 1, 0, content_b.len() as u64),
        ]);
        let ticket = make_ticket(TITLE_ID, [0x55; 16]);
        let cia = build_cia(&ticket, &tmd, &[content_a.clone(), content_b.clone()]);

        let mut reference: Option<(Vec<u8>, Vec<u8>)> = None;
        for chunk_size in [cia.len(), 0x40, 0x777, 0x2020] {
            let dir = TempDir::new().unwrap();
            setup_env(&dir);

            let install = install_bytes(&cia, chunk_size).unwrap();
            assert!(install.install_results().iter().all(|r| r.is_success()));

            let content_dir = registry::title_content_dir(MediaType::Sdmc, TITLE_ID);
            let on_disk_a = std::fs::read(content_dir.join("0000001a.app")).unwrap();
            let on_disk_b = std::fs::read(content_dir.join("0000002b.app")).unwrap();
            assert_eq!(on_disk_a, content_a);
            assert_eq!(on_disk_b, content_b);
            assert!(content_dir.join("00000000.tmd").exists());
            assert!(
                registry::ticket_path(TITLE_ID, ticket.ticket_id()).exists(),
                "ticket persisted"
            );

            match &reference {
                None => reference = Some((on_disk_a, on_disk_b)),
                Some((ref_a, ref_b)) => {
                    assert_eq!(&on_disk_a, ref_a, "chunk={chunk_size}");
                    assert_eq!(&on_disk_b, ref_b, "chunk={chunk_size}");
                }
            }
        }
    }

    #[test]
    fn update_replaces_tmd_and_prunes_stale_contents() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        setup_env(&dir);

        let old_a = patterned_content(0x01, 0x100);
        let old_b = patterned_content(0x02, 0x140);
        let tmd_v1 = sample_tmd(&[
            (0x10, 0, 0, old_a.len() as u64),
            (0x11, 1, 0, old_b.len() as u64),
        ]);
        let ticket = make_ticket(TITLE_ID, [0x55; 16]);
        install_bytes(&build_cia(&ticket, &tmd_v1, &[old_a, old_b.clone()]), 0x1000).unwrap();

        let new_b = patterned_content(0x03, 0x140);
        let new_c = patterned_content(0x04, 0x180);
        let tmd_v2 = sample_tmd(&[
            (0x11, 1, 0, new_b.len() as u64),
            (0x12, 2, 0, new_c.len() as u64),
        ]);
        install_bytes(&build_cia(&ticket, &tmd_v2, &[new_b, new_c]), 0x1000).unwrap();

        let content_dir = registry::title_content_dir(MediaType::Sdmc, TITLE_ID);
        // The new TMD is authoritative, the old one and its orphaned
        // content are gone, the shared content id survives.
        assert!(!content_dir.join("00000000.tmd").exists());
        assert!(content_dir.join("00000001.tmd").exists());
        assert!(!content_dir.join("00000010.app").exists());
        assert!(content_dir.join("00000011.app").exists());
        assert!(content_dir.join("00000012.app").exists());

        let authoritative =
            registry::title_metadata_path(MediaType::Sdmc, TITLE_ID, false);
        let tmd = TitleMetadata::load(&authoritative).unwrap();
        assert_eq!(tmd.content_id(0), Some(0x11));
        assert_eq!(tmd.content_id(1), Some(0x12));
    }

    #[test]
    fn aborted_install_drops_the_content_directory() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        setup_env(&dir);

        let content = patterned_content(0x09, 0x400);
        let tmd = sample_tmd(&[(0x1A, 0, 0, content.len() as u64)]);
        let ticket = make_ticket(TITLE_ID, [0x55; 16]);
        let cia = build_cia(&ticket, &tmd, &[content]);

        // Stop half-way through the content block.
        let cut = cia.len() - 0x200;
        let mut install = CiaFile::new(MediaType::Sdmc);
        install.write(0, &cia[..cut]).unwrap();
        install.close().unwrap();

        let content_dir = registry::title_content_dir(MediaType::Sdmc, TITLE_ID);
        assert!(!content_dir.exists());
        // Save data directory parent survives.
        assert!(registry::title_path(MediaType::Sdmc, TITLE_ID).exists());
    }

    #[test]
    fn encrypted_archive_without_authorization_is_rejected() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        setup_env(&dir);

        let content = patterned_content(0x0A, 0x100);
        let tmd = sample_tmd(&[(0x1A, 0, ContentType::ENCRYPTED, content.len() as u64)]);
        let ticket = make_ticket(TITLE_ID, wrap_title_key([0x5A; 16], TITLE_ID));
        let cia = build_cia(&ticket, &tmd, &[content]);

        let mut install = CiaFile::new(MediaType::Sdmc);
        let result = install.write(0, &cia);
        assert!(matches!(result, Err(TitleVaultError::NotAuthorized)));
    }

    #[test]
    fn authorized_encrypted_archive_round_trips_to_plaintext_at_rest() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        dirs::set_user_root(dir.path());
        unique::tests::install_test_console_with_keys(0x00BEEF01, FULL_TABLE);

        let title_key = [0x5A; 16];
        let (encrypted_container, expected_plain) = build_encrypted_container();

        // Archive-layer encryption: AES-CTR with the title key and the
        // per-index counter over the already NCCH-encrypted container.
        let tmd = sample_tmd(&[(
            0x1A,
            0,
            ContentType::ENCRYPTED,
            encrypted_container.len() as u64,
        )]);
        let mut cia_content = encrypted_container;
        let ctr = tmd.content_ctr(0).unwrap();
        crypto::ctr_apply(&title_key, &ctr, 0, &mut cia_content);

        let ticket = make_ticket(TITLE_ID, wrap_title_key(title_key, TITLE_ID));
        let cia = build_cia(&ticket, &tmd, &[cia_content]);

        let mut install = CiaFile::new(MediaType::Sdmc);
        install.decryption_authorized = true;
        install.write(0, &cia).unwrap();
        install.close().unwrap();
        assert!(install.install_results().iter().all(|r| r.is_success()));

        // At rest the content is per-console wrapped; unwrapping it must
        // yield the container with its crypto flag cleared.
        let content_dir = registry::title_content_dir(MediaType::Sdmc, TITLE_ID);
        let app_path = content_dir.join("0000001a.app");
        let inner = Box::new(crate::vfs::PlainFile::open(&app_path).unwrap());
        let mut wrapped =
            CryptoFile::wrap(inner, unique::UniqueCryptoFileId::Ncch).unwrap();
        let mut stored = vec![0u8; expected_plain.len()];
        assert_eq!(
            wrapped.read_at(0, &mut stored).unwrap(),
            expected_plain.len()
        );
        assert_eq!(stored, expected_plain);

        unique::invalidate();
        keys::install_store(KeyStore::default());
    }

    #[test]
    fn install_archive_handles_compressed_inputs() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        setup_env(&dir);

        let content = patterned_content(0x21, 0x500);
        let tmd = sample_tmd(&[(0x1A, 0, 0, content.len() as u64)]);
        let ticket = make_ticket(TITLE_ID, [0x55; 16]);
        let cia = build_cia(&ticket, &tmd, &[content.clone()]);

        let archive_path = dir.path().join("title.cia.z3ds");
        {
            let inner = Box::new(crate::vfs::PlainFile::create(&archive_path).unwrap());
            let mut writer = Z3dsWriteFile::new(inner, *b"CIA\0", DEFAULT_FRAME_SIZE);
            writer.write_at(0, &cia).unwrap();
            writer.close().unwrap();
        }

        let check = check_archive(&archive_path, false);
        assert!(check.is_compressed);
        assert_eq!(check.status, InstallStatus::Success);

        let mut seen = (0u64, 0u64);
        let mut progress = |done: u64, total: u64| seen = (done, total);
        let status = install_archive(&archive_path, false, Some(&mut progress));
        assert_eq!(status, InstallStatus::Success);
        assert_eq!(seen.1, cia.len() as u64);

        let content_dir = registry::title_content_dir(MediaType::Sdmc, TITLE_ID);
        assert_eq!(
            std::fs::read(content_dir.join("0000001a.app")).unwrap(),
            content
        );
    }

    #[test]
    fn install_archive_rejects_encrypted_without_authorization() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        setup_env(&dir);

        let content = patterned_content(0x31, 0x100);
        let tmd = sample_tmd(&[(0x1A, 0, ContentType::ENCRYPTED, content.len() as u64)]);
        let ticket = make_ticket(TITLE_ID, wrap_title_key([0x66; 16], TITLE_ID));
        let cia = build_cia(&ticket, &tmd, &[content]);

        let archive_path = dir.path().join("enc.cia");
        std::fs::write(&archive_path, &cia).unwrap();

        assert_eq!(
            install_archive(&archive_path, false, None),
            InstallStatus::ErrorEncrypted
        );
        assert_eq!(
            check_archive(&archive_path, true).status,
            InstallStatus::ErrorEncrypted
        );
    }

    #[test]
    fn missing_archive_reports_not_found() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        setup_env(&dir);

        assert_eq!(
            install_archive(&dir.path().join("nope.cia"), false, None),
            InstallStatus::ErrorFileNotFound
        );
    }

    #[test]
    fn archive_title_info_reads_the_tmd() {
        let _guard = env_lock();
        let dir = TempDir::new().unwrap();
        setup_env(&dir);

        let content = patterned_content(0x41, 0x333);
        let tmd = sample_tmd(&[(0x1A, 0, 0, content.len() as u64)]);
        let ticket = make_ticket(TITLE_ID, [0x55; 16]);
        let cia = build_cia(&ticket, &tmd, &[content]);

        let archive_path = dir.path().join("info.cia");
        std::fs::write(&archive_path, &cia).unwrap();

        let info = archive_title_info(&archive_path).unwrap();
        assert_eq!(info.title_id, TITLE_ID);
        assert_eq!(info.size, 0x333);
        assert_eq!(info.version, 0x0100);
    }
}
