use crate::dirs;
use binrw::{BinRead, BinWrite};
use lazy_static::lazy_static;
use log::debug;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::RwLock;

pub const SEEDDB_FILE: &str = "seeddb.bin";

/// On-disk seed database: seeds keyed by title id, needed to derive the
/// secondary key of seed-crypto containers.
#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct SeedDatabase {
    pub seed_count: u32,
    #[brw(pad_before = 12)]
    #[br(count = seed_count)]
    pub seeds: Vec<SeedEntry>,
}

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(little)]
pub struct SeedEntry {
    pub title_id: u64,

    pub seed: [u8; 16],

    #[brw(pad_after = 8)]
    _padding: (),
}

impl SeedDatabase {
    pub fn from_bytes(data: &[u8]) -> binrw::BinResult<SeedDatabase> {
        SeedDatabase::read(&mut Cursor::new(data))
    }

    pub fn load(path: &Path) -> Option<SeedDatabase> {
        let data = std::fs::read(path).ok()?;
        SeedDatabase::from_bytes(&data).ok()
    }

    pub fn get(&self, title_id: u64) -> Option<[u8; 16]> {
        self.seeds
            .iter()
            .find(|entry| entry.title_id == title_id)
            .map(|entry| entry.seed)
    }
}

lazy_static! {
    static ref SEEDS: RwLock<Option<HashMap<u64, [u8; 16]>>> = RwLock::new(None);
}

/// Looks up the seed for a program id, loading `seeddb.bin` from the sysdata
/// directory on first use.
pub fn get_seed(program_id: u64) -> Option<[u8; 16]> {
    {
        let guard = SEEDS.read().unwrap();
        if let Some(map) = guard.as_ref() {
            return map.get(&program_id).copied();
        }
    }

    let mut map = HashMap::new();
    let path = dirs::sys_data_dir().join(SEEDDB_FILE);
    match SeedDatabase::load(&path) {
        Some(db) => {
            for entry in &db.seeds {
                map.insert(entry.title_id, entry.seed);
            }
        }
        None => debug!("{SEEDDB_FILE} not found or unreadable"),
    }

    let mut guard = SEEDS.write().unwrap();
    let map = guard.get_or_insert(map);
    map.get(&program_id).copied()
}

/// Registers a seed in the in-memory database.
pub fn add_seed(program_id: u64, seed: [u8; 16]) {
    let mut guard = SEEDS.write().unwrap();
    guard.get_or_insert_with(HashMap::new).insert(program_id, seed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_roundtrip_and_lookup() {
        let db = SeedDatabase {
            seed_count: 2,
            seeds: vec![
                SeedEntry {
                    title_id: 0x0004000000030000,
                    seed: [0xAA; 16],
                    _padding: (),
                },
                SeedEntry {
                    title_id: 0x00040000000F0000,
                    seed: [0xBB; 16],
                    _padding: (),
                },
            ],
        };

        let mut buf = Vec::new();
        db.write(&mut Cursor::new(&mut buf)).unwrap();
        // count + 12 pad + 2 * (8 + 16 + 8)
        assert_eq!(buf.len(), 16 + 2 * 32);

        let reparsed = SeedDatabase::from_bytes(&buf).unwrap();
        assert_eq!(reparsed.get(0x0004000000030000), Some([0xAA; 16]));
        assert_eq!(reparsed.get(0x00040000000F0000), Some([0xBB; 16]));
        assert_eq!(reparsed.get(0x1), None);
    }
}
