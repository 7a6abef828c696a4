/// State of an import context, title-level and content-level alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImportState {
    None = 0,
    WaitingForImport = 1,
    Resumable = 2,
    WaitingForCommit = 3,
    AlreadyExists = 4,
    Deleting = 5,
    NeedsCleanup = 6,
}

/// Per-title state held across a multi-step install or update.
#[derive(Debug, Clone, Copy)]
pub struct ImportTitleContext {
    pub title_id: u64,
    pub version: u16,
    pub state: ImportState,
    pub title_type: u32,
    pub size: u64,
}

impl ImportTitleContext {
    pub fn new(title_id: u64) -> ImportTitleContext {
        ImportTitleContext {
            title_id,
            version: 0,
            state: ImportState::WaitingForImport,
            title_type: 0,
            size: 0,
        }
    }
}

/// Per-content state below a title context.
#[derive(Debug, Clone, Copy)]
pub struct ImportContentContext {
    pub content_id: u32,
    pub index: u16,
    pub state: ImportState,
    pub size: u64,
    pub current_size: u64,
}

impl ImportContentContext {
    pub fn new(content_id: u32, index: u16, size: u64) -> ImportContentContext {
        ImportContentContext {
            content_id,
            index,
            state: ImportState::WaitingForImport,
            size,
            current_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_contexts_wait_for_import() {
        let title = ImportTitleContext::new(0x1122334455667788);
        assert_eq!(title.state, ImportState::WaitingForImport);
        assert_eq!(title.title_id, 0x1122334455667788);

        let content = ImportContentContext::new(7, 1, 0x4000);
        assert_eq!(content.state, ImportState::WaitingForImport);
        assert_eq!(content.current_size, 0);
    }
}
