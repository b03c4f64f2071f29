use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::storage::page::error::PageError;

// Header page layout (block 0 of the database file):
// - record_count: u32 (4 bytes)
// - records: (name: [u8; 32], root_page_id: u32) * record_count
const COUNT_SIZE: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - COUNT_SIZE) / RECORD_SIZE;

/// Accessors over the header page, which maps index names to the page IDs
/// of their tree roots so an index can be reopened from disk.
pub struct HeaderPage;

impl HeaderPage {
    /// Reset the page to an empty header
    pub fn init(page: &mut Page) {
        page.data.fill(0);
        LittleEndian::write_u32(&mut page.data[0..COUNT_SIZE], 0);
    }

    pub fn record_count(page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[0..COUNT_SIZE]) as usize
    }

    /// Register a new index name with its root page ID
    pub fn insert_record(page: &mut Page, name: &str, root_id: PageId) -> Result<(), PageError> {
        if name.len() > NAME_SIZE {
            return Err(PageError::NameTooLong(name.to_string(), NAME_SIZE));
        }
        if Self::find_record(page, name).is_some() {
            return Err(PageError::RecordExists(name.to_string()));
        }
        let count = Self::record_count(page);
        if count >= MAX_RECORDS {
            return Err(PageError::HeaderPageFull);
        }

        let offset = COUNT_SIZE + count * RECORD_SIZE;
        page.data[offset..offset + NAME_SIZE].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(&mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE], root_id);
        LittleEndian::write_u32(&mut page.data[0..COUNT_SIZE], (count + 1) as u32);

        Ok(())
    }

    /// Update the root page ID stored for an existing index name
    pub fn update_record(page: &mut Page, name: &str, root_id: PageId) -> Result<(), PageError> {
        match Self::find_record(page, name) {
            Some(offset) => {
                LittleEndian::write_u32(
                    &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
                    root_id,
                );
                Ok(())
            }
            None => Err(PageError::RecordNotFound(name.to_string())),
        }
    }

    /// Look up the root page ID registered under a name
    pub fn get_root_id(page: &Page, name: &str) -> Option<PageId> {
        let offset = Self::find_record(page, name)?;
        Some(LittleEndian::read_u32(
            &page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
        ))
    }

    fn find_record(page: &Page, name: &str) -> Option<usize> {
        if name.len() > NAME_SIZE {
            return None;
        }
        let count = Self::record_count(page);
        for i in 0..count {
            let offset = COUNT_SIZE + i * RECORD_SIZE;
            let stored = &page.data[offset..offset + NAME_SIZE];
            let stored_len = stored.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
            if &stored[..stored_len] == name.as_bytes() {
                return Some(offset);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_insert_and_get() {
        let mut page = Page::new(0);
        HeaderPage::init(&mut page);

        HeaderPage::insert_record(&mut page, "orders_pk", 7).unwrap();
        HeaderPage::insert_record(&mut page, "orders_date", 12).unwrap();

        assert_eq!(HeaderPage::record_count(&page), 2);
        assert_eq!(HeaderPage::get_root_id(&page, "orders_pk"), Some(7));
        assert_eq!(HeaderPage::get_root_id(&page, "orders_date"), Some(12));
        assert_eq!(HeaderPage::get_root_id(&page, "missing"), None);
    }

    #[test]
    fn test_update() {
        let mut page = Page::new(0);
        HeaderPage::init(&mut page);

        HeaderPage::insert_record(&mut page, "idx", 3).unwrap();
        HeaderPage::update_record(&mut page, "idx", INVALID_PAGE_ID).unwrap();
        assert_eq!(HeaderPage::get_root_id(&page, "idx"), Some(INVALID_PAGE_ID));

        assert!(HeaderPage::update_record(&mut page, "other", 1).is_err());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut page = Page::new(0);
        HeaderPage::init(&mut page);

        HeaderPage::insert_record(&mut page, "idx", 3).unwrap();
        assert!(HeaderPage::insert_record(&mut page, "idx", 4).is_err());
        assert_eq!(HeaderPage::get_root_id(&page, "idx"), Some(3));
    }

    #[test]
    fn test_name_too_long() {
        let mut page = Page::new(0);
        HeaderPage::init(&mut page);

        let name = "x".repeat(NAME_SIZE + 1);
        assert!(HeaderPage::insert_record(&mut page, &name, 1).is_err());
    }
}
