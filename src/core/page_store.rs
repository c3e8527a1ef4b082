use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::page::{frame_record, Page, PageType};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Bytes of slot 0 taken by the fixed header fields.
const STORE_HEADER_FIXED: usize = 4 + 4 + 4 + 4 + 4 + 4;

/// Slot 0 of the page file: allocation state plus the head page of every relation chain.
///
/// The fixed fields come first. The free list and chain directory form a
/// variable-length payload; whatever does not fit in slot 0 continues on a
/// chain of METADATA pages starting at `spill_head`.
#[derive(Debug, Clone)]
struct StoreHeader {
    magic: [u8; 4],
    version: u32,
    page_size: u32,
    next_page_id: PageId,
    spill_head: PageId,
    free_list: Vec<PageId>,
    chain_heads: BTreeMap<String, PageId>,
}

impl StoreHeader {
    fn payload(&self) -> Result<Vec<u8>> {
        let directory = serde_json::to_vec(&self.chain_heads)?;
        let mut buf = Vec::with_capacity(8 + self.free_list.len() * 4 + directory.len());

        buf.extend_from_slice(&(self.free_list.len() as u32).to_be_bytes());
        for &page_id in &self.free_list {
            buf.extend_from_slice(&page_id.to_be_bytes());
        }

        buf.extend_from_slice(&(directory.len() as u32).to_be_bytes());
        buf.extend_from_slice(&directory);

        Ok(buf)
    }

    /// Slot 0 bytes: the fixed fields followed by the inline part of `payload`.
    fn serialize_slot(&self, payload: &[u8]) -> Vec<u8> {
        let page_size = self.page_size as usize;
        let mut buf = vec![0u8; page_size];
        let mut offset = 0;

        buf[offset..offset + 4].copy_from_slice(&self.magic);
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.version.to_be_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.page_size.to_be_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.next_page_id.to_be_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.spill_head.to_be_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        offset += 4;

        let inline = payload.len().min(page_size - STORE_HEADER_FIXED);
        buf[offset..offset + inline].copy_from_slice(&payload[..inline]);

        buf
    }

    /// Parses the fixed fields of slot 0. Returns the header with an empty
    /// payload plus the payload length it announces.
    fn deserialize_fixed(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < STORE_HEADER_FIXED {
            return Err(Error::DataCorruption {
                details: "page store header truncated".to_string(),
            });
        }

        let mut offset = 0;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[offset..offset + 4]);
        if magic != MAGIC {
            return Err(Error::DataCorruption {
                details: "invalid magic number in page store header".to_string(),
            });
        }
        offset += 4;

        let version = u32::from_be_bytes(data[offset..offset + 4].try_into()?);
        if version != VERSION {
            return Err(Error::DataCorruption {
                details: format!("unsupported page store version {}", version),
            });
        }
        offset += 4;

        let page_size = u32::from_be_bytes(data[offset..offset + 4].try_into()?);
        offset += 4;

        let next_page_id = u32::from_be_bytes(data[offset..offset + 4].try_into()?);
        offset += 4;

        let spill_head = u32::from_be_bytes(data[offset..offset + 4].try_into()?);
        offset += 4;

        let payload_len = u32::from_be_bytes(data[offset..offset + 4].try_into()?) as usize;

        let header = Self {
            magic,
            version,
            page_size,
            next_page_id,
            spill_head,
            free_list: Vec::new(),
            chain_heads: BTreeMap::new(),
        };
        Ok((header, payload_len))
    }

    fn parse_payload(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0;

        if data.len() < 4 {
            return Err(Error::DataCorruption {
                details: "page store payload truncated".to_string(),
            });
        }
        let free_count = u32::from_be_bytes(data[offset..offset + 4].try_into()?) as usize;
        offset += 4;

        if offset + free_count * 4 + 4 > data.len() {
            return Err(Error::DataCorruption {
                details: format!("free list of {} entries overruns the header payload", free_count),
            });
        }

        let mut free_list = Vec::with_capacity(free_count);
        for _ in 0..free_count {
            free_list.push(u32::from_be_bytes(data[offset..offset + 4].try_into()?));
            offset += 4;
        }

        let directory_len = u32::from_be_bytes(data[offset..offset + 4].try_into()?) as usize;
        offset += 4;
        if offset + directory_len > data.len() {
            return Err(Error::DataCorruption {
                details: "chain directory overruns the header payload".to_string(),
            });
        }
        let chain_heads = if directory_len == 0 {
            BTreeMap::new()
        } else {
            serde_json::from_slice(&data[offset..offset + directory_len])?
        };

        self.free_list = free_list;
        self.chain_heads = chain_heads;
        Ok(())
    }
}

/// Fixed-size page allocation over a single file.
///
/// Every live page is resident; `flush` writes dirty pages back to their slot
/// (`page_id * page_size`) followed by the store header.
pub struct PageStore {
    file: File,
    page_size: usize,
    pages: HashMap<PageId, Page>,
    next_page_id: PageId,
    free_list: Vec<PageId>,
    chains: HashMap<String, Vec<PageId>>,
    /// METADATA pages carrying the part of the header payload that overflows slot 0.
    spill_pages: Vec<PageId>,
    dirty: HashSet<PageId>,
    header_dirty: bool,
}

impl PageStore {
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open(path: &Path, page_size: usize, permissions: u32) -> Result<Self> {
        let exists = path.exists() && std::fs::metadata(path)?.len() > 0;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        #[cfg(unix)]
        {
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(permissions);
            file.set_permissions(perms)?;
        }

        let mut store = Self {
            file,
            page_size,
            pages: HashMap::new(),
            next_page_id: 1,
            free_list: Vec::new(),
            chains: HashMap::new(),
            spill_pages: Vec::new(),
            dirty: HashSet::new(),
            header_dirty: true,
        };

        if exists {
            store.load()?;
        } else {
            store.flush()?;
        }

        Ok(store)
    }

    fn load(&mut self) -> Result<()> {
        let file_size = self.file.seek(SeekFrom::End(0))?;

        let mut first = [0u8; 16];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut first)?;
        let stored_page_size = u32::from_be_bytes(first[8..12].try_into()?) as usize;
        if stored_page_size != self.page_size {
            return Err(Error::InvalidOptions(format!(
                "page file was created with page_size={} but engine is configured with {}",
                stored_page_size, self.page_size
            )));
        }

        let mut buf = vec![0u8; self.page_size];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        let (mut header, payload_len) = StoreHeader::deserialize_fixed(&buf)?;

        let expected_min_size = header.next_page_id as u64 * self.page_size as u64;
        if file_size < expected_min_size {
            return Err(Error::DataCorruption {
                details: format!(
                    "page file truncated: header claims {} slots ({} bytes) but file is only {} bytes",
                    header.next_page_id, expected_min_size, file_size
                ),
            });
        }

        let inline = payload_len.min(self.page_size - STORE_HEADER_FIXED);
        let mut payload = buf[STORE_HEADER_FIXED..STORE_HEADER_FIXED + inline].to_vec();
        let spill_pages = self.read_spill_chain(header.spill_head, header.next_page_id, payload_len, &mut payload)?;
        header.parse_payload(&payload)?;

        let free: HashSet<PageId> = header.free_list.iter().copied().collect();
        for page_id in free.iter() {
            if *page_id == 0 || *page_id >= header.next_page_id {
                return Err(Error::DataCorruption {
                    details: format!("invalid free list entry {}", page_id),
                });
            }
        }

        let spilled: HashSet<PageId> = spill_pages.iter().copied().collect();
        for page_id in 1..header.next_page_id {
            if free.contains(&page_id) || spilled.contains(&page_id) {
                continue;
            }
            self.file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
            self.file.read_exact(&mut buf)?;
            let page = Page::from_bytes(&buf)?;

            if page.header.page_id != page_id {
                return Err(Error::Corruption {
                    component: "page_store".to_string(),
                    page_id,
                    details: format!("slot holds page {}", page.header.page_id),
                });
            }
            if !page.verify_checksum() {
                return Err(Error::Corruption {
                    component: "page_store".to_string(),
                    page_id,
                    details: "checksum does not match data region".to_string(),
                });
            }
            self.pages.insert(page_id, page);
        }

        for (relation, head) in &header.chain_heads {
            let chain = self.walk_chain(*head)?;
            self.chains.insert(relation.clone(), chain);
        }

        self.next_page_id = header.next_page_id;
        self.free_list = header.free_list;
        self.spill_pages = spill_pages;
        self.header_dirty = false;

        log::debug!(
            "page store loaded: {} live pages, {} free, {} relation chains",
            self.pages.len(),
            self.free_list.len(),
            self.chains.len()
        );

        Ok(())
    }

    /// Follows the METADATA chain from `head`, appending its bytes to `payload`
    /// until `payload_len` bytes are collected. Returns every page on the chain.
    fn read_spill_chain(
        &mut self,
        head: PageId,
        next_page_id: PageId,
        payload_len: usize,
        payload: &mut Vec<u8>,
    ) -> Result<Vec<PageId>> {
        let mut chain = Vec::new();
        let mut buf = vec![0u8; self.page_size];
        let mut current = if head == 0 { None } else { Some(head) };

        while let Some(page_id) = current {
            if page_id >= next_page_id || chain.contains(&page_id) {
                return Err(Error::Corruption {
                    component: "page_store".to_string(),
                    page_id,
                    details: "invalid page in header spill chain".to_string(),
                });
            }
            self.file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
            self.file.read_exact(&mut buf)?;
            let page = Page::from_bytes(&buf)?;
            if page.header.page_id != page_id || page.header.page_type != PageType::Metadata {
                return Err(Error::Corruption {
                    component: "page_store".to_string(),
                    page_id,
                    details: "header spill chain references a non-metadata page".to_string(),
                });
            }
            if !page.verify_checksum() {
                return Err(Error::Corruption {
                    component: "page_store".to_string(),
                    page_id,
                    details: "checksum does not match data region".to_string(),
                });
            }

            let wanted = payload_len.saturating_sub(payload.len()).min(page.data.len());
            payload.extend_from_slice(&page.data[..wanted]);
            chain.push(page_id);
            current = page.header.next();
        }

        if payload.len() < payload_len {
            return Err(Error::DataCorruption {
                details: format!(
                    "page store header announces {} payload bytes but only {} were found",
                    payload_len,
                    payload.len()
                ),
            });
        }

        Ok(chain)
    }

    fn walk_chain(&self, head: PageId) -> Result<Vec<PageId>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(head);

        while let Some(page_id) = current {
            if !seen.insert(page_id) {
                return Err(Error::Corruption {
                    component: "page_store".to_string(),
                    page_id,
                    details: "cycle in relation page chain".to_string(),
                });
            }
            let page = self.pages.get(&page_id).ok_or_else(|| Error::Corruption {
                component: "page_store".to_string(),
                page_id,
                details: "relation chain references a page that is not live".to_string(),
            })?;
            chain.push(page_id);
            current = page.header.next();
        }

        Ok(chain)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn data_capacity(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    pub fn allocate_page(&mut self, page_type: PageType, curvature: f64) -> Result<PageId> {
        let page_id = match self.free_list.pop() {
            Some(page_id) => page_id,
            None => {
                let page_id = self.next_page_id;
                self.next_page_id = self.next_page_id.checked_add(1).ok_or_else(|| {
                    Error::Other("page id space exhausted".to_string())
                })?;
                page_id
            }
        };

        self.pages.insert(page_id, Page::new(page_id, page_type, curvature, self.page_size));
        self.dirty.insert(page_id);
        self.header_dirty = true;

        log::debug!("allocated page {} ({:?}, curvature={})", page_id, page_type, curvature);

        Ok(page_id)
    }

    /// Writes `data` at `offset` within the data region and recomputes the checksum.
    /// Header fields other than the checksum are left as they are.
    pub fn write(&mut self, page_id: PageId, data: &[u8], offset: usize) -> Result<()> {
        let page = self.pages.get_mut(&page_id).ok_or(Error::PageNotFound { page_id })?;

        let capacity = page.capacity();
        if offset + data.len() > capacity {
            return Err(Error::PageOverflow {
                page_id,
                offset,
                len: data.len(),
                capacity,
            });
        }

        page.data[offset..offset + data.len()].copy_from_slice(data);
        page.refresh_checksum();
        self.dirty.insert(page_id);

        Ok(())
    }

    pub fn read(&self, page_id: PageId) -> Result<&Page> {
        self.pages.get(&page_id).ok_or(Error::PageNotFound { page_id })
    }

    /// Picks a page of `relation` tagged with `curvature` that can take `record`,
    /// allocating and chaining a new data page when none can.
    pub fn select_target(&mut self, relation: &str, record: &[u8], curvature: f64) -> Result<PageId> {
        let needed = RECORD_FRAME_SIZE + record.len();
        if needed > self.data_capacity() {
            return Err(Error::RecordTooLarge {
                size: record.len(),
                max: self.data_capacity() - RECORD_FRAME_SIZE,
            });
        }

        if let Some(chain) = self.chains.get(relation) {
            for page_id in chain {
                if let Some(page) = self.pages.get(page_id) {
                    if page.header.page_type == PageType::Data
                        && page.header.curvature == curvature
                        && page.free_bytes() >= needed
                    {
                        return Ok(*page_id);
                    }
                }
            }
        }

        let page_id = self.allocate_page(PageType::Data, curvature)?;
        let tail = self.chains.get(relation).and_then(|chain| chain.last().copied());
        if let Some(tail) = tail {
            self.set_next_page(tail, page_id)?;
        }
        self.chains.entry(relation.to_string()).or_default().push(page_id);
        self.header_dirty = true;

        Ok(page_id)
    }

    /// Appends one framed record after the page's last record and bumps `record_count`.
    pub fn append_record(&mut self, page_id: PageId, record: &[u8]) -> Result<()> {
        let offset = self.read(page_id)?.used_bytes();
        self.write(page_id, &frame_record(record), offset)?;

        if let Some(page) = self.pages.get_mut(&page_id) {
            page.header.record_count += 1;
        }

        Ok(())
    }

    fn set_next_page(&mut self, page_id: PageId, next: PageId) -> Result<()> {
        let page = self.pages.get_mut(&page_id).ok_or(Error::PageNotFound { page_id })?;
        page.header.next_page = next;
        self.dirty.insert(page_id);
        Ok(())
    }

    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        let page = self.pages.remove(&page_id).ok_or(Error::PageNotFound { page_id })?;
        self.dirty.remove(&page_id);

        let mut relink: Option<(Option<PageId>, PageId)> = None;
        let mut emptied: Option<String> = None;
        for (relation, chain) in self.chains.iter_mut() {
            if let Some(pos) = chain.iter().position(|&id| id == page_id) {
                chain.remove(pos);
                let prev = if pos > 0 { Some(chain[pos - 1]) } else { None };
                relink = Some((prev, page.header.next_page));
                if chain.is_empty() {
                    emptied = Some(relation.clone());
                }
                break;
            }
        }
        if let Some((Some(prev), next)) = relink {
            self.set_next_page(prev, next)?;
        }
        if let Some(relation) = emptied {
            self.chains.remove(&relation);
        }

        self.free_list.push(page_id);
        self.header_dirty = true;

        log::debug!("freed page {}", page_id);

        Ok(())
    }

    /// Frees every page in the relation's chain; returns how many were freed.
    pub fn free_relation(&mut self, relation: &str) -> Result<usize> {
        let chain = match self.chains.remove(relation) {
            Some(chain) => chain,
            None => return Ok(0),
        };

        for page_id in &chain {
            self.pages.remove(page_id);
            self.dirty.remove(page_id);
            self.free_list.push(*page_id);
        }
        self.header_dirty = true;

        Ok(chain.len())
    }

    pub fn relation_pages(&self, relation: &str) -> Vec<PageId> {
        self.chains.get(relation).cloned().unwrap_or_default()
    }

    pub fn page_count(&self, relation: &str) -> usize {
        self.chains.get(relation).map(|chain| chain.len()).unwrap_or(0)
    }

    pub fn live_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.header_dirty || !self.dirty.is_empty()
    }

    pub fn flush(&mut self) -> Result<()> {
        let mut dirty_pages: Vec<PageId> = self.dirty.iter().copied().collect();
        dirty_pages.sort_unstable();

        for page_id in &dirty_pages {
            if let Some(page) = self.pages.get(page_id) {
                let offset = *page_id as u64 * self.page_size as u64;
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.write_all(&page.to_bytes())?;
            }
        }

        let mut header = StoreHeader {
            magic: MAGIC,
            version: VERSION,
            page_size: self.page_size as u32,
            next_page_id: self.next_page_id,
            spill_head: 0,
            free_list: self.free_list.clone(),
            chain_heads: self
                .chains
                .iter()
                .filter_map(|(relation, chain)| chain.first().map(|head| (relation.clone(), *head)))
                .collect(),
        };
        let payload = header.payload()?;

        // Spill pages come from fresh slots so growing the chain never changes the payload.
        let inline = self.page_size - STORE_HEADER_FIXED;
        let per_page = self.data_capacity();
        let needed = payload.len().saturating_sub(inline).div_ceil(per_page);
        while self.spill_pages.len() < needed {
            let page_id = self.next_page_id;
            self.next_page_id = self
                .next_page_id
                .checked_add(1)
                .ok_or_else(|| Error::Other("page id space exhausted".to_string()))?;
            self.spill_pages.push(page_id);
        }
        header.next_page_id = self.next_page_id;
        header.spill_head = self.spill_pages.first().copied().unwrap_or(0);

        let mut offset = inline.min(payload.len());
        for (i, &page_id) in self.spill_pages.iter().enumerate() {
            let mut page = Page::new(page_id, PageType::Metadata, 0.0, self.page_size);
            let chunk = &payload[offset..(offset + per_page).min(payload.len())];
            page.data[..chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
            page.header.next_page = self.spill_pages.get(i + 1).copied().unwrap_or(0);
            page.refresh_checksum();

            self.file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
            self.file.write_all(&page.to_bytes())?;
        }

        let data = header.serialize_slot(&payload);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&data)?;

        // Slots of pages freed before they were ever written still count toward the file length.
        let min_len = self.next_page_id as u64 * self.page_size as u64;
        if self.file.metadata()?.len() < min_len {
            self.file.set_len(min_len)?;
        }

        self.file.sync_all()?;
        self.dirty.clear();
        self.header_dirty = false;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::page::checksum;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> PageStore {
        PageStore::open(&dir.path().join(PAGES_FILE), 512, 0o644).unwrap()
    }

    #[test]
    fn test_allocate_and_read() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let page_id = store.allocate_page(PageType::Data, 0.25).unwrap();
        assert_eq!(page_id, 1);

        let page = store.read(page_id).unwrap();
        assert_eq!(page.header.page_type, PageType::Data);
        assert_eq!(page.header.curvature, 0.25);
        assert_eq!(page.data.len(), 512 - PAGE_HEADER_SIZE);
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_recomputes_checksum() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page_id = store.allocate_page(PageType::Data, -1.0).unwrap();

        store.write(page_id, b"hello", 10).unwrap();

        let page = store.read(page_id).unwrap();
        assert_eq!(&page.data[10..15], b"hello");
        assert_eq!(page.header.checksum, checksum(&page.data));
        assert_eq!(page.header.record_count, 0);
    }

    #[test]
    fn test_unknown_page_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        assert!(matches!(store.read(99), Err(Error::PageNotFound { page_id: 99 })));
        assert!(matches!(store.write(99, b"x", 0), Err(Error::PageNotFound { .. })));
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page_id = store.allocate_page(PageType::Data, -1.0).unwrap();

        let capacity = store.data_capacity();
        let result = store.write(page_id, &[1, 2, 3], capacity - 1);
        assert!(matches!(result, Err(Error::PageOverflow { .. })));
    }

    #[test]
    fn test_free_page_recycles_id() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let first = store.allocate_page(PageType::Data, -1.0).unwrap();
        let second = store.allocate_page(PageType::Index, -1.0).unwrap();
        assert_eq!((first, second), (1, 2));

        store.free_page(first).unwrap();
        assert!(matches!(store.read(first), Err(Error::PageNotFound { .. })));

        let third = store.allocate_page(PageType::Metadata, -1.0).unwrap();
        assert_eq!(third, first);
        assert_eq!(store.read(third).unwrap().header.page_type, PageType::Metadata);
    }

    #[test]
    fn test_select_target_groups_by_curvature() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let a = store.select_target("events", b"rec", -1.0).unwrap();
        let b = store.select_target("events", b"rec", -1.0).unwrap();
        let c = store.select_target("events", b"rec", 0.5).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.relation_pages("events"), vec![a, c]);
        assert_eq!(store.read(a).unwrap().header.next_page, c);
    }

    #[test]
    fn test_select_target_allocates_when_page_full() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let record = vec![7u8; 200];
        let first = store.select_target("big", &record, -1.0).unwrap();
        store.append_record(first, &record).unwrap();
        store.append_record(first, &record).unwrap();

        let next = store.select_target("big", &record, -1.0).unwrap();
        assert_ne!(first, next);
        assert_eq!(store.read(first).unwrap().header.record_count, 2);
    }

    #[test]
    fn test_record_larger_than_page_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let record = vec![0u8; 1024];
        assert!(matches!(
            store.select_target("big", &record, -1.0),
            Err(Error::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_free_page_unlinks_chain() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let a = store.select_target("r", b"x", 1.0).unwrap();
        let b = store.select_target("r", b"x", 2.0).unwrap();
        let c = store.select_target("r", b"x", 3.0).unwrap();

        store.free_page(b).unwrap();
        assert_eq!(store.relation_pages("r"), vec![a, c]);
        assert_eq!(store.read(a).unwrap().header.next_page, c);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAGES_FILE);

        let (first, second) = {
            let mut store = PageStore::open(&path, 512, 0o644).unwrap();
            let first = store.select_target("events", b"one", -1.0).unwrap();
            store.append_record(first, b"one").unwrap();
            let second = store.select_target("events", b"two", 0.5).unwrap();
            store.append_record(second, b"two").unwrap();
            let spare = store.allocate_page(PageType::Index, 0.0).unwrap();
            store.free_page(spare).unwrap();
            store.flush().unwrap();
            (first, second)
        };

        let store = PageStore::open(&path, 512, 0o644).unwrap();
        assert_eq!(store.relation_pages("events"), vec![first, second]);
        let page = store.read(first).unwrap();
        assert_eq!(page.header.record_count, 1);
        assert_eq!(page.records().unwrap(), vec![&b"one"[..]]);
        assert!(page.verify_checksum());
        assert_eq!(store.live_pages(), 2);
    }

    #[test]
    fn test_header_spills_onto_metadata_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAGES_FILE);

        let relations: Vec<String> = (0..20).map(|i| format!("relation_with_a_rather_long_name_{:02}", i)).collect();
        let heads = {
            let mut store = PageStore::open(&path, 512, 0o644).unwrap();
            let freed: Vec<PageId> = (0..300)
                .map(|_| store.allocate_page(PageType::Data, 0.0).unwrap())
                .collect();
            for page_id in &freed {
                store.free_page(*page_id).unwrap();
            }
            let heads: Vec<PageId> = relations
                .iter()
                .map(|name| store.select_target(name, b"row", -1.0).unwrap())
                .collect();
            store.flush().unwrap();
            assert!(!store.spill_pages.is_empty());
            heads
        };

        let mut store = PageStore::open(&path, 512, 0o644).unwrap();
        assert_eq!(store.free_list.len(), 300 - relations.len());
        assert_eq!(store.live_pages(), relations.len());
        for (name, head) in relations.iter().zip(&heads) {
            assert_eq!(store.relation_pages(name), vec![*head]);
        }

        // A second flush reuses the same spill chain.
        let spill = store.spill_pages.clone();
        let recycled = store.allocate_page(PageType::Data, 0.0).unwrap();
        assert!(!spill.contains(&recycled));
        store.flush().unwrap();
        assert_eq!(store.spill_pages, spill);
    }

    #[test]
    fn test_reopen_with_different_page_size_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAGES_FILE);
        {
            let mut store = PageStore::open(&path, 512, 0o644).unwrap();
            store.flush().unwrap();
        }
        assert!(matches!(
            PageStore::open(&path, 1024, 0o644),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_corrupted_page_detected_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAGES_FILE);
        {
            let mut store = PageStore::open(&path, 512, 0o644).unwrap();
            let page_id = store.select_target("events", b"payload", -1.0).unwrap();
            store.append_record(page_id, b"payload").unwrap();
            store.flush().unwrap();
        }

        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let offset = 512 + PAGE_HEADER_SIZE as u64 + 6;
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let result = PageStore::open(&path, 512, 0o644);
        assert!(matches!(result, Err(Error::Corruption { page_id: 1, .. })));
    }
}
