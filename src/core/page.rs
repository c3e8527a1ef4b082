use crate::core::constants::*;
use crate::core::errors::*;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    Data = 0,
    Index = 1,
    Metadata = 2,
    Wal = 3,
}

impl PageType {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PageType::Data),
            1 => Ok(PageType::Index),
            2 => Ok(PageType::Metadata),
            3 => Ok(PageType::Wal),
            other => Err(Error::DataCorruption {
                details: format!("unknown page type tag {}", other),
            }),
        }
    }
}

/// SHA-256 over a page's data region.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageHeader {
    pub page_id: PageId,
    pub page_type: PageType,
    pub checksum: [u8; CHECKSUM_SIZE],
    pub curvature: f64,
    /// 0 means end of chain.
    pub next_page: PageId,
    pub record_count: u32,
}

impl PageHeader {
    pub fn new(page_id: PageId, page_type: PageType, curvature: f64) -> Self {
        Self {
            page_id,
            page_type,
            checksum: [0u8; CHECKSUM_SIZE],
            curvature,
            next_page: 0,
            record_count: 0,
        }
    }

    pub fn next(&self) -> Option<PageId> {
        if self.next_page == 0 {
            None
        } else {
            Some(self.next_page)
        }
    }

    /// Writes the big-endian header layout into the first `PAGE_HEADER_SIZE` bytes of `buf`.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        let mut offset = 0;

        buf[offset..offset + 4].copy_from_slice(&self.page_id.to_be_bytes());
        offset += 4;

        buf[offset] = self.page_type as u8;
        offset += 1;

        buf[offset..offset + CHECKSUM_SIZE].copy_from_slice(&self.checksum);
        offset += CHECKSUM_SIZE;

        buf[offset..offset + 8].copy_from_slice(&self.curvature.to_be_bytes());
        offset += 8;

        buf[offset..offset + 4].copy_from_slice(&self.next_page.to_be_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.record_count.to_be_bytes());
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(Error::DataCorruption {
                details: format!("page header needs {} bytes, got {}", PAGE_HEADER_SIZE, data.len()),
            });
        }

        let mut offset = 0;

        let page_id = u32::from_be_bytes(data[offset..offset + 4].try_into()?);
        offset += 4;

        let page_type = PageType::from_u8(data[offset])?;
        offset += 1;

        let mut checksum = [0u8; CHECKSUM_SIZE];
        checksum.copy_from_slice(&data[offset..offset + CHECKSUM_SIZE]);
        offset += CHECKSUM_SIZE;

        let curvature = f64::from_be_bytes(data[offset..offset + 8].try_into()?);
        offset += 8;

        let next_page = u32::from_be_bytes(data[offset..offset + 4].try_into()?);
        offset += 4;

        let record_count = u32::from_be_bytes(data[offset..offset + 4].try_into()?);

        Ok(Self {
            page_id,
            page_type,
            checksum,
            curvature,
            next_page,
            record_count,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub header: PageHeader,
    pub data: Vec<u8>,
}

impl Page {
    /// A zero-filled page whose data region is `page_size - PAGE_HEADER_SIZE` bytes.
    pub fn new(page_id: PageId, page_type: PageType, curvature: f64, page_size: usize) -> Self {
        let data = vec![0u8; page_size - PAGE_HEADER_SIZE];
        let mut header = PageHeader::new(page_id, page_type, curvature);
        header.checksum = checksum(&data);
        Self { header, data }
    }

    pub fn id(&self) -> PageId {
        self.header.page_id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn refresh_checksum(&mut self) {
        self.header.checksum = checksum(&self.data);
    }

    pub fn verify_checksum(&self) -> bool {
        checksum(&self.data) == self.header.checksum
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_HEADER_SIZE + self.data.len()];
        self.header.serialize_into(&mut buf);
        buf[PAGE_HEADER_SIZE..].copy_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let header = PageHeader::deserialize(buf)?;
        Ok(Self {
            header,
            data: buf[PAGE_HEADER_SIZE..].to_vec(),
        })
    }

    /// Offset of the first free byte: the terminating zero-length frame.
    pub fn used_bytes(&self) -> usize {
        let mut offset = 0;
        while offset + RECORD_FRAME_SIZE <= self.data.len() {
            let len = read_frame_len(&self.data, offset);
            if len == 0 || offset + RECORD_FRAME_SIZE + len > self.data.len() {
                break;
            }
            offset += RECORD_FRAME_SIZE + len;
        }
        offset
    }

    pub fn free_bytes(&self) -> usize {
        self.data.len() - self.used_bytes()
    }

    /// Splits the data region into its framed records.
    pub fn records(&self) -> Result<Vec<&[u8]>> {
        let mut records = Vec::with_capacity(self.header.record_count as usize);
        let mut offset = 0;
        while offset + RECORD_FRAME_SIZE <= self.data.len() {
            let len = read_frame_len(&self.data, offset);
            if len == 0 {
                break;
            }
            let start = offset + RECORD_FRAME_SIZE;
            if start + len > self.data.len() {
                return Err(Error::Corruption {
                    component: "page".to_string(),
                    page_id: self.header.page_id,
                    details: format!("record frame at offset {} overruns the data region", offset),
                });
            }
            records.push(&self.data[start..start + len]);
            offset = start + len;
        }
        Ok(records)
    }
}

fn read_frame_len(data: &[u8], offset: usize) -> usize {
    let mut len = [0u8; RECORD_FRAME_SIZE];
    len.copy_from_slice(&data[offset..offset + RECORD_FRAME_SIZE]);
    u32::from_be_bytes(len) as usize
}

pub fn frame_record(record: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(RECORD_FRAME_SIZE + record.len());
    framed.extend_from_slice(&(record.len() as u32).to_be_bytes());
    framed.extend_from_slice(record);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_53_bytes_big_endian() {
        assert_eq!(PAGE_HEADER_SIZE, 53);

        let mut header = PageHeader::new(0x01020304, PageType::Index, 0.5);
        header.next_page = 9;
        header.record_count = 2;
        header.checksum = [0xAB; CHECKSUM_SIZE];

        let mut buf = vec![0u8; PAGE_HEADER_SIZE];
        header.serialize_into(&mut buf);

        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        assert_eq!(buf[4], 1);
        assert_eq!(&buf[5..37], &[0xAB; 32]);
        assert_eq!(&buf[37..45], &0.5f64.to_be_bytes());
        assert_eq!(&buf[45..49], &9u32.to_be_bytes());
        assert_eq!(&buf[49..53], &2u32.to_be_bytes());

        let parsed = PageHeader::deserialize(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.next(), Some(9));
    }

    #[test]
    fn test_unknown_page_type_rejected() {
        let mut buf = vec![0u8; PAGE_HEADER_SIZE];
        buf[4] = 42;
        assert!(PageHeader::deserialize(&buf).is_err());
    }

    #[test]
    fn test_new_page_is_zeroed_with_valid_checksum() {
        let page = Page::new(3, PageType::Data, -1.0, 256);
        assert_eq!(page.capacity(), 256 - PAGE_HEADER_SIZE);
        assert!(page.data.iter().all(|&b| b == 0));
        assert!(page.verify_checksum());
        assert_eq!(page.used_bytes(), 0);
        assert_eq!(page.header.next(), None);
    }

    #[test]
    fn test_record_frames() {
        let mut page = Page::new(1, PageType::Data, -1.0, 256);
        let a = frame_record(b"alpha");
        let b = frame_record(b"be");
        page.data[..a.len()].copy_from_slice(&a);
        page.data[a.len()..a.len() + b.len()].copy_from_slice(&b);

        let records = page.records().unwrap();
        assert_eq!(records, vec![&b"alpha"[..], &b"be"[..]]);
        assert_eq!(page.used_bytes(), a.len() + b.len());
    }

    #[test]
    fn test_bytes_round_trip_keeps_checksum() {
        let mut page = Page::new(5, PageType::Data, 2.0, 128);
        page.data[0] = 7;
        page.refresh_checksum();

        let restored = Page::from_bytes(&page.to_bytes()).unwrap();
        assert_eq!(restored.header, page.header);
        assert!(restored.verify_checksum());
    }
}
