pub const PAGE_SIZE: usize = 4096;

pub const MIN_PAGE_SIZE: usize = 128;

pub const MAX_PAGE_SIZE: usize = 65536;

pub const VERSION: u32 = 1;

pub const MAGIC: [u8; 4] = *b"CRVD";

pub const CHECKSUM_SIZE: usize = 32;

/// page_id:u32, page_type:u8, checksum:[u8; 32], curvature:f64, next_page:u32, record_count:u32
pub const PAGE_HEADER_SIZE: usize = 4 + 1 + CHECKSUM_SIZE + 8 + 4 + 4;

/// length:u32 followed by the SHA-256 of the payload
pub const WAL_ENTRY_HEADER_SIZE: usize = 4 + CHECKSUM_SIZE;

/// Length prefix of a record frame inside a page data region.
pub const RECORD_FRAME_SIZE: usize = 4;

pub const DEFAULT_CURVATURE: f64 = -1.0;

pub const CURVATURE_PRECISION_TOLERANCE: f64 = 1e-10;

pub const MAX_RELATION_NAME_LEN: usize = 64;

pub const PAGES_FILE: &str = "pages.db";
pub const WAL_FILE: &str = "wal.log";
pub const CATALOG_FILE: &str = "catalog.json";
pub const LOCK_FILE: &str = "LOCK";

pub type PageId = u32;

pub type TransactionID = u64;

/// Byte offset of a WAL entry; its durable identity.
pub type WalPosition = u64;
