use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use common::{BpError, BpResult, Offset, INVALID};

const FIELD_WIDTH: usize = 16;

/// The tree's metadata file: root offset, monotonic file-size high-water
/// mark, configured block size, and the free-block list, all encoded as
/// back-to-back 16-character ASCII hexadecimal fields.
///
/// `root_offset == INVALID` (`0xdead_beef`) means the tree is empty; the
/// same sentinel terminates the free-block list.
#[derive(Debug, Clone)]
pub struct BootRecord {
    pub root_offset: Offset,
    pub file_size: u64,
    pub block_size: u64,
    free_blocks: VecDeque<Offset>,
}

impl BootRecord {
    /// A fresh boot record for a brand-new store: empty tree, empty file.
    pub fn empty(block_size: u64) -> Self {
        Self {
            root_offset: INVALID,
            file_size: 0,
            block_size,
            free_blocks: VecDeque::new(),
        }
    }

    pub fn load(path: &Path) -> BpResult<Self> {
        let text = fs::read_to_string(path)?;
        let bytes = text.as_bytes();
        if bytes.len() % FIELD_WIDTH != 0 {
            return Err(BpError::Corrupt(
                "boot record length is not a multiple of the field width".into(),
            ));
        }

        let mut fields = bytes.chunks(FIELD_WIDTH);
        let root_offset = Self::parse_field(fields.next())?;
        let file_size = Self::parse_field(fields.next())?;
        let block_size = Self::parse_field(fields.next())?;

        let mut free_blocks = VecDeque::new();
        for chunk in fields {
            let value = Self::parse_field(Some(chunk))?;
            if value == INVALID {
                break;
            }
            free_blocks.push_back(value);
        }

        Ok(Self {
            root_offset,
            file_size,
            block_size,
            free_blocks,
        })
    }

    pub fn save(&self, path: &Path) -> BpResult<()> {
        let mut text =
            String::with_capacity(FIELD_WIDTH * (4 + self.free_blocks.len()));
        text.push_str(&format!("{:016x}", self.root_offset));
        text.push_str(&format!("{:016x}", self.file_size));
        text.push_str(&format!("{:016x}", self.block_size));
        for offset in &self.free_blocks {
            text.push_str(&format!("{:016x}", offset));
        }
        text.push_str(&format!("{:016x}", INVALID));
        fs::write(path, text)?;
        Ok(())
    }

    pub fn is_empty_tree(&self) -> bool {
        self.root_offset == INVALID
    }

    pub fn clear_root(&mut self) {
        self.root_offset = INVALID;
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn free_blocks(&self) -> impl Iterator<Item = Offset> + '_ {
        self.free_blocks.iter().copied()
    }

    /// Pop the front of the free list (FIFO reuse of released pages).
    pub fn pop_free(&mut self) -> Option<Offset> {
        self.free_blocks.pop_front()
    }

    /// Push a released page onto the back of the free list.
    pub fn push_free(&mut self, offset: Offset) {
        self.free_blocks.push_back(offset);
    }

    /// Allocate a fresh offset at the current high-water mark, advancing
    /// `file_size` by `block_size`.
    pub fn bump_file_size(&mut self) -> Offset {
        let offset = self.file_size;
        self.file_size += self.block_size;
        offset
    }

    fn parse_field(chunk: Option<&[u8]>) -> BpResult<u64> {
        let chunk = chunk.ok_or_else(|| BpError::Corrupt("boot record truncated".into()))?;
        let text = std::str::from_utf8(chunk)
            .map_err(|_| BpError::Corrupt("boot record field is not utf8".into()))?;
        u64::from_str_radix(text, 16)
            .map_err(|_| BpError::Corrupt(format!("boot record field {text:?} is not hex")))
    }
}
