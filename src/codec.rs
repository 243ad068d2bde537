//! Serialisation for the three persistent entities of spec.md §3: inodes,
//! directory tables and block-index tables. Pure functions, no I/O — the
//! codec is symmetric: `decode(encode(x)) == x` for every `x`.
//!
//! Layout is fixed little-endian. A direntry is `size:u16, ino:u32,
//! name:bytes[size - 6]`; a symlink's target is stored inline with its
//! length implied by the inode's `size` field.

use crate::error::FsError;

/// Bytes per data block. Permanent and scratch blocks are never larger.
pub const BLOCK_SIZE: usize = 131_072;

/// Inode number of the mount's root directory.
pub const ROOT_INO: u32 = 1;

/// `size` field width in a direntry header (`size:u16` + `ino:u32`).
const DIRENTRY_HEADER_LEN: usize = 2 + 4;

/// File type carried in the high bits of `mode`, mirrored from `libc`'s
/// `S_IFREG`/`S_IFDIR`/`S_IFLNK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Result<Self, FsError> {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => Ok(FileKind::Regular),
            m if m == libc::S_IFDIR as u32 => Ok(FileKind::Directory),
            m if m == libc::S_IFLNK as u32 => Ok(FileKind::Symlink),
            _ => Err(FsError::Corrupt("inode: unrecognised mode bits")),
        }
    }

    pub fn to_file_type(self) -> fuser::FileType {
        match self {
            FileKind::Regular => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
        }
    }
}

/// A `(name, inode-number)` pair stored inside a directory inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u32,
    pub name: Vec<u8>,
}

/// Mode-dependent tail of an inode record.
#[derive(Debug, Clone, PartialEq)]
pub enum InodeKind {
    /// `blocks[i]` is the permanent id of the i-th block, or `0` for a hole.
    Regular { blocks: Vec<u32> },
    /// `parent` is the inode number `..` resolves to (the root is its own
    /// parent), so `.`/`..` can be synthesised without a stored direntry.
    Directory { entries: Vec<DirEntry>, parent: u32 },
    /// Target path, raw bytes, length equal to the inode's `size` field.
    Symlink { target: Vec<u8> },
}

/// The full in-memory representation of an inode, header plus tail.
#[derive(Debug, Clone, PartialEq)]
pub struct Inode {
    pub mode: u32,
    pub dev: u32,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    pub links: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub kind: InodeKind,
}

impl Inode {
    pub fn kind(&self) -> Result<FileKind, FsError> {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, InodeKind::Directory { .. })
    }

    pub fn blocks_needed(&self) -> u64 {
        self.size.div_ceil(BLOCK_SIZE as u64)
    }

    pub fn new_regular(mode: u32, uid: u32, gid: u32, now: u32) -> Self {
        Self {
            mode: (mode & 0o7777) | libc::S_IFREG as u32,
            dev: 0,
            uid: uid as u16,
            gid: gid as u16,
            size: 0,
            links: 1,
            atime: now,
            mtime: now,
            ctime: now,
            kind: InodeKind::Regular { blocks: Vec::new() },
        }
    }

    pub fn new_directory(mode: u32, uid: u32, gid: u32, now: u32, parent: u32) -> Self {
        Self {
            mode: (mode & 0o7777) | libc::S_IFDIR as u32,
            dev: 0,
            uid: uid as u16,
            gid: gid as u16,
            size: 0,
            links: 2, // self + ".."
            atime: now,
            mtime: now,
            ctime: now,
            kind: InodeKind::Directory {
                entries: Vec::new(),
                parent,
            },
        }
    }

    pub fn new_symlink(target: &[u8], uid: u32, gid: u32, now: u32) -> Self {
        Self {
            mode: 0o777 | libc::S_IFLNK as u32,
            dev: 0,
            uid: uid as u16,
            gid: gid as u16,
            size: target.len() as u64,
            links: 1,
            atime: now,
            mtime: now,
            ctime: now,
            kind: InodeKind::Symlink {
                target: target.to_vec(),
            },
        }
    }
}

/// Directory helpers (spec.md §3: `.` and `..` are implicit, never stored).
impl InodeKind {
    pub fn dir_lookup(&self, name: &[u8]) -> Option<u32> {
        match self {
            InodeKind::Directory { entries, .. } => {
                entries.iter().find(|e| e.name == name).map(|e| e.ino)
            }
            _ => None,
        }
    }

    pub fn dir_append(&mut self, ino: u32, name: &[u8]) {
        if let InodeKind::Directory { entries, .. } = self {
            entries.push(DirEntry {
                ino,
                name: name.to_vec(),
            });
        }
    }

    /// Removes the entry named `name`, returning its inode number if found.
    pub fn dir_remove(&mut self, name: &[u8]) -> Option<u32> {
        match self {
            InodeKind::Directory { entries, .. } => {
                let idx = entries.iter().position(|e| e.name == name)?;
                Some(entries.remove(idx).ino)
            }
            _ => None,
        }
    }

    pub fn dir_replace_ino(&mut self, name: &[u8], new_ino: u32) {
        if let InodeKind::Directory { entries, .. } = self {
            if let Some(e) = entries.iter_mut().find(|e| e.name == name) {
                e.ino = new_ino;
            }
        }
    }

    pub fn dir_is_empty(&self) -> bool {
        match self {
            InodeKind::Directory { entries, .. } => entries.is_empty(),
            _ => true,
        }
    }

    /// The inode `..` resolves to, for a directory.
    pub fn dir_parent(&self) -> Option<u32> {
        match self {
            InodeKind::Directory { parent, .. } => Some(*parent),
            _ => None,
        }
    }
}

/// Serialises an inode to the canonical on-disk byte layout.
pub fn encode_inode(inode: &Inode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&inode.mode.to_le_bytes());
    buf.extend_from_slice(&inode.dev.to_le_bytes());
    buf.extend_from_slice(&inode.uid.to_le_bytes());
    buf.extend_from_slice(&inode.gid.to_le_bytes());
    buf.extend_from_slice(&inode.size.to_le_bytes());
    buf.extend_from_slice(&inode.links.to_le_bytes());
    buf.extend_from_slice(&inode.atime.to_le_bytes());
    buf.extend_from_slice(&inode.mtime.to_le_bytes());
    buf.extend_from_slice(&inode.ctime.to_le_bytes());

    match &inode.kind {
        InodeKind::Regular { blocks } => {
            buf.extend_from_slice(&(blocks.len() as u64).to_le_bytes());
            for id in blocks {
                buf.extend_from_slice(&id.to_le_bytes());
            }
        }
        InodeKind::Directory { entries, parent } => {
            buf.extend_from_slice(&parent.to_le_bytes());
            buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for entry in entries {
                let size = (DIRENTRY_HEADER_LEN + entry.name.len()) as u16;
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&entry.ino.to_le_bytes());
                buf.extend_from_slice(&entry.name);
            }
        }
        InodeKind::Symlink { target } => buf.extend_from_slice(target),
    }
    buf
}

/// A small cursor that fails closed on any short read instead of panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FsError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(FsError::Corrupt("inode: truncated buffer"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, FsError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, FsError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FsError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Deserialises an inode, failing with `Corrupt` on any length mismatch.
pub fn decode_inode(buf: &[u8]) -> Result<Inode, FsError> {
    let mut r = Reader::new(buf);
    let mode = r.u32()?;
    let dev = r.u32()?;
    let uid = r.u16()?;
    let gid = r.u16()?;
    let size = r.u64()?;
    let links = r.u32()?;
    let atime = r.u32()?;
    let mtime = r.u32()?;
    let ctime = r.u32()?;

    let kind = match FileKind::from_mode(mode)? {
        FileKind::Regular => {
            let length = r.u64()? as usize;
            let mut blocks = Vec::with_capacity(length);
            for _ in 0..length {
                blocks.push(r.u32()?);
            }
            InodeKind::Regular { blocks }
        }
        FileKind::Directory => {
            let parent = r.u32()?;
            let length = u32::from_le_bytes(r.take(4)?.try_into().unwrap()) as usize;
            let mut entries = Vec::with_capacity(length);
            for _ in 0..length {
                let entry_size = r.u16()? as usize;
                let ino = r.u32()?;
                let name_len = entry_size
                    .checked_sub(DIRENTRY_HEADER_LEN)
                    .ok_or(FsError::Corrupt("direntry: size smaller than header"))?;
                let name = r.take(name_len)?.to_vec();
                entries.push(DirEntry { ino, name });
            }
            InodeKind::Directory { entries, parent }
        }
        FileKind::Symlink => {
            let target = r.take(r.buf.len() - r.pos)?.to_vec();
            InodeKind::Symlink { target }
        }
    };

    Ok(Inode {
        mode,
        dev,
        uid,
        gid,
        size,
        links,
        atime,
        mtime,
        ctime,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_inode_round_trips() {
        let inode = Inode {
            mode: libc::S_IFREG as u32 | 0o644,
            dev: 0,
            uid: 1000,
            gid: 1000,
            size: BLOCK_SIZE as u64 * 2,
            links: 1,
            atime: 0,
            mtime: 42,
            ctime: 42,
            kind: InodeKind::Regular {
                blocks: vec![0, 7, 0],
            },
        };
        let encoded = encode_inode(&inode);
        assert_eq!(decode_inode(&encoded).unwrap(), inode);
    }

    #[test]
    fn directory_inode_round_trips() {
        let mut inode = Inode::new_directory(0o755, 0, 0, 1000, ROOT_INO);
        inode.kind.dir_append(2, b"foo");
        inode.kind.dir_append(3, b"a-rather-long-entry-name.txt");
        let encoded = encode_inode(&inode);
        assert_eq!(decode_inode(&encoded).unwrap(), inode);
    }

    #[test]
    fn symlink_inode_round_trips() {
        let inode = Inode::new_symlink(b"/a/f", 0, 0, 1000);
        let encoded = encode_inode(&inode);
        assert_eq!(decode_inode(&encoded).unwrap(), inode);
    }

    #[test]
    fn truncated_buffer_is_corrupt_not_panic() {
        let inode = Inode::new_directory(0o755, 0, 0, 0, ROOT_INO);
        let mut encoded = encode_inode(&inode);
        encoded.truncate(5);
        assert!(matches!(decode_inode(&encoded), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn dir_append_lookup_remove() {
        let mut kind = InodeKind::Directory {
            entries: Vec::new(),
            parent: ROOT_INO,
        };
        assert_eq!(kind.dir_lookup(b"f"), None);
        kind.dir_append(5, b"f");
        assert_eq!(kind.dir_lookup(b"f"), Some(5));
        assert_eq!(kind.dir_remove(b"f"), Some(5));
        assert_eq!(kind.dir_lookup(b"f"), None);
    }
}
