//! Component D: the filesystem operation engine. `Zdbfs` owns the cache and
//! the three backend connections and implements every operation of
//! spec.md §4.D as a fallible inherent method; a thin `fuser::Filesystem`
//! impl at the bottom of this file adapts those methods to kernel replies.
//!
//! Every method takes `&mut self`, mirroring the single dispatcher thread
//! of spec.md §5 — there is no locking anywhere in this module, since
//! `fuser` never calls two `Filesystem` methods concurrently.

use std::os::unix::ffi::OsStrExt;
use std::time::{SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

use crate::backend::Backend;
use crate::cache::{BlockState, InoRoot, Stats};
use crate::codec::{self, FileKind, Inode, InodeKind, BLOCK_SIZE, ROOT_INO};
use crate::config::Options;
use crate::error::FsError;

/// ioctl command recognized by this filesystem (spec.md §6): take a
/// consistent snapshot by flushing every dirty inode and bumping a
/// generation counter.
pub const IOCTL_SNAPSHOT: u32 = 0x5a44_0001;

fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Aggregate statfs-style numbers, reported through `fuser::ReplyStatfs`.
#[derive(Debug, Clone, Copy)]
pub struct Statfs {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub block_size: u32,
}

/// The whole mutable state of a mounted filesystem. No field is ever
/// wrapped in `Arc`/`Mutex`: `fuser::Session::run` dispatches one request
/// at a time, so plain `&mut self` access is sufficient and sound.
pub struct Zdbfs {
    cache: InoRoot,
    meta: Box<dyn Backend>,
    data: Box<dyn Backend>,
    temp: Box<dyn Backend>,
    stats: Stats,
    opts: Options,
    scratch: Vec<u8>,
    generation: u64,
}

impl Zdbfs {
    /// Opens a filesystem against already-connected backends, bootstrapping
    /// the root directory inode (fixed at `ROOT_INO`) if the meta namespace
    /// doesn't have one yet.
    pub fn new(
        opts: Options,
        meta: Box<dyn Backend>,
        data: Box<dyn Backend>,
        temp: Box<dyn Backend>,
    ) -> Result<Self, FsError> {
        let mut fs = Self {
            cache: InoRoot::new(),
            meta,
            data,
            temp,
            stats: Stats::default(),
            opts,
            scratch: Vec::with_capacity(BLOCK_SIZE),
            generation: 0,
        };
        if fs.meta.get(ROOT_INO)?.is_none() {
            let root = Inode::new_directory(0o755, 0, 0, now_unix(), ROOT_INO);
            fs.meta.put(Some(ROOT_INO), &codec::encode_inode(&root))?;
        }

        // Discover the highest inode id already in use and raise the meta
        // allocator past it, so a freshly created inode never reuses one
        // still on the backend (in particular, never reassigns ROOT_INO on
        // a namespace whose counter was never seeded).
        let max_ino = Self::scan_max_key(&*fs.meta)?;
        fs.meta.bootstrap_allocator(max_ino.max(ROOT_INO))?;

        // Likewise for the data namespace, so a newly committed block never
        // collides with one already owned by an existing inode.
        let max_block = Self::scan_max_key(&*fs.data)?;
        fs.data.bootstrap_allocator(max_block)?;

        // Reclaim scratch keys left behind by an unclean shutdown: nothing
        // references them any more since every inode's Flushed blocks were
        // committed or discarded before the previous mount exited.
        Self::reclaim_all(&*fs.temp)?;

        Ok(fs)
    }

    /// Walks an entire namespace via repeated `scan` calls, returning the
    /// highest key seen. `0` (the sentinel, never a real id) if empty.
    fn scan_max_key(backend: &dyn Backend) -> Result<u32, FsError> {
        let mut max = 0u32;
        let mut cursor = 0u32;
        loop {
            let (next, keys) = backend.scan(cursor)?;
            max = max.max(keys.into_iter().max().unwrap_or(0));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(max)
    }

    /// Deletes every key currently present in a namespace.
    fn reclaim_all(backend: &dyn Backend) -> Result<(), FsError> {
        let mut cursor = 0u32;
        loop {
            let (next, keys) = backend.scan(cursor)?;
            for key in keys {
                backend.del(key)?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Guarantees `ino` is resident in the cache, fetching and decoding it
    /// from the meta backend on a miss.
    fn ensure_resident(&mut self, ino: u32) -> Result<(), FsError> {
        if self.cache.find(ino).is_some() {
            self.stats.cache_hit += 1;
            return Ok(());
        }
        self.stats.cache_miss += 1;
        let raw = self.meta.get(ino)?.ok_or(FsError::NotFound)?;
        let inode = codec::decode_inode(&raw)?;
        self.cache.insert(ino, inode);
        Ok(())
    }

    fn load(&mut self, ino: u32) -> Result<&Inode, FsError> {
        self.ensure_resident(ino)?;
        Ok(&self.cache.find(ino).unwrap().inode)
    }

    fn load_mut(&mut self, ino: u32) -> Result<&mut Inode, FsError> {
        self.ensure_resident(ino)?;
        let row = self.cache.find_mut(ino).unwrap();
        row.dirty = true;
        Ok(&mut row.inode)
    }

    /// Writes the resident, possibly-dirty inode for `ino` back to the
    /// meta backend and clears its dirty bit. No-op if not dirty.
    fn writeback_inode(&mut self, ino: u32) -> Result<(), FsError> {
        let Some(row) = self.cache.find_mut(ino) else {
            return Ok(());
        };
        if !row.dirty {
            return Ok(());
        }
        let encoded = codec::encode_inode(&row.inode);
        self.meta.put(Some(ino), &encoded)?;
        row.dirty = false;
        Ok(())
    }

    /// Promotes every `Flushed` block of `ino` to a permanent data-namespace
    /// block, rewriting the inode's block-id table, then writes the inode
    /// back. This is the write-back commit path of spec.md §4.C/§4.D.
    pub fn flush(&mut self, ino: u32) -> Result<(), FsError> {
        let perm_ids: Vec<(usize, u32, Vec<u8>)> = {
            let Some(row) = self.cache.find_mut(ino) else {
                return Ok(());
            };
            let mut to_commit = Vec::new();
            for (idx, entry) in row.blocks.iter().enumerate() {
                if let BlockState::Flushed { data, .. } = &entry.state {
                    to_commit.push((idx, data.clone()));
                }
            }
            let mut committed = Vec::with_capacity(to_commit.len());
            for (idx, data) in to_commit {
                let existing = match &row.inode.kind {
                    InodeKind::Regular { blocks } => blocks.get(idx).copied().filter(|&id| id != 0),
                    _ => None,
                };
                committed.push((idx, existing.unwrap_or(0), data));
            }
            committed
        };

        for (idx, existing, data) in perm_ids {
            let perm_id = self
                .data
                .put(if existing == 0 { None } else { Some(existing) }, &data)?;
            let row = self.cache.find_mut(ino).unwrap();
            if let InodeKind::Regular { blocks } = &mut row.inode.kind {
                if blocks.len() <= idx {
                    blocks.resize(idx + 1, 0);
                }
                blocks[idx] = perm_id;
            }
            if let BlockState::Flushed { temp_key, .. } = &row.blocks[idx].state {
                self.temp.del(*temp_key)?;
            }
            row.blocks[idx].state = BlockState::Online(data);
            row.dirty = true;
        }

        self.writeback_inode(ino)
    }

    /// Releases the caller's interest in `ino`. Resident but unpinned rows
    /// may be evicted by the admission policy on a subsequent request; this
    /// filesystem does not evict eagerly on release.
    pub fn release(&mut self, ino: u32) -> Result<(), FsError> {
        self.flush(ino)
    }

    /// Enforces `opts.cachesize` across every resident row's online/flushed
    /// blocks: evicts the globally least-recently-touched clean block, or
    /// forces a flush-then-evict of the LRU dirty block if no clean
    /// candidate exists (spec.md §4.C's admission policy).
    fn admit_block(&mut self) -> Result<(), FsError> {
        if self.opts.nocache {
            return Ok(());
        }
        let total: usize = self.cache.rows().map(|r| r.online_block_count()).sum();
        if total <= self.opts.cachesize {
            return Ok(());
        }
        self.stats.cache_full += 1;

        let mut clean_candidate: Option<(u32, usize, u64)> = None;
        let mut dirty_candidate: Option<(u32, usize, u64)> = None;
        for row in self.cache.rows() {
            for (idx, entry) in row.blocks.iter().enumerate() {
                match &entry.state {
                    BlockState::Online(_) => {
                        if clean_candidate.map(|(_, _, t)| entry.last_used < t).unwrap_or(true) {
                            clean_candidate = Some((row.ino, idx, entry.last_used));
                        }
                    }
                    BlockState::Flushed { .. } => {
                        if dirty_candidate.map(|(_, _, t)| entry.last_used < t).unwrap_or(true) {
                            dirty_candidate = Some((row.ino, idx, entry.last_used));
                        }
                    }
                    BlockState::Offline => {}
                }
            }
        }

        if let Some((ino, idx, _)) = clean_candidate {
            self.stats.cache_linear_flush += 1;
            let row = self.cache.find_mut(ino).unwrap();
            row.blocks[idx].state = BlockState::Offline;
            return Ok(());
        }

        if let Some((ino, idx, _)) = dirty_candidate {
            self.stats.cache_random_flush += 1;
            self.flush(ino)?;
            if let Some(row) = self.cache.find_mut(ino) {
                row.blocks[idx].state = BlockState::Offline;
            }
        }
        Ok(())
    }

    fn attr(ino: u32, inode: &Inode) -> Result<FileAttr, FsError> {
        let kind = inode.kind()?;
        Ok(FileAttr {
            ino: ino as u64,
            size: inode.size,
            blocks: inode.blocks_needed(),
            atime: UNIX_EPOCH + std::time::Duration::from_secs(inode.atime as u64),
            mtime: UNIX_EPOCH + std::time::Duration::from_secs(inode.mtime as u64),
            ctime: UNIX_EPOCH + std::time::Duration::from_secs(inode.ctime as u64),
            crtime: UNIX_EPOCH,
            kind: kind.to_file_type(),
            perm: (inode.mode & 0o7777) as u16,
            nlink: inode.links,
            uid: inode.uid as u32,
            gid: inode.gid as u32,
            rdev: inode.dev,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        })
    }

    pub fn lookup(&mut self, parent: u32, name: &[u8]) -> Result<(u32, FileAttr), FsError> {
        let parent_inode = self.load(parent)?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let ino = parent_inode
            .kind
            .dir_lookup(name)
            .ok_or(FsError::NotFound)?;
        let inode = self.load(ino)?;
        Ok((ino, Self::attr(ino, inode)?))
    }

    pub fn getattr(&mut self, ino: u32) -> Result<FileAttr, FsError> {
        let inode = self.load(ino)?;
        Self::attr(ino, inode)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn setattr(
        &mut self,
        ino: u32,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
    ) -> Result<FileAttr, FsError> {
        let now = now_unix();
        {
            let inode = self.load_mut(ino)?;
            if let Some(mode) = mode {
                inode.mode = (inode.mode & !0o7777) | (mode & 0o7777);
            }
            if let Some(uid) = uid {
                inode.uid = uid as u16;
            }
            if let Some(gid) = gid {
                inode.gid = gid as u16;
            }
            inode.ctime = now;
        }

        if let Some(size) = size {
            let old_size = self.load(ino)?.size;
            if size < old_size {
                self.truncate_blocks(ino, size)?;
            } else if let InodeKind::Regular { blocks } = &mut self.load_mut(ino)?.kind {
                let needed = size.div_ceil(BLOCK_SIZE as u64) as usize;
                blocks.resize(needed, 0);
            }
            self.load_mut(ino)?.size = size;
        }

        let inode = self.load(ino)?;
        Self::attr(ino, inode)
    }

    /// Shrinks a regular file's block table to `new_size`, freeing every
    /// permanent/staged block past the new end (spec.md §4.D's setattr
    /// shrink semantics).
    fn truncate_blocks(&mut self, ino: u32, new_size: u64) -> Result<(), FsError> {
        let needed = new_size.div_ceil(BLOCK_SIZE as u64) as usize;
        let dropped: Vec<u32> = {
            let row = self.cache.find_mut(ino).unwrap();
            let dropped = match &mut row.inode.kind {
                InodeKind::Regular { blocks } if blocks.len() > needed => {
                    blocks.split_off(needed)
                }
                _ => Vec::new(),
            };
            if row.blocks.len() > needed {
                for entry in row.blocks.split_off(needed) {
                    if let BlockState::Flushed { temp_key, .. } = entry.state {
                        self.temp.del(temp_key)?;
                    }
                }
            }
            dropped
        };
        for id in dropped {
            if id != 0 {
                self.data.del(id)?;
            }
        }
        Ok(())
    }

    pub fn read(&mut self, ino: u32, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let file_size = self.load(ino)?.size;
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let to_read = size.min((file_size - offset) as u32) as usize;
        let mut out = Vec::with_capacity(to_read);
        let mut remaining = to_read;
        let mut pos = offset;

        while remaining > 0 {
            let block_idx = (pos / BLOCK_SIZE as u64) as usize;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = remaining.min(BLOCK_SIZE - in_block);
            let data = self.block_contents(ino, block_idx)?;
            let end = (in_block + chunk).min(data.len());
            if in_block < end {
                out.extend_from_slice(&data[in_block..end]);
            }
            out.resize(out.len() + (chunk - (end.saturating_sub(in_block))), 0);
            remaining -= chunk;
            pos += chunk as u64;
        }
        self.admit_block()?;
        Ok(out)
    }

    /// Returns the current (possibly hole-filled) bytes of block `idx`,
    /// fetching it from the data backend on a cache miss.
    fn block_contents(&mut self, ino: u32, idx: usize) -> Result<Vec<u8>, FsError> {
        self.ensure_resident(ino)?;
        {
            let row = self.cache.find_mut(ino).unwrap();
            let entry = row.block_mut(idx);
            match &entry.state {
                BlockState::Online(data) => return Ok(data.clone()),
                BlockState::Flushed { data, .. } => return Ok(data.clone()),
                BlockState::Offline => {}
            }
        }
        let perm_id = match &self.cache.find(ino).unwrap().inode.kind {
            InodeKind::Regular { blocks } => blocks.get(idx).copied().unwrap_or(0),
            _ => return Err(FsError::IsDirectory),
        };
        let data = if perm_id == 0 {
            vec![0u8; BLOCK_SIZE]
        } else {
            self.data.get(perm_id)?.ok_or(FsError::NotFound)?
        };
        let row = self.cache.find_mut(ino).unwrap();
        row.block_mut(idx).state = BlockState::Online(data.clone());
        Ok(data)
    }

    pub fn write(&mut self, ino: u32, offset: u64, buf: &[u8]) -> Result<u32, FsError> {
        let new_size = offset + buf.len() as u64;
        if new_size > self.opts.size {
            return Err(FsError::NoSpace);
        }
        let mut remaining = buf;
        let mut pos = offset;
        while !remaining.is_empty() {
            let block_idx = (pos / BLOCK_SIZE as u64) as usize;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = remaining.len().min(BLOCK_SIZE - in_block);

            let mut data = self.block_contents(ino, block_idx)?;
            data.resize(BLOCK_SIZE, 0);
            data[in_block..in_block + chunk].copy_from_slice(&remaining[..chunk]);

            let row = self.cache.find_mut(ino).unwrap();
            let temp_key = row.blocks.get(block_idx).and_then(|e| match &e.state {
                BlockState::Flushed { temp_key, .. } => Some(*temp_key),
                _ => None,
            });
            let temp_key = match temp_key {
                Some(k) => {
                    self.temp.put(Some(k), &data)?;
                    k
                }
                None => self.temp.put(None, &data)?,
            };
            let row = self.cache.find_mut(ino).unwrap();
            row.block_mut(block_idx).state = BlockState::Flushed { data, temp_key };
            row.dirty = true;

            remaining = &remaining[chunk..];
            pos += chunk as u64;
        }

        let now = now_unix();
        let inode = self.load_mut(ino)?;
        if new_size > inode.size {
            inode.size = new_size;
        }
        inode.mtime = now;
        inode.ctime = now;
        self.admit_block()?;
        Ok(buf.len() as u32)
    }

    fn create_entry(
        &mut self,
        parent: u32,
        name: &[u8],
        new_inode: Inode,
    ) -> Result<(u32, FileAttr), FsError> {
        {
            let parent_inode = self.load(parent)?;
            if !parent_inode.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if parent_inode.kind.dir_lookup(name).is_some() {
                return Err(FsError::Io("entry already exists".into()));
            }
        }
        let encoded = codec::encode_inode(&new_inode);
        let ino = self.meta.put(None, &encoded)?;
        self.cache.insert(ino, new_inode);

        let now = now_unix();
        let parent_inode = self.load_mut(parent)?;
        parent_inode.kind.dir_append(ino, name);
        parent_inode.mtime = now;
        self.writeback_inode(parent)?;
        self.writeback_inode(ino)?;

        let inode = self.load(ino)?;
        Ok((ino, Self::attr(ino, inode)?))
    }

    pub fn create(
        &mut self,
        parent: u32,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(u32, FileAttr), FsError> {
        self.create_entry(parent, name, Inode::new_regular(mode, uid, gid, now_unix()))
    }

    pub fn mkdir(
        &mut self,
        parent: u32,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(u32, FileAttr), FsError> {
        let (ino, attr) = self.create_entry(
            parent,
            name,
            Inode::new_directory(mode, uid, gid, now_unix(), parent),
        )?;
        let parent_inode = self.load_mut(parent)?;
        parent_inode.links += 1;
        self.writeback_inode(parent)?;
        Ok((ino, attr))
    }

    pub fn symlink(
        &mut self,
        parent: u32,
        name: &[u8],
        target: &[u8],
        uid: u32,
        gid: u32,
    ) -> Result<(u32, FileAttr), FsError> {
        self.create_entry(parent, name, Inode::new_symlink(target, uid, gid, now_unix()))
    }

    pub fn readlink(&mut self, ino: u32) -> Result<Vec<u8>, FsError> {
        match &self.load(ino)?.kind {
            InodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(FsError::Io("not a symlink".into())),
        }
    }

    pub fn unlink(&mut self, parent: u32, name: &[u8]) -> Result<(), FsError> {
        let ino = {
            let parent_inode = self.load(parent)?;
            if !parent_inode.is_dir() {
                return Err(FsError::NotDirectory);
            }
            parent_inode.kind.dir_lookup(name).ok_or(FsError::NotFound)?
        };
        if self.load(ino)?.is_dir() {
            return Err(FsError::IsDirectory);
        }

        let now = now_unix();
        let parent_inode = self.load_mut(parent)?;
        parent_inode.kind.dir_remove(name);
        parent_inode.mtime = now;
        self.writeback_inode(parent)?;

        let inode = self.load_mut(ino)?;
        inode.links = inode.links.saturating_sub(1);
        if inode.links == 0 {
            self.free_inode(ino)?;
        } else {
            self.writeback_inode(ino)?;
        }
        Ok(())
    }

    pub fn rmdir(&mut self, parent: u32, name: &[u8]) -> Result<(), FsError> {
        let ino = {
            let parent_inode = self.load(parent)?;
            if !parent_inode.is_dir() {
                return Err(FsError::NotDirectory);
            }
            parent_inode.kind.dir_lookup(name).ok_or(FsError::NotFound)?
        };
        {
            let inode = self.load(ino)?;
            if !inode.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if !inode.kind.dir_is_empty() {
                return Err(FsError::NotEmpty);
            }
        }

        let now = now_unix();
        let parent_inode = self.load_mut(parent)?;
        parent_inode.kind.dir_remove(name);
        parent_inode.mtime = now;
        parent_inode.links = parent_inode.links.saturating_sub(1);
        self.writeback_inode(parent)?;
        self.free_inode(ino)?;
        Ok(())
    }

    /// Reclaims an inode with no remaining links: drops every permanent
    /// data block it owns and deletes the meta record.
    fn free_inode(&mut self, ino: u32) -> Result<(), FsError> {
        let blocks = match &self.load(ino)?.kind {
            InodeKind::Regular { blocks } => blocks.clone(),
            _ => Vec::new(),
        };
        for id in blocks {
            if id != 0 {
                self.data.del(id)?;
            }
        }
        if let Some(row) = self.cache.find(ino) {
            let temp_keys: Vec<u32> = row
                .blocks
                .iter()
                .filter_map(|entry| match &entry.state {
                    BlockState::Flushed { temp_key, .. } => Some(*temp_key),
                    _ => None,
                })
                .collect();
            for key in temp_keys {
                self.temp.del(key)?;
            }
        }
        self.cache.evict(ino);
        self.meta.del(ino)
    }

    pub fn rename(
        &mut self,
        parent: u32,
        name: &[u8],
        new_parent: u32,
        new_name: &[u8],
    ) -> Result<(), FsError> {
        let ino = {
            let parent_inode = self.load(parent)?;
            if !parent_inode.is_dir() {
                return Err(FsError::NotDirectory);
            }
            parent_inode.kind.dir_lookup(name).ok_or(FsError::NotFound)?
        };
        if !self.load(new_parent)?.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let now = now_unix();
        if let Some(existing) = self.load(new_parent)?.kind.dir_lookup(new_name) {
            if existing != ino {
                self.unlink(new_parent, new_name).or_else(|e| match e {
                    FsError::IsDirectory => self.rmdir(new_parent, new_name),
                    other => Err(other),
                })?;
            }
        }

        let parent_inode = self.load_mut(parent)?;
        parent_inode.kind.dir_remove(name);
        parent_inode.mtime = now;
        self.writeback_inode(parent)?;

        let dest_inode = self.load_mut(new_parent)?;
        dest_inode.kind.dir_append(ino, new_name);
        dest_inode.mtime = now;
        self.writeback_inode(new_parent)?;

        // A moved directory's ".." must follow it to the new parent.
        if let InodeKind::Directory { parent, .. } = &mut self.load_mut(ino)?.kind {
            *parent = new_parent;
        }
        self.writeback_inode(ino)?;
        Ok(())
    }

    pub fn readdir(&mut self, ino: u32) -> Result<Vec<(u32, Vec<u8>, FileType)>, FsError> {
        let inode = self.load(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let InodeKind::Directory { entries, parent } = &inode.kind else {
            unreachable!()
        };
        let parent = *parent;
        let entries = entries.clone();
        let mut out = Vec::with_capacity(entries.len() + 2);
        out.push((ino, b".".to_vec(), FileType::Directory));
        out.push((parent, b"..".to_vec(), FileType::Directory));
        for entry in entries {
            let kind = self.load(entry.ino)?.kind()?;
            out.push((entry.ino, entry.name, kind.to_file_type()));
        }
        Ok(out)
    }

    /// Computes the live total of every inode's `size` field by scanning
    /// the meta namespace (spec.md §4.D: `free = fssize - Σ(file sizes)`).
    fn used_bytes(&self) -> Result<u64, FsError> {
        let mut used = 0u64;
        let mut cursor = 0u32;
        loop {
            let (next, keys) = self.meta.scan(cursor)?;
            for key in keys {
                if let Some(raw) = self.meta.get(key)? {
                    used += codec::decode_inode(&raw)?.size;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(used)
    }

    pub fn statfs(&self) -> Result<Statfs, FsError> {
        let used = self.used_bytes()?;
        Ok(Statfs {
            total_bytes: self.opts.size,
            free_bytes: self.opts.size.saturating_sub(used),
            block_size: BLOCK_SIZE as u32,
        })
    }

    /// Handles the `SNAPSHOT` ioctl (spec.md §6): flushes every dirty
    /// inode and returns the post-flush generation counter.
    pub fn snapshot(&mut self) -> Result<u64, FsError> {
        let dirty: Vec<u32> = self
            .cache
            .rows()
            .filter(|r| r.dirty || r.blocks.iter().any(|b| b.is_flushed()))
            .map(|r| r.ino)
            .collect();
        for ino in dirty {
            self.flush(ino)?;
        }
        self.generation += 1;
        Ok(self.generation)
    }
}

impl fuser::Filesystem for Zdbfs {
    fn lookup(&mut self, _req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: fuser::ReplyEntry) {
        match self.lookup(parent as u32, name.as_encoded_bytes()) {
            Ok((_ino, attr)) => reply.entry(&Self::ttl(), &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &fuser::Request<'_>, ino: u64, _fh: Option<u64>, reply: fuser::ReplyAttr) {
        match self.getattr(ino as u32) {
            Ok(attr) => reply.attr(&Self::ttl(), &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        match self.setattr(ino as u32, mode, uid, gid, size) {
            Ok(attr) => reply.attr(&Self::ttl(), &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        match self.readlink(ino as u32) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        match self.mkdir(parent as u32, name.as_encoded_bytes(), mode, req.uid(), req.gid()) {
            Ok((_ino, attr)) => reply.entry(&Self::ttl(), &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        match self.create(parent as u32, name.as_encoded_bytes(), mode, req.uid(), req.gid()) {
            Ok((ino, attr)) => reply.created(&Self::ttl(), &attr, 0, ino as u64, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        link_name: &std::ffi::OsStr,
        target: &std::path::Path,
        reply: fuser::ReplyEntry,
    ) {
        match self.symlink(
            parent as u32,
            link_name.as_encoded_bytes(),
            target.as_os_str().as_encoded_bytes(),
            req.uid(),
            req.gid(),
        ) {
            Ok((_ino, attr)) => reply.entry(&Self::ttl(), &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: fuser::ReplyEmpty) {
        match self.unlink(parent as u32, name.as_encoded_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &fuser::Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: fuser::ReplyEmpty) {
        match self.rmdir(parent as u32, name.as_encoded_bytes()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        match self.rename(
            parent as u32,
            name.as_encoded_bytes(),
            newparent as u32,
            newname.as_encoded_bytes(),
        ) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        match self.read(ino as u32, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        match self.write(ino as u32, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &fuser::Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: fuser::ReplyEmpty) {
        match self.flush(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &fuser::Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: fuser::ReplyEmpty) {
        match self.flush(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        match self.release(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        match self.getattr(ino as u32) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let entries = match self.readdir(ino as u32) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.errno()),
        };
        for (i, (entry_ino, name, kind)) in entries.into_iter().enumerate().skip(offset as usize) {
            let full = reply.add(
                entry_ino as u64,
                (i + 1) as i64,
                kind,
                std::ffi::OsStr::from_bytes(&name),
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &fuser::Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: fuser::ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &fuser::Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: fuser::ReplyEmpty) {
        match self.flush(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let s = match self.statfs() {
            Ok(s) => s,
            Err(e) => return reply.error(e.errno()),
        };
        let blocks = s.total_bytes / s.block_size as u64;
        let bfree = s.free_bytes / s.block_size as u64;
        reply.statfs(blocks, bfree, bfree, 0, 0, s.block_size, 255, s.block_size);
    }

    fn ioctl(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: u32,
        cmd: u32,
        _in_data: &[u8],
        _out_size: u32,
        reply: fuser::ReplyIoctl,
    ) {
        if cmd != IOCTL_SNAPSHOT {
            log::warn!("ioctl: unsupported command {cmd:#x} on inode {ino}");
            return reply.error(FsError::Unsupported.errno());
        }
        match self.snapshot() {
            Ok(generation) => reply.ioctl(0, &generation.to_le_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }
}

impl Zdbfs {
    fn ttl() -> std::time::Duration {
        std::time::Duration::from_secs(crate::config::KERNEL_CACHE_TIME_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::{NamespaceAddr, Options};

    fn test_fs(cachesize: usize) -> Zdbfs {
        let addr = NamespaceAddr {
            host: "localhost".into(),
            port: 0,
            unix: None,
            namespace: None,
            password: None,
        };
        let opts = Options {
            meta: addr.clone(),
            data: addr.clone(),
            temp: addr,
            size: 1 << 30,
            nocache: false,
            autons: false,
            background: false,
            logfile: None,
            cachesize,
            mountpoint: "/mnt".into(),
        };
        Zdbfs::new(
            opts,
            Box::new(MemoryBackend::new()),
            Box::new(MemoryBackend::new()),
            Box::new(MemoryBackend::new()),
        )
        .unwrap()
    }

    #[test]
    fn root_exists_and_is_a_directory() {
        let mut fs = test_fs(32);
        let attr = fs.getattr(ROOT_INO).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
    }

    #[test]
    fn first_created_inode_never_collides_with_root() {
        let mut fs = test_fs(32);
        let (ino, _) = fs.create(ROOT_INO, b"a.txt", 0o644, 0, 0).unwrap();
        assert_ne!(ino, ROOT_INO);
        assert!(fs.getattr(ROOT_INO).unwrap().kind == FileType::Directory);
    }

    #[test]
    fn readdir_synthesises_dot_and_dotdot() {
        let mut fs = test_fs(32);
        let (sub, _) = fs.mkdir(ROOT_INO, b"sub", 0o755, 0, 0).unwrap();
        let entries = fs.readdir(sub).unwrap();
        assert!(entries.iter().any(|(ino, name, _)| *ino == sub && name == b"."));
        assert!(entries
            .iter()
            .any(|(ino, name, _)| *ino == ROOT_INO && name == b".."));
    }

    #[test]
    fn statfs_free_bytes_tracks_file_size() {
        let mut fs = test_fs(32);
        let before = fs.statfs().unwrap().free_bytes;
        let (ino, _) = fs.create(ROOT_INO, b"f", 0o644, 0, 0).unwrap();
        fs.write(ino, 0, &[0u8; 4096]).unwrap();
        fs.flush(ino).unwrap();
        let after = fs.statfs().unwrap().free_bytes;
        assert_eq!(before - after, 4096);
    }

    #[test]
    fn create_then_lookup_then_unlink() {
        let mut fs = test_fs(32);
        let (ino, _) = fs.create(ROOT_INO, b"a.txt", 0o644, 0, 0).unwrap();
        let (looked_up, _) = fs.lookup(ROOT_INO, b"a.txt").unwrap();
        assert_eq!(looked_up, ino);
        fs.unlink(ROOT_INO, b"a.txt").unwrap();
        assert!(matches!(
            fs.lookup(ROOT_INO, b"a.txt"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn write_then_read_round_trips_across_block_boundary() {
        let mut fs = test_fs(32);
        let (ino, _) = fs.create(ROOT_INO, b"big.bin", 0o644, 0, 0).unwrap();
        let payload: Vec<u8> = (0..(BLOCK_SIZE + 1024)).map(|i| (i % 251) as u8).collect();
        fs.write(ino, 0, &payload).unwrap();
        fs.flush(ino).unwrap();
        let read_back = fs.read(ino, 0, payload.len() as u32).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn partial_write_leaves_rest_of_block_zeroed() {
        let mut fs = test_fs(32);
        let (ino, _) = fs.create(ROOT_INO, b"sparse.bin", 0o644, 0, 0).unwrap();
        fs.write(ino, 10, b"hello").unwrap();
        let data = fs.read(ino, 0, 20).unwrap();
        assert_eq!(&data[10..15], b"hello");
        assert_eq!(&data[0..10], &[0u8; 10]);
    }

    #[test]
    fn mkdir_then_readdir_lists_entry() {
        let mut fs = test_fs(32);
        fs.mkdir(ROOT_INO, b"sub", 0o755, 0, 0).unwrap();
        let entries = fs.readdir(ROOT_INO).unwrap();
        assert!(entries.iter().any(|(_, name, _)| name == b"sub"));
    }

    #[test]
    fn rmdir_on_nonempty_directory_fails() {
        let mut fs = test_fs(32);
        let (sub, _) = fs.mkdir(ROOT_INO, b"sub", 0o755, 0, 0).unwrap();
        fs.create(sub, b"f", 0o644, 0, 0).unwrap();
        assert!(matches!(
            fs.rmdir(ROOT_INO, b"sub"),
            Err(FsError::NotEmpty)
        ));
    }

    #[test]
    fn rename_of_a_directory_updates_its_dotdot() {
        let mut fs = test_fs(32);
        let (a, _) = fs.mkdir(ROOT_INO, b"a", 0o755, 0, 0).unwrap();
        let (b, _) = fs.mkdir(ROOT_INO, b"b", 0o755, 0, 0).unwrap();
        fs.rename(ROOT_INO, b"a", b, b"a").unwrap();
        let entries = fs.readdir(a).unwrap();
        assert!(entries.iter().any(|(ino, name, _)| *ino == b && name == b".."));
    }

    #[test]
    fn rename_moves_entry_between_directories() {
        let mut fs = test_fs(32);
        let (sub, _) = fs.mkdir(ROOT_INO, b"sub", 0o755, 0, 0).unwrap();
        fs.create(ROOT_INO, b"f", 0o644, 0, 0).unwrap();
        fs.rename(ROOT_INO, b"f", sub, b"f2").unwrap();
        assert!(matches!(
            fs.lookup(ROOT_INO, b"f"),
            Err(FsError::NotFound)
        ));
        assert!(fs.lookup(sub, b"f2").is_ok());
    }

    #[test]
    fn symlink_read_back_via_readlink() {
        let mut fs = test_fs(32);
        let (ino, _) = fs.symlink(ROOT_INO, b"link", b"/target", 0, 0).unwrap();
        assert_eq!(fs.readlink(ino).unwrap(), b"/target");
    }

    #[test]
    fn snapshot_bumps_generation_and_commits_dirty_blocks() {
        let mut fs = test_fs(32);
        let (ino, _) = fs.create(ROOT_INO, b"f", 0o644, 0, 0).unwrap();
        fs.write(ino, 0, b"data").unwrap();
        let gen1 = fs.snapshot().unwrap();
        let gen2 = fs.snapshot().unwrap();
        assert_eq!(gen2, gen1 + 1);
    }

    #[test]
    fn admission_evicts_when_over_budget() {
        let mut fs = test_fs(1);
        let (a, _) = fs.create(ROOT_INO, b"a", 0o644, 0, 0).unwrap();
        let (b, _) = fs.create(ROOT_INO, b"b", 0o644, 0, 0).unwrap();
        fs.write(a, 0, b"x").unwrap();
        fs.flush(a).unwrap();
        fs.write(b, 0, b"y").unwrap();
        fs.flush(b).unwrap();
        assert!(fs.stats().cache_full > 0);
        assert_eq!(fs.read(a, 0, 1).unwrap(), b"x");
        assert_eq!(fs.read(b, 0, 1).unwrap(), b"y");
    }
}
