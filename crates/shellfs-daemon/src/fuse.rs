//! FUSE transport adapter: maps kernel callbacks onto the engine.
//!
//! The adapter owns an inode↔path table and a handle to the async runtime;
//! every callback resolves its inode to a path and drives the corresponding
//! engine future to completion. All semantics live in the engine — this
//! module only translates.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error};

use crate::error::FsError;
use crate::nodes::{DirEntry, Engine, NodeAttr, NodeKind};

const ROOT_INO: u64 = 1;
const BLOCK_SIZE: u32 = 512;

struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, String::new());
        by_path.insert(String::new(), ROOT_INO);
        Self {
            by_ino,
            by_path,
            next: ROOT_INO + 1,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    fn ino_of(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }
}

/// `fuser::Filesystem` implementation over an [`Engine`].
pub struct ShellFuse {
    engine: Arc<Engine>,
    rt: tokio::runtime::Handle,
    inodes: InodeTable,
    uid: u32,
    gid: u32,
}

impl ShellFuse {
    pub fn new(engine: Arc<Engine>, rt: tokio::runtime::Handle) -> Self {
        let (uid, gid) = current_ids();
        Self {
            engine,
            rt,
            inodes: InodeTable::new(),
            uid,
            gid,
        }
    }

    fn file_attr(&self, ino: u64, attr: &NodeAttr) -> FileAttr {
        let kind = match attr.kind {
            NodeKind::Dir => FileType::Directory,
            NodeKind::File => FileType::RegularFile,
            NodeKind::Symlink => FileType::Symlink,
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind,
            perm: attr.perm,
            nlink: if attr.kind == NodeKind::Dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn open_flags(handle_direct_io: bool, keep_cache: bool) -> u32 {
        let mut flags = 0;
        if handle_direct_io {
            flags |= fuser::consts::FOPEN_DIRECT_IO;
        }
        if keep_cache {
            flags |= fuser::consts::FOPEN_KEEP_CACHE;
        }
        flags
    }
}

/// Owner of the mount, read without privileges from the process's own
/// metadata.
fn current_ids() -> (u32, u32) {
    std::fs::metadata("/proc/self")
        .map(|meta| (meta.uid(), meta.gid()))
        .unwrap_or((0, 0))
}

fn errno(err: &FsError) -> i32 {
    match err {
        FsError::NotFound => {}
        other => debug!(error = %other, "filesystem operation failed"),
    }
    err.errno()
}

impl Filesystem for ShellFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .rt
            .block_on(self.engine.lookup(&parent_path, name))
        {
            Ok(attr) => {
                let path = Engine::join(&parent_path, name);
                let ino = self.inodes.ino_of(&path);
                reply.entry(&attr.ttl, &self.file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.rt.block_on(self.engine.getattr(&path)) {
            Ok(attr) => reply.attr(&attr.ttl, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.rt.block_on(self.engine.readlink(&path)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let writing = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let result = if writing {
            self.rt.block_on(self.engine.open_write(&path))
        } else {
            self.rt.block_on(self.engine.open_read(&path))
        };
        match result {
            Ok(handle) => reply.opened(
                handle.fh,
                Self::open_flags(handle.direct_io, handle.keep_cache),
            ),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.engine.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.rt.block_on(self.engine.write(fh, data)) {
            Ok(written) => reply.written(written),
            Err(e) => {
                error!(error = %e, "write failed");
                reply.error(e.errno());
            }
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.engine.release(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.rt.block_on(self.engine.readdir(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        let parent_ino = if path.is_empty() {
            ROOT_INO
        } else {
            let parent_path = path
                .rsplit_once('/')
                .map_or("", |(parent, _)| parent)
                .to_string();
            self.inodes.ino_of(&parent_path)
        };

        let mut listing: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for DirEntry { name, kind } in entries {
            let child_ino = self.inodes.ino_of(&Engine::join(&path, &name));
            let file_type = match kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
                NodeKind::Symlink => FileType::Symlink,
            };
            listing.push((child_ino, file_type, name));
        }

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        for (index, (child_ino, file_type, name)) in
            listing.into_iter().enumerate().skip(start)
        {
            if reply.add(child_ino, (index + 1) as i64, file_type, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Truncation of the write sinks and `touch` timestamp updates are
        // accepted as no-ops; the current attributes are returned.
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.rt.block_on(self.engine.getattr(&path)) {
            Ok(attr) => reply.attr(&attr.ttl, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self
            .rt
            .block_on(self.engine.create(&parent_path, name))
        {
            Ok((handle, attr)) => {
                let ino = self.inodes.ino_of(&Engine::join(&parent_path, name));
                reply.created(
                    &attr.ttl,
                    &self.file_attr(ino, &attr),
                    0,
                    handle.fh,
                    Self::open_flags(handle.direct_io, handle.keep_cache),
                );
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .rt
            .block_on(self.engine.unlink(&parent_path, name))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }
}
