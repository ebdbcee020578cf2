//! `fuser::Filesystem` implementation.
//!
//! Pure protocol translation: every callback resolves the kernel inode
//! number, calls the operation layer (re-entering the tokio runtime via
//! `block_on`), and replies with either the result or the errno mapped
//! from the error kind.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cirrus_core::domain::{CoreError, Inode, ItemId};
use cirrus_fs::Filesystem as CoreFs;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::debug;

use crate::ino::{InoMap, ROOT_INO};

/// TTL for kernel attribute caching. Short, so remote changes surface
/// quickly.
const TTL: Duration = Duration::from_secs(1);

/// Block size reported by statfs.
const BLOCK_SIZE: u32 = 4096;

/// The FUSE adapter.
pub struct CirrusFuse {
    fs: Arc<CoreFs>,
    rt: Handle,
    inos: InoMap,
}

impl CirrusFuse {
    /// Binds the adapter to a core and a runtime handle.
    pub fn new(fs: Arc<CoreFs>, rt: Handle) -> Self {
        let inos = InoMap::new(fs.root_id());
        Self { fs, rt, inos }
    }

    fn attr_for(&self, record: &Inode) -> FileAttr {
        let kind = if record.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let to_system = |dt: chrono::DateTime<chrono::Utc>| {
            UNIX_EPOCH
                .checked_add(Duration::new(
                    dt.timestamp().max(0) as u64,
                    dt.timestamp_subsec_nanos(),
                ))
                .unwrap_or(UNIX_EPOCH)
        };
        let mtime = to_system(record.modified);
        let crtime = to_system(record.created);
        FileAttr {
            ino: self.inos.assign(&record.id),
            size: record.size,
            blocks: record.size.div_ceil(BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime,
            kind,
            perm: record.mode as u16,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn resolve(&self, ino: u64) -> Result<ItemId, i32> {
        self.inos.resolve(ino).ok_or(libc::ENOENT)
    }
}

fn name_str(name: &OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(libc::EINVAL)
}

fn errno(error: &CoreError) -> i32 {
    error.errno()
}

impl Filesystem for CirrusFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let parent_id = match self.resolve(parent) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        match self.rt.block_on(self.fs.lookup(&parent_id, name)) {
            Ok(record) => reply.entry(&TTL, &self.attr_for(&record), 0),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        // the kernel evicted this inode from its cache; drop the mapping
        // so the table does not grow for the life of the mount
        if ino != ROOT_INO {
            self.inos.forget(ino);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let id = match self.resolve(ino) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        match self.fs.getattr(&id) {
            Ok(record) => reply.attr(&TTL, &self.attr_for(&record)),
            Err(error) => reply.error(errno(&error)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
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
        let id = match self.resolve(ino) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        if let Some(size) = size {
            if let Err(error) = self.rt.block_on(self.fs.truncate(&id, size)) {
                return reply.error(errno(&error));
            }
        }
        match self.fs.getattr(&id) {
            Ok(record) => reply.attr(&TTL, &self.attr_for(&record)),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let id = match self.resolve(ino) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        let children = match self.rt.block_on(self.fs.readdir(&id)) {
            Ok(children) => children,
            Err(error) => return reply.error(errno(&error)),
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (if ino == ROOT_INO { ino } else { ROOT_INO }, FileType::Directory, "..".to_string()),
        ];
        for child in &children {
            let kind = if child.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((self.inos.assign(&child.id), kind, child.name.clone()));
        }

        for (index, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            if reply.add(entry_ino, (index + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let id = match self.resolve(ino) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        let write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let truncate = (flags & libc::O_TRUNC) != 0;
        match self.rt.block_on(self.fs.open(&id, write, truncate)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!(ino, fh, offset, size, "read");
        match self.fs.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!(ino, fh, offset, len = data.len(), "write");
        match self
            .rt
            .block_on(self.fs.write(fh, offset.max(0) as u64, data))
        {
            Ok(written) => reply.written(written),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.rt.block_on(self.fs.flush(fh)) {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(errno(&error)),
        }
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
        match self.rt.block_on(self.fs.release(fh)) {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.rt.block_on(self.fs.fsync(fh)) {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let parent_id = match self.resolve(parent) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        match self.rt.block_on(self.fs.create(&parent_id, name, mode)) {
            Ok((record, fh)) => reply.created(&TTL, &self.attr_for(&record), 0, fh, 0),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let parent_id = match self.resolve(parent) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        match self.rt.block_on(self.fs.mkdir(&parent_id, name)) {
            Ok(record) => reply.entry(&TTL, &self.attr_for(&record), 0),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let parent_id = match self.resolve(parent) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        match self.rt.block_on(self.fs.unlink(&parent_id, name)) {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        // folders share the unlink path; emptiness is enforced below it
        let name = match name_str(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let parent_id = match self.resolve(parent) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        match self.rt.block_on(self.fs.unlink(&parent_id, name)) {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (name_str(name), name_str(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };
        let (old_parent, new_parent) = match (self.resolve(parent), self.resolve(newparent)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::ENOENT),
        };
        match self
            .rt
            .block_on(self.fs.rename(&old_parent, name, &new_parent, newname))
        {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let id = match self.resolve(ino) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        let value = match self.fs.getxattr(&id, name) {
            Ok(value) => value,
            Err(error) => return reply.error(errno(&error)),
        };
        if size == 0 {
            reply.size(value.len() as u32);
        } else if (value.len() as u32) <= size {
            reply.data(&value);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name_str(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let id = match self.resolve(ino) {
            Ok(id) => id,
            Err(code) => return reply.error(code),
        };
        match self.rt.block_on(self.fs.setxattr(&id, name, value)) {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(errno(&error)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        let mut data = Vec::new();
        for name in self.fs.listxattr() {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        if size == 0 {
            reply.size(data.len() as u32);
        } else if (data.len() as u32) <= size {
            reply.data(&data);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let total_bytes = self.fs.config().cache_max_bytes;
        let used_bytes = self
            .rt
            .block_on(self.fs.inspect())
            .map(|report| report.cache_used_bytes)
            .unwrap_or(0);
        let total_blocks = total_bytes / BLOCK_SIZE as u64;
        let free_blocks = total_bytes.saturating_sub(used_bytes) / BLOCK_SIZE as u64;
        reply.statfs(
            total_blocks,
            free_blocks,
            free_blocks,
            0,
            0,
            BLOCK_SIZE,
            255,
            BLOCK_SIZE,
        );
    }
}
