//! Hierarchical directories: an inode whose data is an array of
//! fixed-size entries, plus pathname resolution over the parent
//! back-links.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::error::{FsError, FsResult};
use super::inode::Inode;
use super::{Filesys, ROOT_DIR_SECTOR};
use crate::devices::block::SectorId;

/// Maximum length of one file-name component.
pub const NAME_MAX: usize = 14;

/// On-disk entry: sector (4), NUL-padded name (15), in-use flag (1).
pub(crate) const DIR_ENTRY_SIZE: usize = 20;

struct DirEntry {
    sector: SectorId,
    name: String,
    in_use: bool,
}

fn encode_entry(entry: &DirEntry) -> [u8; DIR_ENTRY_SIZE] {
    let mut buf = [0u8; DIR_ENTRY_SIZE];
    buf[0..4].copy_from_slice(&entry.sector.to_le_bytes());
    let name = entry.name.as_bytes();
    buf[4..4 + name.len().min(NAME_MAX)].copy_from_slice(&name[..name.len().min(NAME_MAX)]);
    buf[19] = entry.in_use as u8;
    buf
}

fn decode_entry(buf: &[u8; DIR_ENTRY_SIZE]) -> DirEntry {
    let sector = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let name_len = buf[4..19].iter().position(|&b| b == 0).unwrap_or(NAME_MAX + 1);
    DirEntry {
        sector,
        name: String::from_utf8_lossy(&buf[4..4 + name_len]).into_owned(),
        in_use: buf[19] != 0,
    }
}

/// An open directory: its inode plus a cursor for readdir.
pub struct Dir {
    pub(crate) inode: Arc<Inode>,
    pos: u32,
}

impl Dir {
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn sector(&self) -> SectorId {
        self.inode.sector()
    }
}

impl Filesys {
    /// Create a directory inode with room for `entry_cnt` entries.
    pub fn dir_create(&self, sector: SectorId, entry_cnt: usize) -> FsResult<()> {
        self.inode_create(sector, (entry_cnt * DIR_ENTRY_SIZE) as u32, false)
    }

    /// Wrap an inode in a directory handle, taking ownership of the
    /// reference.
    pub fn dir_open(&self, inode: Arc<Inode>) -> Dir {
        Dir { inode, pos: 0 }
    }

    pub fn dir_open_root(&self) -> FsResult<Dir> {
        Ok(self.dir_open(self.inode_open(ROOT_DIR_SECTOR)?))
    }

    pub fn dir_reopen(&self, dir: &Dir) -> Dir {
        self.dir_open(self.inode_reopen(&dir.inode))
    }

    pub fn dir_close(&self, dir: Dir) {
        self.inode_close(&dir.inode);
    }

    /// Scan for `name`; returns the entry and its byte offset.
    fn lookup_entry(&self, dir: &Dir, name: &str) -> Option<(DirEntry, u32)> {
        let mut ofs = 0u32;
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        while self.inode_read_at(&dir.inode, &mut buf, ofs) == DIR_ENTRY_SIZE {
            let entry = decode_entry(&buf);
            if entry.in_use && entry.name == name {
                return Some((entry, ofs));
            }
            ofs += DIR_ENTRY_SIZE as u32;
        }
        None
    }

    /// Open the inode that `name` refers to inside `dir`.
    pub fn dir_lookup(&self, dir: &Dir, name: &str) -> FsResult<Arc<Inode>> {
        match self.lookup_entry(dir, name) {
            Some((entry, _)) => self.inode_open(entry.sector),
            None => Err(FsError::NotFound),
        }
    }

    /// Add an entry binding `name` to the inode at `sector`. Also
    /// records `dir` as the child's parent.
    pub fn dir_add(&self, dir: &Dir, name: &str, sector: SectorId) -> FsResult<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::InvalidName);
        }
        if self.lookup_entry(dir, name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        self.inode_set_parent(dir.inode.sector(), sector)?;

        // First free slot, or append at end of file.
        let mut ofs = 0u32;
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        while self.inode_read_at(&dir.inode, &mut buf, ofs) == DIR_ENTRY_SIZE {
            if !decode_entry(&buf).in_use {
                break;
            }
            ofs += DIR_ENTRY_SIZE as u32;
        }

        let entry = DirEntry {
            sector,
            name: name.to_string(),
            in_use: true,
        };
        if self.inode_write_at(&dir.inode, &encode_entry(&entry), ofs) != DIR_ENTRY_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Remove `name` from `dir` and mark its inode for deletion. A
    /// directory must be empty and not open elsewhere.
    pub fn dir_remove(&self, dir: &Dir, name: &str) -> FsResult<()> {
        let (mut entry, ofs) = self.lookup_entry(dir, name).ok_or(FsError::NotFound)?;
        let inode = self.inode_open(entry.sector)?;

        if !inode.is_file() {
            if !self.dir_is_empty(&inode) {
                self.inode_close(&inode);
                return Err(FsError::NotEmpty);
            }
            if inode.open_cnt() > 1 {
                self.inode_close(&inode);
                return Err(FsError::InUse);
            }
        }

        entry.in_use = false;
        if self.inode_write_at(&dir.inode, &encode_entry(&entry), ofs) != DIR_ENTRY_SIZE {
            self.inode_close(&inode);
            return Err(FsError::NoSpace);
        }
        self.inode_remove(&inode);
        self.inode_close(&inode);
        Ok(())
    }

    /// Next in-use entry name after the directory's cursor.
    pub fn dir_readdir(&self, dir: &mut Dir) -> Option<String> {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        while self.inode_read_at(&dir.inode, &mut buf, dir.pos) == DIR_ENTRY_SIZE {
            dir.pos += DIR_ENTRY_SIZE as u32;
            let entry = decode_entry(&buf);
            if entry.in_use {
                return Some(entry.name);
            }
        }
        None
    }

    pub fn dir_is_empty(&self, inode: &Arc<Inode>) -> bool {
        let mut ofs = 0u32;
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        while self.inode_read_at(inode, &mut buf, ofs) == DIR_ENTRY_SIZE {
            if decode_entry(&buf).in_use {
                return false;
            }
            ofs += DIR_ENTRY_SIZE as u32;
        }
        true
    }

    pub fn dir_is_root(&self, dir: &Dir) -> bool {
        dir.inode.sector() == ROOT_DIR_SECTOR
    }

    /// Follow the parent back-link.
    pub fn dir_get_parent(&self, dir: &Dir) -> FsResult<Arc<Inode>> {
        self.inode_open(dir.inode.parent_sector())
    }

    /// Resolve `path` to the directory that contains its final
    /// component. Starts at root for absolute paths or when the
    /// process has no working directory.
    pub fn dir_from_path(&self, cwd: Option<&Dir>, path: &str) -> FsResult<Dir> {
        let mut dir = match cwd {
            Some(cwd) if !path.starts_with('/') => self.dir_reopen(cwd),
            _ => self.dir_open_root()?,
        };
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.len() < 2 {
            return Ok(dir);
        }
        for &comp in &components[..components.len() - 1] {
            if comp == "." {
                continue;
            }
            if comp == ".." {
                match self.dir_get_parent(&dir) {
                    Ok(parent) => {
                        self.dir_close(dir);
                        dir = self.dir_open(parent);
                    }
                    Err(e) => {
                        self.dir_close(dir);
                        return Err(e);
                    }
                }
                continue;
            }
            match self.dir_lookup(&dir, comp) {
                Ok(inode) => {
                    if inode.is_file() {
                        self.inode_close(&inode);
                        self.dir_close(dir);
                        return Err(FsError::NotADirectory);
                    }
                    self.dir_close(dir);
                    dir = self.dir_open(inode);
                }
                Err(e) => {
                    self.dir_close(dir);
                    return Err(e);
                }
            }
        }
        Ok(dir)
    }

    /// The final component of `path` ("" for the root itself).
    pub fn last_component(path: &str) -> String {
        path.split('/')
            .filter(|c| !c.is_empty())
            .last()
            .unwrap_or("")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::block::MemDisk;

    fn fresh_fs() -> Filesys {
        Filesys::format(Arc::new(MemDisk::new(512))).unwrap()
    }

    fn new_file_sector(fs: &Filesys) -> SectorId {
        let sector = fs.free_map.lock().allocate(1).unwrap();
        fs.inode_create(sector, 0, true).unwrap();
        sector
    }

    #[test]
    fn add_lookup_remove_closure() {
        // Add then lookup finds the sector; remove then lookup
        // fails.
        let fs = fresh_fs();
        let root = fs.dir_open_root().unwrap();
        let sector = new_file_sector(&fs);

        fs.dir_add(&root, "hello", sector).unwrap();
        let inode = fs.dir_lookup(&root, "hello").unwrap();
        assert_eq!(inode.sector(), sector);
        fs.inode_close(&inode);

        fs.dir_remove(&root, "hello").unwrap();
        assert!(matches!(
            fs.dir_lookup(&root, "hello"),
            Err(FsError::NotFound)
        ));
        fs.dir_close(root);
    }

    #[test]
    fn duplicate_and_invalid_names_are_refused() {
        let fs = fresh_fs();
        let root = fs.dir_open_root().unwrap();
        let sector = new_file_sector(&fs);
        fs.dir_add(&root, "x", sector).unwrap();
        assert_eq!(
            fs.dir_add(&root, "x", sector).unwrap_err(),
            FsError::AlreadyExists
        );
        assert_eq!(fs.dir_add(&root, "", sector).unwrap_err(), FsError::InvalidName);
        assert_eq!(
            fs.dir_add(&root, "waytoolongfilename", sector).unwrap_err(),
            FsError::InvalidName
        );
        fs.dir_close(root);
    }

    #[test]
    fn removed_slot_is_reused() {
        let fs = fresh_fs();
        let root = fs.dir_open_root().unwrap();
        let a = new_file_sector(&fs);
        let b = new_file_sector(&fs);
        fs.dir_add(&root, "a", a).unwrap();
        let len_after_a = root.inode.length();
        fs.dir_remove(&root, "a").unwrap();
        fs.dir_add(&root, "b", b).unwrap();
        assert_eq!(root.inode.length(), len_after_a);
        fs.dir_close(root);
    }

    #[test]
    fn readdir_enumerates_each_entry_once() {
        // Exactly {a, b, c}, each once.
        let fs = fresh_fs();
        let mut root = fs.dir_open_root().unwrap();
        for name in ["a", "b", "c"] {
            let sector = new_file_sector(&fs);
            fs.dir_add(&root, name, sector).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(name) = fs.dir_readdir(&mut root) {
            seen.push(name);
        }
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);
        fs.dir_close(root);
    }

    #[test]
    fn path_walk_descends_and_climbs() {
        let fs = fresh_fs();
        fs.create(None, "/a", 0, false).unwrap();
        fs.create(None, "/a/b", 0, false).unwrap();
        fs.create(None, "/a/b/f", 0, true).unwrap();

        // The containing directory of /a/b/f is b.
        let dir = fs.dir_from_path(None, "/a/b/f").unwrap();
        let inode = fs.dir_lookup(&dir, "f").unwrap();
        assert!(inode.is_file());
        fs.inode_close(&inode);
        fs.dir_close(dir);

        // "." is a no-op, ".." climbs.
        let dir = fs.dir_from_path(None, "/a/./b/../b/f").unwrap();
        assert!(fs.dir_lookup(&dir, "f").is_ok_and(|i| {
            fs.inode_close(&i);
            true
        }));
        fs.dir_close(dir);
    }

    #[test]
    fn file_component_in_the_middle_fails() {
        let fs = fresh_fs();
        fs.create(None, "/f", 0, true).unwrap();
        assert!(matches!(
            fs.dir_from_path(None, "/f/x"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn last_component_extraction() {
        assert_eq!(Filesys::last_component("/a/b/c"), "c");
        assert_eq!(Filesys::last_component("c"), "c");
        assert_eq!(Filesys::last_component("/a/b/"), "b");
        assert_eq!(Filesys::last_component("/"), "");
    }
}
