pub mod cache;
pub mod directory;
pub mod error;
pub mod file;
pub mod free_map;
pub mod inode;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use crate::devices::block::{BlockDevice, SectorId};
use cache::BlockCache;
pub use directory::{Dir, NAME_MAX};
pub use error::{FsError, FsResult};
pub use file::File;
use free_map::FreeMap;
pub use inode::Inode;

/// Sector of the free-map file's inode.
pub const FREE_MAP_SECTOR: SectorId = 0;
/// Sector of the root directory's inode.
pub const ROOT_DIR_SECTOR: SectorId = 1;

/// Initial root-directory capacity; it grows on demand.
const ROOT_DIR_ENTRIES: usize = 16;

/// Result of a namespace open: files and directories both live in the
/// fd table.
pub enum FsNode {
    File(File),
    Dir(Dir),
}

/// One mounted filesystem volume: the device, its write-back cache,
/// free-sector accounting, and the open-inode registry.
pub struct Filesys {
    device: Arc<dyn BlockDevice>,
    pub(crate) cache: BlockCache,
    pub(crate) free_map: Mutex<FreeMap>,
    pub(crate) open_inodes: Mutex<Vec<Arc<Inode>>>,
}

impl Filesys {
    fn with_device(device: Arc<dyn BlockDevice>) -> Self {
        let sectors = device.sector_count() as usize;
        Filesys {
            cache: BlockCache::new(device.clone()),
            device,
            free_map: Mutex::new(FreeMap::new(sectors)),
            open_inodes: Mutex::new(Vec::new()),
        }
    }

    /// Create a fresh filesystem on `device`: reserve the well-known
    /// sectors, build the free-map file and the root directory, and
    /// persist the free map.
    pub fn format(device: Arc<dyn BlockDevice>) -> FsResult<Filesys> {
        let fs = Self::with_device(device);
        let map_bytes = {
            let mut free_map = fs.free_map.lock();
            free_map.mark(FREE_MAP_SECTOR);
            free_map.mark(ROOT_DIR_SECTOR);
            free_map.byte_size() as u32
        };
        fs.inode_create(FREE_MAP_SECTOR, map_bytes, true)?;
        fs.dir_create(ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES)?;
        fs.store_free_map()?;
        log::info!("filesystem formatted: {} sectors", fs.device.sector_count());
        Ok(fs)
    }

    /// Mount an already-formatted device, reloading the free map.
    pub fn mount(device: Arc<dyn BlockDevice>) -> FsResult<Filesys> {
        let fs = Self::with_device(device);
        let inode = fs.inode_open(FREE_MAP_SECTOR)?;
        let mut bytes = alloc::vec![0u8; inode.length() as usize];
        fs.inode_read_at(&inode, &mut bytes, 0);
        fs.inode_close(&inode);
        fs.free_map.lock().load_bytes(&bytes);
        Ok(fs)
    }

    fn store_free_map(&self) -> FsResult<()> {
        let bytes = self.free_map.lock().to_bytes();
        let inode = self.inode_open(FREE_MAP_SECTOR)?;
        self.inode_write_at(&inode, &bytes, 0);
        self.inode_close(&inode);
        Ok(())
    }

    /// Create a file (or directory) at `path` with `initial_size`
    /// zeroed bytes.
    pub fn create(
        &self,
        cwd: Option<&Dir>,
        path: &str,
        initial_size: u32,
        is_file: bool,
    ) -> FsResult<()> {
        let dir = self.dir_from_path(cwd, path)?;
        let name = Self::last_component(path);
        if name.is_empty() || name == "." || name == ".." {
            self.dir_close(dir);
            return Err(FsError::InvalidName);
        }
        let sector = match self.free_map.lock().allocate(1) {
            Some(sector) => sector,
            None => {
                self.dir_close(dir);
                return Err(FsError::NoSpace);
            }
        };
        let result = self
            .inode_create(sector, initial_size, is_file)
            .and_then(|()| self.dir_add(&dir, &name, sector));
        if result.is_err() {
            self.free_map.lock().release(sector, 1);
        }
        self.dir_close(dir);
        result
    }

    /// Create a directory at `path`.
    pub fn mkdir(&self, cwd: Option<&Dir>, path: &str) -> FsResult<()> {
        self.create(cwd, path, 0, false)
    }

    /// Open `path`, yielding a file or a directory handle. "." and a
    /// bare "/" open the resolved directory itself; ".." follows the
    /// parent link.
    pub fn open(&self, cwd: Option<&Dir>, path: &str) -> FsResult<FsNode> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let dir = self.dir_from_path(cwd, path)?;
        let name = Self::last_component(path);
        let inode = if name == ".." {
            match self.dir_get_parent(&dir) {
                Ok(inode) => inode,
                Err(e) => {
                    self.dir_close(dir);
                    return Err(e);
                }
            }
        } else if name.is_empty() || name == "." {
            return Ok(FsNode::Dir(dir));
        } else {
            match self.dir_lookup(&dir, &name) {
                Ok(inode) => inode,
                Err(e) => {
                    self.dir_close(dir);
                    return Err(e);
                }
            }
        };
        self.dir_close(dir);
        if inode.is_file() {
            Ok(FsNode::File(self.file_open(inode)))
        } else {
            Ok(FsNode::Dir(self.dir_open(inode)))
        }
    }

    /// Open `path` as a file; directories are refused.
    pub fn open_file(&self, cwd: Option<&Dir>, path: &str) -> FsResult<File> {
        match self.open(cwd, path)? {
            FsNode::File(file) => Ok(file),
            FsNode::Dir(dir) => {
                self.dir_close(dir);
                Err(FsError::IsADirectory)
            }
        }
    }

    /// Remove the file or (empty, unused) directory at `path`.
    pub fn remove(&self, cwd: Option<&Dir>, path: &str) -> FsResult<()> {
        let dir = self.dir_from_path(cwd, path)?;
        let name = Self::last_component(path);
        let result = self.dir_remove(&dir, &name);
        self.dir_close(dir);
        result
    }

    /// Resolve `path` as a directory for use as a working directory.
    pub fn chdir(&self, cwd: Option<&Dir>, path: &str) -> FsResult<Dir> {
        match self.open(cwd, path)? {
            FsNode::Dir(dir) => Ok(dir),
            FsNode::File(file) => {
                self.close_file(&file);
                Err(FsError::NotADirectory)
            }
        }
    }

    pub fn close_node(&self, node: FsNode) {
        match node {
            FsNode::File(file) => self.close_file(&file),
            FsNode::Dir(dir) => self.dir_close(dir),
        }
    }

    /// Shut the filesystem down: persist the free map and write every
    /// dirty cache entry back to the device.
    pub fn done(&self) -> FsResult<()> {
        self.store_free_map()?;
        self.cache.flush();
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────
//  Kernel path: the global volume
// ──────────────────────────────────────────────────────────────

static FILESYS: Once<Filesys> = Once::new();

/// Mount (or format) the boot volume.
pub fn init(device: Arc<dyn BlockDevice>, format: bool) {
    FILESYS.call_once(|| {
        if format {
            Filesys::format(device).expect("formatting the boot volume failed")
        } else {
            Filesys::mount(device).expect("mounting the boot volume failed")
        }
    });
}

/// The global volume; panics before [`init`].
pub fn global() -> &'static Filesys {
    FILESYS.get().expect("filesystem not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::block::{MemDisk, SECTOR_SIZE};

    fn fresh_fs() -> Filesys {
        Filesys::format(Arc::new(MemDisk::new(512))).unwrap()
    }

    fn open_file(fs: &Filesys, path: &str) -> File {
        fs.open_file(None, path).unwrap()
    }

    #[test]
    fn grow_file_scenario() {
        // Create empty, write 6000 bytes, read back the tail.
        let fs = fresh_fs();
        fs.create(None, "G", 0, true).unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 199) as u8).collect();

        let mut f = open_file(&fs, "G");
        assert_eq!(fs.file_write(&mut f, &data), 6000);
        assert_eq!(fs.file_length(&f), 6000);

        let mut tail = alloc::vec![0u8; 500];
        assert_eq!(fs.file_read_at(&f, &mut tail, 5500), 500);
        assert_eq!(tail, data[5500..6000]);
        fs.close_file(&f);
    }

    #[test]
    fn remove_nonempty_directory_is_refused() {
        // mkdir /a; create /a/f; remove /a fails, /a/f then /a
        // succeed.
        let fs = fresh_fs();
        fs.mkdir(None, "/a").unwrap();
        fs.create(None, "/a/f", 0, true).unwrap();

        assert_eq!(fs.remove(None, "/a").unwrap_err(), FsError::NotEmpty);
        fs.remove(None, "/a/f").unwrap();
        fs.remove(None, "/a").unwrap();
        assert!(fs.open(None, "/a").is_err());
    }

    #[test]
    fn readdir_root_lists_all_entries() {
        // {a, b, c}, each exactly once, order unspecified.
        let fs = fresh_fs();
        fs.mkdir(None, "a").unwrap();
        fs.mkdir(None, "b").unwrap();
        fs.create(None, "c", 0, true).unwrap();

        let mut root = match fs.open(None, "/").unwrap() {
            FsNode::Dir(dir) => dir,
            FsNode::File(_) => panic!("root is a directory"),
        };
        let mut names = Vec::new();
        while let Some(name) = fs.dir_readdir(&mut root) {
            names.push(name);
        }
        fs.dir_close(root);
        names.sort();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn open_directory_as_fd_target() {
        let fs = fresh_fs();
        fs.mkdir(None, "/sub").unwrap();
        match fs.open(None, "/sub").unwrap() {
            FsNode::Dir(dir) => {
                assert!(!dir.inode().is_file());
                fs.dir_close(dir);
            }
            FsNode::File(_) => panic!("expected a directory"),
        }
        // "." resolves to the directory itself.
        let cwd = fs.chdir(None, "/sub").unwrap();
        match fs.open(Some(&cwd), ".").unwrap() {
            FsNode::Dir(dir) => fs.dir_close(dir),
            FsNode::File(_) => panic!("expected a directory"),
        }
        fs.dir_close(cwd);
    }

    #[test]
    fn relative_paths_follow_the_working_directory() {
        let fs = fresh_fs();
        fs.mkdir(None, "/home").unwrap();
        let home = fs.chdir(None, "/home").unwrap();
        fs.create(Some(&home), "notes", 0, true).unwrap();

        // Visible absolutely and relatively.
        let f = open_file(&fs, "/home/notes");
        fs.close_file(&f);
        let f = fs.open_file(Some(&home), "notes").unwrap();
        fs.close_file(&f);

        // ".." climbs back to root.
        let root = fs.chdir(Some(&home), "..").unwrap();
        assert!(fs.dir_is_root(&root));
        fs.dir_close(root);
        fs.dir_close(home);
    }

    #[test]
    fn chdir_into_file_fails() {
        let fs = fresh_fs();
        fs.create(None, "plain", 0, true).unwrap();
        assert!(matches!(
            fs.chdir(None, "plain"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn removing_missing_and_root_fails() {
        let fs = fresh_fs();
        assert_eq!(fs.remove(None, "ghost").unwrap_err(), FsError::NotFound);
        assert!(fs.remove(None, "/").is_err());
    }

    #[test]
    fn shutdown_flushes_dirty_sectors_to_device() {
        // After done(), the raw device holds every cached write.
        let disk = Arc::new(MemDisk::new(512));
        let fs = Filesys::format(disk.clone()).unwrap();
        fs.create(None, "persist", 0, true).unwrap();
        let mut f = open_file(&fs, "persist");
        let payload = alloc::vec![0x5Au8; 3 * SECTOR_SIZE];
        assert_eq!(fs.file_write(&mut f, &payload), payload.len());
        fs.close_file(&f);
        fs.done().unwrap();

        // Remount from the same device: data must be there without
        // any cache warm-up.
        let fs2 = Filesys::mount(disk).unwrap();
        let mut f = fs2.open_file(None, "persist").unwrap();
        let mut back = alloc::vec![0u8; payload.len()];
        assert_eq!(fs2.file_read(&mut f, &mut back), payload.len());
        assert_eq!(back, payload);
        fs2.close_file(&f);
    }

    #[test]
    fn free_map_survives_remount() {
        let disk = Arc::new(MemDisk::new(512));
        let used_before = {
            let fs = Filesys::format(disk.clone()).unwrap();
            fs.create(None, "f", 2000, true).unwrap();
            fs.done().unwrap();
            let used = fs.free_map.lock().used_sectors();
            used
        };
        let fs = Filesys::mount(disk).unwrap();
        assert_eq!(fs.free_map.lock().used_sectors(), used_before);
        // New allocations must not collide with existing data.
        fs.create(None, "g", 2000, true).unwrap();
        let mut f = fs.open_file(None, "f").unwrap();
        let mut buf = alloc::vec![0u8; 2000];
        assert_eq!(fs.file_read(&mut f, &mut buf), 2000);
        assert!(buf.iter().all(|&b| b == 0));
        fs.close_file(&f);
    }
}
