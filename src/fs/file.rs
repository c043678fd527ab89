use alloc::sync::Arc;

use super::inode::Inode;
use super::Filesys;

/// An open file handle: a shared inode plus this opener's position.
#[derive(Debug)]
pub struct File {
    pub(crate) inode: Arc<Inode>,
    pos: u32,
    deny_write: bool,
}

impl File {
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}

impl Filesys {
    pub(crate) fn file_open(&self, inode: Arc<Inode>) -> File {
        File {
            inode,
            pos: 0,
            deny_write: false,
        }
    }

    /// A second independent handle (own position) on the same inode.
    pub fn file_reopen(&self, file: &File) -> File {
        self.file_open(self.inode_reopen(&file.inode))
    }

    /// Close a handle: re-allow writes if this opener denied them,
    /// then drop the inode reference.
    pub fn close_file(&self, file: &File) {
        if file.deny_write {
            self.inode_allow_write(&file.inode);
        }
        self.inode_close(&file.inode);
    }

    /// Read from the current position, advancing it.
    pub fn file_read(&self, file: &mut File, buf: &mut [u8]) -> usize {
        let n = self.inode_read_at(&file.inode, buf, file.pos);
        file.pos += n as u32;
        n
    }

    /// Read at an absolute offset; the position is untouched.
    pub fn file_read_at(&self, file: &File, buf: &mut [u8], offset: u32) -> usize {
        self.inode_read_at(&file.inode, buf, offset)
    }

    /// Write at the current position, advancing it.
    pub fn file_write(&self, file: &mut File, data: &[u8]) -> usize {
        let n = self.inode_write_at(&file.inode, data, file.pos);
        file.pos += n as u32;
        n
    }

    /// Write at an absolute offset; the position is untouched.
    pub fn file_write_at(&self, file: &File, data: &[u8], offset: u32) -> usize {
        self.inode_write_at(&file.inode, data, offset)
    }

    pub fn file_length(&self, file: &File) -> u32 {
        file.inode.length()
    }

    pub fn file_seek(&self, file: &mut File, pos: u32) {
        file.pos = pos;
    }

    pub fn file_tell(&self, file: &File) -> u32 {
        file.pos
    }

    /// Deny writes to the backing inode for as long as this handle is
    /// open (running executables).
    pub fn file_deny_write(&self, file: &mut File) {
        if !file.deny_write {
            file.deny_write = true;
            self.inode_deny_write(&file.inode);
        }
    }

    pub fn file_allow_write(&self, file: &mut File) {
        if file.deny_write {
            file.deny_write = false;
            self.inode_allow_write(&file.inode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::block::MemDisk;
    use crate::fs::FsNode;

    fn fs_with_file(name: &str, content: &[u8]) -> (Filesys, File) {
        let fs = Filesys::format(Arc::new(MemDisk::new(256))).unwrap();
        fs.create(None, name, 0, true).unwrap();
        let mut file = match fs.open(None, name).unwrap() {
            FsNode::File(file) => file,
            FsNode::Dir(_) => panic!("expected a file"),
        };
        assert_eq!(fs.file_write(&mut file, content), content.len());
        fs.file_seek(&mut file, 0);
        (fs, file)
    }

    #[test]
    fn sequential_reads_advance_position() {
        let (fs, mut file) = fs_with_file("seq", b"abcdefgh");
        let mut buf = [0u8; 3];
        assert_eq!(fs.file_read(&mut file, &mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(fs.file_tell(&file), 3);
        assert_eq!(fs.file_read(&mut file, &mut buf), 3);
        assert_eq!(&buf, b"def");
        fs.file_seek(&mut file, 6);
        assert_eq!(fs.file_read(&mut file, &mut buf), 2);
        assert_eq!(&buf[..2], b"gh");
        fs.close_file(&file);
    }

    #[test]
    fn reopen_has_independent_position() {
        let (fs, mut file) = fs_with_file("dup", b"0123456789");
        let mut twin = fs.file_reopen(&file);
        let mut buf = [0u8; 4];
        assert_eq!(fs.file_read(&mut file, &mut buf), 4);
        assert_eq!(fs.file_tell(&twin), 0);
        assert_eq!(fs.file_read(&mut twin, &mut buf), 4);
        assert_eq!(&buf, b"0123");
        fs.close_file(&twin);
        fs.close_file(&file);
        assert_eq!(fs.open_inode_count(), 0);
    }

    #[test]
    fn deny_write_is_scoped_to_the_handle() {
        let (fs, mut file) = fs_with_file("deny", b"data");
        fs.file_deny_write(&mut file);
        assert_eq!(fs.file_write_at(&file, b"x", 0), 0);
        // Closing the denying handle re-allows writes.
        fs.close_file(&file);

        let mut again = match fs.open(None, "deny").unwrap() {
            FsNode::File(file) => file,
            FsNode::Dir(_) => panic!("expected a file"),
        };
        assert_eq!(fs.file_write(&mut again, b"x"), 1);
        fs.close_file(&again);
    }
}
