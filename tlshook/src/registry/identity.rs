use std::{
    fmt,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use tlshook_common::TlsBinaryId;

/// Identifies an executable file by device and inode, independent of the
/// path used to reach it or the process running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinaryId {
    pub dev: u64,
    pub ino: u64,
}

impl BinaryId {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    // Same encoding as glibc's gnu_dev_major/gnu_dev_minor.
    pub fn major(&self) -> u32 {
        (((self.dev >> 32) & 0xffff_f000) | ((self.dev >> 8) & 0x0000_0fff)) as u32
    }

    pub fn minor(&self) -> u32 {
        (((self.dev >> 12) & 0xffff_ff00) | (self.dev & 0x0000_00ff)) as u32
    }

    /// Stable identifier used to name the hooks installed for this binary.
    pub fn uid(&self) -> String {
        format!("{:x}_{:x}", self.dev, self.ino)
    }
}

impl fmt::Display for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.major(), self.minor(), self.ino)
    }
}

impl From<BinaryId> for TlsBinaryId {
    fn from(id: BinaryId) -> Self {
        TlsBinaryId {
            id_major: id.major(),
            id_minor: id.minor(),
            ino: id.ino,
        }
    }
}

/// A binary path as reachable from the agent, together with the identity
/// captured when it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePath {
    pub host_path: PathBuf,
    pub id: BinaryId,
}

impl FilePath {
    pub fn resolve(host_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let host_path = host_path.into();
        let id = BinaryId::from_path(&host_path)?;
        Ok(Self { host_path, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn makedev(major: u64, minor: u64) -> u64 {
        ((major & 0xffff_f000) << 32)
            | ((major & 0x0000_0fff) << 8)
            | ((minor & 0xffff_ff00) << 12)
            | (minor & 0x0000_00ff)
    }

    #[test]
    fn test_major_minor_split() {
        let id = BinaryId {
            dev: makedev(259, 3),
            ino: 42,
        };
        assert_eq!(id.major(), 259);
        assert_eq!(id.minor(), 3);

        let large = BinaryId {
            dev: makedev(0x1234, 0x7856),
            ino: 1,
        };
        assert_eq!(large.major(), 0x1234);
        assert_eq!(large.minor(), 0x7856);
    }

    #[test]
    fn test_hard_links_share_identity() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("server");
        let link = dir.path().join("server-link");
        std::fs::write(&original, b"\x7fELF").unwrap();
        std::fs::hard_link(&original, &link).unwrap();

        let a = FilePath::resolve(&original).unwrap();
        let b = FilePath::resolve(&link).unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.host_path, b.host_path);
    }

    #[test]
    fn test_replaced_file_changes_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server");
        std::fs::write(&path, b"v1").unwrap();
        let before = BinaryId::from_path(&path).unwrap();

        // Keep the old inode alive so the new file cannot reuse it.
        let keep = dir.path().join("server.old");
        std::fs::rename(&path, &keep).unwrap();
        std::fs::write(&path, b"v2").unwrap();
        let after = BinaryId::from_path(&path).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_file() {
        assert!(FilePath::resolve("/nonexistent/tlshook/binary").is_err());
    }

    #[test]
    fn test_kernel_key_conversion() {
        let id = BinaryId {
            dev: (8 << 8) | 1,
            ino: 99,
        };
        let key = TlsBinaryId::from(id);
        assert_eq!(key.id_major, 8);
        assert_eq!(key.id_minor, 1);
        assert_eq!(key.ino, 99);
        assert_eq!(id.uid(), "801_63");
    }
}
