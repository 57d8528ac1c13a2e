//! SFTP data types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::backend::{RawDirEntry, SftpAttributes};

/// `S_IFMT` file type bits
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Link,
    Regular,
    Directory,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileType {
    /// Decode the type bits of a mode.
    pub fn from_mode(perm: u32) -> Self {
        match perm & mode::S_IFMT {
            mode::S_IFLNK => FileType::Link,
            mode::S_IFREG => FileType::Regular,
            mode::S_IFDIR => FileType::Directory,
            mode::S_IFCHR => FileType::CharacterDevice,
            mode::S_IFBLK => FileType::BlockDevice,
            mode::S_IFIFO => FileType::Fifo,
            mode::S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

/// Read / write / execute bits for one class of user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Access {
    fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & 0o4 != 0,
            write: bits & 0o2 != 0,
            execute: bits & 0o1 != 0,
        }
    }

    fn bits(self) -> u32 {
        (self.read as u32) << 2 | (self.write as u32) << 1 | self.execute as u32
    }
}

/// Owner / group / others permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePermissions {
    pub owner: Access,
    pub group: Access,
    pub others: Access,
}

impl FilePermissions {
    pub fn from_mode(perm: u32) -> Self {
        Self {
            owner: Access::from_bits(perm >> 6),
            group: Access::from_bits(perm >> 3),
            others: Access::from_bits(perm),
        }
    }

    /// Permission bits without the file type.
    pub fn mode(self) -> u32 {
        self.owner.bits() << 6 | self.group.bits() << 3 | self.others.bits()
    }
}

/// rw-r--r--
impl Default for FilePermissions {
    fn default() -> Self {
        Self::from_mode(0o644)
    }
}

/// Three digit octal, e.g. `644`
impl fmt::Display for FilePermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03o}", self.mode())
    }
}

/// File entry information
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    /// File name (not full path); empty for `stat` results
    pub name: String,
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    pub permissions: FilePermissions,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Owner name parsed from the listing's long name
    pub owner: Option<String>,
    /// Group name parsed from the listing's long name
    pub group: Option<String>,
    /// Last access time (Unix timestamp)
    pub accessed: Option<u64>,
    /// Last modified time (Unix timestamp)
    pub modified: Option<u64>,
}

impl FileInfo {
    pub fn from_attributes(name: impl Into<String>, attrs: &SftpAttributes) -> Self {
        let perm = attrs.perm.unwrap_or(0);
        Self {
            name: name.into(),
            file_type: FileType::from_mode(perm),
            size: attrs.size.unwrap_or(0),
            permissions: FilePermissions::from_mode(perm),
            uid: attrs.uid,
            gid: attrs.gid,
            owner: None,
            group: None,
            accessed: attrs.atime,
            modified: attrs.mtime,
        }
    }

    pub(crate) fn from_entry(entry: RawDirEntry) -> Self {
        let mut info = Self::from_attributes(entry.name, &entry.attrs);
        if let Some((owner, group)) = entry.longname.as_deref().and_then(parse_owner_group) {
            info.owner = Some(owner);
            info.group = Some(group);
        }
        info
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified
            .and_then(|t| DateTime::from_timestamp(i64::try_from(t).ok()?, 0))
    }
}

/// Owner and group from an `ls -l` style long name.
///
/// Requires more than 8 whitespace separated fields; owner is field 2 and
/// group is field 3.
pub fn parse_owner_group(longname: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = longname.split_whitespace().collect();
    if fields.len() > 8 {
        Some((fields[2].to_string(), fields[3].to_string()))
    } else {
        None
    }
}

/// File system statistics (`statvfs@openssh.com`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statvfs {
    /// File system block size
    pub bsize: u64,
    /// Fundamental block size
    pub frsize: u64,
    /// Number of blocks, in `frsize` units
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks for non-root
    pub bavail: u64,
    /// Total inodes
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    /// Maximum file name length
    pub namemax: u64,
}

impl Statvfs {
    /// Total size in bytes.
    pub fn total_space(&self) -> u64 {
        self.frsize.saturating_mul(self.blocks)
    }

    /// Free bytes.
    pub fn free_space(&self) -> u64 {
        self.frsize.saturating_mul(self.bfree)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}
