//! Core engine of an interactive FAT32 image editor.
//!
//! The library is `no_std`: all image access goes through the positional
//! [`device::BlockDevice`] trait, so the engine can be driven from the shell
//! binary or from an in-memory buffer in tests. A mounted image is a
//! [`volume::Volume`] value which owns the device handle, the BPB-derived
//! geometry, the current-directory state and the open-file table; every shell
//! command is a method on it.

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod bpb;
pub mod device;
pub mod dir;
pub mod entry;
pub mod fat;
pub mod file;
pub mod volume;

use core::fmt;

use crate::device::DeviceError;
use crate::dir::DirError;
use crate::fat::FatError;
use crate::file::FileError;

/// FAT entry value of an unallocated cluster.
pub const FREE_CLUSTER: u32 = 0x0000_0000;
/// Clusters marked bad are never handed out, but they are not free either.
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
/// Any masked FAT value at or above this is an end-of-chain mark.
pub const END_CLUSTER: u32 = 0x0FFF_FFF8;
/// EOC: End of Cluster Chain
/// note that we still USE this cluster and this cluster id is not EOC,
/// but in the FAT table, the value of this cluster is EOC
pub const END_OF_CLUSTER: u32 = 0x0FFF_FFFF;
/// A FAT32 entry is really a 28-bit value; the high nibble is reserved.
pub const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

pub const DIRENT_SIZE: usize = 32;
pub const SHORT_NAME_LEN: usize = 11;

/// For Short Directory Entry Name[0]
///
/// Deleted
pub const DIR_ENTRY_UNUSED: u8 = 0xE5;
/// For Short Directory Entry Name[0]
///
/// Never used; a scan for the end of a directory stops here
pub const DIR_ENTRY_LAST_AND_UNUSED: u8 = 0x00;
/// For Short Directory Entry Name[0]
///
/// Local tombstone: deleted, but later slots in the cluster may still hold
/// valid entries, so a scan must continue past it. Third-party tools read
/// this byte as a live (non-standard) name character.
pub const DIR_ENTRY_LOCAL_UNUSED: u8 = 0x5E;

pub const SPACE: u8 = 0x20;
pub const DOT: u8 = 0x2E;

/// Fixed capacity of the open-file table.
pub const OPEN_FILE_LIMIT: usize = 10;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Device(DeviceError),
    Fat(FatError),
    Dir(DirError),
    File(FileError),
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        Error::Device(err)
    }
}

impl From<FatError> for Error {
    fn from(err: FatError) -> Self {
        Error::Fat(err)
    }
}

impl From<DirError> for Error {
    fn from(err: DirError) -> Self {
        Error::Dir(err)
    }
}

impl From<FileError> for Error {
    fn from(err: FileError) -> Self {
        Error::File(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Device(e) => e.fmt(f),
            Error::Fat(e) => e.fmt(f),
            Error::Dir(e) => e.fmt(f),
            Error::File(e) => e.fmt(f),
        }
    }
}

pub(crate) fn read_le_u32(input: &[u8]) -> u32 {
    let (int_bytes, _) = input.split_at(core::mem::size_of::<u32>());
    u32::from_le_bytes(int_bytes.try_into().unwrap())
}

/// Normalize a name to its on-disk short form: uppercase ASCII, padded right
/// with spaces to 11 bytes, truncated to 11.
///
/// "Short names passed to the file system are always converted to upper case
/// and their original case value is lost"
pub fn short_name(name: &str) -> [u8; SHORT_NAME_LEN] {
    let mut short = [SPACE; SHORT_NAME_LEN];
    for (i, byte) in name.bytes().take(SHORT_NAME_LEN).enumerate() {
        short[i] = byte.to_ascii_uppercase();
    }
    short
}

#[cfg(test)]
pub(crate) mod testing {
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::RwLock;

    use crate::device::{BlockDevice, DeviceError};
    use crate::volume::Volume;
    use crate::{END_OF_CLUSTER, FREE_CLUSTER};

    pub(crate) const BYTES_PER_SECTOR: usize = 512;
    pub(crate) const SECTORS_PER_CLUSTER: usize = 1;
    pub(crate) const RESERVED_SECTORS: usize = 32;
    pub(crate) const NUM_FATS: usize = 2;
    pub(crate) const FAT_SECTORS: usize = 16;
    pub(crate) const TOTAL_SECTORS: usize = 2048;
    pub(crate) const ROOT_CLUSTER: u32 = 2;

    pub(crate) struct MemDevice(RwLock<Vec<u8>>);

    impl MemDevice {
        pub(crate) fn new(bytes: Vec<u8>) -> Self {
            Self(RwLock::new(bytes))
        }
    }

    impl BlockDevice for MemDevice {
        fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
            let bytes = self.0.read();
            if offset + buf.len() > bytes.len() {
                return Err(DeviceError::ReadError);
            }
            buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
            Ok(())
        }

        fn write_at(&self, offset: usize, buf: &[u8]) -> Result<(), DeviceError> {
            let mut bytes = self.0.write();
            if offset + buf.len() > bytes.len() {
                return Err(DeviceError::WriteError);
            }
            bytes[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(())
        }

        fn size(&self) -> usize {
            self.0.read().len()
        }
    }

    /// A freshly formatted 1 MiB FAT32 image: reserved=32, SPC=1, BPS=512,
    /// two FATs of 16 sectors, root directory at cluster 2.
    pub(crate) fn format_image() -> Vec<u8> {
        let mut image = vec![0u8; TOTAL_SECTORS * BYTES_PER_SECTOR];

        image[11..13].copy_from_slice(&(BYTES_PER_SECTOR as u16).to_le_bytes());
        image[13] = SECTORS_PER_CLUSTER as u8;
        image[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
        image[16] = NUM_FATS as u8;
        // root_ent_cnt, tot_sec16 and fat_sz16 stay zero on FAT32
        image[21] = 0xF8;
        image[32..36].copy_from_slice(&(TOTAL_SECTORS as u32).to_le_bytes());
        image[36..40].copy_from_slice(&(FAT_SECTORS as u32).to_le_bytes());
        image[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        image[48..50].copy_from_slice(&1u16.to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;

        let fat_start = RESERVED_SECTORS * BYTES_PER_SECTOR;
        let fat_bytes = FAT_SECTORS * BYTES_PER_SECTOR;
        for copy in 0..NUM_FATS {
            let base = fat_start + copy * fat_bytes;
            image[base..base + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
            image[base + 4..base + 8].copy_from_slice(&END_OF_CLUSTER.to_le_bytes());
            let root = base + 4 * ROOT_CLUSTER as usize;
            image[root..root + 4].copy_from_slice(&END_OF_CLUSTER.to_le_bytes());
        }

        image
    }

    pub(crate) fn mem_volume() -> Volume {
        let device = Arc::new(MemDevice::new(format_image()));
        Volume::mount(device, "test.img").unwrap()
    }

    /// Masked FAT value for `cluster`, read straight from the given copy.
    pub(crate) fn raw_fat_entry(volume: &Volume, copy: usize, cluster: u32) -> u32 {
        let mut buf = [0u8; 4];
        let offset = RESERVED_SECTORS * BYTES_PER_SECTOR
            + copy * FAT_SECTORS * BYTES_PER_SECTOR
            + 4 * cluster as usize;
        volume.device().read_at(offset, &mut buf).unwrap();
        u32::from_le_bytes(buf) & crate::FAT_ENTRY_MASK
    }

    pub(crate) fn assert_free(volume: &Volume, cluster: u32) {
        assert_eq!(raw_fat_entry(volume, 0, cluster), FREE_CLUSTER);
        assert_eq!(raw_fat_entry(volume, 1, cluster), FREE_CLUSTER);
    }

    #[test]
    fn normalized_short_names() {
        assert_eq!(&crate::short_name("hello.txt"), b"HELLO.TXT  ");
        assert_eq!(&crate::short_name("A"), b"A          ");
        assert_eq!(&crate::short_name("longnamefile.ext"), b"LONGNAMEFIL");
        assert_eq!(&crate::short_name(""), b"           ");
    }
}
