//! The mounted volume
//!
//! A [`Volume`] owns everything that belongs to one mounted image: the device
//! handle, the BPB-derived geometry, the FAT, the current-directory cluster,
//! the shell path string kept in lockstep with it, and the open-file table.
//! Every shell command is a method here; each one composes the directory and
//! FAT layers as read-cluster / edit-buffer / write-cluster sequences.
//!
//! On any detectable error an operation returns before its first on-disk
//! write, so failures leave no partial state. The one exception is `write`,
//! which lands data cluster by cluster: clusters written before a failed
//! chain extension stay in place, with the recorded file size unchanged.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error};

use crate::bpb::{BiosParameterBlock, BPB_SIZE};
use crate::device::{BlockDevice, DeviceError};
use crate::dir::{DirBuffer, DirError, DOTDOT_NAME, DOT_NAME};
use crate::entry::DirEntry;
use crate::fat::{Fat, FatError};
use crate::file::{FileError, Mode, OpenFile, OpenTable};
use crate::Result;
use crate::{short_name, ATTR_ARCHIVE, ATTR_DIRECTORY, END_CLUSTER};

/// Geometry snapshot reported by the `info` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub root_cluster: u32,
    pub bytes_per_sector: usize,
    pub sectors_per_cluster: usize,
    pub data_clusters: usize,
    pub entries_per_fat: usize,
    pub image_bytes: usize,
}

pub struct Volume {
    device: Arc<dyn BlockDevice>,
    image_name: String,
    image_bytes: usize,
    bpb: BiosParameterBlock,
    fat: Fat,
    current_cluster: u32,
    /// Begins and ends with `/`; always names the directory of
    /// `current_cluster`.
    current_path: String,
    open_table: OpenTable,
}

impl Volume {
    /// Read and validate the BPB, then seed the shell state at the root.
    pub fn mount(device: Arc<dyn BlockDevice>, image_name: &str) -> Result<Volume> {
        let mut header = [0u8; BPB_SIZE];
        device.read_at(0, &mut header)?;
        let bpb = BiosParameterBlock::new_from_bytes(&header);
        if !bpb.is_valid() {
            error!("{}: boot sector is not FAT32-shaped", image_name);
            return Err(DeviceError::InvalidImage.into());
        }

        let fat = Fat::new(
            device.clone(),
            bpb.fat_start_offset(),
            bpb.fat_size_bytes(),
            bpb.fat_cnt(),
        );
        let image_bytes = device.size();
        debug!(
            "mounted {} ({} bytes, root cluster {})",
            image_name,
            image_bytes,
            bpb.root_cluster()
        );

        Ok(Volume {
            device,
            image_name: String::from(image_name),
            image_bytes,
            current_cluster: bpb.root_cluster(),
            current_path: String::from("/"),
            open_table: OpenTable::new(),
            bpb,
            fat,
        })
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn open_table(&self) -> &OpenTable {
        &self.open_table
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            root_cluster: self.bpb.root_cluster(),
            bytes_per_sector: self.bpb.bytes_per_sector(),
            sectors_per_cluster: self.bpb.sectors_per_cluster(),
            data_clusters: self.bpb.data_cluster_cnt(),
            entries_per_fat: self.bpb.entries_per_fat(),
            image_bytes: self.image_bytes,
        }
    }

    /// Trimmed short name of every valid entry in the current directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.load_dir(self.current_cluster)?;
        Ok(dir.entries().map(|(_, entry)| entry.name()).collect())
    }

    /// `cd`: `..` moves to the parent via the dotdot entry; anything else must
    /// name a directory entry with a non-zero first cluster. The path string
    /// moves together with the cluster.
    pub fn change_dir(&mut self, name: &str) -> Result<()> {
        if name == ".." {
            if self.current_cluster == self.bpb.root_cluster() {
                return Ok(());
            }
            let dir = self.load_dir(self.current_cluster)?;
            let parent = dir.parent_cluster();
            self.current_cluster = if parent == 0 {
                self.bpb.root_cluster()
            } else {
                parent
            };
            // strip the last `name/` component
            self.current_path.pop();
            while !self.current_path.ends_with('/') {
                self.current_path.pop();
            }
            return Ok(());
        }

        let dir = self.load_dir(self.current_cluster)?;
        let (_, entry) = dir.find(&short_name(name)).ok_or(DirError::NotFound)?;
        if !entry.is_dir() || entry.first_cluster() == 0 {
            return Err(DirError::NotADirectory.into());
        }
        self.current_cluster = entry.first_cluster();
        self.current_path.push_str(&entry.name());
        self.current_path.push('/');
        Ok(())
    }

    /// `creat`: a new zero-length file entry; no cluster is allocated until
    /// the first write.
    pub fn create_file(&mut self, name: &str) -> Result<()> {
        let sfn = short_name(name);
        let mut dir = self.load_dir(self.current_cluster)?;
        if dir.find(&sfn).is_some() {
            return Err(DirError::AlreadyExists.into());
        }
        let slot = dir.allocate_slot().ok_or(DirError::DirFull)?;
        dir.set_entry(slot, &DirEntry::new(&sfn, ATTR_ARCHIVE, 0));
        self.store_dir(&dir)
    }

    /// `mkdir`: allocate the child cluster in every FAT copy, publish the
    /// parent slot, then lay down the child's `.` and `..` entries.
    pub fn make_dir(&mut self, name: &str) -> Result<()> {
        let sfn = short_name(name);
        let mut parent = self.load_dir(self.current_cluster)?;
        if parent.find(&sfn).is_some() {
            return Err(DirError::AlreadyExists.into());
        }
        let slot = parent.allocate_slot().ok_or(DirError::DirFull)?;

        let cluster = self.fat.allocate()?;
        parent.set_entry(slot, &DirEntry::new(&sfn, ATTR_DIRECTORY, cluster));
        self.store_dir(&parent)?;

        let mut child = DirBuffer::new(cluster, vec![0u8; self.bpb.cluster_bytes()]);
        let dotdot = if self.current_cluster == self.bpb.root_cluster() {
            0
        } else {
            self.current_cluster
        };
        child.set_entry(0, &DirEntry::new(&DOT_NAME, ATTR_DIRECTORY, cluster));
        child.set_entry(1, &DirEntry::new(&DOTDOT_NAME, ATTR_DIRECTORY, dotdot));
        self.store_dir(&child)
    }

    /// `open`: claim a table row; the row captures the first cluster and the
    /// shell path as they are right now, with the cursor at 0.
    pub fn open_file(&mut self, name: &str, mode: Mode) -> Result<()> {
        let sfn = short_name(name);
        let dir = self.load_dir(self.current_cluster)?;
        let (_, entry) = dir.find(&sfn).ok_or(DirError::NotFound)?;
        if entry.is_dir() {
            return Err(DirError::IsADirectory.into());
        }
        self.open_table.insert(OpenFile {
            name: sfn,
            first_cluster: entry.first_cluster(),
            offset: 0,
            mode,
            path: self.current_path.clone(),
        })?;
        Ok(())
    }

    pub fn close_file(&mut self, name: &str) -> Result<()> {
        self.open_table.remove(&short_name(name))?;
        Ok(())
    }

    /// `lseek`: reposition the cursor. No bound check against the file size;
    /// a later write at an out-of-file offset extends the chain instead.
    pub fn seek(&mut self, name: &str, offset: u32) -> Result<()> {
        let row = self
            .open_table
            .get_mut(&short_name(name))
            .ok_or(FileError::NotOpen)?;
        row.offset = offset;
        Ok(())
    }

    /// `write`: land `data` at the handle's cursor, growing the chain through
    /// the FAT as cluster boundaries are crossed. The directory entry's size
    /// is updated last, and only if the write ran past it.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<usize> {
        let sfn = short_name(name);
        let (offset, mode) = match self.open_table.get(&sfn) {
            Some(row) => (row.offset, row.mode),
            None => return Err(FileError::NotOpen.into()),
        };
        if !mode.writable() {
            return Err(FileError::BadMode.into());
        }

        let mut dir = self.load_dir(self.current_cluster)?;
        let (slot, mut entry) = dir.find(&sfn).ok_or(DirError::NotFound)?;
        let cluster_bytes = self.bpb.cluster_bytes();

        // an empty file gets its first cluster now, recorded both on disk
        // and in the open row
        let mut cluster = entry.first_cluster();
        if cluster == 0 {
            cluster = self.fat.allocate()?;
            entry.set_first_cluster(cluster);
            dir.set_entry(slot, &entry);
            self.store_dir(&dir)?;
            if let Some(row) = self.open_table.get_mut(&sfn) {
                row.first_cluster = cluster;
            }
        }

        for _ in 0..offset as usize / cluster_bytes {
            cluster = self.next_or_extend(cluster)?;
        }

        let mut in_cluster = offset as usize % cluster_bytes;
        let mut written = 0;
        while written < data.len() {
            let len = (cluster_bytes - in_cluster).min(data.len() - written);
            let mut buf = self.read_cluster(cluster)?;
            buf[in_cluster..in_cluster + len].copy_from_slice(&data[written..written + len]);
            self.write_cluster(cluster, &buf)?;
            written += len;
            in_cluster = 0;
            if written < data.len() {
                cluster = self.next_or_extend(cluster)?;
            }
        }

        let end = offset + written as u32;
        if let Some(row) = self.open_table.get_mut(&sfn) {
            row.offset = end;
        }
        if end > entry.file_size() {
            entry.set_file_size(end);
            dir.set_entry(slot, &entry);
            self.store_dir(&dir)?;
        }
        Ok(written)
    }

    /// `read`: the mirror of `write`. Returns at most `len` bytes, bounded by
    /// the recorded file size, and advances the cursor by what it returned.
    pub fn read_file(&mut self, name: &str, len: usize) -> Result<Vec<u8>> {
        let sfn = short_name(name);
        let (offset, mode) = match self.open_table.get(&sfn) {
            Some(row) => (row.offset, row.mode),
            None => return Err(FileError::NotOpen.into()),
        };
        if !mode.readable() {
            return Err(FileError::BadMode.into());
        }

        let dir = self.load_dir(self.current_cluster)?;
        let (_, entry) = dir.find(&sfn).ok_or(DirError::NotFound)?;
        let end = entry.file_size().min(offset.saturating_add(len as u32));
        if offset >= end || entry.first_cluster() == 0 {
            return Ok(Vec::new());
        }

        let cluster_bytes = self.bpb.cluster_bytes();
        let mut cluster = entry.first_cluster();
        for _ in 0..offset as usize / cluster_bytes {
            cluster = self.next_cluster(cluster)?;
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        let mut in_cluster = offset as usize % cluster_bytes;
        while pos < end {
            let take = (cluster_bytes - in_cluster).min((end - pos) as usize);
            let buf = self.read_cluster(cluster)?;
            out.extend_from_slice(&buf[in_cluster..in_cluster + take]);
            pos += take as u32;
            in_cluster = 0;
            if pos < end {
                cluster = self.next_cluster(cluster)?;
            }
        }

        if let Some(row) = self.open_table.get_mut(&sfn) {
            row.offset = pos;
        }
        Ok(out)
    }

    /// `mv`: into an existing directory the 32-byte record moves verbatim and
    /// the old slot is tombstoned; otherwise the name bytes are rewritten in
    /// place.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let src_sfn = short_name(src);
        let dst_sfn = short_name(dst);
        if self.open_table.is_open(&src_sfn) {
            return Err(FileError::InUse.into());
        }

        let mut dir = self.load_dir(self.current_cluster)?;
        let (src_slot, src_entry) = dir.find(&src_sfn).ok_or(DirError::NotFound)?;

        match dir.find(&dst_sfn) {
            Some((_, dst_entry)) if dst_entry.is_dir() => {
                if dst_entry.first_cluster() == 0 {
                    return Err(DirError::NotADirectory.into());
                }
                let mut target = self.load_dir(dst_entry.first_cluster())?;
                if target.find(&src_sfn).is_some() {
                    return Err(DirError::AlreadyExists.into());
                }
                let slot = target.allocate_slot().ok_or(DirError::DirFull)?;
                target.set_entry(slot, &src_entry);
                self.store_dir(&target)?;
                dir.remove(src_slot);
                self.store_dir(&dir)
            }
            Some(_) => Err(DirError::AlreadyExists.into()),
            None => {
                let mut renamed = src_entry;
                renamed.set_name_bytes(&dst_sfn);
                dir.set_entry(src_slot, &renamed);
                self.store_dir(&dir)
            }
        }
    }

    /// `rm`: free the data chain, then tombstone the entry.
    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        let sfn = short_name(name);
        if self.open_table.is_open(&sfn) {
            return Err(FileError::InUse.into());
        }
        let mut dir = self.load_dir(self.current_cluster)?;
        let (slot, entry) = dir.find(&sfn).ok_or(DirError::NotFound)?;
        if entry.is_dir() {
            return Err(DirError::IsADirectory.into());
        }
        if entry.first_cluster() != 0 {
            self.fat.free_chain(entry.first_cluster())?;
        }
        dir.remove(slot);
        self.store_dir(&dir)
    }

    /// `rmdir`: the target may hold nothing but `.` and `..`, and no open
    /// handle may have been captured inside it.
    pub fn remove_dir(&mut self, name: &str) -> Result<()> {
        let mut dir = self.load_dir(self.current_cluster)?;
        let (slot, entry) = dir.find(&short_name(name)).ok_or(DirError::NotFound)?;
        if !entry.is_dir() {
            return Err(DirError::NotADirectory.into());
        }

        let first = entry.first_cluster();
        if first != 0 {
            let child = self.load_dir(first)?;
            if !child.is_empty_dir() {
                return Err(DirError::NotEmpty.into());
            }
        }

        let mut target_path = self.current_path.clone();
        target_path.push_str(&entry.name());
        target_path.push('/');
        if self.open_table.path_in_use(&target_path) {
            return Err(FileError::InUse.into());
        }

        if first != 0 {
            self.fat.free_chain(first)?;
        }
        dir.remove(slot);
        self.store_dir(&dir)
    }

    fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.bpb.cluster_bytes()];
        self.device.read_at(self.bpb.offset(cluster), &mut buf)?;
        Ok(buf)
    }

    fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<()> {
        self.device.write_at(self.bpb.offset(cluster), buf)?;
        Ok(())
    }

    fn load_dir(&self, cluster: u32) -> Result<DirBuffer> {
        Ok(DirBuffer::new(cluster, self.read_cluster(cluster)?))
    }

    fn store_dir(&self, dir: &DirBuffer) -> Result<()> {
        self.write_cluster(dir.cluster(), dir.bytes())
    }

    /// Next cluster of a chain while walking within recorded bounds; an
    /// early end-of-chain here means the image is inconsistent.
    fn next_cluster(&self, cluster: u32) -> Result<u32> {
        let next = self.fat.get(cluster)?;
        if next < 2 || next >= END_CLUSTER {
            error!("chain link {} -> {:#09x} inside recorded file size", cluster, next);
            return Err(FatError::BadChain.into());
        }
        Ok(next)
    }

    /// Next cluster of a chain, growing it when the walk runs off the end.
    fn next_or_extend(&mut self, cluster: u32) -> Result<u32> {
        let next = self.fat.get(cluster)?;
        if next >= END_CLUSTER {
            self.fat.extend(cluster)
        } else if next < 2 {
            Err(FatError::BadChain.into())
        } else {
            Ok(next)
        }
    }
}
