// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw disk images holding an EFI system partition.

use anyhow::{Context, Result};
use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use mbrman::{MBRPartitionEntry, CHS, MBR};
use std::io::{Cursor, Read, Write};
use std::ops::Range;
use std::path::Path;
use walkdir::WalkDir;

const SECTOR_SIZE: usize = 512;

/// First sector of the partition; keeps it 1 MiB aligned.
const PARTITION_START_LBA: usize = 2048;

const MIN_PARTITION_BYTES: usize = 16 * 1024 * 1024;

/// MBR partition type of an EFI system partition.
const ESP_PARTITION_TYPE: u8 = 0xef;

const VOLUME_LABEL: [u8; 11] = *b"HELLO_EFI  ";

fn get_partition_byte_range(mbr: &MBR) -> Range<usize> {
    let partition_start_byte = mbr[1].starting_lba as usize * SECTOR_SIZE;
    let partition_num_bytes = mbr[1].sectors as usize * SECTOR_SIZE;
    partition_start_byte..partition_start_byte + partition_num_bytes
}

/// Size of the partition needed to hold `content_bytes` of files, rounded
/// up to whole sectors. Leaves room for the FAT metadata and cluster
/// slack.
fn partition_size(content_bytes: usize) -> usize {
    let size = MIN_PARTITION_BYTES.max(content_bytes * 2 + 1024 * 1024);
    size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

/// Write a disk image with an MBR and a single bootable FAT partition
/// containing a copy of `esp_dir`.
pub fn create_esp_disk_image(esp_dir: &Path, path: &Path) -> Result<()> {
    let mut content_bytes = 0;
    for entry in WalkDir::new(esp_dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            content_bytes += entry.metadata()?.len() as usize;
        }
    }

    let partition_bytes = partition_size(content_bytes);
    let num_sectors = PARTITION_START_LBA + partition_bytes / SECTOR_SIZE;

    let partition_byte_range;
    let mut disk = vec![0; num_sectors * SECTOR_SIZE];
    {
        let mut cur = Cursor::new(&mut disk);

        let mut mbr = MBR::new_from(&mut cur, SECTOR_SIZE as u32, *b"HEFI")?;
        mbr[1] = MBRPartitionEntry {
            boot: mbrman::BOOT_ACTIVE,
            first_chs: CHS::empty(),
            sys: ESP_PARTITION_TYPE,
            last_chs: CHS::empty(),
            starting_lba: PARTITION_START_LBA as u32,
            sectors: (partition_bytes / SECTOR_SIZE) as u32,
        };

        partition_byte_range = get_partition_byte_range(&mbr);

        mbr.write_into(&mut cur)?;
    }

    init_esp_partition(&mut disk[partition_byte_range], esp_dir)?;

    fs_err::write(path, &disk)?;

    Ok(())
}

fn init_esp_partition(partition: &mut [u8], esp_dir: &Path) -> Result<()> {
    fatfs::format_volume(
        &mut Cursor::new(&mut *partition),
        FormatVolumeOptions::new().volume_label(VOLUME_LABEL),
    )?;

    let fs = FileSystem::new(
        Cursor::new(partition),
        FsOptions::new().update_accessed_date(false),
    )?;
    {
        let root_dir = fs.root_dir();

        // Parents are visited before their children.
        for entry in WalkDir::new(esp_dir).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let rel_path = entry.path().strip_prefix(esp_dir)?;
            let fat_path = rel_path
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if entry.file_type().is_dir() {
                root_dir.create_dir(&fat_path)?;
            } else {
                let data = fs_err::read(entry.path())?;
                let mut file = root_dir
                    .create_file(&fat_path)
                    .with_context(|| format!("failed to create {fat_path} in the image"))?;
                file.write_all(&data)?;
            }
        }
    }

    fs.unmount()?;

    Ok(())
}

/// Read the file at `path` (slash separated, relative to the root of the
/// ESP) from a disk image written by [`create_esp_disk_image`].
pub fn read_esp_file(image: &Path, path: &str) -> Result<Vec<u8>> {
    let mut disk = fs_err::read(image)?;

    let partition_byte_range;
    {
        let mut cursor = Cursor::new(&disk);
        let mbr = MBR::read_from(&mut cursor, SECTOR_SIZE as u32)?;
        partition_byte_range = get_partition_byte_range(&mbr);
    }

    let cursor = Cursor::new(&mut disk[partition_byte_range]);
    let fs = FileSystem::new(cursor, FsOptions::new().update_accessed_date(false))?;
    let mut file = fs
        .root_dir()
        .open_file(path)
        .with_context(|| format!("{path} is missing from {}", image.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    Ok(bytes)
}
