//! Backup archive container: a tar stream of a staging directory,
//! compressed with zstd

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const ARCHIVE_EXTENSION: &str = "tar.zst";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Archive stem for a backup taken at `at`, down to the millisecond
pub(crate) fn archive_stem(at: DateTime<Utc>) -> String {
    format!("backup-{}", at.format("%Y%m%d-%H%M%S-%3f"))
}

/// First free `<stem>[-N].tar.zst` in `dir`, with its stem
pub(crate) fn unique_target(dir: &Path, at: DateTime<Utc>) -> Result<(String, PathBuf)> {
    let base = archive_stem(at);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let stem = match attempt {
            0 => base.clone(),
            n => format!("{}-{}", base, n),
        };
        let target = dir.join(format!("{}.{}", stem, ARCHIVE_EXTENSION));
        match fs::symlink_metadata(&target) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((stem, target)),
            Err(e) => return Err(e.into()),
            Ok(_) => continue,
        }
    }
    Err(Error::Internal(format!(
        "no free archive name for {} in {}",
        base,
        dir.display()
    )))
}

/// Pack every entry of `source` into a new archive at `target`.
///
/// The archive is written to a hidden temporary file next to `target` and
/// only renamed into place once complete; an existing `target` is never
/// overwritten. Returns the archive size in bytes.
pub(crate) fn pack(source: &Path, target: &Path, level: i32) -> Result<u64> {
    let dir = target
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent", target.display())))?;
    let mut staged = tempfile::Builder::new()
        .prefix(".backup-")
        .suffix(".partial")
        .tempfile_in(dir)?;

    {
        let writer = BufWriter::new(staged.as_file_mut());
        let encoder = zstd::Encoder::new(writer, level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut entries = fs::read_dir(source)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<PathBuf>>>()?;
        entries.sort();

        for path in entries {
            let name = path
                .file_name()
                .ok_or_else(|| Error::Internal(format!("bad staging entry {}", path.display())))?;
            if path.is_dir() {
                builder.append_dir_all(name, &path)?;
            } else {
                builder.append_path_with_name(&path, name)?;
            }
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
    }

    staged.as_file().sync_all()?;
    let size = staged.as_file().metadata()?.len();
    staged
        .persist_noclobber(target)
        .map_err(|e| Error::Io(e.error))?;
    debug!(archive = %target.display(), bytes = size, "Archive written");
    Ok(size)
}

/// Unpack the archive at `archive` into the existing directory `dest`
pub(crate) fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let invalid = |reason: String| Error::InvalidArchive {
        path: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive)?;
    let decoder = zstd::Decoder::new(BufReader::new(file))
        .map_err(|e| invalid(format!("not a zstd stream: {}", e)))?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
        .map_err(|e| invalid(format!("cannot unpack: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_archive_names_are_unique() {
        let tmp = TempDir::new().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(archive_stem(at), "backup-20240309-070501-042");

        let (stem, target) = unique_target(tmp.path(), at).unwrap();
        assert_eq!(stem, "backup-20240309-070501-042");
        assert_eq!(target, tmp.path().join("backup-20240309-070501-042.tar.zst"));

        fs::write(&target, b"taken").unwrap();
        fs::write(tmp.path().join("backup-20240309-070501-042-1.tar.zst"), b"taken").unwrap();
        let (stem, target) = unique_target(tmp.path(), at).unwrap();
        assert_eq!(stem, "backup-20240309-070501-042-2");
        assert!(!target.exists());
    }

    #[test]
    fn test_pack_and_unpack() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("staging");
        fs::create_dir_all(source.join("snapshots")).unwrap();
        fs::write(source.join("manifest.json"), b"{}").unwrap();
        fs::write(source.join("snapshots/app1.snap"), b"volume data").unwrap();

        let target = tmp.path().join("backup.tar.zst");
        let size = pack(&source, &target, 3).unwrap();
        assert_eq!(size, fs::metadata(&target).unwrap().len());

        // Only the finished archive remains next to the target
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".partial")));

        let dest = tmp.path().join("out");
        fs::create_dir(&dest).unwrap();
        unpack(&target, &dest).unwrap();
        assert_eq!(fs::read(dest.join("manifest.json")).unwrap(), b"{}");
        assert_eq!(
            fs::read(dest.join("snapshots/app1.snap")).unwrap(),
            b"volume data"
        );
    }

    #[test]
    fn test_pack_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("staging");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("manifest.json"), b"{}").unwrap();

        let target = tmp.path().join("backup.tar.zst");
        fs::write(&target, b"older archive").unwrap();

        assert!(pack(&source, &target, 3).is_err());
        assert_eq!(fs::read(&target).unwrap(), b"older archive");
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("junk.tar.zst");
        fs::write(&archive, b"definitely not zstd").unwrap();

        let err = unpack(&archive, tmp.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive { .. }));
    }
}
