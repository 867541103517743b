//! Archive handling: container autodetection, ZIP and tar extraction,
//! disk-image handling and the sub-folder ZIP rebuild used to lift a
//! single mod out of a multi-mod repository archive.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use xz2::read::XzDecoder;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// Container formats recognized by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarXz,
}

const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const ZIP_MAGIC: [u8; 2] = [0x50, 0x4B];

/// Detect the container format from the first bytes of an archive.
pub fn detect_format(data: &[u8]) -> Option<ArchiveFormat> {
    if data.len() >= 6 && data[..6] == XZ_MAGIC {
        return Some(ArchiveFormat::TarXz);
    }
    if data.len() >= 2 && data[..2] == GZIP_MAGIC {
        return Some(ArchiveFormat::TarGz);
    }
    if data.len() >= 2 && data[..2] == ZIP_MAGIC {
        return Some(ArchiveFormat::Zip);
    }
    None
}

/// Extract a ZIP archive to a directory, creating parents as needed
/// and preserving mode bits.
pub fn extract_zip(data: &[u8], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("creating directory {:?}", dest))?;

    let mut archive = ZipArchive::new(Cursor::new(data)).context("reading ZIP archive")?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("reading ZIP entry")?;
        let name = file.name().to_string();
        let rel = sanitized_entry_path(&name)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);

        if name.ends_with('/') {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating directory {:?}", target))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {:?}", parent))?;
        }
        let mut out = fs::File::create(&target)
            .with_context(|| format!("creating file {:?}", target))?;
        io::copy(&mut file, &mut out).with_context(|| format!("writing {:?}", target))?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                .with_context(|| format!("setting permissions on {:?}", target))?;
        }
    }

    Ok(())
}

/// Extract a tar stream to a directory. Only regular files and
/// directories are materialized; the root entry is skipped and mode
/// bits are preserved.
pub fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("creating directory {:?}", dest))?;

    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("reading tar archive")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = entry.path().context("reading tar entry path")?.into_owned();
        let rel = sanitized_entry_path(&path.to_string_lossy())?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating directory {:?}", target))?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {:?}", parent))?;
            }
            let mut out = fs::File::create(&target)
                .with_context(|| format!("creating file {:?}", target))?;
            io::copy(&mut entry, &mut out).with_context(|| format!("writing {:?}", target))?;
        } else {
            continue;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(mode) = entry.header().mode() {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("setting permissions on {:?}", target))?;
            }
        }
    }

    Ok(())
}

/// Extract a gzip-compressed tar stream.
pub fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    extract_tar(GzDecoder::new(reader), dest)
}

/// Extract an xz-compressed tar stream.
pub fn extract_tar_xz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    extract_tar(XzDecoder::new(reader), dest)
}

/// Extract a Linux engine archive, detecting the compression by magic
/// bytes and falling back to xz+tar for unknown prefixes.
pub fn extract_linux_archive(file: &mut fs::File, dest: &Path) -> Result<()> {
    use std::io::{Seek, SeekFrom};

    let mut magic = [0u8; 6];
    let read = file.read(&mut magic).context("reading archive magic")?;
    file.seek(SeekFrom::Start(0)).context("rewinding archive")?;

    match detect_format(&magic[..read]) {
        Some(ArchiveFormat::TarGz) => {
            log::debug!("detected gzip+tar archive");
            extract_tar_gz(file, dest)
        }
        Some(ArchiveFormat::Zip) => {
            log::debug!("detected ZIP archive");
            let mut data = Vec::new();
            file.read_to_end(&mut data).context("reading archive")?;
            extract_zip(&data, dest)
        }
        _ => {
            log::debug!("assuming xz+tar archive");
            extract_tar_xz(file, dest)
        }
    }
}

/// Mount guard that detaches the image on every exit path.
struct DmgMount {
    mount_point: PathBuf,
}

impl Drop for DmgMount {
    fn drop(&mut self) {
        let _ = Command::new("hdiutil")
            .args(["detach", "-quiet"])
            .arg(&self.mount_point)
            .status();
    }
}

/// Extract an application bundle from a macOS disk image by mounting
/// it with `hdiutil` and copying `Factorio.app` out.
pub fn extract_dmg(data: &[u8], dest: &Path) -> Result<()> {
    let mut image = tempfile::Builder::new()
        .suffix(".dmg")
        .tempfile()
        .context("creating temporary disk image")?;
    io::Write::write_all(&mut image, data).context("writing disk image")?;

    let mount_dir = tempfile::tempdir().context("creating mount point")?;
    let status = Command::new("hdiutil")
        .args(["attach"])
        .arg(image.path())
        .args(["-mountpoint"])
        .arg(mount_dir.path())
        .args(["-nobrowse", "-quiet"])
        .status()
        .context("running hdiutil attach")?;
    if !status.success() {
        bail!("hdiutil attach failed with status {status}");
    }
    let _mount = DmgMount {
        mount_point: mount_dir.path().to_path_buf(),
    };

    let candidates = [
        mount_dir.path().join("Factorio.app"),
        mount_dir.path().join("Applications").join("Factorio.app"),
        mount_dir.path().join("factorio").join("Factorio.app"),
    ];
    let app = candidates
        .iter()
        .find(|p| p.exists())
        .context("Factorio.app not found in disk image")?;

    fs::create_dir_all(dest).with_context(|| format!("creating directory {:?}", dest))?;
    crate::utils::fs::copy_dir_recursive(app, &dest.join("Factorio.app"))
        .context("copying application bundle")?;
    Ok(())
}

/// Rebuild a ZIP containing only `folder` from a repository archive,
/// renaming entries so the new archive's top-level directory is the
/// folder's base name (the engine loads mod zips by that convention).
pub fn extract_subdir(data: &[u8], folder: &str) -> Result<Vec<u8>> {
    let folder = folder.trim_end_matches('/');
    let top_level = folder.rsplit('/').next().unwrap_or(folder);
    let prefix = format!("{folder}/");

    let mut archive = ZipArchive::new(Cursor::new(data)).context("reading repository ZIP")?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut found = false;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("reading ZIP entry")?;
        let name = file.name().to_string();
        let Some(rel) = name.strip_prefix(&prefix) else {
            continue;
        };
        if rel.is_empty() {
            continue;
        }
        found = true;

        #[allow(unused_mut)]
        let mut options: FileOptions = FileOptions::default();
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            options = options.unix_permissions(mode);
        }

        if name.ends_with('/') {
            writer
                .add_directory(format!("{top_level}/{}", rel.trim_end_matches('/')), options)
                .context("adding directory to mod ZIP")?;
        } else {
            writer
                .start_file(format!("{top_level}/{rel}"), options)
                .context("adding file to mod ZIP")?;
            io::copy(&mut file, &mut writer).context("copying ZIP entry")?;
        }
    }

    if !found {
        bail!("folder {folder:?} not found in repository archive");
    }

    let cursor = writer.finish().context("finishing mod ZIP")?;
    Ok(cursor.into_inner())
}

/// Normalize an archive entry path: strip `./`, reject traversal and
/// absolute paths.
fn sanitized_entry_path(name: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("archive entry has an unsafe path: {name:?}")
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), FileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn build_tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, &contents[..]).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn detects_formats_by_magic() {
        assert_eq!(detect_format(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(detect_format(&[0x1F, 0x8B, 0x08]), Some(ArchiveFormat::TarGz));
        assert_eq!(
            detect_format(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x01]),
            Some(ArchiveFormat::TarXz)
        );
        assert_eq!(detect_format(b"plain"), None);
        assert_eq!(detect_format(b""), None);
    }

    #[test]
    fn zip_round_trip() {
        let data = build_zip(&[
            ("dir/", b""),
            ("dir/file.txt", b"hello"),
            ("top.lua", b"return {}"),
        ]);
        let tmp = tempdir().unwrap();
        extract_zip(&data, tmp.path()).unwrap();
        assert_eq!(fs::read(tmp.path().join("dir/file.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(tmp.path().join("top.lua")).unwrap(), b"return {}");
    }

    #[test]
    fn tar_gz_round_trip() {
        let data = build_tar_gz(&[("sub/a.txt", b"aa"), ("b.txt", b"bb")]);
        let tmp = tempdir().unwrap();
        extract_tar_gz(Cursor::new(data), tmp.path()).unwrap();
        assert_eq!(fs::read(tmp.path().join("sub/a.txt")).unwrap(), b"aa");
        assert_eq!(fs::read(tmp.path().join("b.txt")).unwrap(), b"bb");
    }

    #[test]
    fn rejects_traversal_entries() {
        let data = build_zip(&[("../escape.txt", b"nope")]);
        let tmp = tempdir().unwrap();
        assert!(extract_zip(&data, tmp.path()).is_err());
    }

    #[test]
    fn subdir_extraction_renames_top_level() {
        let data = build_zip(&[
            ("repo-abc123/modA/info.json", br#"{"name":"modA","version":"1.0.0"}"#),
            ("repo-abc123/modA/control.lua", b"-- control"),
            ("repo-abc123/modB/info.json", br#"{"name":"modB","version":"1.0.0"}"#),
        ]);

        let result = extract_subdir(&data, "repo-abc123/modA").unwrap();
        let mut archive = ZipArchive::new(Cursor::new(result.as_slice())).unwrap();

        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"modA/info.json".to_string()));
        assert!(names.contains(&"modA/control.lua".to_string()));
        assert!(!names.iter().any(|n| n.contains("modB")));
    }

    #[test]
    fn subdir_extraction_missing_folder_errors() {
        let data = build_zip(&[("repo/modA/info.json", b"{}")]);
        let err = extract_subdir(&data, "repo/missing").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn linux_archive_fallback_assumes_xz() {
        // A gzip body routes through the gzip path.
        let data = build_tar_gz(&[("x.txt", b"x")]);
        let tmp = tempdir().unwrap();
        let archive_path = tmp.path().join("engine.tar.gz");
        fs::write(&archive_path, &data).unwrap();
        let mut file = fs::File::open(&archive_path).unwrap();
        extract_linux_archive(&mut file, &tmp.path().join("out")).unwrap();
        assert!(tmp.path().join("out/x.txt").exists());
    }
}
