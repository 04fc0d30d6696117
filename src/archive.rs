//! Artifact transport - single-entry tar framing plus host staging
//!
//! Files move in and out of a sandbox as one-entry tar streams, the format
//! both the Docker archive endpoints and a piped `tar` inside a pod speak.
//! Staging writes retrieved bytes under an output directory, disambiguating
//! names instead of overwriting.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Metadata for the first entry of an archive stream
#[derive(Debug, Clone)]
pub struct ArchiveStat {
    pub name: String,
    pub size: u64,
    pub mtime: u64,
}

/// Build a one-entry tar stream holding `contents` under `name`
pub fn pack_file(name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}

/// Extract the first regular-file entry from an archive stream
///
/// Multi-entry archives have their first entry taken and the rest ignored.
pub fn unpack_first(archive: &[u8]) -> std::io::Result<(String, Vec<u8>)> {
    let mut reader = tar::Archive::new(Cursor::new(archive));
    for entry in reader.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        return Ok((name, contents));
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "archive stream holds no regular file entry",
    ))
}

/// Read name/size/mtime from the first regular-file entry without unpacking
pub fn entry_stat(archive: &[u8]) -> std::io::Result<ArchiveStat> {
    let mut reader = tar::Archive::new(Cursor::new(archive));
    for entry in reader.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(ArchiveStat {
            name,
            size: entry.size(),
            mtime: entry.header().mtime().unwrap_or(0),
        });
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "archive stream holds no regular file entry",
    ))
}

/// Write `contents` under `output_dir` as `logical_name`, creating the
/// directory if needed
///
/// If the target path exists, `_1`, `_2`, ... is appended before the
/// extension until a free path is found. Returns the final path.
pub fn stage(output_dir: &Path, logical_name: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    // Strip any directory components the archive entry may carry
    let name = Path::new(logical_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| logical_name.to_string());

    let mut target = output_dir.join(&name);
    if target.exists() {
        let (base, ext) = match name.rfind('.') {
            Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
            _ => (name.as_str(), ""),
        };
        let mut counter = 1;
        loop {
            let candidate = output_dir.join(format!("{base}_{counter}{ext}"));
            if !candidate.exists() {
                target = candidate;
                break;
            }
            counter += 1;
        }
    }

    std::fs::write(&target, contents)?;
    debug!("staged {} ({} bytes)", target.display(), contents.len());
    Ok(target)
}
