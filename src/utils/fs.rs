//! Filesystem primitives shared by the comparison, apply and backup steps.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn file_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok_and(|m| !m.is_dir())
}

pub fn dir_exists(path: &Path) -> bool {
    path.is_dir()
}

/// Byte-for-byte equality of two files.
pub fn files_match(a: &Path, b: &Path) -> io::Result<bool> {
    let left = fs::metadata(a)?;
    let right = fs::metadata(b)?;
    if left.len() != right.len() {
        return Ok(false);
    }
    Ok(fs::read(a)? == fs::read(b)?)
}

/// Copy one file (or symlink), creating parent directories of `dst` as needed.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    let meta = src.symlink_metadata()?;
    if meta.file_type().is_symlink() {
        return copy_symlink(src, dst);
    }

    // fs::copy would write through a symlink sitting at the destination
    if dst.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(dst)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    remove_path(dst)?;
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Copy `src` recursively over `dst`. Existing files are overwritten, extra files in `dst` are kept.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Make `dst` an exact copy of `src`.
pub fn replace_dir(src: &Path, dst: &Path) -> io::Result<()> {
    remove_path(dst)?;
    copy_dir(src, dst)
}

/// Remove a file, symlink or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Relative path of every non-directory entry under `root`, mapped to its SHA-256.
///
/// Symlinks are hashed by their target so the digest never leaves the tree.
pub fn tree_digest(root: &Path) -> io::Result<BTreeMap<PathBuf, [u8; 32]>> {
    let mut digest = BTreeMap::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_path_buf();

        let hash: [u8; 32] = if entry.file_type().is_symlink() {
            let target = fs::read_link(entry.path())?;
            Sha256::digest(target.to_string_lossy().as_bytes()).into()
        } else {
            Sha256::digest(fs::read(entry.path())?).into()
        };

        digest.insert(relative, hash);
    }

    Ok(digest)
}

/// Structural equality of two directory trees: same file set, same content.
pub fn dirs_match(a: &Path, b: &Path) -> io::Result<bool> {
    if !dir_exists(a) || !dir_exists(b) {
        return Ok(dir_exists(a) == dir_exists(b));
    }
    Ok(tree_digest(a)? == tree_digest(b)?)
}
