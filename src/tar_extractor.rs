use crate::cancel::Cancellation;
use crate::error::{IoContext, SquashResult};
use crate::tree;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tar_rs as tar;

/// Opens a tar stream, transparently decompressing gzip input.
pub fn open_archive<'a, R: Read + 'a>(reader: R) -> io::Result<tar::Archive<Box<dyn Read + 'a>>> {
    let mut buf_reader = BufReader::new(reader);
    let is_gzip = buf_reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);

    let inner: Box<dyn Read + 'a> = if is_gzip {
        Box::new(GzDecoder::new(buf_reader))
    } else {
        Box::new(buf_reader)
    };
    Ok(tar::Archive::new(inner))
}

/// Unpacks an image export stream into `dest`.
pub fn unpack_archive<R: Read>(reader: R, dest: &Path, cancel: &Cancellation) -> SquashResult<()> {
    let mut archive = open_archive(reader).io_context("Failed to read image archive")?;
    unpack_entries(&mut archive, dest, cancel)
}

/// Only root may hand files to other owners; everyone else keeps their own.
fn restore_ownership() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Expands one layer's `layer.tar` into `dest`, keeping permissions,
/// timestamps, xattrs, links and device nodes as recorded. Ownership is
/// restored when running as root.
pub fn extract_layer(tar_path: &Path, dest: &Path, cancel: &Cancellation) -> SquashResult<()> {
    let file = File::open(tar_path).with_path("Failed to open layer archive", tar_path)?;
    let mut archive = open_archive(file).with_path("Failed to read layer archive", tar_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(restore_ownership());
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);
    unpack_entries(&mut archive, dest, cancel)
}

/// Unpacks entries one by one, checking `cancel` in between.
///
/// Directories are applied last, deepest first, so their modes and times
/// survive the entries created inside them.
fn unpack_entries<R: Read>(
    archive: &mut tar::Archive<R>,
    dest: &Path,
    cancel: &Cancellation,
) -> SquashResult<()> {
    fs::create_dir_all(dest).with_path("Failed to create directory", dest)?;
    let dest = dest
        .canonicalize()
        .with_path("Failed to resolve directory", dest)?;

    let mut directories = Vec::new();
    for entry in archive
        .entries()
        .with_path("Failed to read archive for", &dest)?
    {
        cancel.check()?;
        let mut entry = entry.with_path("Failed to read archive entry for", &dest)?;
        if entry.header().entry_type() == tar::EntryType::Directory {
            directories.push(entry);
            continue;
        }
        let path = entry.path_bytes().into_owned();
        entry.unpack_in(&dest).io_context(format!(
            "Failed to unpack {} into {}",
            String::from_utf8_lossy(&path),
            dest.display()
        ))?;
    }

    directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
    for mut dir in directories {
        cancel.check()?;
        dir.unpack_in(&dest)
            .with_path("Failed to unpack directory into", &dest)?;
    }
    Ok(())
}

/// Writer that hashes everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Every entry below `root`, parents before children, siblings sorted by name.
fn sorted_entries(root: &Path) -> SquashResult<Vec<PathBuf>> {
    tree::walk(root).map(|item| item.map(|(rel, _)| rel)).collect()
}

/// Packs the directory `src` into the tar file `tar_path`.
///
/// Members are written in sorted path order with complete metadata, and
/// files sharing an inode are written as hard links to the first path, so
/// identical trees always produce identical archives. Returns the hex sha256
/// of the written archive.
pub fn pack_layer(src: &Path, tar_path: &Path, cancel: &Cancellation) -> SquashResult<String> {
    let file = File::create(tar_path).with_path("Failed to create layer archive", tar_path)?;
    let writer = HashingWriter {
        inner: BufWriter::new(file),
        hasher: Sha256::new(),
    };
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Complete);
    builder.follow_symlinks(false);

    let mut inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();
    for rel in sorted_entries(src)? {
        cancel.check()?;
        let abs = src.join(&rel);
        let meta = fs::symlink_metadata(&abs).with_path("Failed to stat", &abs)?;

        if meta.is_file() && meta.nlink() > 1 {
            let key = (meta.dev(), meta.ino());
            if let Some(first) = inodes.get(&key) {
                let mut header = tar::Header::new_gnu();
                header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
                header.set_entry_type(tar::EntryType::Link);
                header.set_size(0);
                builder
                    .append_link(&mut header, &rel, first)
                    .with_path("Failed to add hard link", &abs)?;
                continue;
            }
            inodes.insert(key, rel.clone());
        }

        builder
            .append_path_with_name(&abs, &rel)
            .with_path("Failed to add", &abs)?;
    }

    let mut writer = builder
        .into_inner()
        .with_path("Failed to finish layer archive", tar_path)?;
    writer
        .flush()
        .with_path("Failed to write layer archive", tar_path)?;
    Ok(hex::encode(writer.hasher.finalize()))
}

/// Hex sha256 of a file's contents.
pub fn file_digest(path: &Path) -> SquashResult<String> {
    let mut file = File::open(path).with_path("Failed to open", path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_path("Failed to read", path)?;
    Ok(hex::encode(hasher.finalize()))
}
