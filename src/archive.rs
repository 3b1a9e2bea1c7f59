use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Builder, Header};
use tracing::debug;
use walkdir::WalkDir;

/// Fan-out writer: every byte written goes to each sink, in sink order.
pub struct MultiWriter<W: Write> {
    sinks: Vec<W>,
}

impl<W: Write> MultiWriter<W> {
    pub fn new(sinks: Vec<W>) -> Self {
        Self { sinks }
    }
}

impl<W: Write> Write for MultiWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in self.sinks.iter_mut() {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

/// Reads exactly `len` bytes from `inner`. Bytes past `len` are ignored and
/// an early EOF is an error, so entry content always matches its header size.
pub struct SizedReader<R: Read> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> SizedReader<R> {
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
            remaining: len,
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: u64,
    pub bytes: u64,
}

/// Walks `src` and writes every regular file beneath it into a gzip-compressed
/// tar stream, replicated to all `sinks`.
///
/// Entry names are relative to `src`. Directories, symlinks and special files
/// produce no entry. The first error aborts the walk; sinks may then hold a
/// truncated stream.
pub fn write_archive<W: Write>(src: &Path, sinks: Vec<W>) -> Result<ArchiveStats> {
    write_archive_excluding(src, &[], sinks)
}

/// Same as [`write_archive`], but files resolving to any path in `exclude`
/// are skipped. Used to keep an archive staged inside `src` out of itself.
pub fn write_archive_excluding<W: Write>(
    src: &Path,
    exclude: &[PathBuf],
    sinks: Vec<W>,
) -> Result<ArchiveStats> {
    // Checked before any encoder exists so a missing source writes nothing.
    fs::metadata(src).with_context(|| format!("Unable to tar files - {}", src.display()))?;
    if sinks.is_empty() {
        anyhow::bail!("Unable to tar files - no output sinks given");
    }
    let excluded: Vec<PathBuf> = exclude
        .iter()
        .filter_map(|p| fs::canonicalize(p).ok())
        .collect();

    // Dropping the builder on an error path still writes the tar and gzip trailers.
    let encoder = GzEncoder::new(MultiWriter::new(sinks), Compression::default());
    let mut tar = Builder::new(encoder);
    let mut stats = ArchiveStats::default();

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", src.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !excluded.is_empty() {
            let resolved = fs::canonicalize(path)
                .with_context(|| format!("Failed to resolve path: {}", path.display()))?;
            if excluded.contains(&resolved) {
                debug!("Skipping excluded file {}", path.display());
                continue;
            }
        }

        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
        let name = entry_name(src, path)
            .with_context(|| format!("Failed to build archive name: {}", path.display()))?;

        let mut header = Header::new_gnu();
        header.set_metadata(&metadata);

        // One source handle open at a time; it closes at the end of this block.
        {
            let file = File::open(path)
                .with_context(|| format!("Failed to open file: {}", path.display()))?;
            tar.append_data(&mut header, &name, SizedReader::new(file, metadata.len()))
                .with_context(|| format!("Failed to add file to archive: {}", path.display()))?;
        }

        debug!("Archived {} ({} bytes)", name.display(), metadata.len());
        stats.files += 1;
        stats.bytes += metadata.len();
    }

    let encoder = tar.into_inner().context("Failed to finish tar archive")?;
    let mut sinks = encoder.finish().context("Failed to finish gzip stream")?;
    sinks.flush().context("Failed to flush archive output")?;

    Ok(stats)
}

/// Archive name for `path`: the part below `root`, with the root prefix and
/// any leading separator removed.
pub fn entry_name(root: &Path, path: &Path) -> Result<PathBuf> {
    let relative = path.strip_prefix(root).unwrap_or(path);

    // A source root that is itself a file is stored under its own name.
    let relative = if relative.as_os_str().is_empty() {
        Path::new(path.file_name().context("Path has no file name")?)
    } else {
        relative
    };

    let name: PathBuf = relative
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if name.as_os_str().is_empty() {
        anyhow::bail!("Empty archive name for {}", path.display());
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use tar::Archive;
    use tempfile::TempDir;

    fn unpack(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = Archive::new(GzDecoder::new(bytes));
        let mut entries = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            entries.insert(name, content);
        }
        entries
    }

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "world").unwrap();
        dir
    }

    #[test]
    fn archives_files_with_relative_names() {
        let dir = sample_tree();
        let mut out = Vec::new();

        let stats = write_archive(dir.path(), vec![&mut out]).unwrap();

        let entries = unpack(&out);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["a.txt"], b"hello");
        assert_eq!(entries["sub/b.txt"], b"world");
        assert_eq!(stats, ArchiveStats { files: 2, bytes: 10 });
    }

    #[test]
    fn skips_empty_directories_and_symlinks() {
        let dir = sample_tree();
        fs::create_dir_all(dir.path().join("empty/nested")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("link.txt"))
            .unwrap();

        let mut out = Vec::new();
        write_archive(dir.path(), vec![&mut out]).unwrap();

        let names: Vec<_> = unpack(&out).into_keys().collect();
        assert_eq!(names, vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
    }

    #[test]
    fn every_sink_receives_identical_bytes() {
        let dir = sample_tree();
        let mut first = Vec::new();
        let mut second = Vec::new();
        let mut third = Vec::new();

        write_archive(
            dir.path(),
            vec![&mut first as &mut dyn Write, &mut second, &mut third],
        )
        .unwrap();

        assert!(!first.is_empty());
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn missing_source_fails_without_writing() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();

        let err = write_archive(&dir.path().join("nope"), vec![&mut out]).unwrap_err();

        assert!(err.to_string().contains("Unable to tar files"));
        assert!(out.is_empty());
    }

    #[test]
    fn rejects_empty_sink_list() {
        let dir = sample_tree();
        let sinks: Vec<Vec<u8>> = Vec::new();
        assert!(write_archive(dir.path(), sinks).is_err());
    }

    #[test]
    fn empty_tree_still_produces_valid_archive() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();

        write_archive(dir.path(), vec![&mut out]).unwrap();

        assert!(!out.is_empty());
        assert!(unpack(&out).is_empty());
    }

    #[test]
    fn single_file_source_uses_its_name() {
        let dir = sample_tree();
        let mut out = Vec::new();

        write_archive(&dir.path().join("sub/b.txt"), vec![&mut out]).unwrap();

        let entries = unpack(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["b.txt"], b"world");
    }

    #[cfg(unix)]
    #[test]
    fn preserves_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = sample_tree();
        fs::set_permissions(dir.path().join("a.txt"), fs::Permissions::from_mode(0o640)).unwrap();
        let mut out = Vec::new();
        write_archive(dir.path(), vec![&mut out]).unwrap();

        let mut archive = Archive::new(GzDecoder::new(out.as_slice()));
        let entry = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_str() == Some("a.txt"))
            .unwrap();
        assert_eq!(entry.header().mode().unwrap() & 0o777, 0o640);
    }

    #[test]
    fn excluded_file_is_not_archived() {
        let dir = sample_tree();
        let staged = dir.path().join("tmp_02-01-2006_15:04:05.tar.gz");
        fs::write(&staged, "partial archive").unwrap();
        let mut out = Vec::new();

        let stats = write_archive_excluding(dir.path(), &[staged], vec![&mut out]).unwrap();

        let names: Vec<_> = unpack(&out).into_keys().collect();
        assert_eq!(names, vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
        assert_eq!(stats.files, 2);
    }

    #[test]
    fn sized_reader_rejects_short_content() {
        let mut reader = SizedReader::new(&b"abc"[..], 5);
        let mut buf = Vec::new();
        let err = reader.read_to_end(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn sized_reader_stops_at_declared_length() {
        let mut reader = SizedReader::new(&b"abcdef"[..], 4);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"abcd");
    }

    #[test]
    fn file_shrinking_during_copy_fails_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "0123456789").unwrap();
        let declared = fs::metadata(&path).unwrap().len();
        // Truncated after its size was read, as a concurrent writer would.
        fs::write(&path, "0123").unwrap();

        let mut header = Header::new_gnu();
        header.set_size(declared);
        let mut tar = Builder::new(Vec::new());
        let file = File::open(&path).unwrap();
        let err = tar
            .append_data(&mut header, "log.txt", SizedReader::new(file, declared))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(unix)]
    fn lock_down(path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o000)).unwrap();
        // Root ignores permission bits; nothing to test then.
        let readable = if path.is_dir() {
            fs::read_dir(path).is_ok()
        } else {
            File::open(path).is_ok()
        };
        !readable
    }

    #[cfg(unix)]
    fn unlock(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_aborts_walk() {
        let dir = sample_tree();
        let locked = dir.path().join("sub");
        if !lock_down(&locked) {
            unlock(&locked, 0o755);
            return;
        }
        let mut out = Vec::new();

        let result = write_archive(dir.path(), vec![&mut out]);

        unlock(&locked, 0o755);
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to walk directory"));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_aborts_walk() {
        let dir = sample_tree();
        let locked = dir.path().join("a.txt");
        if !lock_down(&locked) {
            return;
        }
        let mut out = Vec::new();

        let result = write_archive(dir.path(), vec![&mut out]);

        unlock(&locked, 0o644);
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to open file"));
    }

    #[test]
    fn entry_name_strips_root_and_separator() {
        let name = entry_name(Path::new("/a/b"), Path::new("/a/b/c/d.txt")).unwrap();
        assert_eq!(name, PathBuf::from("c/d.txt"));

        let name = entry_name(Path::new("/a/b/"), Path::new("/a/b/c/d.txt")).unwrap();
        assert_eq!(name, PathBuf::from("c/d.txt"));
    }

    #[test]
    fn entry_name_for_relative_root() {
        let name = entry_name(Path::new("."), Path::new("./x/y.bin")).unwrap();
        assert_eq!(name, PathBuf::from("x/y.bin"));
    }
}
