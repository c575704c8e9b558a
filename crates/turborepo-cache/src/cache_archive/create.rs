use std::{
    fs,
    fs::OpenOptions,
    io::{BufWriter, Read, Write},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use tar::{EntryType, Header};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};

use crate::CacheError;

/// Default zstd compression level. Not baked into call sites so benchmarks
/// can sweep it.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Atomic counter to keep temp filenames unique within a single process.
/// Combined with the pid this guarantees uniqueness across concurrent
/// tasks and processes.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_temp_path(final_path: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
    let file_name = final_path.file_name().unwrap_or("cache");
    let unique_id = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(".{}.{}.{}.tmp", file_name, std::process::id(), unique_id);
    final_path
        .parent()
        .expect("cache path must have parent")
        .join_component(&temp_name)
}

/// A writer for creating cache archives.
///
/// When created via [`CacheWriter::create`], bytes go to a temporary file
/// which is atomically renamed to the final path on
/// [`CacheWriter::finish`], so concurrent readers see either the complete
/// old archive or the complete new one, never a partial write. `Drop`
/// cleans the temp file up if `finish` never ran.
pub struct CacheWriter<'a> {
    builder: tar::Builder<Box<dyn Write + 'a>>,
    temp_path: Option<AbsoluteSystemPathBuf>,
    final_path: Option<AbsoluteSystemPathBuf>,
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            // Best effort; we may be unwinding or the rename already ran.
            let _ = temp_path.remove_file();
        }
    }
}

impl<'a> CacheWriter<'a> {
    pub fn from_writer(writer: impl Write + 'a, use_compression: bool) -> Result<Self, CacheError> {
        Self::from_writer_with_level(writer, use_compression, DEFAULT_COMPRESSION_LEVEL)
    }

    pub fn from_writer_with_level(
        writer: impl Write + 'a,
        use_compression: bool,
        level: i32,
    ) -> Result<Self, CacheError> {
        let writer: Box<dyn Write> = if use_compression {
            Box::new(zstd::Encoder::new(writer, level)?.auto_finish())
        } else {
            Box::new(writer)
        };
        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            temp_path: None,
            final_path: None,
        })
    }

    // Makes a new cache archive at the specified path, wiring up the chain
    // of writers: tar::Builder -> zstd::Encoder (optional) -> BufWriter ->
    // File
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let temp_path = generate_temp_path(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);

        let file = temp_path.open_with_options(options)?;

        // Flush to disk in 1mb chunks.
        let file_buffer = BufWriter::with_capacity(2usize.pow(20), file);

        let is_compressed = path.extension() == Some("zst");

        let writer: Box<dyn Write> = if is_compressed {
            Box::new(zstd::Encoder::new(file_buffer, DEFAULT_COMPRESSION_LEVEL)?.auto_finish())
        } else {
            Box::new(file_buffer)
        };

        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            temp_path: Some(temp_path),
            final_path: Some(path.to_owned()),
        })
    }

    /// Finish writing the archive and atomically move it into place.
    pub fn finish(mut self) -> Result<(), CacheError> {
        // Writes the tar footer; the zstd encoder finalizes on drop via
        // auto_finish.
        self.builder.finish()?;

        // Take the paths before the rename so Drop doesn't delete the
        // renamed file; if the rename fails, Drop still cleans up.
        if let (Some(temp_path), Some(final_path)) =
            (self.temp_path.take(), self.final_path.take())
        {
            temp_path.rename(&final_path)?;
        }

        Ok(())
    }

    // Adds a user-cached item to the tar
    pub(crate) fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        // Resolve the fully-qualified path to the file to read it.
        let source_path = anchor.resolve(file_path);

        // Grab the file info to construct the header.
        let file_info = source_path.symlink_metadata()?;

        // Paths in the archive are always unix-delimited.
        let mut file_path = file_path.to_unix();
        file_path.make_canonical_for_tar(file_info.is_dir());

        let mut header = Self::create_header(&file_info)?;

        if matches!(header.entry_type(), EntryType::Regular) && file_info.len() > 0 {
            let file = source_path.open()?;
            self.append_data(&mut header, file_path.as_str(), file)?;
        } else if matches!(header.entry_type(), EntryType::Symlink) {
            let target = source_path.read_link()?;
            self.append_link(&mut header, file_path.as_str(), &target)?;
        } else {
            self.append_data(&mut header, file_path.as_str(), &mut std::io::empty())?;
        }

        Ok(())
    }

    fn create_header(file_info: &fs::Metadata) -> Result<Header, CacheError> {
        let mut header = Header::new_gnu();

        let mode: u32;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            mode = file_info.mode();
        }
        #[cfg(windows)]
        {
            // Windows makes up 0o666 for files; match the permissive
            // default artifacts restore with elsewhere.
            mode = 0o755;
        }
        header.set_mode(mode);

        if file_info.is_symlink() {
            // The link name is set by append_link since it can exceed the
            // fixed-size header field.
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
        } else if file_info.is_dir() {
            header.set_size(0);
            header.set_entry_type(EntryType::Directory);
        } else if file_info.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(file_info.len());
        } else {
            return Err(CacheError::CreateUnsupportedFileType);
        }

        // Consistent creation: identical inputs must produce identical
        // archive bytes.
        header.set_uid(0);
        header.set_gid(0);
        header.as_gnu_mut().unwrap().set_atime(0);
        header.set_mtime(0);
        header.as_gnu_mut().unwrap().set_ctime(0);

        Ok(header)
    }

    fn append_data(
        &mut self,
        header: &mut Header,
        path: impl AsRef<Path>,
        body: impl Read,
    ) -> Result<(), CacheError> {
        Ok(self.builder.append_data(header, path, body)?)
    }

    fn append_link(
        &mut self,
        header: &mut Header,
        path: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<(), CacheError> {
        Ok(self.builder.append_link(header, path, target)?)
    }
}
