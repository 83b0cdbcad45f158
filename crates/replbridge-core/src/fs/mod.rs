//! Remote filesystem
//!
//! Filesystem operations on the target, expressed as generated statements run
//! through a [`CodeRunner`] and decoded from their printed output. File content
//! travels as base64 in chunks of the configured size.

pub mod snippets;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::{output::strip_ansi, CodeRunner, ReplError};

/// Directory bit of a `stat` mode
pub const S_IFDIR: u32 = 0x4000;

/// One directory entry or `stat` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name, or the full path for `stat` results
    pub name: String,
    /// Size in bytes; 0 for directories
    pub size: u64,
    /// Whether the mode has the directory bit
    pub is_directory: bool,
}

/// Progress callback: `(bytes_done, bytes_total)`
pub type Progress<'a> = Option<&'a mut dyn FnMut(u64, u64)>;

/// Filesystem codec over any [`CodeRunner`]
pub struct RemoteFs<R> {
    runner: R,
    chunk_size: usize,
}

impl<R: CodeRunner> RemoteFs<R> {
    /// Wrap `runner`; transfers move `chunk_size` bytes per statement
    pub fn new(runner: R, chunk_size: usize) -> Self {
        Self {
            runner,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Bytes per transfer statement
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The underlying runner
    pub fn runner(&mut self) -> &mut R {
        &mut self.runner
    }

    /// Give back the runner
    pub fn into_inner(self) -> R {
        self.runner
    }

    fn run(&mut self, code: &str) -> Result<String, ReplError> {
        self.runner.run(code)
    }

    /// List a directory; an empty path means the root
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<FileInfo>, ReplError> {
        let path = if path.is_empty() { "/" } else { path };
        let output = self.run(&snippets::list_dir(path))?;
        let output = strip_ansi(&output).replace('\r', "");
        Ok(output.lines().filter_map(parse_entry).collect())
    }

    /// `stat` a path
    pub fn get_file_info(&mut self, path: &str) -> Result<FileInfo, ReplError> {
        let output = self.run(&snippets::stat(path))?;
        let mut fields = output.split_whitespace().map(str::parse::<u64>);
        match (fields.next(), fields.next()) {
            (Some(Ok(mode)), Some(Ok(size))) => Ok(FileInfo {
                name: path.to_string(),
                size,
                is_directory: mode & S_IFDIR as u64 != 0,
            }),
            _ => Err(ReplError::Execution(format!(
                "failed to parse file info for {}: {:?}",
                path, output
            ))),
        }
    }

    /// Whether `stat` succeeds on `path`
    pub fn exists(&mut self, path: &str) -> Result<bool, ReplError> {
        let output = self.run(&snippets::exists(path))?;
        Ok(output.trim_start().starts_with('1'))
    }

    /// Read a whole file.
    ///
    /// There is no end marker: a chunk shorter than the chunk size (or an
    /// empty one) ends the transfer.
    pub fn read_file_raw(&mut self, path: &str) -> Result<Vec<u8>, ReplError> {
        self.get_file_info(path)?;
        self.run(&snippets::open_read(path))?;

        let transfer = self.read_chunks();
        let closed = self.run(snippets::close());
        let content = transfer?;
        closed?;
        tracing::debug!("Read {} bytes from {}", content.len(), path);
        Ok(content)
    }

    fn read_chunks(&mut self) -> Result<Vec<u8>, ReplError> {
        let mut content = Vec::new();
        let request = snippets::read_chunk(self.chunk_size);
        loop {
            let output = self.run(&request)?;
            let output = output.trim();
            if output.is_empty() || output == "None" {
                break;
            }
            let chunk = decode_base64(output)?;
            content.extend_from_slice(&chunk);
            if chunk.len() < self.chunk_size {
                break;
            }
        }
        Ok(content)
    }

    /// Replace a file's content
    pub fn write_file_raw(&mut self, path: &str, content: &[u8]) -> Result<(), ReplError> {
        self.write_file_chunk(path, content, false)
    }

    /// Write `content` to `path`, appending instead of truncating if `append` is set
    pub fn write_file_chunk(
        &mut self,
        path: &str,
        content: &[u8],
        append: bool,
    ) -> Result<(), ReplError> {
        self.run(&snippets::open_write(path, append))?;

        let mut transfer = Ok(());
        for chunk in content.chunks(self.chunk_size) {
            transfer = self
                .run(&snippets::write_chunk(&STANDARD.encode(chunk)))
                .map(|_| ());
            if transfer.is_err() {
                break;
            }
        }

        // Close regardless; a failed chunk takes precedence over a failed close
        let closed = self.run(snippets::close()).map(|_| ());
        transfer?;
        closed?;
        tracing::debug!("Wrote {} bytes to {}", content.len(), path);
        Ok(())
    }

    /// Read a file and return it base64-encoded
    pub fn read_file_base64(&mut self, path: &str) -> Result<String, ReplError> {
        Ok(STANDARD.encode(self.read_file_raw(path)?))
    }

    /// Write base64-encoded content
    pub fn write_file_base64(&mut self, path: &str, b64: &str) -> Result<(), ReplError> {
        let content = decode_base64(b64)?;
        self.write_file_raw(path, &content)
    }

    /// Remove a file
    pub fn delete_file(&mut self, path: &str) -> Result<(), ReplError> {
        self.run(&snippets::remove(path)).map(|_| ())
    }

    /// Create one directory level
    pub fn create_dir(&mut self, path: &str) -> Result<(), ReplError> {
        self.run(&snippets::mkdir(path)).map(|_| ())
    }

    /// Remove an empty directory
    pub fn delete_dir(&mut self, path: &str) -> Result<(), ReplError> {
        self.run(&snippets::rmdir(path)).map(|_| ())
    }

    /// Remove a directory and everything below it, depth first
    pub fn delete_dir_recursive(&mut self, path: &str) -> Result<(), ReplError> {
        if path == "/" || path == "//" {
            return Err(ReplError::InvalidArgument(
                "refusing to remove the root directory".to_string(),
            ));
        }
        for entry in self.list_dir(path)? {
            let child = join(path, &entry.name);
            if entry.is_directory {
                self.delete_dir_recursive(&child)?;
            } else {
                self.delete_file(&child)?;
            }
        }
        self.delete_dir(path)
    }

    /// Rename a file, copying through the host if the target has no working `os.rename`
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), ReplError> {
        if self.get_file_info(from)?.is_directory {
            return Err(ReplError::InvalidArgument(format!(
                "cannot rename directory {}",
                from
            )));
        }

        match self.run(&snippets::rename(from, to)) {
            Ok(out) if out.contains(snippets::RENAME_OK) => return Ok(()),
            Ok(_) => tracing::debug!("os.rename unavailable for {}, copying", from),
            Err(e) => tracing::debug!("os.rename failed for {} ({}), copying", from, e),
        }

        let content = self.read_file_raw(from)?;
        self.write_file_raw(to, &content)?;
        self.delete_file(from)
    }

    /// Create an empty file, or leave an existing one untouched
    pub fn touch(&mut self, path: &str) -> Result<(), ReplError> {
        self.run(&snippets::touch(path)).map(|_| ())
    }

    /// Copy a file on the target
    pub fn copy(&mut self, from: &str, to: &str) -> Result<(), ReplError> {
        self.run(&snippets::copy(from, to)).map(|_| ())
    }

    /// Copy a remote file to the local filesystem, returning its size
    pub fn download(
        &mut self,
        remote: &str,
        local: &Path,
        progress: Progress<'_>,
    ) -> Result<u64, ReplError> {
        let info = self.get_file_info(remote)?;
        let content = self.read_file_raw(remote)?;
        std::fs::write(local, &content)?;
        let done = content.len() as u64;
        if let Some(progress) = progress {
            progress(done, info.size);
        }
        tracing::info!("Downloaded {} -> {} ({} bytes)", remote, local.display(), done);
        Ok(done)
    }

    /// Copy a local file to the target, returning its size
    pub fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        progress: Progress<'_>,
    ) -> Result<u64, ReplError> {
        let content = std::fs::read(local)?;
        self.write_file_raw(remote, &content)?;
        let total = content.len() as u64;
        if let Some(progress) = progress {
            progress(total, total);
        }
        tracing::info!("Uploaded {} -> {} ({} bytes)", local.display(), remote, total);
        Ok(total)
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn parse_entry(line: &str) -> Option<FileInfo> {
    let mut parts = line.splitn(3, '|');
    let name = parts.next()?;
    let mode = parts.next()?.trim().parse::<u32>().unwrap_or(0);
    let size = parts.next()?.trim().parse::<u64>().unwrap_or(0);
    Some(FileInfo {
        name: name.to_string(),
        size,
        is_directory: mode & S_IFDIR != 0,
    })
}

fn decode_base64(text: &str) -> Result<Vec<u8>, ReplError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| ReplError::InvalidArgument(format!("invalid base64: {}", e)))
}
