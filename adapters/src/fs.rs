//! Local files through `tokio::fs`.

use corehost_runtime::{FileSystem, HostFut, HostStream};
use corehost_types::{Errno, FileOpenFlags};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Largest buffer one read allocates, however much the caller asks for.
const MAX_READ_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFs;

impl FileSystem for TokioFs {
    fn exists<'a>(&'a self, path: &'a str) -> HostFut<'a, bool> {
        Box::pin(async move { fs::try_exists(path).await.unwrap_or(false) })
    }

    fn open<'a>(
        &'a self,
        path: &'a str,
        flags: FileOpenFlags,
    ) -> HostFut<'a, Result<Box<dyn HostStream>, Errno>> {
        Box::pin(async move {
            let file = open_options(flags).open(path).await.map_err(|err| {
                debug!(path, error = %err, "file open failed");
                Errno::from(&err)
            })?;
            Ok(Box::new(FileStream { file: Some(file) }) as Box<dyn HostStream>)
        })
    }
}

fn open_options(flags: FileOpenFlags) -> OpenOptions {
    let mut options = OpenOptions::new();
    options
        .read(flags.read)
        .write(flags.write)
        .append(flags.append)
        .truncate(flags.truncate)
        .create(flags.create)
        .create_new(flags.create_new);
    options
}

/// An open file. Closing drops the handle; later calls fail with `EBADF`.
struct FileStream {
    file: Option<File>,
}

impl FileStream {
    fn file(&mut self) -> Result<&mut File, Errno> {
        self.file.as_mut().ok_or(Errno::BadF)
    }
}

impl HostStream for FileStream {
    fn read(&mut self, max: usize) -> HostFut<'_, Result<Vec<u8>, Errno>> {
        Box::pin(async move {
            let file = self.file()?;
            let mut buf = vec![0; max.min(MAX_READ_CHUNK)];
            let n = file.read(&mut buf).await.map_err(|err| Errno::from(&err))?;
            buf.truncate(n);
            Ok(buf)
        })
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> HostFut<'a, Result<usize, Errno>> {
        Box::pin(async move {
            let file = self.file()?;
            file.write(data).await.map_err(|err| Errno::from(&err))
        })
    }

    fn close(&mut self) -> HostFut<'_, Result<(), Errno>> {
        Box::pin(async move {
            let mut file = self.file.take().ok_or(Errno::BadF)?;
            file.flush().await.map_err(|err| Errno::from(&err))
        })
    }
}
