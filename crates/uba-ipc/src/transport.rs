//! Request/reply transport to the session.
//!
//! Frames are a little-endian `u32` payload length followed by the payload.

use crate::IpcError;
use std::io::{Read, Write};

/// Largest frame either side accepts.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Delivers one encoded request and blocks for its reply.
pub trait Transport: Send {
    fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, IpcError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, IpcError> {
        (**self).call(request)
    }
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), IpcError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, IpcError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(unix)]
pub use unix::UnixTransport;

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use tracing::debug;

    /// Blocking transport over a Unix domain socket.
    pub struct UnixTransport {
        stream: UnixStream,
        path: PathBuf,
    }

    impl UnixTransport {
        pub fn connect(path: &Path) -> Result<Self, IpcError> {
            let stream = UnixStream::connect(path)
                .map_err(|e| IpcError::Unavailable(format!("{}: {}", path.display(), e)))?;
            debug!(socket = %path.display(), "Connected to session");
            Ok(Self {
                stream,
                path: path.to_path_buf(),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Transport for UnixTransport {
        fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, IpcError> {
            write_frame(&mut self.stream, request)?;
            read_frame(&mut self.stream)
        }
    }
}

#[cfg(feature = "tokio")]
pub mod async_frame {
    use super::{IpcError, MAX_FRAME_SIZE};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Read one frame; `Ok(None)` on a clean disconnect between frames.
    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, IpcError> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }

    pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), IpcError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge(payload.len()));
        }
        writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }
}
