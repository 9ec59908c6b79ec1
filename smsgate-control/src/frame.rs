//! Length-prefixed bincode frames shared by the client and server.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ControlError, Result};

/// Largest request the server will read.
pub const MAX_REQUEST_SIZE: u32 = 1_000_000;
/// Largest response the client will read.
pub const MAX_RESPONSE_SIZE: u32 = 10_000_000;

/// Read one frame: a 4-byte big-endian length, then that many bincode bytes.
///
/// A peer hanging up before the length prefix is reported as
/// [`ControlError::ConnectionClosed`].
pub async fn read<T, S>(stream: &mut S, max: u32) -> Result<T>
where
    T: DeserializeOwned,
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(len_buf);
    if len > max {
        return Err(ControlError::Protocol(format!(
            "Frame too large: {len} bytes (max {max})"
        )));
    }

    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;

    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
    Ok(value)
}

pub async fn write<T, S>(stream: &mut S, value: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncWrite + Unpin,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let len = u32::try_from(bytes.len())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
