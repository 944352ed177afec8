//! Wire framing shared by every channel: `[channel u8][len u32 BE][payload]`.
//! Payloads are CBOR encoded by the reactor that owns the channel.

use crate::error::SwitchError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Reserved for the handshake; reactors may not claim it.
pub const HANDSHAKE_CHANNEL: u8 = 0xff;

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, SwitchError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(msg, &mut bytes)?;
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SwitchError> {
    Ok(ciborium::from_reader(bytes)?)
}

pub async fn send_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    channel: u8,
    payload: &[u8],
) -> Result<(), SwitchError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(SwitchError::FrameTooLarge(payload.len()));
    }
    let mut header = [0u8; 5];
    header[0] = channel;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn receive_frame(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<(u8, Vec<u8>), SwitchError> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[1..]);
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SwitchError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((header[0], payload))
}
