use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Envelope;

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(u32),
}

/// Write one envelope as a big-endian `u32` length followed by its postcard encoding.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = postcard::to_stdvec(envelope)?;
    let len = u32::try_from(bytes.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    writer.write_u32(len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;

    Ok(postcard::from_bytes(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageId, WireMessage};

    #[tokio::test]
    async fn rejects_oversized_length_prefix() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME_LEN + 1).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Envelope {
            msg_id: MessageId::new(),
            reply_to: None,
            payload: WireMessage::Ping,
        };

        write_frame(&mut a, &sent).await.unwrap();
        let got = read_frame(&mut b).await.unwrap();

        assert_eq!(got.msg_id, sent.msg_id);
        assert!(matches!(got.payload, WireMessage::Ping));
    }
}
