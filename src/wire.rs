//! Binary frame layer shared by both ends of a node connection.
//!
//! Every message on the wire is a single frame:
//!
//! ```text
//! ┌─────────┬──────────────┬────────────┐
//! │ slot u16 │ length u32   │ payload …  │   (big-endian header)
//! └─────────┴──────────────┴────────────┘
//! ```
//!
//! Slots below [`SLOT_DATA_MIN`] are reserved for control traffic: the two
//! handshake frames a new connection sends before any data, and the close
//! sentinel that drains the outbound queue during shutdown.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::RouterError;

/// Handshake frame 1: serialized sub-pipeline configuration.
pub const SLOT_CONFIG: u16 = 1;
/// Handshake frame 2: free-form parameter document.
pub const SLOT_PARAMETERS: u16 = 2;
/// Close sentinel; carries no payload.
pub const SLOT_CLOSE: u16 = 4;
/// First slot available to payload codecs; everything below is control.
pub const SLOT_DATA_MIN: u16 = 1000;

/// Maximum accepted frame payload: 64 MiB.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one frame.
///
/// The header and payload are coalesced into a single buffer so a frame is
/// always one `write_all` call.
///
/// # Errors
///
/// [`RouterError::FrameTooLarge`] if `payload` exceeds [`MAX_FRAME_LEN`],
/// [`RouterError::Io`] on transport failure.
pub async fn write_frame<W>(writer: &mut W, slot: u16, payload: &[u8]) -> Result<(), RouterError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(RouterError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(6 + payload.len());
    buf.put_u16(slot);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, returning its slot tag and payload.
///
/// # Errors
///
/// [`RouterError::FrameTooLarge`] if the declared length exceeds
/// [`MAX_FRAME_LEN`], [`RouterError::Io`] on transport failure (including
/// EOF mid-frame).
pub async fn read_frame<R>(reader: &mut R) -> Result<(u16, Bytes), RouterError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 6];
    reader.read_exact(&mut header).await?;

    let slot = u16::from_be_bytes([header[0], header[1]]);
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;

    if len > MAX_FRAME_LEN {
        return Err(RouterError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok((slot, Bytes::from(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        write_frame(&mut a, SLOT_DATA_MIN, b"payload bytes")
            .await
            .expect("write");

        let (slot, body) = read_frame(&mut b).await.expect("read");
        assert_eq!(slot, SLOT_DATA_MIN);
        assert_eq!(&body[..], b"payload bytes");
    }

    #[tokio::test]
    async fn test_zero_length_payload_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, SLOT_CLOSE, &[]).await.expect("write");

        let (slot, body) = read_frame(&mut b).await.expect("read");
        assert_eq!(slot, SLOT_CLOSE);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        for i in 0..5u16 {
            write_frame(&mut a, SLOT_DATA_MIN + i, &[i as u8])
                .await
                .expect("write");
        }

        for i in 0..5u16 {
            let (slot, body) = read_frame(&mut b).await.expect("read");
            assert_eq!(slot, SLOT_DATA_MIN + i);
            assert_eq!(body[0], i as u8);
        }
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let huge = vec![0u8; MAX_FRAME_LEN + 1];

        let err = write_frame(&mut a, SLOT_DATA_MIN, &huge).await;
        assert!(matches!(err, Err(RouterError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_declared_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // Forge a header declaring a payload beyond the limit.
        let mut header = BytesMut::new();
        header.put_u16(SLOT_DATA_MIN);
        header.put_u32((MAX_FRAME_LEN as u32) + 1);
        a.write_all(&header).await.expect("raw write");

        let err = read_frame(&mut b).await;
        assert!(matches!(err, Err(RouterError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let mut header = BytesMut::new();
        header.put_u16(SLOT_DATA_MIN);
        header.put_u32(10);
        a.write_all(&header).await.expect("raw write");
        a.write_all(b"short").await.expect("raw write");
        drop(a); // EOF before the remaining 5 bytes

        let err = read_frame(&mut b).await;
        assert!(matches!(err, Err(RouterError::Io(_))));
    }

    #[test]
    fn test_control_slots_below_data_range() {
        assert!(SLOT_CONFIG < SLOT_DATA_MIN);
        assert!(SLOT_PARAMETERS < SLOT_DATA_MIN);
        assert!(SLOT_CLOSE < SLOT_DATA_MIN);
    }
}
