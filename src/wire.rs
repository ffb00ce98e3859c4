//! Framing for the TCP sockets that substitute for the original's ZeroMQ
//! multipart sockets (see DESIGN.md "Open Questions" for why). Each
//! logical multipart message is a 4-byte big-endian frame count followed
//! by that many `(4-byte length, payload)` frames, so `[stream, topic,
//! body]` and `[key, json]` round-trip exactly as spec.md section 6
//! describes them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub async fn write_frames<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frames: &[&[u8]],
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    writer.write_all(&buf).await
}

pub async fn read_frames<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<Bytes>>> {
    let count = match reader.read_u32().await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        let mut payload = BytesMut::zeroed(len);
        reader.read_exact(&mut payload).await?;
        frames.push(payload.freeze());
    }
    Ok(Some(frames))
}

/// Decodes a previously-framed buffer in memory (used by tests and by the
/// tester binary, which builds frames without a live socket).
pub fn encode_frames(frames: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    buf.freeze()
}

pub fn decode_frames(mut bytes: Bytes) -> Vec<Bytes> {
    let count = bytes.get_u32();
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = bytes.get_u32() as usize;
        frames.push(bytes.split_to(len));
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_three_frames() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frames(&mut client, &[b"shop-production", b"logs", b"{}"])
            .await
            .unwrap();
        drop(client);
        let frames = read_frames(&mut server).await.unwrap().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"shop-production");
        assert_eq!(&frames[1][..], b"logs");
    }

    #[test]
    fn in_memory_encode_decode() {
        let encoded = encode_frames(&[b"key", b"json"]);
        let frames = decode_frames(encoded);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"key");
    }
}
