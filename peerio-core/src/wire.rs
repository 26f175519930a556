//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// Upper bound on a single frame; sized for image payloads.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(msg)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the message and the
/// number of bytes consumed. Safe to call with a partial buffer: `NeedMore`
/// means wait for more data and try again.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameError::NeedMore);
    }
    let msg: Message = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_text() {
        let msg = Message::Text {
            body: "hello".into(),
        };
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        match decoded {
            Message::Text { body } => assert_eq!(body, "hello"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_image() {
        let msg = Message::Image {
            bytes: vec![0xff, 0xd8, 0xff, 0xe0, 1, 2, 3],
        };
        let frame = encode_frame(&msg).unwrap();
        let (decoded, _) = decode_frame(&frame).unwrap();
        match decoded {
            Message::Image { bytes } => assert_eq!(bytes, vec![0xff, 0xd8, 0xff, 0xe0, 1, 2, 3]),
            other => panic!("expected Image, got {other:?}"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&Message::Checked).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameError::NeedMore)
        ));
    }

    #[test]
    fn oversize_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_frame(&bytes), Err(FrameError::TooLarge)));
    }

    #[test]
    fn two_frames_back_to_back() {
        let fa = encode_frame(&Message::Checked).unwrap();
        let fb = encode_frame(&Message::Disconnect).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Message::Checked));
        assert!(matches!(m2, Message::Disconnect));
    }
}
