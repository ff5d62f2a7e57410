use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{HEADER_LEN, MAX_BODY_LEN, MessageType, NodeId, WireError};

/// A decoded frame: header fields plus the raw body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub sender: NodeId,
    pub(crate) body: Bytes,
}

impl Frame {
    /// Build a frame, rejecting bodies that do not fit in one frame.
    pub fn new(kind: MessageType, sender: NodeId, body: impl Into<Bytes>) -> Result<Self, WireError> {
        let body = body.into();
        if body.len() > MAX_BODY_LEN {
            return Err(WireError::BodyTooLong { len: body.len() });
        }
        Ok(Self { kind, sender, body })
    }

    pub fn empty(kind: MessageType, sender: NodeId) -> Self {
        Self {
            kind,
            sender,
            body: Bytes::new(),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Value of the `total_length` header byte.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Serialize header and body into a contiguous buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.total_len());
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(self.total_len() as u8);
        buf.put_u8(self.sender.as_u8());
        buf.put_slice(&self.body);
        buf
    }
}

/// Encode a message from its parts.
///
/// A body longer than [`MAX_BODY_LEN`] is a caller error.
pub fn encode(kind: MessageType, sender: NodeId, body: &[u8]) -> Result<BytesMut, WireError> {
    Ok(Frame::new(kind, sender, Bytes::copy_from_slice(body))?.encode())
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed. An incomplete buffer
/// is [`WireError::Truncated`]; an empty one is [`WireError::ConnectionClosed`].
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), WireError> {
    if buf.is_empty() {
        return Err(WireError::ConnectionClosed);
    }
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let header = [buf[0], buf[1], buf[2]];
    let body_len = body_len(&header)?;
    let total = HEADER_LEN + body_len;
    if buf.len() < total {
        return Err(WireError::Truncated);
    }
    let frame = finish(header, Bytes::copy_from_slice(&buf[HEADER_LEN..total]))?;
    Ok((frame, total))
}

fn body_len(header: &[u8; HEADER_LEN]) -> Result<usize, WireError> {
    let total = header[1] as usize;
    if total < HEADER_LEN {
        return Err(WireError::BadLength(header[1]));
    }
    Ok(total - HEADER_LEN)
}

fn finish(header: [u8; HEADER_LEN], body: Bytes) -> Result<Frame, WireError> {
    let kind = MessageType::from_u8(header[0]).ok_or(WireError::InvalidMessage {
        kind: header[0],
        sender: header[2],
    })?;
    Ok(Frame {
        kind,
        sender: NodeId(header[2]),
        body,
    })
}

/// Read exactly one frame from the stream.
///
/// `read_exact` keeps looping over short reads; only EOF is an error. The
/// body of a frame with an unknown type is still consumed so the stream stays
/// aligned on frame boundaries.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WireError> {
    let mut header = [0u8; HEADER_LEN];

    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }
    read_exact_or_truncated(reader, &mut header[1..]).await?;

    let body_len = body_len(&header)?;
    let body = if body_len > 0 {
        let mut body = BytesMut::zeroed(body_len);
        read_exact_or_truncated(reader, &mut body).await?;
        body.freeze()
    } else {
        Bytes::new()
    };

    let frame = finish(header, body)?;
    tracing::trace!(kind = %frame.kind, sender = %frame.sender, len = frame.total_len(), "frame received");
    Ok(frame)
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), WireError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::Truncated),
        Err(e) => Err(WireError::Io(e)),
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), WireError> {
    let buf = frame.encode();
    writer.write_all(&buf).await?;
    writer.flush().await?;
    tracing::trace!(kind = %frame.kind, sender = %frame.sender, len = buf.len(), "frame sent");
    Ok(())
}
