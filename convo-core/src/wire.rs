//! Broker link framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! The TCP link between [`crate::remote::RemoteConnection`] and the `convo-broker` daemon
//! carries [`Frame`]s. Requests are answered by a reply with the same id; deliveries are pushed
//! unsolicited and tagged with the client-chosen consumer id.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::header::Headers;
use crate::transport::{Delivery, ExchangeKind, PublishOptions, QueueOptions, QueueStats, TransportError};

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 17 * 1024 * 1024; // 17 MiB
/// Room a frame needs beyond its message body (headers, names, bincode framing).
pub const FRAME_OVERHEAD: usize = 1024 * 1024;

/// One broker operation, executed on the channel named in the enclosing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    OpenChannel,
    CloseChannel,
    DeclareExchange {
        exchange: String,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    },
    DeleteExchange {
        exchange: String,
    },
    DeclareQueue {
        queue: String,
        options: QueueOptions,
    },
    DeleteQueue {
        queue: String,
    },
    Bind {
        exchange: String,
        queue: String,
        binding: String,
    },
    Unbind {
        exchange: String,
        queue: String,
        binding: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        headers: Headers,
        options: PublishOptions,
    },
    /// `consumer` is chosen by the client and tags every resulting delivery.
    Consume {
        consumer: u64,
        queue: String,
        no_ack: bool,
        exclusive: bool,
    },
    Cancel {
        consumer_tag: String,
    },
    ConsumerActive {
        consumer_tag: String,
    },
    Ack {
        delivery_tag: u64,
    },
    Reject {
        delivery_tag: u64,
        requeue: bool,
    },
    QueueStats {
        queue: String,
    },
    Purge {
        queue: String,
    },
}

/// Successful result of an [`Op`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Channel(u16),
    Queue(String),
    ConsumerTag(String),
    Active(bool),
    Stats(QueueStats),
    Purged(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Request {
        id: u64,
        channel: u16,
        op: Op,
    },
    /// `channel_open` is false once the broker has closed the channel (on error or request).
    Reply {
        id: u64,
        result: Result<Reply, TransportError>,
        channel_open: bool,
    },
    Deliver {
        consumer: u64,
        delivery: Delivery,
    },
}

/// Encode a frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with a partial buffer; `NeedMore` means try again after more data.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame: Frame =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((frame, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Read one frame from a stream. `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!("frame of {} bytes too large", len)));
    }
    let mut buf = vec![0u8; LEN_SIZE + len as usize];
    buf[..LEN_SIZE].copy_from_slice(&len_buf);
    reader.read_exact(&mut buf[LEN_SIZE..]).await?;
    let (frame, _) = decode_frame(&buf).map_err(|e| TransportError::Protocol(e.to_string()))?;
    Ok(Some(frame))
}

impl From<FrameEncodeError> for TransportError {
    fn from(e: FrameEncodeError) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

/// Write one frame already produced by [`encode_frame`] and flush.
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_publish() -> Frame {
        let mut headers = Headers::new();
        headers.insert("conv-id".into(), "c-1".into());
        Frame::Request {
            id: 7,
            channel: 3,
            op: Op::Publish {
                exchange: "sys".into(),
                routing_key: "sys.alice".into(),
                body: b"hello".to_vec(),
                headers,
                options: PublishOptions::default(),
            },
        }
    }

    #[test]
    fn roundtrip_request() {
        let frame = sample_publish();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&sample_publish()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversize_length_prefix_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn oversize_frame_fails_to_encode() {
        let frame = Frame::Request {
            id: 1,
            channel: 1,
            op: Op::Publish {
                exchange: "ex".into(),
                routing_key: "k".into(),
                body: vec![0; MAX_FRAME_LEN as usize],
                headers: Headers::new(),
                options: PublishOptions::default(),
            },
        };
        let err = encode_frame(&frame).unwrap_err();
        assert!(matches!(err, FrameEncodeError::TooLarge));
        assert!(matches!(TransportError::from(err), TransportError::Protocol(_)));
    }

    #[test]
    fn error_reply_survives_encoding() {
        let frame = Frame::Reply {
            id: 1,
            result: Err(TransportError::NotFound {
                kind: "exchange".into(),
                name: "missing".into(),
            }),
            channel_open: false,
        };
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, _) = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn stream_helpers_handle_back_to_back_frames() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let first = sample_publish();
        let second = Frame::Reply {
            id: 7,
            result: Ok(Reply::Done),
            channel_open: true,
        };
        write_frame(&mut a, &encode_frame(&first).unwrap()).await.unwrap();
        write_frame(&mut a, &encode_frame(&second).unwrap()).await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }
}
