use byteorder::{ByteOrder, LittleEndian};
use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{error::HandshakeError, node::NodeId};

/// Largest handshake frame body we are willing to read. Handshake messages are
/// a handful of bytes; anything bigger is not one of ours.
pub const MAX_FRAME_LEN: u32 = 1024;

/// Messages exchanged once, right after a TCP connection is opened, so that
/// both ends learn who is on the other side.
///
/// The initiator sends `Hello`, the acceptor answers `Welcome`, or `Refused`
/// when it already holds (or is about to hold) a link to that peer. Nothing is
/// defined for the stream after that.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum HandshakeMessage {
    /// Sent by the dialing node.
    Hello { node_id: NodeId, listen_port: u16 },
    /// Sent back by the accepting node.
    Welcome { node_id: NodeId },
    /// Sent back by the accepting node when the pair is already linked.
    Refused { node_id: NodeId },
}

impl HandshakeMessage {
    pub fn encode(&self) -> Result<AlignedVec, HandshakeError> {
        to_bytes::<_, 64>(self).map_err(|_| HandshakeError::CouldNotEncodeMessage)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HandshakeError> {
        // archived roots must be aligned, frame bodies read off the socket
        // are not guaranteed to be
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        from_bytes::<HandshakeMessage>(aligned.as_slice())
            .map_err(|_| HandshakeError::CouldNotDecodeMessage)
    }
}

/// A stream during the handshake phase. Frames are a little endian `u32`
/// length followed by the archived message.
pub struct HandshakeStream<S>(S);

impl<S> HandshakeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self(stream)
    }

    pub async fn send(
        &mut self,
        msg: &HandshakeMessage,
    ) -> Result<(), HandshakeError> {
        let msg = msg.encode()?;
        let len = u32::try_from(msg.len())
            .map_err(|_| HandshakeError::MessageLengthOverflowed(u32::MAX))?;
        if len > MAX_FRAME_LEN {
            return Err(HandshakeError::MessageLengthOverflowed(len));
        }
        let mut buf = vec![0u8; 4];
        LittleEndian::write_u32(&mut buf, len);
        buf.extend_from_slice(&msg);
        self.0.write_all(&buf).await?;
        self.0.flush().await?;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        let mut len_buf = [0u8; 4];
        self.0.read_exact(&mut len_buf).await?;
        let len = LittleEndian::read_u32(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(HandshakeError::MessageLengthOverflowed(len));
        }
        let mut msg_buf = vec![0u8; len as usize];
        self.0.read_exact(&mut msg_buf).await?;
        HandshakeMessage::decode(&msg_buf)
    }

    /// Hands the stream back once the handshake is over.
    pub fn into_inner(self) -> S {
        self.0
    }
}

/// Initiator side: announce ourselves and check that the node that answers is
/// the one we meant to reach. A refusal comes back as
/// `HandshakeError::Refused`.
pub async fn initiate<S>(
    stream: &mut HandshakeStream<S>,
    our_id: NodeId,
    our_port: u16,
    expected_peer: NodeId,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .send(&HandshakeMessage::Hello {
            node_id: our_id,
            listen_port: our_port,
        })
        .await?;
    match stream.receive().await? {
        HandshakeMessage::Welcome { node_id } if node_id == expected_peer => Ok(()),
        HandshakeMessage::Welcome { node_id } => Err(HandshakeError::PeerIdMismatch {
            expected: expected_peer,
            got: node_id,
        }),
        HandshakeMessage::Refused { node_id } => Err(HandshakeError::Refused(node_id)),
        other => Err(HandshakeError::ReceivedBadHandshakeMessage(other)),
    }
}

/// Acceptor side, first half: wait for the dialing node to say who it is.
/// Returns the peer's id and advertised listen port.
pub async fn receive_hello<S>(
    stream: &mut HandshakeStream<S>,
) -> Result<(NodeId, u16), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.receive().await? {
        HandshakeMessage::Hello {
            node_id,
            listen_port,
        } => Ok((node_id, listen_port)),
        other => Err(HandshakeError::ReceivedBadHandshakeMessage(other)),
    }
}

/// Acceptor side, second half: confirm our identity to the dialing node.
pub async fn send_welcome<S>(
    stream: &mut HandshakeStream<S>,
    our_id: NodeId,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .send(&HandshakeMessage::Welcome { node_id: our_id })
        .await
}

/// Acceptor side, turning the dialing node away.
pub async fn send_refusal<S>(
    stream: &mut HandshakeStream<S>,
    our_id: NodeId,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .send(&HandshakeMessage::Refused { node_id: our_id })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn hello_and_welcome_complete_a_handshake() {
        let (a, b) = duplex(256);
        let mut initiator = HandshakeStream::new(a);
        let mut acceptor = HandshakeStream::new(b);

        let accept = tokio::spawn(async move {
            let hello = receive_hello(&mut acceptor).await?;
            send_welcome(&mut acceptor, 0).await?;
            Ok::<_, HandshakeError>(hello)
        });

        initiate(&mut initiator, 3, 7003, 0).await.unwrap();
        assert_eq!(accept.await.unwrap().unwrap(), (3, 7003));
    }

    #[tokio::test]
    async fn wrong_peer_answering_is_rejected() {
        let (a, b) = duplex(256);
        let mut initiator = HandshakeStream::new(a);
        let mut acceptor = HandshakeStream::new(b);

        tokio::spawn(async move {
            receive_hello(&mut acceptor).await?;
            send_welcome(&mut acceptor, 2).await
        });

        match initiate(&mut initiator, 3, 7003, 1).await {
            Err(HandshakeError::PeerIdMismatch { expected, got }) => {
                assert_eq!((expected, got), (1, 2));
            }
            other => panic!("expected a peer id mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refusal_is_reported_to_the_dialer() {
        let (a, b) = duplex(256);
        let mut initiator = HandshakeStream::new(a);
        let mut acceptor = HandshakeStream::new(b);

        tokio::spawn(async move {
            receive_hello(&mut acceptor).await?;
            send_refusal(&mut acceptor, 0).await
        });

        assert!(matches!(
            initiate(&mut initiator, 1, 7001, 0).await,
            Err(HandshakeError::Refused(0))
        ));
    }

    #[tokio::test]
    async fn frame_prefix_is_little_endian_length() {
        let (a, mut raw) = duplex(256);
        let mut stream = HandshakeStream::new(a);
        let msg = HandshakeMessage::Welcome { node_id: 7 };
        stream.send(&msg).await.unwrap();

        let mut len_buf = [0u8; 4];
        raw.read_exact(&mut len_buf).await.unwrap();
        let len = LittleEndian::read_u32(&len_buf) as usize;
        assert_eq!(len, msg.encode().unwrap().len());
        let mut body = vec![0u8; len];
        raw.read_exact(&mut body).await.unwrap();
        assert_eq!(HandshakeMessage::decode(&body).unwrap(), msg);
    }

    #[tokio::test]
    async fn hello_where_welcome_is_expected_is_a_bad_message() {
        let (a, b) = duplex(256);
        let mut initiator = HandshakeStream::new(a);
        let mut confused = HandshakeStream::new(b);

        tokio::spawn(async move {
            receive_hello(&mut confused).await?;
            confused
                .send(&HandshakeMessage::Hello {
                    node_id: 0,
                    listen_port: 7000,
                })
                .await
        });

        assert!(matches!(
            initiate(&mut initiator, 1, 7001, 0).await,
            Err(HandshakeError::ReceivedBadHandshakeMessage(
                HandshakeMessage::Hello { node_id: 0, .. }
            ))
        ));
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_before_reading_the_body() {
        let (mut raw, b) = duplex(64);
        let mut stream = HandshakeStream::new(b);
        raw.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();

        assert!(matches!(
            stream.receive().await,
            Err(HandshakeError::MessageLengthOverflowed(len)) if len == MAX_FRAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn garbage_payload_does_not_decode() {
        let (mut raw, b) = duplex(64);
        let mut stream = HandshakeStream::new(b);
        raw.write_all(&3u32.to_le_bytes()).await.unwrap();
        raw.write_all(&[0xff, 0xff, 0xff]).await.unwrap();

        assert!(matches!(
            stream.receive().await,
            Err(HandshakeError::CouldNotDecodeMessage)
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_io_error() {
        let (mut raw, b) = duplex(64);
        let mut stream = HandshakeStream::new(b);
        raw.write_all(&[8, 0]).await.unwrap();
        drop(raw);

        assert!(matches!(stream.receive().await, Err(HandshakeError::Io(_))));
    }
}
