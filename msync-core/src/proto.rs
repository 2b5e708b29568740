use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::update::Update;

/// Upper bound on a single frame; a whole-file payload has to fit.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

/// First frame from each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub mount_key: String,
    /// Advisory path of the sender's tree, for logs on the other end.
    pub remote_root: Option<String>,
}

/// Everything that crosses the wire.
///
/// A seed is terminated by an `Update` with an empty path and a non-zero mod
/// time; a body request is an `Update` carrying only a path and the sync
/// marker as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Hello(Hello),
    Update(Update),
    Ping,
    Pong,
}

/// Writes one length-prefixed postcard frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &WireMessage) -> anyhow::Result<()> {
    let bytes = postcard::to_stdvec(msg).context("encoding frame")?;
    if bytes.len() > MAX_FRAME_BYTES {
        anyhow::bail!("frame of {} bytes exceeds the {} byte bound", bytes.len(), MAX_FRAME_BYTES);
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `None` on a clean end of stream. An oversized length or
/// an undecodable payload is a corrupt stream and fatal to the session.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<WireMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("corrupt frame: length {len} exceeds the {MAX_FRAME_BYTES} byte bound");
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.context("reading frame body")?;
    let msg = postcard::from_bytes(&buf).context("decoding frame")?;
    Ok(Some(msg))
}

/// Outgoing half of a peer stream.
#[async_trait]
pub trait PeerSender: Send + 'static {
    async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()>;
}

/// Incoming half of a peer stream; `None` means the peer closed cleanly.
#[async_trait]
pub trait PeerReceiver: Send + 'static {
    async fn recv(&mut self) -> anyhow::Result<Option<WireMessage>>;
}

/// Frame codec over any byte stream (a TCP half, an SSH channel, ...).
pub struct FramedSender<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FramedSender<W> {
    pub fn new(writer: W) -> Self {
        FramedSender { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> PeerSender for FramedSender<W> {
    async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()> {
        write_frame(&mut self.writer, &msg).await
    }
}

pub struct FramedReceiver<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin + Send + 'static> FramedReceiver<R> {
    pub fn new(reader: R) -> Self {
        FramedReceiver { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> PeerReceiver for FramedReceiver<R> {
    async fn recv(&mut self) -> anyhow::Result<Option<WireMessage>> {
        read_frame(&mut self.reader).await
    }
}

/// In-memory duplex used by tests and by same-process peers.
pub struct MemorySender {
    tx: mpsc::Sender<WireMessage>,
}

pub struct MemoryReceiver {
    rx: mpsc::Receiver<WireMessage>,
}

/// Two connected peer endpoints.
pub fn memory_pair() -> ((MemorySender, MemoryReceiver), (MemorySender, MemoryReceiver)) {
    let (a_tx, b_rx) = mpsc::channel(1024);
    let (b_tx, a_rx) = mpsc::channel(1024);
    (
        (MemorySender { tx: a_tx }, MemoryReceiver { rx: a_rx }),
        (MemorySender { tx: b_tx }, MemoryReceiver { rx: b_rx }),
    )
}

#[async_trait]
impl PeerSender for MemorySender {
    async fn send(&mut self, msg: WireMessage) -> anyhow::Result<()> {
        self.tx.send(msg).await.map_err(|_| anyhow::anyhow!("peer closed"))
    }
}

#[async_trait]
impl PeerReceiver for MemoryReceiver {
    async fn recv(&mut self) -> anyhow::Result<Option<WireMessage>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Update;

    #[tokio::test]
    async fn frame_round_trip() {
        let msgs = vec![
            WireMessage::Hello(Hello { mount_key: "k1".into(), remote_root: Some("/work".into()) }),
            WireMessage::Update(Update::file("a/b.txt", 1234).with_data(b"hello".to_vec())),
            WireMessage::Ping,
            WireMessage::Pong,
        ];
        let mut buf = Vec::new();
        for m in &msgs {
            write_frame(&mut buf, m).await.unwrap();
        }
        let mut reader = buf.as_slice();
        for m in &msgs {
            let got = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(&got, m);
        }
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        buf.extend_from_slice(&[0; 16]);
        let mut reader = buf.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error_not_eof() {
        // a frame that never finishes is corrupt, not a clean close
        let mut whole = Vec::new();
        write_frame(&mut whole, &WireMessage::Update(Update::file("x", 5000))).await.unwrap();
        let mut truncated = whole.clone();
        truncated.truncate(whole.len() - 2);
        let mut reader = truncated.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn memory_pair_is_symmetric() {
        let ((mut a_tx, mut a_rx), (mut b_tx, mut b_rx)) = memory_pair();
        a_tx.send(WireMessage::Ping).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), Some(WireMessage::Ping));
        b_tx.send(WireMessage::Pong).await.unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), Some(WireMessage::Pong));
    }
}
