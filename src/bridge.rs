//! Bidirectional byte bridge between an SSH channel and a backend stream.

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::error;

/// Copy bytes both ways until each direction has seen EOF, then close both
/// endpoints.
///
/// EOF on one read side shuts down the peer's write side, so half-close is
/// observed as EOF rather than a reset. Errors that just mean "the peer went
/// away" are swallowed; anything else is logged once. Bridging is a single
/// attempt per channel, there is nothing to retry.
pub async fn bridge<A, B>(mut channel: A, mut backend: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = copy_bidirectional(&mut channel, &mut backend).await;
    let _ = channel.shutdown().await;
    let _ = backend.shutdown().await;
    match result {
        Ok(_) => {}
        Err(err) if is_peer_closed(&err) => {}
        Err(err) => error!("bridge io error: {err}"),
    }
}

fn is_peer_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trips_bytes_in_both_directions() {
        let (mut channel_far, channel_near) = duplex(256);
        let (mut backend_far, backend_near) = duplex(256);
        let task = tokio::spawn(bridge(channel_near, backend_near));

        channel_far.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        backend_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        backend_far.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        channel_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(channel_far);
        drop(backend_far);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn preserves_a_large_payload_verbatim() {
        let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let (mut channel_far, channel_near) = duplex(4096);
        let (mut backend_far, backend_near) = duplex(4096);
        let task = tokio::spawn(bridge(channel_near, backend_near));

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            channel_far.write_all(&payload).await.unwrap();
            channel_far.shutdown().await.unwrap();
        });

        let mut received = Vec::with_capacity(expected.len());
        backend_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        drop(backend_far);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn half_close_propagates_as_eof() {
        let (mut channel_far, channel_near) = duplex(64);
        let (mut backend_far, backend_near) = duplex(64);
        let task = tokio::spawn(bridge(channel_near, backend_near));

        channel_far.write_all(b"bye").await.unwrap();
        channel_far.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        drop(backend_far);
        drop(channel_far);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn survives_abrupt_peer_drop() {
        let (channel_far, channel_near) = duplex(16);
        let (backend_far, backend_near) = duplex(16);
        let task = tokio::spawn(bridge(channel_near, backend_near));
        drop(channel_far);
        drop(backend_far);
        task.await.unwrap();
    }
}
