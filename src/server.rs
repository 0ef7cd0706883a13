//! Session server: newline-delimited frames over vsock or TCP
//!
//! Each accepted connection is one session, served by its own task. Within a
//! session requests are handled strictly in order; a response is written
//! before the next request is read.

use crate::config::MAX_FRAME_LEN;
use crate::enclave::EnclaveService;
use crate::error::{EnclaveError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Reads one `\n`-terminated frame into `frame`, without its newline
///
/// Returns `Ok(false)` once the stream ends cleanly. A final frame without a
/// newline is still returned. Frames longer than [`MAX_FRAME_LEN`] are a
/// `Transport` error; at most `MAX_FRAME_LEN + 1` bytes are buffered.
pub async fn read_frame<R>(reader: &mut R, frame: &mut Vec<u8>) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    frame.clear();
    let read = (&mut *reader)
        .take(MAX_FRAME_LEN as u64 + 1)
        .read_until(b'\n', frame)
        .await?;
    if read == 0 {
        return Ok(false);
    }

    if frame.last() == Some(&b'\n') {
        frame.pop();
    } else if frame.len() > MAX_FRAME_LEN {
        return Err(EnclaveError::Transport(format!(
            "frame exceeds {} bytes",
            MAX_FRAME_LEN
        )));
    }
    Ok(true)
}

/// Serves one session until the peer closes it, an I/O error occurs or a
/// frame is oversized
///
/// The frame handed to the service is the line exactly as received, minus its
/// terminating `\n`.
pub async fn serve_connection<S>(service: Arc<EnclaveService>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();

    while read_frame(&mut reader, &mut frame).await? {
        let response = service.handle(&frame).await;
        writer.write_all(&response).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Plain TCP listener for running outside an enclave
pub async fn run_tcp(service: Arc<EnclaveService>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "TCP session server listening");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let service = Arc::clone(&service);

        tokio::spawn(async move {
            debug!(remote_addr = %remote_addr, "Session opened");
            match serve_connection(service, stream).await {
                Ok(()) => debug!(remote_addr = %remote_addr, "Session closed"),
                Err(e) => error!(remote_addr = %remote_addr, error = %e, "Session ended"),
            }
        });
    }
}

#[cfg(target_os = "linux")]
pub async fn run_vsock(service: Arc<EnclaveService>, port: u32) -> Result<()> {
    use tokio_vsock::{VsockAddr, VsockListener};

    let addr = VsockAddr::new(nix::libc::VMADDR_CID_ANY, port);
    let mut listener = VsockListener::bind(addr)?;
    info!(cid = "ANY", port = port, "vsock session server listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        let service = Arc::clone(&service);

        tokio::spawn(async move {
            debug!(addr = ?addr, "Session opened");
            match serve_connection(service, stream).await {
                Ok(()) => debug!(addr = ?addr, "Session closed"),
                Err(e) => error!(addr = ?addr, error = %e, "Session ended"),
            }
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn run_vsock(_service: Arc<EnclaveService>, _port: u32) -> Result<()> {
    Err(crate::error::EnclaveError::Config(
        "vsock is only supported on Linux".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{LocalIssuer, Verifier};
    use crate::channel::TransportKey;
    use crate::custodian::MemoryCustodian;
    use crate::messages::{MessageKind, Response};
    use tokio::io::duplex;

    fn service() -> Arc<EnclaveService> {
        let issuer = Arc::new(LocalIssuer::new(vec![0; 48]).unwrap());
        let custodian = MemoryCustodian::new(
            "arn:aws:iam::123456789012:role/test",
            Verifier::new(issuer.root_certificate_der().to_vec()),
        );
        Arc::new(EnclaveService::new(
            issuer,
            Arc::new(TransportKey::generate().unwrap()),
            Arc::new(custodian),
        ))
    }

    #[tokio::test]
    async fn test_session_survives_request_errors() {
        let (client, server) = duplex(64 * 1024);
        let session = tokio::spawn(serve_connection(service(), server));

        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = BufReader::new(reader);
        writer
            .write_all(b"garbage\n{\"getAttestation\":{}}\n")
            .await
            .unwrap();

        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.unwrap();
        assert!(matches!(
            Response::from_slice(&line).unwrap(),
            Response::Error(_)
        ));

        line.clear();
        reader.read_until(b'\n', &mut line).await.unwrap();
        assert!(Response::from_slice(&line)
            .unwrap()
            .into_attestation(MessageKind::GetAttestation)
            .is_ok());

        drop(writer);
        drop(reader);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_session() {
        let (client, server) = duplex(64 * 1024);
        let session = tokio::spawn(serve_connection(service(), server));

        let (mut reader, mut writer) = tokio::io::split(client);
        let flood = tokio::spawn(async move {
            let mut frame = vec![b' '; MAX_FRAME_LEN + 1];
            frame.extend_from_slice(b"{\"getAttestation\":{}}\n");
            // fails once the server hangs up
            let _ = writer.write_all(&frame).await;
        });

        assert!(matches!(
            session.await.unwrap(),
            Err(EnclaveError::Transport(_))
        ));
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        flood.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_served() {
        let mut frame = br#"{"getAttestation":{}}"#.to_vec();
        frame.resize(MAX_FRAME_LEN, b' ');
        frame.push(b'\n');

        let mut reader = BufReader::new(&frame[..]);
        let mut read = Vec::new();
        assert!(read_frame(&mut reader, &mut read).await.unwrap());
        assert_eq!(read.len(), MAX_FRAME_LEN);
        assert!(!read_frame(&mut reader, &mut read).await.unwrap());

        let response = service().handle(&read).await;
        assert!(Response::from_slice(&response)
            .unwrap()
            .into_attestation(MessageKind::GetAttestation)
            .is_ok());
    }

    #[tokio::test]
    async fn test_last_line_without_newline_is_served() {
        let (client, server) = duplex(64 * 1024);
        let session = tokio::spawn(serve_connection(service(), server));

        let (reader, mut writer) = tokio::io::split(client);
        writer.write_all(b"{\"getAttestation\":{}}").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut line = Vec::new();
        BufReader::new(reader)
            .read_until(b'\n', &mut line)
            .await
            .unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert!(Response::from_slice(&line[..line.len() - 1]).is_ok());
        session.await.unwrap().unwrap();
    }
}
