//! RTSP server
//!
//! ## Responsibilities
//!
//! - Terminate publisher sessions from the per-monitor encoders
//! - Re-publish each path to reader sessions over TCP or UDP
//! - Feed in-process consumers (HLS muxer, recorder) with access units
//!
//! One listener serves both publishers and readers. The path namespace is
//! owned by the server; the monitor manager registers `/<id>` and
//! `/<id>_sub`. The server never exits on a per-session error.

pub mod aac;
pub mod message;
pub mod sdp;
mod session;
pub mod stream;

pub use stream::{AccessUnit, PathEntry, RtpPacket};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::log_bus::Logger;

/// RTSP server instance.
pub struct RtspServer {
    port: u16,
    logger: Arc<Logger>,
    paths: RwLock<HashMap<String, Arc<PathEntry>>>,
}

impl RtspServer {
    pub fn new(logger: Arc<Logger>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            logger,
            paths: RwLock::new(HashMap::new()),
        })
    }

    /// Register a path, making it available to publishers and readers.
    /// Registering an existing path returns the existing entry.
    pub async fn register_path(&self, name: &str) -> Arc<PathEntry> {
        let mut paths = self.paths.write().await;
        paths
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PathEntry::new(name)))
            .clone()
    }

    /// Remove a path. Live sessions on it wind down on their next request
    /// or write failure.
    pub async fn unregister_path(&self, name: &str) {
        self.paths.write().await.remove(name);
    }

    pub async fn path(&self, name: &str) -> Option<Arc<PathEntry>> {
        self.paths.read().await.get(name).cloned()
    }

    /// Subscribe to a path's access-unit feed. The subscription survives
    /// publisher churn.
    pub async fn subscribe_au(&self, name: &str) -> Option<broadcast::Receiver<Arc<AccessUnit>>> {
        self.paths.read().await.get(name).map(|p| p.subscribe_au())
    }

    /// Bind the listener and serve until cancellation. A bind failure is
    /// fatal and propagated to the process root.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| Error::Fatal(format!("rtsp: bind port {}: {e}", self.port)))?;

        self.logger
            .info()
            .source("app")
            .msg(format!("rtsp: serving on port {}", self.port))
            .await;

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        server
                            .logger
                            .warn()
                            .source("app")
                            .msg(format!("rtsp: accept: {e}"))
                            .await;
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);
                server.spawn_session(socket, Some(peer), token.child_token());
            }
        });

        Ok(())
    }

    /// Serve one connection. Public for tests, which drive sessions over
    /// in-memory duplex streams.
    pub fn spawn_session<S>(
        self: &Arc<Self>,
        socket: S,
        peer: Option<SocketAddr>,
        token: CancellationToken,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let server = self.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            session::handle_connection(server, logger, socket, peer, token).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message::{Header, InterleavedFrame, Method, Request, Response};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const SDP: &str = "v=0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=0\r\n";

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
        cseq: u32,
    }

    impl Client {
        fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                reader: BufReader::new(r),
                writer: w,
                cseq: 0,
            }
        }

        async fn request(
            &mut self,
            method: Method,
            url: &str,
            extra: &[(&str, &str)],
            body: &[u8],
        ) -> Response {
            self.cseq += 1;
            let mut header = Header::new();
            header.set("CSeq", self.cseq.to_string());
            for (k, v) in extra {
                header.set(k, *v);
            }
            let request = Request {
                method,
                url: url.to_string(),
                header,
                body: body.to_vec(),
            };
            let mut buf = Vec::new();
            request.write(&mut buf);
            self.writer.write_all(&buf).await.unwrap();
            self.read_response().await
        }

        async fn read_response(&mut self) -> Response {
            // Skip interleaved frames, read a status line + headers + body.
            loop {
                let first = self.reader.read_u8().await.unwrap();
                if first == b'$' {
                    InterleavedFrame::read_after_magic(&mut self.reader)
                        .await
                        .unwrap();
                    continue;
                }
                let mut line = vec![first];
                loop {
                    let b = self.reader.read_u8().await.unwrap();
                    line.push(b);
                    if b == b'\n' {
                        break;
                    }
                }
                let status_line = String::from_utf8(line).unwrap();
                let status: u16 = status_line
                    .split_whitespace()
                    .nth(1)
                    .unwrap()
                    .parse()
                    .unwrap();
                let header = Header::read(&mut self.reader).await.unwrap();
                let mut body = Vec::new();
                if let Some(len) = header.first("Content-Length") {
                    body = vec![0u8; len.parse().unwrap()];
                    self.reader.read_exact(&mut body).await.unwrap();
                }
                return Response {
                    status,
                    header,
                    body,
                };
            }
        }

        async fn send_frame(&mut self, channel: u8, payload: &[u8]) {
            let frame = InterleavedFrame {
                channel,
                payload: payload.to_vec(),
            };
            let mut buf = Vec::new();
            frame.write(&mut buf);
            self.writer.write_all(&buf).await.unwrap();
        }

        async fn read_frame(&mut self) -> InterleavedFrame {
            let first = self.reader.read_u8().await.unwrap();
            assert_eq!(first, b'$', "expected interleaved frame");
            InterleavedFrame::read_after_magic(&mut self.reader)
                .await
                .unwrap()
        }
    }

    fn rtp_idr(timestamp: u32) -> Vec<u8> {
        let mut pkt = vec![0u8; 12];
        pkt[0] = 0x80;
        pkt[1] = 0x80; // marker
        pkt[4..8].copy_from_slice(&timestamp.to_be_bytes());
        pkt.extend_from_slice(&[0x65, 1, 2, 3]);
        pkt
    }

    async fn server_with_path(name: &str) -> Arc<RtspServer> {
        let logger = Arc::new(Logger::new(CancellationToken::new(), &[]));
        let server = RtspServer::new(logger, 0);
        server.register_path(name).await;
        server
    }

    async fn connect(server: &Arc<RtspServer>) -> Client {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        server.spawn_session(server_side, None, CancellationToken::new());
        Client::new(client_side)
    }

    async fn publish(client: &mut Client, url: &str) -> String {
        let resp = client
            .request(Method::Announce, url, &[], SDP.as_bytes())
            .await;
        assert_eq!(resp.status, 200);

        let resp = client
            .request(
                Method::Setup,
                &format!("{url}/trackID=0"),
                &[(
                    "Transport",
                    "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record",
                )],
                &[],
            )
            .await;
        assert_eq!(resp.status, 200);
        let session = resp.header.first("Session").unwrap().to_string();

        let resp = client
            .request(Method::Record, url, &[("Session", session.as_str())], &[])
            .await;
        assert_eq!(resp.status, 200);
        session
    }

    #[tokio::test]
    async fn test_describe_without_publisher_is_404() {
        let server = server_with_path("m1").await;
        let mut client = connect(&server).await;
        let resp = client
            .request(Method::Describe, "rtsp://127.0.0.1:2021/m1", &[], &[])
            .await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn test_announce_unknown_path_is_404() {
        let server = server_with_path("m1").await;
        let mut client = connect(&server).await;
        let resp = client
            .request(
                Method::Announce,
                "rtsp://127.0.0.1:2021/nope",
                &[],
                SDP.as_bytes(),
            )
            .await;
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn test_second_announce_rejected_461() {
        let server = server_with_path("m1").await;
        let url = "rtsp://127.0.0.1:2021/m1";

        let mut publisher = connect(&server).await;
        publish(&mut publisher, url).await;

        let mut second = connect(&server).await;
        let resp = second
            .request(Method::Announce, url, &[], SDP.as_bytes())
            .await;
        assert_eq!(resp.status, 461);
    }

    #[tokio::test]
    async fn test_publish_describe_play_delivers_rtp() {
        let server = server_with_path("m1").await;
        let url = "rtsp://127.0.0.1:2021/m1";

        let mut publisher = connect(&server).await;
        publish(&mut publisher, url).await;

        let mut viewer = connect(&server).await;
        let resp = viewer.request(Method::Describe, url, &[], &[]).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header.first("Content-Type"), Some("application/sdp"));
        assert_eq!(resp.body, SDP.as_bytes());

        let resp = viewer
            .request(
                Method::Setup,
                &format!("{url}/trackID=0"),
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
                &[],
            )
            .await;
        assert_eq!(resp.status, 200);
        let session = resp.header.first("Session").unwrap().to_string();

        let resp = viewer
            .request(Method::Play, url, &[("Session", session.as_str())], &[])
            .await;
        assert_eq!(resp.status, 200);

        // Give the reader registration a beat before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        publisher.send_frame(0, &rtp_idr(0)).await;

        let frame = viewer.read_frame().await;
        assert_eq!(frame.channel, 0);
        assert_eq!(frame.payload, rtp_idr(0));
    }

    #[tokio::test]
    async fn test_au_feed_survives_publisher_churn() {
        let server = server_with_path("m1").await;
        let url = "rtsp://127.0.0.1:2021/m1";
        let mut au_rx = server.subscribe_au("m1").await.unwrap();

        let mut publisher = connect(&server).await;
        let session = publish(&mut publisher, url).await;
        publisher.send_frame(0, &rtp_idr(0)).await;
        let au = au_rx.recv().await.unwrap();
        assert!(au.keyframe);

        // Publisher goes away, path stays registered.
        let resp = publisher
            .request(Method::Teardown, url, &[("Session", session.as_str())], &[])
            .await;
        assert_eq!(resp.status, 200);
        drop(publisher);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!server.path("m1").await.unwrap().has_publisher().await);

        // A new publisher takes over and the old subscription keeps working.
        let mut publisher2 = connect(&server).await;
        publish(&mut publisher2, url).await;
        publisher2.send_frame(0, &rtp_idr(3000)).await;
        let au = au_rx.recv().await.unwrap();
        assert!(au.keyframe);
    }

    #[tokio::test]
    async fn test_play_with_wrong_session_is_454() {
        let server = server_with_path("m1").await;
        let url = "rtsp://127.0.0.1:2021/m1";

        let mut publisher = connect(&server).await;
        publish(&mut publisher, url).await;

        let mut viewer = connect(&server).await;
        let resp = viewer.request(Method::Describe, url, &[], &[]).await;
        assert_eq!(resp.status, 200);
        let resp = viewer
            .request(
                Method::Setup,
                &format!("{url}/trackID=0"),
                &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")],
                &[],
            )
            .await;
        assert_eq!(resp.status, 200);

        let resp = viewer
            .request(Method::Play, url, &[("Session", "bogus")], &[])
            .await;
        assert_eq!(resp.status, 454);
    }
}
