//! RTSP session handling
//!
//! One task per TCP connection. A session is either a publisher
//! (`init → announced → recording → closed`) or a reader
//! (`init → described → prepared → playing ↔ paused → closed`); the first
//! method decides which. Requests inside a session are processed serially.
//! Per-session errors close the session and nothing else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::log_bus::Logger;
use crate::rtsp::aac::decode_adts;
use crate::rtsp::message::{Incoming, Method, Request, Response};
use crate::rtsp::sdp::SessionDescription;
use crate::rtsp::stream::{rtp_payload, PathEntry, Publisher, RtpPacket};
use crate::rtsp::RtspServer;

const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const WRITER_DATA_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    Announced,
    Recording,
    Described,
    Prepared,
    Playing,
    Paused,
}

/// Parsed Transport header.
#[derive(Debug, Default, Clone)]
struct TransportHeader {
    tcp: bool,
    interleaved: Option<(u8, u8)>,
    client_port: Option<(u16, u16)>,
}

fn parse_transport(value: &str) -> TransportHeader {
    let mut t = TransportHeader::default();
    for part in value.split(';') {
        let part = part.trim();
        if part.eq_ignore_ascii_case("RTP/AVP/TCP") {
            t.tcp = true;
        } else if let Some(v) = part.strip_prefix("interleaved=") {
            t.interleaved = parse_pair(v).map(|(a, b)| (a as u8, b as u8));
        } else if let Some(v) = part.strip_prefix("client_port=") {
            t.client_port = parse_pair(v);
        }
    }
    t
}

fn parse_pair(v: &str) -> Option<(u16, u16)> {
    let (a, b) = v.split_once('-')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

enum ReaderTransport {
    /// Interleaved on the session's own TCP stream; per-track RTP channel.
    Tcp { channels: HashMap<usize, u8> },
    /// UDP to the client's RTP port.
    Udp {
        socket: Arc<UdpSocket>,
        dests: HashMap<usize, SocketAddr>,
    },
}

pub(crate) struct Session {
    server: Arc<RtspServer>,
    logger: Arc<Logger>,
    peer: Option<SocketAddr>,
    state: SessionState,
    session_token: Option<String>,
    path: Option<Arc<PathEntry>>,
    // Publisher side.
    sdp: Option<SessionDescription>,
    channel_to_track: HashMap<u8, usize>,
    video_track: Option<usize>,
    audio_track: Option<usize>,
    // Reader side.
    reader_transport: Option<ReaderTransport>,
    reader_id: Option<u64>,
    forward_task: Option<JoinHandle<()>>,
    data_tx: mpsc::Sender<Vec<u8>>,
}

/// Serve one connection until EOF, error, idle timeout or cancellation.
pub(crate) async fn handle_connection<S>(
    server: Arc<RtspServer>,
    logger: Arc<Logger>,
    socket: S,
    peer: Option<SocketAddr>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(socket);
    let mut reader = BufReader::new(read_half);

    // Single writer task owns the write half. Responses use an unbounded
    // lane so protocol replies are never dropped; media frames use a bounded
    // lane and are droppable.
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (data_tx, mut data_rx) = mpsc::channel::<Vec<u8>>(WRITER_DATA_QUEUE);
    let writer_token = token.child_token();
    let writer_guard = writer_token.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = resp_rx.recv() => {
                    let Some(buf) = msg else { return };
                    if write_half.write_all(&buf).await.is_err() {
                        writer_guard.cancel();
                        return;
                    }
                }
                msg = data_rx.recv() => {
                    let Some(buf) = msg else { return };
                    if write_half.write_all(&buf).await.is_err() {
                        writer_guard.cancel();
                        return;
                    }
                }
            }
        }
    });

    let mut session = Session {
        server,
        logger,
        peer,
        state: SessionState::Init,
        session_token: None,
        path: None,
        sdp: None,
        channel_to_track: HashMap::new(),
        video_track: None,
        audio_track: None,
        reader_transport: None,
        reader_id: None,
        forward_task: None,
        data_tx,
    };

    loop {
        let incoming = tokio::select! {
            _ = writer_token.cancelled() => break,
            read = tokio::time::timeout(SESSION_IDLE_TIMEOUT, Incoming::read(&mut reader)) => {
                match read {
                    Ok(Ok(incoming)) => incoming,
                    // Idle timeout, EOF or malformed stream: close the session.
                    _ => break,
                }
            }
        };

        match incoming {
            Incoming::Frame(frame) => {
                if session.state == SessionState::Recording {
                    session.handle_publisher_frame(frame.channel, frame.payload).await;
                }
            }
            Incoming::Request(request) => {
                let close = match session.handle_request(&request).await {
                    Ok((response, close)) => {
                        let mut buf = Vec::new();
                        response.write(&mut buf);
                        if resp_tx.send(buf).is_err() {
                            break;
                        }
                        close
                    }
                    Err(e) => {
                        let mut response = session.response_for(&request, 400);
                        if matches!(e, Error::Protocol(_)) {
                            response.header.set("Warning", e.to_string());
                        }
                        let mut buf = Vec::new();
                        response.write(&mut buf);
                        let _ = resp_tx.send(buf);
                        true
                    }
                };
                if close {
                    break;
                }
            }
        }
    }

    session.cleanup().await;
    // Close both writer lanes, then let the writer drain queued responses
    // (a TEARDOWN reply may still be in flight).
    drop(session);
    drop(resp_tx);
    let _ = writer.await;
}

impl Session {
    fn response_for(&self, request: &Request, status: u16) -> Response {
        let mut response = Response::new(status);
        if let Some(cseq) = request.header.first("CSeq") {
            response.header.set("CSeq", cseq);
        }
        if let Some(token) = &self.session_token {
            response.header.set("Session", token.clone());
        }
        response
    }

    fn ensure_session_token(&mut self) -> String {
        self.session_token
            .get_or_insert_with(|| uuid::Uuid::new_v4().simple().to_string())
            .clone()
    }

    /// Validate the Session header on requests that require an established
    /// session.
    fn check_session(&self, request: &Request) -> bool {
        match (&self.session_token, request.header.first("Session")) {
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => false,
            (None, _) => false,
        }
    }

    async fn handle_request(&mut self, request: &Request) -> Result<(Response, bool)> {
        match request.method {
            Method::Options => {
                let mut response = self.response_for(request, 200);
                response.header.set(
                    "Public",
                    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, PAUSE, RECORD, TEARDOWN, GET_PARAMETER",
                );
                Ok((response, false))
            }
            Method::GetParameter | Method::SetParameter => {
                // Keepalive.
                Ok((self.response_for(request, 200), false))
            }
            Method::Announce => self.handle_announce(request).await,
            Method::Setup => self.handle_setup(request).await,
            Method::Record => self.handle_record(request).await,
            Method::Describe => self.handle_describe(request).await,
            Method::Play => self.handle_play(request).await,
            Method::Pause => self.handle_pause(request).await,
            Method::Teardown => Ok((self.response_for(request, 200), true)),
        }
    }

    async fn handle_announce(&mut self, request: &Request) -> Result<(Response, bool)> {
        if self.state != SessionState::Init {
            return Ok((self.response_for(request, 405), false));
        }
        let path_name = request.path();
        let Some(path) = self.server.path(&path_name).await else {
            return Ok((self.response_for(request, 404), false));
        };

        let sdp = SessionDescription::parse(&request.body)?;
        let token = self.ensure_session_token();
        let installed = path
            .set_publisher(Publisher {
                session_token: token,
                raw_sdp: request.body.clone(),
                sdp: sdp.clone(),
            })
            .await;
        if !installed {
            // One publisher per path at a time.
            return Ok((self.response_for(request, 461), false));
        }

        self.video_track = sdp.tracks.iter().position(|t| t.is_h264());
        self.audio_track = sdp.tracks.iter().position(|t| t.media == "audio");
        self.sdp = Some(sdp);
        self.path = Some(path);
        self.state = SessionState::Announced;
        Ok((self.response_for(request, 200), false))
    }

    async fn handle_setup(&mut self, request: &Request) -> Result<(Response, bool)> {
        let transport = request
            .header
            .first("Transport")
            .map(parse_transport)
            .unwrap_or_default();

        match self.state {
            SessionState::Announced => self.setup_publisher_track(request, transport),
            SessionState::Init | SessionState::Described | SessionState::Prepared => {
                self.setup_reader_track(request, transport).await
            }
            _ => Ok((self.response_for(request, 405), false)),
        }
    }

    fn setup_publisher_track(
        &mut self,
        request: &Request,
        transport: TransportHeader,
    ) -> Result<(Response, bool)> {
        // Publishers must use TCP interleaving on this server.
        let Some((rtp_ch, _rtcp_ch)) = transport.interleaved else {
            return Ok((self.response_for(request, 461), false));
        };
        let sdp = self
            .sdp
            .as_ref()
            .ok_or_else(|| Error::Protocol("SETUP before ANNOUNCE".to_string()))?;
        let track = sdp.track_for_setup_url(&request.url);
        self.channel_to_track.insert(rtp_ch, track);

        self.ensure_session_token();
        let mut response = self.response_for(request, 200);
        response
            .header
            .set("Transport", request.header.first("Transport").unwrap_or(""));
        Ok((response, false))
    }

    async fn setup_reader_track(
        &mut self,
        request: &Request,
        transport: TransportHeader,
    ) -> Result<(Response, bool)> {
        let path_name = path_without_control(&request.path());
        let Some(path) = self.server.path(&path_name).await else {
            return Ok((self.response_for(request, 404), false));
        };
        let Some((_, sdp)) = path.publisher_sdp().await else {
            return Ok((self.response_for(request, 404), false));
        };
        let track = sdp.track_for_setup_url(&request.url);
        self.path = Some(path);
        self.ensure_session_token();

        let transport_reply;
        if transport.tcp || transport.interleaved.is_some() {
            // TCP interleaved, preferred.
            let (rtp_ch, rtcp_ch) = transport
                .interleaved
                .unwrap_or(((track * 2) as u8, (track * 2 + 1) as u8));
            match &mut self.reader_transport {
                Some(ReaderTransport::Tcp { channels }) => {
                    channels.insert(track, rtp_ch);
                }
                _ => {
                    let mut channels = HashMap::new();
                    channels.insert(track, rtp_ch);
                    self.reader_transport = Some(ReaderTransport::Tcp { channels });
                }
            }
            transport_reply = format!("RTP/AVP/TCP;unicast;interleaved={rtp_ch}-{rtcp_ch}");
        } else if let Some((rtp_port, rtcp_port)) = transport.client_port {
            let Some(peer) = self.peer else {
                return Ok((self.response_for(request, 461), false));
            };
            let dest = SocketAddr::new(peer.ip(), rtp_port);
            match &mut self.reader_transport {
                Some(ReaderTransport::Udp { dests, .. }) => {
                    dests.insert(track, dest);
                }
                _ => {
                    let socket = UdpSocket::bind("0.0.0.0:0")
                        .await
                        .map_err(|e| Error::Resource(format!("udp bind: {e}")))?;
                    let mut dests = HashMap::new();
                    dests.insert(track, dest);
                    self.reader_transport = Some(ReaderTransport::Udp {
                        socket: Arc::new(socket),
                        dests,
                    });
                }
            }
            let local_port = match &self.reader_transport {
                Some(ReaderTransport::Udp { socket, .. }) => {
                    socket.local_addr().map(|a| a.port()).unwrap_or(0)
                }
                _ => 0,
            };
            transport_reply = format!(
                "RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port};server_port={}-{}",
                local_port,
                local_port.wrapping_add(1),
            );
        } else {
            return Ok((self.response_for(request, 461), false));
        }

        self.state = SessionState::Prepared;
        let mut response = self.response_for(request, 200);
        response.header.set("Transport", transport_reply);
        Ok((response, false))
    }

    async fn handle_record(&mut self, request: &Request) -> Result<(Response, bool)> {
        if self.state != SessionState::Announced {
            return Ok((self.response_for(request, 405), false));
        }
        if !self.check_session(request) {
            return Ok((self.response_for(request, 454), false));
        }
        self.state = SessionState::Recording;
        Ok((self.response_for(request, 200), false))
    }

    async fn handle_describe(&mut self, request: &Request) -> Result<(Response, bool)> {
        if self.state != SessionState::Init {
            return Ok((self.response_for(request, 405), false));
        }
        let path_name = request.path();
        let Some(path) = self.server.path(&path_name).await else {
            return Ok((self.response_for(request, 404), false));
        };
        let Some((raw_sdp, _)) = path.publisher_sdp().await else {
            return Ok((self.response_for(request, 404), false));
        };

        self.path = Some(path);
        self.state = SessionState::Described;
        let mut response = self.response_for(request, 200);
        response.header.set("Content-Type", "application/sdp");
        response.header.set("Content-Base", request.url.clone());
        response.body = raw_sdp;
        Ok((response, false))
    }

    async fn handle_play(&mut self, request: &Request) -> Result<(Response, bool)> {
        if !matches!(self.state, SessionState::Prepared | SessionState::Paused) {
            return Ok((self.response_for(request, 405), false));
        }
        if !self.check_session(request) {
            return Ok((self.response_for(request, 454), false));
        }
        let Some(path) = self.path.clone() else {
            return Ok((self.response_for(request, 404), false));
        };

        let (reader_id, mut rx) = path.add_reader().await;
        self.reader_id = Some(reader_id);

        // Forward RTP to the client, dropping on local congestion only.
        let transport = match &self.reader_transport {
            Some(ReaderTransport::Tcp { channels }) => ReaderTransport::Tcp {
                channels: channels.clone(),
            },
            Some(ReaderTransport::Udp { socket, dests }) => ReaderTransport::Udp {
                socket: socket.clone(),
                dests: dests.clone(),
            },
            None => return Ok((self.response_for(request, 455), false)),
        };
        let data_tx = self.data_tx.clone();
        self.forward_task = Some(tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                match &transport {
                    ReaderTransport::Tcp { channels } => {
                        let Some(&channel) = channels.get(&packet.track) else {
                            continue;
                        };
                        let frame = crate::rtsp::message::InterleavedFrame {
                            channel,
                            payload: packet.data.clone(),
                        };
                        let mut buf = Vec::with_capacity(packet.data.len() + 4);
                        frame.write(&mut buf);
                        let _ = data_tx.try_send(buf);
                    }
                    ReaderTransport::Udp { socket, dests } => {
                        if let Some(dest) = dests.get(&packet.track) {
                            let _ = socket.try_send_to(&packet.data, *dest);
                        }
                    }
                }
            }
        }));

        self.state = SessionState::Playing;
        Ok((self.response_for(request, 200), false))
    }

    async fn handle_pause(&mut self, request: &Request) -> Result<(Response, bool)> {
        if self.state != SessionState::Playing {
            return Ok((self.response_for(request, 405), false));
        }
        if !self.check_session(request) {
            return Ok((self.response_for(request, 454), false));
        }
        self.stop_forwarding().await;
        // Transport stays alive; PLAY resumes it.
        self.state = SessionState::Paused;
        Ok((self.response_for(request, 200), false))
    }

    async fn handle_publisher_frame(&mut self, channel: u8, payload: Vec<u8>) {
        // Odd channels carry RTCP; not forwarded.
        if channel % 2 == 1 {
            return;
        }
        let Some(&track) = self.channel_to_track.get(&channel) else {
            return;
        };
        let Some(path) = &self.path else { return };

        if Some(track) == self.audio_track {
            // Audio frames carrying ADTS must satisfy the decoder's
            // restrictions; invalid frames are dropped here.
            if let Some(au) = rtp_payload(&payload) {
                if au.len() >= 2 && au[0] == 0xff && (au[1] & 0xf0) == 0xf0 {
                    if let Err(e) = decode_adts(au) {
                        self.logger
                            .warn()
                            .source("monitors")
                            .msg(format!("rtsp: dropping audio frame: {e}"))
                            .await;
                        return;
                    }
                }
            }
        }

        path.handle_rtp(
            RtpPacket {
                track,
                data: payload,
            },
            self.video_track,
        )
        .await;
    }

    async fn stop_forwarding(&mut self) {
        if let Some(task) = self.forward_task.take() {
            task.abort();
        }
        if let (Some(path), Some(reader_id)) = (&self.path, self.reader_id.take()) {
            path.remove_reader(reader_id).await;
        }
    }

    async fn cleanup(&mut self) {
        self.stop_forwarding().await;
        if let (Some(path), Some(token)) = (&self.path, &self.session_token) {
            path.clear_publisher(token).await;
        }
    }
}

fn path_without_control(path: &str) -> String {
    match path.find("/trackID=") {
        Some(idx) => path[..idx].to_string(),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transport_tcp() {
        let t = parse_transport("RTP/AVP/TCP;unicast;interleaved=2-3;mode=record");
        assert!(t.tcp);
        assert_eq!(t.interleaved, Some((2, 3)));
        assert_eq!(t.client_port, None);
    }

    #[test]
    fn test_parse_transport_udp() {
        let t = parse_transport("RTP/AVP;unicast;client_port=8000-8001");
        assert!(!t.tcp);
        assert_eq!(t.client_port, Some((8000, 8001)));
    }

    #[test]
    fn test_path_without_control() {
        assert_eq!(path_without_control("m1/trackID=0"), "m1");
        assert_eq!(path_without_control("m1"), "m1");
    }
}
