//! CoAP over UDP, using `coap-lite` for the message codec.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6},
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
    time::Duration,
};

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use futures::future::BoxFuture;
use tokio::{
    net::{UdpSocket, lookup_host},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, warn};

use super::{
    CoapClient, Method, Notification, Request, Response, Subscription, TransportError,
    TransportResult,
};

/// Default CoAP port, omitted from host info strings.
pub const COAP_PORT: u16 = 5683;
const MAX_DATAGRAM: usize = 1280;
const NOTIFICATION_BUFFER: usize = 16;
const TOKEN_LENGTH: usize = 4;
const OBSERVE_DEREGISTER: u8 = 1;

/// CoAP client sending each exchange from its own ephemeral UDP socket.
#[derive(Debug, Clone)]
pub struct UdpCoapClient {
    request_timeout: Duration,
    multicast_interface: Option<u32>,
    message_ids: Arc<AtomicU16>,
}

impl UdpCoapClient {
    /// Create a client whose single exchanges give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            multicast_interface: None,
            message_ids: Arc::new(AtomicU16::new(rand::random())),
        }
    }

    /// Interface index used as scope for link-local IPv6 destinations given without a zone.
    ///
    /// Applies to multicast lookups and to link-local unicast players alike.
    pub fn with_multicast_interface(mut self, interface: Option<u32>) -> Self {
        self.multicast_interface = interface;
        self
    }

    fn next_message_id(&self) -> u16 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    async fn resolve(&self, host: &str) -> TransportResult<SocketAddr> {
        let mut target = resolve_host(host).await?;
        if let SocketAddr::V6(ref mut v6) = target {
            let needs_scope = v6.ip().is_multicast() || v6.ip().is_unicast_link_local();
            if needs_scope && v6.scope_id() == 0 {
                if let Some(interface) = self.multicast_interface {
                    v6.set_scope_id(interface);
                }
            }
        }
        Ok(target)
    }

    async fn exchange(&self, request: Request) -> TransportResult<Response> {
        let target = self.resolve(&request.host).await?;
        let socket = bind_for(target, &request.host).await?;
        let token = new_token();
        let datagram = encode(&request, self.next_message_id(), &token, None)?;

        socket
            .send_to(&datagram, target)
            .await
            .map_err(|source| io_error(&request.host, source))?;

        // Multicast replies come from the responder's unicast address.
        let expected = (!target.ip().is_multicast()).then_some(target);
        let (packet, from) = timeout(
            self.request_timeout,
            recv_matching(&socket, &token, expected, &request.host),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            host: request.host.clone(),
            path: request.path.clone(),
        })??;

        ensure_success(&request, &packet)?;
        Ok(Response {
            source: host_info(from),
            payload: packet.payload,
        })
    }

    async fn register_observation(
        &self,
        host: String,
        path: String,
    ) -> TransportResult<Subscription> {
        let target = self.resolve(&host).await?;
        let socket = bind_for(target, &host).await?;
        let token = new_token();
        let request = Request::get(host.clone(), path.clone());
        let register = encode(&request, self.next_message_id(), &token, Some(Vec::new()))?;

        socket
            .send_to(&register, target)
            .await
            .map_err(|source| io_error(&host, source))?;

        let (first, _) = timeout(
            self.request_timeout,
            recv_matching(&socket, &token, Some(target), &host),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            host: host.clone(),
            path: path.clone(),
        })??;
        ensure_success(&request, &first)?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        if !first.payload.is_empty() {
            let _ = tx.try_send(Notification {
                source: host.clone(),
                payload: first.payload,
            });
        }

        let deregister = encode(
            &request.clone().non_confirmable(),
            self.next_message_id(),
            &token,
            Some(vec![OBSERVE_DEREGISTER]),
        )?;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(pump_notifications(
            socket,
            target,
            token,
            host.clone(),
            tx,
            cancel_rx,
            deregister,
        ));

        Ok(Subscription::new(host, path, rx, move || {
            let _ = cancel_tx.send(());
        }))
    }
}

impl CoapClient for UdpCoapClient {
    fn request(&self, request: Request) -> BoxFuture<'static, TransportResult<Response>> {
        let client = self.clone();
        Box::pin(async move { client.exchange(request).await })
    }

    fn observe(&self, host: &str, path: &str) -> BoxFuture<'static, TransportResult<Subscription>> {
        let client = self.clone();
        let host = host.to_owned();
        let path = path.to_owned();
        Box::pin(async move { client.register_observation(host, path).await })
    }
}

/// Forward notifications from `target` until the subscription is released or the peer stops.
async fn pump_notifications(
    socket: UdpSocket,
    target: SocketAddr,
    token: Vec<u8>,
    host: String,
    tx: mpsc::Sender<Notification>,
    mut cancel_rx: oneshot::Receiver<()>,
    deregister: Vec<u8>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = &mut cancel_rx => break,
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(host = %host, error = %err, "observation socket failed");
                        break;
                    }
                };
                if from != target {
                    debug!(host = %host, %from, "ignoring datagram from unexpected source");
                    continue;
                }
                let Some(packet) = decode(&buf[..len], &host) else {
                    continue;
                };
                acknowledge(&socket, &packet, from).await;
                if packet.get_token() != token.as_slice() {
                    continue;
                }
                if !is_success(&packet) {
                    warn!(
                        host = %host,
                        code = ?packet.header.code,
                        "observation rejected by peer"
                    );
                    break;
                }
                let still_observed = packet.get_option(CoapOption::Observe).is_some();
                let notification = Notification {
                    source: host.clone(),
                    payload: packet.payload,
                };
                if tx.send(notification).await.is_err() || !still_observed {
                    break;
                }
            }
        }
    }

    if let Err(err) = socket.send_to(&deregister, target).await {
        debug!(host = %host, error = %err, "failed to send observation deregistration");
    }
    debug!(host = %host, "observation released");
}

/// Wait for a response carrying `token`, acknowledging confirmable responses on the way.
async fn recv_matching(
    socket: &UdpSocket,
    token: &[u8],
    expected: Option<SocketAddr>,
    host: &str,
) -> TransportResult<(Packet, SocketAddr)> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|source| io_error(host, source))?;
        if expected.is_some_and(|expected| expected != from) {
            continue;
        }
        let Some(packet) = decode(&buf[..len], host) else {
            continue;
        };
        acknowledge(socket, &packet, from).await;
        // Empty ACKs announce a separate response that is still to come.
        let is_response = matches!(packet.header.code, MessageClass::Response(_));
        if packet.get_token() == token && is_response {
            return Ok((packet, from));
        }
    }
}

fn encode(
    request: &Request,
    message_id: u16,
    token: &[u8],
    observe: Option<Vec<u8>>,
) -> TransportResult<Vec<u8>> {
    let mut packet = Packet::new();
    packet.header.set_type(if request.confirmable {
        MessageType::Confirmable
    } else {
        MessageType::NonConfirmable
    });
    packet.header.code = MessageClass::Request(request_type(request.method));
    packet.header.message_id = message_id;
    packet.set_token(token.to_vec());

    if let Some(value) = observe {
        packet.add_option(CoapOption::Observe, value);
    }
    for segment in request.path.split('/').filter(|segment| !segment.is_empty()) {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    if let Some(query) = &request.query {
        for part in query.split('&').filter(|part| !part.is_empty()) {
            packet.add_option(CoapOption::UriQuery, part.as_bytes().to_vec());
        }
    }
    packet.payload = request.payload.clone();

    packet.to_bytes().map_err(|err| TransportError::Encode {
        path: request.path.clone(),
        message: format!("{err:?}"),
    })
}

fn decode(datagram: &[u8], host: &str) -> Option<Packet> {
    match Packet::from_bytes(datagram) {
        Ok(packet) => Some(packet),
        Err(err) => {
            debug!(host = %host, error = ?err, "dropping undecodable datagram");
            None
        }
    }
}

/// Acknowledge confirmable messages so the peer stops retransmitting.
async fn acknowledge(socket: &UdpSocket, packet: &Packet, to: SocketAddr) {
    if packet.header.get_type() != MessageType::Confirmable {
        return;
    }
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = packet.header.message_id;
    match ack.to_bytes() {
        Ok(bytes) => {
            if let Err(err) = socket.send_to(&bytes, to).await {
                debug!(%to, error = %err, "failed to acknowledge message");
            }
        }
        Err(err) => debug!(error = ?err, "failed to encode acknowledgement"),
    }
}

fn ensure_success(request: &Request, packet: &Packet) -> TransportResult<()> {
    if is_success(packet) {
        Ok(())
    } else {
        Err(TransportError::Status {
            host: request.host.clone(),
            path: request.path.clone(),
            code: format!("{:?}", packet.header.code),
        })
    }
}

fn is_success(packet: &Packet) -> bool {
    matches!(
        packet.header.code,
        MessageClass::Response(
            ResponseType::Created
                | ResponseType::Deleted
                | ResponseType::Valid
                | ResponseType::Changed
                | ResponseType::Content
                | ResponseType::Continue
        )
    )
}

fn request_type(method: Method) -> RequestType {
    match method {
        Method::Get => RequestType::Get,
        Method::Post => RequestType::Post,
        Method::Put => RequestType::Put,
    }
}

fn new_token() -> Vec<u8> {
    (0..TOKEN_LENGTH).map(|_| rand::random::<u8>()).collect()
}

fn io_error(host: &str, source: std::io::Error) -> TransportError {
    TransportError::Io {
        host: host.to_owned(),
        source,
    }
}

async fn bind_for(target: SocketAddr, host: &str) -> TransportResult<UdpSocket> {
    let local = match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    UdpSocket::bind(local)
        .await
        .map_err(|source| io_error(host, source))
}

/// Resolve a host info string (`h1`, `h1:5684`, `10.0.0.2`, `[fe80::1%eth0]`, ...) to an address.
pub async fn resolve_host(host: &str) -> TransportResult<SocketAddr> {
    if let Some(zoned) = parse_zoned(host) {
        return zoned.ok_or_else(|| TransportError::Unresolved {
            host: host.to_owned(),
        });
    }
    if let Some(addr) = parse_literal(host) {
        return Ok(addr);
    }

    let has_port = host
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    let target = if has_port {
        host.to_owned()
    } else {
        format!("{host}:{COAP_PORT}")
    };
    let resolved = lookup_host(target).await;

    resolved
        .map_err(|source| TransportError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .next()
        .ok_or_else(|| TransportError::Unresolved {
            host: host.to_owned(),
        })
}

/// Parse `[addr%zone]` or `[addr%zone]:port`. The outer `None` means the host carries no zone;
/// the inner one that the zone names no known interface.
fn parse_zoned(host: &str) -> Option<Option<SocketAddr>> {
    let (ip, rest) = host.strip_prefix('[')?.split_once('%')?;
    let (zone, port) = rest.split_once(']')?;
    let Ok(ip) = ip.parse::<Ipv6Addr>() else {
        return Some(None);
    };
    let port = match port.strip_prefix(':') {
        Some(port) => port.parse().ok(),
        None if port.is_empty() => Some(COAP_PORT),
        None => None,
    };
    Some(port.zip(zone_index(zone)).map(|(port, scope)| {
        SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope))
    }))
}

/// Map a zone to its interface index: numeric zones as is, names through the OS.
fn zone_index(zone: &str) -> Option<u32> {
    if let Ok(index) = zone.parse() {
        return Some(index);
    }
    interface_index(zone)
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    match nix::net::if_::if_nametoindex(name) {
        Ok(index) => Some(index),
        Err(err) => {
            debug!(interface = name, error = %err, "unknown interface zone");
            None
        }
    }
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

fn parse_literal(host: &str) -> Option<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some(addr);
    }
    if host.starts_with('[') {
        if let Ok(addr) = format!("{host}:{COAP_PORT}").parse::<SocketAddr>() {
            return Some(addr);
        }
    }
    host.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, COAP_PORT))
}

/// Render a peer address the way identities are written: default port omitted.
pub fn host_info(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) if v4.port() == COAP_PORT => v4.ip().to_string(),
        SocketAddr::V4(v4) => v4.to_string(),
        SocketAddr::V6(v6) => {
            let ip = if v6.scope_id() == 0 {
                format!("[{}]", v6.ip())
            } else {
                format!("[{}%{}]", v6.ip(), v6.scope_id())
            };
            if v6.port() == COAP_PORT {
                ip
            } else {
                format!("{ip}:{}", v6.port())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn host_info_omits_default_port() {
        let v4: SocketAddr = "10.0.0.2:5683".parse().unwrap();
        assert_eq!(host_info(v4), "10.0.0.2");

        let v6: SocketAddr = "[2001:db8::1]:5683".parse().unwrap();
        assert_eq!(host_info(v6), "[2001:db8::1]");

        let custom: SocketAddr = "[2001:db8::1]:6000".parse().unwrap();
        assert_eq!(host_info(custom), "[2001:db8::1]:6000");

        let scoped =
            SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), COAP_PORT, 0, 3));
        assert_eq!(host_info(scoped), "[fe80::1%3]");
    }

    #[test]
    fn literals_round_trip_through_host_info() {
        for host in ["10.0.0.2", "[2001:db8::1]", "[2001:db8::1]:6000", "192.168.1.4:6000"] {
            let addr = parse_literal(host).unwrap();
            assert_eq!(host_info(addr), host);
        }
        assert!(parse_literal("player-one").is_none());
    }

    fn scope_of(addr: SocketAddr) -> u32 {
        match addr {
            SocketAddr::V6(v6) => v6.scope_id(),
            other => panic!("expected IPv6 target, got {other}"),
        }
    }

    #[tokio::test]
    async fn resolve_applies_multicast_scope() {
        let client =
            UdpCoapClient::new(Duration::from_millis(10)).with_multicast_interface(Some(2));
        let target = client.resolve("[ff02::1]").await.unwrap();
        assert_eq!(scope_of(target), 2);
        assert_eq!(target.port(), COAP_PORT);
    }

    #[tokio::test]
    async fn resolve_scopes_link_local_players() {
        let client =
            UdpCoapClient::new(Duration::from_millis(10)).with_multicast_interface(Some(2));
        assert_eq!(scope_of(client.resolve("[fe80::1]").await.unwrap()), 2);
        assert_eq!(scope_of(client.resolve("[fe80::1%3]").await.unwrap()), 3);
        assert_eq!(scope_of(client.resolve("[2001:db8::1]").await.unwrap()), 0);
    }

    #[tokio::test]
    async fn zoned_literals_resolve_to_interface_indices() {
        let numeric = resolve_host("[fe80::1%4]:6000").await.unwrap();
        assert_eq!(scope_of(numeric), 4);
        assert_eq!(numeric.port(), 6000);
        assert_eq!(host_info(numeric), "[fe80::1%4]:6000");

        assert!(matches!(
            resolve_host("[fe80::1%no-such-interface0]").await,
            Err(TransportError::Unresolved { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn named_zone_maps_to_interface_index() {
        let target = resolve_host("[fe80::1%lo]").await.unwrap();
        assert_ne!(scope_of(target), 0);
        assert_eq!(target.port(), COAP_PORT);
    }

    #[test]
    fn encoded_request_carries_path_query_and_observe() {
        let request = Request::get("h1", "/endpoint-lookup/").with_query("rt=pushups_player");
        let bytes = encode(&request, 7, &[1, 2, 3, 4], Some(Vec::new())).unwrap();
        let packet = Packet::from_bytes(&bytes).unwrap();

        assert_eq!(packet.header.message_id, 7);
        assert_eq!(packet.header.get_type(), MessageType::Confirmable);
        assert_eq!(packet.get_token(), &[1, 2, 3, 4][..]);
        let path: Vec<Vec<u8>> = packet
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(path, vec![b"endpoint-lookup".to_vec()]);
        assert!(packet.get_option(CoapOption::UriQuery).is_some());
        assert!(packet.get_option(CoapOption::Observe).is_some());
    }

    #[tokio::test]
    async fn exchange_with_local_peer_returns_payload() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            let request = Packet::from_bytes(&buf[..len]).unwrap();
            let mut reply = Packet::new();
            reply.header.set_type(MessageType::Acknowledgement);
            reply.header.code = MessageClass::Response(ResponseType::Content);
            reply.header.message_id = request.header.message_id;
            reply.set_token(request.get_token().to_vec());
            reply.payload = b"7".to_vec();
            peer.send_to(&reply.to_bytes().unwrap(), from).await.unwrap();
        });

        let client = UdpCoapClient::new(Duration::from_secs(2));
        let response = client
            .request(Request::get(peer_addr.to_string(), "/count"))
            .await
            .unwrap();
        assert_eq!(response.payload, b"7");
        assert_eq!(response.source, peer_addr.to_string());
    }

    fn count_message(
        kind: MessageType,
        message_id: u16,
        token: &[u8],
        sequence: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut packet = Packet::new();
        packet.header.set_type(kind);
        packet.header.code = MessageClass::Response(ResponseType::Content);
        packet.header.message_id = message_id;
        packet.set_token(token.to_vec());
        packet.add_option(CoapOption::Observe, vec![sequence]);
        packet.payload = payload.to_vec();
        packet.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn observation_forwards_peer_notifications_and_deregisters_on_drop() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpCoapClient::new(Duration::from_secs(2));
        let observe = tokio::spawn(client.observe(&peer_addr.to_string(), "/count"));

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, observer) = peer.recv_from(&mut buf).await.unwrap();
        let register = Packet::from_bytes(&buf[..len]).unwrap();
        assert_eq!(register.header.code, MessageClass::Request(RequestType::Get));
        assert!(register.get_option(CoapOption::Observe).is_some());
        let token = register.get_token().to_vec();

        let first = count_message(
            MessageType::Acknowledgement,
            register.header.message_id,
            &token,
            0,
            b"0",
        );
        peer.send_to(&first, observer).await.unwrap();
        let mut subscription = observe.await.unwrap().unwrap();
        assert_eq!(subscription.next().await.unwrap().payload, b"0");

        let spoofed = count_message(MessageType::NonConfirmable, 90, &token, 5, b"99");
        stranger.send_to(&spoofed, observer).await.unwrap();
        let update = count_message(MessageType::NonConfirmable, 91, &token, 6, b"3");
        peer.send_to(&update, observer).await.unwrap();

        let notification = timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.payload, b"3");
        assert_eq!(notification.source, peer_addr.to_string());
        assert!(
            timeout(Duration::from_millis(50), subscription.next())
                .await
                .is_err()
        );

        drop(subscription);
        let (len, from) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, observer);
        let deregister = Packet::from_bytes(&buf[..len]).unwrap();
        assert_eq!(deregister.header.code, MessageClass::Request(RequestType::Get));
        assert_eq!(deregister.header.get_type(), MessageType::NonConfirmable);
        assert_eq!(deregister.get_token(), token.as_slice());
        let observe: Vec<Vec<u8>> = deregister
            .get_option(CoapOption::Observe)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(observe, vec![vec![OBSERVE_DEREGISTER]]);
    }
}
