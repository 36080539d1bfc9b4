use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{Error, ErrorKind};

pub const WAMP_JSON_SUBPROTOCOL: &str = "wamp.2.json";

/// The duplex message channel a session runs its protocol over.
///
/// Both operations take `&mut self` rather than splitting into a sink half
/// and a stream half: the driver task is the transport's sole owner and
/// never needs to `send` and `recv` concurrently, only to interleave them
/// within its own `tokio::select!` loop.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), Error>;

    /// Returns the next inbound frame, or `None` once the transport is
    /// exhausted. A closed or failed transport surfaces as one `Err` item
    /// followed by `None` on every subsequent call.
    async fn recv(&mut self) -> Option<Result<String, Error>>;
}

/// Connects to `url` over WebSocket and negotiates the `wamp.2.json`
/// subprotocol.
pub async fn connect(url: &str) -> Result<Box<dyn Transport>, Error> {
    let parsed = url::Url::parse(url)?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(Error::new(ErrorKind::ProtocolError(format!(
            "unsupported scheme {:?}, expected ws or wss",
            parsed.scheme()
        ))));
    }

    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", WAMP_JSON_SUBPROTOCOL.parse().unwrap());

    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(Error::from)?;

    match response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
    {
        Some(proto) if proto == WAMP_JSON_SUBPROTOCOL => {}
        Some(other) => {
            warn!("router selected unexpected subprotocol {}", other);
        }
        None => warn!("router did not echo a subprotocol, assuming wamp.2.json"),
    }

    Ok(Box::new(WebSocketTransport {
        stream,
        closed: false,
    }))
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), Error> {
        use futures::SinkExt;
        debug!("sending frame: {}", text);
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, Error>> {
        if self.closed {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(text)),
                Some(Ok(WsMessage::Close(_))) => {
                    self.closed = true;
                    return Some(Err(Error::new(ErrorKind::TransportClosed)));
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!("dropping unexpected binary frame (json subprotocol only)");
                    continue;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(Error::from(e)));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            }
        }
    }
}

/// Records every outbound frame and replays a scripted inbound sequence.
/// Used to exercise the session core against the wire traces without a
/// live router.
pub struct MockTransport {
    inbound: VecDeque<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new(inbound: Vec<String>) -> (Box<dyn Transport>, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(MockTransport {
                inbound: inbound.into(),
                sent: sent.clone(),
            }),
            sent,
        )
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), Error> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, Error>> {
        self.inbound.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn mock_transport_replays_inbound_and_records_sent() {
        let (mut transport, sent) = MockTransport::new(vec!["[2,1,{}]".to_string()]);
        transport.send("[1,\"realm1\",{}]".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "[2,1,{}]");
        assert!(transport.recv().await.is_none());
        assert_eq!(sent.lock().unwrap().as_slice(), &["[1,\"realm1\",{}]".to_string()]);
    }

    #[tokio::test]
    async fn connect_rejects_non_websocket_scheme() {
        let err = connect("http://example.com/ws").await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ProtocolError(_)));
    }

    #[tokio::test]
    async fn connect_rejects_unparseable_url() {
        let err = connect("not a url").await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UrlError(_)));
    }
}
