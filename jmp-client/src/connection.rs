use crate::config::ClientConfig;
use crate::dispatch::{AuthEvent, ConnectionEvent, Dispatcher, ListenerId};
use crate::handshake::{AuthHandshake, HandshakeAction};
use crate::tls;
use jmp_proto::framing::{self, FrameDecoder};
use jmp_proto::messages::{JmpMessage, MSG_AUTHENTICATED, MSG_ERROR, UNAUTHORIZED_TEXT};
use jmp_proto::stream::{CloseHandle, StreamBuffer};
use jmp_proto::{ProtocolError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Port the device listens on for JMP connections
pub const DEFAULT_PORT: u16 = 9220;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on [`JmpConnection::wait_for_authentication`]
pub const DEFAULT_AUTH_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, login sent, confirmation pending
    Authenticating,
    Authenticated,
    /// Absorbing: reachable from every other state via `close`
    Closed,
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

struct Endpoint {
    host: Option<String>,
    port: u16,
}

/// Handles for tearing down the current session's receive loop
struct Shutdown {
    token: CancellationToken,
    close: CloseHandle,
}

/// A client connection to one JMP device.
///
/// The caller owns the handle; the receive loop and per-message dispatch
/// tasks hold only a non-owning reference, so dropping the handle winds the
/// background work down.
///
/// Transport health is observable through the connection event channel, not
/// through return values: `send` never reports failure to the caller, it
/// closes the connection and emits `connected = false` instead.
pub struct JmpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Mutex<Endpoint>,
    secure: AtomicBool,
    accept_invalid_certs: AtomicBool,
    connect_timeout: Mutex<Duration>,
    handshake: Mutex<AuthHandshake>,
    authenticated: AtomicBool,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedTransport>>>,
    dispatcher: Dispatcher,
    auth_signal: watch::Sender<bool>,
    shutdown: Mutex<Option<Shutdown>>,
}

impl Default for JmpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl JmpConnection {
    pub fn new() -> Self {
        let (auth_signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                endpoint: Mutex::new(Endpoint {
                    host: None,
                    port: DEFAULT_PORT,
                }),
                secure: AtomicBool::new(false),
                accept_invalid_certs: AtomicBool::new(false),
                connect_timeout: Mutex::new(DEFAULT_CONNECT_TIMEOUT),
                handshake: Mutex::new(AuthHandshake::new()),
                authenticated: AtomicBool::new(false),
                state: Mutex::new(ConnectionState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                dispatcher: Dispatcher::new(),
                auth_signal,
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn with_config(config: &ClientConfig) -> Self {
        let connection = Self::new();
        connection.set_host(&config.device.host, config.device.port);
        connection.set_secure(config.device.secure, config.device.accept_invalid_certs);
        connection.set_connect_timeout(Duration::from_secs(config.timeouts.connect_timeout_secs));
        if let Some(credentials) = &config.credentials {
            connection.set_credentials(&credentials.username, &credentials.password);
        }
        connection
    }

    pub fn set_host(&self, host: &str, port: u16) {
        let mut endpoint = self.inner.endpoint.lock().expect("endpoint poisoned");
        endpoint.host = Some(host.to_string());
        endpoint.port = port;
    }

    /// Installs credentials for the login challenge. Resets the
    /// attempted-credentials flag so a fresh attempt is allowed.
    pub fn set_credentials(&self, username: &str, password: &str) {
        self.inner
            .handshake
            .lock()
            .expect("handshake poisoned")
            .set_credentials(username, password);
    }

    /// Requests the [STARTTLS] upgrade during the next `connect`.
    pub fn set_secure(&self, secure: bool, accept_invalid_certs: bool) {
        self.inner.secure.store(secure, Ordering::SeqCst);
        self.inner
            .accept_invalid_certs
            .store(accept_invalid_certs, Ordering::SeqCst);
    }

    pub fn set_connect_timeout(&self, connect_timeout: Duration) {
        *self
            .inner
            .connect_timeout
            .lock()
            .expect("connect timeout poisoned") = connect_timeout;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("state poisoned")
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected
                | ConnectionState::Authenticating
                | ConnectionState::Authenticated
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn host_info(&self) -> String {
        self.inner.host_info()
    }

    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.add_connection_listener(listener)
    }

    pub fn remove_connection_listener(&self, id: ListenerId) {
        self.inner.dispatcher.remove_connection_listener(id);
    }

    pub fn add_auth_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.add_auth_listener(listener)
    }

    pub fn remove_auth_listener(&self, id: ListenerId) {
        self.inner.dispatcher.remove_auth_listener(id);
    }

    pub fn add_message_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&JmpMessage) + Send + Sync + 'static,
    {
        self.inner.dispatcher.add_message_listener(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) {
        self.inner.dispatcher.remove_message_listener(id);
    }

    /// Connects to `host:port` and starts the session.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<bool> {
        self.set_host(host, port);
        self.connect().await
    }

    /// Connects to the configured device.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` on a transport failure
    /// (which is logged and leaves the connection disconnected). The only
    /// error a caller sees synchronously is `NotConfigured`.
    pub async fn connect(&self) -> Result<bool> {
        let (host, port) = {
            let endpoint = self.inner.endpoint.lock().expect("endpoint poisoned");
            match &endpoint.host {
                Some(host) => (host.clone(), endpoint.port),
                None => return Err(ProtocolError::NotConfigured),
            }
        };
        let connect_timeout = *self
            .inner
            .connect_timeout
            .lock()
            .expect("connect timeout poisoned");

        self.inner.set_state(ConnectionState::Connecting);
        info!("connecting to {}:{}", host, port);

        let stream = match timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("unable to connect to {}:{}: {}", host, port, e);
                self.inner.set_state(ConnectionState::Disconnected);
                return Ok(false);
            }
            Err(_) => {
                error!("timed out connecting to {}:{}", host, port);
                self.inner.set_state(ConnectionState::Disconnected);
                return Ok(false);
            }
        };

        let transport: BoxedTransport = if self.inner.secure.load(Ordering::SeqCst) {
            let accept_invalid = self.inner.accept_invalid_certs.load(Ordering::SeqCst);
            match tls::upgrade(stream, &host, accept_invalid).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    error!("TLS upgrade to {}:{} failed: {}", host, port, e);
                    self.inner.set_state(ConnectionState::Disconnected);
                    return Ok(false);
                }
            }
        } else {
            Box::new(stream)
        };

        self.start_session(transport).await;
        Ok(true)
    }

    async fn start_session(&self, transport: BoxedTransport) {
        let (reader, writer) = tokio::io::split(transport);
        *self.inner.writer.lock().await = Some(writer);

        self.inner.authenticated.store(false, Ordering::SeqCst);
        self.inner.auth_signal.send_replace(false);
        self.inner
            .handshake
            .lock()
            .expect("handshake poisoned")
            .reset();

        let buffer = StreamBuffer::new();
        let token = CancellationToken::new();
        *self.inner.shutdown.lock().expect("shutdown poisoned") = Some(Shutdown {
            token: token.clone(),
            close: buffer.close_handle(),
        });

        self.inner.set_state(ConnectionState::Connected);
        self.inner
            .dispatcher
            .notify_connection(&ConnectionEvent { connected: true });

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(receive_loop(weak, reader, buffer, token));

        // provoke the unauthorized error carrying the login nonce, or a
        // welcome message when no login is required
        self.inner.send(&JmpMessage::probe()).await;
    }

    /// Sends a message to the device.
    ///
    /// A missing transport or a write failure closes the connection and
    /// emits a `connected = false` event; neither reaches the caller.
    pub async fn send(&self, message: &JmpMessage) {
        self.inner.send(message).await;
    }

    /// Closes the connection. The receive loop exits without an error and
    /// the `connected = false` event fires exactly once. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown_session().await;
    }

    /// Waits up to one second for the login to be confirmed.
    ///
    /// A timeout is benign: it only means no authentication yet, and the
    /// caller should re-check state rather than treat it as failure.
    pub async fn wait_for_authentication(&self) -> bool {
        self.wait_for_authentication_timeout(DEFAULT_AUTH_WAIT).await
    }

    pub async fn wait_for_authentication_timeout(&self, wait: Duration) -> bool {
        let mut signal = self.inner.auth_signal.subscribe();
        if *signal.borrow_and_update() {
            return true;
        }
        let _ = timeout(wait, signal.changed()).await;
        let authorized = *signal.borrow();
        authorized
    }
}

impl Inner {
    fn host_info(&self) -> String {
        let endpoint = self.endpoint.lock().expect("endpoint poisoned");
        format!(
            "{}:{}",
            endpoint.host.as_deref().unwrap_or("<unset>"),
            endpoint.port
        )
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("state poisoned") = next;
    }

    /// State transitions driven by inbound messages must not resurrect a
    /// connection that was closed while the handler task was in flight.
    fn set_state_if_open(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("state poisoned");
        if !matches!(*state, ConnectionState::Closed) {
            *state = next;
        }
    }

    async fn send(&self, message: &JmpMessage) {
        if let Err(e) = self.try_send(message).await {
            warn!("unable to send message to {}: {}", self.host_info(), e);
            self.shutdown_session().await;
        }
    }

    async fn try_send(&self, message: &JmpMessage) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        framing::write_frame(writer, message).await
    }

    /// Tears the session down and emits `connected = false` exactly once.
    async fn shutdown_session(&self) {
        if let Some(shutdown) = self.shutdown.lock().expect("shutdown poisoned").take() {
            shutdown.close.close();
            shutdown.token.cancel();
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let was_open = {
            let mut state = self.state.lock().expect("state poisoned");
            let open = !matches!(*state, ConnectionState::Closed);
            *state = ConnectionState::Closed;
            open
        };

        if was_open {
            self.authenticated.store(false, Ordering::SeqCst);
            debug!("connection to {} closed", self.host_info());
            self.dispatcher
                .notify_connection(&ConnectionEvent { connected: false });
        }
    }

    /// Interprets one decoded message. Runs in its own task, concurrently
    /// with other messages' interpretation.
    async fn handle_message(&self, payload: String) {
        let message: JmpMessage = match serde_json::from_str(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "discarding undecodable message from {}: {}",
                    self.host_info(),
                    e
                );
                return;
            }
        };

        debug!(
            "{}: received message: {:?}",
            self.host_info(),
            message.message()
        );

        match message.message() {
            MSG_ERROR => {
                let unauthorized = message
                    .text()
                    .map_or(false, |text| text.contains(UNAUTHORIZED_TEXT));
                if unauthorized {
                    self.handle_unauthorized(&message).await;
                } else {
                    warn!("device error: {:?}", message.text());
                }
            }
            MSG_AUTHENTICATED => {
                self.mark_authenticated();
            }
            _ => {
                // a substantive message is proof of an authenticated (or
                // auth-not-required) session
                self.mark_authenticated();
                self.dispatcher.notify_message(&message);
            }
        }
    }

    async fn handle_unauthorized(&self, message: &JmpMessage) {
        let nonce = message.nonce().unwrap_or_default().to_string();

        let action = self
            .handshake
            .lock()
            .expect("handshake poisoned")
            .on_unauthorized(&nonce);

        match action {
            HandshakeAction::SendLogin(login) => {
                info!("sending login for challenge nonce {:?}", nonce);
                self.set_state_if_open(ConnectionState::Authenticating);
                self.send(&login).await;
            }
            HandshakeAction::Failed => {
                warn!("authentication with {} failed", self.host_info());
                self.dispatcher.notify_auth(&AuthEvent {
                    authorized: false,
                    nonce: Some(nonce),
                });
            }
        }
    }

    /// Idempotent: only the first call per connection lifetime has effects.
    fn mark_authenticated(&self) {
        if self.authenticated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: authenticated", self.host_info());
        self.set_state_if_open(ConnectionState::Authenticated);
        self.dispatcher.notify_auth(&AuthEvent {
            authorized: true,
            nonce: None,
        });
        self.auth_signal.send_replace(true);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // stop the receive loop if the caller dropped the handle without
        // closing first
        if let Ok(mut guard) = self.shutdown.lock() {
            if let Some(shutdown) = guard.take() {
                shutdown.close.close();
                shutdown.token.cancel();
            }
        }
    }
}

/// Background task: decodes frames in arrival order and hands each one to
/// its own handler task, so handler completion order is not guaranteed to
/// match frame arrival order.
async fn receive_loop(
    inner: Weak<Inner>,
    mut reader: ReadHalf<BoxedTransport>,
    mut buffer: StreamBuffer,
    token: CancellationToken,
) {
    let decoder = FrameDecoder::default();

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = decoder.next_frame(&mut reader, &mut buffer) => result,
        };

        match result {
            Ok(Some(payload)) => {
                let Some(inner) = inner.upgrade() else { break };
                tokio::spawn(async move { inner.handle_message(payload).await });
            }
            Ok(None) => {
                if buffer.is_closed() {
                    // graceful shutdown, not a fault
                    debug!("receive loop exiting after close");
                } else if let Some(inner) = inner.upgrade() {
                    info!("{}: connection closed by peer", inner.host_info());
                    inner.shutdown_session().await;
                }
                break;
            }
            Err(e) => {
                if buffer.is_closed() {
                    break;
                }
                if let Some(inner) = inner.upgrade() {
                    error!("error while reading from {}: {}", inner.host_info(), e);
                    inner.shutdown_session().await;
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jmp_proto::framing::encode_frame;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn read_device_message(stream: &mut TcpStream, buf: &mut StreamBuffer) -> JmpMessage {
        let decoder = FrameDecoder::default();
        let payload = decoder
            .next_frame(stream, buf)
            .await
            .unwrap()
            .expect("device expected a frame");
        serde_json::from_str(&payload).unwrap()
    }

    async fn write_device_payload(stream: &mut TcpStream, payload: &str) {
        stream.write_all(&encode_frame(payload)).await.unwrap();
        stream.flush().await.unwrap();
    }

    fn record_auth_events(connection: &JmpConnection) -> Arc<Mutex<Vec<AuthEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.add_auth_listener(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    fn record_connection_events(connection: &JmpConnection) -> Arc<Mutex<Vec<bool>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.add_connection_listener(move |event| sink.lock().unwrap().push(event.connected));
        events
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached in time");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_connect_without_host_is_not_configured() {
        let connection = JmpConnection::new();
        assert!(matches!(
            connection.connect().await,
            Err(ProtocolError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_login_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = StreamBuffer::new();

            let probe = read_device_message(&mut stream, &mut buf).await;
            assert_eq!(probe.message(), "");

            write_device_payload(
                &mut stream,
                r#"{"Message":"Error","Text":"Unauthorized","Nonce":"x1"}"#,
            )
            .await;

            let login = read_device_message(&mut stream, &mut buf).await;
            assert_eq!(
                login.auth_digest(),
                Some("jnior:49c063716eb9f265b4da9dde1d927afb")
            );

            write_device_payload(&mut stream, r#"{"Message":"Authenticated"}"#).await;

            // keep the socket open until the client hangs up
            let mut sink = [0u8; 64];
            use tokio::io::AsyncReadExt;
            let _ = stream.read(&mut sink).await;
        });

        let connection = JmpConnection::new();
        connection.set_credentials("jnior", "jnior");
        let auth_events = record_auth_events(&connection);

        let connected = connection
            .connect_to(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        assert!(connected);

        assert!(connection.wait_for_authentication().await);
        assert!(connection.is_authenticated());
        assert_eq!(connection.state(), ConnectionState::Authenticated);

        assert_eq!(
            *auth_events.lock().unwrap(),
            vec![AuthEvent {
                authorized: true,
                nonce: None,
            }]
        );

        connection.close().await;
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_unauthorized_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = StreamBuffer::new();

            let _probe = read_device_message(&mut stream, &mut buf).await;
            write_device_payload(
                &mut stream,
                r#"{"Message":"Error","Text":"Unauthorized","Nonce":"n1"}"#,
            )
            .await;

            // the one and only login attempt
            let login = read_device_message(&mut stream, &mut buf).await;
            assert!(login.auth_digest().is_some());

            write_device_payload(
                &mut stream,
                r#"{"Message":"Error","Text":"Unauthorized","Nonce":"n2"}"#,
            )
            .await;

            let mut sink = [0u8; 64];
            use tokio::io::AsyncReadExt;
            let _ = stream.read(&mut sink).await;
        });

        let connection = JmpConnection::new();
        connection.set_credentials("jnior", "wrong");
        let auth_events = record_auth_events(&connection);

        assert!(connection
            .connect_to(&addr.ip().to_string(), addr.port())
            .await
            .unwrap());

        wait_until(|| auth_events.lock().unwrap().iter().any(|e| !e.authorized)).await;

        let events = auth_events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![AuthEvent {
                authorized: false,
                nonce: Some("n2".to_string()),
            }]
        );
        assert!(!connection.is_authenticated());

        connection.close().await;
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_authenticated_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = StreamBuffer::new();

            let _probe = read_device_message(&mut stream, &mut buf).await;
            write_device_payload(&mut stream, r#"{"Message":"Authenticated"}"#).await;
            write_device_payload(&mut stream, r#"{"Message":"Authenticated"}"#).await;

            let mut sink = [0u8; 64];
            use tokio::io::AsyncReadExt;
            let _ = stream.read(&mut sink).await;
        });

        let connection = JmpConnection::new();
        let auth_events = record_auth_events(&connection);

        assert!(connection
            .connect_to(&addr.ip().to_string(), addr.port())
            .await
            .unwrap());

        assert!(connection.wait_for_authentication().await);
        // give the duplicate message a chance to be mishandled
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(auth_events.lock().unwrap().len(), 1);

        connection.close().await;
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_substantive_message_implies_authentication() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = StreamBuffer::new();

            let _probe = read_device_message(&mut stream, &mut buf).await;
            write_device_payload(&mut stream, r#"{"Message":"Monitor","Model":"410"}"#).await;

            let mut sink = [0u8; 64];
            use tokio::io::AsyncReadExt;
            let _ = stream.read(&mut sink).await;
        });

        let connection = JmpConnection::new();
        let auth_events = record_auth_events(&connection);
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        connection.add_message_listener(move |message| {
            sink.lock().unwrap().push(message.message().to_string());
        });

        assert!(connection
            .connect_to(&addr.ip().to_string(), addr.port())
            .await
            .unwrap());

        assert!(connection.wait_for_authentication().await);
        wait_until(|| !messages.lock().unwrap().is_empty()).await;

        assert_eq!(*messages.lock().unwrap(), vec!["Monitor".to_string()]);
        assert_eq!(
            *auth_events.lock().unwrap(),
            vec![AuthEvent {
                authorized: true,
                nonce: None,
            }]
        );

        connection.close().await;
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_while_receive_loop_is_blocked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // say nothing; just hold the socket until the client hangs up
            let mut sink = [0u8; 256];
            use tokio::io::AsyncReadExt;
            while stream.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let connection = JmpConnection::new();
        let connection_events = record_connection_events(&connection);

        assert!(connection
            .connect_to(&addr.ip().to_string(), addr.port())
            .await
            .unwrap());

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.is_connected());

        // closing again is a no-op
        connection.close().await;
        assert_eq!(*connection_events.lock().unwrap(), vec![true, false]);

        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_disconnect_emits_single_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = StreamBuffer::new();
            let _probe = read_device_message(&mut stream, &mut buf).await;
            // drop the socket: the client sees EOF
        });

        let connection = JmpConnection::new();
        let connection_events = record_connection_events(&connection);

        assert!(connection
            .connect_to(&addr.ip().to_string(), addr.port())
            .await
            .unwrap());
        device.await.unwrap();

        wait_until(|| connection_events.lock().unwrap().len() == 2).await;
        assert_eq!(*connection_events.lock().unwrap(), vec![true, false]);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_without_transport_closes_and_reports() {
        let connection = JmpConnection::new();
        let connection_events = record_connection_events(&connection);

        connection.send(&JmpMessage::probe()).await;
        assert_eq!(connection.state(), ConnectionState::Closed);

        // a second send finds the connection already closed: no more events
        connection.send(&JmpMessage::probe()).await;
        assert_eq!(*connection_events.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_wait_for_authentication_times_out_benignly() {
        let connection = JmpConnection::new();
        let authorized = connection
            .wait_for_authentication_timeout(Duration::from_millis(50))
            .await;
        assert!(!authorized);
    }
}
