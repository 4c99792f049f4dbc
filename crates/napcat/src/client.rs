//! OneBot v11 RPC over a single reconnecting WebSocket.
//!
//! API calls are tagged with an `echo` token and matched against response
//! frames; every other frame carrying `post_type` is handed to the
//! [`ClientEvents`] handler. Any inbound frame resets the heartbeat timer.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tokio::{
        sync::{mpsc, oneshot, watch},
        time::{Instant, sleep},
    },
    tokio_tungstenite::{
        connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            http::{HeaderValue, header::AUTHORIZATION},
            protocol::{CloseFrame, frame::coding::CloseCode},
        },
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    frame::{ApiRequest, ApiResponse, Event},
};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code sent when the server went silent for a whole heartbeat window.
const HEARTBEAT_CLOSE_CODE: u16 = 4000;

#[derive(Clone)]
pub struct WsClientOptions {
    pub ws_url: String,
    pub access_token: Option<Secret<String>>,
    pub reconnect_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub default_call_timeout: Duration,
}

impl WsClientOptions {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            access_token: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            default_call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, token: Option<Secret<String>>) -> Self {
        self.access_token = token.filter(|t| !t.expose_secret().is_empty());
        self
    }
}

impl std::fmt::Debug for WsClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClientOptions")
            .field("ws_url", &self.ws_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("reconnect_interval", &self.reconnect_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("default_call_timeout", &self.default_call_timeout)
            .finish()
    }
}

/// Connection lifecycle and event callbacks. Called from the connection task,
/// so implementations must not block.
pub trait ClientEvents: Send + Sync {
    fn on_connected(&self) {}

    /// Not called after [`WsClient::stop`].
    fn on_disconnected(&self) {}

    fn on_event(&self, event: Event);
}

/// The request/response half of the OneBot protocol.
#[async_trait]
pub trait OneBotApi: Send + Sync {
    /// `timeout = None` uses the client's default.
    async fn call_api(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse>;

    fn is_connected(&self) -> bool;
}

type PendingCall = oneshot::Sender<Result<ApiResponse>>;

pub struct WsClient {
    options: WsClientOptions,
    handler: Arc<dyn ClientEvents>,
    seq: AtomicU32,
    pending: Mutex<HashMap<String, PendingCall>>,
    /// Writer of the live session, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
    started: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl WsClient {
    pub fn new(options: WsClientOptions, handler: Arc<dyn ClientEvents>) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            options,
            handler,
            seq: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            connected,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.options.ws_url
    }

    /// Spawn the connection task. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(Arc::clone(self).connection_loop());
    }

    /// Close the socket, cancel reconnects and reject every pending call.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(url = %self.options.ws_url, "stopping NapCat client");
        self.cancel.cancel();
        *lock(&self.outbound) = None;
        self.connected.send_replace(false);
        self.reject_pending(|| Error::Stopped);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until a session is open. Returns false on timeout or stop.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = tokio::time::timeout(timeout, rx.wait_for(|c| *c)) => matches!(res, Ok(Ok(_))),
        }
    }

    pub async fn call_api(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse> {
        let writer = lock(&self.outbound).clone().ok_or(Error::NotConnected)?;
        let echo = self.next_echo();
        let frame = serde_json::to_string(&ApiRequest {
            action,
            params,
            echo: echo.clone(),
        })?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(echo.clone(), tx);
        if writer.send(frame).is_err() {
            lock(&self.pending).remove(&echo);
            return Err(Error::NotConnected);
        }
        debug!(action, echo = %echo, "API call sent");

        let timeout = timeout.unwrap_or(self.options.default_call_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Reconnecting),
            Err(_) => {
                lock(&self.pending).remove(&echo);
                Err(Error::Timeout {
                    action: action.to_string(),
                })
            },
        }
    }

    fn next_echo(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & 0x7FFF_FFFF;
        format!("oc_{n}")
    }

    fn reject_pending(&self, make_error: impl Fn() -> Error) {
        let drained: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "rejecting pending API calls");
        }
        for tx in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    fn mark_disconnected(&self) {
        *lock(&self.outbound) = None;
        self.connected.send_replace(false);
    }

    async fn connection_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.reject_pending(|| Error::Reconnecting);
            info!(url = %self.options.ws_url, "connecting to NapCat");

            match self.run_session().await {
                Ok(()) => debug!(url = %self.options.ws_url, "NapCat connection closed"),
                Err(e) => warn!(url = %self.options.ws_url, error = %e, "NapCat connection error"),
            }
            self.mark_disconnected();
            self.reject_pending(|| Error::Reconnecting);

            if self.cancel.is_cancelled() {
                break;
            }
            self.handler.on_disconnected();

            let delay = self.options.reconnect_interval;
            info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                () = sleep(delay) => {},
            }
        }
        self.mark_disconnected();
        self.reject_pending(|| Error::Stopped);
        debug!(url = %self.options.ws_url, "NapCat connection task exited");
    }

    /// One connection attempt, returning when the socket closes.
    async fn run_session(&self) -> Result<()> {
        let mut request = self.options.ws_url.as_str().into_client_request()?;
        if let Some(token) = &self.options.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| Error::message(format!("invalid access token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            res = connect_async(request) => res?,
        };
        let (mut sink, mut reader) = stream.split();
        let (writer, mut write_rx) = mpsc::unbounded_channel::<String>();
        *lock(&self.outbound) = Some(writer.clone());
        info!(url = %self.options.ws_url, "connected to NapCat");
        self.handler.on_connected();
        self.connected.send_replace(true);

        let window = self.options.heartbeat_timeout;
        let heartbeat = sleep(window);
        tokio::pin!(heartbeat);

        // `writer` outlives the select so `write_rx` never reports closed.
        let _writer = writer;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client stopped".into(),
                        })))
                        .await;
                    return Ok(());
                },
                () = &mut heartbeat => {
                    warn!(timeout_ms = window.as_millis() as u64, "heartbeat timeout, closing socket");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(HEARTBEAT_CLOSE_CODE),
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    return Ok(());
                },
                msg = reader.next() => {
                    heartbeat.as_mut().reset(Instant::now() + window);
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                        Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(frame))) => {
                            debug!(frame = ?frame, "NapCat closed the socket");
                            return Ok(());
                        },
                        None => return Ok(()),
                        Some(Ok(_)) => {},
                        Some(Err(e)) => return Err(e.into()),
                    }
                },
                out = write_rx.recv() => {
                    if let Some(text) = out {
                        sink.send(Message::Text(text.into())).await?;
                    }
                },
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to parse NapCat frame");
                return;
            },
        };

        if let Some(echo) = value.get("echo").and_then(Value::as_str) {
            let waiter = lock(&self.pending).remove(echo);
            if let Some(tx) = waiter {
                let _ = tx.send(serde_json::from_value::<ApiResponse>(value).map_err(Error::from));
                return;
            }
        }

        match Event::from_value(value) {
            Some(Ok(event)) => self.handler.on_event(event),
            Some(Err(e)) => warn!(error = %e, "malformed NapCat event"),
            None => debug!("dropping unmatched NapCat frame"),
        }
    }
}

#[async_trait]
impl OneBotApi for WsClient {
    async fn call_api(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ApiResponse> {
        WsClient::call_api(self, action, params, timeout).await
    }

    fn is_connected(&self) -> bool {
        WsClient::is_connected(self)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        serde_json::json,
        std::sync::atomic::AtomicUsize,
        tokio::net::{TcpListener, TcpStream},
        tokio_tungstenite::{
            WebSocketStream, accept_hdr_async,
            tungstenite::handshake::server::{Request, Response},
        },
    };

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl ClientEvents for Recorder {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_event(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, Option<String>) {
        let (stream, _) = listener.accept().await.unwrap();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            *slot.lock().unwrap() = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(resp)
        })
        .await
        .unwrap();
        let auth = seen.lock().unwrap().clone();
        (ws, auth)
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    fn options(url: &str) -> WsClientOptions {
        WsClientOptions {
            reconnect_interval: Duration::from_millis(50),
            ..WsClientOptions::new(url)
        }
    }

    #[tokio::test]
    async fn call_correlates_echo_and_sends_bearer_token() {
        let (listener, url) = listen().await;
        let recorder = Arc::new(Recorder::default());
        let client = WsClient::new(
            options(&url).with_access_token(Some(Secret::new("s3cret".into()))),
            recorder.clone(),
        );
        client.start();

        let (mut ws, auth) = accept(&listener).await;
        assert_eq!(auth.as_deref(), Some("Bearer s3cret"));
        assert!(client.wait_connected(Duration::from_secs(2)).await);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move {
            caller
                .call_api("get_login_info", json!({}), None)
                .await
        });

        let request = next_text(&mut ws).await;
        assert_eq!(request["action"], "get_login_info");
        let echo = request["echo"].as_str().unwrap().to_string();
        assert!(echo.starts_with("oc_"));

        ws.send(Message::Text(
            json!({"post_type": "meta_event", "meta_event_type": "heartbeat", "self_id": 1})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(
            json!({"status": "ok", "retcode": 0, "data": {"user_id": 42, "nickname": "bot"}, "echo": echo})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

        let resp = call.await.unwrap().unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.data["user_id"], 42);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        client.stop();
    }

    #[tokio::test]
    async fn call_fails_fast_when_not_connected() {
        let client = WsClient::new(options("ws://127.0.0.1:9"), Arc::new(Recorder::default()));
        let err = client.call_api("get_status", json!({}), None).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(err.to_string(), "WebSocket not connected");
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let (listener, url) = listen().await;
        let client = WsClient::new(options(&url), Arc::new(Recorder::default()));
        client.start();
        let (_ws, _) = accept(&listener).await;
        assert!(client.wait_connected(Duration::from_secs(2)).await);

        let err = client
            .call_api("get_msg", json!({"message_id": 1}), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "API call get_msg timed out");
        client.stop();
    }

    #[tokio::test]
    async fn stop_rejects_pending_and_closes_normally() {
        let (listener, url) = listen().await;
        let client = WsClient::new(options(&url), Arc::new(Recorder::default()));
        client.start();
        let (mut ws, _) = accept(&listener).await;
        assert!(client.wait_connected(Duration::from_secs(2)).await);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.call_api("get_status", json!({}), None).await });
        let _ = next_text(&mut ws).await;

        client.stop();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Stopped));

        let close = loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        };
        assert_eq!(close.unwrap().code, CloseCode::Normal);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn silent_server_triggers_heartbeat_close_and_reconnect() {
        let (listener, url) = listen().await;
        let recorder = Arc::new(Recorder::default());
        let client = WsClient::new(
            WsClientOptions {
                heartbeat_timeout: Duration::from_millis(100),
                ..options(&url)
            },
            recorder.clone(),
        );
        client.start();

        let (mut first, _) = accept(&listener).await;
        let close = loop {
            match first.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        };
        assert_eq!(close.unwrap().code, CloseCode::from(HEARTBEAT_CLOSE_CODE));

        let (_second, _) = accept(&listener).await;
        assert!(client.wait_connected(Duration::from_secs(2)).await);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 2);
        client.stop();
    }

    #[tokio::test]
    async fn dropped_socket_rejects_in_flight_call_with_reconnecting() {
        let (listener, url) = listen().await;
        let client = WsClient::new(options(&url), Arc::new(Recorder::default()));
        client.start();
        let (mut ws, _) = accept(&listener).await;
        assert!(client.wait_connected(Duration::from_secs(2)).await);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.call_api("get_status", json!({}), None).await });
        let request = next_text(&mut ws).await;
        assert_eq!(request["action"], "get_status");
        drop(ws);

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("call should settle long before the default call timeout")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Reconnecting));
        assert!(lock(&client.pending).is_empty());

        // The reconnected session does not resurrect the old call.
        let (_second, _) = accept(&listener).await;
        assert!(client.wait_connected(Duration::from_secs(2)).await);
        assert!(lock(&client.pending).is_empty());
        client.stop();
    }

    #[tokio::test]
    async fn heartbeat_close_rejects_in_flight_call_with_reconnecting() {
        let (listener, url) = listen().await;
        let client = WsClient::new(
            WsClientOptions {
                heartbeat_timeout: Duration::from_millis(300),
                ..options(&url)
            },
            Arc::new(Recorder::default()),
        );
        client.start();
        let (mut ws, _) = accept(&listener).await;
        assert!(client.wait_connected(Duration::from_secs(2)).await);

        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move { caller.call_api("get_status", json!({}), None).await });
        let _ = next_text(&mut ws).await;

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("heartbeat loss should reject the call")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Reconnecting));
        client.stop();
    }

    #[test]
    fn echo_counter_wraps_into_positive_range() {
        let client = WsClient::new(options("ws://127.0.0.1:9"), Arc::new(Recorder::default()));
        client.seq.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(client.next_echo(), "oc_0");
        assert_eq!(client.next_echo(), "oc_1");
        client.seq.store(0x7FFF_FFFE, Ordering::Relaxed);
        assert_eq!(client.next_echo(), "oc_2147483647");
        assert_eq!(client.next_echo(), "oc_0");
    }

    #[test]
    fn debug_redacts_token() {
        let opts = options("ws://x").with_access_token(Some(Secret::new("hunter2".into())));
        let rendered = format!("{opts:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
