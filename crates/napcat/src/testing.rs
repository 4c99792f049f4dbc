//! Test doubles shared by the module tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    napgate_channels::{
        host::{ChannelHost, InboundContext, PeerRef, ReplyDispatch, ReplyKind, ResolvedRoute},
        pairing::MemoryPairingStore,
    },
    napgate_common::ReplyPayload,
    futures::{SinkExt, StreamExt},
    napgate_config::MemoryConfigProvider,
    serde_json::{Value, json},
    tokio::net::TcpListener,
    tokio_tungstenite::{accept_async, tungstenite::Message},
};

use crate::{
    client::OneBotApi,
    context::{AccountContext, ChannelDeps},
    error::{Error, Result},
    frame::ApiResponse,
    media::MediaFetcher,
    state::AccountState,
};

/// Records every API call and answers from canned responses.
pub(crate) struct RecordingApi {
    calls: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, Value>>,
    connected: AtomicBool,
    next_id: AtomicU64,
}

impl RecordingApi {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
        })
    }

    /// Answer `action` with `status = ok` and `data`.
    pub(crate) fn respond(&self, action: &str, data: Value) {
        self.respond_with(action, json!({"status": "ok", "retcode": 0, "data": data}));
    }

    /// Answer `action` with a full response frame.
    pub(crate) fn respond_with(&self, action: &str, frame: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(action.to_string(), frame);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, action: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(a, _)| a == action)
            .map(|(_, params)| params)
            .collect()
    }

    /// Text of every message sent to `target` (`<qq>` or `g<group>`).
    pub(crate) fn texts_to(&self, target: &str) -> Vec<String> {
        let (action, key, id) = match target.strip_prefix('g') {
            Some(gid) => ("send_group_msg", "group_id", gid),
            None => ("send_private_msg", "user_id", target),
        };
        self.calls_to(action)
            .into_iter()
            .filter(|p| p[key].to_string().trim_matches('"') == id)
            .map(|p| {
                p["message"]
                    .as_array()
                    .map(|segs| {
                        segs.iter()
                            .filter_map(|s| s["data"]["text"].as_str())
                            .collect::<String>()
                    })
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[async_trait]
impl OneBotApi for RecordingApi {
    async fn call_api(
        &self,
        action: &str,
        params: Value,
        _timeout: Option<Duration>,
    ) -> Result<ApiResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), params));
        let frame = self.responses.lock().unwrap().get(action).cloned();
        let frame = frame.unwrap_or_else(|| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            json!({"status": "ok", "retcode": 0, "data": {"message_id": id}})
        });
        Ok(serde_json::from_value(frame)?)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Agent host that records sessions and dispatches, replying with a fixed
/// payload list.
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub(crate) dispatched: Mutex<Vec<InboundContext>>,
    pub(crate) recorded: Mutex<Vec<String>>,
    pub(crate) replies: Mutex<Vec<ReplyPayload>>,
    pub(crate) delivery_errors: Mutex<Vec<String>>,
    pub(crate) typing: Mutex<Vec<&'static str>>,
}

impl RecordingHost {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn reply_with(&self, payload: ReplyPayload) {
        self.replies.lock().unwrap().push(payload);
    }

    pub(crate) fn dispatched(&self) -> Vec<InboundContext> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelHost for RecordingHost {
    fn resolve_route(
        &self,
        _cfg: &Value,
        channel: &str,
        account_id: &str,
        peer: &PeerRef,
    ) -> ResolvedRoute {
        ResolvedRoute {
            agent_id: "main".into(),
            session_key: format!("{channel}:{account_id}:{}", peer.id),
            account_id: account_id.into(),
        }
    }

    fn resolve_store_path(&self, _cfg: &Value, agent_id: &str) -> String {
        format!("/tmp/sessions/{agent_id}")
    }

    async fn session_updated_at(
        &self,
        _store_path: &str,
        _session_key: &str,
    ) -> Option<DateTime<Utc>> {
        None
    }

    async fn record_inbound_session(
        &self,
        _store_path: &str,
        session_key: &str,
        _ctx: &InboundContext,
    ) -> anyhow::Result<()> {
        self.recorded.lock().unwrap().push(session_key.to_string());
        Ok(())
    }

    async fn dispatch_reply(
        &self,
        ctx: InboundContext,
        _cfg: &Value,
        dispatch: ReplyDispatch,
    ) -> anyhow::Result<()> {
        self.dispatched.lock().unwrap().push(ctx);
        if let Some(typing) = &dispatch.typing {
            typing.start().await;
            self.typing.lock().unwrap().push("start");
        }
        let replies = self.replies.lock().unwrap().clone();
        for payload in replies {
            if let Err(e) = dispatch.deliver.deliver(payload, ReplyKind::Final).await {
                self.delivery_errors.lock().unwrap().push(e.to_string());
            }
        }
        if let Some(typing) = &dispatch.typing {
            typing.stop().await;
            self.typing.lock().unwrap().push("stop");
        }
        Ok(())
    }
}

/// Config document holding one `default` account.
pub(crate) fn config_with_account(account: Value) -> Value {
    json!({"channels": {"napcatqq": {"accounts": {"default": account}}}})
}

/// An account context wired to recording fakes.
pub(crate) struct Harness {
    pub(crate) api: Arc<RecordingApi>,
    pub(crate) host: Arc<RecordingHost>,
    pub(crate) pairing: MemoryPairingStore,
    pub(crate) config: Arc<MemoryConfigProvider>,
    pub(crate) ctx: AccountContext,
}

impl Harness {
    pub(crate) fn new(account: Value) -> Self {
        Self::with_api(RecordingApi::new(), account)
    }

    pub(crate) fn with_api(api: Arc<RecordingApi>, account: Value) -> Self {
        let host = RecordingHost::new();
        let pairing = MemoryPairingStore::new();
        let config = Arc::new(MemoryConfigProvider::new(config_with_account(account)));
        let deps = ChannelDeps::new(config.clone(), host.clone(), Arc::new(pairing.clone()));
        let ctx = AccountContext {
            account_id: "default".into(),
            state: Arc::new(AccountState::new("default", None, Vec::new(), 50)),
            api: api.clone(),
            deps,
            media: MediaFetcher::with_audio_dir(std::env::temp_dir().join("napgate-test-audio")),
        };
        Self {
            api,
            host,
            pairing,
            config,
            ctx,
        }
    }
}

pub(crate) fn test_context(
    api: &Arc<RecordingApi>,
    account: Value,
) -> (AccountContext, Arc<MemoryConfigProvider>) {
    let harness = Harness::with_api(Arc::clone(api), account);
    (harness.ctx, harness.config)
}

/// Requests received by [`serve_napcat`].
pub(crate) type Requests = Arc<Mutex<Vec<Value>>>;

/// A minimal NapCat over a real WebSocket. Identifies as QQ 10 ("bot"),
/// lists one friend and one group, and acknowledges everything else with a
/// message id. Returns the `ws://` URL and the recorded requests.
pub(crate) async fn serve_napcat() -> (String, Requests) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let requests: Requests = Arc::default();
    let seen = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(frame)) = ws.next().await {
                    let Message::Text(text) = frame else {
                        continue;
                    };
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    let data = match request["action"].as_str() {
                        Some("get_login_info") => json!({"user_id": 10, "nickname": "bot"}),
                        Some("get_group_msg_history") => json!({"messages": []}),
                        Some("get_friend_list") => json!([{"user_id": 77, "nickname": "alice", "remark": "Al"}]),
                        Some("get_group_list") => json!([{"group_id": 500, "group_name": "Rustaceans"}]),
                        _ => json!({"message_id": 1}),
                    };
                    let echo = request["echo"].clone();
                    seen.lock().unwrap().push(request);
                    let reply = json!({"status": "ok", "retcode": 0, "data": data, "echo": echo});
                    if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (url, requests)
}

/// Actions recorded by [`serve_napcat`], in order.
pub(crate) fn actions(requests: &Requests) -> Vec<String> {
    requests
        .lock()
        .unwrap()
        .iter()
        .filter_map(|r| r["action"].as_str().map(str::to_string))
        .collect()
}

/// Poll `done` every 10 ms for up to two seconds.
pub(crate) async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
