//! [`SessionClient`] – Cortex session negotiation and the mental-command
//! stream.
//!
//! Negotiation is strictly linear. Each step is one JSON-RPC request whose
//! response is matched by the request id the client generated; everything
//! else that arrives in the meantime (stale responses, stream samples,
//! warnings) is discarded.
//!
//! ```text
//! Connected ─requestAccess─▶ AccessRequested ─authorize─▶ Authorized
//!   ─queryHeadsets─▶ HeadsetResolved ─[getCurrentProfile/setupProfile]─▶ ProfileLoaded
//!   ─createSession─▶ SessionOpened ─updateSession─▶ SessionActive
//!   ─subscribe─▶ Subscribed ─▶ Streaming ─▶ Closing ─▶ Closed
//! ```
//!
//! Calling a step from the wrong phase fails with
//! [`NeoError::InvalidPhase`] without touching the wire.

use std::fmt;
use std::time::Duration;

use futures_util::Stream;
use neogrip_types::{CommandEvent, NeoError};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::transport::{RpcTransport, WsTransport};

/// Upper bound on each teardown request, so a silent service cannot keep
/// the process from exiting. Negotiation and streaming have no timeout; see
/// "RPC timeouts" under the open-question decisions in DESIGN.md.
const SHUTDOWN_RPC_TIMEOUT: Duration = Duration::from_secs(2);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Credentials and negotiation options for one Cortex session.
#[derive(Clone)]
pub struct SessionConfig {
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
    /// Number of sessions to debit from the license on `authorize`.
    pub debit: u32,
    pub license: String,
    /// Training profile holding the user's mental-command signatures.
    pub profile: Option<String>,
    pub load_profile: bool,
    /// Ask Cortex to connect the headset before opening the session.
    pub connect_headset: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: Zeroizing::new(String::new()),
            debit: 10,
            license: String::new(),
            profile: None,
            load_profile: false,
            connect_headset: false,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("debit", &self.debit)
            .field("license", &self.license)
            .field("profile", &self.profile)
            .field("load_profile", &self.load_profile)
            .field("connect_headset", &self.connect_headset)
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Phases
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connected,
    AccessRequested,
    Authorized,
    HeadsetResolved,
    ProfileLoaded,
    SessionOpened,
    SessionActive,
    Subscribed,
    Streaming,
    Closing,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Headset selection
// ────────────────────────────────────────────────────────────────────────────

/// Pick the headset to stream from.
///
/// A connected virtual headset wins (handy on a development machine with
/// both a real and a virtual device), otherwise the first connected one.
///
/// # Errors
///
/// [`NeoError::NoHeadset`] for an empty list, [`NeoError::NoConnectedHeadset`]
/// if nothing is connected.
pub fn select_headset(headsets: &[Value]) -> Result<String, NeoError> {
    if headsets.is_empty() {
        return Err(NeoError::NoHeadset);
    }
    let connected = |h: &&Value| h.get("status").and_then(Value::as_str) == Some("connected");
    let is_virtual = |h: &&Value| h.get("isVirtual").and_then(Value::as_bool) == Some(true);

    headsets
        .iter()
        .filter(connected)
        .find(is_virtual)
        .or_else(|| headsets.iter().find(connected))
        .and_then(|h| h.get("id").and_then(Value::as_str))
        .map(str::to_owned)
        .ok_or(NeoError::NoConnectedHeadset)
}

// ────────────────────────────────────────────────────────────────────────────
// Stream decoding
// ────────────────────────────────────────────────────────────────────────────

/// Decode a `com` stream sample: `{"com": ["push", 0.61], "sid": .., "time": ..}`.
///
/// `None` when the message is not a `com` sample at all, `Some(Err)` when it
/// is one but malformed.
fn decode_com(msg: &Value) -> Option<Result<CommandEvent, String>> {
    let com = msg.get("com")?;
    let parsed = com.as_array().and_then(|items| {
        let act = items.first()?.as_str()?;
        let pow = items.get(1)?.as_f64()?;
        Some(CommandEvent::new(act, pow))
    });
    Some(parsed.ok_or_else(|| format!("malformed com payload: {com}")))
}

// ────────────────────────────────────────────────────────────────────────────
// SessionClient
// ────────────────────────────────────────────────────────────────────────────

pub struct SessionClient<T> {
    transport: T,
    config: SessionConfig,
    phase: Phase,
    next_id: u64,
    token: Option<Zeroizing<String>>,
    headset: Option<String>,
    session_id: Option<String>,
}

impl SessionClient<WsTransport> {
    /// Open the WebSocket to Cortex at `url`.
    pub async fn connect(
        url: &str,
        insecure_tls: bool,
        config: SessionConfig,
    ) -> Result<Self, NeoError> {
        let transport = WsTransport::connect(url, insecure_tls).await?;
        Ok(Self::new(transport, config))
    }
}

impl<T: RpcTransport> SessionClient<T> {
    /// Wrap an already-open transport; the client starts in
    /// [`Phase::Connected`].
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            phase: Phase::Connected,
            next_id: 1,
            token: None,
            headset: None,
            session_id: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn headset(&self) -> Option<&str> {
        self.headset.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Run every negotiation step in order, ending in [`Phase::Subscribed`].
    pub async fn negotiate(&mut self) -> Result<(), NeoError> {
        self.request_access().await?;
        self.authorize().await?;
        self.resolve_headset().await?;
        if self.config.connect_headset {
            self.connect_headset().await?;
        }
        if self.config.load_profile {
            self.load_profile().await?;
        }
        self.create_session().await?;
        self.activate().await?;
        self.subscribe().await?;
        Ok(())
    }

    pub async fn request_access(&mut self) -> Result<(), NeoError> {
        self.expect_phase("requestAccess", &[Phase::Connected])?;
        let params = json!({
            "clientId": self.config.client_id,
            "clientSecret": self.config.client_secret.as_str(),
        });
        let result = self.call("requestAccess", params).await?;
        if result.get("accessGranted").and_then(Value::as_bool) != Some(true) {
            return Err(NeoError::AccessDenied);
        }
        self.phase = Phase::AccessRequested;
        info!("Cortex access granted");
        Ok(())
    }

    pub async fn authorize(&mut self) -> Result<(), NeoError> {
        self.expect_phase("authorize", &[Phase::AccessRequested])?;
        let params = json!({
            "clientId": self.config.client_id,
            "clientSecret": self.config.client_secret.as_str(),
            "debit": self.config.debit,
            "license": self.config.license,
        });
        let result = self.call("authorize", params).await?;
        let token = required_str(&result, "authorize", "cortexToken")?;
        self.token = Some(Zeroizing::new(token));
        self.phase = Phase::Authorized;
        info!("authorized with Cortex");
        Ok(())
    }

    /// Query headsets and remember the one to use.
    pub async fn resolve_headset(&mut self) -> Result<String, NeoError> {
        self.expect_phase("queryHeadsets", &[Phase::Authorized])?;
        let result = self.call("queryHeadsets", json!({})).await?;
        let list = result.as_array().map(Vec::as_slice).unwrap_or_default();
        let headset = select_headset(list)?;
        info!(headset = %headset, available = list.len(), "headset selected");
        self.headset = Some(headset.clone());
        self.phase = Phase::HeadsetResolved;
        Ok(headset)
    }

    /// `controlDevice connect` for the selected headset. Does not change the
    /// phase.
    pub async fn connect_headset(&mut self) -> Result<(), NeoError> {
        self.expect_phase("controlDevice", &[Phase::HeadsetResolved])?;
        let headset = self.headset_id("controlDevice")?;
        self.call(
            "controlDevice",
            json!({ "command": "connect", "headset": headset }),
        )
        .await?;
        info!(headset = %headset, "headset connect requested");
        Ok(())
    }

    /// Make the configured profile the active one on the selected headset.
    ///
    /// A different profile loaded by another application is never unloaded;
    /// that is a [`NeoError::ProfileConflict`].
    pub async fn load_profile(&mut self) -> Result<(), NeoError> {
        self.expect_phase("setupProfile", &[Phase::HeadsetResolved])?;
        let wanted = self.config.profile.clone().ok_or_else(|| {
            NeoError::InvalidConfig("load_profile is set but no profile is configured".to_string())
        })?;
        let token = self.token_str("getCurrentProfile")?;
        let headset = self.headset_id("getCurrentProfile")?;

        let current = self
            .call(
                "getCurrentProfile",
                json!({ "cortexToken": token.as_str(), "headset": headset }),
            )
            .await?;
        let active = current.get("name").and_then(Value::as_str).map(str::to_owned);
        let loaded_by_us = current
            .get("loadedByThisApp")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match active {
            Some(name) if name == wanted => {
                info!(profile = %wanted, "profile already active");
            }
            Some(name) if !loaded_by_us => {
                return Err(NeoError::ProfileConflict { active: name });
            }
            other => {
                if let Some(name) = other {
                    info!(profile = %name, "unloading previous profile");
                    self.setup_profile(&token, &headset, "", "unload").await?;
                }
                self.setup_profile(&token, &headset, &wanted, "load").await?;
                info!(profile = %wanted, "profile loaded");
            }
        }
        self.phase = Phase::ProfileLoaded;
        Ok(())
    }

    pub async fn create_session(&mut self) -> Result<(), NeoError> {
        self.expect_phase(
            "createSession",
            &[Phase::HeadsetResolved, Phase::ProfileLoaded],
        )?;
        let token = self.token_str("createSession")?;
        let headset = self.headset_id("createSession")?;
        let result = self
            .call(
                "createSession",
                json!({ "cortexToken": token.as_str(), "headset": headset, "status": "open" }),
            )
            .await?;
        let id = required_str(&result, "createSession", "id")?;
        info!(session = %id, "session opened");
        self.session_id = Some(id);
        self.phase = Phase::SessionOpened;
        Ok(())
    }

    pub async fn activate(&mut self) -> Result<(), NeoError> {
        self.expect_phase("updateSession", &[Phase::SessionOpened])?;
        let token = self.token_str("updateSession")?;
        let session = self.session("updateSession")?;
        self.call(
            "updateSession",
            json!({ "cortexToken": token.as_str(), "session": session, "status": "active" }),
        )
        .await?;
        self.phase = Phase::SessionActive;
        Ok(())
    }

    pub async fn subscribe(&mut self) -> Result<(), NeoError> {
        self.expect_phase("subscribe", &[Phase::SessionActive])?;
        let token = self.token_str("subscribe")?;
        let session = self.session("subscribe")?;
        let result = self
            .call(
                "subscribe",
                json!({ "cortexToken": token.as_str(), "session": session, "streams": ["com"] }),
            )
            .await?;
        if let Some(failure) = result.get("failure").and_then(Value::as_array) {
            if !failure.is_empty() {
                let failure = serde_json::Value::Array(failure.clone());
                warn!(failure = %failure, "some streams were not subscribed");
            }
        }
        self.phase = Phase::Subscribed;
        info!(session = %session, "subscribed to mental commands");
        Ok(())
    }

    /// Wait for the next mental-command sample.
    ///
    /// Returns `Ok(None)` once Cortex closes the connection. Non-`com`
    /// messages, malformed samples and unsolicited errors are logged and
    /// skipped.
    pub async fn next_command(&mut self) -> Result<Option<CommandEvent>, NeoError> {
        self.expect_phase("stream", &[Phase::Subscribed, Phase::Streaming])?;
        self.phase = Phase::Streaming;
        loop {
            let Some(text) = self.transport.recv().await? else {
                info!("Cortex stream closed");
                return Ok(None);
            };
            let msg: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "skipping non-JSON message");
                    continue;
                }
            };
            match decode_com(&msg) {
                Some(Ok(event)) => return Ok(Some(event)),
                Some(Err(reason)) => warn!(%reason, "skipping sample"),
                None if msg.get("error").is_some() => {
                    warn!(error = %msg["error"], "unsolicited error from Cortex");
                }
                None => debug!("ignoring non-com message"),
            }
        }
    }

    /// The command stream as a [`Stream`]. Ends when the connection closes
    /// or after the first error.
    pub fn stream(&mut self) -> impl Stream<Item = Result<CommandEvent, NeoError>> + '_ {
        futures_util::stream::unfold(Some(self), |state| async move {
            let client = state?;
            match client.next_command().await {
                Ok(Some(event)) => Some((Ok(event), Some(client))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Close the session, release the client and close the transport.
    ///
    /// Each step is attempted independently; failures are logged and
    /// swallowed. A second call does nothing.
    pub async fn shutdown(&mut self) {
        if matches!(self.phase, Phase::Closing | Phase::Closed) {
            return;
        }
        self.phase = Phase::Closing;

        if let (Some(token), Some(session)) = (self.token.clone(), self.session_id.clone()) {
            let params = json!({
                "cortexToken": token.as_str(),
                "session": session,
                "status": "close",
            });
            match tokio::time::timeout(SHUTDOWN_RPC_TIMEOUT, self.call("updateSession", params)).await {
                Ok(Ok(_)) => info!(session = %session, "session closed"),
                Ok(Err(e)) => warn!(error = %e, "failed to close session"),
                Err(_) => warn!("timed out closing session"),
            }
        }
        match tokio::time::timeout(SHUTDOWN_RPC_TIMEOUT, self.call("release", json!({}))).await {
            Ok(Ok(_)) => debug!("client released"),
            Ok(Err(e)) => warn!(error = %e, "failed to release client"),
            Err(_) => warn!("timed out releasing client"),
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "failed to close Cortex connection");
        }

        self.session_id = None;
        self.token = None;
        self.phase = Phase::Closed;
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn expect_phase(&self, step: &'static str, allowed: &[Phase]) -> Result<(), NeoError> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(Phase::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(NeoError::InvalidPhase {
            step,
            expected,
            actual: self.phase.to_string(),
        })
    }

    /// One request/response exchange.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, NeoError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "rpc request");
        self.transport.send(request.to_string()).await?;

        loop {
            let Some(text) = self.transport.recv().await? else {
                return Err(NeoError::Connectivity(format!(
                    "connection closed while waiting for {method} (id {id})"
                )));
            };
            let msg: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(method, error = %e, "discarding non-JSON message");
                    continue;
                }
            };
            if msg.get("id").and_then(Value::as_u64) != Some(id) {
                debug!(method, id, "discarding unrelated message");
                continue;
            }
            if let Some(error) = msg.get("error") {
                return Err(NeoError::Protocol {
                    method: method.to_string(),
                    payload: error.to_string(),
                });
            }
            return Ok(msg.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn setup_profile(
        &mut self,
        token: &str,
        headset: &str,
        profile: &str,
        status: &str,
    ) -> Result<(), NeoError> {
        self.call(
            "setupProfile",
            json!({
                "cortexToken": token,
                "headset": headset,
                "profile": profile,
                "status": status,
            }),
        )
        .await
        .map(drop)
    }

    fn token_str(&self, step: &'static str) -> Result<Zeroizing<String>, NeoError> {
        self.token.clone().ok_or_else(|| missing(step, "cortex token"))
    }

    fn headset_id(&self, step: &'static str) -> Result<String, NeoError> {
        self.headset.clone().ok_or_else(|| missing(step, "headset"))
    }

    fn session(&self, step: &'static str) -> Result<String, NeoError> {
        self.session_id.clone().ok_or_else(|| missing(step, "session"))
    }
}

fn missing(step: &'static str, what: &str) -> NeoError {
    NeoError::InvalidPhase {
        step,
        expected: format!("a {what}"),
        actual: "none".to_string(),
    }
}

fn required_str(result: &Value, method: &str, field: &str) -> Result<String, NeoError> {
    result
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| NeoError::Protocol {
            method: method.to_string(),
            payload: format!("result has no '{field}': {result}"),
        })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Responder = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

    /// In-memory transport: every request is answered by `responder`, and
    /// `tail` is delivered once the responder runs dry of requests.
    pub(crate) struct ScriptedTransport {
        pub sent: Arc<Mutex<Vec<Value>>>,
        inbox: VecDeque<String>,
        responder: Responder,
        pub closed: Arc<Mutex<bool>>,
    }

    impl ScriptedTransport {
        pub fn new(responder: impl FnMut(&Value) -> Vec<Value> + Send + 'static) -> Self {
            Self {
                sent: Arc::default(),
                inbox: VecDeque::new(),
                responder: Box::new(responder),
                closed: Arc::default(),
            }
        }

        /// Queue unsolicited messages (e.g. stream samples).
        pub fn push(&mut self, msg: Value) {
            self.inbox.push_back(msg.to_string());
        }

        pub fn methods(sent: &Arc<Mutex<Vec<Value>>>) -> Vec<String> {
            sent.lock()
                .unwrap()
                .iter()
                .map(|r| r["method"].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn send(&mut self, text: String) -> Result<(), NeoError> {
            if *self.closed.lock().unwrap() {
                return Err(NeoError::Connectivity("closed".to_string()));
            }
            let request: Value = serde_json::from_str(&text).unwrap();
            let replies = (self.responder)(&request);
            self.sent.lock().unwrap().push(request);
            // Replies go ahead of any queued stream samples.
            for reply in replies.into_iter().rev() {
                self.inbox.push_front(reply.to_string());
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, NeoError> {
            Ok(self.inbox.pop_front())
        }

        async fn close(&mut self) -> Result<(), NeoError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    pub(crate) fn ok(request: &Value, result: Value) -> Value {
        json!({ "id": request["id"], "jsonrpc": "2.0", "result": result })
    }

    /// A Cortex that grants everything and offers one connected headset.
    pub(crate) fn happy_cortex(request: &Value) -> Vec<Value> {
        let result = match request["method"].as_str().unwrap() {
            "requestAccess" => json!({ "accessGranted": true }),
            "authorize" => json!({ "cortexToken": "tok-123" }),
            "queryHeadsets" => json!([
                { "id": "EPOCX-1", "status": "discovered", "isVirtual": false },
                { "id": "EPOCX-2", "status": "connected", "isVirtual": false },
            ]),
            "createSession" => json!({ "id": "sess-9", "status": "opened" }),
            "subscribe" => json!({ "success": [{ "streamName": "com" }], "failure": [] }),
            _ => json!({}),
        };
        vec![ok(request, result)]
    }

    pub(crate) fn config() -> SessionConfig {
        SessionConfig {
            client_id: "cid".to_string(),
            client_secret: Zeroizing::new("secret".to_string()),
            ..SessionConfig::default()
        }
    }

    fn com(act: &str, pow: f64) -> Value {
        json!({ "com": [act, pow], "sid": "sess-9", "time": 1.0 })
    }

    #[tokio::test]
    async fn negotiates_in_order_with_increasing_ids() {
        let transport = ScriptedTransport::new(happy_cortex);
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, config());

        client.negotiate().await.unwrap();
        assert_eq!(client.phase(), Phase::Subscribed);
        assert_eq!(client.headset(), Some("EPOCX-2"));
        assert_eq!(client.session_id(), Some("sess-9"));

        assert_eq!(
            ScriptedTransport::methods(&sent),
            vec![
                "requestAccess",
                "authorize",
                "queryHeadsets",
                "createSession",
                "updateSession",
                "subscribe"
            ]
        );
        let sent = sent.lock().unwrap();
        let ids: Vec<u64> = sent.iter().map(|r| r["id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

        assert_eq!(sent[1]["params"]["debit"], 10);
        assert_eq!(sent[1]["params"]["license"], "");
        assert_eq!(sent[3]["params"]["cortexToken"], "tok-123");
        assert_eq!(sent[3]["params"]["status"], "open");
        assert_eq!(sent[4]["params"]["status"], "active");
        assert_eq!(sent[4]["params"]["session"], "sess-9");
        assert_eq!(sent[5]["params"]["streams"], json!(["com"]));
    }

    #[tokio::test]
    async fn no_headset_fails_before_create_session() {
        let transport = ScriptedTransport::new(|req| {
            if req["method"] == "queryHeadsets" {
                vec![ok(req, json!([]))]
            } else {
                happy_cortex(req)
            }
        });
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, config());

        let err = client.negotiate().await.unwrap_err();
        assert!(matches!(err, NeoError::NoHeadset));
        assert!(!ScriptedTransport::methods(&sent).contains(&"createSession".to_string()));
    }

    #[tokio::test]
    async fn access_not_granted_is_access_denied() {
        let transport = ScriptedTransport::new(|req| vec![ok(req, json!({ "accessGranted": false }))]);
        let mut client = SessionClient::new(transport, config());
        assert!(matches!(client.negotiate().await, Err(NeoError::AccessDenied)));
        assert_eq!(client.phase(), Phase::Connected);
    }

    #[tokio::test]
    async fn error_response_aborts_with_method_and_payload() {
        let transport = ScriptedTransport::new(|req| {
            if req["method"] == "authorize" {
                vec![json!({ "id": req["id"], "error": { "code": -32021, "message": "Invalid client credentials." } })]
            } else {
                happy_cortex(req)
            }
        });
        let mut client = SessionClient::new(transport, config());
        match client.negotiate().await.unwrap_err() {
            NeoError::Protocol { method, payload } => {
                assert_eq!(method, "authorize");
                assert!(payload.contains("-32021"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrelated_messages_are_discarded_while_waiting() {
        let transport = ScriptedTransport::new(|req| {
            let mut replies = vec![
                com("push", 0.9),
                json!({ "id": 999, "result": { "accessGranted": false } }),
                json!("not an object"),
            ];
            replies.extend(happy_cortex(req));
            replies
        });
        let mut client = SessionClient::new(transport, config());
        client.negotiate().await.unwrap();
        assert_eq!(client.phase(), Phase::Subscribed);
    }

    #[tokio::test]
    async fn closed_connection_during_wait_is_connectivity() {
        let transport = ScriptedTransport::new(|_| Vec::new());
        let mut client = SessionClient::new(transport, config());
        assert!(matches!(client.request_access().await, Err(NeoError::Connectivity(_))));
    }

    #[tokio::test]
    async fn out_of_order_steps_are_rejected_without_io() {
        let transport = ScriptedTransport::new(happy_cortex);
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, config());

        assert!(matches!(client.authorize().await, Err(NeoError::InvalidPhase { .. })));
        assert!(matches!(client.create_session().await, Err(NeoError::InvalidPhase { .. })));
        assert!(matches!(client.next_command().await, Err(NeoError::InvalidPhase { .. })));
        assert!(sent.lock().unwrap().is_empty());

        client.request_access().await.unwrap();
        assert!(matches!(client.request_access().await, Err(NeoError::InvalidPhase { .. })));
    }

    #[test]
    fn headset_policy() {
        let virtual_and_real = [
            json!({ "id": "REAL", "status": "connected", "isVirtual": false }),
            json!({ "id": "VIRT-OFF", "status": "discovered", "isVirtual": true }),
            json!({ "id": "VIRT", "status": "connected", "isVirtual": true }),
        ];
        assert_eq!(select_headset(&virtual_and_real).unwrap(), "VIRT");

        let real_only = [
            json!({ "id": "A", "status": "discovered" }),
            json!({ "id": "B", "status": "connected" }),
            json!({ "id": "C", "status": "connected" }),
        ];
        assert_eq!(select_headset(&real_only).unwrap(), "B");

        let none_connected = [json!({ "id": "A", "status": "connecting" })];
        assert!(matches!(select_headset(&none_connected), Err(NeoError::NoConnectedHeadset)));
        assert!(matches!(select_headset(&[]), Err(NeoError::NoHeadset)));
    }

    #[tokio::test]
    async fn connect_headset_sends_control_device() {
        let transport = ScriptedTransport::new(happy_cortex);
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(
            transport,
            SessionConfig {
                connect_headset: true,
                ..config()
            },
        );
        client.negotiate().await.unwrap();
        let sent = sent.lock().unwrap();
        assert_eq!(sent[3]["method"], "controlDevice");
        assert_eq!(sent[3]["params"], json!({ "command": "connect", "headset": "EPOCX-2" }));
    }

    fn profile_cortex(active: Option<&'static str>, ours: bool) -> impl FnMut(&Value) -> Vec<Value> + Send {
        move |req: &Value| {
            if req["method"] == "getCurrentProfile" {
                vec![ok(req, json!({ "name": active, "loadedByThisApp": ours }))]
            } else {
                happy_cortex(req)
            }
        }
    }

    fn profile_config() -> SessionConfig {
        SessionConfig {
            profile: Some("alice".to_string()),
            load_profile: true,
            ..config()
        }
    }

    fn setup_calls(sent: &Arc<Mutex<Vec<Value>>>) -> Vec<(String, String)> {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|r| r["method"] == "setupProfile")
            .map(|r| {
                (
                    r["params"]["status"].as_str().unwrap().to_string(),
                    r["params"]["profile"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn loads_profile_when_none_active() {
        let transport = ScriptedTransport::new(profile_cortex(None, false));
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, profile_config());
        client.negotiate().await.unwrap();
        assert_eq!(setup_calls(&sent), vec![("load".to_string(), "alice".to_string())]);
    }

    #[tokio::test]
    async fn replaces_own_previous_profile() {
        let transport = ScriptedTransport::new(profile_cortex(Some("bob"), true));
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, profile_config());
        client.negotiate().await.unwrap();
        assert_eq!(
            setup_calls(&sent),
            vec![
                ("unload".to_string(), String::new()),
                ("load".to_string(), "alice".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn foreign_profile_is_a_conflict() {
        let transport = ScriptedTransport::new(profile_cortex(Some("bob"), false));
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, profile_config());
        match client.negotiate().await.unwrap_err() {
            NeoError::ProfileConflict { active } => assert_eq!(active, "bob"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(setup_calls(&sent).is_empty());
        assert!(!ScriptedTransport::methods(&sent).contains(&"createSession".to_string()));
    }

    #[tokio::test]
    async fn already_active_profile_is_kept() {
        let transport = ScriptedTransport::new(profile_cortex(Some("alice"), false));
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, profile_config());
        client.negotiate().await.unwrap();
        assert!(setup_calls(&sent).is_empty());
    }

    #[tokio::test]
    async fn stream_decodes_com_and_skips_noise() {
        let mut transport = ScriptedTransport::new(happy_cortex);
        transport.push(json!({ "warning": { "code": 142, "message": "headset disconnected" } }));
        transport.push(com("push", 0.61));
        transport.push(json!({ "com": ["pull"] }));
        transport.push(json!({ "error": { "code": -32000 } }));
        transport.push(json!({ "com": [7, "x"] }));
        transport.push(com("neutral", 0.0));
        let mut client = SessionClient::new(transport, config());
        client.negotiate().await.unwrap();

        let events: Vec<CommandEvent> = client
            .stream()
            .map(|r| r.unwrap())
            .collect()
            .await;
        let pairs: Vec<(&str, f64)> = events.iter().map(|e| (e.act.as_str(), e.pow)).collect();
        assert_eq!(pairs, vec![("push", 0.61), ("neutral", 0.0)]);
        assert_eq!(client.phase(), Phase::Streaming);
    }

    #[tokio::test]
    async fn shutdown_closes_releases_and_is_idempotent() {
        let transport = ScriptedTransport::new(happy_cortex);
        let sent = transport.sent.clone();
        let closed = transport.closed.clone();
        let mut client = SessionClient::new(transport, config());
        client.negotiate().await.unwrap();

        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(client.phase(), Phase::Closed);
        assert!(*closed.lock().unwrap());

        let sent = sent.lock().unwrap();
        let tail: Vec<&str> = sent[sent.len() - 2..]
            .iter()
            .map(|r| r["method"].as_str().unwrap())
            .collect();
        assert_eq!(tail, vec!["updateSession", "release"]);
        assert_eq!(sent[sent.len() - 2]["params"]["status"], "close");
        assert_eq!(sent.len(), 8);
    }

    #[tokio::test]
    async fn shutdown_swallows_errors() {
        let transport = ScriptedTransport::new(|req| {
            let method = req["method"].as_str().unwrap();
            if method == "release" || (method == "updateSession" && req["params"]["status"] == "close") {
                vec![json!({ "id": req["id"], "error": { "code": -1 } })]
            } else {
                happy_cortex(req)
            }
        });
        let mut client = SessionClient::new(transport, config());
        client.negotiate().await.unwrap();
        client.shutdown().await;
        assert_eq!(client.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn shutdown_before_session_only_releases() {
        let transport = ScriptedTransport::new(happy_cortex);
        let sent = transport.sent.clone();
        let mut client = SessionClient::new(transport, config());
        client.shutdown().await;
        assert_eq!(ScriptedTransport::methods(&sent), vec!["release"]);
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("secret\""));
        assert!(rendered.contains("[REDACTED]"));
    }
}
