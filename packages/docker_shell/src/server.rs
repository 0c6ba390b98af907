//! SSH listener: connection accept loop and channel bridging.
//!
//! Each accepted TCP stream is upgraded on its own task. The russh handler
//! for a connection does no session work itself: it turns channel opens,
//! channel requests and channel data into the queues a
//! [`SessionController`] consumes, and pumps session output back to the
//! client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pty_manager::{TerminalAllocator, TerminalGeometry};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::auth::{AuthPolicy, Credential};
use crate::config::ShellConfig;
use crate::session::{
    ChannelIo, ChannelKind, ChannelRequest, RequestKind, SessionController, SessionSettings,
};

/// Queue depth for channel requests awaiting the session's request task.
const REQUEST_QUEUE: usize = 16;

/// Queue depth for terminal output waiting to be sent to the client.
const OUTPUT_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// Load the host's private key. Failure here is fatal for the process.
pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key {}", path.display()))
}

/// The SSH front end.
#[derive(Clone)]
pub struct ShellServer {
    ssh: Arc<russh::server::Config>,
    settings: Arc<SessionSettings>,
    policy: Arc<dyn AuthPolicy>,
    allocator: Arc<dyn TerminalAllocator>,
}

impl ShellServer {
    pub fn new(
        config: &ShellConfig,
        host_key: KeyPair,
        policy: Arc<dyn AuthPolicy>,
        allocator: Arc<dyn TerminalAllocator>,
    ) -> Self {
        let ssh = russh::server::Config {
            inactivity_timeout: config.ssh.inactivity_timeout,
            auth_rejection_time: config.ssh.auth_rejection_time,
            keys: vec![host_key],
            ..Default::default()
        };

        Self {
            ssh: Arc::new(ssh),
            settings: Arc::new(config.session.clone()),
            policy,
            allocator,
        }
    }

    /// Listen on `addr` and serve connections until accepting fails.
    ///
    /// Handshake and authentication failures only drop the affected
    /// connection; a failing `bind` or `accept` is returned to the caller.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        info!(%addr, program = %self.settings.program, "listening");

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            debug!(%peer, "accepted TCP connection");
            let _ = stream.set_nodelay(true);

            let server = self.clone();
            tokio::spawn(async move { server.serve_connection(stream, peer).await });
        }
    }

    /// Run the SSH protocol over one accepted stream until the client goes away.
    pub async fn serve_connection<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self.connection(peer);
        match russh::server::run_stream(self.ssh.clone(), stream, handler).await {
            Ok(session) => match session.await {
                Ok(()) => debug!(%peer, "connection closed"),
                Err(e) => warn!(%peer, error = %e, "connection ended with error"),
            },
            Err(e) => warn!(%peer, error = %e, "failed to open new ssh server conn"),
        }
    }

    fn connection(&self, peer: SocketAddr) -> ConnectionHandler {
        ConnectionHandler {
            peer,
            user: None,
            settings: self.settings.clone(),
            policy: self.policy.clone(),
            allocator: self.allocator.clone(),
            channels: HashMap::new(),
        }
    }
}

/// The connection's end of one open session channel.
///
/// Dropping the bridge tells the session the channel is closed.
struct ChannelBridge {
    requests: mpsc::Sender<ChannelRequest>,
    /// `None` once the client has sent EOF.
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Set once a `pty-req` was accepted. Input arriving earlier is dropped.
    terminal_ready: bool,
    early_input_dropped: bool,
    _closed: DropGuard,
}

impl ChannelBridge {
    fn new(
        requests: mpsc::Sender<ChannelRequest>,
        input: mpsc::UnboundedSender<Vec<u8>>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            requests,
            input: Some(input),
            terminal_ready: false,
            early_input_dropped: false,
            _closed: closed.drop_guard(),
        }
    }

    /// Queue a request and wait for the session's verdict.
    async fn request(&mut self, kind: RequestKind) -> bool {
        let is_pty = matches!(kind, RequestKind::PtyReq(_));
        let (request, reply) = ChannelRequest::new(kind);
        if self.requests.send(request).await.is_err() {
            return false;
        }
        // A request task that stopped without answering counts as a refusal.
        let accepted = reply.await.unwrap_or(false);
        if is_pty && accepted {
            self.terminal_ready = true;
        }
        accepted
    }

    /// Queue client data for the terminal. Returns whether it was accepted.
    fn push_input(&mut self, data: &[u8]) -> bool {
        if !self.terminal_ready {
            if !self.early_input_dropped {
                warn!(len = data.len(), "dropping input sent before a terminal was allocated");
                self.early_input_dropped = true;
            }
            return false;
        }
        match &self.input {
            Some(input) => input.send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    fn end_input(&mut self) {
        self.input = None;
    }
}

/// Per-connection russh handler.
pub struct ConnectionHandler {
    peer: SocketAddr,
    user: Option<String>,
    settings: Arc<SessionSettings>,
    policy: Arc<dyn AuthPolicy>,
    allocator: Arc<dyn TerminalAllocator>,
    channels: HashMap<ChannelId, ChannelBridge>,
}

impl ConnectionHandler {
    fn decide(&mut self, user: &str, credential: &Credential) -> Auth {
        if self.policy.verify(user, credential) {
            info!(peer = %self.peer, user, method = credential.method(), "authenticated");
            self.user = Some(user.to_string());
            Auth::Accept
        } else {
            warn!(peer = %self.peer, user, method = credential.method(), "authentication rejected");
            Auth::Reject {
                proceed_with_methods: None,
            }
        }
    }

    fn admit_channel(&self, kind: ChannelKind) -> bool {
        match SessionController::admit(&kind) {
            Ok(()) => true,
            Err(rejection) => {
                warn!(peer = %self.peer, error = %rejection, "rejecting channel");
                false
            }
        }
    }

    /// Start a session controller for a freshly opened channel.
    fn open_session(&mut self, channel: ChannelId, session: &mut Session) {
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);
        // Input only flows once the terminal exists and the pipe task drains
        // it; sending never blocks the connection's other channels.
        let (input_tx, input) = mpsc::unbounded_channel();
        let (output, output_rx) = mpsc::channel(OUTPUT_QUEUE);
        let closed = CancellationToken::new();

        self.channels.insert(
            channel,
            ChannelBridge::new(requests_tx, input_tx, closed.clone()),
        );

        let controller = SessionController::new(self.settings.clone(), self.allocator.clone());
        let peer = self.peer;
        let user = self.user.clone().unwrap_or_default();
        tokio::spawn(async move {
            info!(%peer, %user, ?channel, "session started");
            let report = controller
                .run(ChannelIo {
                    requests,
                    input,
                    output,
                    closed,
                })
                .await;
            info!(
                %peer,
                %user,
                ?channel,
                terminal = report.terminal_allocated,
                commands = report.commands,
                exit = ?report.exit,
                "session closed"
            );
        });
        tokio::spawn(pump_output(session.handle(), channel, output_rx));
    }

    /// Hand a request to the channel's session and answer the client with its verdict.
    async fn forward(&mut self, channel: ChannelId, kind: RequestKind, session: &mut Session) {
        let accepted = match self.channels.get_mut(&channel) {
            Some(bridge) => bridge.request(kind).await,
            None => false,
        };
        if accepted {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
    }
}

/// Send session output to the client; close the channel when the session lets go.
async fn pump_output(handle: Handle, channel: ChannelId, mut output: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = output.recv().await {
        if handle
            .data(channel, CryptoVec::from_slice(&chunk))
            .await
            .is_err()
        {
            debug!(?channel, "client stopped accepting data");
            break;
        }
    }
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

#[async_trait]
impl russh::server::Handler for ConnectionHandler {
    type Error = ServerError;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let credential = Credential::PublicKey {
            fingerprint: public_key.fingerprint(),
        };
        Ok(self.decide(user, &credential))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(self.decide(user, &Credential::Password(password.to_string())))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.admit_channel(ChannelKind::Session) {
            return Ok(false);
        }
        // Everything the session needs arrives through the handler callbacks.
        let id = channel.id();
        drop(channel);
        self.open_session(id, session);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.admit_channel(ChannelKind::DirectTcpip))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.admit_channel(ChannelKind::X11))
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, ?channel, "client sent eof");
        if let Some(bridge) = self.channels.get_mut(&channel) {
            bridge.end_input();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, ?channel, "client closed channel");
        self.channels.remove(&channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.channels.get_mut(&channel) {
            if !bridge.push_input(data) {
                debug!(?channel, len = data.len(), "input not accepted");
            }
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, ?channel, term, col_width, row_height, "pty-req");
        let geometry = TerminalGeometry::from_request(col_width, row_height, pix_width, pix_height);
        self.forward(channel, RequestKind::PtyReq(geometry), session)
            .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, RequestKind::Shell { payload: Vec::new() }, session)
            .await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // One-shot commands are a shell request with a payload.
        self.forward(
            channel,
            RequestKind::Shell {
                payload: data.to_vec(),
            },
            session,
        )
        .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let geometry = TerminalGeometry::from_request(col_width, row_height, pix_width, pix_height);
        self.forward(channel, RequestKind::WindowChange(geometry), session)
            .await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, ?channel, variable_name, "env request");
        self.forward(channel, RequestKind::Other("env".into()), session)
            .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, ?channel, name, "subsystem request");
        self.forward(channel, RequestKind::Other("subsystem".into()), session)
            .await;
        Ok(())
    }

    // Global requests carry no session semantics here and are discarded.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, address, port = *port, "discarding tcpip-forward request");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, address, port, "discarding cancel-tcpip-forward request");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAny, DenyAll};
    use crate::config::FileConfig;
    use pty_manager::NativeAllocator;
    use russh::{ChannelMsg, ChannelOpenFailure};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn handler(policy: Arc<dyn AuthPolicy>) -> ConnectionHandler {
        ConnectionHandler {
            peer: "127.0.0.1:50000".parse().unwrap(),
            user: None,
            settings: Arc::new(SessionSettings::default()),
            policy,
            allocator: Arc::new(NativeAllocator),
            channels: HashMap::new(),
        }
    }

    /// A bridge whose requests are answered by `verdict`.
    fn answered_bridge(
        verdict: fn(&RequestKind) -> bool,
    ) -> (ChannelBridge, mpsc::UnboundedReceiver<Vec<u8>>, CancellationToken) {
        let (requests, mut rx) = mpsc::channel::<ChannelRequest>(1);
        let (input, input_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let accepted = verdict(&request.kind);
                request.answer(accepted);
            }
        });
        (ChannelBridge::new(requests, input, closed.clone()), input_rx, closed)
    }

    #[test]
    fn rejected_credentials_do_not_authenticate() {
        let mut h = handler(Arc::new(DenyAll));
        let verdict = h.decide("root", &Credential::Password("root".into()));
        assert!(matches!(verdict, Auth::Reject { .. }));
        assert!(h.user.is_none());
    }

    #[test]
    fn accepted_credentials_remember_the_user() {
        let mut h = handler(Arc::new(AllowAny));
        let verdict = h.decide("ops", &Credential::Password("pw".into()));
        assert!(matches!(verdict, Auth::Accept));
        assert_eq!(h.user.as_deref(), Some("ops"));
    }

    #[test]
    fn only_session_channels_open() {
        let h = handler(Arc::new(AllowAny));
        assert!(h.admit_channel(ChannelKind::Session));
        assert!(!h.admit_channel(ChannelKind::DirectTcpip));
        assert!(!h.admit_channel(ChannelKind::X11));
    }

    #[tokio::test]
    async fn bridge_relays_session_verdicts() {
        let (mut bridge, _input, _closed) =
            answered_bridge(|kind| matches!(kind, RequestKind::Shell { .. }));

        assert!(bridge.request(RequestKind::Shell { payload: vec![] }).await);
        assert!(!bridge.request(RequestKind::Other("env".into())).await);
    }

    #[tokio::test]
    async fn bridge_without_session_refuses() {
        let (requests, rx) = mpsc::channel(1);
        let (input, _input_rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut bridge = ChannelBridge::new(requests, input, CancellationToken::new());
        assert!(!bridge.request(RequestKind::Shell { payload: vec![] }).await);
    }

    #[tokio::test]
    async fn input_before_pty_is_dropped() {
        let (mut bridge, mut input, _closed) = answered_bridge(|_| true);

        assert!(!bridge.push_input(b"early\n"));
        assert!(!bridge.push_input(b"still early\n"));
        assert!(bridge.request(RequestKind::Shell { payload: vec![] }).await);
        assert!(!bridge.push_input(b"after shell\n"));

        assert!(
            bridge
                .request(RequestKind::PtyReq(TerminalGeometry::default()))
                .await
        );
        assert!(bridge.push_input(b"ps\n"));
        assert_eq!(input.recv().await.unwrap(), b"ps\n");
        assert!(input.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_pty_keeps_input_closed() {
        let (mut bridge, _input, _closed) = answered_bridge(|_| false);
        assert!(
            !bridge
                .request(RequestKind::PtyReq(TerminalGeometry::default()))
                .await
        );
        assert!(!bridge.push_input(b"ps\n"));
    }

    #[tokio::test]
    async fn eof_ends_input_but_not_the_channel() {
        let (mut bridge, mut input, closed) = answered_bridge(|_| true);
        assert!(
            bridge
                .request(RequestKind::PtyReq(TerminalGeometry::default()))
                .await
        );

        bridge.end_input();
        assert!(!bridge.push_input(b"late\n"));
        assert!(input.recv().await.is_none());
        assert!(!closed.is_cancelled());

        drop(bridge);
        assert!(closed.is_cancelled());
    }

    #[test]
    fn missing_host_key_is_an_error() {
        let err = load_host_key(Path::new("/nonexistent/host_key")).unwrap_err();
        assert!(err.to_string().contains("Failed to load host key"));
    }

    // ── over the wire ───────────────────────────────────────────────────

    /// Client handler that counts what the server does to its channels.
    #[derive(Clone, Default)]
    struct Observer {
        eofs: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl russh::client::Handler for Observer {
        type Error = russh::Error;

        async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
            Ok(true)
        }

        async fn channel_eof(
            &mut self,
            _channel: ChannelId,
            _session: &mut russh::client::Session,
        ) -> Result<(), Self::Error> {
            self.eofs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn channel_close(
            &mut self,
            _channel: ChannelId,
            _session: &mut russh::client::Session,
        ) -> Result<(), Self::Error> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn connect() -> (russh::client::Handle<Observer>, Observer) {
        let config = ShellConfig::from_file(0, FileConfig::default());
        let host_key = KeyPair::generate_ed25519().unwrap();
        let server = ShellServer::new(
            &config,
            host_key,
            Arc::new(AllowAny),
            Arc::new(NativeAllocator),
        );

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        tokio::spawn(async move { server.serve_connection(server_io, peer).await });

        let observer = Observer::default();
        let client_config = Arc::new(russh::client::Config::default());
        let mut handle = russh::client::connect_stream(client_config, client_io, observer.clone())
            .await
            .unwrap();
        assert!(handle.authenticate_password("ops", "secret").await.unwrap());
        (handle, observer)
    }

    /// Client side of one session channel.
    struct Remote {
        channel: Channel<russh::client::Msg>,
        seen: String,
    }

    impl Remote {
        async fn open(handle: &russh::client::Handle<Observer>) -> Self {
            Self {
                channel: handle.channel_open_session().await.unwrap(),
                seen: String::new(),
            }
        }

        async fn next(&mut self) -> Option<ChannelMsg> {
            let msg = tokio::time::timeout(WAIT, self.channel.wait())
                .await
                .expect("server went quiet");
            if let Some(ChannelMsg::Data { data }) = &msg {
                self.seen.push_str(&String::from_utf8_lossy(data));
            }
            msg
        }

        /// Wait for the answer to the last request sent with `want_reply`.
        async fn reply(&mut self) -> bool {
            loop {
                match self.next().await {
                    Some(ChannelMsg::Success) => return true,
                    Some(ChannelMsg::Failure) => return false,
                    Some(_) => {}
                    None => panic!("channel ended while waiting for a reply"),
                }
            }
        }

        /// Read until `needle` appears and drop everything up to it.
        async fn expect(&mut self, needle: &str) {
            while !self.seen.contains(needle) {
                if self.next().await.is_none() {
                    panic!("channel ended before {needle:?}; saw {:?}", self.seen);
                }
            }
            let end = self.seen.find(needle).unwrap() + needle.len();
            self.seen.drain(..end);
        }

        async fn start_shell(&mut self) {
            self.channel
                .request_pty(true, "xterm", 80, 24, 0, 0, &[])
                .await
                .unwrap();
            assert!(self.reply().await);
            self.channel.request_shell(true).await.unwrap();
            assert!(self.reply().await);
        }
    }

    async fn wait_for(counter: &AtomicUsize, value: usize) {
        tokio::time::timeout(WAIT, async {
            while counter.load(Ordering::SeqCst) < value {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("counter never reached the expected value");
    }

    #[tokio::test]
    async fn session_over_ssh_closes_the_channel_once() {
        let (handle, observer) = connect().await;
        let mut remote = Remote::open(&handle).await;

        remote.start_shell().await;
        remote.channel.exec(true, "ps aux").await.unwrap();
        assert!(!remote.reply().await, "one-shot commands are refused");
        remote
            .channel
            .request_pty(true, "xterm", 80, 24, 0, 0, &[])
            .await
            .unwrap();
        assert!(!remote.reply().await, "second pty-req is refused");

        remote.expect("docker > ").await;
        remote.channel.data(&b"cls\n"[..]).await.unwrap();
        remote.expect("\x1b[2J\x1b[1;1H").await;
        remote.expect("docker > ").await;

        remote.channel.eof().await.unwrap();
        while remote.next().await.is_some() {}

        wait_for(&observer.closes, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(observer.eofs.load(Ordering::SeqCst), 1);
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_channel_leaves_the_connection_usable() {
        let (handle, _observer) = connect().await;

        let mut first = Remote::open(&handle).await;
        first.start_shell().await;
        first.expect("docker > ").await;
        first.channel.close().await.unwrap();

        let mut second = Remote::open(&handle).await;
        second.start_shell().await;
        second.expect("docker > ").await;
    }

    #[tokio::test]
    async fn forwarding_channels_are_refused() {
        let (handle, _observer) = connect().await;

        let err = handle
            .channel_open_direct_tcpip("127.0.0.1", 80, "127.0.0.1", 40000)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                russh::Error::ChannelOpenFailure(ChannelOpenFailure::AdministrativelyProhibited)
            ),
            "{err:?}"
        );

        // The connection still serves sessions afterwards.
        let mut remote = Remote::open(&handle).await;
        remote.start_shell().await;
        remote.expect("docker > ").await;
    }
}
