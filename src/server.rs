use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, queue};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::runtime::{self, Services, SessionOptions};
use crate::transport::stream::{self, ResizeHandle};
use crate::transport::Connection;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const OUTPUT_CHUNK: usize = 32 * 1024;
const NO_PTY_MESSAGE: &[u8] = b"no active PTY found\r\n";

/// Serves sessions over SSH until interrupted. Each accepted shell channel
/// runs its own session on a dedicated thread.
pub fn serve(cfg: &ServerConfig, services: Services, options: SessionOptions) -> Result<()> {
    let host_key = load_host_key(&cfg.host_key)?;
    let ssh_config = Arc::new(server::Config {
        keys: vec![host_key],
        auth_rejection_time: Duration::from_secs(1),
        ..Default::default()
    });

    let rt = Runtime::new().context("start async runtime")?;
    let addr = format!("{}:{}", cfg.listen, cfg.port);
    rt.block_on(async {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        info!(%addr, "ssh server listening");
        accept_loop(listener, ssh_config, services, options).await;
        Ok(())
    })
}

async fn accept_loop(
    listener: TcpListener,
    ssh_config: Arc<server::Config>,
    services: Services,
    options: SessionOptions,
) {
    let mut connections = JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                info!(%peer, "client connected");
                let handler = ConnectionHandler::new(peer, services.clone(), options.clone());
                let ssh_config = ssh_config.clone();
                connections.spawn(async move {
                    match server::run_stream(ssh_config, socket, handler).await {
                        Ok(running) => {
                            if let Err(err) = running.await {
                                debug!(%peer, error = %err, "connection ended with error");
                            }
                        }
                        Err(err) => warn!(%peer, error = %err, "ssh handshake failed"),
                    }
                    info!(%peer, "client disconnected");
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                info!("stopping ssh server");
                break;
            }
        }
    }

    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            remaining = connections.len(),
            "connections still open after shutdown grace"
        );
        connections.abort_all();
    }
}

/// Reads the host identity key, generating an ed25519 key on first start.
pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return russh_keys::load_secret_key(path, None)
            .with_context(|| format!("read host key {}", path.display()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create host key directory {}", parent.display()))?;
    }
    let key = KeyPair::generate_ed25519().context("generate ed25519 host key")?;
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options
        .open(path)
        .with_context(|| format!("create host key {}", path.display()))?;
    russh_keys::encode_pkcs8_pem(&key, file)
        .with_context(|| format!("write host key {}", path.display()))?;
    info!(path = %path.display(), "generated host key");
    Ok(key)
}

/// Runs one session on its own thread and calls `on_exit` once it ends.
pub fn spawn_session<W, F>(
    label: String,
    connection: Connection<W>,
    services: Services,
    options: SessionOptions,
    on_exit: F,
) -> io::Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("session-{label}"))
        .spawn(move || {
            info!(session = %label, "session opened");
            match runtime::run_session(connection, services, &options) {
                Ok(()) => info!(session = %label, "session closed"),
                Err(err) => warn!(session = %label, error = ?err, "session failed"),
            }
            on_exit();
        })
}

/// Blocking reader over byte chunks pushed by the SSH handler. A dropped
/// sender reads as end of input.
pub struct ChannelInput {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChannelInput {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
        }
    }
}

impl Read for ChannelInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Buffers session output and sends it as channel data on flush. Only used
/// from session threads, never from inside the async runtime.
struct ChannelOutput {
    handle: server::Handle,
    channel: ChannelId,
    runtime: tokio::runtime::Handle,
    buf: Vec<u8>,
}

impl Write for ChannelOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= OUTPUT_CHUNK {
            self.flush()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = CryptoVec::from_slice(&self.buf);
        self.buf.clear();
        self.runtime
            .block_on(self.handle.data(self.channel, data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ssh channel closed"))
    }
}

#[derive(Default)]
struct ChannelState {
    size: Option<(u16, u16)>,
    input: Option<Sender<Vec<u8>>>,
    resize: Option<ResizeHandle>,
}

struct ConnectionHandler {
    peer: SocketAddr,
    services: Services,
    options: SessionOptions,
    runtime: tokio::runtime::Handle,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ConnectionHandler {
    fn new(peer: SocketAddr, services: Services, options: SessionOptions) -> Self {
        Self {
            peer,
            services,
            options,
            runtime: tokio::runtime::Handle::current(),
            channels: HashMap::new(),
        }
    }

    fn start_session(&mut self, channel: ChannelId, width: u16, height: u16, session: &Session) {
        let handle = session.handle();
        let mut output = ChannelOutput {
            handle: handle.clone(),
            channel,
            runtime: self.runtime.clone(),
            buf: Vec::new(),
        };
        // Queued only; the first flush happens on the session thread.
        let _ = queue!(output, EnterAlternateScreen, cursor::Hide);

        let (input_tx, input_rx) = unbounded();
        let (connection, resize) =
            stream::connect(ChannelInput::new(input_rx), output, width, height);
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = Some(input_tx);
            state.resize = Some(resize);
        }

        let runtime = self.runtime.clone();
        let on_exit = move || {
            let mut restore = Vec::new();
            let _ = queue!(restore, LeaveAlternateScreen, cursor::Show);
            runtime.block_on(async {
                let _ = handle.data(channel, CryptoVec::from_slice(&restore)).await;
                let _ = handle.exit_status_request(channel, 0).await;
                let _ = handle.eof(channel).await;
                let _ = handle.close(channel).await;
            });
        };
        let label = format!("{}#{:?}", self.peer, channel);
        if let Err(err) = spawn_session(
            label,
            connection,
            self.services.clone(),
            self.options.clone(),
            on_exit,
        ) {
            warn!(peer = %self.peer, error = %err, "failed to start session thread");
        }
    }
}

fn clamp_dimension(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

#[async_trait]
impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, user, "accepting client");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, term, col_width, row_height, "pty requested");
        if let Some(state) = self.channels.get_mut(&channel) {
            state.size = Some((clamp_dimension(col_width), clamp_dimension(row_height)));
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = self.channels.get(&channel).and_then(|state| state.size);
        match size {
            Some((width, height)) => {
                session.channel_success(channel);
                self.start_session(channel, width, height, session);
            }
            None => {
                warn!(peer = %self.peer, "rejecting session without a pty");
                session.data(channel, CryptoVec::from_slice(NO_PTY_MESSAGE));
                session.exit_status_request(channel, 1);
                session.close(channel);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(input) = self.channels.get(&channel).and_then(|s| s.input.as_ref()) {
            let _ = input.send(data.to_vec());
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            let size = (clamp_dimension(col_width), clamp_dimension(row_height));
            state.size = Some(size);
            if let Some(resize) = &state.resize {
                resize.resize(size.0, size.1);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FetchError, FileRef, Post, SearchService};
    use crate::preview::{
        CancelToken, PreviewContent, PreviewError, PreviewRequest, PreviewService,
    };
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }

        fn wait_for(&self, needle: &str) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.text().contains(needle) {
                assert!(Instant::now() < deadline, "timed out waiting for {needle:?}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// One post whose id is derived from the query, so each session's results
    /// can be told apart on screen.
    struct QueryEcho;

    impl SearchService for QueryEcho {
        fn search(&self, query: &str, _page: u32) -> Result<Vec<Post>, FetchError> {
            let id = if query == "wolf" { 1111 } else { 2222 };
            Ok(vec![Post {
                id,
                file: FileRef {
                    url: Some(format!("https://static.test/{query}.png")),
                    ..FileRef::default()
                },
                ..Post::default()
            }])
        }
    }

    struct TextPreview;

    impl PreviewService for TextPreview {
        fn load(
            &self,
            _request: &PreviewRequest,
            _cancel: &CancelToken,
        ) -> Result<PreviewContent, PreviewError> {
            Ok(PreviewContent::Message("rendered".into()))
        }
    }

    fn services() -> Services {
        Services {
            search: Arc::new(QueryEcho),
            preview: Arc::new(TextPreview),
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            renderer_program: "sh".into(),
        }
    }

    struct Remote {
        keys: Sender<Vec<u8>>,
        screen: Capture,
        resize: ResizeHandle,
        session: JoinHandle<()>,
        exited: Receiver<()>,
    }

    fn open(label: &str, width: u16, height: u16) -> Remote {
        let (keys, input) = unbounded();
        let screen = Capture::default();
        let (connection, resize) =
            stream::connect(ChannelInput::new(input), screen.clone(), width, height);
        let (exit_tx, exited) = unbounded();
        let session = spawn_session(label.into(), connection, services(), options(), move || {
            let _ = exit_tx.send(());
        })
        .unwrap();
        Remote {
            keys,
            screen,
            resize,
            session,
            exited,
        }
    }

    #[test]
    fn channel_input_splits_large_chunks_and_ends_on_drop() {
        let (tx, rx) = unbounded();
        let mut input = ChannelInput::new(rx);
        tx.send(b"abcdef".to_vec()).unwrap();
        drop(tx);

        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(input.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(input.read(&mut buf).unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_sessions_keep_separate_state() {
        let first = open("first", 120, 40);
        let second = open("second", 100, 30);

        first.keys.send(b"wolf\r".to_vec()).unwrap();
        second.keys.send(b"fox\r".to_vec()).unwrap();
        first.screen.wait_for("1111");
        second.screen.wait_for("2222");

        first.keys.send(b"c".to_vec()).unwrap();
        first.screen.wait_for("Copied link to clipboard!");
        second.resize.resize(90, 30);

        // Quitting one session leaves the other running.
        first.keys.send(vec![0x03]).unwrap();
        first.keys.send(b"y".to_vec()).unwrap();
        first.exited.recv_timeout(Duration::from_secs(5)).unwrap();
        first.session.join().unwrap();

        second.keys.send(b"c".to_vec()).unwrap();
        second.screen.wait_for("Copied link to clipboard!");

        let first_text = first.screen.text();
        let second_text = second.screen.text();
        assert!(first_text.contains("Query: wolf"));
        assert!(!first_text.contains("2222"));
        assert!(second_text.contains("Query: fox"));
        assert!(!second_text.contains("1111"));
        assert!(first_text.contains(&runtime::osc52("https://static.test/wolf.png")));
        assert!(second_text.contains(&runtime::osc52("https://static.test/fox.png")));
        assert!(!second_text.contains(&runtime::osc52("https://static.test/wolf.png")));
        assert!(second
            .exited
            .recv_timeout(Duration::from_millis(50))
            .is_err());

        drop(second.keys);
        second.exited.recv_timeout(Duration::from_secs(5)).unwrap();
        second.session.join().unwrap();
    }

    #[test]
    fn host_key_is_generated_once_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_ed25519");

        let generated = load_host_key(&path).unwrap();
        assert!(path.exists());
        let loaded = load_host_key(&path).unwrap();
        assert_eq!(
            generated.clone_public_key().unwrap().fingerprint(),
            loaded.clone_public_key().unwrap().fingerprint()
        );
    }
}
