use std::env;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::ImageFormat;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use tempfile::TempPath;
use tracing::{debug, warn};

use crate::catalog::Post;

pub const FAILED_MESSAGE: &str = "\n\n⚠️\n\nPreview failed to load";
pub const NO_URL_MESSAGE: &str = "No image URL available.";
pub const BORDER_INSET_COLS: u16 = 2;
const SAVE_CURSOR: &[u8] = b"\x1b[s";
const RESTORE_CURSOR: &[u8] = b"\x1b[u";
const CHUNK_SIZE: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("preview cancelled")]
    Cancelled,
    #[error("failed to download image: {0}")]
    Download(String),
    #[error("failed to download image, status: {0}")]
    Status(String),
    #[error("preview io: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to launch renderer {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("renderer exited with {status}: {output}")]
    Render { status: ExitStatus, output: String },
}

impl PreviewError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PreviewError::Cancelled)
    }
}

/// Shared flag checked by a preview task between pipeline steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PreviewError> {
        if self.is_cancelled() {
            Err(PreviewError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What the preview pane shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewContent {
    Empty,
    Loading,
    Message(String),
    Warning(String),
    /// Renderer output, already wrapped in cursor save/restore.
    Image(Vec<u8>),
}

impl PreviewContent {
    pub fn failed() -> Self {
        PreviewContent::Warning(FAILED_MESSAGE.to_string())
    }

    pub fn is_image(&self) -> bool {
        matches!(self, PreviewContent::Image(_))
    }
}

/// Cell geometry handed to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    pub width: u16,
    pub height: u16,
    pub x: u16,
    pub y: u16,
}

impl Placement {
    /// Derives the image box from a bordered pane: the border and padding
    /// take two columns and two rows, the image starts two columns in.
    pub fn inside_pane(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            width: width.saturating_sub(BORDER_INSET_COLS),
            height: height.saturating_sub(2),
            x: x.saturating_add(BORDER_INSET_COLS),
            y,
        }
    }

    pub fn directive(&self) -> String {
        format!("{}x{}@{}x{}", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    pub post_id: i64,
    pub url: String,
    pub placement: Placement,
}

impl PreviewRequest {
    pub fn for_post(post: &Post, show_full_image: bool, placement: Placement) -> Self {
        Self {
            post_id: post.id,
            url: display_url(post, show_full_image).to_string(),
            placement,
        }
    }
}

/// Full-resolution media when asked for or when no sample exists.
pub fn display_url(post: &Post, show_full_image: bool) -> &str {
    if show_full_image {
        return post.file_url();
    }
    post.sample_url().unwrap_or_else(|| post.file_url())
}

pub trait PreviewService: Send + Sync {
    fn load(
        &self,
        request: &PreviewRequest,
        cancel: &CancelToken,
    ) -> Result<PreviewContent, PreviewError>;
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub user_agent: String,
    pub program: String,
    pub args: Vec<String>,
    pub download_timeout: Option<Duration>,
    pub temp_dir: Option<PathBuf>,
    pub http_client: Option<Client>,
}

pub struct Pipeline {
    http: Client,
    user_agent: String,
    program: String,
    args: Vec<String>,
    temp_dir: PathBuf,
}

impl Pipeline {
    pub fn new(cfg: PipelineConfig) -> anyhow::Result<Self> {
        let http = match cfg.http_client {
            Some(client) => client,
            None => Client::builder()
                .timeout(cfg.download_timeout.unwrap_or(Duration::from_secs(30)))
                .build()?,
        };
        Ok(Self {
            http,
            user_agent: cfg.user_agent,
            program: cfg.program,
            args: cfg.args,
            temp_dir: cfg.temp_dir.unwrap_or_else(env::temp_dir),
        })
    }

    fn download(&self, url: &str, cancel: &CancelToken) -> Result<TempPath, PreviewError> {
        let mut response = self
            .http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .map_err(|err| PreviewError::Download(err.to_string()))?;
        cancel.check()?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(PreviewError::Status(response.status().to_string()));
        }

        let mut bytes = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            cancel.check()?;
            let read = response
                .read(&mut chunk)
                .map_err(|err| PreviewError::Download(err.to_string()))?;
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
        }

        let mut file = tempfile::Builder::new()
            .prefix("e6tui-preview-")
            .suffix(image_suffix(&bytes))
            .tempfile_in(&self.temp_dir)?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(file.into_temp_path())
    }

    fn render(
        &self,
        path: &Path,
        placement: Placement,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, PreviewError> {
        let args = expand_args(&self.args, placement, path);
        debug!(program = %self.program, ?args, "running renderer");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PreviewError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(drain_in_background);
        let stderr = child.stderr.take().map(drain_in_background);

        let status = supervise(&mut child, cancel)?;

        let mut output = collect(stdout);
        output.extend(collect(stderr));

        if !status.success() {
            return Err(PreviewError::Render {
                status,
                output: String::from_utf8_lossy(&output).into_owned(),
            });
        }
        Ok(wrap_output(&output))
    }
}

/// The parts of a child process the renderer loop needs.
trait RendererProcess {
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> io::Result<()>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
}

impl RendererProcess for Child {
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Child::wait(self)
    }
}

/// Polls the renderer until it exits. The process is killed and reaped on
/// cancellation and when polling fails.
fn supervise(
    child: &mut impl RendererProcess,
    cancel: &CancelToken,
) -> Result<ExitStatus, PreviewError> {
    loop {
        if cancel.is_cancelled() {
            stop(child);
            return Err(PreviewError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                stop(child);
                return Err(err.into());
            }
        }
    }
}

fn stop(child: &mut impl RendererProcess) {
    let _ = child.kill();
    let _ = child.wait();
}

impl PreviewService for Pipeline {
    fn load(
        &self,
        request: &PreviewRequest,
        cancel: &CancelToken,
    ) -> Result<PreviewContent, PreviewError> {
        cancel.check()?;
        if request.url.is_empty() {
            return Ok(PreviewContent::Message(NO_URL_MESSAGE.to_string()));
        }

        let path = self.download(&request.url, cancel).map_err(|err| {
            if !err.is_cancelled() {
                warn!(post = request.post_id, url = %request.url, error = %err, "preview download failed");
            }
            err
        })?;

        let rendered = cancel
            .check()
            .and_then(|_| self.render(&path, request.placement, cancel));
        if let Err(err) = path.close() {
            warn!(error = %err, "failed to remove preview file");
        }

        match rendered {
            Ok(output) => Ok(PreviewContent::Image(output)),
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(post = request.post_id, error = %err, "preview render failed");
                }
                Err(err)
            }
        }
    }
}

fn drain_in_background<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        buffer
    })
}

fn collect(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

pub fn expand_args(template: &[String], placement: Placement, path: &Path) -> Vec<String> {
    let place = placement.directive();
    let file = path.to_string_lossy();
    template
        .iter()
        .map(|arg| arg.replace("%PLACE%", &place).replace("%FILE%", &file))
        .collect()
}

pub fn wrap_output(output: &[u8]) -> Vec<u8> {
    let mut wrapped = Vec::with_capacity(output.len() + SAVE_CURSOR.len() + RESTORE_CURSOR.len());
    wrapped.extend_from_slice(SAVE_CURSOR);
    wrapped.extend_from_slice(output);
    wrapped.extend_from_slice(RESTORE_CURSOR);
    wrapped
}

fn image_suffix(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => ".jpg",
        Ok(ImageFormat::Gif) => ".gif",
        Ok(ImageFormat::WebP) => ".webp",
        _ => ".png",
    }
}

/// Resolves a renderer program the way a shell would: explicit paths are
/// checked directly, bare names are searched on `PATH`.
pub fn locate_program(program: &str) -> Option<PathBuf> {
    if program.trim().is_empty() {
        return None;
    }
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .flat_map(|dir| {
            let plain = dir.join(program);
            let exe = dir.join(format!("{program}{}", env::consts::EXE_SUFFIX));
            [plain, exe]
        })
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
