use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use crossbeam_channel::{select, tick};
use parking_lot::Mutex;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Rect;
use ratatui::{Terminal, TerminalOptions, Viewport};
use tracing::{debug, info};

use crate::catalog::SearchService;
use crate::preview::{PreviewContent, PreviewService};
use crate::scheduler::Scheduler;
use crate::session::{self, Effect, Event, Mode, SessionState};
use crate::transport::{Connection, TransportEvent};
use crate::ui;

const TICK_RATE: Duration = Duration::from_millis(120);
const KITTY_DELETE_ALL: &[u8] = b"\x1b_Ga=d,d=A,q=2;\x1b\\";

#[derive(Clone)]
pub struct Services {
    pub search: Arc<dyn SearchService>,
    pub preview: Arc<dyn PreviewService>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Renderer executable that must resolve before input is accepted.
    pub renderer_program: String,
}

/// OSC 52 clipboard write.
pub fn osc52(text: &str) -> String {
    format!("\x1b]52;c;{}\x07", general_purpose::STANDARD.encode(text))
}

/// Cloneable writer so the terminal can be rebuilt around the same stream.
pub struct SharedOutput<W>(Arc<Mutex<W>>);

impl<W> SharedOutput<W> {
    pub fn new(inner: W) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }
}

impl<W> Clone for SharedOutput<W> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<W: Write> Write for SharedOutput<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}

struct Screen<W: Write> {
    output: SharedOutput<W>,
    terminal: Terminal<CrosstermBackend<SharedOutput<W>>>,
    /// Preview revision whose image is currently on screen.
    shown_image: Option<u64>,
}

impl<W: Write> Screen<W> {
    fn new(output: SharedOutput<W>, width: u16, height: u16) -> Result<Self> {
        let terminal = build_terminal(&output, width, height)?;
        Ok(Self {
            output,
            terminal,
            shown_image: None,
        })
    }

    fn resize(&mut self, width: u16, height: u16) -> Result<()> {
        // Fixed viewports ignore resize(), so the terminal is rebuilt.
        self.terminal = build_terminal(&self.output, width, height)?;
        self.clear()
    }

    fn draw(&mut self, state: &SessionState) -> Result<()> {
        self.terminal
            .draw(|frame| ui::render(frame, state))
            .context("failed to draw frame")?;
        self.flush_inline_image(state)
    }

    fn flush_inline_image(&mut self, state: &SessionState) -> Result<()> {
        let on_screen = matches!(state.mode, Mode::Browsing | Mode::TagPopup) && !state.loading;
        match &state.preview {
            PreviewContent::Image(bytes) if on_screen => {
                let revision = state.preview_revision();
                if self.shown_image != Some(revision) {
                    self.output.write_all(bytes)?;
                    self.output.flush()?;
                    self.shown_image = Some(revision);
                }
            }
            _ => {
                if self.shown_image.take().is_some() {
                    self.output.write_all(KITTY_DELETE_ALL)?;
                    self.output.flush()?;
                }
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.output.write_all(KITTY_DELETE_ALL)?;
        self.shown_image = None;
        self.terminal.clear()?;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.write_all(bytes)?;
        self.output.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.output.write_all(KITTY_DELETE_ALL)?;
        self.terminal.show_cursor()?;
        self.output.flush()?;
        Ok(())
    }
}

fn build_terminal<W: Write>(
    output: &SharedOutput<W>,
    width: u16,
    height: u16,
) -> Result<Terminal<CrosstermBackend<SharedOutput<W>>>> {
    Terminal::with_options(
        CrosstermBackend::new(output.clone()),
        TerminalOptions {
            viewport: Viewport::Fixed(Rect::new(0, 0, width, height)),
        },
    )
    .context("failed to set up terminal")
}

/// Drives one session until the user quits or the connection closes.
pub fn run_session<W: Write>(
    connection: Connection<W>,
    services: Services,
    options: &SessionOptions,
) -> Result<()> {
    let Connection {
        width,
        height,
        events,
        output,
    } = connection;

    let mut state = SessionState::new(width, height);
    session::startup_check(&mut state, &options.renderer_program);
    let scheduler = Scheduler::new(services.search, services.preview);
    let mut screen = Screen::new(SharedOutput::new(output), width, height)?;
    screen.clear()?;
    let ticker = tick(TICK_RATE);
    info!(width, height, "session started");

    let mut dirty = true;
    loop {
        if dirty {
            screen.draw(&state)?;
            dirty = false;
        }

        let event = select! {
            recv(events) -> msg => match msg {
                Ok(TransportEvent::Key(key)) => Some(Event::Key(key)),
                Ok(TransportEvent::Resize { width, height }) => Some(Event::Resize { width, height }),
                Ok(TransportEvent::Closed) | Err(_) => None,
            },
            recv(scheduler.inbox()) -> msg => msg.ok(),
            recv(ticker) -> _ => Some(Event::Tick),
        };
        let Some(event) = event else {
            info!("session connection closed");
            break;
        };

        match event {
            Event::Tick if !state.loading => continue,
            Event::Resize { width, height } => screen.resize(width, height)?,
            _ => {}
        }

        dirty = true;
        for effect in session::update(&mut state, event) {
            match scheduler.dispatch(effect) {
                None => {}
                Some(Effect::CopyToClipboard(text)) => {
                    debug!("writing clipboard sequence");
                    screen.write_raw(osc52(&text).as_bytes())?;
                }
                Some(Effect::ClearScreen) => screen.clear()?,
                Some(Effect::Quit) => {
                    info!("session ended by user");
                    return screen.finish();
                }
                Some(other) => debug!(?other, "unhandled effect"),
            }
        }
    }

    screen.finish()
}
