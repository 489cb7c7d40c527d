use std::io::{self, Stdout, Write};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event as TermEvent, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::{cursor, ExecutableCommand};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Key(KeyEvent),
    Resize { width: u16, height: u16 },
    Closed,
}

/// One attached terminal: its size at connect time, the input it produces and
/// the stream frames are written to.
pub struct Connection<W: Write> {
    pub width: u16,
    pub height: u16,
    pub events: Receiver<TransportEvent>,
    pub output: W,
}

/// The controlling TTY of this process. When the binary is started by the SSH
/// daemon for a connection, this is the PTY of that remote session.
pub struct LocalTerminal {
    restored: bool,
}

impl LocalTerminal {
    pub fn open() -> Result<(Self, Connection<Stdout>)> {
        let (width, height) = terminal::size().context("failed to read terminal size")?;
        enable_raw_mode().context("failed to enable raw mode")?;
        let mut stdout = io::stdout();
        stdout
            .execute(EnterAlternateScreen)
            .context("failed to enter alternate screen")?;
        stdout.execute(cursor::Hide)?;

        let (tx, rx) = unbounded();
        thread::spawn(move || read_local_events(tx));

        Ok((
            Self { restored: false },
            Connection {
                width,
                height,
                events: rx,
                output: stdout,
            },
        ))
    }

    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        let mut stdout = io::stdout();
        disable_raw_mode()?;
        stdout.execute(LeaveAlternateScreen)?;
        stdout.execute(cursor::Show)?;
        Ok(())
    }
}

impl Drop for LocalTerminal {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            warn!(error = %err, "failed to restore terminal");
        }
    }
}

fn read_local_events(tx: Sender<TransportEvent>) {
    loop {
        let event = match event::read() {
            Ok(TermEvent::Key(key)) if key.kind != KeyEventKind::Release => {
                TransportEvent::Key(key)
            }
            Ok(TermEvent::Resize(width, height)) => TransportEvent::Resize { width, height },
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "terminal input closed");
                let _ = tx.send(TransportEvent::Closed);
                return;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

pub mod stream {
    use std::io::{Read, Write};
    use std::thread;

    use crossbeam_channel::{unbounded, Sender};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use tracing::debug;

    use super::{Connection, TransportEvent};

    /// Forwards window changes reported out of band by the session host.
    #[derive(Clone)]
    pub struct ResizeHandle {
        tx: Sender<TransportEvent>,
    }

    impl ResizeHandle {
        pub fn resize(&self, width: u16, height: u16) {
            let _ = self.tx.send(TransportEvent::Resize { width, height });
        }

        pub fn close(&self) {
            let _ = self.tx.send(TransportEvent::Closed);
        }
    }

    /// Attaches a raw byte stream pair. Input bytes are decoded into keys on a
    /// reader thread; end of input closes the connection.
    pub fn connect<R, W>(
        mut reader: R,
        writer: W,
        width: u16,
        height: u16,
    ) -> (Connection<W>, ResizeHandle)
    where
        R: Read + Send + 'static,
        W: Write,
    {
        let (tx, rx) = unbounded();
        let input_tx = tx.clone();
        thread::spawn(move || {
            let mut decoder = KeyDecoder::default();
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for key in decoder.feed(&buf[..n]) {
                            if input_tx.send(TransportEvent::Key(key)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(error = %err, "session input failed");
                        break;
                    }
                }
            }
            let _ = input_tx.send(TransportEvent::Closed);
        });

        (
            Connection {
                width,
                height,
                events: rx,
                output: writer,
            },
            ResizeHandle { tx },
        )
    }

    /// Turns terminal input bytes into key events. Incomplete escape or UTF-8
    /// sequences are held until the next read, except a lone trailing ESC,
    /// which is taken as the Esc key.
    #[derive(Debug, Default)]
    pub struct KeyDecoder {
        pending: Vec<u8>,
    }

    enum Step {
        Key(KeyEvent, usize),
        Skip(usize),
        Incomplete,
    }

    impl KeyDecoder {
        pub fn feed(&mut self, bytes: &[u8]) -> Vec<KeyEvent> {
            self.pending.extend_from_slice(bytes);
            let mut keys = Vec::new();
            let mut pos = 0;
            while pos < self.pending.len() {
                match decode(&self.pending[pos..]) {
                    Step::Key(key, used) => {
                        keys.push(key);
                        pos += used;
                    }
                    Step::Skip(used) => pos += used,
                    Step::Incomplete => break,
                }
            }
            self.pending.drain(..pos);
            if self.pending == [0x1b] {
                self.pending.clear();
                keys.push(plain(KeyCode::Esc));
            }
            keys
        }
    }

    fn plain(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn decode(bytes: &[u8]) -> Step {
        match bytes[0] {
            0x1b => decode_escape(bytes),
            b'\r' | b'\n' => Step::Key(plain(KeyCode::Enter), 1),
            b'\t' => Step::Key(plain(KeyCode::Tab), 1),
            0x7f | 0x08 => Step::Key(plain(KeyCode::Backspace), 1),
            byte @ 0x01..=0x1a => Step::Key(
                KeyEvent::new(
                    KeyCode::Char(char::from(b'a' + byte - 1)),
                    KeyModifiers::CONTROL,
                ),
                1,
            ),
            0x00..=0x1f => Step::Skip(1),
            _ => decode_utf8(bytes),
        }
    }

    fn decode_utf8(bytes: &[u8]) -> Step {
        let width = match bytes[0] {
            0x00..=0x7f => 1,
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => return Step::Skip(1),
        };
        if bytes.len() < width {
            return Step::Incomplete;
        }
        match std::str::from_utf8(&bytes[..width])
            .ok()
            .and_then(|s| s.chars().next())
        {
            Some(ch) => Step::Key(plain(KeyCode::Char(ch)), width),
            None => Step::Skip(1),
        }
    }

    fn decode_escape(bytes: &[u8]) -> Step {
        let Some(&next) = bytes.get(1) else {
            return Step::Incomplete;
        };
        match next {
            b'[' => decode_csi(bytes),
            b'O' => match bytes.get(2) {
                None => Step::Incomplete,
                Some(&last) => match cursor_key(last) {
                    Some(code) => Step::Key(plain(code), 3),
                    None => Step::Skip(3),
                },
            },
            0x1b => Step::Key(plain(KeyCode::Esc), 1),
            _ => match decode(&bytes[1..]) {
                Step::Key(mut key, used) => {
                    key.modifiers |= KeyModifiers::ALT;
                    Step::Key(key, used + 1)
                }
                Step::Skip(used) => Step::Skip(used + 1),
                Step::Incomplete => Step::Incomplete,
            },
        }
    }

    fn decode_csi(bytes: &[u8]) -> Step {
        let Some(end) = bytes[2..]
            .iter()
            .position(|byte| (0x40..=0x7e).contains(byte))
        else {
            return Step::Incomplete;
        };
        let used = end + 3;
        let params = &bytes[2..2 + end];
        let last = bytes[2 + end];

        let code = match last {
            b'~' => match params {
                b"1" | b"7" => Some(KeyCode::Home),
                b"2" => Some(KeyCode::Insert),
                b"3" => Some(KeyCode::Delete),
                b"4" | b"8" => Some(KeyCode::End),
                b"5" => Some(KeyCode::PageUp),
                b"6" => Some(KeyCode::PageDown),
                _ => None,
            },
            b'Z' => Some(KeyCode::BackTab),
            other => cursor_key(other),
        };
        match code {
            Some(KeyCode::BackTab) => Step::Key(
                KeyEvent::new(KeyCode::BackTab, KeyModifiers::SHIFT),
                used,
            ),
            Some(code) => Step::Key(plain(code), used),
            None => Step::Skip(used),
        }
    }

    fn cursor_key(last: u8) -> Option<KeyCode> {
        match last {
            b'A' => Some(KeyCode::Up),
            b'B' => Some(KeyCode::Down),
            b'C' => Some(KeyCode::Right),
            b'D' => Some(KeyCode::Left),
            b'H' => Some(KeyCode::Home),
            b'F' => Some(KeyCode::End),
            _ => None,
        }
    }

}
