//! Keyboard input.
//!
//! Keys arrive as raw bytes over a channel. On Linux the terminal is in raw
//! mode so each key press is delivered immediately; elsewhere input is line
//! buffered and keys take effect on Enter.

use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use tracing::debug;

const CTRL_C: u8 = 0x03;

/// Key while the simulation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Accelerate,
    Decelerate,
    Stop,
    Quit,
}

impl Command {
    pub fn from_key(key: u8) -> Option<Self> {
        match key {
            b'd' | b'D' => Some(Command::Accelerate),
            b'a' | b'A' => Some(Command::Decelerate),
            b's' | b'S' => Some(Command::Stop),
            b'q' | b'Q' | CTRL_C => Some(Command::Quit),
            _ => None,
        }
    }
}

/// Key at the lead's admission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKey {
    Extend,
    Close,
    Abort,
}

impl AdmissionKey {
    pub fn from_key(key: u8) -> Option<Self> {
        match key {
            b'c' | b'C' => Some(AdmissionKey::Extend),
            b's' | b'S' => Some(AdmissionKey::Close),
            CTRL_C => Some(AdmissionKey::Abort),
            _ => None,
        }
    }
}

/// Forward every byte of `source` to the returned channel.
///
/// The reader thread is detached: a blocking terminal read cannot be
/// interrupted, so it ends with the process or when the source hits EOF.
pub fn spawn_key_reader<R: Read + Send + 'static>(mut source: R) -> io::Result<Receiver<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("keys".to_string())
        .spawn(move || {
            let mut buf = [0u8; 64];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => {
                        debug!("input closed");
                        break;
                    }
                    Ok(n) => {
                        for &key in &buf[..n] {
                            if tx.send(key).is_err() {
                                return;
                            }
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("input error: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Put the terminal into raw mode if stdin is one.
///
/// The returned guard restores the terminal when dropped.
#[cfg(target_os = "linux")]
pub fn enter_raw_mode() -> io::Result<Option<impl Sized>> {
    use raw_tty::IntoRawMode;
    use std::io::IsTerminal;

    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(None);
    }
    stdin.into_raw_mode().map(Some)
}

#[cfg(not(target_os = "linux"))]
pub fn enter_raw_mode() -> io::Result<Option<()>> {
    Ok(None)
}
