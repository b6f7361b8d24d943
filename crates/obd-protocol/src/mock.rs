//! Scriptable ELM327 stand-in for tests and demos.
//!
//! The mock runs on the far end of an in-memory duplex pipe, records every
//! command it receives, and answers from a script. Unscripted AT commands
//! get `OK`, unscripted ST commands get `?`, everything else `NO DATA`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

use crate::transport::{Connection, TransportKind};

const BANNER: &str = "ELM327 v1.5";

#[derive(Debug, Clone)]
struct Reply {
    text: String,
    prompt: bool,
    /// Repeat `text` every [`FRAME_INTERVAL`] until any byte arrives
    repeat: bool,
}

/// Frame spacing of a streaming reply, faster than any drain window
const FRAME_INTERVAL: Duration = Duration::from_millis(1);

impl Reply {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            prompt: true,
            repeat: false,
        }
    }
}

#[derive(Debug)]
struct Script {
    exact: HashMap<String, Reply>,
    once: HashMap<String, VecDeque<Reply>>,
    prefixes: Vec<(String, Reply)>,
    log: Vec<String>,
    echo: bool,
    headers: bool,
    spaces: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            once: HashMap::new(),
            prefixes: Vec::new(),
            log: Vec::new(),
            echo: true,
            headers: false,
            spaces: true,
        }
    }
}

impl Script {
    fn apply_settings(&mut self, command: &str) {
        match command {
            "ATZ" | "ATD" => {
                self.echo = true;
                self.headers = false;
                self.spaces = true;
            }
            "ATE0" => self.echo = false,
            "ATE1" => self.echo = true,
            "ATH0" => self.headers = false,
            "ATH1" => self.headers = true,
            "ATS0" => self.spaces = false,
            "ATS1" => self.spaces = true,
            _ => {}
        }
    }

    fn reply(&mut self, command: &str) -> Reply {
        if let Some(reply) = self.once.get_mut(command).and_then(VecDeque::pop_front) {
            return reply;
        }
        if let Some(reply) = self.exact.get(command) {
            return reply.clone();
        }
        if let Some((_, reply)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return reply.clone();
        }

        match command {
            "" => Reply::new(""),
            "ATZ" | "ATI" => Reply::new(BANNER),
            _ if command.starts_with("AT") => Reply::new("OK"),
            _ if command.starts_with("ST") => Reply::new("?"),
            _ => Reply::new("NO DATA"),
        }
    }
}

/// A scripted ELM327 adapter
#[derive(Clone, Default)]
pub struct MockAdapter {
    script: Arc<Mutex<Script>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `command` with `response` (`\n` separates lines)
    pub fn respond(&self, command: &str, response: &str) -> &Self {
        self.lock()
            .exact
            .insert(command.to_ascii_uppercase(), Reply::new(response));
        self
    }

    /// Answer the next occurrence of `command` with `response`, then fall back
    pub fn respond_once(&self, command: &str, response: &str) -> &Self {
        self.lock()
            .once
            .entry(command.to_ascii_uppercase())
            .or_default()
            .push_back(Reply::new(response));
        self
    }

    /// Answer any command starting with `prefix`
    pub fn respond_prefix(&self, prefix: &str, response: &str) -> &Self {
        self.lock()
            .prefixes
            .push((prefix.to_ascii_uppercase(), Reply::new(response)));
        self
    }

    /// Answer `command` but never send the prompt, forcing a read timeout
    pub fn respond_without_prompt(&self, command: &str, response: &str) -> &Self {
        self.lock().exact.insert(
            command.to_ascii_uppercase(),
            Reply {
                text: response.to_string(),
                prompt: false,
                repeat: false,
            },
        );
        self
    }

    /// Answer `command` by sending `frame` over and over, like a bus
    /// monitor on a busy vehicle, until the client sends any byte.
    pub fn respond_streaming(&self, command: &str, frame: &str) -> &Self {
        self.lock().exact.insert(
            command.to_ascii_uppercase(),
            Reply {
                text: frame.to_string(),
                prompt: false,
                repeat: true,
            },
        );
        self
    }

    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// How many times `command` was received
    pub fn count(&self, command: &str) -> usize {
        let command = command.to_ascii_uppercase();
        self.lock().log.iter().filter(|c| **c == command).count()
    }

    /// Forget the command log (the script is kept)
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn headers_enabled(&self) -> bool {
        self.lock().headers
    }

    pub fn spaces_enabled(&self) -> bool {
        self.lock().spaces
    }

    /// Spawn the adapter task and return the client end of the pipe.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn stream(&self) -> DuplexStream {
        let (client, server) = duplex(4096);
        let script = self.script.clone();
        tokio::spawn(serve(server, script));
        client
    }

    /// A WiFi-style connection wired to this adapter (not yet initialized)
    pub fn connection(&self) -> Connection {
        Connection::from_stream(TransportKind::Tcp, self.stream())
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn serve(mut stream: DuplexStream, script: Arc<Mutex<Script>>) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(end) = pending.iter().position(|b| *b == b'\r') {
            let line: Vec<u8> = pending.drain(..=end).collect();
            let command = String::from_utf8_lossy(&line)
                .trim()
                .to_ascii_uppercase();

            let (echo, reply) = {
                let mut script = script.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                script.log.push(command.clone());
                let echo = script.echo;
                script.apply_settings(&command);
                (echo, script.reply(&command))
            };

            let mut out = String::new();
            if echo {
                out.push_str(&command);
                out.push('\r');
            }
            if !reply.text.is_empty() {
                out.push_str(&reply.text.replace('\n', "\r"));
                out.push('\r');
            }
            if reply.prompt {
                out.push_str("\r>");
            }

            debug!(command = %command, "mock adapter reply");
            if stream.write_all(out.as_bytes()).await.is_err() {
                return;
            }

            if reply.repeat {
                let Some(received) = repeat_until_interrupted(&mut stream, &reply.text).await else {
                    return;
                };
                // The interrupting line is consumed, not executed
                let rest = match received.iter().position(|b| *b == b'\r') {
                    Some(end) => received[end + 1..].to_vec(),
                    None => Vec::new(),
                };
                script
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .log
                    .push(String::new());
                if stream.write_all(b"\r>").await.is_err() {
                    return;
                }
                pending.extend_from_slice(&rest);
            }
        }
    }
}

/// Write `frame` every [`FRAME_INTERVAL`] until the client sends something.
/// Returns what it sent, or `None` once the pipe is gone.
async fn repeat_until_interrupted(stream: &mut DuplexStream, frame: &str) -> Option<Vec<u8>> {
    let line = format!("{frame}\r");
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    let mut chunk = [0u8; 256];
    loop {
        tokio::select! {
            read = stream.read(&mut chunk) => match read {
                Ok(0) | Err(_) => return None,
                Ok(n) => return Some(chunk[..n].to_vec()),
            },
            _ = ticker.tick() => {
                if stream.write_all(line.as_bytes()).await.is_err() {
                    return None;
                }
            }
        }
    }
}
