//! lazytunnel-askpass: SSH_ASKPASS relay for lazytunnel.
//!
//! OpenSSH invokes this with the prompt text as its first argument; the
//! helper forwards the prompt to the broker socket named by
//! `LAZYTUNNEL_ASKPASS_SOCKET` and prints the answer on stdout, which is
//! where ssh reads passwords from askpass programs.
//!
//! ## Protocol
//!
//! One JSON line each way over a Unix stream socket.
//! - Request: `{"prompt": "...", "echo": false}`
//! - Response: `{"password": "...", "cancelled": false}`
//!
//! A missing socket variable, an unreachable broker, a malformed reply,
//! and an operator cancellation all degrade to an empty credential on
//! stdout with exit 0, so non-interactive callers get a clean failed-auth
//! instead of a stuck prompt. `SSH_ASKPASS_PROMPT=confirm` (host key
//! questions) switches the request to echoed input.
//!
//! ## Design Principles
//!
//! - Zero async runtime; one blocking round trip and exit
//! - Minimal dependencies (serde + serde_json only)
//! - Never logs or stores the secret anywhere

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the operator gets to answer before the relay gives up.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

const SOCKET_ENV: &str = "LAZYTUNNEL_ASKPASS_SOCKET";

#[derive(Serialize)]
struct PromptRequest<'a> {
    prompt: &'a str,
    echo: bool,
}

#[derive(Deserialize)]
struct PromptResponse {
    #[serde(default)]
    password: String,
    #[serde(default)]
    cancelled: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("lazytunnel-askpass {}", VERSION);
        return;
    }

    let prompt = args.get(1).map(String::as_str).unwrap_or("Password: ");
    let credential = match relay(prompt) {
        Ok(Some(password)) => password,
        Ok(None) => {
            eprintln!("[lazytunnel-askpass] prompt cancelled");
            String::new()
        }
        Err(e) => {
            eprintln!("[lazytunnel-askpass] {}", e);
            String::new()
        }
    };

    // Stdout is the askpass contract; ssh consumes the line. Degraded
    // paths still print the (empty) credential so callers see a normal
    // failed authentication instead of a broken prompt program.
    println!("{}", credential);
}

/// One request/response round trip with the broker. `Ok(None)` means the
/// operator declined.
fn relay(prompt: &str) -> io::Result<Option<String>> {
    let socket = std::env::var(SOCKET_ENV).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not set; no broker to ask", SOCKET_ENV),
        )
    })?;

    // ssh marks host key and other yes/no questions so askpass programs
    // can show the typing.
    let echo = std::env::var("SSH_ASKPASS_PROMPT")
        .map(|v| v == "confirm")
        .unwrap_or(false);

    let mut stream = UnixStream::connect(&socket).map_err(|e| {
        io::Error::new(e.kind(), format!("cannot reach broker at {}: {}", socket, e))
    })?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
    stream.set_write_timeout(Some(REPLY_TIMEOUT))?;

    let request = serde_json::to_string(&PromptRequest { prompt, echo })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(stream, "{}", request)?;
    stream.flush()?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "broker closed without answering",
        ));
    }

    let response: PromptResponse = serde_json::from_str(line.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if response.cancelled {
        Ok(None)
    } else {
        Ok(Some(response.password))
    }
}
