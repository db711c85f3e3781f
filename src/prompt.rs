//! Secret prompt sources
//!
//! Where an `AuthRequired` round trip or a broker request actually turns
//! into a secret. Implementations block; async callers wrap reads in
//! `spawn_blocking`.

use std::io::{self, BufRead, IsTerminal, Write};

/// A source of operator secrets.
pub trait SecretPrompt: Send + Sync {
    /// Ask for a secret. `echo` controls whether input is shown while
    /// typing. `None` means the operator cancelled (Ctrl-C, EOF).
    fn read_secret(&self, prompt: &str, echo: bool) -> Option<String>;

    /// Whether this source can actually reach an operator. Callers use this
    /// to fail fast instead of blocking on a prompt nobody will answer.
    fn is_interactive(&self) -> bool {
        true
    }
}

/// Prompts on the controlling terminal, masking input unless echo is asked
/// for.
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn read_secret(&self, prompt: &str, echo: bool) -> Option<String> {
        if echo {
            print!("{}", prompt);
            io::stdout().flush().ok()?;
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) => None,
                Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
                Err(_) => None,
            }
        } else {
            rpassword::prompt_password(prompt).ok()
        }
    }

    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }
}

/// Answers every prompt with a fixed secret. For automation and tests.
pub struct StaticSecret(pub String);

impl SecretPrompt for StaticSecret {
    fn read_secret(&self, _prompt: &str, _echo: bool) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Declines every prompt. For callers that must never block on an operator.
pub struct NoPrompt;

impl SecretPrompt for NoPrompt {
    fn read_secret(&self, _prompt: &str, _echo: bool) -> Option<String> {
        None
    }

    fn is_interactive(&self) -> bool {
        false
    }
}
