//! Human approval checkpoints
//!
//! The orchestrator stops twice to ask the operator before continuing. A "no"
//! ends the run without undoing anything that already happened.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};

/// Blocks for a yes/no decision
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    /// Ask `question`; `Ok(true)` means proceed
    async fn confirm(&self, question: &str) -> Result<bool>;
}

/// Interpret one line of operator input
///
/// Case-insensitive, surrounding whitespace ignored; anything starting with
/// `y` is yes, anything starting with `n` is no, everything else is `None`.
pub fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('y') => Some(true),
        Some('n') => Some(false),
        _ => None,
    }
}

/// Prompts on a writer and reads answers from a reader, re-asking until it
/// gets a yes or a no
pub struct PromptGate<R, W> {
    io: tokio::sync::Mutex<(R, W)>,
}

impl PromptGate<BufReader<Stdin>, Stdout> {
    /// Prompt on stdout, read from stdin
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> PromptGate<R, W> {
    /// Create a gate over arbitrary input/output
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: tokio::sync::Mutex::new((reader, writer)),
        }
    }

    /// Recover the reader and writer
    pub fn into_inner(self) -> (R, W) {
        self.io.into_inner()
    }
}

#[async_trait]
impl<R, W> ConfirmationGate for PromptGate<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn confirm(&self, question: &str) -> Result<bool> {
        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;
        let mut line = String::new();

        loop {
            writer
                .write_all(format!("{} (y/n): ", question).as_bytes())
                .await?;
            writer.flush().await?;

            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(OrchestratorError::ConfirmationClosed);
            }

            if let Some(answer) = parse_answer(&line) {
                return Ok(answer);
            }
        }
    }
}

/// Answers from a fixed script, for tests and automation
///
/// Running out of answers is treated like closed input.
#[derive(Debug, Default)]
pub struct ScriptedGate {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedGate {
    /// Create a gate that replies with `answers` in order
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// Questions asked so far
    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .map(|asked| asked.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConfirmationGate for ScriptedGate {
    async fn confirm(&self, question: &str) -> Result<bool> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(question.to_string());
        }

        self.answers
            .lock()
            .map_err(|_| OrchestratorError::config("scripted answers lock poisoned"))?
            .pop_front()
            .ok_or(OrchestratorError::ConfirmationClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y"), Some(true));
        assert_eq!(parse_answer("Y\n"), Some(true));
        assert_eq!(parse_answer("  yes please "), Some(true));
        assert_eq!(parse_answer("No"), Some(false));
        assert_eq!(parse_answer("nope"), Some(false));
        assert_eq!(parse_answer("maybe"), None);
        assert_eq!(parse_answer(""), None);
        assert_eq!(parse_answer("   \n"), None);
    }

    #[tokio::test]
    async fn test_prompt_reasks_until_valid() {
        let input: &[u8] = b"maybe\n\nYES\n";
        let gate = PromptGate::new(BufReader::new(input), Vec::new());

        assert!(gate.confirm("Proceed?").await.unwrap());

        let (_, output) = gate.into_inner();
        let output = String::from_utf8(output).unwrap();
        assert_eq!(output.matches("Proceed? (y/n): ").count(), 3);
    }

    #[tokio::test]
    async fn test_prompt_no() {
        let input: &[u8] = b"n\n";
        let gate = PromptGate::new(BufReader::new(input), Vec::new());
        assert!(!gate.confirm("Remove old instance?").await.unwrap());
    }

    #[tokio::test]
    async fn test_prompt_closed_input() {
        let input: &[u8] = b"what\n";
        let gate = PromptGate::new(BufReader::new(input), Vec::new());
        let err = gate.confirm("Proceed?").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfirmationClosed));
    }

    #[test]
    fn test_scripted_gate() {
        let gate = ScriptedGate::new([true, false]);
        assert!(tokio_test::block_on(gate.confirm("first")).unwrap());
        assert!(!tokio_test::block_on(gate.confirm("second")).unwrap());
        assert!(tokio_test::block_on(gate.confirm("third")).is_err());
        assert_eq!(gate.asked(), vec!["first", "second", "third"]);
    }
}
