//! Terminal implementation of the notification sink.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tmc_core::{NotificationLevel, NotificationSink};

/// Prints notifications to stderr and reads answers from stdin.
///
/// With `assume_yes`, every prompt picks the first choice without reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalSink {
    /// Pick the first choice instead of prompting.
    pub assume_yes: bool,
}

/// Prints `message` and reads one trimmed line from stdin.
///
/// Returns `None` on end of input.
pub async fn prompt_line(message: &str) -> Option<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(message.as_bytes()).await.ok()?;
    stdout.flush().await.ok()?;

    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .ok()?;
    if read == 0 {
        return None;
    }
    Some(line.trim().to_string())
}

#[async_trait]
impl NotificationSink for TerminalSink {
    async fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Info => eprintln!("{message}"),
            NotificationLevel::Warning => eprintln!("Warning: {message}"),
            NotificationLevel::Error => eprintln!("Error: {message}"),
        }
    }

    async fn ask(&self, message: &str, choices: &[&str]) -> Option<usize> {
        println!("{message}");
        for (i, choice) in choices.iter().enumerate() {
            println!("  {}) {choice}", i + 1);
        }
        if self.assume_yes {
            return (!choices.is_empty()).then_some(0);
        }
        let answer = prompt_line("> ").await?;
        let index = answer.parse::<usize>().ok()?.checked_sub(1)?;
        (index < choices.len()).then_some(index)
    }

    async fn course_status_changed(&self, course_id: u64, disabled: bool, new_exercise_ids: &[u64]) {
        tracing::debug!(course_id, disabled, new = ?new_exercise_ids, "Course status changed");
        if disabled {
            eprintln!("Course {course_id} is disabled on the server.");
        }
    }
}
