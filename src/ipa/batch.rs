//! Batch accumulator
//!
//! Queues commands and submits them as a single `batch` call. The server
//! runs the entries in append order.
//!
//! A batch must be started before commands are added, and a successful
//! flush closes it again, so a stale queue can never be resubmitted.

use serde_json::Value;
use tracing::{debug, warn};

use super::client::{Command, DirectoryClient};
use super::error::translate;
use super::DirectoryError;

#[derive(Debug, Default)]
pub struct BatchJob {
    commands: Vec<Command>,
    started: bool,
}

impl BatchJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the queue and open a new batch
    pub fn start(&mut self) {
        self.commands.clear();
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Queue a command. No I/O happens until [`BatchJob::flush`].
    pub fn add(&mut self, command: Command) -> Result<(), DirectoryError> {
        if !self.started {
            return Err(DirectoryError::BatchNotStarted);
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Submit the queue as one round trip.
    ///
    /// Returns `None` without touching the network when nothing is queued.
    /// On failure the queue is kept so the caller can retry the flush.
    pub async fn flush(
        &mut self,
        client: &mut DirectoryClient,
    ) -> Result<Option<Vec<Value>>, DirectoryError> {
        if self.commands.is_empty() {
            self.started = false;
            return Ok(None);
        }

        debug!(commands = self.commands.len(), "Flushing batch operation");
        let entries = self.commands.iter().map(Command::to_batch_entry);
        let result = client.invoke(Command::new("batch").args(entries)).await?;

        let results = result
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (command, entry) in self.commands.iter().zip(&results) {
            if let Some(code) = entry.get("error_code").and_then(Value::as_i64) {
                let message = entry.get("error").and_then(Value::as_str).unwrap_or_default();
                if let Err(e) = translate(&command.method, code, message) {
                    warn!(method = %command.method, error = %e, "Batched IPA command failed");
                }
            }
        }

        self.commands.clear();
        self.started = false;
        Ok(Some(results))
    }
}
