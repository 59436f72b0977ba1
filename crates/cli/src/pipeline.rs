//! Drive an [`AggregateProcessor`] over newline-delimited JSON.
//!
//! Input lines are parsed into events and handed to the processor in
//! batches on a blocking worker. A [`ConclusionScheduler`] concludes idle
//! groups concurrently. Every output event is written as one JSON line.

use std::sync::Arc;
use std::time::Duration;

use tally_aggregate::{AggregateProcessor, ConclusionScheduler};
use tally_core::{EVENT_TYPE_EVENT, Event};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CliError;

/// Totals for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub lines_read: u64,
    pub malformed_lines: u64,
    pub events_written: u64,
}

pub struct Pipeline {
    processor: Arc<AggregateProcessor>,
    batch_size: usize,
    conclude_interval: Duration,
}

impl Pipeline {
    pub fn new(
        processor: Arc<AggregateProcessor>,
        batch_size: usize,
        conclude_interval: Duration,
    ) -> Self {
        Self {
            processor,
            batch_size: batch_size.max(1),
            conclude_interval,
        }
    }

    /// Read events until end of input (or Ctrl-C), then shut the processor
    /// down and write what the shutdown policy produced.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<RunSummary, CliError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut summary = RunSummary::default();
        let (output_tx, mut output_rx) = mpsc::channel::<Vec<Event>>(64);
        let (mut scheduler, shutdown_tx) = ConclusionScheduler::new(
            Arc::clone(&self.processor),
            self.conclude_interval,
            output_tx,
        );
        let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

        let mut lines = reader.lines();
        let mut batch = Vec::with_capacity(self.batch_size);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    summary.lines_read += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Event::from_json(EVENT_TYPE_EVENT, &line) {
                        Ok(event) => batch.push(event),
                        Err(e) => {
                            summary.malformed_lines += 1;
                            warn!(line = summary.lines_read, error = %e, "skipping malformed input line");
                        }
                    }
                    if batch.len() >= self.batch_size {
                        let events = self.execute(std::mem::take(&mut batch)).await?;
                        summary.events_written += write_events(&mut writer, &events).await?;
                    }
                }
                Some(events) = output_rx.recv() => {
                    summary.events_written += write_events(&mut writer, &events).await?;
                }
                _ = &mut ctrl_c => {
                    info!("interrupt received, shutting down");
                    break;
                }
            }
        }

        if !batch.is_empty() {
            let events = self.execute(batch).await?;
            summary.events_written += write_events(&mut writer, &events).await?;
        }

        if shutdown_tx.send(()).await.is_err() {
            debug!("conclusion scheduler already stopped");
        }
        let undelivered = scheduler_handle.await?;
        summary.events_written += write_events(&mut writer, &undelivered).await?;
        while let Some(events) = output_rx.recv().await {
            summary.events_written += write_events(&mut writer, &events).await?;
        }

        let processor = Arc::clone(&self.processor);
        let remaining = tokio::task::spawn_blocking(move || processor.shutdown()).await?;
        summary.events_written += write_events(&mut writer, &remaining).await?;
        writer.flush().await?;

        info!(
            lines_read = summary.lines_read,
            malformed_lines = summary.malformed_lines,
            events_written = summary.events_written,
            "input exhausted"
        );
        Ok(summary)
    }

    async fn execute(&self, batch: Vec<Event>) -> Result<Vec<Event>, CliError> {
        let processor = Arc::clone(&self.processor);
        Ok(tokio::task::spawn_blocking(move || processor.execute(batch)).await?)
    }
}

async fn write_events<W>(writer: &mut W, events: &[Event]) -> Result<u64, CliError>
where
    W: AsyncWrite + Unpin,
{
    for event in events {
        let mut line = event.to_json_string()?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
    }
    Ok(events.len() as u64)
}
