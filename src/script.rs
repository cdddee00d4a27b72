//! Line-oriented scripts that drive an [`Orchestrator`].
//!
//! Each non-blank line reads `<session>: <sql>`; several statements may
//! share a line when separated by `;`. Lines starting with `#` or `--` are
//! comments. Every session gets a worker task that runs its statements in
//! order, so a session blocked on a row lock does not hold up the others.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::engine::QueryResult;
use crate::models::SessionStatus;
use crate::orchestrator::Orchestrator;
use crate::{AppError, Result};

/// One statement addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    /// 1-based source line.
    pub line: usize,
    /// Target session label.
    pub label: String,
    /// Statement text without its trailing `;`.
    pub sql: String,
}

/// Result of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// 1-based source line.
    pub line: usize,
    /// Session that ran the step.
    pub label: String,
    /// Statement text.
    pub sql: String,
    /// What happened.
    pub outcome: StepOutcome,
}

/// Success or failure of a step.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The engine accepted the statement.
    Ok {
        /// Statement classification.
        kind: &'static str,
        /// Engine output.
        result: QueryResult,
    },
    /// The statement failed.
    Error {
        /// Error text.
        message: String,
    },
}

type StepQueue = mpsc::UnboundedSender<(ScriptStep, oneshot::Sender<()>)>;

/// Parse a whole script.
///
/// # Errors
///
/// Returns `AppError::Script` naming the first malformed line.
pub fn parse_script(text: &str) -> Result<Vec<ScriptStep>> {
    let mut steps = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        steps.extend(parse_line(idx + 1, raw)?);
    }
    Ok(steps)
}

fn parse_line(number: usize, raw: &str) -> Result<Vec<ScriptStep>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("--") {
        return Ok(Vec::new());
    }

    let Some((label, sql)) = line.split_once(':') else {
        return Err(AppError::Script(format!(
            "line {number}: expected `<session>: <sql>`"
        )));
    };
    let label = label.trim();
    if label.is_empty() || label.contains(char::is_whitespace) {
        return Err(AppError::Script(format!(
            "line {number}: invalid session label {label:?}"
        )));
    }

    let statements = split_statements(sql);
    if statements.is_empty() {
        return Err(AppError::Script(format!("line {number}: missing statement")));
    }
    Ok(statements
        .into_iter()
        .map(|sql| ScriptStep {
            line: number,
            label: label.to_owned(),
            sql,
        })
        .collect())
}

/// Split on `;` outside single-quoted literals.
fn split_statements(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ';' if !in_quote => {
                push_trimmed(&mut out, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_trimmed(&mut out, &current);
    out
}

fn push_trimmed(out: &mut Vec<String>, statement: &str) {
    let trimmed = statement.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_owned());
    }
}

/// Run `steps` against `orchestrator` and collect reports in completion
/// order.
///
/// The next step is dispatched once the previous one has finished or its
/// session reports `waiting`. Cancelling `cancel` aborts all workers; the
/// reports gathered so far are still returned.
///
/// # Errors
///
/// Returns `AppError::Script` if a step names an unknown session.
pub async fn run_script(
    orchestrator: Arc<Orchestrator>,
    steps: Vec<ScriptStep>,
    cancel: CancellationToken,
) -> Result<Vec<StepReport>> {
    if let Some(step) = steps.iter().find(|s| orchestrator.state(&s.label).is_err()) {
        return Err(AppError::Script(format!(
            "line {}: unknown session {:?}",
            step.line, step.label
        )));
    }

    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let mut queues: HashMap<String, StepQueue> = HashMap::new();
    let mut workers = Vec::new();
    for label in orchestrator.labels() {
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(label.to_owned(), tx);
        let span = info_span!("script_worker", session = %label);
        workers.push(tokio::spawn(
            worker(Arc::clone(&orchestrator), label.to_owned(), rx, report_tx.clone())
                .instrument(span),
        ));
    }
    drop(report_tx);
    let aborts: Vec<_> = workers.iter().map(tokio::task::JoinHandle::abort_handle).collect();

    let mut cancelled = false;
    for step in steps {
        let mut state = orchestrator.watch(&step.label)?;
        let Some(queue) = queues.get(&step.label) else {
            continue;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if queue.send((step, done_tx)).is_err() {
            warn!("script worker stopped early");
            break;
        }
        tokio::select! {
            _ = done_rx => {}
            _ = state.wait_for(|s| s.status == SessionStatus::Waiting) => {}
            () = cancel.cancelled() => {
                cancelled = true;
                break;
            }
        }
    }
    drop(queues);

    if !cancelled {
        tokio::select! {
            _ = join_all(workers) => {}
            () = cancel.cancelled() => cancelled = true,
        }
    }
    if cancelled {
        info!("script cancelled; aborting workers");
        for handle in &aborts {
            handle.abort();
        }
    }

    let mut reports = Vec::new();
    while let Ok(report) = report_rx.try_recv() {
        reports.push(report);
    }
    Ok(reports)
}

async fn worker(
    orchestrator: Arc<Orchestrator>,
    label: String,
    mut steps: mpsc::UnboundedReceiver<(ScriptStep, oneshot::Sender<()>)>,
    reports: mpsc::UnboundedSender<StepReport>,
) {
    while let Some((step, done)) = steps.recv().await {
        let outcome = match orchestrator.execute(&label, &step.sql).await {
            Ok(execution) => StepOutcome::Ok {
                kind: execution.statement.kind(),
                result: execution.result,
            },
            Err(err) => StepOutcome::Error {
                message: err.to_string(),
            },
        };
        let _ = reports.send(StepReport {
            line: step.line,
            label: label.clone(),
            sql: step.sql,
            outcome,
        });
        let _ = done.send(());
    }
}
