//! Cell execution.
//!
//! [`ExecutionEngine::execute_observable`] turns submitted code into a lazy
//! stream of cell snapshots. Nothing is sent to the kernel until the stream
//! is first polled. Each code cell runs as its own stream; the returned
//! stream re-emits the latest snapshot of every cell whenever one changes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, BoxStream};
use futures::StreamExt;

use crate::error::{Error, Result};
use crate::kernel::{
    ExecuteHandle, ExecuteReply, ExecuteRequest, IoPubMessage, KernelConnection, ReplyStatus,
};
use crate::session::SessionManager;

use super::cell::{Cell, CellOutput, CellState, CellType};
use super::split::split_cells;

/// Stream of cell snapshots for one execution.
pub type CellStream = BoxStream<'static, Result<Vec<Cell>>>;

/// Code that reports the interpreter version and executable.
const SYS_INFO_CODE: &str = "import sys\nprint(sys.version)\nprint(sys.executable)";

/// Working directory last set on the kernel, with the start time it was set under.
type WorkingDir = Arc<Mutex<Option<(u64, PathBuf)>>>;

/// Executes cells against a session's kernel.
pub struct ExecutionEngine {
    session: Arc<SessionManager>,
    working_dir: WorkingDir,
}

impl ExecutionEngine {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            working_dir: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Run `code` and stream cell snapshots.
    ///
    /// Fails immediately with [`Error::SessionDisposed`] without a live
    /// kernel. Kernel-side failures are reported on the cells, not as
    /// stream errors.
    pub fn execute_observable(
        &self,
        code: &str,
        file: &str,
        line: u32,
        id: &str,
        silent: bool,
    ) -> CellStream {
        let kernel = match self.session.kernel() {
            Ok(kernel) => kernel,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let mut cells = Vec::new();
        let mut runs = Vec::new();
        for (index, split) in split_cells(code).into_iter().enumerate() {
            let cell_line = line + split.line_offset;
            match split.cell_type {
                CellType::Markdown => cells.push(Cell::markdown(id, file, cell_line, split.source)),
                CellType::Code => {
                    let cell = Cell::code(id, file, cell_line, split.source);
                    runs.push(
                        CellRun {
                            session: self.session.clone(),
                            kernel: kernel.clone(),
                            working_dir: self.working_dir.clone(),
                            code: cell.data.source.join("\n"),
                            cell: cell.clone(),
                            silent,
                            issue_time: 0,
                            error_seen: false,
                        }
                        .into_stream()
                        .map(move |cell| (index, cell))
                        .boxed(),
                    );
                    cells.push(cell);
                }
            }
        }

        if runs.is_empty() {
            return stream::once(async move { Ok(cells) }).boxed();
        }

        stream::unfold(
            (stream::select_all(runs), cells),
            |(mut runs, mut latest)| async move {
                let (index, cell) = runs.next().await?;
                latest[index] = cell;
                Some((Ok(latest.clone()), (runs, latest)))
            },
        )
        .boxed()
    }

    /// Run `code` to completion and return the final snapshot.
    pub async fn execute(&self, code: &str, file: &str, line: u32) -> Result<Vec<Cell>> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut stream = self.execute_observable(code, file, line, &id, false);
        let mut last = Vec::new();
        while let Some(cells) = stream.next().await {
            last = cells?;
        }
        Ok(last)
    }

    /// Describe the kernel's interpreter as a markdown cell.
    pub async fn get_sys_info(&self) -> Option<Cell> {
        let kernel = self.session.kernel().ok()?;
        let request = ExecuteRequest {
            store_history: false,
            ..ExecuteRequest::new(SYS_INFO_CODE, false)
        };
        let (messages, _) = match run_to_completion(kernel.as_ref(), request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Querying kernel sys info failed: {}", e);
                return None;
            }
        };

        let output: String = messages
            .into_iter()
            .filter_map(|m| match m {
                IoPubMessage::Stream { name, text } if name == "stdout" => Some(text),
                _ => None,
            })
            .collect();
        let mut lines = output.lines();
        let version = lines.next().unwrap_or_default().trim().to_string();
        let executable = lines.next().unwrap_or_default().trim().to_string();

        let mut source = vec![format!("Python {}", version)];
        if !executable.is_empty() {
            source.push(format!("Executable: {}", executable));
        }
        if let Some(info) = self.session.connection_info() {
            let kind = if info.local_launch { "local" } else { "remote" };
            source.push(format!("Connected to {} server {}", kind, info.base_url));
        }

        let id = uuid::Uuid::new_v4().to_string();
        Some(Cell::markdown(&id, "", 0, source))
    }
}

/// Submit a request and collect everything it produces.
pub(crate) async fn run_to_completion(
    kernel: &dyn KernelConnection,
    request: ExecuteRequest,
) -> Result<(Vec<IoPubMessage>, ExecuteReply)> {
    let ExecuteHandle {
        mut messages, done, ..
    } = kernel.execute(request).await?;
    let mut collected = Vec::new();
    while let Some(message) = messages.recv().await {
        collected.push(message);
    }
    let reply = done
        .await
        .map_err(|_| Error::Kernel("kernel went away".to_string()))??;
    Ok((collected, reply))
}

/// Python that changes the kernel's working directory.
fn chdir_code(dir: &Path) -> String {
    let quoted = serde_json::Value::String(dir.to_string_lossy().to_string()).to_string();
    format!("import os\nos.chdir({})", quoted)
}

/// One code cell being executed.
struct CellRun {
    session: Arc<SessionManager>,
    kernel: Arc<dyn KernelConnection>,
    working_dir: WorkingDir,
    code: String,
    cell: Cell,
    silent: bool,
    issue_time: u64,
    error_seen: bool,
}

enum Step {
    Submit(Box<CellRun>),
    Running(Box<CellRun>, ExecuteHandle),
    Done,
}

impl CellRun {
    fn is_stale(&self) -> bool {
        self.session.is_stale(self.issue_time)
    }

    fn into_stream(self) -> BoxStream<'static, Cell> {
        stream::unfold(Step::Submit(Box::new(self)), |step| async move {
            match step {
                Step::Submit(run) => run.submit().await,
                Step::Running(run, handle) => run.next_update(handle).await,
                Step::Done => None,
            }
        })
        .boxed()
    }

    /// Best-effort: point the kernel at the submitted file's directory.
    async fn change_directory(&self) {
        if !self.session.config().change_directory_on_run {
            return;
        }
        let Some(dir) = Path::new(&self.cell.file)
            .parent()
            .filter(|d| !d.as_os_str().is_empty() && d.is_dir())
        else {
            return;
        };

        let start_time = self.session.start_time();
        {
            let current = self.working_dir.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|(t, d)| *t == start_time && d == dir) {
                return;
            }
        }

        let request = ExecuteRequest::new(chdir_code(dir), true);
        match run_to_completion(self.kernel.as_ref(), request).await {
            Ok(_) => {
                *self.working_dir.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((start_time, dir.to_path_buf()));
            }
            Err(e) => tracing::debug!("Changing kernel directory to {} failed: {}", dir.display(), e),
        }
    }

    async fn submit(mut self: Box<Self>) -> Option<(Cell, Step)> {
        self.issue_time = self.session.issue_time();
        self.change_directory().await;
        if self.is_stale() {
            return None;
        }

        let request = ExecuteRequest::new(self.code.clone(), self.silent);
        match self.kernel.execute(request).await {
            Ok(handle) => {
                tracing::debug!("Executing cell {} as {}", self.cell.id, handle.msg_id);
                self.cell.advance(CellState::Executing);
                let snapshot = self.cell.clone();
                Some((snapshot, Step::Running(self, handle)))
            }
            Err(e) if self.is_stale() => {
                tracing::debug!("Dropping failed request from before restart: {}", e);
                None
            }
            Err(e) => {
                self.fail(&e);
                Some((self.cell.clone(), Step::Done))
            }
        }
    }

    async fn next_update(mut self: Box<Self>, mut handle: ExecuteHandle) -> Option<(Cell, Step)> {
        loop {
            tokio::select! {
                biased;
                message = handle.messages.recv() => match message {
                    Some(message) => {
                        if self.is_stale() {
                            return None;
                        }
                        self.fold(message);
                        let snapshot = self.cell.clone();
                        return Some((snapshot, Step::Running(self, handle)));
                    }
                    None => {
                        let done = (&mut handle.done).await;
                        return self.complete(done);
                    }
                },
                done = &mut handle.done => return self.complete(done),
            }
        }
    }

    /// Apply one IOPub message. Every message is followed by a snapshot,
    /// changed or not.
    fn fold(&mut self, message: IoPubMessage) {
        match message {
            IoPubMessage::Status { execution_state } => {
                self.session.report_status(execution_state);
            }
            IoPubMessage::Unknown { ref msg_type, .. } => {
                tracing::debug!("Ignoring {} message for cell {}", msg_type, self.cell.id);
            }
            message => {
                if matches!(message, IoPubMessage::Error { .. }) {
                    self.error_seen = true;
                }
                self.cell.apply(message);
            }
        }
    }

    fn complete(
        mut self: Box<Self>,
        done: std::result::Result<Result<ExecuteReply>, tokio::sync::oneshot::error::RecvError>,
    ) -> Option<(Cell, Step)> {
        if self.is_stale() {
            tracing::debug!("Dropping completion of cell {} from before restart", self.cell.id);
            return None;
        }
        match done {
            Ok(Ok(reply)) => {
                if self.cell.data.execution_count.is_none() {
                    self.cell.data.execution_count = reply.execution_count;
                }
                let failed = self.error_seen || reply.status == ReplyStatus::Error;
                self.cell.advance(if failed {
                    CellState::Error
                } else {
                    CellState::Finished
                });
            }
            Ok(Err(e)) => self.fail(&e),
            Err(_) => self.fail(&Error::Kernel("kernel died".to_string())),
        }
        Some((self.cell.clone(), Step::Done))
    }

    fn fail(&mut self, error: &Error) {
        tracing::warn!("Cell {} failed: {}", self.cell.id, error);
        self.cell
            .push_output(CellOutput::failure("KernelError", error.to_string()));
        self.cell.advance(CellState::Executing);
        self.cell.advance(CellState::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chdir_code_quotes_path() {
        let code = chdir_code(Path::new("/tmp/it's here"));
        assert_eq!(code, "import os\nos.chdir(\"/tmp/it's here\")");
    }
}
