//! In-process kernel for tests.
//!
//! [`FakeKernel`] speaks the [`KernelConnection`] contract without a Jupyter
//! server. It understands a tiny Python subset, enough to drive the
//! execution engine through realistic message sequences:
//!
//! - `name = expr` assigns, `print(expr)` writes to stdout
//! - `raise Name("message")` produces an error output
//! - a bare expression on the last line produces an `execute_result`
//! - `while True: pass` runs until interrupted
//! - `import ...` and `os.chdir(...)` are accepted and ignored
//!
//! Expressions are integer and string literals, variables, `sys.version`,
//! `sys.executable`, and `+`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc, oneshot, watch};

use crate::connection::LaunchInfo;
use crate::error::{Error, Result};
use crate::kernel::{
    ExecuteHandle, ExecuteReply, ExecuteRequest, ExecutionState, IoPubMessage, KernelConnection,
    KernelConnector, ReplyStatus,
};

/// How a [`FakeKernel`] behaves.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Pause between published messages.
    pub step_delay: Option<Duration>,
    /// Whether `while True` loops stop on interrupt.
    pub interrupt_settles: bool,
    /// Whether interrupt requests never get an answer.
    pub interrupt_hangs: bool,
    /// Whether in-place restarts fail.
    pub restart_fails: bool,
    /// How long an in-place restart takes.
    pub restart_delay: Option<Duration>,
    pub sys_version: String,
    pub sys_executable: String,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            step_delay: None,
            interrupt_settles: true,
            interrupt_hangs: false,
            restart_fails: false,
            restart_delay: None,
            sys_version: "3.11.4 (main, Jun  7 2023, 00:00:00) [GCC 12.2.0]".to_string(),
            sys_executable: "/usr/bin/python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FakeValue {
    Int(i64),
    Str(String),
}

impl FakeValue {
    fn display(&self) -> String {
        match self {
            FakeValue::Int(n) => n.to_string(),
            FakeValue::Str(s) => s.clone(),
        }
    }

    fn repr(&self) -> String {
        match self {
            FakeValue::Int(n) => n.to_string(),
            FakeValue::Str(s) => format!("'{}'", s),
        }
    }
}

type EvalError = (String, String);

#[derive(Default)]
struct FakeState {
    vars: HashMap<String, FakeValue>,
    execution_count: u32,
}

struct FakeInner {
    behavior: FakeBehavior,
    state: Mutex<FakeState>,
    interrupt: Notify,
    /// Bumped on restart and shutdown; running requests abort.
    generation: watch::Sender<u64>,
    published: AtomicUsize,
}

impl FakeInner {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn eval(&self, expr: &str) -> std::result::Result<FakeValue, EvalError> {
        let expr = expr.trim();
        let quoted = |q: char| expr.len() >= 2 && expr.starts_with(q) && expr.ends_with(q);
        if (quoted('"') || quoted('\'')) && !expr[1..expr.len() - 1].contains(['"', '\'']) {
            return Ok(FakeValue::Str(expr[1..expr.len() - 1].to_string()));
        }
        if let Ok(n) = expr.parse::<i64>() {
            return Ok(FakeValue::Int(n));
        }
        match expr {
            "sys.version" => return Ok(FakeValue::Str(self.behavior.sys_version.clone())),
            "sys.executable" => return Ok(FakeValue::Str(self.behavior.sys_executable.clone())),
            _ => {}
        }
        if let Some(value) = self.state().vars.get(expr) {
            return Ok(value.clone());
        }
        if let Some((lhs, rhs)) = expr.rsplit_once('+') {
            return match (self.eval(lhs)?, self.eval(rhs)?) {
                (FakeValue::Int(a), FakeValue::Int(b)) => Ok(FakeValue::Int(a + b)),
                (FakeValue::Str(a), FakeValue::Str(b)) => Ok(FakeValue::Str(a + &b)),
                _ => Err((
                    "TypeError".to_string(),
                    "unsupported operand type(s) for +".to_string(),
                )),
            };
        }
        Err(("NameError".to_string(), format!("name '{}' is not defined", expr)))
    }

    async fn publish(&self, tx: &mpsc::UnboundedSender<IoPubMessage>, message: IoPubMessage) {
        if let Some(delay) = self.behavior.step_delay {
            tokio::time::sleep(delay).await;
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(message);
    }

    /// Run a request, publishing its output. Returns the reply status.
    async fn run(
        &self,
        request: &ExecuteRequest,
        execution_count: u32,
        tx: &mpsc::UnboundedSender<IoPubMessage>,
    ) -> ReplyStatus {
        let lines: Vec<&str> = request
            .code
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        for (i, line) in lines.iter().enumerate() {
            let last = i + 1 == lines.len();
            if line.starts_with("import ") || line.starts_with("from ") || line.starts_with("os.chdir(") {
                continue;
            }

            let outcome: std::result::Result<(), EvalError> = if line.starts_with("while True") {
                if self.behavior.interrupt_settles {
                    self.interrupt.notified().await;
                    Err(("KeyboardInterrupt".to_string(), String::new()))
                } else {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            } else if let Some(rest) = line.strip_prefix("raise ") {
                let (ename, evalue) = match rest.split_once('(') {
                    Some((name, arg)) => (
                        name.trim().to_string(),
                        self.eval(arg.trim_end_matches(')'))
                            .map(|v| v.display())
                            .unwrap_or_default(),
                    ),
                    None => (rest.trim().to_string(), String::new()),
                };
                Err((ename, evalue))
            } else if let Some(arg) = line
                .strip_prefix("print(")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                match self.eval(arg) {
                    Ok(value) => {
                        let text = format!("{}\n", value.display());
                        self.publish(tx, IoPubMessage::Stream { name: "stdout".to_string(), text })
                            .await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            } else if let Some((name, expr)) = line
                .split_once('=')
                .filter(|(name, expr)| is_identifier(name.trim()) && !expr.starts_with('='))
            {
                self.eval(expr).map(|value| {
                    self.state().vars.insert(name.trim().to_string(), value);
                })
            } else {
                match self.eval(line) {
                    Ok(value) if last && !request.silent => {
                        self.publish(tx, IoPubMessage::text_result(execution_count, value.repr()))
                            .await;
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            };

            if let Err((ename, evalue)) = outcome {
                let traceback = vec![format!("{}: {}", ename, evalue)];
                self.publish(tx, IoPubMessage::Error { ename, evalue, traceback })
                    .await;
                return ReplyStatus::Error;
            }
        }
        ReplyStatus::Ok
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A scripted kernel living in this process.
pub struct FakeKernel {
    id: String,
    inner: Arc<FakeInner>,
    executed: Mutex<Vec<String>>,
    interrupts: AtomicUsize,
    restarts: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl FakeKernel {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            inner: Arc::new(FakeInner {
                behavior,
                state: Mutex::new(FakeState::default()),
                interrupt: Notify::new(),
                generation: watch::Sender::new(0),
                published: AtomicUsize::new(0),
            }),
            executed: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Code of every request received, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// IOPub messages published across all requests.
    pub fn published_count(&self) -> usize {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn abort_running(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }
}

impl KernelConnection for FakeKernel {
    fn kernel_id(&self) -> &str {
        &self.id
    }

    fn execute(&self, request: ExecuteRequest) -> BoxFuture<'_, Result<ExecuteHandle>> {
        Box::pin(async move {
            if self.shutdown_count() > 0 {
                return Err(Error::Kernel("kernel is shut down".to_string()));
            }
            self.executed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.code.clone());

            let msg_id = uuid::Uuid::new_v4().to_string();
            let (tx, messages) = mpsc::unbounded_channel();
            let (done_tx, done) = oneshot::channel();
            let inner = self.inner.clone();
            let mut generation = inner.generation.subscribe();

            tokio::spawn(async move {
                let execution_count = {
                    let mut state = inner.state();
                    if request.store_history {
                        state.execution_count += 1;
                    }
                    state.execution_count
                };

                let work = async {
                    inner
                        .publish(&tx, IoPubMessage::Status { execution_state: ExecutionState::Busy })
                        .await;
                    inner
                        .publish(
                            &tx,
                            IoPubMessage::ExecuteInput {
                                code: request.code.clone(),
                                execution_count: Some(execution_count),
                            },
                        )
                        .await;
                    let status = inner.run(&request, execution_count, &tx).await;
                    inner
                        .publish(&tx, IoPubMessage::Status { execution_state: ExecutionState::Idle })
                        .await;
                    status
                };

                tokio::select! {
                    status = work => {
                        drop(tx);
                        let _ = done_tx.send(Ok(ExecuteReply {
                            status,
                            execution_count: Some(execution_count),
                        }));
                    }
                    _ = generation.changed() => {
                        drop(tx);
                        let _ = done_tx.send(Err(Error::Kernel("kernel restarted".to_string())));
                    }
                }
            });

            Ok(ExecuteHandle {
                msg_id,
                messages,
                done,
            })
        })
    }

    fn interrupt(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            if self.inner.behavior.interrupt_hangs {
                std::future::pending::<()>().await;
            }
            self.inner.interrupt.notify_one();
            Ok(())
        })
    }

    fn restart(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.inner.behavior.restart_delay {
                tokio::time::sleep(delay).await;
            }
            if self.inner.behavior.restart_fails {
                return Err(Error::Kernel("restart refused".to_string()));
            }
            self.abort_running();
            *self.inner.state() = FakeState::default();
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.abort_running();
            Ok(())
        })
    }
}

/// Connector handing out a fresh [`FakeKernel`] per connection.
#[derive(Default)]
pub struct FakeConnector {
    behavior: FakeBehavior,
    kernels: Mutex<Vec<Arc<FakeKernel>>>,
    fail_with: Option<String>,
}

impl FakeConnector {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// A connector whose connections always fail.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }

    /// Every kernel handed out so far.
    pub fn kernels(&self) -> Vec<Arc<FakeKernel>> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_kernel(&self) -> Option<Arc<FakeKernel>> {
        self.kernels().last().cloned()
    }
}

impl KernelConnector for FakeConnector {
    fn connect(&self, _launch: &LaunchInfo) -> BoxFuture<'_, Result<Arc<dyn KernelConnection>>> {
        Box::pin(async move {
            if let Some(message) = &self.fail_with {
                return Err(Error::Kernel(message.clone()));
            }
            let kernel = Arc::new(FakeKernel::new(self.behavior.clone()));
            self.kernels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(kernel.clone());
            Ok(kernel as Arc<dyn KernelConnection>)
        })
    }
}
