//! Run command implementation for Mercury CLI.
//!
//! Executes a code file's cells against a kernel and prints the outputs.

use std::path::Path;
use std::time::Instant;

use futures::StreamExt;
use mercury_core::{Cell, ExecutionRequest, InterruptResult, LocalServer, MercuryConfig, Server};

use crate::colors;
use crate::output::{failed_count, print_cells, print_summary};
use crate::session::{self, KernelArgs};

/// Run `file` on a fresh session.
pub async fn execute(config: &MercuryConfig, file: &str, kernel: &KernelArgs) -> anyhow::Result<()> {
    let (path, code) = read_source(file)?;
    let start = Instant::now();

    let session = session::open(config, kernel).await?;
    let server = LocalServer::new(session);
    print_header("Running", &path, &server).await;

    let result = run_file(&server, &code, &path, config).await;
    if let Err(e) = server.shutdown().await {
        tracing::warn!("Session shutdown failed: {}", e);
    }
    finish(&result?, start)
}

/// Canonical path and contents of a source file.
pub fn read_source(file: &str) -> anyhow::Result<(String, String)> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }
    let code = std::fs::read_to_string(path)?;
    let path = path.canonicalize()?;
    Ok((path.to_string_lossy().to_string(), code))
}

pub async fn print_header(title: &str, path: &str, server: &dyn Server) {
    println!("\n{}Mercury{} - {}", colors::BOLD, colors::RESET, title);
    println!("{}", "─".repeat(50));
    println!("{}  ◆ File:{} {}", colors::CYAN, colors::RESET, path);
    if let Some(info) = server.connection_info() {
        println!("{}  ◆ Server:{} {}", colors::CYAN, colors::RESET, info.base_url);
    }
    if let Some(sys) = server.get_sys_info().await {
        if let Some(first) = sys.data.source.first() {
            println!("{}  ◆ Kernel:{} {}", colors::CYAN, colors::RESET, first);
        }
    }
    println!("{}", "─".repeat(50));
}

/// Whether a line starts a new cell (`# %%`, `#%% [markdown]`, `# <codecell>`).
fn is_cell_marker(line: &str) -> bool {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.to_ascii_lowercase();
    compact.starts_with("#%%")
        || compact.starts_with("#<codecell>")
        || compact.starts_with("#<markdowncell>")
}

/// Split a file into `(first line, code)` chunks at cell markers.
///
/// Marker lines stay with their chunk so markdown cells keep their marker.
pub fn file_cells(code: &str) -> Vec<(u32, String)> {
    let mut chunks: Vec<(u32, Vec<&str>)> = Vec::new();
    for (index, line) in code.lines().enumerate() {
        match chunks.last_mut() {
            Some((_, lines)) if !is_cell_marker(line) => lines.push(line),
            _ => chunks.push((index as u32, vec![line])),
        }
    }
    chunks
        .into_iter()
        .filter(|(_, lines)| lines.iter().any(|l| !l.trim().is_empty() && !is_cell_marker(l)))
        .map(|(line, lines)| (line, lines.join("\n")))
        .collect()
}

/// Execute each cell of `code` through `server` in order.
///
/// Stops after the first cell that errors. The first Ctrl+C interrupts the
/// kernel; a second one abandons the run.
pub async fn run_file(
    server: &dyn Server,
    code: &str,
    file: &str,
    config: &MercuryConfig,
) -> anyhow::Result<Vec<Cell>> {
    let mut all = Vec::new();
    let mut interrupted = false;

    for (line, chunk) in file_cells(code) {
        let mut stream = server.execute_observable(ExecutionRequest::new(chunk, file, line));
        let mut last = Vec::new();
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(cells) => last = cells?,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    if interrupted {
                        anyhow::bail!("Run abandoned");
                    }
                    interrupted = true;
                    println!("\n{}Interrupting kernel...{}", colors::YELLOW, colors::RESET);
                    match server.interrupt_kernel(config.interrupt_timeout()).await? {
                        InterruptResult::Success => {}
                        InterruptResult::Restarted => {
                            println!("{}Kernel restarted{}", colors::YELLOW, colors::RESET)
                        }
                        InterruptResult::TimedOut => {
                            println!("{}Interrupt timed out{}", colors::RED, colors::RESET)
                        }
                    }
                }
            }
        }

        let stop = interrupted || failed_count(&last) > 0;
        all.extend(last);
        if stop {
            break;
        }
    }
    Ok(all)
}

/// Print the cells and summary; fails when any cell errored.
pub fn finish(cells: &[Cell], start: Instant) -> anyhow::Result<()> {
    if cells.is_empty() {
        println!("\n{}No cells found in file.{}", colors::YELLOW, colors::RESET);
        return Ok(());
    }
    print_cells(cells);
    print_summary(cells, start.elapsed().as_secs_f64());

    let failed = failed_count(cells);
    if failed > 0 {
        anyhow::bail!("{} cell(s) failed", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mercury_core::testing::{FakeBehavior, FakeConnector};
    use mercury_core::{CancelToken, CellState, ConnectionInfo, LaunchInfo, SessionManager};

    use super::*;

    async fn server() -> LocalServer {
        let connector = Arc::new(FakeConnector::new(FakeBehavior::default()));
        let session = Arc::new(SessionManager::new(MercuryConfig::default(), connector));
        session
            .connect(
                LaunchInfo::new(ConnectionInfo::remote("http://localhost:8888", "")),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        LocalServer::new(session)
    }

    #[test]
    fn test_file_cells() {
        let code = "import os\n\n# %%\nx = 1\n#%% [markdown]\n# Notes\ny = 2\n# %%\n\n";
        let chunks = file_cells(code);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (0, "import os\n".to_string()));
        assert_eq!(chunks[1], (2, "# %%\nx = 1".to_string()));
        assert_eq!(chunks[2], (4, "#%% [markdown]\n# Notes\ny = 2".to_string()));
    }

    #[tokio::test]
    async fn test_run_file_collects_every_cell() {
        let server = server().await;
        let code = "x = 2\nx\n# %% [markdown]\n# Twice\nprint(x + x)";
        let cells = run_file(&server, code, "/tmp/a.py", &MercuryConfig::default())
            .await
            .unwrap();
        assert_eq!(cells.len(), 3);
        assert!(cells.iter().all(|c| c.state == CellState::Finished));
        assert_eq!(cells[0].data.outputs[0].text_plain(), Some("2"));
        assert_eq!(cells[1].data.cell_type, mercury_core::CellType::Markdown);
        assert_eq!(cells[2].line, 4);
        assert_eq!(cells[2].data.outputs[0].text_plain(), Some("4\n"));
    }

    #[tokio::test]
    async fn test_run_file_stops_after_error() {
        let server = server().await;
        let code = "print(missing)\n# %%\nprint(1)";
        let cells = run_file(&server, code, "/tmp/a.py", &MercuryConfig::default())
            .await
            .unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].state, CellState::Error);
    }

    #[test]
    fn test_read_source_missing_file() {
        let err = read_source("/definitely/missing.py").unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_read_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.py");
        std::fs::write(&file, "1 + 1\n").unwrap();

        let (path, code) = read_source(file.to_str().unwrap()).unwrap();
        assert!(path.ends_with("a.py"));
        assert_eq!(code, "1 + 1\n");
    }
}
