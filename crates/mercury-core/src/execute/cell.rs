//! Cells and their outputs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::kernel::{IoPubMessage, MimeBundle};

/// Execution state of a cell. Forward-only: `Init → Executing → Finished | Error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellState {
    #[default]
    Init,
    Executing,
    Finished,
    Error,
}

impl CellState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CellState::Finished | CellState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
}

/// Cell output in nbformat v4 shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type")]
pub enum CellOutput {
    /// Standard output/error
    #[serde(rename = "stream")]
    Stream { name: String, text: String },

    #[serde(rename = "execute_result")]
    ExecuteResult {
        execution_count: Option<u32>,
        data: MimeBundle,
        metadata: Map<String, Value>,
    },

    /// Rich display data
    #[serde(rename = "display_data")]
    DisplayData {
        data: MimeBundle,
        metadata: Map<String, Value>,
    },

    #[serde(rename = "error")]
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl CellOutput {
    /// Error output for a failure outside the kernel's own error reporting.
    pub fn failure(ename: &str, evalue: impl Into<String>) -> Self {
        CellOutput::Error {
            ename: ename.to_string(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }

    /// `text/plain` payload, if any.
    pub fn text_plain(&self) -> Option<&str> {
        match self {
            CellOutput::ExecuteResult { data, .. } | CellOutput::DisplayData { data, .. } => {
                data.get("text/plain").and_then(Value::as_str)
            }
            CellOutput::Stream { text, .. } => Some(text),
            CellOutput::Error { .. } => None,
        }
    }
}

/// Notebook payload of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellData {
    pub cell_type: CellType,
    /// Lines without terminators.
    pub source: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<CellOutput>,
    #[serde(default)]
    pub execution_count: Option<u32>,
}

/// One unit of submitted code or markdown and its accumulated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Execution id the cell belongs to.
    pub id: String,
    pub file: String,
    pub line: u32,
    pub state: CellState,
    pub data: CellData,
}

impl Cell {
    pub fn code(id: &str, file: &str, line: u32, source: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            file: file.to_string(),
            line,
            state: CellState::Init,
            data: CellData {
                cell_type: CellType::Code,
                source,
                outputs: Vec::new(),
                execution_count: None,
            },
        }
    }

    /// Markdown cells are complete as soon as they are created.
    pub fn markdown(id: &str, file: &str, line: u32, source: Vec<String>) -> Self {
        let mut cell = Self::code(id, file, line, source);
        cell.state = CellState::Finished;
        cell.data.cell_type = CellType::Markdown;
        cell
    }

    pub fn is_code(&self) -> bool {
        self.data.cell_type == CellType::Code
    }

    /// Advance the state; never moves backwards or out of a terminal state.
    pub fn advance(&mut self, next: CellState) {
        let allowed = match self.state {
            CellState::Init => next != CellState::Init,
            CellState::Executing => next.is_terminal(),
            CellState::Finished | CellState::Error => false,
        };
        if allowed {
            self.state = next;
        }
    }

    /// Append an output, joining consecutive chunks of the same stream.
    pub fn push_output(&mut self, output: CellOutput) {
        if let CellOutput::Stream { name, text } = &output {
            if let Some(CellOutput::Stream {
                name: last_name,
                text: last_text,
            }) = self.data.outputs.last_mut()
            {
                if last_name == name {
                    last_text.push_str(text);
                    return;
                }
            }
        }
        self.data.outputs.push(output);
    }

    /// Fold an IOPub message into the cell.
    ///
    /// Returns whether the cell changed. `status` and unknown kinds are
    /// not recorded on the cell.
    pub fn apply(&mut self, message: IoPubMessage) -> bool {
        match message {
            IoPubMessage::ExecuteResult {
                execution_count,
                data,
                metadata,
            } => {
                self.push_output(CellOutput::ExecuteResult {
                    execution_count,
                    data,
                    metadata,
                });
                true
            }
            IoPubMessage::Stream { name, text } => {
                self.push_output(CellOutput::Stream { name, text });
                true
            }
            IoPubMessage::DisplayData { data, metadata } => {
                self.push_output(CellOutput::DisplayData { data, metadata });
                true
            }
            IoPubMessage::Error {
                ename,
                evalue,
                traceback,
            } => {
                self.push_output(CellOutput::Error {
                    ename,
                    evalue,
                    traceback,
                });
                true
            }
            IoPubMessage::ExecuteInput {
                execution_count, ..
            } => {
                if execution_count.is_some() {
                    self.data.execution_count = execution_count;
                }
                true
            }
            IoPubMessage::Status { .. } | IoPubMessage::Unknown { .. } => false,
        }
    }

    pub fn has_error_output(&self) -> bool {
        self.data
            .outputs
            .iter()
            .any(|o| matches!(o, CellOutput::Error { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_forward_only() {
        let mut cell = Cell::code("id", "f.py", 0, vec!["x".into()]);
        cell.advance(CellState::Executing);
        cell.advance(CellState::Init);
        assert_eq!(cell.state, CellState::Executing);
        cell.advance(CellState::Error);
        cell.advance(CellState::Finished);
        assert_eq!(cell.state, CellState::Error);
    }

    #[test]
    fn test_markdown_cell_is_complete() {
        let cell = Cell::markdown("id", "f.py", 3, vec!["# Title".into()]);
        assert_eq!(cell.state, CellState::Finished);
        assert_eq!(cell.data.cell_type, CellType::Markdown);
        assert_eq!(cell.data.source, vec!["# Title"]);
        assert_eq!(cell.line, 3);
    }

    #[test]
    fn test_stream_chunks_are_joined() {
        let mut cell = Cell::code("id", "f.py", 0, Vec::new());
        cell.apply(IoPubMessage::Stream { name: "stdout".into(), text: "a".into() });
        cell.apply(IoPubMessage::Stream { name: "stdout".into(), text: "b\n".into() });
        cell.apply(IoPubMessage::Stream { name: "stderr".into(), text: "warn".into() });
        cell.apply(IoPubMessage::Stream { name: "stdout".into(), text: "c".into() });

        let texts: Vec<_> = cell.data.outputs.iter().filter_map(|o| o.text_plain()).collect();
        assert_eq!(texts, vec!["ab\n", "warn", "c"]);
    }

    #[test]
    fn test_status_and_unknown_are_not_recorded() {
        let mut cell = Cell::code("id", "f.py", 0, Vec::new());
        assert!(!cell.apply(IoPubMessage::Status {
            execution_state: crate::kernel::ExecutionState::Busy
        }));
        assert!(!cell.apply(IoPubMessage::Unknown {
            msg_type: "clear_output".into(),
            content: Value::Null
        }));
        assert!(cell.data.outputs.is_empty());
    }

    #[test]
    fn test_output_serializes_as_nbformat() {
        let output = CellOutput::Stream { name: "stdout".into(), text: "hi".into() };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["output_type"], "stream");
        assert_eq!(json["text"], "hi");
    }
}
