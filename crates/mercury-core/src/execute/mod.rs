//! Cell execution: splitting submissions into cells and folding kernel
//! output into cell snapshots.

mod cell;
mod engine;
mod split;

pub use cell::{Cell, CellData, CellOutput, CellState, CellType};
pub use engine::{CellStream, ExecutionEngine};
pub use split::{SplitCell, is_markdown_marker, split_cells};
