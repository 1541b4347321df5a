//! Terminal rendering of cell snapshots.

use mercury_core::{Cell, CellOutput, CellState, CellType};

use crate::colors;

/// Print every cell of a finished run.
pub fn print_cells(cells: &[Cell]) {
    for cell in cells {
        print_cell(cell);
    }
}

fn print_cell(cell: &Cell) {
    if cell.data.cell_type == CellType::Markdown {
        for line in &cell.data.source {
            println!("{}{}{}", colors::DIM, line, colors::RESET);
        }
        return;
    }

    let (color, label) = match cell.state {
        CellState::Finished => (colors::GREEN, "ok"),
        CellState::Error => (colors::RED, "error"),
        CellState::Executing => (colors::YELLOW, "running"),
        CellState::Init => (colors::DIM, "pending"),
    };
    let count = cell
        .data
        .execution_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| " ".to_string());
    println!(
        "\n{}In [{}]{} {}line {}{} {}[{}]{}",
        colors::BOLD,
        count,
        colors::RESET,
        colors::DIM,
        cell.line + 1,
        colors::RESET,
        color,
        label,
        colors::RESET
    );

    for output in &cell.data.outputs {
        print_output(output);
    }
}

fn print_output(output: &CellOutput) {
    match output {
        CellOutput::Stream { name, text } => {
            let text = text.trim_end_matches('\n');
            if name == "stderr" {
                println!("{}{}{}", colors::YELLOW, text, colors::RESET);
            } else {
                println!("{}", text);
            }
        }
        CellOutput::ExecuteResult { .. } | CellOutput::DisplayData { .. } => {
            match output.text_plain() {
                Some(text) => println!("{}", text),
                None => println!("{}<rich output>{}", colors::DIM, colors::RESET),
            }
        }
        CellOutput::Error {
            ename,
            evalue,
            traceback,
        } => {
            if traceback.is_empty() {
                println!("{}{}: {}{}", colors::RED, ename, evalue, colors::RESET);
            } else {
                for line in traceback {
                    println!("{}", line);
                }
            }
        }
    }
}

/// Number of cells that ended in error.
pub fn failed_count(cells: &[Cell]) -> usize {
    cells.iter().filter(|c| c.state == CellState::Error).count()
}

/// Print a separator and the run summary.
pub fn print_summary(cells: &[Cell], seconds: f64) {
    let code = cells.iter().filter(|c| c.is_code()).count();
    let failed = failed_count(cells);
    println!("\n{}", "─".repeat(50));
    if failed == 0 {
        println!(
            "{}Completed{} {} cells in {:.2}s",
            colors::GREEN,
            colors::RESET,
            code,
            seconds
        );
    } else {
        println!(
            "{}Failed{} {} of {} cells in {:.2}s",
            colors::RED,
            colors::RESET,
            failed,
            code,
            seconds
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_count() {
        let mut ok = Cell::code("id", "a.py", 0, vec!["1".to_string()]);
        ok.advance(CellState::Finished);
        let mut bad = Cell::code("id", "a.py", 1, vec!["1/0".to_string()]);
        bad.advance(CellState::Error);
        let note = Cell::markdown("id", "a.py", 2, vec!["# notes".to_string()]);

        assert_eq!(failed_count(&[ok, bad, note]), 1);
    }
}
