//! End-of-run summary.

use std::fmt;

use serde::Serialize;

/// Counts reported when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub files_copied: usize,
    pub rows_edited: usize,
    /// Items whose identifier changed (identifier map size).
    pub items_remapped: usize,
    /// Identifier occurrences replaced across paths and columns.
    pub ids_remapped: usize,
    pub warnings: usize,
    pub fatal_failures: usize,
    pub cancelled: bool,
}

impl RunSummary {
    /// No fatal failure and not cancelled.
    pub fn is_success(&self) -> bool {
        self.fatal_failures == 0 && !self.cancelled
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Files copied:         {}", self.files_copied)?;
        writeln!(f, "Rows edited:          {}", self.rows_edited)?;
        writeln!(f, "Items remapped:       {}", self.items_remapped)?;
        writeln!(f, "Identifiers replaced: {}", self.ids_remapped)?;
        writeln!(f, "Warnings:             {}", self.warnings)?;
        write!(f, "Fatal job failures:   {}", self.fatal_failures)?;
        if self.cancelled {
            write!(f, "\nRun was cancelled before completion")?;
        }
        Ok(())
    }
}
