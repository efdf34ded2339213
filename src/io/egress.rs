//! Assignment egress - records successful dispatches to file
//!
//! Assignments are written in JSONL format (one JSON object per line)
//! to the file specified in config.

use crate::domain::error::StoreError;
use crate::domain::types::Assignment;
use crate::services::collaborators::AssignmentSink;
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// JSONL writer playing the order-persistence role
pub struct JsonlAssignmentSink {
    file_path: PathBuf,
}

impl JsonlAssignmentSink {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        info!(file_path = %file_path.display(), "egress_initialized");
        Self { file_path }
    }

    /// Append a line to the egress file
    fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %path.display(), bytes = %line.len(), "egress_written");

        Ok(())
    }
}

#[async_trait]
impl AssignmentSink for JsonlAssignmentSink {
    async fn record(&self, assignment: &Assignment) -> Result<(), StoreError> {
        let json = serde_json::to_string(assignment)
            .map_err(|e| StoreError::Unreachable(format!("serialize assignment: {e}")))?;
        let path = self.file_path.clone();

        let written = tokio::task::spawn_blocking(move || Self::append_line(&path, &json))
            .await
            .map_err(|e| StoreError::Unreachable(format!("egress task: {e}")))?;

        match written {
            Ok(()) => {
                info!(
                    dispatch_id = %assignment.dispatch_id,
                    order_id = %assignment.order_id,
                    technicians = assignment.technician_ids.len(),
                    "assignment_egressed"
                );
                Ok(())
            }
            Err(e) => {
                error!(dispatch_id = %assignment.dispatch_id, error = %e, "assignment_egress_failed");
                Err(StoreError::Unreachable(format!("{}: {e}", self.file_path.display())))
            }
        }
    }
}
