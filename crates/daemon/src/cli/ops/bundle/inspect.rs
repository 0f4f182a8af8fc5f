use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use clap::Args;
use comfy_table::Table;
use common::bundle::{Bundle, BundleEntry, BundleError};
use owo_colors::OwoColorize;

/// List the contents of a bundle
#[derive(Args, Debug, Clone)]
pub struct Inspect {
    pub file: PathBuf,
}

#[derive(Debug)]
pub struct InspectOutput {
    pub entry_point: Option<String>,
    pub entries: Vec<BundleEntry>,
}

impl fmt::Display for InspectOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry_point {
            Some(entry) => writeln!(f, "{} {}", "entry point:".dimmed(), entry.bold())?,
            None => writeln!(f, "{} {}", "entry point:".dimmed(), "missing".red())?,
        }
        let mut table = Table::new();
        table.set_header(vec!["TYPE", "NAME", "SIZE"]);
        for entry in &self.entries {
            let kind = if entry.is_dir { "dir" } else { "file" };
            table.add_row(vec![kind.to_string(), entry.name.clone(), entry.size.to_string()]);
        }
        write!(f, "{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid bundle: {0}")]
    Bundle(#[from] BundleError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Inspect {
    type Error = InspectError;
    type Output = InspectOutput;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let data = tokio::fs::read(&self.file)
            .await
            .map_err(|source| InspectError::Read {
                path: self.file.clone(),
                source,
            })?;
        let bundle = Bundle::from_bytes(Bytes::from(data))?;
        let entry_point = match bundle.entry_point() {
            Ok((name, _)) => Some(name),
            Err(BundleError::MissingMain) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(InspectOutput {
            entry_point,
            entries: bundle.entries()?,
        })
    }
}
