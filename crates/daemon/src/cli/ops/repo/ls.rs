use std::fmt;

use clap::Args;
use comfy_table::Table;
use common::bus::ObjectInfo;

use super::RepoError;

/// List the files in a repository
#[derive(Args, Debug, Clone)]
pub struct Ls {
    pub repository: String,
}

#[derive(Debug)]
pub struct LsOutput {
    pub files: Vec<ObjectInfo>,
}

impl fmt::Display for LsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.files.is_empty() {
            return write!(f, "No files found");
        }

        let mut table = Table::new();
        table.set_header(vec!["NAME", "SIZE", "MODIFIED"]);
        for file in &self.files {
            table.add_row(vec![
                file.name.clone(),
                file.size.to_string(),
                file.modified.to_rfc3339(),
            ]);
        }
        write!(f, "{table}")
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Ls {
    type Error = RepoError;
    type Output = LsOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let files = ctx
            .repositories()
            .await?
            .list_files(&self.repository)
            .await?;
        Ok(LsOutput { files })
    }
}
