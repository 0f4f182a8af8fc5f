use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use clap::Args;
use owo_colors::OwoColorize;

use super::RepoError;

/// Upload a local file into a repository
#[derive(Args, Debug, Clone)]
pub struct Put {
    pub repository: String,

    /// Local file to upload
    pub file: PathBuf,

    /// Destination path (defaults to `/<file name>`)
    #[arg(long)]
    pub path: Option<String>,
}

#[derive(Debug)]
pub struct PutOutput {
    pub repository: String,
    pub path: String,
    pub size: u64,
}

impl fmt::Display for PutOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}{}",
            "Uploaded".green().bold(),
            self.repository.bold(),
            self.path
        )?;
        write!(f, "  {} {} bytes", "size:".dimmed(), self.size)
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Put {
    type Error = RepoError;
    type Output = PutOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let data = tokio::fs::read(&self.file)
            .await
            .map_err(|source| RepoError::Read {
                path: self.file.clone(),
                source,
            })?;
        let path = match &self.path {
            Some(path) => path.clone(),
            None => {
                let name = self
                    .file
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("/{name}")
            }
        };
        let info = ctx
            .repositories()
            .await?
            .put_file(&self.repository, &path, Bytes::from(data))
            .await?;
        Ok(PutOutput {
            repository: self.repository.clone(),
            path,
            size: info.size,
        })
    }
}
