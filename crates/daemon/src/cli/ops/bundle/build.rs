use std::fmt;
use std::path::PathBuf;

use clap::Args;
use common::bundle::BundleError;
use owo_colors::OwoColorize;

/// Package a script directory into a bundle
#[derive(Args, Debug, Clone)]
pub struct Build {
    /// Directory holding `main.risor` and its modules
    pub src: PathBuf,

    /// Bundle to write; `.fzz` is appended when missing
    pub dst: PathBuf,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub path: PathBuf,
    pub size: u64,
}

impl fmt::Display for BuildOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} bundle {}",
            "Built".green().bold(),
            self.path.display().to_string().bold()
        )?;
        write!(f, "  {} {} bytes", "size:".dimmed(), self.size)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to build bundle: {0}")]
    Bundle(#[from] BundleError),
    #[error("failed to stat bundle: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Build {
    type Error = BuildError;
    type Output = BuildOutput;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (src, dst) = (self.src.clone(), self.dst.clone());
        let path = tokio::task::spawn_blocking(move || common::bundle::build(&src, &dst))
            .await
            .map_err(std::io::Error::other)??;
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(BuildOutput { path, size })
    }
}
