use clap::Args;

pub mod create;
pub mod ls;
pub mod put;

use crate::cli::op::Op;

crate::command_enum! {
    (Create, create::Create),
    (Put, put::Put),
    (Ls, ls::Ls),
}

pub type RepoCommand = Command;

/// Manage repositories holding bundles
#[derive(Args, Debug, Clone)]
pub struct Repo {
    #[command(subcommand)]
    pub command: RepoCommand,
}

#[async_trait::async_trait]
impl Op for Repo {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("failed to reach the bus: {0}")]
    Bus(#[from] common::bus::BusError),
    #[error(transparent)]
    Repository(#[from] object_store::RepositoryError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}
