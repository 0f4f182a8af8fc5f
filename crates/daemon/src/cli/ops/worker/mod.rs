use clap::Args;

pub mod create;
pub mod destroy;
pub mod exec;
pub mod get;

use crate::cli::op::Op;

crate::command_enum! {
    (Create, create::Create),
    (Get, get::Get),
    (Destroy, destroy::Destroy),
    (Exec, exec::Exec),
}

pub type WorkerCommand = Command;

/// Manage workers on a running vessel
#[derive(Args, Debug, Clone)]
pub struct Worker {
    #[command(subcommand)]
    pub command: WorkerCommand,
}

#[async_trait::async_trait]
impl Op for Worker {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to reach the bus: {0}")]
    Bus(#[from] common::bus::BusError),
    #[error(transparent)]
    Client(#[from] vessel_daemon::ClientError),
}
