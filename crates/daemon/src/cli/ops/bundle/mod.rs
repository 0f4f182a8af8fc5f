use clap::Args;

pub mod build;
pub mod inspect;

use crate::cli::op::Op;

crate::command_enum! {
    (Build, build::Build),
    (Inspect, inspect::Inspect),
}

pub type BundleCommand = Command;

/// Package and examine script bundles
#[derive(Args, Debug, Clone)]
pub struct Bundle {
    #[command(subcommand)]
    pub command: BundleCommand,
}

#[async_trait::async_trait]
impl Op for Bundle {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}
