use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use super::WorkerError;

/// Stop a worker
#[derive(Args, Debug, Clone)]
pub struct Destroy {
    pub id: u64,
}

#[derive(Debug)]
pub struct DestroyOutput {
    pub id: u64,
}

impl fmt::Display for DestroyOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} worker {}", "Destroyed".green().bold(), self.id)
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Destroy {
    type Error = WorkerError;
    type Output = DestroyOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        ctx.client().await?.destroy_worker(self.id).await?;
        Ok(DestroyOutput { id: self.id })
    }
}
