use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use super::WorkerError;

/// Show where a worker can be reached
#[derive(Args, Debug, Clone)]
pub struct Get {
    pub id: u64,
}

#[derive(Debug)]
pub struct GetOutput {
    pub id: u64,
    pub service_name: String,
    pub service_id: String,
}

impl fmt::Display for GetOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", "Worker".bold(), self.id)?;
        writeln!(f, "  {} {}", "service:".dimmed(), self.service_name)?;
        write!(f, "  {} {}", "service id:".dimmed(), self.service_id)
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Get {
    type Error = WorkerError;
    type Output = GetOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let worker = ctx.client().await?.get_worker(self.id).await?;
        Ok(GetOutput {
            id: self.id,
            service_name: worker.service_name,
            service_id: worker.service_id,
        })
    }
}
