use std::fmt;
use std::time::Duration;

use clap::Args;
use owo_colors::OwoColorize;

use super::WorkerError;

/// Start a new worker
#[derive(Args, Debug, Clone)]
pub struct Create {
    /// Return as soon as the worker is accepted, without waiting for it to
    /// register on the bus
    #[arg(long)]
    pub no_wait: bool,
}

#[derive(Debug)]
pub struct CreateOutput {
    pub id: u64,
    pub service_id: Option<String>,
}

impl fmt::Display for CreateOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} worker {}",
            "Created".green().bold(),
            self.id.to_string().bold()
        )?;
        if let Some(service_id) = &self.service_id {
            write!(f, "\n  {} {}", "service id:".dimmed(), service_id)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Create {
    type Error = WorkerError;
    type Output = CreateOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        let id = client.create_worker().await?;
        if self.no_wait {
            return Ok(CreateOutput {
                id,
                service_id: None,
            });
        }
        let timeout = Duration::from_secs(ctx.config.request_timeout_secs);
        let worker = client.wait_worker(id, timeout).await?;
        Ok(CreateOutput {
            id,
            service_id: Some(worker.service_id),
        })
    }
}
