use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use vessel_daemon::{SchedulerSummary, Vessel, VesselError};

/// Run the vessel until interrupted.
#[derive(Args, Debug, Clone)]
pub struct Daemon;

#[derive(Debug)]
pub enum DaemonOutput {
    /// The bus could not be reached; nothing ran.
    Unreachable,
    Stopped {
        service_name: String,
        summary: SchedulerSummary,
    },
}

impl fmt::Display for DaemonOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonOutput::Unreachable => Ok(()),
            DaemonOutput::Stopped {
                service_name,
                summary,
            } => {
                writeln!(f, "{} vessel {}", "Stopped".yellow().bold(), service_name.bold())?;
                writeln!(f, "  {} {}", "workers created:".dimmed(), summary.created)?;
                write!(f, "  {} {}", "workers stopped:".dimmed(), summary.stopped)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Vessel(#[from] VesselError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = DaemonError;
    type Output = DaemonOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        // an unreachable bus is not an error for a long-running agent
        let bus = match ctx.bus().await {
            Ok(bus) => bus,
            Err(e) => {
                tracing::debug!(error = %e, "bus unreachable, exiting");
                return Ok(DaemonOutput::Unreachable);
            }
        };

        let vessel = Vessel::new(bus, ctx.config.clone())?;
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupt received, shutting down");
                    interrupt.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "failed to listen for interrupts"),
            }
        });

        let summary = vessel.run(cancel).await?;
        Ok(DaemonOutput::Stopped {
            service_name: ctx.config.service_name.clone(),
            summary,
        })
    }
}
