use std::fmt;
use std::sync::Arc;

use common::bus::{Bus, BusError};
use object_store::RepositoryClient;
use vessel_daemon::{VesselClient, VesselConfig};

/// A CLI command. Outputs are printed through their `Display` impl.
#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Output: fmt::Display + Send;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct OpContext {
    pub config: VesselConfig,
}

impl OpContext {
    pub fn new(config: VesselConfig) -> Self {
        Self { config }
    }

    pub async fn bus(&self) -> Result<Arc<dyn Bus>, BusError> {
        self.config.connect().await
    }

    /// Client for the vessel named in the config.
    pub async fn client(&self) -> Result<VesselClient, BusError> {
        Ok(VesselClient::new(
            self.bus().await?,
            self.config.service_name.clone(),
        ))
    }

    pub async fn repositories(&self) -> Result<RepositoryClient, BusError> {
        Ok(RepositoryClient::new(self.bus().await?))
    }
}

/// Declare a `Command` subcommand enum over op types, together with the
/// matching `OpOutput` and `OpError` enums and an [`Op`] impl that
/// dispatches to the selected variant.
#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $op:ty)),+ $(,)?) => {
        #[derive(clap::Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($op)),+
        }

        pub enum OpOutput {
            $($variant(<$op as $crate::cli::op::Op>::Output)),+
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(OpOutput::$variant(output) => write!(f, "{output}")),+
                }
            }
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$op as $crate::cli::op::Op>::Error)
            ),+
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Error = OpError;
            type Output = OpOutput;

            async fn execute(
                &self,
                ctx: &$crate::cli::op::OpContext,
            ) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => op
                            .execute(ctx)
                            .await
                            .map(OpOutput::$variant)
                            .map_err(OpError::$variant),
                    )+
                }
            }
        }
    };
}
