use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use super::RepoError;

/// Create a repository
#[derive(Args, Debug, Clone)]
pub struct Create {
    pub name: String,
}

#[derive(Debug)]
pub struct CreateOutput {
    pub name: String,
}

impl fmt::Display for CreateOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} repository {}", "Created".green().bold(), self.name.bold())
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Create {
    type Error = RepoError;
    type Output = CreateOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        ctx.repositories()
            .await?
            .create_repository(&self.name)
            .await?;
        Ok(CreateOutput {
            name: self.name.clone(),
        })
    }
}
