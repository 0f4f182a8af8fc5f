use std::fmt;
use std::io::Write;

use clap::Args;
use owo_colors::OwoColorize;

use super::WorkerError;

/// Run a bundle on a worker, streaming its stdout
#[derive(Args, Debug, Clone)]
pub struct Exec {
    /// Worker id
    pub id: u64,

    /// Repository holding the bundle
    pub repository: String,

    /// Path of the bundle inside the repository
    pub file_path: String,

    /// Text sent to the script's stdin before it runs
    #[arg(long)]
    pub stdin: Option<String>,
}

#[derive(Debug)]
pub struct ExecOutput {
    pub code: i64,
}

impl fmt::Display for ExecOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == 0 {
            write!(f, "{} {}", "exit code:".dimmed(), self.code.green())
        } else {
            write!(f, "{} {}", "exit code:".dimmed(), self.code.red())
        }
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Exec {
    type Error = WorkerError;
    type Output = ExecOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let client = ctx.client().await?;
        let mut stdout = client.subscribe_stdout(self.id).await?;
        let printer = tokio::spawn(async move {
            while let Some(message) = stdout.next().await {
                let mut out = std::io::stdout().lock();
                if out.write_all(&message.payload).and_then(|_| out.flush()).is_err() {
                    break;
                }
            }
        });

        if let Some(input) = &self.stdin {
            client
                .write_stdin(self.id, bytes::Bytes::from(input.clone()))
                .await?;
        }
        let result = client
            .execute(self.id, &self.repository, &self.file_path)
            .await;
        // output published before the reply may still be in flight
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        printer.abort();
        Ok(ExecOutput { code: result? })
    }
}
