//! Opening login and key-generation pages in the user's browser.

use anyhow::{Context, bail};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Best-effort browser launch
#[async_trait]
pub trait UrlOpener: Send + Sync {
    async fn open_url(&self, url: &str) -> anyhow::Result<()>;
}

/// Opens URLs with the operating system's default handler
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUrlOpener;

impl SystemUrlOpener {
    fn command(url: &str) -> Command {
        let (program, args) = launcher(std::env::consts::OS, url);
        let mut command = Command::new(program);
        command.args(args);
        command
    }
}

/// Program and arguments that open `url` on `os`. The URL is always a
/// single argument and never passes through a shell.
fn launcher<'a>(os: &str, url: &'a str) -> (&'static str, Vec<&'a str>) {
    match os {
        "macos" => ("open", vec![url]),
        "windows" => ("rundll32", vec!["url.dll,FileProtocolHandler", url]),
        _ => ("xdg-open", vec![url]),
    }
}

#[async_trait]
impl UrlOpener for SystemUrlOpener {
    async fn open_url(&self, url: &str) -> anyhow::Result<()> {
        let status = Self::command(url)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .context("Failed to launch browser")?;

        if !status.success() {
            bail!("Browser launcher exited with {}", status);
        }
        debug!(url = %url, "Opened URL");
        Ok(())
    }
}

/// Tries the host's opener first and falls back to the system opener
pub struct FallbackUrlOpener {
    primary: Arc<dyn UrlOpener>,
    fallback: Arc<dyn UrlOpener>,
}

impl FallbackUrlOpener {
    pub fn new(primary: Arc<dyn UrlOpener>) -> Self {
        Self::with_fallback(primary, Arc::new(SystemUrlOpener))
    }

    pub fn with_fallback(primary: Arc<dyn UrlOpener>, fallback: Arc<dyn UrlOpener>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl UrlOpener for FallbackUrlOpener {
    async fn open_url(&self, url: &str) -> anyhow::Result<()> {
        match self.primary.open_url(url).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(url = %url, error = %e, "Host could not open URL, using system opener");
                self.fallback.open_url(url).await
            }
        }
    }
}
