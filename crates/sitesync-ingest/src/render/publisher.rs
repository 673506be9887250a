//! Render+publish collaborator.

use std::process::Stdio;

use async_trait::async_trait;
use sitesync_core::SiteAddr;
use tokio::process::Command;

use crate::watch::DEFAULT_REGISTRY_RELAYS;
use crate::{Error, Result};

/// What to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderScope {
    /// Every page of the site.
    Full,
    /// Only these paths.
    Paths(Vec<String>),
}

impl RenderScope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Paths(_) => "incremental",
        }
    }
}

/// Renders a site and uploads the result.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn render_and_publish(
        &self,
        site: &SiteAddr,
        scope: &RenderScope,
        domain: &str,
    ) -> Result<()>;
}

/// Runs an external command per render.
///
/// Invoked as `<program> <args...> <naddr> domain:<domain> [paths...]`, where
/// the site `naddr` carries `site_relays` as hints and paths look like
/// `/post/note1...`.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    program: String,
    args: Vec<String>,
    site_relays: Vec<String>,
}

impl Default for CommandPublisher {
    fn default() -> Self {
        Self::new("cli", vec!["release_website_zip".to_string()])
    }
}

impl CommandPublisher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            site_relays: DEFAULT_REGISTRY_RELAYS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Relay hints put into the site `naddr`.
    pub fn with_site_relays(mut self, relays: Vec<String>) -> Self {
        self.site_relays = relays;
        self
    }

    /// Full argument list for one render.
    pub fn command_args(
        &self,
        site: &SiteAddr,
        scope: &RenderScope,
        domain: &str,
    ) -> Result<Vec<String>> {
        let mut args = self.args.clone();
        args.push(site.to_naddr(&self.site_relays)?);
        args.push(format!("domain:{}", domain));
        if let RenderScope::Paths(paths) = scope {
            args.extend(paths.iter().cloned());
        }
        Ok(args)
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn render_and_publish(
        &self,
        site: &SiteAddr,
        scope: &RenderScope,
        domain: &str,
    ) -> Result<()> {
        let args = self.command_args(site, scope, domain)?;
        tracing::debug!(domain, program = %self.program, ?args, "Running publisher");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Render(format!("failed to spawn {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::Render(format!(
                "{} exited with {}: {}",
                self.program, output.status, tail
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pubkey;
    use nostr_sdk::nips::nip19::{FromBech32, Nip19Coordinate};
    use sitesync_core::ContentRef;

    #[test]
    fn test_command_args() {
        let publisher = CommandPublisher::default();
        let site = SiteAddr::site(pubkey(1), "blog");
        let note = ContentRef::Id("ab".repeat(32)).to_bech32().unwrap();
        let post = format!("/post/{}", note);
        let args = publisher
            .command_args(
                &site,
                &RenderScope::Paths(vec!["/".to_string(), post.clone()]),
                "blog.example.com",
            )
            .unwrap();

        assert_eq!(args.len(), 5);
        assert_eq!(args[0], "release_website_zip");
        assert_eq!(args[2], "domain:blog.example.com");
        assert_eq!(&args[3..], ["/".to_string(), post]);

        // The site goes out as an naddr with the registry relay as hint.
        let naddr = Nip19Coordinate::from_bech32(&args[1]).unwrap();
        assert_eq!(SiteAddr::from(&naddr.coordinate), site);
        assert_eq!(naddr.relays.len(), 1);
        assert_eq!(naddr.relays[0].as_str().trim_end_matches('/'), DEFAULT_REGISTRY_RELAYS[0]);

        let full = publisher.command_args(&site, &RenderScope::Full, "x").unwrap();
        assert_eq!(full.len(), 3);
    }

    #[test]
    fn test_bad_site_key_fails_render() {
        let publisher = CommandPublisher::default();
        let site = SiteAddr::site("not-a-key", "blog");
        assert!(publisher.command_args(&site, &RenderScope::Full, "x").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_maps_to_result() {
        let site = SiteAddr::site(pubkey(1), "blog");
        let ok = CommandPublisher::new("true", vec![]);
        assert!(ok.render_and_publish(&site, &RenderScope::Full, "d").await.is_ok());

        let failing = CommandPublisher::new("false", vec![]);
        let err = failing
            .render_and_publish(&site, &RenderScope::Full, "d")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Render(_)));

        let missing = CommandPublisher::new("/nonexistent/sitesync-render", vec![]);
        assert!(missing.render_and_publish(&site, &RenderScope::Full, "d").await.is_err());
    }
}
