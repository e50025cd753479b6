use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Token;
use crate::config::Config;
use crate::monitor::{BuildEvent, BuildProgressMonitor, StopReason, TrackingOptions};
use crate::output::{self, BuildProgressView};
use crate::providers::TeamCityClient;
use crate::queue::{BuildQueueOrchestrator, BuildRequest, QueuedBuild};
use crate::resilience::{CircuitBreakerManager, CircuitState};

#[derive(Parser)]
#[command(name = "buildpilot")]
#[command(author, version, about = "Queue TeamCity builds and follow them to completion", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./buildpilot.{toml,json,yaml})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// TeamCity server URL
    #[arg(short, long, global = true, env = "TEAMCITY_URL")]
    url: Option<String>,

    /// TeamCity access token
    #[arg(short, long, global = true, env = "TEAMCITY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print results as JSON instead of tables
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Add builds to the queue
    Queue {
        /// Build configuration ids; several are submitted concurrently
        #[arg(required = true)]
        build_types: Vec<String>,

        #[arg(short, long)]
        branch: Option<String>,

        /// Build parameter as NAME=VALUE, repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Snapshot dependency on an existing build id, repeatable
        #[arg(long)]
        depends_on: Vec<String>,

        #[arg(long, default_value_t = false)]
        personal: bool,

        #[arg(long, default_value_t = false)]
        move_to_top: bool,

        #[arg(long)]
        comment: Option<String>,

        /// Follow the queued build until it finishes
        #[arg(short, long, default_value_t = false)]
        watch: bool,

        #[command(flatten)]
        tracking: TrackingArgs,
    },

    /// Show where builds sit in the queue
    Position {
        #[arg(required = true)]
        build_ids: Vec<String>,
    },

    /// Move a queued build to the head of the queue
    MoveToTop { build_id: String },

    /// Put builds at the head of the queue in the given order
    Reorder {
        #[arg(required = true)]
        build_ids: Vec<String>,
    },

    /// Remove a build from the queue
    Cancel {
        build_id: String,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Show capacity limits of a build configuration
    Limits { build_type: String },

    /// Follow a build until it finishes
    Watch {
        build_id: String,

        #[command(flatten)]
        tracking: TrackingArgs,
    },
}

/// Overrides of the `[monitor]` configuration section.
#[derive(Args, Clone, Default)]
struct TrackingArgs {
    /// Seconds between polls
    #[arg(long)]
    interval: Option<u64>,

    /// Seconds without progress before the build is reported stalled
    #[arg(long)]
    stall_threshold: Option<u64>,

    /// Stop watching after this many seconds
    #[arg(long)]
    max_duration: Option<u64>,

    /// Include test counts in progress updates
    #[arg(long, default_value_t = false)]
    tests: bool,

    /// Include build problems in progress updates
    #[arg(long, default_value_t = false)]
    problems: bool,
}

impl TrackingArgs {
    fn apply(&self, mut options: TrackingOptions) -> TrackingOptions {
        if let Some(interval) = self.interval {
            options.polling_interval = Duration::from_secs(interval.max(1));
        }
        if let Some(threshold) = self.stall_threshold {
            options.stall_threshold = Duration::from_secs(threshold);
        }
        if let Some(max) = self.max_duration {
            options.max_duration = Some(Duration::from_secs(max));
        }
        options.include_tests |= self.tests;
        options.include_problems |= self.problems;
        options
    }
}

fn parse_param(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{value}'")),
    }
}

impl Cli {
    fn client(&self, config: &Config) -> Result<Arc<TeamCityClient>> {
        let url = self
            .url
            .clone()
            .or_else(|| config.server.url.clone())
            .context("No TeamCity URL given: pass --url, set TEAMCITY_URL or add `url` under [server] in the config file")?;
        let token = self
            .token
            .as_deref()
            .or(config.server.token.as_deref())
            .map(Token::from);

        info!("Using TeamCity server at {url}");
        Ok(Arc::new(TeamCityClient::with_timeout(
            &url,
            token,
            config.server.request_timeout(),
        )?))
    }

    fn print<T: serde::Serialize>(&self, value: &T, table: impl FnOnce() -> comfy_table::Table) -> Result<()> {
        if self.json {
            output::print_json(value, self.pretty)
        } else {
            println!("{}", table());
            Ok(())
        }
    }

    pub async fn execute(&self) -> Result<()> {
        let config = Config::load(self.config.as_deref())?;
        let client = self.client(&config)?;
        let orchestrator = BuildQueueOrchestrator::new(
            client.clone(),
            client.clone(),
            Arc::new(CircuitBreakerManager::new(config.circuit_breaker.breaker_config())),
            config.retry.policy(),
        )
        .with_config(config.queue.orchestrator_config());

        let result = self.run(&config, &client, &orchestrator).await;

        if result.is_err() {
            let stats = orchestrator.breakers().stats();
            if stats.iter().any(|s| s.state != CircuitState::Closed) {
                eprintln!("{}", output::circuit_stats_table(&stats));
            }
        }
        result
    }

    async fn run(
        &self,
        config: &Config,
        client: &Arc<TeamCityClient>,
        orchestrator: &BuildQueueOrchestrator,
    ) -> Result<()> {
        match &self.command {
            Commands::Queue {
                build_types,
                branch,
                params,
                depends_on,
                personal,
                move_to_top,
                comment,
                watch,
                tracking,
            } => {
                let requests: Vec<BuildRequest> = build_types
                    .iter()
                    .map(|build_type| {
                        let mut request = BuildRequest::new(build_type.as_str());
                        request.branch_name = branch.clone();
                        request.parameters = params.iter().cloned().collect();
                        request.personal = *personal;
                        request.move_to_top = *move_to_top;
                        request.comment = comment.clone();
                        for build_id in depends_on {
                            request = request.depends_on(build_id.as_str());
                        }
                        request
                    })
                    .collect();

                let queued = self.queue(orchestrator, &requests).await?;
                self.print(&queued, || output::queued_builds_table(&queued))?;

                if *watch {
                    match queued.as_slice() {
                        [build] => {
                            let options = tracking.apply(config.monitor.tracking_options());
                            self.watch(client.clone(), &build.build_id, options).await?;
                        }
                        _ => warn!("--watch follows a single build, skipping"),
                    }
                }
                Ok(())
            }
            Commands::Position { build_ids } => {
                let mut positions = Vec::with_capacity(build_ids.len());
                for build_id in build_ids {
                    positions.push(orchestrator.get_queue_position(build_id).await?);
                }
                self.print(&positions, || output::positions_table(&positions))
            }
            Commands::MoveToTop { build_id } => {
                let position = orchestrator.move_to_top(build_id).await?;
                self.print(&position, || output::positions_table(std::slice::from_ref(&position)))
            }
            Commands::Reorder { build_ids } => {
                let positions = orchestrator.reorder_queue(build_ids).await?;
                self.print(&positions, || output::positions_table(&positions))
            }
            Commands::Cancel { build_id, comment } => {
                orchestrator
                    .cancel_queued_build(build_id, comment.as_deref())
                    .await?;
                eprintln!("{} {build_id}", output::bright_green("Canceled queued build"));
                Ok(())
            }
            Commands::Limits { build_type } => {
                let limitations = orchestrator.get_queue_limitations(build_type).await;
                self.print(&limitations, || output::limitations_table(&limitations))
            }
            Commands::Watch { build_id, tracking } => {
                let options = tracking.apply(config.monitor.tracking_options());
                self.watch(client.clone(), build_id, options).await
            }
        }
    }

    async fn queue(
        &self,
        orchestrator: &BuildQueueOrchestrator,
        requests: &[BuildRequest],
    ) -> Result<Vec<QueuedBuild>> {
        if let [request] = requests {
            return Ok(vec![orchestrator.queue_build(request).await?]);
        }

        let queued = orchestrator.queue_builds(requests).await;
        if queued.is_empty() {
            bail!("None of the {} builds could be queued", requests.len());
        }
        if queued.len() < requests.len() {
            warn!(
                "Queued {} of {} builds, see the log for failures",
                queued.len(),
                requests.len()
            );
        }
        Ok(queued)
    }

    async fn watch(&self, client: Arc<TeamCityClient>, build_id: &str, options: TrackingOptions) -> Result<()> {
        let monitor = BuildProgressMonitor::new(client);
        let mut events = monitor.track_build_progress(build_id, options);
        let view = (!self.json).then(|| BuildProgressView::new(build_id));
        let mut last = None;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match &view {
                        Some(view) => {
                            view.handle(&event);
                        }
                        None => output::print_json(&event, self.pretty)?,
                    }
                    if event.is_terminal() {
                        last = Some(event);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    monitor.stop_tracking(build_id);
                }
            }
        }

        match last {
            Some(BuildEvent::Completed { .. }) => Ok(()),
            Some(BuildEvent::Stopped {
                reason: StopReason::Manual,
                ..
            }) => Ok(()),
            Some(BuildEvent::Failed { .. }) => bail!("Build {build_id} failed"),
            Some(BuildEvent::Canceled { .. }) => bail!("Build {build_id} was canceled"),
            Some(BuildEvent::Stopped { reason, .. }) => {
                bail!("Stopped watching build {build_id}: {reason:?}")
            }
            _ => bail!("Tracking of build {build_id} ended unexpectedly"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("env.JAVA_HOME=/opt/jdk=17"),
            Ok(("env.JAVA_HOME".to_string(), "/opt/jdk=17".to_string()))
        );
        assert!(parse_param("missing-separator").is_err());
        assert!(parse_param("=value").is_err());
    }

    #[test]
    fn test_queue_command_parses() {
        let cli = Cli::try_parse_from([
            "buildpilot",
            "--url",
            "https://ci.example.com",
            "queue",
            "App_Build",
            "--branch",
            "main",
            "--param",
            "env.MODE=release",
            "--depends-on",
            "101",
            "--move-to-top",
        ])
        .unwrap();

        match cli.command {
            Commands::Queue {
                build_types,
                branch,
                params,
                depends_on,
                move_to_top,
                watch,
                ..
            } => {
                assert_eq!(build_types, vec!["App_Build"]);
                assert_eq!(branch.as_deref(), Some("main"));
                assert_eq!(params, vec![("env.MODE".to_string(), "release".to_string())]);
                assert_eq!(depends_on, vec!["101"]);
                assert!(move_to_top);
                assert!(!watch);
            }
            _ => panic!("expected queue command"),
        }
    }

    #[test]
    fn test_tracking_args_override_config() {
        let args = TrackingArgs {
            interval: Some(2),
            max_duration: Some(600),
            tests: true,
            ..TrackingArgs::default()
        };

        let options = args.apply(TrackingOptions::default());
        assert_eq!(options.polling_interval, Duration::from_secs(2));
        assert_eq!(options.max_duration, Some(Duration::from_secs(600)));
        assert_eq!(options.stall_threshold, TrackingOptions::default().stall_threshold);
        assert!(options.include_tests);
    }

    #[test]
    fn test_reorder_requires_ids() {
        assert!(Cli::try_parse_from(["buildpilot", "reorder"]).is_err());
    }
}
