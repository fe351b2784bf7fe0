use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialStore, MemoryCredentialStore, Token, PAT_KEY};
use crate::config::{Config, DEFAULT_API_VERSION};
use crate::providers::azure::{AzureProvider, DashboardParams, SystemClock};

#[derive(Parser)]
#[command(name = "pipelens")]
#[command(author, version, about = "Azure DevOps pipeline insights", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output file path (defaults to stdout)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Pretty print JSON output
    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,

    #[command(flatten)]
    connection: ConnectionArgs,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Organisation URL, e.g. https://dev.azure.com/contoso
    #[arg(long, global = true, env = "AZURE_DEVOPS_URL")]
    org_url: Option<String>,

    /// Personal access token
    #[arg(short, long, global = true, env = "AZURE_DEVOPS_PAT", hide_env_values = true)]
    token: Option<String>,

    /// Project used when no project filter is given
    #[arg(short = 'P', long, global = true, env = "AZURE_DEVOPS_PROJECT")]
    project: Option<String>,

    #[arg(long, global = true, default_value = DEFAULT_API_VERSION)]
    api_version: String,

    #[arg(long, global = true, default_value_t = 500)]
    max_pipelines: u32,

    #[arg(long, global = true, default_value_t = 100)]
    max_runs: u32,

    /// Cache time-to-live in minutes
    #[arg(long, global = true, default_value_t = 15)]
    cache_minutes: i64,

    #[arg(long, global = true, default_value_t = 30)]
    timeout_secs: u64,

    #[arg(long, global = true, default_value_t = 2)]
    max_retries: u32,

    /// Maximum requests in flight per batch
    #[arg(long, global = true, default_value_t = 10)]
    concurrency: usize,
}

#[derive(Args, Clone)]
struct FilterArgs {
    /// Project to analyse (overrides the default project)
    #[arg(long)]
    project_name: Option<String>,

    /// Look-back window in days
    #[arg(short, long)]
    days: Option<u32>,

    /// Case-insensitive regex on pipeline names ("all" disables)
    #[arg(long)]
    pipeline_filter: Option<String>,

    /// Case-insensitive regex on stage names ("all" disables)
    #[arg(long)]
    stage_filter: Option<String>,

    /// One of tests, build, deploy, security, other ("all" disables)
    #[arg(long)]
    stage_type: Option<String>,
}

impl From<FilterArgs> for DashboardParams {
    fn from(args: FilterArgs) -> Self {
        Self {
            project_name: args.project_name,
            days: args.days,
            pipeline_filter: args.pipeline_filter,
            stage_filter: args.stage_filter,
            stage_type_filter: args.stage_type,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate run statistics into a dashboard report
    Dashboard {
        #[command(flatten)]
        filters: FilterArgs,

        /// Clear the cache before aggregating
        #[arg(long, default_value_t = false)]
        fresh: bool,
    },
    /// Export every run as CSV
    Export {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// List projects visible to the token
    Projects,
    /// Repeat the dashboard aggregation on an interval
    Watch {
        #[command(flatten)]
        filters: FilterArgs,

        #[arg(long, default_value_t = 60)]
        interval_secs: u64,

        #[arg(long, default_value_t = 2)]
        iterations: u32,
    },
}

impl Cli {
    pub async fn execute(&self) -> Result<()> {
        let provider = self.provider()?;

        match &self.command {
            Commands::Dashboard { filters, fresh } => {
                if *fresh {
                    let cleared = provider.clear_cache();
                    info!("{}", cleared.message);
                }

                let response = provider
                    .get_dashboard_data(&filters.clone().into())
                    .await;
                self.emit(&self.to_json(&response)?)
            }
            Commands::Export { filters } => {
                let csv = provider.export_csv(&filters.clone().into()).await?;
                self.emit(&csv)
            }
            Commands::Projects => {
                let Some(projects) = provider.list_projects().await else {
                    bail!("Could not load projects");
                };
                self.emit(&self.to_json(&projects)?)
            }
            Commands::Watch {
                filters,
                interval_secs,
                iterations,
            } => {
                let params: DashboardParams = filters.clone().into();
                let mut outputs = Vec::new();

                for iteration in 1..=*iterations {
                    if iteration > 1 {
                        tokio::time::sleep(Duration::from_secs(*interval_secs)).await;
                    }

                    let response = provider.get_dashboard_data(&params).await;
                    info!(
                        "Iteration {iteration}/{iterations}: success={}, fromCache={}",
                        response.success, response.from_cache
                    );
                    outputs.push(self.to_json(&response)?);
                }

                self.emit(&outputs.join("\n"))
            }
        }
    }

    fn provider(&self) -> Result<AzureProvider> {
        let args = &self.connection;
        let Some(org_url) = args.org_url.as_deref() else {
            bail!("Missing organisation URL (--org-url or AZURE_DEVOPS_URL)");
        };

        let mut config = Config::new(org_url, args.project.clone().unwrap_or_default())?;
        config.api_version.clone_from(&args.api_version);
        config.max_pipelines = args.max_pipelines;
        config.max_runs = args.max_runs;
        config.cache_duration_minutes = args.cache_minutes;
        config.request_timeout = Duration::from_secs(args.timeout_secs);
        config.max_retries = args.max_retries;
        config.concurrency = args.concurrency;

        let credentials = Arc::new(MemoryCredentialStore::new());
        if let Some(token) = args.token.as_deref() {
            credentials.set(PAT_KEY, Token::from(token));
        }

        info!("Using organisation {}", config.root_str());
        Ok(AzureProvider::new(
            config,
            credentials,
            Arc::new(SystemClock),
        )?)
    }

    fn to_json<T: Serialize>(&self, value: &T) -> Result<String> {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(json)
    }

    fn emit(&self, content: &str) -> Result<()> {
        if let Some(output_path) = &self.output {
            std::fs::write(output_path, content)?;
            info!("Output written to: {}", output_path.display());
        } else {
            println!("{content}");
        }
        Ok(())
    }
}
