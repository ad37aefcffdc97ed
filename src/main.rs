use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autoapply::answers::{AnswerGenerator, ChainAnswerer, LlmAnswerer, ProfileAnswerer};
use autoapply::anthropic::AnthropicClient;
use autoapply::breaker::CircuitBreakerRegistry;
use autoapply::cli::{Cli, Command};
use autoapply::config::AppConfig;
use autoapply::error::AppError;
use autoapply::executor::AttemptExecutor;
use autoapply::limiter::RateLimiterRegistry;
use autoapply::logging;
use autoapply::orchestrator::CampaignRunner;
use autoapply::platform::PlatformId;
use autoapply::pool::SessionPool;
use autoapply::provider::{RemoteBrowserProvider, SessionProvider};
use autoapply::recorder::JsonlRecorder;
use autoapply::router::PlatformRouter;
use autoapply::state_machine::{CandidateProfile, Job};
use autoapply::ui::{self, CampaignProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(n) = cli.max_concurrency {
        config.max_concurrency = n;
    }
    if let Some(n) = cli.max_total {
        config.max_total_applications = n;
    }
    if cli.auto_submit {
        config.auto_submit = true;
    }
    config.validate()?;

    match cli.command {
        Command::Run { jobs, profile } => run(config, &jobs, &profile).await,
        Command::Classify { url } => {
            classify(&url);
            Ok(())
        }
        Command::Status {
            platform,
            window_mins,
        } => status(&config, platform, window_mins).await,
    }
}

async fn run(config: AppConfig, jobs_path: &Path, profile_path: &Path) -> Result<()> {
    let jobs = load_jobs(jobs_path)?;
    let profile = load_profile(profile_path)?;

    let pool = Arc::new(SessionPool::new(build_providers(&config)?, config.pool()));
    let shutdown = CancellationToken::new();
    let reaper = pool.spawn_reaper(shutdown.clone());

    let recorder = Arc::new(JsonlRecorder::new(&config.outcome_log, &config.evidence_dir));
    let executor = AttemptExecutor::new(
        build_answers(&config, &profile)?,
        recorder.clone(),
        config.auto_submit,
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let runner = CampaignRunner::new(
        Arc::new(PlatformRouter::new()),
        pool.clone(),
        Arc::new(RateLimiterRegistry::new(config.rate_limits()?)),
        Arc::new(CircuitBreakerRegistry::new(config.breaker())),
        Arc::new(executor),
        recorder,
        config.campaign(),
    )
    .with_events(tx);

    let control = runner.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            control.abort();
        }
    });

    info!(
        jobs = jobs.len(),
        auto_submit = config.auto_submit,
        log = %config.outcome_log.display(),
        "starting campaign"
    );
    let progress = tokio::spawn(CampaignProgress::new().follow(rx));
    let summary = runner.run(jobs, profile).await;
    drop(runner);
    if let Err(e) = progress.await {
        warn!(error = %e, "progress display stopped");
    }

    shutdown.cancel();
    if let Err(e) = reaper.await {
        warn!(error = %e, "session reaper stopped");
    }
    pool.shutdown().await;

    ui::print_summary(&summary);
    Ok(())
}

fn classify(url: &str) {
    let router = PlatformRouter::new();
    let platform = router.classify(url);
    let route = router.resolve_strategy(platform);
    println!("platform   {platform}");
    println!("category   {}", route.category);
    println!("strategy   {}", route.strategy.name());
    println!("timeout    {}s", route.timeout.as_secs());
    println!("max steps  {}", route.max_steps);
}

async fn status(config: &AppConfig, platform: Option<PlatformId>, window_mins: u64) -> Result<()> {
    let recorder = JsonlRecorder::new(&config.outcome_log, &config.evidence_dir);
    let platforms = match platform {
        Some(p) => vec![p],
        None => PlatformId::ALL.to_vec(),
    };
    let rows = ui::collect_status(
        &recorder,
        config.breaker(),
        &platforms,
        Duration::from_secs(window_mins * 60),
    )
    .await?;
    if rows.is_empty() {
        println!(
            "no outcomes in the last {window_mins} minutes ({})",
            config.outcome_log.display()
        );
    } else {
        ui::print_status(&rows);
    }
    Ok(())
}

fn load_jobs(path: &Path) -> Result<Vec<Job>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let jobs: Vec<Job> = serde_json::from_str(&contents)
        .map_err(AppError::from)
        .with_context(|| format!("parsing {}", path.display()))?;
    if jobs.is_empty() {
        return Err(AppError::NoJobs(path.display().to_string()).into());
    }
    Ok(jobs)
}

fn load_profile(path: &Path) -> Result<CandidateProfile> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let profile = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&contents).map_err(AppError::from)?
    } else {
        serde_json::from_str(&contents).map_err(AppError::from)?
    };
    Ok(profile)
}

fn build_providers(config: &AppConfig) -> Result<Vec<Arc<dyn SessionProvider>>> {
    let p = &config.providers;
    let mut providers: Vec<Arc<dyn SessionProvider>> = Vec::new();
    if let Some(url) = &p.cloud_url {
        providers.push(Arc::new(RemoteBrowserProvider::new(
            "cloud",
            url.clone(),
            p.cloud_api_key.clone(),
            p.cloud_max_sessions,
        )?));
    }
    if let Some(url) = &p.local_url {
        providers.push(Arc::new(RemoteBrowserProvider::new(
            "local",
            url.clone(),
            None,
            p.local_max_sessions,
        )?));
    }
    Ok(providers)
}

fn build_answers(config: &AppConfig, profile: &CandidateProfile) -> Result<Arc<dyn AnswerGenerator>> {
    let mut chain: Vec<Arc<dyn AnswerGenerator>> = vec![Arc::new(ProfileAnswerer::new(profile))];
    if config.answers.use_llm {
        if config.api_key.is_empty() {
            warn!("no ANTHROPIC_API_KEY, questions without a profile answer go to review");
        } else {
            let client = AnthropicClient::new(config.api_key.clone())?;
            chain.push(Arc::new(LlmAnswerer::new(client, config.answers.model.clone())));
        }
    }
    Ok(Arc::new(ChainAnswerer::new(chain)))
}
