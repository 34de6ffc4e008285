//! Evo CLI
//!
//! Operator commands over the campaign engine:
//! - create, start, pause, resume and delete campaigns
//! - execute single rounds or whole campaigns
//! - inspect stats, lineage and the decision log
//! - run a self-contained demo on in-memory storage

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

use evo_core::capabilities::{demo, http::HttpCapabilities};
use evo_core::{
    load_campaign_config, CampaignService, Capabilities, EngineConfig, Orchestrator, RoundDetail,
    RunControl, VariantQuery,
};
use evo_state::{
    CampaignConfig, CampaignFilter, CampaignId, CampaignRecord, DecisionLog, DecisionRecord,
    EvaluationRecord, EvaluatorSpec, MemoryRepository, Repository, RoundId, RoundResult, RoundStore,
    SelectionConfig, SelectionStrategy, SurrealRepository, TraceId, VariantId, VariantRecord,
    VariantStore,
};

#[derive(Parser)]
#[command(name = "evo")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evo evolutionary campaign engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Use a throwaway in-process store instead of SurrealDB
    #[arg(long, global = true)]
    memory: bool,

    /// Base URL of an external capability service
    #[arg(long, global = true, env = "EVO_CAPABILITY_URL")]
    capability_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage campaigns
    Campaign {
        #[command(subcommand)]
        action: CampaignAction,
    },

    /// Execute rounds
    Round {
        #[command(subcommand)]
        action: RoundAction,
    },

    /// Aggregate counts for a campaign
    Stats {
        /// Campaign id
        campaign: CampaignId,
    },

    /// Show the ancestry of a variant, founder first
    Lineage {
        /// Variant id
        variant: VariantId,
    },

    /// List every descendant of a variant
    Descendants {
        /// Variant id
        variant: VariantId,
    },

    /// List the evaluations recorded for a variant
    Evaluations {
        /// Variant id
        variant: VariantId,
    },

    /// Describe how two variants are related
    Compare {
        a: VariantId,
        b: VariantId,
    },

    /// Read the decision log
    Decisions {
        /// Decisions recorded under one trace
        #[arg(long, conflicts_with = "round", required_unless_present = "round")]
        trace: Option<TraceId>,

        /// Decisions recorded for one round
        #[arg(long)]
        round: Option<RoundId>,
    },

    /// Run a complete campaign with demo capabilities on in-memory storage
    Demo {
        /// Number of rounds
        #[arg(long, default_value = "3")]
        rounds: u32,

        /// Variants per round
        #[arg(long, default_value = "6")]
        variants: usize,
    },
}

#[derive(Subcommand)]
enum CampaignAction {
    /// Create a draft campaign from a TOML config file
    Create {
        #[arg(long)]
        name: String,

        /// Path to the campaign config (TOML)
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        description: Option<String>,
    },
    /// Activate a draft campaign
    Start { id: CampaignId },
    /// Pause an active campaign
    Pause { id: CampaignId },
    /// Resume a paused campaign
    Resume { id: CampaignId },
    /// Show one campaign
    Show { id: CampaignId },
    /// Soft-delete a campaign
    Delete { id: CampaignId },
    /// List campaigns, newest first
    List {
        /// Include deleted campaigns
        #[arg(long)]
        all: bool,
    },
    /// Execute every remaining round
    Run { id: CampaignId },
}

#[derive(Subcommand)]
enum RoundAction {
    /// Execute one round
    Execute {
        campaign: CampaignId,
        /// Round number (0-based)
        number: u32,
    },
    /// Show one round with its policy and stats
    Show { campaign: CampaignId, number: u32 },
    /// List the variants of a round
    Variants {
        /// Round id
        round: RoundId,

        /// Only variants selected as parents
        #[arg(long)]
        selected_only: bool,

        /// Only variants of this generation
        #[arg(long)]
        generation: Option<u32>,
    },
}

/// Everything a command needs: storage, engine and output mode.
struct Ctx {
    repo: Arc<dyn Repository>,
    campaigns: CampaignService,
    orchestrator: Orchestrator,
    json: bool,
}

impl Ctx {
    fn new(
        repo: Arc<dyn Repository>,
        capabilities: Capabilities,
        engine: EngineConfig,
        json: bool,
    ) -> Self {
        Self {
            campaigns: CampaignService::new(repo.clone()),
            orchestrator: Orchestrator::new(repo.clone(), capabilities, engine),
            repo,
            json,
        }
    }

    /// Print `value` as pretty JSON in `--json` mode, otherwise run `text`.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text(value);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    evo_core::init_tracing(cli.json, level);

    let engine = EngineConfig::from_env().context("Invalid EVO_* engine configuration")?;

    if let Commands::Demo { rounds, variants } = cli.command {
        let ctx = Ctx::new(
            Arc::new(MemoryRepository::new()),
            demo::capabilities(),
            EngineConfig::fast(),
            cli.json,
        );
        return cmd_demo(&ctx, rounds, variants).await;
    }

    let capabilities = capabilities(cli.capability_url.as_deref(), &engine)?;
    let repo = open_repository(cli.memory).await?;
    let ctx = Ctx::new(repo, capabilities, engine, cli.json);

    match cli.command {
        Commands::Campaign { action } => match action {
            CampaignAction::Create {
                name,
                config,
                description,
            } => cmd_campaign_create(&ctx, &name, &config, description).await,
            CampaignAction::Start { id } => cmd_campaign_transition(&ctx, &id, "start").await,
            CampaignAction::Pause { id } => cmd_campaign_transition(&ctx, &id, "pause").await,
            CampaignAction::Resume { id } => cmd_campaign_transition(&ctx, &id, "resume").await,
            CampaignAction::Show { id } => cmd_campaign_show(&ctx, &id).await,
            CampaignAction::Delete { id } => cmd_campaign_delete(&ctx, &id).await,
            CampaignAction::List { all } => cmd_campaign_list(&ctx, all).await,
            CampaignAction::Run { id } => cmd_campaign_run(&ctx, &id).await,
        },
        Commands::Round { action } => match action {
            RoundAction::Execute { campaign, number } => {
                cmd_round_execute(&ctx, &campaign, number).await
            }
            RoundAction::Show { campaign, number } => {
                cmd_round_show(&ctx, &campaign, number).await
            }
            RoundAction::Variants {
                round,
                selected_only,
                generation,
            } => {
                let query = VariantQuery {
                    selected_only,
                    generation,
                };
                cmd_round_variants(&ctx, &round, query).await
            }
        },
        Commands::Stats { campaign } => cmd_stats(&ctx, &campaign).await,
        Commands::Lineage { variant } => cmd_lineage(&ctx, &variant).await,
        Commands::Descendants { variant } => cmd_descendants(&ctx, &variant).await,
        Commands::Evaluations { variant } => cmd_evaluations(&ctx, &variant).await,
        Commands::Compare { a, b } => cmd_compare(&ctx, &a, &b).await,
        Commands::Decisions { trace, round } => cmd_decisions(&ctx, trace, round).await,
        // Handled before storage is opened.
        Commands::Demo { .. } => Ok(()),
    }
}

/// HTTP capabilities when a service URL is configured, demo ones otherwise.
fn capabilities(url: Option<&str>, engine: &EngineConfig) -> Result<Capabilities> {
    match url {
        Some(url) => {
            let client = HttpCapabilities::new(url, engine.call_timeout)
                .map_err(|e| anyhow!("{e}"))
                .context("Failed to build capability client")?;
            info!(url, "using HTTP capabilities");
            Ok(client.into_capabilities())
        }
        None => Ok(demo::capabilities()),
    }
}

async fn open_repository(memory: bool) -> Result<Arc<dyn Repository>> {
    if memory {
        return Ok(Arc::new(MemoryRepository::new()));
    }
    let repo = SurrealRepository::from_env()
        .await
        .context("Failed to connect to Evo database")?;
    Ok(Arc::new(repo))
}

/// Create a draft campaign
async fn cmd_campaign_create(
    ctx: &Ctx,
    name: &str,
    config: &Path,
    description: Option<String>,
) -> Result<()> {
    let config = load_campaign_config(config)
        .with_context(|| format!("Failed to load campaign config {}", config.display()))?;
    let campaign = ctx
        .campaigns
        .create(name, description, config)
        .await
        .context("Failed to create campaign")?;
    ctx.emit(&campaign, |c| {
        println!("Created campaign '{}' ({})", c.name, c.id);
        println!("Run 'evo campaign start {}' to activate it.", c.id);
    })
}

async fn cmd_campaign_transition(ctx: &Ctx, id: &CampaignId, action: &str) -> Result<()> {
    let campaign = match action {
        "start" => ctx.campaigns.start(id).await,
        "pause" => ctx.campaigns.pause(id).await,
        "resume" => ctx.campaigns.resume(id).await,
        other => return Err(anyhow!("unknown campaign action '{other}'")),
    }
    .with_context(|| format!("Failed to {action} campaign {id}"))?;
    ctx.emit(&campaign, |c| println!("Campaign {} is {}", c.id, c.status))
}

async fn cmd_campaign_show(ctx: &Ctx, id: &CampaignId) -> Result<()> {
    let campaign = ctx.campaigns.get(id).await?;
    let rounds = ctx.repo.list_rounds(id).await?;
    let view = serde_json::json!({ "campaign": campaign, "rounds": rounds });
    ctx.emit(&view, |_| {
        print_campaign(&campaign);
        for round in &rounds {
            println!(
                "  round {:>3}  {:<10} {}",
                round.round_number,
                round.status.as_str(),
                round
                    .failure
                    .as_ref()
                    .map(|f| format!("{} failed: {}", f.stage, f.message))
                    .unwrap_or_default()
            );
        }
    })
}

async fn cmd_campaign_delete(ctx: &Ctx, id: &CampaignId) -> Result<()> {
    ctx.campaigns
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete campaign {id}"))?;
    ctx.emit(&serde_json::json!({ "deleted": id }), |_| {
        println!("Deleted campaign {id}")
    })
}

async fn cmd_campaign_list(ctx: &Ctx, all: bool) -> Result<()> {
    let campaigns = ctx
        .campaigns
        .list(CampaignFilter {
            status: None,
            include_deleted: all,
        })
        .await?;
    ctx.emit(&campaigns, |list| {
        if list.is_empty() {
            println!("No campaigns found. Run 'evo campaign create' first.");
            return;
        }
        for c in list {
            let deleted = if c.deleted_at.is_some() { " (deleted)" } else { "" };
            println!("{}  {:<10} {}{}", c.id, c.status.as_str(), c.name, deleted);
        }
    })
}

async fn cmd_campaign_run(ctx: &Ctx, id: &CampaignId) -> Result<()> {
    let results = ctx
        .orchestrator
        .execute_campaign(id, RunControl::default())
        .await
        .with_context(|| format!("Campaign {id} did not finish"))?;
    ctx.emit(&results, |results| {
        for r in results {
            print_round_result(r);
        }
        println!("{} round(s) executed", results.len());
    })
}

async fn cmd_round_execute(ctx: &Ctx, campaign: &CampaignId, number: u32) -> Result<()> {
    let result = ctx
        .orchestrator
        .execute_round(campaign, number, RunControl::default())
        .await
        .with_context(|| format!("Round {number} of campaign {campaign} failed"))?;
    ctx.emit(&result, print_round_result)
}

async fn cmd_round_show(ctx: &Ctx, campaign: &CampaignId, number: u32) -> Result<()> {
    let detail = ctx
        .campaigns
        .round_detail(campaign, number)
        .await
        .with_context(|| format!("Failed to load round {number} of campaign {campaign}"))?;
    ctx.emit(&detail, print_round_detail)
}

async fn cmd_round_variants(ctx: &Ctx, round: &RoundId, query: VariantQuery) -> Result<()> {
    let variants = ctx.campaigns.round_variants(round, query).await?;
    ctx.emit(&variants, |list| {
        if list.is_empty() {
            println!("No matching variants in round {round}");
        }
        for v in list {
            print_variant(v);
        }
    })
}

async fn cmd_evaluations(ctx: &Ctx, variant: &VariantId) -> Result<()> {
    let evaluations = ctx.campaigns.variant_evaluations(variant).await?;
    ctx.emit(&evaluations, |list| {
        if list.is_empty() {
            println!("No evaluations recorded for {variant}");
        }
        for e in list {
            print_evaluation(e);
        }
    })
}

async fn cmd_stats(ctx: &Ctx, campaign: &CampaignId) -> Result<()> {
    let stats = ctx.campaigns.stats(campaign).await?;
    ctx.emit(&stats, |s| {
        println!("campaign        {}", s.campaign_id);
        println!("status          {}", s.status);
        println!("rounds          {}/{}", s.completed_rounds, s.total_rounds);
        println!("variants        {}", s.total_variants);
        println!("selected        {}", s.total_selected);
        println!("max generation  {}", s.max_generation);
        println!("selection rate  {:.3}", s.selection_rate);
        if let Some(best) = s.best_fitness {
            println!("best fitness    {best:.4}");
        }
    })
}

async fn cmd_lineage(ctx: &Ctx, variant: &VariantId) -> Result<()> {
    let view = ctx
        .orchestrator
        .lineage()
        .lineage_view(variant)
        .await
        .with_context(|| format!("Failed to walk lineage of {variant}"))?;
    ctx.emit(&view, |v| {
        println!(
            "{} generation(s), founder {}",
            v.generation_count, v.founder_id
        );
        for node in &v.ancestry {
            print_variant(node);
        }
    })
}

async fn cmd_descendants(ctx: &Ctx, variant: &VariantId) -> Result<()> {
    let descendants = ctx.orchestrator.lineage().get_descendants(variant).await?;
    ctx.emit(&descendants, |list| {
        if list.is_empty() {
            println!("No descendants of {variant}");
        }
        for node in list {
            print_variant(node);
        }
    })
}

async fn cmd_compare(ctx: &Ctx, a: &VariantId, b: &VariantId) -> Result<()> {
    let relation = ctx.orchestrator.lineage().compare(a, b).await?;
    ctx.emit(&relation, |r| {
        println!("{a} vs {b}: {:?}", r.kind);
        if let Some(common) = r.common_ancestor {
            println!("common ancestor  {common}");
        }
        if let Some(distance) = r.generation_distance {
            println!("distance         {distance}");
        }
    })
}

async fn cmd_decisions(ctx: &Ctx, trace: Option<TraceId>, round: Option<RoundId>) -> Result<()> {
    let decisions = match (trace, round) {
        (Some(trace), _) => ctx.repo.decisions_by_trace(&trace).await?,
        (None, Some(round)) => ctx.repo.decisions_by_round(&round).await?,
        (None, None) => return Err(anyhow!("pass --trace or --round")),
    };
    ctx.emit(&decisions, |list| {
        if list.is_empty() {
            println!("No decisions recorded");
        }
        for d in list {
            print_decision(d);
        }
    })
}

/// Demo campaign: deterministic capabilities, no external services.
fn demo_config(rounds: u32, variants: usize) -> CampaignConfig {
    CampaignConfig {
        max_rounds: rounds,
        variants_per_round: variants,
        evaluators: vec![
            EvaluatorSpec::new("quality"),
            EvaluatorSpec::new("brevity").with_weight(0.5),
        ],
        selection: SelectionConfig::with_strategy(
            SelectionStrategy::Tournament,
            (variants / 2).max(1),
        ),
        seed: Some(42),
        initial_population: vec![
            "fn fib(n: u64) -> u64 { if n < 2 { n } else { fib(n - 1) + fib(n - 2) } }".into(),
        ],
        mutation_hint: Some("make it faster".into()),
    }
}

async fn cmd_demo(ctx: &Ctx, rounds: u32, variants: usize) -> Result<()> {
    let campaign = ctx
        .campaigns
        .create(
            "demo",
            Some("self-contained demo campaign".into()),
            demo_config(rounds, variants),
        )
        .await
        .context("Failed to create demo campaign")?;
    ctx.campaigns.start(&campaign.id).await?;

    let results = ctx
        .orchestrator
        .execute_campaign(&campaign.id, RunControl::default())
        .await
        .context("Demo campaign failed")?;
    let stats = ctx.campaigns.stats(&campaign.id).await?;

    let best = best_variant(ctx.repo.as_ref(), results.last()).await?;
    let lineage = match &best {
        Some(v) => Some(ctx.orchestrator.lineage().lineage_view(&v.id).await?),
        None => None,
    };

    let summary = serde_json::json!({
        "campaign": campaign.id,
        "rounds": results,
        "stats": stats,
        "best_lineage": lineage,
    });
    ctx.emit(&summary, |_| {
        for r in &results {
            print_round_result(r);
        }
        println!();
        println!(
            "{} variants across {} rounds, {} selected",
            stats.total_variants, stats.completed_rounds, stats.total_selected
        );
        if let Some(view) = &lineage {
            println!("lineage of the top survivor:");
            for node in &view.ancestry {
                print_variant(node);
            }
        }
    })
}

/// First selected variant of the last round, in rank order.
async fn best_variant(
    repo: &dyn Repository,
    last: Option<&RoundResult>,
) -> Result<Option<VariantRecord>> {
    let Some(id) = last.and_then(|r| r.selected_ids.first()) else {
        return Ok(None);
    };
    Ok(Some(repo.get_variant(id).await?))
}

fn print_campaign(c: &CampaignRecord) {
    println!("campaign {}", c.id);
    println!("Name:    {}", c.name);
    println!("Status:  {}", c.status);
    println!(
        "Created: {}",
        c.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(desc) = &c.description {
        println!();
        println!("    {desc}");
    }
    println!();
    println!(
        "{} round(s) max, {} variant(s) per round, {} selection k={}",
        c.config.max_rounds,
        c.config.variants_per_round,
        c.config.selection.strategy,
        c.config.selection.k
    );
}

fn print_round_result(r: &RoundResult) {
    println!(
        "round {:>3}  population {:>3}  evaluated {:>3}  selected {:>2}  best {}  trace {}",
        r.round_number,
        r.population,
        r.evaluated,
        r.selected_ids.len(),
        r.best_fitness
            .map(|f| format!("{f:.4}"))
            .unwrap_or_else(|| "-".into()),
        r.trace_id
    );
    for warning in &r.warnings {
        println!("    warning: {warning}");
    }
}

fn print_round_detail(d: &RoundDetail) {
    let r = &d.round;
    println!("round {} of campaign {}", r.round_number, r.campaign_id);
    println!("id          {}", r.id);
    println!("status      {}", r.status.as_str());
    println!("trace       {}", r.trace_id);
    if let Some(policy) = &d.policy {
        println!(
            "policy      v{} {} k={}",
            policy.version, policy.config.strategy, policy.config.k
        );
    }
    let s = &d.stats;
    println!(
        "variants    {} ({} evaluated, {} selected)",
        s.population, s.evaluated, s.selected
    );
    println!(
        "evaluations {} completed, {} failed, {} open",
        s.evaluations_completed, s.evaluations_failed, s.evaluations_open
    );
    if let (Some(best), Some(mean)) = (s.best_fitness, s.mean_fitness) {
        println!("fitness     best {best:.4}  mean {mean:.4}");
    }
    if let Some(f) = &r.failure {
        println!("failed in {}: {}", f.stage, f.message);
    }
}

fn print_evaluation(e: &EvaluationRecord) {
    let outcome = match (e.score, &e.error) {
        (Some(score), _) => format!("{score:.4}"),
        (None, Some(error)) => format!("error: {}", truncate(error, 50)),
        (None, None) => "-".into(),
    };
    let fallback = e
        .fallback_from
        .as_ref()
        .map(|p| format!(" (fallback for {p})"))
        .unwrap_or_default();
    println!(
        "{:<12} {:<10} {}{}",
        e.evaluator_kind,
        e.status.as_str(),
        outcome,
        fallback
    );
}

fn print_variant(v: &VariantRecord) {
    let marker = if v.selected { "*" } else { " " };
    println!(
        "{marker} gen {:>2}  {}  {}",
        v.generation,
        v.id,
        truncate(&v.content, 60)
    );
}

fn print_decision(d: &DecisionRecord) {
    println!(
        "#{:<4} {:<11} conf {:.2}  {}",
        d.seq, d.stage, d.confidence, d.rationale
    );
    if d.output.is_none() {
        println!("      (no output)");
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max_len {
        flat
    } else {
        let cut: String = flat.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
