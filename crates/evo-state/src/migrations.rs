//! SurrealDB schema migrations and initialization
//!
//! Sets up every table with the indexes the repository contracts rely on.
//! Uniqueness that the engine depends on for correctness is enforced by
//! `UNIQUE` indexes so that two engine instances cannot race past it.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Evo tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Evo SurrealDB schema");

    init_campaigns_table(db).await?;
    init_rounds_table(db).await?;
    init_variants_table(db).await?;
    init_evaluations_table(db).await?;
    init_policies_table(db).await?;
    init_decisions_table(db).await?;

    info!("Evo schema initialization complete");
    Ok(())
}

/// `campaigns`: soft-deleted via `deleted_at`, never removed.
async fn init_campaigns_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing campaigns table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS campaigns AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_campaign_id ON TABLE campaigns COLUMNS campaign_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_campaign_status ON TABLE campaigns COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_campaign_created_at ON TABLE campaigns COLUMNS created_at;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `rounds`: `(campaign_id, round_number)` is unique, which is the persisted
/// half of the single-active-round rule.
async fn init_rounds_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing rounds table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS rounds AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_round_id ON TABLE rounds COLUMNS round_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_round_campaign_number ON TABLE rounds COLUMNS campaign_id, round_number UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_round_status ON TABLE rounds COLUMNS round_id, status;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `variants`: `(round_id, content_fingerprint)` unique for deduplication,
/// `(round_id, parent_id)` and `parent_id` for lineage walks.
async fn init_variants_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing variants table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS variants AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_variant_id ON TABLE variants COLUMNS variant_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_variant_round_fingerprint ON TABLE variants COLUMNS round_id, content_fingerprint UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_variant_round_parent ON TABLE variants COLUMNS round_id, parent_id;
        DEFINE INDEX IF NOT EXISTS idx_variant_parent ON TABLE variants COLUMNS parent_id;
        DEFINE INDEX IF NOT EXISTS idx_variant_campaign ON TABLE variants COLUMNS campaign_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `evaluations`: one row per `(variant_id, evaluator_kind)`.
async fn init_evaluations_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing evaluations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS evaluations AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_evaluation_id ON TABLE evaluations COLUMNS evaluation_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_evaluation_pair ON TABLE evaluations COLUMNS variant_id, evaluator_kind UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_evaluation_round ON TABLE evaluations COLUMNS round_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `policies`: append-only versions; `(campaign_id, name, version)` unique.
async fn init_policies_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing policies table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS policies AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_policy_id ON TABLE policies COLUMNS policy_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_policy_version ON TABLE policies COLUMNS campaign_id, name, version UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `decisions`: append-only, no updates or deletes.
async fn init_decisions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing decisions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS decisions AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_decision_id ON TABLE decisions COLUMNS decision_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_decision_trace ON TABLE decisions COLUMNS trace_id, created_at, seq;
        DEFINE INDEX IF NOT EXISTS idx_decision_round ON TABLE decisions COLUMNS round_id, created_at, seq;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}
