//! SpinProof Server
//!
//! Runs a demo session end to end: commit, reveal, spin, end, verify.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use spinproof::{
    proof::ClientCommitment,
    spin::{MemoryBalanceLedger, StripReelSet},
    EngineConfig, FairnessEngine, GameContext, PlayerId, SpinRequest, VERSION,
};

/// Spins played by the demo session.
const DEMO_SPINS: u64 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env();
    info!("SpinProof Server v{}", VERSION);
    info!(?config, "configuration loaded");

    demo_session(config).await
}

/// Play one provably-fair session and verify it.
async fn demo_session(config: EngineConfig) -> anyhow::Result<()> {
    info!("=== Starting Demo Session ===");

    let reels = Arc::new(StripReelSet::classic());
    let balances = Arc::new(MemoryBalanceLedger::new());
    let player = PlayerId::new(*uuid::Uuid::new_v4().as_bytes());
    balances.deposit(player, 1_000).await;

    let engine = FairnessEngine::from_config(config, reels.clone(), reels, balances)
        .await
        .context("failed to start engine")?;

    // Client commits before the server secret is known to it.
    let client = ClientCommitment::generate();
    let game = GameContext { game_mode: "classic".to_string(), bet: 10 };
    let created = engine.create_session(player, game, Some(client.commitment())).await?;
    info!("Session: {}", created.session_id);
    info!("Server secret hash: {}", hex::encode(created.server_secret_hash));
    info!("Client commitment: {}", hex::encode(client.commitment()));

    engine.reveal_client_secret(&created.session_id, client.secret()).await?;

    let mut total_win = 0u64;
    for i in 0..DEMO_SPINS {
        let result = engine
            .execute_spin(SpinRequest {
                session_id: created.session_id,
                seed: format!("demo-{}", i),
                expected_index: Some(created.start_sequence + i),
            })
            .await
            .with_context(|| format!("spin {} failed", i))?;
        total_win += result.win_amount;
        info!(
            "Spin {:>3}: positions {:?} win {:>4} balance {:>5} hash {}",
            result.index,
            result.positions,
            result.win_amount,
            result.balance,
            hex::encode(&result.record_hash[..8])
        );
    }

    let ended = engine.end_session(&created.session_id).await?;
    info!("=== Session Ended ===");
    info!("Revealed server secret: {}", hex::encode(ended.server_secret));
    info!("Spins: {}  total win: {}", ended.spin_count, total_win);
    info!("Final hash: {}", hex::encode(ended.final_hash));

    let verdict = engine.verify_session(&created.session_id).await?;
    let transcript = engine.export_transcript(&created.session_id).await?;
    info!("Transcript size: {} bytes", transcript.to_json()?.len());

    if verdict.valid {
        info!("Verification: PASSED ({} records)", verdict.records.len());
        Ok(())
    } else {
        anyhow::bail!("verification failed at index {:?}", verdict.first_invalid())
    }
}
