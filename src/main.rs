use simulation::{simulate, simulate_scaling, SimulationConfig};
use tracing_subscriber::EnvFilter;
pub mod simulation;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())?;
    Ok(())
}

async fn async_main() -> rnse_session::Result<()> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            SCENE SYNC SIMULATIONS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Few participants, rounds after every few edits
    let stats = simulate(&SimulationConfig {
        seed: Some(1),
        ..Default::default()
    })
    .await?;
    stats.print();

    // More participants, more edits in flight per round
    let stats = simulate(&SimulationConfig {
        participants: 8,
        children: 16,
        edits: 1000,
        settle_every: 8,
        seed: None,
    })
    .await?;
    stats.print();

    simulate_scaling(12, 3).await?;

    println!("\n✓ All simulations completed");
    Ok(())
}
