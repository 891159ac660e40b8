use anyhow::Result;
use pipetree_core::{Simulation, SimulationConfig};
use tracing::{info, warn};

fn main() -> Result<()> {
    init_tracing();

    let config = SimulationConfig {
        rng_seed: seed_from_env(),
        ..SimulationConfig::default()
    };
    let mut sim = Simulation::new(config)?;
    let depth = sim.run();

    for line in sim.lines() {
        println!("{line}");
    }
    println!("\nFinal max generation: {depth}");

    if sim.was_capped() {
        warn!(
            events = sim.events().len(),
            "run hit the journal cap before converging"
        );
    }
    info!(
        processes = sim.process_count(),
        lovers = sim.lover_count(),
        depth = depth.0,
        "simulation finished",
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Optional reproducibility override, e.g. `PIPETREE_SEED=42 pipetree`.
fn seed_from_env() -> Option<u64> {
    std::env::var("PIPETREE_SEED")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
}
