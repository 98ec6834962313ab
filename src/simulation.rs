use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rnse_core::{Attributes, LockState, NodeFlags, NodeId, NodeKind};
use rnse_session::{MemoryAuthority, Result, Session};
use rnse_sync::{DeleteOutcome, LocalAdapter, MemoryScene, SyncConfig, TickReport};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Peer = Session<MemoryAuthority>;

/// The shared group is the first node the authority ever creates.
const GROUP: NodeId = NodeId(1);
const TEXTURES: [&str; 3] = ["brick.png", "stone.png", "wood.png"];
const MAX_ROUNDS: usize = 64;

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub participants: usize,
    /// Meshes in the shared group before editing starts.
    pub children: usize,
    pub edits: usize,
    /// Edits between two tick rounds. Larger values mean more concurrent
    /// edits per round.
    pub settle_every: usize,
    /// Fixed seed for reproducible runs; entropy otherwise.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            participants: 3,
            children: 8,
            edits: 200,
            settle_every: 4,
            seed: None,
        }
    }
}

/// Statistics collected during a simulation run
#[derive(Clone, Debug, Default)]
pub struct SimulationStats {
    pub participants: usize,
    pub edits: usize,
    pub rejected_edits: usize,
    pub ticks: usize,
    pub events_applied: usize,
    pub authority_ops: usize,
    pub local_moves: usize,
    pub duplicates_resolved: usize,
    pub forced_passes: usize,
    pub converged: bool,
    pub total_time: Duration,
    pub ticks_per_second: f64,
}

impl SimulationStats {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.events_applied += report.events_applied;
        self.authority_ops += report.authority_ops;
        self.local_moves += report.local_moves;
        self.duplicates_resolved += report.duplicates_resolved;
        self.forced_passes += report.forced_passes;
    }

    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Participants:              {:>30} ║", self.participants);
        println!("║  Edits Accepted:            {:>30} ║", self.edits);
        println!("║  Edits Rejected:            {:>30} ║", self.rejected_edits);
        println!("║  Ticks:                     {:>30} ║", self.ticks);
        println!("║  Authority Events Applied:  {:>30} ║", self.events_applied);
        println!("║  Authority Operations:      {:>30} ║", self.authority_ops);
        println!("║  Local Moves:               {:>30} ║", self.local_moves);
        println!("║  Duplicates Resolved:       {:>30} ║", self.duplicates_resolved);
        println!("║  Forced Passes:             {:>30} ║", self.forced_passes);
        println!("║  Converged:                 {:>30} ║", self.converged);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Ticks/Second:              {:>30.0} ║", self.ticks_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

#[derive(Clone, Copy, Debug)]
enum Edit {
    Reorder { from: usize, to: usize },
    Rename { pick: usize, suffix: u32 },
    ToggleLock { pick: usize },
    Create { index: usize },
    Delete { pick: usize },
    Texture { path: &'static str },
}

/// Generator that yields (participant, edit) pairs
fn edit_stream(participants: usize, edits: usize, seed: Option<u64>) -> impl Stream<Item = (usize, Edit)> {
    stream! {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        for _ in 0..edits {
            let who = rng.gen_range(0..participants);
            let edit = match rng.gen_range(0..100) {
                0..=44 => Edit::Reorder { from: rng.gen(), to: rng.gen() },
                45..=59 => Edit::Rename { pick: rng.gen(), suffix: rng.gen() },
                60..=71 => Edit::ToggleLock { pick: rng.gen() },
                72..=83 => Edit::Create { index: rng.gen() },
                84..=93 => Edit::Delete { pick: rng.gen() },
                _ => Edit::Texture { path: TEXTURES[rng.gen_range(0..TEXTURES.len())] },
            };
            yield (who, edit);
        }
    }
}

/// Apply one edit to a participant's scene and engine. Returns false if
/// the edit was refused.
fn apply_edit(peer: &Peer, edit: Edit) -> bool {
    peer.edit(|engine, scene| {
        let Some(group) = engine.handle_of(GROUP) else {
            return false;
        };
        let children = scene.order(Some(group));
        let pick = |n: usize| {
            if children.is_empty() {
                None
            } else {
                Some(children[n % children.len()])
            }
        };

        match edit {
            Edit::Reorder { from, to } => {
                let Some(child) = pick(from) else {
                    return false;
                };
                scene.move_local_child(child, to % children.len());
                engine.mark_local_change(group);
                true
            }
            Edit::Rename { pick: n, suffix } => {
                let Some(child) = pick(n) else {
                    return false;
                };
                let Some(mut attrs) = engine.get(child).map(|node| node.attributes.clone()) else {
                    return false;
                };
                attrs.insert("name".into(), format!("mesh-{}", suffix).into());
                scene.set_attributes(child, attrs.clone());
                engine.set_attributes(child, attrs, scene).is_ok()
            }
            Edit::ToggleLock { pick: n } => {
                let target = if n % 4 == 0 { Some(group) } else { pick(n) };
                let Some(target) = target else {
                    return false;
                };
                match engine.lock_state(target) {
                    Some(LockState::LockedByLocal) => engine.release_lock(target).is_ok(),
                    Some(_) => engine.request_lock(target).is_ok(),
                    None => false,
                }
            }
            Edit::Create { index } => {
                let index = index % (children.len() + 1);
                let created = engine.create_local(
                    NodeKind::new("mesh"),
                    Attributes::new(),
                    Some(group),
                    index,
                    NodeFlags::default(),
                );
                match created {
                    Ok(mesh) => {
                        scene.insert(mesh, Some(group), index);
                        true
                    }
                    Err(_) => false,
                }
            }
            Edit::Delete { pick: n } => {
                let Some(child) = pick(n) else {
                    return false;
                };
                if !engine.get(child).is_some_and(|node| node.lifecycle.is_live()) {
                    return false;
                }
                scene.remove(child);
                !matches!(
                    engine.request_delete(child, scene),
                    Ok(DeleteOutcome::Recreated) | Err(_)
                )
            }
            Edit::Texture { path } => {
                let mut attrs = Attributes::new();
                attrs.insert("path".into(), path.into());
                let index = scene.order(None).len();
                match engine.create_local(NodeKind::new("texture"), attrs, None, index, NodeFlags::default()) {
                    Ok(texture) => {
                        scene.insert(texture, None, index);
                        true
                    }
                    Err(_) => false,
                }
            }
        }
    })
}

/// Tick every busy participant once. Returns true if nobody was busy.
async fn round(peers: &[Peer], stats: &mut SimulationStats) -> Result<bool> {
    let mut idle = true;
    for peer in peers {
        if !peer.is_idle()? {
            idle = false;
            let report = peer.tick().await?;
            stats.record(&report);
        }
    }
    Ok(idle)
}

async fn settle_all(peers: &[Peer], stats: &mut SimulationStats) -> Result<bool> {
    for _ in 0..MAX_ROUNDS {
        if round(peers, stats).await? {
            return Ok(true);
        }
        tokio::task::yield_now().await;
    }
    Ok(false)
}

fn confirmed_order(peer: &Peer, parent: Option<NodeId>) -> Vec<NodeId> {
    peer.read(|engine, scene| {
        let local = match parent {
            None => None,
            Some(id) => match engine.handle_of(id) {
                Some(h) => Some(h),
                None => return Vec::new(),
            },
        };
        scene
            .order(local)
            .into_iter()
            .filter_map(|h| engine.get(h).and_then(|n| n.id))
            .collect()
    })
}

/// Same group order and same set of roots everywhere.
fn in_step(authority: &MemoryAuthority, peers: &[Peer]) -> bool {
    let group = authority.children(Some(GROUP));
    let mut roots = authority.children(None);
    roots.sort();
    peers.iter().all(|peer| {
        let mut local_roots = confirmed_order(peer, None);
        local_roots.sort();
        confirmed_order(peer, Some(GROUP)) == group && local_roots == roots
    })
}

/// Random concurrent edits on one shared group
pub async fn simulate(config: &SimulationConfig) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Scene Sync Simulation                               ║");
    println!("║  Participants: {} | Children: {} | Edits: {} ║",
             config.participants, config.children, config.edits);
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut stats = SimulationStats {
        participants: config.participants,
        ..Default::default()
    };
    if config.participants == 0 {
        stats.converged = true;
        return Ok(stats);
    }
    let start = Instant::now();

    let authority = Arc::new(MemoryAuthority::new());
    let mut peers: Vec<Peer> = Vec::with_capacity(config.participants);
    for i in 0..config.participants {
        let sync = SyncConfig::builder(format!("participant-{}", i))
            .with_entity_key("texture", "path")
            .build();
        peers.push(Session::connect(sync, MemoryScene::new(), authority.clone()).await?);
    }

    println!("\n[Phase 1/3] Building the shared group...");
    peers[0].edit(|engine, scene| -> rnse_core::Result<()> {
        let group = engine.create_local(NodeKind::new("group"), Attributes::new(), None, 0, NodeFlags::default())?;
        scene.insert(group, None, 0);
        for i in 0..config.children {
            let mut attrs = Attributes::new();
            attrs.insert("name".into(), format!("mesh-{}", i).into());
            let mesh = engine.create_local(NodeKind::new("mesh"), attrs, Some(group), i, NodeFlags::default())?;
            scene.insert(mesh, Some(group), i);
        }
        Ok(())
    })?;
    settle_all(&peers, &mut stats).await?;
    println!("[Phase 1/3] ✓ Completed");

    println!("[Phase 2/3] Editing...");
    let mut edits = Box::pin(edit_stream(config.participants, config.edits, config.seed));
    let mut applied = 0;
    while let Some((who, edit)) = edits.next().await {
        if apply_edit(&peers[who], edit) {
            stats.edits += 1;
        } else {
            stats.rejected_edits += 1;
        }
        applied += 1;
        if applied % config.settle_every.max(1) == 0 {
            round(&peers, &mut stats).await?;
        }
        if applied % 100 == 0 {
            println!("  Edits applied: {}/{}", applied, config.edits);
        }
    }
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Settling...");
    let settled = settle_all(&peers, &mut stats).await?;
    stats.converged = settled && in_step(&authority, &peers);
    if !stats.converged {
        tracing::warn!(settled, "participants did not converge");
    }
    for peer in peers {
        peer.disconnect().await?;
    }
    println!("[Phase 3/3] ✓ Completed");

    stats.total_time = start.elapsed();
    stats.ticks_per_second = stats.ticks as f64 / stats.total_time.as_secs_f64().max(f64::EPSILON);
    Ok(stats)
}

/// Simulation runs with a growing number of participants
pub async fn simulate_scaling(max_participants: usize, step_size: usize) -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Ticks vs Participants              ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut participants = step_size.max(1);
    while participants <= max_participants {
        let config = SimulationConfig {
            participants,
            children: 8,
            edits: participants * 50,
            settle_every: participants,
            seed: Some(participants as u64),
        };
        simulate(&config).await?.print();
        participants += step_size.max(1);
    }
    Ok(())
}
