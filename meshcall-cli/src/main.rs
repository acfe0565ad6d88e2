//! Meshcall CLI
//!
//! Runs whole mesh calls in-process over the loopback collaborators and
//! prints how every participant ended up connected.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshcall_core::loopback::{LoopbackHub, LoopbackMedia, LoopbackPeerFactory};
use meshcall_core::prelude::*;
use meshcall_core::ConnectionState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const NAMES: [&str; 8] = [
    "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi",
];

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh call between simulated participants
    Simulate {
        /// Number of participants, including the caller
        #[arg(short, long, default_value_t = 3, env = "MESHCALL_PARTICIPANTS")]
        participants: usize,

        /// Room the call is started in
        #[arg(long, default_value = "lecture-hall")]
        room: String,

        /// Audio-only call
        #[arg(long)]
        audio_only: bool,

        /// Have the caller share the screen once the mesh is up
        #[arg(long)]
        screen_share: bool,

        /// Participant whose connections fail after the mesh is up
        #[arg(long)]
        drop: Option<String>,

        /// Seconds to wait for the mesh to settle
        #[arg(long, default_value_t = 5)]
        settle_secs: u64,
    },

    /// Print the effective configuration
    Config,
}

struct SimParticipant {
    name: ParticipantId,
    service: MeshCallService,
    factory: LoopbackPeerFactory,
    events: broadcast::Receiver<CallEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MeshCallConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MeshCallConfig::default(),
    };

    match cli.command {
        Commands::Simulate {
            participants,
            room,
            audio_only,
            screen_share,
            drop,
            settle_secs,
        } => {
            let call_type = if audio_only {
                CallType::Audio
            } else {
                CallType::Video
            };
            simulate(SimulateOptions {
                config,
                participants,
                room: RoomId::new(room),
                call_type,
                screen_share,
                drop: drop.map(ParticipantId::new),
                settle: Duration::from_secs(settle_secs),
            })
            .await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

struct SimulateOptions {
    config: MeshCallConfig,
    participants: usize,
    room: RoomId,
    call_type: CallType,
    screen_share: bool,
    drop: Option<ParticipantId>,
    settle: Duration,
}

fn participant_name(index: usize) -> ParticipantId {
    match NAMES.get(index) {
        Some(name) => ParticipantId::new(*name),
        None => ParticipantId::new(format!("user-{index}")),
    }
}

async fn simulate(options: SimulateOptions) -> Result<()> {
    if options.participants < 2 {
        bail!("a mesh call needs at least 2 participants");
    }

    let hub = LoopbackHub::new();
    let mut sims = Vec::with_capacity(options.participants);
    for index in 0..options.participants {
        let name = participant_name(index);
        hub.add_room_member(&options.room, name.clone());
        let signaling = Arc::new(SignalingHandler::new(Arc::new(hub.connect(name.clone()))));
        let factory = LoopbackPeerFactory::new(name.clone());
        let service = MeshCallService::builder(name.clone(), signaling)
            .with_config(options.config.clone())
            .with_media_source(Arc::new(LoopbackMedia::new(name.as_str())))
            .with_transport_factory(Arc::new(factory.clone()))
            .build()
            .await?;
        let events = service.subscribe_events();
        sims.push(SimParticipant {
            name,
            service,
            factory,
            events,
        });
    }

    let Some((caller, callees)) = sims.split_first_mut() else {
        bail!("no participants");
    };
    let call_id = caller
        .service
        .start_call(options.room.clone(), options.call_type)
        .await?;
    println!("{} started call {call_id} in {}", caller.name, options.room);

    for callee in callees.iter_mut() {
        wait_for_invite(&mut callee.events, options.settle)
            .await
            .with_context(|| format!("{} never got the invite", callee.name))?;
        callee.service.accept_invite().await?;
        println!("{} joined", callee.name);
    }

    let expected = options.participants - 1;
    if !settle(&sims, expected, options.settle).await? {
        println!("mesh did not fully settle within {:?}", options.settle);
    }
    print_links(&sims).await?;

    if options.screen_share {
        let caller = &sims[0];
        let report = caller.service.start_screen_share().await?;
        println!(
            "{} shares screen: {} links switched, {} refused",
            caller.name,
            report.replaced.len(),
            report.failed.len()
        );
        print_links(&sims).await?;
        let report = caller.service.stop_screen_share().await?;
        println!(
            "{} back on camera: {} links switched, {} refused",
            caller.name,
            report.replaced.len(),
            report.failed.len()
        );
    }

    if let Some(dropped) = &options.drop {
        let Some(index) = sims.iter().position(|s| s.name == *dropped) else {
            bail!("no participant named {dropped}");
        };
        let gone = sims.remove(index);
        for sim in &sims {
            sim.factory.emit_state(dropped, ConnectionState::Failed);
        }
        gone.service.shutdown().await?;
        println!("{dropped} dropped off the network");

        if !settle(&sims, expected - 1, options.settle).await? {
            println!("mesh did not recover within {:?}", options.settle);
        }
        print_links(&sims).await?;
    }

    for sim in &sims {
        if let Err(e) = sim.service.leave_call().await {
            tracing::debug!(participant = %sim.name, error = %e, "Leave after simulation");
        }
        sim.service.shutdown().await?;
    }
    Ok(())
}

async fn wait_for_invite(events: &mut broadcast::Receiver<CallEvent>, timeout: Duration) -> Result<()> {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::IncomingCall { .. }) => return Ok(()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    })
    .await
    .context("timed out")?
}

/// Poll until every participant has `expected` stable, connected links
async fn settle(sims: &[SimParticipant], expected: usize, timeout: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut settled = true;
        for sim in sims {
            let snapshot = sim.service.snapshot().await?;
            let connected = snapshot
                .links
                .iter()
                .filter(|l| l.connection == ConnectionState::Connected)
                .count();
            if snapshot.links.len() != expected
                || snapshot.stable_links() != expected
                || connected != expected
            {
                settled = false;
                break;
            }
        }
        if settled {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn print_links(sims: &[SimParticipant]) -> Result<()> {
    for sim in sims {
        let snapshot = sim.service.snapshot().await?;
        let links: Vec<String> = snapshot
            .links
            .iter()
            .map(|l| {
                format!(
                    "{}={:?}/{:?} video={}",
                    l.peer,
                    l.state,
                    l.connection,
                    l.outbound_video.as_deref().unwrap_or("-")
                )
            })
            .collect();
        println!("  {:<8} {}", sim.name.as_str(), links.join("  "));
    }
    Ok(())
}
