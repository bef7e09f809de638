use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use client_core::{SessionController, StateUpdate};
use shared::domain::{NodeId, PortName, SessionId, Stage};

mod config;

#[derive(Parser, Debug)]
#[command(about = "Console client for the firmware pipeline backend")]
struct Args {
    /// Backend base URL; overrides console.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Session to attach to.
    #[arg(long)]
    session: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build stage operations.
    Build {
        #[command(subcommand)]
        command: BuildCommand,
    },
    /// Simulate stage operations.
    Simulate {
        #[command(subcommand)]
        command: SimulateCommand,
    },
    /// Deploy stage operations.
    Deploy {
        #[command(subcommand)]
        command: DeployCommand,
    },
    /// Follow live events for one stage until interrupted.
    Watch {
        #[arg(long, default_value = "build")]
        stage: String,
    },
}

#[derive(Subcommand, Debug)]
enum BuildCommand {
    /// Print the current build snapshot.
    Status,
    Stop,
    Retry {
        node_id: String,
    },
    Skip {
        node_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum SimulateCommand {
    Status,
    Start {
        #[arg(long, default_value_t = 30.0)]
        timeout_seconds: f64,
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    Pause,
    Resume,
    Stop,
    Speed {
        speed: f64,
    },
    /// Page through recorded inter-node messages.
    Messages {
        #[arg(long)]
        node_id: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

#[derive(Subcommand, Debug)]
enum DeployCommand {
    Status,
    Devices,
    Scan,
    Assign {
        port: String,
        node_id: String,
    },
    Unassign {
        port: String,
    },
    Flash {
        node_id: String,
        port: String,
    },
    CloudCheck,
    CloudStatus,
    CloudDestroy,
    Telemetry,
}

fn parse_stage(raw: &str) -> Result<Stage> {
    match raw {
        "build" => Ok(Stage::Build),
        "simulate" => Ok(Stage::Simulate),
        "deploy" => Ok(Stage::Deploy),
        other => Err(anyhow!("unknown stage '{other}' (build|simulate|deploy)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(session) = args.session {
        settings.session_id = Some(session);
    }
    let session_id = settings
        .session_id
        .clone()
        .ok_or_else(|| anyhow!("no session id: pass --session or set SWARM_SESSION_ID"))?;

    let controller = SessionController::new(settings.server_url.clone());
    controller.disable_auto_scan().await;
    controller
        .open_session(SessionId::from(session_id.as_str()))
        .await?;

    match args.command {
        Command::Build { command } => run_build(&controller, command).await?,
        Command::Simulate { command } => run_simulate(&controller, command).await?,
        Command::Deploy { command } => run_deploy(&controller, command).await?,
        Command::Watch { stage } => {
            let stage = parse_stage(&stage)?;
            if stage == Stage::Deploy {
                controller.enable_auto_scan(settings.scan_interval_ms).await;
            }
            watch(&controller, stage).await?;
        }
    }

    controller.close_session().await;
    Ok(())
}

async fn run_build(
    controller: &std::sync::Arc<SessionController>,
    command: BuildCommand,
) -> Result<()> {
    match command {
        BuildCommand::Status => {
            controller.load_build_snapshot().await?;
            let build = controller.build_state().await;
            println!(
                "status={:?} nodes={} done={} failed={} ({:.0}%)",
                build.status,
                build.total_count(),
                build.done_count(),
                build.failed_count(),
                build.completion_percent()
            );
            for (node_id, node) in &build.nodes {
                println!(
                    "  {node_id}: {:?} iteration {}/{}",
                    node.status, node.current_iteration, node.max_iterations
                );
            }
        }
        BuildCommand::Stop => controller.stop_build().await?,
        BuildCommand::Retry { node_id } => {
            controller.retry_node(&NodeId::from(node_id.as_str())).await?
        }
        BuildCommand::Skip { node_id } => {
            controller.skip_node(&NodeId::from(node_id.as_str())).await?
        }
    }
    Ok(())
}

async fn run_simulate(
    controller: &std::sync::Arc<SessionController>,
    command: SimulateCommand,
) -> Result<()> {
    match command {
        SimulateCommand::Status => {
            controller.load_simulate_snapshot().await?;
            let sim = controller.simulate_state().await;
            println!(
                "status={:?} speed={}x elapsed={}ms online={} messages={} tests {}/{} passed",
                sim.status,
                sim.speed,
                sim.elapsed_now(),
                sim.online_count(),
                sim.message_count,
                sim.tests_passed(),
                sim.tests_passed() + sim.tests_failed(),
            );
        }
        SimulateCommand::Start {
            timeout_seconds,
            speed,
        } => controller.start_simulation(timeout_seconds, speed).await?,
        SimulateCommand::Pause => controller.pause_simulation().await?,
        SimulateCommand::Resume => controller.resume_simulation().await?,
        SimulateCommand::Stop => controller.stop_simulation().await?,
        SimulateCommand::Speed { speed } => controller.set_simulation_speed(speed).await?,
        SimulateCommand::Messages {
            node_id,
            limit,
            offset,
        } => {
            let node_id = node_id.map(|id| NodeId::from(id.as_str()));
            let messages = controller
                .fetch_messages(node_id.as_ref(), limit, offset)
                .await?;
            for message in messages {
                println!(
                    "{} {} -> {} [{}] {}",
                    message.timestamp,
                    message.from,
                    message.to,
                    message.topic.as_deref().unwrap_or("-"),
                    message.payload
                );
            }
        }
    }
    Ok(())
}

async fn run_deploy(
    controller: &std::sync::Arc<SessionController>,
    command: DeployCommand,
) -> Result<()> {
    match command {
        DeployCommand::Status => {
            controller.load_deploy_snapshot().await?;
            let deploy = controller.deploy_state().await;
            println!(
                "devices={} assigned={} flashing={} cloud={:?} online={}",
                deploy.devices.len(),
                deploy.assignments.len(),
                deploy.flashing_count(),
                deploy.cloud.status,
                deploy.online_count()
            );
        }
        DeployCommand::Devices => {
            for device in controller.list_devices().await? {
                print_device(&device);
            }
        }
        DeployCommand::Scan => {
            for device in controller.scan_devices().await? {
                print_device(&device);
            }
        }
        DeployCommand::Assign { port, node_id } => {
            controller
                .assign_port(PortName::from(port.as_str()), NodeId::from(node_id.as_str()))
                .await?
        }
        DeployCommand::Unassign { port } => {
            controller.unassign_port(PortName::from(port.as_str())).await?
        }
        DeployCommand::Flash { node_id, port } => {
            controller
                .flash_node(NodeId::from(node_id.as_str()), PortName::from(port.as_str()))
                .await?
        }
        DeployCommand::CloudCheck => {
            let check = controller.cloud_check().await?;
            println!(
                "terraform={} aws={} ready={}",
                check.terraform_installed, check.aws_configured, check.ready
            );
            for message in check.messages.into_iter().flatten() {
                println!("  {message}");
            }
        }
        DeployCommand::CloudStatus => {
            let status = controller.cloud_status().await?;
            println!(
                "cloud={:?} {}% {}",
                status.status,
                status.progress_percent,
                status.message.as_deref().unwrap_or("")
            );
        }
        DeployCommand::CloudDestroy => controller.cloud_destroy().await?,
        DeployCommand::Telemetry => {
            for (node_id, telemetry) in controller.fetch_telemetry().await? {
                println!(
                    "{node_id}: online={} alerts={} readings={}",
                    telemetry.online,
                    telemetry.alerts.len(),
                    serde_json::to_string(&telemetry.latest_readings)?
                );
            }
        }
    }
    Ok(())
}

fn print_device(device: &shared::deploy::DeviceInfo) {
    println!(
        "{} {} ({}) assigned={}",
        device.port,
        device.board_type,
        device.chip_name,
        device
            .assigned_node
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".into())
    );
}

async fn watch(controller: &std::sync::Arc<SessionController>, stage: Stage) -> Result<()> {
    controller.set_active_stage(stage).await?;
    let mut updates = controller.subscribe();
    println!("watching {stage} events; ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(StateUpdate::ConnectionChanged(connected)) => {
                    println!("[connection] {}", if connected { "up" } else { "down" });
                }
                Ok(StateUpdate::RequestRejected(message)) => {
                    println!("[rejected] {message}");
                }
                Ok(StateUpdate::StageChanged(changed)) if changed == stage => {
                    print_stage_summary(controller, stage).await;
                }
                Ok(StateUpdate::StageChanged(_)) => {}
                Err(_) => break,
            },
        }
    }
    Ok(())
}

async fn print_stage_summary(controller: &std::sync::Arc<SessionController>, stage: Stage) {
    match stage {
        Stage::Build => {
            let build = controller.build_state().await;
            println!(
                "[build] {:?} {}/{} done",
                build.status,
                build.done_count(),
                build.total_count()
            );
        }
        Stage::Simulate => {
            let sim = controller.simulate_state().await;
            println!(
                "[simulate] {:?} {}ms {} messages",
                sim.status,
                sim.elapsed_now(),
                sim.message_count
            );
        }
        Stage::Deploy => {
            let deploy = controller.deploy_state().await;
            println!(
                "[deploy] {} devices, {} flashing, cloud {:?}",
                deploy.devices.len(),
                deploy.flashing_count(),
                deploy.cloud.status
            );
        }
    }
}
