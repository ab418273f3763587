use crate::config::Config;
use crate::controller::{OperationKind, SessionController, SessionEvent};
use crate::dispatcher::{CommandDispatcher, Endpoint};
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "ping" {
            return handle_ping(&config).await;
        }
        if command == "status" {
            return handle_status(&config).await;
        }
        if command == "scenes" {
            return handle_scenes(&config).await;
        }
        if command == "current-scene" {
            return handle_current_scene(&config).await;
        }
        if command == "set-scene" {
            return handle_set_scene(&config).await;
        }
        if command == "save-buffer" {
            return handle_one_shot(&config, OneShot::SaveBuffer).await;
        }
        if command == "split-recording" {
            return handle_one_shot(&config, OneShot::SplitRecording).await;
        }
        if let Some(toggle) = parse_toggle(command) {
            return handle_toggle(&config, toggle.0, toggle.1).await;
        }
        return Err(format!("unknown command: {command}").into());
    }

    run_monitor(config).await
}

fn parse_toggle(command: &str) -> Option<(OperationKind, bool)> {
    match command {
        "start-buffer" => Some((OperationKind::Buffer, true)),
        "stop-buffer" => Some((OperationKind::Buffer, false)),
        "start-recording" => Some((OperationKind::Recording, true)),
        "stop-recording" => Some((OperationKind::Recording, false)),
        "start-streaming" => Some((OperationKind::Streaming, true)),
        "stop-streaming" => Some((OperationKind::Streaming, false)),
        _ => None,
    }
}

fn build_dispatcher(config: &Config) -> Arc<CommandDispatcher> {
    Arc::new(CommandDispatcher::new(
        Endpoint {
            address: config.server.address.clone(),
            port: config.server.port,
        },
        config.network.exchange_timeout(),
    ))
}

fn build_controller(config: &Config) -> Arc<SessionController> {
    Arc::new(SessionController::new(
        build_dispatcher(config),
        config.network.debounce(),
    ))
}

/// Watches the backend and logs every state, pending, and connectivity
/// change until ctrl-c. This is the surface a UI layer would subscribe to.
async fn run_monitor(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let controller = build_controller(&config);
    let events = controller.subscribe();
    let poll_interval = config.network.poll_interval();

    tracing::info!(
        address = %config.server.address,
        port = config.server.port,
        "monitoring backend"
    );

    tokio::select! {
        _ = controller.run_poll_loop(poll_interval) => Ok(()),
        _ = log_events(events) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StateChanged { kind, active }) => {
                tracing::info!(%kind, active, "state changed");
            }
            Ok(SessionEvent::PendingChanged { kind, pending }) => {
                tracing::debug!(%kind, pending, "pending changed");
            }
            Ok(SessionEvent::ConnectivityChanged { connected }) => {
                tracing::info!(connected, "connectivity changed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_ping(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = build_dispatcher(config);
    if dispatcher.check_connected().await {
        println!("backend reachable at {}:{}", config.server.address, config.server.port);
        Ok(())
    } else {
        Err("backend unreachable".into())
    }
}

async fn handle_status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = build_dispatcher(config);
    let buffer = dispatcher.is_replay_buffer_active().await;
    if buffer.is_none() {
        return Err("backend unreachable".into());
    }
    let recording = dispatcher.is_recording_active().await;
    let streaming = dispatcher.is_streaming_active().await;

    println!("replay buffer: {}", describe(buffer));
    println!("recording:     {}", describe(recording));
    println!("streaming:     {}", describe(streaming));
    Ok(())
}

fn describe(state: Option<bool>) -> &'static str {
    match state {
        Some(true) => "active",
        Some(false) => "inactive",
        None => "unknown",
    }
}

async fn handle_scenes(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let controller = build_controller(config);
    let scenes = controller.scenes().await.ok_or("backend unreachable")?;
    for scene in scenes {
        println!("{scene}");
    }
    Ok(())
}

async fn handle_current_scene(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let controller = build_controller(config);
    let scene = controller
        .current_scene()
        .await
        .ok_or("backend unreachable")?;
    println!("{scene}");
    Ok(())
}

async fn handle_set_scene(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let name = std::env::args()
        .nth(2)
        .ok_or("missing scene name (usage: set-scene <name>)")?;
    let controller = build_controller(config);
    if controller.set_scene(&name).await {
        println!("switched to scene: {name}");
        Ok(())
    } else {
        Err("scene switch failed".into())
    }
}

async fn handle_toggle(
    config: &Config,
    kind: OperationKind,
    target_active: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let controller = build_controller(config);
    if controller.toggle_operation(kind, target_active).await {
        println!(
            "{kind} {}",
            if target_active { "started" } else { "stopped" }
        );
        Ok(())
    } else {
        Err(format!("failed to {} {kind}", if target_active { "start" } else { "stop" }).into())
    }
}

enum OneShot {
    SaveBuffer,
    SplitRecording,
}

async fn handle_one_shot(
    config: &Config,
    action: OneShot,
) -> Result<(), Box<dyn std::error::Error>> {
    let controller = build_controller(config);
    // Save/split require the kind to be active; seed state with one poll.
    if !controller.poll_states().await {
        return Err("backend unreachable".into());
    }
    let ok = match action {
        OneShot::SaveBuffer => controller.save_buffer().await,
        OneShot::SplitRecording => controller.split_recording().await,
    };
    match (ok, action) {
        (true, OneShot::SaveBuffer) => {
            println!("replay buffer saved");
            Ok(())
        }
        (true, OneShot::SplitRecording) => {
            println!("recording split");
            Ok(())
        }
        (false, OneShot::SaveBuffer) => Err("save failed (is the replay buffer running?)".into()),
        (false, OneShot::SplitRecording) => Err("split failed (is a recording running?)".into()),
    }
}
