use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;

use talkback_linux_rs::audio::{AlsaBackend, AudioBackend, EngineEvent, RetryScheduler, TokioRetryScheduler};
use talkback_linux_rs::config::Config;
use talkback_linux_rs::controller::CoreController;
use talkback_linux_rs::gui_bridge::{GuiBridge, UiSignal, UserAction};
use talkback_linux_rs::net_link::{NetCommand, NetEvent, NetLink};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; missing means built-in defaults
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override network.ws_url
    #[arg(long)]
    ws_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(ws_url) = args.ws_url {
        config.network.ws_url = ws_url;
        config.validate()?;
    }

    // 创建通道，用于组件间通信
    let (tx_net_event, mut rx_net_event) = mpsc::channel::<NetEvent>(100);
    let (tx_net_cmd, rx_net_cmd) = mpsc::channel::<NetCommand>(100);
    let (tx_action, mut rx_action) = mpsc::channel::<UserAction>(100);
    let (tx_engine, mut rx_engine) = mpsc::unbounded_channel::<EngineEvent>();
    let (tx_ui, mut rx_ui) = mpsc::unbounded_channel::<UiSignal>();

    // GUI进程通过本地UDP收发
    let gui_bridge = Arc::new(
        GuiBridge::new(&config.gui, tx_action)
            .await
            .context("failed to bind GUI socket")?,
    );
    let gui_bridge_clone = gui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge_clone.run().await {
            log::error!("GuiBridge error: {}", e);
        }
    });
    tokio::spawn(async move {
        while let Some(signal) = rx_ui.recv().await {
            if let Err(e) = gui_bridge.send_signal(&signal).await {
                log::warn!("Failed to send to GUI: {}", e);
            }
        }
    });

    let net_link = NetLink::new(config.network.clone(), tx_net_event, rx_net_cmd);
    tokio::spawn(net_link.run());

    let backend: Rc<dyn AudioBackend> = Rc::new(AlsaBackend::new(config.backend_config(), tx_engine.clone()));
    let scheduler: Rc<dyn RetryScheduler> = Rc::new(TokioRetryScheduler::new(tx_engine));
    let mut controller = CoreController::new(&config, backend, scheduler, tx_net_cmd, tx_ui);

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(config.amplitude.tick_hz)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    log::info!("Talkback core started, server {}", config.network.ws_url);

    // 主事件循环: 所有状态变化都在这里串行处理
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            event = rx_net_event.recv() => {
                match event {
                    Some(event) => controller.handle_net_event(event),
                    None => {
                        log::error!("NetLink stopped");
                        break;
                    }
                }
            }
            Some(event) = rx_engine.recv() => controller.handle_engine_event(event),
            Some(action) = rx_action.recv() => {
                log::debug!("GUI action: {:?}", action);
                controller.handle_user_action(action);
            }
            _ = ticker.tick() => {
                controller.tick();
            }
        }
    }

    controller.shutdown();
    Ok(())
}
