use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use payload_computer::{
    camera::create_camera,
    capture::{CaptureLoop, FramePipeline},
    cli::args::MainArgs,
    config::PayloadConfig,
    mission::{progress, supervisor, MissionContext, MissionSettings, MissionStore, ProgressState},
    perception::Perception,
    task::Task,
    upload,
    util::{retry_async, seconds},
    vehicle::create_link,
};

#[macro_use]
extern crate tracing;

const CONNECT_SPACING: Duration = Duration::from_secs(1);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // setup colorful backtraces
    color_backtrace::install();

    let mut targets = Targets::new().with_default(LevelFilter::INFO);

    if let Ok(directives) = std::env::var("RUST_LOG") {
        for directive in directives.split(',') {
            if let Some((target, level)) = directive.split_once('=') {
                targets = targets.with_target(
                    target,
                    level.parse::<LevelFilter>().context("invalid log level")?,
                );
            } else {
                targets = targets.with_default(
                    directive
                        .parse::<LevelFilter>()
                        .context("invalid log level")?,
                );
            }
        }
    }

    let (writer, _guard) = tracing_appender::non_blocking(tracing_appender::rolling::hourly(
        "logs",
        "payload-computer",
    ));

    let reg = tracing_subscriber::registry();

    #[cfg(tokio_unstable)]
    let reg = reg.with(console_subscriber::spawn());

    reg
        // writer that outputs to console
        .with(tracing_subscriber::fmt::layer().with_filter(targets))
        // writer that outputs to files
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(
                    Targets::new().with_targets(vec![("payload_computer", LevelFilter::DEBUG)]),
                ),
        )
        .init();

    let main_args = MainArgs::parse();

    debug!("reading config from {:?}", &main_args.config);
    let config = PayloadConfig::read_from_path(main_args.config.clone())
        .context("failed to read config file")?;

    run_tasks(config, main_args).await
}

async fn run_tasks(config: PayloadConfig, args: MainArgs) -> anyhow::Result<()> {
    let cancellation_token = CancellationToken::new();

    ctrlc::set_handler({
        let cancellation_token = cancellation_token.clone();
        move || {
            info!("received interrupt, shutting down");
            cancellation_token.cancel();
        }
    })
    .expect("could not set ctrl+c handler");

    debug!("connecting to vehicle");
    let link = create_link(&config.vehicle.kind).context("failed to initialize vehicle link")?;
    retry_async(config.mission.connect_attempts, Some(CONNECT_SPACING), || link.connect())
        .await
        .context("failed to connect to vehicle")?;

    debug!("initializing camera");
    let camera = create_camera(&config.camera.kind).context("failed to initialize camera")?;

    let perception = Perception::from_config(&config.vision).context("invalid vision config")?;
    let pipeline = FramePipeline::new(
        &config.vision,
        &config.landing,
        Arc::new(perception),
        camera,
        link.clone(),
    )
    .context("failed to initialize frame pipeline")?;

    let store = MissionStore::new(
        &config.mission.storage_path,
        seconds(config.mission.recovery_window),
    )
    .context("failed to open mission storage")?;
    let store = Arc::new(store);
    let (progress_tx, progress_rx) = watch::channel(ProgressState::default());

    let ctx = Arc::new(MissionContext {
        link,
        capture: Arc::new(CaptureLoop::new(Arc::new(pipeline))),
        store: store.clone(),
        progress: progress_tx,
        defaults: MissionSettings::from_config(&config.mission, &config.landing, &config.capture),
    });

    let mut tasks = Vec::<Box<dyn Task + Send>>::new();

    debug!("initializing mission supervisor task");
    let supervisor_task = supervisor::create_task(ctx, args.mission);
    let supervisor_cmd = supervisor_task.cmd();
    tasks.push(Box::new(supervisor_task));

    debug!("initializing progress task");
    tasks.push(Box::new(progress::create_task(
        store,
        progress_rx,
        seconds(config.mission.progress_interval),
    )));

    if let Some(c) = &config.upload {
        debug!("initializing upload task");
        let upload_task = upload::create_task(c, &config.mission.storage_path, supervisor_cmd)
            .context("failed to initialize upload task")?;
        tasks.push(Box::new(upload_task));
    }

    let mut join_set = JoinSet::new();

    for task in tasks {
        debug!("starting {} task", task.name());
        join_set.spawn(task.run(cancellation_token.clone()));
    }

    while let Some(res) = join_set.join_next().await {
        // a panicked task is Err, a task that failed is Ok(Err)
        match res {
            Err(err) => {
                cancellation_token.cancel();
                return Err(err).context("task failed");
            }
            Ok(Err(err)) => {
                cancellation_token.cancel();
                return Err(err).context("task terminated with error");
            }
            _ => {
                info!("exited task");
            }
        }
    }

    Ok(())
}
