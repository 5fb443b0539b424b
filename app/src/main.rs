mod args;
mod config;
mod routes;
mod state;
mod yaml;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use args::Args;
use capture::checkpoint::file_store::FileCheckpointStore;
use capture::checkpoint::kafka_store::KafkaCheckpointStore;
use capture::checkpoint::store::CheckpointStore;
use capture::connector::mysql_source::MySQLSourceConnector;
use capture::kafka::kafka_client::Kafka;
use capture::reconcile::sequencer::Sequencer;
use capture::shutdown;
use capture::sink::kafka::KafkaSink;
use clap::Parser;
use config::{AppConfig, CheckpointConfig};
use log::{error, info};
use state::AppState;
use std::sync::Arc;

async fn checkpoint_store(config: &AppConfig) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match &config.checkpoint {
        CheckpointConfig::File { path } => Arc::new(FileCheckpointStore::new(path)),
        CheckpointConfig::Kafka { topic } => {
            let topic = topic.as_deref().unwrap_or(&config.sink.offset_topic);
            let store =
                KafkaCheckpointStore::new(&config.capture.name, topic, Kafka::new(&config.sink)?);
            store.ensure_topic().await?;
            Arc::new(store)
        }
    };
    Ok(store)
}

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let app_config = yaml::load_config(&args.config)?;
    let name = app_config.capture.name.clone();
    info!("Starting capture {} from {}", name, args.config);

    let source = Arc::new(MySQLSourceConnector::new(
        &app_config.source,
        &app_config.capture.bindings,
    )?);
    source.ensure_watermarks_table().await?;
    source.check_key_types().await?;

    let sink = Arc::new(KafkaSink::new(&name, Kafka::new(&app_config.sink)?));
    let store = checkpoint_store(&app_config).await?;

    let sequencer = Sequencer::new(
        app_config.capture.clone(),
        source.clone(),
        source.clone(),
        source.clone(),
        sink,
        store,
    )?;
    let state = web::Data::new(AppState {
        name: name.clone(),
        phase: sequencer.phase(),
        progress: sequencer.progress(),
    });

    let (handle, shutdown) = shutdown::channel();
    let mut capture = tokio::spawn(sequencer.run(shutdown));

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(routes::index::index)
            .service(routes::status::status)
    })
    .bind(("0.0.0.0", args.port))?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    actix_web::rt::spawn(server);
    info!("Serving status on port {}", args.port);

    let outcome = tokio::select! {
        outcome = &mut capture => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping capture {}", name);
            handle.signal();
            capture.await
        }
    };
    server_handle.stop(true).await;

    match outcome? {
        Ok(checkpoint) => {
            info!(
                "Capture {} stopped at {:?}",
                name, checkpoint.log_position
            );
            Ok(())
        }
        Err(e) => {
            error!("Capture {} failed ({}): {}", name, e.kind(), e);
            Err(e.into())
        }
    }
}
