#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)
)]

use clap::Parser;
use tracing::{Level, event};
use tracing_subscriber::prelude::*;

use crate::config::Args;
use crate::events::EventBus;
use crate::extractor::ExtractorClient;
use crate::handlers::{
    HTTPHandlerState, delete_downloads, delete_downloads_history, get_downloads_active,
    get_downloads_history, get_downloads_pending, get_downloads_queue, get_events, get_roadmap,
    post_downloads, post_downloads_cancel, post_playlists_info, post_videos_info, post_ytdlp_update,
};
use crate::job_store::JobStore;
use crate::manager::{DEFAULT_WORKERS, DownloadManager};
use crate::roadmap::RoadmapCache;

mod clipboard;
mod config;
mod error;
mod events;
mod extractor;
mod handlers;
mod job_store;
mod line_parser;
mod manager;
mod models;
mod process_runner;
mod rate_limiter;
mod roadmap;

// Wait to observe the ctrl+c signal and cause everything to shut down properly
// by dropping the sender half of a broadcast channel (all receivers will close
// upon this event).
async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();
    event!(Level::DEBUG, "Launching...");

    // Error out early if `yt-dlp` can't be called at all.
    if std::process::Command::new(&args.ytdlp_path)
        .env_clear()
        .arg("--version")
        .output()
        .is_err()
    {
        return Err(anyhow::anyhow!(
            "No '{}' executable found, make sure it is installed",
            args.ytdlp_path
        ));
    }

    let data_dir = args.resolve_data_dir()?;
    let db_path = data_dir.join("downcore.sqlite3");
    let db_pool = job_store::open(db_path.to_string_lossy().as_ref()).await?;
    let store = JobStore::new(db_pool.clone());

    let bus = EventBus::default();
    let extractor = ExtractorClient::new(args.ytdlp_path.clone(), args.ffmpeg_path.clone());
    let extractor_for_state =
        std::sync::Arc::new(ExtractorClient::new(args.ytdlp_path.clone(), args.ffmpeg_path.clone()));
    let (manager, recv_job) = DownloadManager::new(
        store.clone(),
        bus.clone(),
        extractor,
        args.video_dir.clone(),
        args.aria2_path.clone(),
        if args.worker_count == 0 { DEFAULT_WORKERS } else { args.worker_count },
    );
    let roadmap = std::sync::Arc::new(RoadmapCache::new(db_pool.clone(), args.roadmap_base_url.clone(), bus.clone()));

    // Prepare ctrl+c signal handling: Spawn a background task waiting for
    // ctrl+c being pressed to then drop the sender side of a broadcast
    // channel to which all other tasks are hooked up as receivers. As soon as
    // the receivers see the sender getting dropped, they initiate shutdown.
    let (send_shutdown, _) = tokio::sync::broadcast::channel::<()>(1);

    let clipboard_watcher = std::sync::Arc::new(crate::clipboard::ClipboardWatcher::new(
        Box::new(crate::clipboard::SystemClipboard),
        bus.clone(),
    ));
    clipboard_watcher.clone().start().await;

    // Jobs left `pending` by a prior process survive in `store`, but the
    // in-memory dispatch channel does not; re-submit them now so a restart
    // doesn't orphan queued work (spec section 2/4.6).
    for pending in store.get_pending().await? {
        if manager.resubmit(pending.id).await.is_err() {
            tracing::warn!("job queue receiver dropped while resubmitting pending jobs at startup");
            break;
        }
    }

    let manager_for_run = manager.clone();
    let manager_for_shutdown = manager.clone();
    let limiter = manager.limiter();
    let manager_handle = tokio::task::spawn(manager_for_run.run(recv_job));

    let handler_state =
        HTTPHandlerState::new(manager, store, roadmap, extractor_for_state, limiter, bus);

    // Build HTTP router to handle incoming client requests. Note that we
    // assume to be running behind a security perimeter (e.g., a local IPC
    // socket wrapped by the desktop shell), so authentication is not a
    // concern for us.
    let router = axum::Router::new()
        .route("/downloads", axum::routing::post(post_downloads))
        .route("/downloads/queue", axum::routing::get(get_downloads_queue))
        .route("/downloads/pending", axum::routing::get(get_downloads_pending))
        .route("/downloads/active", axum::routing::get(get_downloads_active))
        .route(
            "/downloads/history",
            axum::routing::get(get_downloads_history).delete(delete_downloads_history),
        )
        .route("/downloads/{id}/cancel", axum::routing::post(post_downloads_cancel))
        .route("/downloads/{id}", axum::routing::delete(delete_downloads))
        .route("/roadmap", axum::routing::get(get_roadmap))
        .route("/videos/info", axum::routing::post(post_videos_info))
        .route("/playlists/info", axum::routing::post(post_playlists_info))
        .route("/ytdlp/update", axum::routing::post(post_ytdlp_update))
        .route("/events", axum::routing::get(get_events))
        .with_state(handler_state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", args.listen_ip, args.listen_port)).await?;
    event!(
        Level::INFO,
        "Listening for HTTP requests on {}:{}...",
        args.listen_ip,
        args.listen_port
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_upon_signal(send_shutdown))
        .await?;

    clipboard_watcher.stop().await;
    manager_for_shutdown.shutdown().await;
    let _ = manager_handle.await;
    db_pool.close().await;

    Ok(())
}
