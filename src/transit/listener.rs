// src/transit/listener.rs

//! Incoming directory watcher
//!
//! The listener never touches the pool itself. A manifest that parses and
//! whose payload verifies becomes a TransitProcess job; anything else is
//! logged and left where it is.

use super::{is_manifest, load_verified};
use crate::error::Result;
use crate::jobs::{Job, JobId, JobKind};
use crate::manager::Context;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Background watcher of the transit directory
pub struct TransitListener {
    watcher: RecommendedWatcher,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TransitListener {
    /// Watch the transit directory and queue manifests already waiting in it
    pub fn start(ctx: Arc<Context>) -> Result<Self> {
        let dir = ctx.config.transit_dir();
        fs::create_dir_all(&dir)?;

        let (tx, rx) = mpsc::channel::<PathBuf>(64);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in completed_manifests(&event) {
                    let _ = tx.blocking_send(path);
                }
            }
            Err(e) => warn!("Transit watch error: {}", e),
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(listen(ctx, dir.clone(), rx, stop_rx));
        info!("Listening for transit manifests in {}", dir.display());
        Ok(Self {
            watcher,
            stop,
            handle,
        })
    }

    /// Stop watching and wait for the listener task to exit
    pub async fn stop(self) {
        let Self {
            watcher,
            stop,
            handle,
        } = self;
        drop(watcher);
        let _ = stop.send(());
        if let Err(e) = handle.await {
            error!("Transit listener task failed: {}", e);
        }
        info!("Transit listener stopped");
    }
}

/// Manifest paths whose write has completed according to `event`
fn completed_manifests(event: &Event) -> Vec<PathBuf> {
    let paths: &[PathBuf] = match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => &event.paths,
        // (from, to)
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().map(std::slice::from_ref).unwrap_or_default()
        }
        _ => &[],
    };
    paths.iter().filter(|p| is_manifest(p)).cloned().collect()
}

async fn listen(
    ctx: Arc<Context>,
    dir: PathBuf,
    mut rx: mpsc::Receiver<PathBuf>,
    mut stop: oneshot::Receiver<()>,
) {
    let scan_ctx = ctx.clone();
    match tokio::task::spawn_blocking(move || submit_pending(&scan_ctx, &dir)).await {
        Ok(Ok(queued)) if queued > 0 => info!("Queued {} waiting transit manifests", queued),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Failed to scan transit directory: {}", e),
        Err(e) => error!("Transit scan task failed: {}", e),
    }

    loop {
        tokio::select! {
            _ = &mut stop => break,
            received = rx.recv() => {
                let Some(path) = received else { break };
                let job_ctx = ctx.clone();
                match tokio::task::spawn_blocking(move || submit(&job_ctx, &path)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Rejected transit manifest: {}", e),
                    Err(e) => error!("Transit submission task failed: {}", e),
                }
            }
        }
    }
}

/// Queue every manifest currently in `dir`, returning how many were queued
pub fn submit_pending(ctx: &Context, dir: &Path) -> Result<usize> {
    let mut manifests = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_manifest(path))
        .collect::<Vec<_>>();
    manifests.sort();

    let mut queued = 0;
    for path in manifests {
        match submit(ctx, &path) {
            Ok(Some(_)) => queued += 1,
            Ok(None) => {}
            Err(e) => warn!("Rejected transit manifest: {}", e),
        }
    }
    Ok(queued)
}

/// Verify one manifest and queue a TransitProcess job for it
///
/// Returns `None` when a job for the same manifest is already queued or running.
pub fn submit(ctx: &Context, path: &Path) -> Result<Option<JobId>> {
    let manifest = load_verified(path)?;
    let source = path.to_string_lossy().into_owned();

    let pending = ctx.jobs.active()?.into_iter().any(|job| {
        job.kind == JobKind::TransitProcess && job.sources.first() == Some(&source)
    });
    if pending {
        debug!("Transit manifest {} is already queued", path.display());
        return Ok(None);
    }

    let id = ctx.jobs.push(
        Job::new(JobKind::TransitProcess)
            .with_dst(&manifest.manifest.target)
            .with_sources([source]),
    )?;
    info!(
        "Queued transit job {} for {} ({} files)",
        id,
        manifest.manifest.target,
        manifest.files.len()
    );
    Ok(Some(id))
}
