//! Cairn refresh: sweep all locations, merge parsed entities into the store,
//! and record the outcome of every attempt in the location update log.
//!
//! Failures are contained to the smallest unit they affect. A bad document
//! fails only its entity, an unreadable location fails only that location,
//! and neither stops the sweep.

#![forbid(unsafe_code)]

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use cairn_core::{Entity, Location, UpdateStatus};
use cairn_ingest::{DescriptorParser, LocationReader, ParserError, ParserOutput, RawItem, ReadError};
use cairn_persist::{EntityStore, StoreError};
use futures::StreamExt;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod merge;

pub use merge::merge_entities;

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("entities without names are not supported")]
    MissingIdentity,
    #[error(transparent)]
    Parse(#[from] ParserError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("internal: {0}")]
    Internal(String),
}

impl RefreshError {
    /// Entity name to attach to the audit event, when the error knows it.
    pub fn component_name(&self) -> Option<&str> {
        match self {
            RefreshError::Parse(e) => e.component_name.as_deref(),
            _ => None,
        }
    }
}

/// Run one sweep over every location known to the store at call time.
///
/// Locations are visited sequentially in store order. Each location gets one
/// terminal update log event, plus one event per entity-bearing document.
/// The only error returned is failing to list locations up front; once the
/// sweep has started every failure is recorded in the log instead.
pub async fn refresh_locations<S, R, P>(store: &S, reader: &R, parser: &P) -> Result<(), StoreError>
where
    S: EntityStore,
    R: LocationReader + ?Sized,
    P: DescriptorParser + ?Sized,
{
    let started = Instant::now();
    let locations = store.locations()?;
    info!(locations = locations.len(), "refresh sweep started");

    for location in &locations {
        debug!(location_id = %location.id, kind = %location.kind, target = %location.target, "refreshing location");
        match refresh_location(store, reader, parser, location).await {
            Ok(()) => {
                counter!("refresh_location_ok", 1u64);
                log_update(store, &location.id, UpdateStatus::Success, None, None);
            }
            Err(e) => {
                counter!("refresh_location_fail", 1u64);
                debug!(location_id = %location.id, error = %e, "failed to refresh location");
                log_update(store, &location.id, UpdateStatus::Fail, None, Some(&e.to_string()));
            }
        }
    }

    histogram!("refresh_sweep_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(locations = locations.len(), elapsed_ms = started.elapsed().as_millis() as u64, "refresh sweep finished");
    Ok(())
}

/// Process one location. `Err` is a location-level failure; per-document
/// outcomes are logged here and never returned.
async fn refresh_location<S, R, P>(store: &S, reader: &R, parser: &P, location: &Location) -> Result<(), RefreshError>
where
    S: EntityStore,
    R: LocationReader + ?Sized,
    P: DescriptorParser + ?Sized,
{
    let mut items = reader.read(&location.kind, &location.target).await?;
    while let Some(item) = items.next().await {
        let payload = match item {
            RawItem::Document(payload) => payload,
            RawItem::Error(e) => {
                debug!(location_id = %location.id, error = %e, "skipping unreadable item");
                continue;
            }
        };

        let parsed = catch_unwind(AssertUnwindSafe(|| parser.parse(&payload)))
            .map_err(|_| RefreshError::Internal("descriptor parser panicked".into()))?;
        match refresh_document(store, &location.id, parsed) {
            Ok(None) => {}
            Ok(Some(name)) => {
                counter!("refresh_entity_ok", 1u64);
                log_update(store, &location.id, UpdateStatus::Success, Some(&name), None);
            }
            Err(e) => {
                counter!("refresh_entity_fail", 1u64);
                debug!(location_id = %location.id, entity = ?e.component_name(), error = %e, "entity refresh failed");
                log_update(store, &location.id, UpdateStatus::Fail, e.component_name(), Some(&e.to_string()));
            }
        }
    }
    Ok(())
}

/// Outcome of one parsed document: `Ok(Some(name))` when an entity was
/// written, `Ok(None)` when the document is not entity-bearing.
fn refresh_document<S: EntityStore>(
    store: &S,
    location_id: &str,
    parsed: Result<ParserOutput, ParserError>,
) -> Result<Option<String>, RefreshError> {
    match parsed? {
        ParserOutput::Component(entity) => {
            refresh_single_entity(store, location_id, &entity)?;
            Ok(entity.metadata.name)
        }
        ParserOutput::Other { kind } => {
            debug!(location_id = %location_id, kind = %kind, "ignoring non-component descriptor");
            Ok(None)
        }
    }
}

/// Insert `entity`, or merge it into the stored entity with the same
/// `(namespace, name)`, in a single store transaction.
pub fn refresh_single_entity<S: EntityStore>(store: &S, location_id: &str, entity: &Entity) -> Result<(), RefreshError> {
    let name = entity.metadata.name.as_deref().filter(|n| !n.is_empty()).ok_or(RefreshError::MissingIdentity)?;
    let namespace = entity.metadata.namespace.as_deref();

    store.transaction(|tx| match tx.entity(name, namespace)? {
        Some(previous) => {
            let merged = merge_entities(&previous, entity);
            tx.update_entity(location_id, &merged)
        }
        None => {
            let mut fresh = entity.clone();
            fresh.clear_store_fields();
            tx.add_entity(location_id, &fresh)
        }
    })?;
    Ok(())
}

/// Sweep every `interval` until `shutdown` resolves. A running sweep is
/// always finished before shutdown is observed, and shutdown wins over a
/// tick that is due at the same time.
pub async fn run_periodic<S, R, P, F>(store: &S, reader: &R, parser: &P, interval: Duration, shutdown: F)
where
    S: EntityStore,
    R: LocationReader + ?Sized,
    P: DescriptorParser + ?Sized,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("refresh loop stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = refresh_locations(store, reader, parser).await {
                    warn!(error = %e, "refresh sweep could not list locations");
                }
            }
        }
    }
}

fn log_update<S: EntityStore>(
    store: &S,
    location_id: &str,
    status: UpdateStatus,
    component_name: Option<&str>,
    message: Option<&str>,
) {
    if let Err(e) = store.add_location_update_log_event(location_id, status, component_name, message) {
        warn!(location_id = %location_id, status = %status, error = %e, "failed to record location update");
    }
}
