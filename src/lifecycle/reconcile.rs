//! Reconciliation of interrupted operations.
//!
//! A process that exits mid-operation leaves records in a transitional status that nothing
//! will ever finalize. The reconciler finds them, asks the engine what is actually running, and
//! writes the matching terminal status.
//!
//! A transitional record is only stranded if nobody owns it: each app's claim is taken before it
//! is touched, and apps whose claim is held (a live operation, here or in another process) are
//! skipped. Writes are still check-and-set against the status that was read.

use crate::core::error::DeckError;
use crate::core::locks::{AppClaims, AppLocks};
use crate::lifecycle::command::status_for_engine_state;
use crate::lifecycle::dispatcher::{EngineState, EventDispatcher};
use crate::lifecycle::fs::{AppFilesystem, BundlePath};
use crate::lifecycle::record::{AppRecord, AppRecordPatch, AppRecordStore, Transition};
use crate::lifecycle::status::AppStatus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What happened to one stranded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub app_id: String,
    pub from: AppStatus,
    /// `None` when an interrupted uninstall had already removed the bundle and the record was
    /// dropped.
    pub to: Option<AppStatus>,
    pub observed: EngineState,
    /// False when another writer settled the record first.
    pub applied: bool,
}

pub struct Reconciler {
    store: Arc<dyn AppRecordStore>,
    fs: Arc<dyn AppFilesystem>,
    dispatcher: Arc<EventDispatcher>,
    claims: Arc<AppClaims>,
    locks: Option<Arc<AppLocks>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn AppRecordStore>,
        fs: Arc<dyn AppFilesystem>,
        dispatcher: Arc<EventDispatcher>,
        claims: Arc<AppClaims>,
    ) -> Self {
        Self {
            store,
            fs,
            dispatcher,
            claims,
            locks: None,
        }
    }

    /// Hold each app's lock while it is reconciled.
    pub fn with_locks(mut self, locks: Arc<AppLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn reconcile_all(&self) -> Result<Vec<Reconciliation>, DeckError> {
        let mut not_settled = AppStatus::SETTLED.to_vec();
        not_settled.push(AppStatus::Missing);
        let stranded = self.store.list_by_status_not_in(&not_settled)?;
        if stranded.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = stranded.len(), "reconciling apps left in a transitional status");

        let results: Vec<Result<Option<Reconciliation>, DeckError>> = stranded
            .par_iter()
            .map(|record| self.reconcile_app(record))
            .collect();
        let mut settled = Vec::new();
        for result in results {
            settled.extend(result?);
        }
        Ok(settled)
    }

    /// `None` when the app's operation still has a live owner.
    pub fn reconcile_app(&self, record: &AppRecord) -> Result<Option<Reconciliation>, DeckError> {
        let _lease = match &self.locks {
            Some(locks) => Some(locks.acquire(&record.id)?),
            None => None,
        };
        let app_id = record.id.as_str();
        let from = record.status;

        let Some(_claim) = self.claims.try_claim(app_id)? else {
            tracing::debug!(app_id, %from, "operation still in flight; not reconciling");
            return Ok(None);
        };

        if from == AppStatus::Uninstalling && !self.fs.exists(app_id, BundlePath::Bundle) {
            // Local removal had completed; only the record delete was lost.
            let applied = match self.store.get(app_id)? {
                Some(current) if current.status == from => {
                    self.store.delete(app_id)?;
                    true
                }
                _ => false,
            };
            tracing::info!(app_id, applied, "dropping record of interrupted uninstall");
            return Ok(Some(Reconciliation {
                app_id: app_id.to_string(),
                from,
                to: None,
                observed: EngineState::Stopped,
                applied,
            }));
        }

        let observed = if self.fs.exists(app_id, BundlePath::Compose) {
            self.dispatcher.query_state(app_id)
        } else {
            EngineState::Unknown
        };
        let to = status_for_engine_state(observed);
        let applied = match self.store.transition(app_id, &[from], to)? {
            Transition::Applied(_) => true,
            Transition::Rejected(_) | Transition::Missing => false,
        };
        if applied {
            let note = format!("interrupted while {}; engine reported {:?}", from, observed);
            self.store.update(app_id, AppRecordPatch::noted(note))?;
            tracing::warn!(app_id, %from, %to, ?observed, "reconciled interrupted operation");
        }
        Ok(Some(Reconciliation {
            app_id: app_id.to_string(),
            from,
            to: Some(to),
            observed,
            applied,
        }))
    }
}
