//! Batch entry point: reconcile, then dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::campaign::CampaignRegistry;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{RegistryError, Result};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::MailStore;
use crate::template::TemplateRegistry;
use crate::transport::Transport;

/// Result of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub reconcile: ReconcileReport,
    pub dispatch: DispatchReport,
}

impl BatchReport {
    /// Pending-approval counts per campaign, as printed after each run.
    pub fn pending_counts(&self) -> &BTreeMap<String, i64> {
        &self.dispatch.pending_counts
    }
}

/// The assembled engine.
pub struct Mailer {
    registry: Arc<CampaignRegistry>,
    store: Arc<dyn MailStore>,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
}

impl Mailer {
    pub fn new(
        registry: Arc<CampaignRegistry>,
        templates: Arc<TemplateRegistry>,
        store: Arc<dyn MailStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(registry.clone(), templates.clone(), store.clone()),
            dispatcher: Dispatcher::new(registry.clone(), templates, store.clone(), transport),
            registry,
            store,
        }
    }

    /// Override how long a `sending` claim may sit before it is taken over.
    pub fn with_claim_lease(mut self, lease: chrono::Duration) -> Self {
        self.dispatcher = self.dispatcher.with_claim_lease(lease);
        self
    }

    pub fn registry(&self) -> &CampaignRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    /// Reconcile the registry with the store, then dispatch as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let reconcile = self.reconciler.run().await?;
        let dispatch = self.dispatcher.run(now).await?;
        Ok(BatchReport {
            reconcile,
            dispatch,
        })
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        Ok(self.reconciler.run().await?)
    }

    /// Approve a registered campaign. Reconciles first so the campaign row
    /// exists.
    pub async fn approve(&self, ident: &str) -> Result<()> {
        if !self.registry.contains(ident) {
            return Err(RegistryError::UnknownCampaign(ident.to_string()).into());
        }
        self.reconciler.run().await?;
        self.store.set_approved(ident, true).await?;
        info!(ident = %ident, "Campaign approved");
        Ok(())
    }
}

/// Spawn the background ticker that runs a batch whenever the cron
/// schedule comes due. `poll` is how often the schedule is checked.
pub fn spawn_cron_ticker(
    mailer: Arc<Mailer>,
    schedule: cron::Schedule,
    poll: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_fire = schedule.upcoming(Utc).next();
        let mut ticker = tokio::time::interval(poll);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !next_fire.is_some_and(|at| at <= now) {
                continue;
            }

            match mailer.run_once(now).await {
                Ok(report) => info!(
                    sent = report.dispatch.sent,
                    pending = ?report.pending_counts(),
                    "Scheduled batch complete"
                ),
                Err(e) => error!(error = %e, "Scheduled batch failed"),
            }
            next_fire = schedule.upcoming(Utc).next();
        }
    })
}
