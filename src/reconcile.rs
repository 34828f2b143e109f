//! Registry ↔ store reconciliation.
//!
//! Mirrors every registered campaign into the `campaigns` table, resolves
//! its template, and flags persisted campaigns whose ident is no longer
//! registered as orphaned. Their send records stay for audit.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::campaign::CampaignRegistry;
use crate::error::DatabaseError;
use crate::store::{CampaignRow, MailStore};
use crate::template::TemplateRegistry;

/// State of the campaign mirror after a reconciliation.
///
/// Derived from stored state only, so reconciling twice gives equal reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Registered campaigns mirrored.
    pub campaigns: usize,
    /// Persisted idents with no registered campaign.
    pub orphaned: Vec<String>,
    /// Registered campaigns whose template could not be resolved.
    pub template_missing: Vec<String>,
}

pub struct Reconciler {
    registry: Arc<CampaignRegistry>,
    templates: Arc<TemplateRegistry>,
    store: Arc<dyn MailStore>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<CampaignRegistry>,
        templates: Arc<TemplateRegistry>,
        store: Arc<dyn MailStore>,
    ) -> Self {
        Self {
            registry,
            templates,
            store,
        }
    }

    pub async fn run(&self) -> Result<ReconcileReport, DatabaseError> {
        let mut report = ReconcileReport::default();
        let mut changed = 0usize;
        let event = self.registry.event();

        let definitions = self.registry.list();
        let registered: HashSet<&str> = definitions.iter().map(|d| d.ident.as_str()).collect();

        for definition in &definitions {
            let source = match self.templates.resolve(&definition.template) {
                Ok(source) => Some(source.location.as_str()),
                Err(e) => {
                    warn!(campaign = %definition.ident, error = %e, "Campaign template missing");
                    report.template_missing.push(definition.ident.clone());
                    None
                }
            };

            let row = CampaignRow::from_definition(
                definition,
                definition.sender_or(&event.regdesk_email),
                source,
            );
            let unchanged = self
                .store
                .get_campaign(&definition.ident)
                .await?
                .is_some_and(|existing| existing.same_definition(&row));
            if !unchanged {
                self.store.upsert_campaign(&row).await?;
                changed += 1;
            }
            report.campaigns += 1;
        }

        for row in self.store.list_campaigns().await? {
            if registered.contains(row.ident.as_str()) {
                continue;
            }
            if self.store.set_orphaned(&row.ident, true).await? {
                warn!(campaign = %row.ident, "Campaign no longer registered, marked orphaned");
                changed += 1;
            }
            report.orphaned.push(row.ident);
        }

        info!(
            campaigns = report.campaigns,
            changed,
            orphaned = report.orphaned.len(),
            template_missing = report.template_missing.len(),
            "Reconciliation complete"
        );
        Ok(report)
    }
}
