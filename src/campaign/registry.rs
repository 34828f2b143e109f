//! Campaign registry.
//!
//! Built once at startup and passed by reference to the reconciler and the
//! dispatcher. Definitions are handed out as `Arc` snapshots, so the only
//! mutation after startup (subject-line hot patching) swaps a snapshot
//! under the write lock and never tears a definition a reader holds.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::campaign::model::{CampaignDefinition, render_subject};
use crate::campaign::window::ActiveWindow;
use crate::config::EventConfig;
use crate::error::RegistryError;

#[derive(Default)]
struct Inner {
    /// Idents in registration order.
    order: Vec<String>,
    campaigns: HashMap<String, Arc<CampaignDefinition>>,
}

/// Registry of campaigns keyed by ident.
pub struct CampaignRegistry {
    event: Arc<EventConfig>,
    inner: RwLock<Inner>,
}

impl CampaignRegistry {
    /// Create an empty registry for one event.
    pub fn new(event: Arc<EventConfig>) -> Self {
        Self {
            event,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn event(&self) -> &EventConfig {
        &self.event
    }

    // A panic while holding the lock cannot leave a half-written entry:
    // writers only insert or swap whole `Arc`s.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a campaign. Fails on an empty or already-registered ident.
    pub fn register(&self, mut definition: CampaignDefinition) -> Result<(), RegistryError> {
        if definition.ident.trim().is_empty() {
            return Err(RegistryError::EmptyIdentifier);
        }

        definition.subject = render_subject(&definition.subject, &self.event);
        if definition.sender.is_none() {
            definition.sender = Some(self.event.regdesk_email.clone());
        }
        definition.window = ActiveWindow::from_rules(&definition.rules);

        let mut inner = self.write();
        if inner.campaigns.contains_key(&definition.ident) {
            return Err(RegistryError::DuplicateIdentifier(definition.ident));
        }

        tracing::debug!(
            ident = %definition.ident,
            kind = %definition.kind,
            needs_approval = definition.needs_approval,
            "Registered campaign"
        );
        inner.order.push(definition.ident.clone());
        inner
            .campaigns
            .insert(definition.ident.clone(), Arc::new(definition));
        Ok(())
    }

    /// Replace a campaign's subject line, substituting placeholders.
    ///
    /// Safe to call while a dispatch run is in flight; renders already
    /// holding the old snapshot keep the old subject.
    pub fn update_subject_line(&self, ident: &str, subject: &str) -> Result<(), RegistryError> {
        let rendered = render_subject(subject, &self.event);
        let mut inner = self.write();
        let current = inner
            .campaigns
            .get(ident)
            .ok_or_else(|| RegistryError::UnknownCampaign(ident.to_string()))?;

        if current.subject == rendered {
            return Ok(());
        }

        let mut updated = CampaignDefinition::clone(current);
        updated.subject = rendered;
        inner.campaigns.insert(ident.to_string(), Arc::new(updated));
        tracing::info!(ident = %ident, "Campaign subject line updated");
        Ok(())
    }

    pub fn get(&self, ident: &str) -> Option<Arc<CampaignDefinition>> {
        self.read().campaigns.get(ident).cloned()
    }

    pub fn contains(&self, ident: &str) -> bool {
        self.read().campaigns.contains_key(ident)
    }

    /// Snapshot of all campaigns in registration order.
    pub fn list(&self) -> Vec<Arc<CampaignDefinition>> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|ident| inner.campaigns.get(ident).cloned())
            .collect()
    }

    pub fn idents(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
