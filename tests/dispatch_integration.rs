//! End-to-end batch tests: registry + templates + in-memory libSQL store +
//! a recording transport, driven through `Mailer::run_once`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use campaign_mailer::campaign::{CampaignDefinition, CampaignRegistry, DateRule, Predicate};
use campaign_mailer::config::EventConfig;
use campaign_mailer::error::TransportError;
use campaign_mailer::mailer::Mailer;
use campaign_mailer::store::{LibSqlBackend, MailStore, SendRecord, SendStatus};
use campaign_mailer::subject::{SubjectKind, SubjectRecord};
use campaign_mailer::template::TemplateRegistry;
use campaign_mailer::transport::{OutgoingEmail, Transport};

/// Records every email instead of sending it. Fails while `failing` is set.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("connection refused".into()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

struct Harness {
    mailer: Mailer,
    store: Arc<dyn MailStore>,
    transport: Arc<RecordingTransport>,
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2027, 1, 8, 0, 0, 0).unwrap()
}

fn before_con() -> DateTime<Utc> {
    epoch() - Duration::days(30)
}

fn event() -> Arc<EventConfig> {
    Arc::new(EventConfig::new("MAGFest", epoch(), epoch() + Duration::days(3)))
}

fn welcome() -> CampaignDefinition {
    CampaignDefinition::new(
        SubjectKind::Attendee,
        "Welcome to {EVENT_NAME}",
        "welcome.txt",
        Predicate::field("paid"),
        "welcome",
    )
    .needs_approval(false)
}

fn attendee(id: &str, paid: bool) -> SubjectRecord {
    SubjectRecord::new(SubjectKind::Attendee, id, format!("{id}@example.com"))
        .with_field("first_name", id.to_uppercase())
        .with_field("paid", paid)
}

fn templates() -> TemplateRegistry {
    let mut templates = TemplateRegistry::new();
    templates.insert(
        "welcome.txt",
        "inline",
        "Hi {{ subject.first_name }}, see you at {{ event.name }}!",
    );
    templates.insert("welcome.html", "inline", "<p>Hi {{ subject.first_name }}</p>");
    templates.insert("reminder.txt", "inline", "Reminder for {{ record.email }}");
    templates
}

fn mailer_for(
    campaigns: Vec<CampaignDefinition>,
    templates: TemplateRegistry,
    store: Arc<dyn MailStore>,
    transport: Arc<RecordingTransport>,
) -> Mailer {
    let registry = CampaignRegistry::new(event());
    for campaign in campaigns {
        registry.register(campaign).unwrap();
    }
    Mailer::new(Arc::new(registry), Arc::new(templates), store, transport)
}

async fn harness(campaigns: Vec<CampaignDefinition>, subjects: &[SubjectRecord]) -> Harness {
    let store: Arc<dyn MailStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    for subject in subjects {
        store.upsert_subject(subject).await.unwrap();
    }
    let transport = Arc::new(RecordingTransport::default());
    let mailer = mailer_for(campaigns, templates(), store.clone(), transport.clone());
    Harness {
        mailer,
        store,
        transport,
    }
}

#[tokio::test]
async fn welcome_sends_once() {
    let h = harness(vec![welcome()], &[attendee("a", true)]).await;

    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(h.transport.count(), 1);

    let email = h.transport.sent.lock().unwrap()[0].clone();
    assert_eq!(email.to, vec!["a@example.com"]);
    assert_eq!(email.subject, "Welcome to MAGFest");
    assert_eq!(email.body, "Hi A, see you at MAGFest!");
    assert_eq!(email.sender, "regdesk@example.com");

    let records = h.store.list_send_records(Some("welcome")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SendStatus::Sent);

    let again = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(again.dispatch.sent, 0);
    assert_eq!(h.transport.count(), 1);
    assert_eq!(h.store.list_send_records(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_runs_send_each_pair_exactly_once() {
    let reminder = CampaignDefinition::new(
        SubjectKind::Attendee,
        "Reminder",
        "reminder.txt",
        Predicate::always(),
        "reminder",
    )
    .needs_approval(false);
    let subjects = [attendee("a", true), attendee("b", false), attendee("c", true)];
    let h = harness(vec![welcome(), reminder], &subjects).await;

    for _ in 0..3 {
        h.mailer.run_once(before_con()).await.unwrap();
    }

    // welcome: a, c; reminder: a, b, c
    assert_eq!(h.transport.count(), 5);
    assert_eq!(h.store.list_send_records(None).await.unwrap().len(), 5);
}

#[tokio::test]
async fn new_records_are_picked_up_next_run() {
    let h = harness(vec![welcome()], &[attendee("a", true)]).await;
    h.mailer.run_once(before_con()).await.unwrap();

    h.store.upsert_subject(&attendee("b", true)).await.unwrap();
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(h.transport.count(), 2);
}

#[tokio::test]
async fn approval_gates_transmission() {
    let h = harness(vec![welcome().needs_approval(true)], &[attendee("a", true)]).await;

    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(h.transport.count(), 0);
    assert_eq!(report.dispatch.newly_pending, 1);
    assert_eq!(report.pending_counts().get("welcome"), Some(&1));
    let record = h.store.get_send_record("welcome", "a").await.unwrap().unwrap();
    assert_eq!(record.status, SendStatus::Pending);

    // Still unapproved: nothing new.
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.newly_pending, 0);
    assert_eq!(h.transport.count(), 0);

    h.mailer.approve("welcome").await.unwrap();
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(h.transport.count(), 1);
    assert!(report.pending_counts().is_empty());
    let record = h.store.get_send_record("welcome", "a").await.unwrap().unwrap();
    assert_eq!(record.status, SendStatus::Sent);

    h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn approving_unknown_campaign_fails() {
    let h = harness(vec![welcome()], &[]).await;
    assert!(h.mailer.approve("nope").await.is_err());
}

#[tokio::test]
async fn pending_record_dropped_when_no_longer_eligible() {
    let h = harness(vec![welcome().needs_approval(true)], &[attendee("a", true)]).await;
    h.mailer.run_once(before_con()).await.unwrap();

    h.store.upsert_subject(&attendee("a", false)).await.unwrap();
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert!(report.pending_counts().is_empty());
    assert!(h.store.get_send_record("welcome", "a").await.unwrap().is_none());
}

#[tokio::test]
async fn transport_failure_is_retried() {
    let h = harness(vec![welcome()], &[attendee("a", true)]).await;

    h.transport.set_failing(true);
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 0);
    assert_eq!(report.dispatch.failures.len(), 1);
    assert_eq!(report.dispatch.failures[0].subject_id, "a");
    assert!(h.store.get_send_record("welcome", "a").await.unwrap().is_none());

    h.transport.set_failing(false);
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn failed_approved_send_returns_to_pending() {
    let h = harness(vec![welcome().needs_approval(true)], &[attendee("a", true)]).await;
    h.mailer.run_once(before_con()).await.unwrap();
    h.mailer.approve("welcome").await.unwrap();

    h.transport.set_failing(true);
    h.mailer.run_once(before_con()).await.unwrap();
    let record = h.store.get_send_record("welcome", "a").await.unwrap().unwrap();
    assert_eq!(record.status, SendStatus::Pending);

    h.transport.set_failing(false);
    h.mailer.run_once(before_con()).await.unwrap();
    let record = h.store.get_send_record("welcome", "a").await.unwrap().unwrap();
    assert_eq!(record.status, SendStatus::Sent);
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn suppressed_and_filtered_records_are_skipped() {
    let subjects = [attendee("a", true).opted_out(), attendee("b", false)];
    let h = harness(vec![welcome()], &subjects).await;
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 0);
    assert!(h.store.list_send_records(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn predicate_errors_are_reported_per_record() {
    let staffing = CampaignDefinition::new(
        SubjectKind::Attendee,
        "Shifts",
        "welcome.txt",
        Predicate::field("staffing"),
        "shifts",
    )
    .needs_approval(false);
    let subjects = [attendee("a", true), attendee("b", true).with_field("staffing", true)];
    let h = harness(vec![staffing], &subjects).await;

    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(report.dispatch.predicate_errors.len(), 1);
    assert_eq!(report.dispatch.predicate_errors[0].subject_id, "a");
}

#[tokio::test]
async fn window_limits_sending() {
    let deadline = before_con() + Duration::days(10);
    let h = harness(
        vec![welcome().when(DateRule::days_before(7, deadline))],
        &[attendee("a", true)],
    )
    .await;

    h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(h.transport.count(), 0);

    h.mailer.run_once(deadline - Duration::days(7)).await.unwrap();
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn at_the_con_requires_allowance() {
    let during = epoch() + Duration::hours(12);
    let h = harness(vec![welcome()], &[attendee("a", true)]).await;
    h.mailer.run_once(during).await.unwrap();
    assert_eq!(h.transport.count(), 0);

    let h = harness(vec![welcome().allow_at_the_con()], &[attendee("a", true)]).await;
    h.mailer.run_once(during).await.unwrap();
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn missing_template_does_not_stop_other_campaigns() {
    let broken = CampaignDefinition::new(
        SubjectKind::Attendee,
        "Broken",
        "missing.html",
        Predicate::always(),
        "broken",
    )
    .needs_approval(false);
    let h = harness(vec![broken, welcome()], &[attendee("a", true)]).await;

    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.reconcile.template_missing, vec!["broken"]);
    assert!(report.dispatch.template_errors.contains_key("broken"));
    assert_eq!(report.dispatch.sent, 1);
    assert!(h.store.get_campaign("broken").await.unwrap().unwrap().template_missing);
}

#[tokio::test]
async fn renamed_campaign_is_orphaned_and_excluded_from_counts() {
    let store: Arc<dyn MailStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store.upsert_subject(&attendee("a", true)).await.unwrap();
    let transport = Arc::new(RecordingTransport::default());

    let old = CampaignDefinition::new(
        SubjectKind::Attendee,
        "Old",
        "reminder.txt",
        Predicate::always(),
        "old_reminder",
    );
    let first = mailer_for(vec![welcome(), old], templates(), store.clone(), transport.clone());
    let report = first.run_once(before_con()).await.unwrap();
    assert_eq!(report.pending_counts().get("old_reminder"), Some(&1));

    let second = mailer_for(vec![welcome()], templates(), store.clone(), transport.clone());
    let report = second.run_once(before_con()).await.unwrap();
    assert_eq!(report.reconcile.orphaned, vec!["old_reminder"]);
    assert!(!report.pending_counts().contains_key("old_reminder"));
    // Kept for audit.
    assert!(store.get_send_record("old_reminder", "a").await.unwrap().is_some());

    let again = second.run_once(before_con()).await.unwrap();
    assert_eq!(again.reconcile, report.reconcile);
    assert_eq!(transport.count(), 1);
}

/// A `sending` record left behind by a worker that died before `mark_sent`.
async fn abandoned_claim(store: &Arc<dyn MailStore>, subject: &SubjectRecord, age: Duration) {
    let mut record = SendRecord::new(
        &welcome(),
        subject,
        "Welcome",
        "stale body",
        SendStatus::Sending,
    );
    record.claimed_at = Some(Utc::now() - age);
    assert!(store.insert_send_record(&record).await.unwrap());
}

#[tokio::test]
async fn abandoned_claims_are_retransmitted_after_the_lease() {
    let h = harness(vec![welcome()], &[attendee("a", true)]).await;
    abandoned_claim(&h.store, &attendee("a", true), Duration::hours(2)).await;

    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.reclaimed, 1);
    assert_eq!(report.dispatch.sent, 1);
    assert_eq!(h.transport.count(), 1);
    let record = h.store.get_send_record("welcome", "a").await.unwrap().unwrap();
    assert_eq!(record.status, SendStatus::Sent);
    assert_eq!(record.body, "Hi A, see you at MAGFest!");

    let again = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(again.dispatch.reclaimed, 0);
    assert_eq!(h.transport.count(), 1);
}

#[tokio::test]
async fn live_claims_are_left_alone() {
    let h = harness(vec![welcome()], &[attendee("a", true)]).await;
    abandoned_claim(&h.store, &attendee("a", true), Duration::minutes(1)).await;

    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.reclaimed, 0);
    assert_eq!(h.transport.count(), 0);
    let record = h.store.get_send_record("welcome", "a").await.unwrap().unwrap();
    assert_eq!(record.status, SendStatus::Sending);
}

#[tokio::test]
async fn shorter_lease_reclaims_sooner() {
    let store: Arc<dyn MailStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store.upsert_subject(&attendee("a", true)).await.unwrap();
    abandoned_claim(&store, &attendee("a", true), Duration::minutes(1)).await;
    let transport = Arc::new(RecordingTransport::default());
    let mailer = mailer_for(vec![welcome()], templates(), store.clone(), transport.clone())
        .with_claim_lease(Duration::seconds(30));

    let report = mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.reclaimed, 1);
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn overlapping_runs_send_each_pair_once() {
    let subjects: Vec<SubjectRecord> = (0..20).map(|i| attendee(&format!("a{i}"), true)).collect();
    let h = harness(vec![welcome()], &subjects).await;

    let (first, second) = tokio::join!(
        h.mailer.run_once(before_con()),
        h.mailer.run_once(before_con())
    );
    let sent = first.unwrap().dispatch.sent + second.unwrap().dispatch.sent;

    assert_eq!(sent, 20);
    assert_eq!(h.transport.count(), 20);
    let records = h.store.list_send_records(Some("welcome")).await.unwrap();
    assert_eq!(records.len(), 20);
    assert!(records.iter().all(|r| r.status == SendStatus::Sent));

    let mut recipients: Vec<String> = h
        .transport
        .sent
        .lock()
        .unwrap()
        .iter()
        .flat_map(|e| e.to.clone())
        .collect();
    recipients.sort();
    recipients.dedup();
    assert_eq!(recipients.len(), 20);
}

#[tokio::test]
async fn updated_subject_line_applies_to_later_sends_only() {
    let h = harness(vec![welcome()], &[attendee("a", true)]).await;
    h.mailer.run_once(before_con()).await.unwrap();

    h.mailer
        .registry()
        .update_subject_line("welcome", "New {EVENT_NAME} subject")
        .unwrap();
    h.store.upsert_subject(&attendee("b", true)).await.unwrap();
    let report = h.mailer.run_once(before_con()).await.unwrap();
    assert_eq!(report.dispatch.sent, 1);

    let sent = h.transport.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].subject, "Welcome to MAGFest");
    assert_eq!(sent[1].to, vec!["b@example.com"]);
    assert_eq!(sent[1].subject, "New MAGFest subject");

    let row = h.store.get_campaign("welcome").await.unwrap().unwrap();
    assert_eq!(row.subject, "New MAGFest subject");
    let first = h.store.get_send_record("welcome", "a").await.unwrap().unwrap();
    assert_eq!(first.subject_line, "Welcome to MAGFest");
}

#[tokio::test]
async fn html_bodies_escape_record_fields() {
    let html = CampaignDefinition::new(
        SubjectKind::Attendee,
        "Hello",
        "welcome.html",
        Predicate::always(),
        "hello_html",
    )
    .needs_approval(false);
    let subject = attendee("a", true).with_field("first_name", "<script>alert('x')</script>");
    let h = harness(vec![html], &[subject]).await;

    h.mailer.run_once(before_con()).await.unwrap();
    let email = h.transport.sent.lock().unwrap()[0].clone();
    assert_eq!(
        email.body,
        "<p>Hi &lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;</p>"
    );
}
