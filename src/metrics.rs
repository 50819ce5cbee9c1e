use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub event: String,
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub command: &'static str,
    pub result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub kind: &'static str,
    pub action: &'static str,
}

/// Counters for the webhook receiver and the onboarding commands it runs.
#[derive(Clone)]
pub struct WebhookMetrics {
    pub events_total: Family<EventLabels, Counter>,
    pub commands_total: Family<CommandLabels, Counter>,
    pub event_duration_seconds: Histogram,
}

#[derive(Clone)]
pub struct OperatorMetrics {
    pub reconciles_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Histogram,
}

#[derive(Clone)]
pub struct SyncMetrics {
    pub writes_total: Family<SyncLabels, Counter>,
}

const DURATION_BUCKETS: [f64; 12] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

impl WebhookMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "maintainerd_webhook_events",
            "GitHub webhook deliveries by event type and outcome",
            events_total.clone(),
        );

        let commands_total = Family::<CommandLabels, Counter>::default();
        registry.register(
            "maintainerd_onboarding_commands",
            "Onboarding commands executed from issue events",
            commands_total.clone(),
        );

        let event_duration_seconds = new_duration_histogram();
        registry.register(
            "maintainerd_webhook_event_duration_seconds",
            "Time spent handling a webhook delivery in seconds",
            event_duration_seconds.clone(),
        );

        Self {
            events_total,
            commands_total,
            event_duration_seconds,
        }
    }

    pub fn event(&self, event: &str, outcome: &'static str) {
        self.events_total
            .get_or_create(&EventLabels {
                event: event.to_string(),
                outcome,
            })
            .inc();
    }

    pub fn command(&self, command: &'static str, result: &'static str) {
        self.commands_total
            .get_or_create(&CommandLabels { command, result })
            .inc();
    }
}

impl OperatorMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let reconciles_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "maintainerd_workspace_reconciles",
            "Project reconciliations by result",
            reconciles_total.clone(),
        );

        let reconcile_duration_seconds = new_duration_histogram();
        registry.register(
            "maintainerd_workspace_reconcile_duration_seconds",
            "Duration of a Project reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        Self {
            reconciles_total,
            reconcile_duration_seconds,
        }
    }

    pub fn reconciled(&self, result: &'static str) {
        self.reconciles_total
            .get_or_create(&ReconcileLabels { result })
            .inc();
    }
}

impl SyncMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let writes_total = Family::<SyncLabels, Counter>::default();
        registry.register(
            "maintainerd_sync_writes",
            "Custom Resource writes performed by the database sync",
            writes_total.clone(),
        );
        Self { writes_total }
    }

    pub fn write(&self, kind: &'static str, action: &'static str) {
        self.writes_total
            .get_or_create(&SyncLabels { kind, action })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_counters_are_exported() {
        let mut registry = Registry::default();
        let webhook = WebhookMetrics::new(&mut registry);
        let sync = SyncMetrics::new(&mut registry);

        webhook.event("issues", "handled");
        webhook.command("label", "ok");
        sync.write("Maintainer", "created");

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains(r#"maintainerd_webhook_events_total{event="issues",outcome="handled"} 1"#));
        assert!(out.contains(r#"maintainerd_onboarding_commands_total{command="label",result="ok"} 1"#));
        assert!(out.contains(r#"maintainerd_sync_writes_total{kind="Maintainer",action="created"} 1"#));
    }
}
