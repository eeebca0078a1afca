//! End-to-end manager scenarios: rule files on disk, a mock query engine,
//! and real scheduler ticks with short intervals.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_model::labels::{Labels, Matcher, METRIC_NAME};
use vigil_model::sample::{is_stale_nan, Sample, Vector};
use vigil_model::store::{Appendable, Appender, QueryError, Queryable, StoreError};

use vigil_rules::manager::{Manager, ManagerOptions, NotifyFunc, QueryFunc};
use vigil_rules::rule::{Alert, AlertState, EvalContext, RuleKind};

// ── Mocks ───────────────────────────────────────────────────────────

type QueryFn = dyn Fn(&str, DateTime<Utc>) -> Result<Vector, QueryError> + Send + Sync;

struct MockQuery {
    f: Box<QueryFn>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockQuery {
    fn new(
        f: impl Fn(&str, DateTime<Utc>) -> Result<Vector, QueryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            f: Box::new(f),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryFunc for MockQuery {
    async fn query(
        &self,
        _ctx: &EvalContext,
        expr: &str,
        at: DateTime<Utc>,
    ) -> Result<Vector, QueryError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = (self.f)(expr, at);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct CapturingNotify {
    batches: Mutex<Vec<Vec<Alert>>>,
}

impl CapturingNotify {
    fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }

    fn batches(&self) -> Vec<Vec<Alert>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotifyFunc for CapturingNotify {
    async fn notify(&self, _ctx: &EvalContext, _expr: &str, alerts: &[Alert]) {
        self.batches.lock().unwrap().push(alerts.to_vec());
    }
}

struct CollectingStore {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl Appendable for CollectingStore {
    fn appender(&self) -> Box<dyn Appender> {
        Box::new(BufAppender {
            buf: Vec::new(),
            sink: Arc::clone(&self.samples),
        })
    }
}

struct BufAppender {
    buf: Vec<Sample>,
    sink: Arc<Mutex<Vec<Sample>>>,
}

#[async_trait]
impl Appender for BufAppender {
    async fn append(&mut self, sample: Sample) -> Result<(), StoreError> {
        self.buf.push(sample);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.sink.lock().unwrap().extend(self.buf);
        Ok(())
    }
}

struct EmptyQueryable;

#[async_trait]
impl Queryable for EmptyQueryable {
    async fn latest_samples(
        &self,
        _at: DateTime<Utc>,
        _matchers: &[Matcher],
    ) -> Result<Vector, StoreError> {
        Ok(Vec::new())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    manager: Arc<Manager>,
    notify: Arc<CapturingNotify>,
    samples: Arc<Mutex<Vec<Sample>>>,
    _dir: tempfile::TempDir,
    dir: PathBuf,
}

impl Harness {
    fn new(query: Arc<MockQuery>, configure: impl FnOnce(&mut ManagerOptions)) -> Self {
        let notify = Arc::new(CapturingNotify::new());
        let samples = Arc::new(Mutex::new(Vec::new()));
        let mut opts = ManagerOptions::new(
            query,
            Arc::clone(&notify) as Arc<dyn NotifyFunc>,
            Arc::new(CollectingStore {
                samples: Arc::clone(&samples),
            }),
            Arc::new(EmptyQueryable),
        );
        configure(&mut opts);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        Self {
            manager: Arc::new(Manager::new(opts)),
            notify,
            samples,
            _dir: dir,
            dir: path,
        }
    }

    fn write_rules(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Spawn `run` in the background so group schedulers start ticking.
    fn start(&self) {
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.run().await });
    }

    fn committed(&self) -> Vec<Sample> {
        self.samples.lock().unwrap().clone()
    }
}

fn up_sample(value: f64, at: DateTime<Utc>) -> Sample {
    Sample::new(
        Labels::from_pairs([(METRIC_NAME, "up"), ("job", "api")]),
        at,
        value,
    )
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_sequential_chain_records_both_series() {
    let query = Arc::new(MockQuery::new(|expr, at| {
        Ok(match expr {
            "up" => vec![up_sample(1.0, at)],
            "r1 + 1" => vec![Sample::new(Labels::new(), at, 2.0)],
            _ => Vec::new(),
        })
    }));
    let harness = Harness::new(Arc::clone(&query), |_| {});
    let file = harness.write_rules(
        "chain.yml",
        "groups:\n  - name: chain\n    interval: 200ms\n    rules:\n      - record: r1\n        expr: up\n      - record: r2\n        expr: r1 + 1\n",
    );

    harness
        .manager
        .update(
            Duration::from_secs(10),
            &[file],
            Labels::new(),
            "",
            None,
        )
        .await
        .unwrap();
    harness.start();
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.manager.stop().await;

    let samples = harness.committed();
    let r1: Vec<_> = samples
        .iter()
        .filter(|s| s.metric.name() == Some("r1"))
        .collect();
    let r2: Vec<_> = samples
        .iter()
        .filter(|s| s.metric.name() == Some("r2"))
        .collect();
    assert!(!r1.is_empty(), "r1 should have been recorded");
    assert!(!r2.is_empty(), "r2 should have been recorded");
    assert!(r1.iter().all(|s| s.value == 1.0));
    assert!(r2.iter().all(|s| s.value == 2.0));

    // Per tick, r1 is committed before r2 at the same timestamp.
    let first_ts = r1[0].ts;
    let tick_order: Vec<_> = samples.iter().filter(|s| s.ts == first_ts).collect();
    assert_eq!(tick_order[0].metric.name(), Some("r1"));
    assert_eq!(tick_order[1].metric.name(), Some("r2"));

    // No overlap under the sequential controller.
    assert_eq!(query.max_in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_independent_rules_overlap_with_concurrency_enabled() {
    let query = Arc::new(
        MockQuery::new(|_, at| Ok(vec![Sample::new(Labels::new(), at, 1.0)]))
            .with_latency(Duration::from_millis(60)),
    );
    let harness = Harness::new(Arc::clone(&query), |opts| {
        opts.concurrent_evals_enabled = true;
        opts.max_concurrent_evals = 2;
    });
    let file = harness.write_rules(
        "par.yml",
        "groups:\n  - name: par\n    interval: 200ms\n    rules:\n      - record: x\n        expr: up\n      - record: y\n        expr: down\n",
    );

    harness
        .manager
        .update(Duration::from_secs(10), &[file], Labels::new(), "", None)
        .await
        .unwrap();
    harness.start();
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.manager.stop().await;

    assert_eq!(
        query.max_in_flight(),
        2,
        "independent rules should evaluate in parallel"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_reload_with_equal_groups_reuses_instances() {
    let query = Arc::new(MockQuery::new(|_, at| Ok(vec![up_sample(1.0, at)])));
    let harness = Harness::new(query, |_| {});
    let contents = "groups:\n  - name: a\n    interval: 1s\n    rules:\n      - record: ra\n        expr: up\n  - name: b\n    interval: 1s\n    rules:\n      - record: rb\n        expr: up\n  - name: c\n    interval: 1s\n    rules:\n      - record: rc\n        expr: up\n";
    let file = harness.write_rules("three.yml", contents);

    let interval = Duration::from_secs(10);
    harness
        .manager
        .update(interval, &[file.clone()], Labels::new(), "", None)
        .await
        .unwrap();
    let before = harness.manager.rule_groups().await;
    assert_eq!(before.len(), 3);

    harness
        .manager
        .update(interval, &[file], Labels::new(), "", None)
        .await
        .unwrap();
    let after = harness.manager.rule_groups().await;
    assert_eq!(after.len(), 3);

    for (old, new) in before.iter().zip(after.iter()) {
        assert!(
            Arc::ptr_eq(old, new),
            "equal groups must be reused, not replaced"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_of_changed_group_preserves_alert_state() {
    let query = Arc::new(MockQuery::new(|expr, at| {
        Ok(match expr {
            "up == 0" => vec![up_sample(0.0, at)],
            _ => Vec::new(),
        })
    }));
    let harness = Harness::new(query, |_| {});
    let file = harness.write_rules(
        "alerts.yml",
        "groups:\n  - name: alerts\n    interval: 150ms\n    rules:\n      - alert: InstanceDown\n        expr: up == 0\n        for: 10m\n",
    );

    let interval = Duration::from_secs(10);
    harness
        .manager
        .update(interval, &[file], Labels::new(), "", None)
        .await
        .unwrap();
    harness.start();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let before = harness.manager.alerting_rules().await;
    let pending = before[0].as_alerting().unwrap().active_alerts();
    assert_eq!(pending.len(), 1, "alert should be pending");
    let active_at = pending[0].active_at;

    // Change the group (different limit) so the instance is replaced.
    let file = harness.write_rules(
        "alerts.yml",
        "groups:\n  - name: alerts\n    interval: 150ms\n    limit: 100\n    rules:\n      - alert: InstanceDown\n        expr: up == 0\n        for: 10m\n",
    );
    harness
        .manager
        .update(interval, &[file], Labels::new(), "", None)
        .await
        .unwrap();

    let after = harness.manager.alerting_rules().await;
    let restored = after[0].as_alerting().unwrap().active_alerts();
    assert_eq!(restored.len(), 1, "alert state must survive the reload");
    assert_eq!(
        restored[0].active_at, active_at,
        "the hold-down clock must not reset on reload"
    );
    harness.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s6_alert_fires_after_hold_down_and_lingers_after_resolution() {
    let series_gone = Arc::new(AtomicBool::new(false));
    let gone = Arc::clone(&series_gone);
    let query = Arc::new(MockQuery::new(move |_, at| {
        if gone.load(Ordering::SeqCst) {
            Ok(Vec::new())
        } else {
            Ok(vec![up_sample(0.0, at)])
        }
    }));
    let harness = Harness::new(query, |opts| {
        opts.resend_delay = Duration::from_millis(100);
    });
    let file = harness.write_rules(
        "hold.yml",
        "groups:\n  - name: hold\n    interval: 150ms\n    rules:\n      - alert: Down\n        expr: up == 0\n        for: 450ms\n        keep_firing_for: 450ms\n",
    );

    harness
        .manager
        .update(Duration::from_secs(10), &[file], Labels::new(), "", None)
        .await
        .unwrap();
    harness.start();

    // Wait past the hold-down: the alert must fire with the original
    // activation time as its start.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let batches = harness.notify.batches();
    assert!(!batches.is_empty(), "firing alert should be notified");
    let first = &batches[0][0];
    assert_eq!(first.state, AlertState::Firing);
    let fired_at = first.fired_at.expect("fired alert has a start");
    assert!(
        fired_at - first.active_at >= chrono::Duration::milliseconds(450),
        "must not fire before the hold-down elapses"
    );

    // Series disappears: the alert lingers, advertising the end of the
    // keep-firing window, then resolves exactly once.
    series_gone.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let batches = harness.notify.batches();
    let resolved: Vec<&Alert> = batches
        .iter()
        .flatten()
        .filter(|a| a.resolved_at.is_some())
        .collect();
    assert_eq!(resolved.len(), 1, "resolution must be sent exactly once");

    let lingering: Vec<&Alert> = batches
        .iter()
        .flatten()
        .filter(|a| a.keep_firing_since.is_some() && a.state == AlertState::Firing)
        .collect();
    for alert in &lingering {
        let since = alert.keep_firing_since.unwrap();
        assert_eq!(
            alert.valid_until.unwrap(),
            since + chrono::Duration::milliseconds(450),
            "lingering notifications advertise the end of the window"
        );
    }
    let resolved_at = resolved[0].resolved_at.unwrap();
    if let Some(since) = resolved[0].keep_firing_since {
        assert_eq!(resolved_at, since + chrono::Duration::milliseconds(450));
    }

    // No further notifications after the resolution went out.
    let count = harness.notify.batches().len();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(harness.notify.batches().len(), count);
    harness.manager.stop().await;
}

// ── Reload edge cases ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_update_keeps_the_previous_rule_set() {
    let query = Arc::new(MockQuery::new(|_, at| Ok(vec![up_sample(1.0, at)])));
    let harness = Harness::new(query, |_| {});
    let good = harness.write_rules(
        "good.yml",
        "groups:\n  - name: g\n    rules:\n      - record: r1\n        expr: up\n",
    );

    let interval = Duration::from_secs(10);
    harness
        .manager
        .update(interval, &[good], Labels::new(), "", None)
        .await
        .unwrap();
    let before = harness.manager.rule_groups().await;

    let bad = harness.write_rules("bad.yml", "groups:\n  - name: g\n    rules:\n      - expr: up\n");
    let err = harness
        .manager
        .update(interval, &[bad], Labels::new(), "", None)
        .await;
    assert!(err.is_err());

    let after = harness.manager.rule_groups().await;
    assert_eq!(after.len(), before.len());
    assert!(Arc::ptr_eq(&before[0], &after[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_groups_are_drained_marked_stale_and_forgotten() {
    let query = Arc::new(MockQuery::new(|_, at| Ok(vec![up_sample(1.0, at)])));
    let harness = Harness::new(query, |_| {});
    let both = harness.write_rules(
        "both.yml",
        "groups:\n  - name: keep\n    interval: 150ms\n    rules:\n      - record: rk\n        expr: up\n  - name: drop\n    interval: 150ms\n    rules:\n      - record: rd\n        expr: up\n",
    );

    let interval = Duration::from_secs(10);
    harness
        .manager
        .update(interval, &[both.clone()], Labels::new(), "", None)
        .await
        .unwrap();
    harness.start();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let metrics = harness.manager.metrics();
    let dropped_key = format!("{};drop", both.display());
    assert!(metrics.snapshot(&dropped_key).is_some());

    let only_keep = harness.write_rules(
        "both.yml",
        "groups:\n  - name: keep\n    interval: 150ms\n    rules:\n      - record: rk\n        expr: up\n",
    );
    harness
        .manager
        .update(interval, &[only_keep], Labels::new(), "", None)
        .await
        .unwrap();

    // Metric label values for the removed group are deleted.
    assert!(metrics.snapshot(&dropped_key).is_none());
    assert_eq!(harness.manager.rule_groups().await.len(), 1);

    // The removed group's series got staleness markers on its way out.
    let stale: Vec<Sample> = harness
        .committed()
        .into_iter()
        .filter(|s| is_stale_nan(s.value) && s.metric.name() == Some("rd"))
        .collect();
    assert!(!stale.is_empty(), "removed group must mark its series stale");
    harness.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_idempotent_and_disables_update() {
    let query = Arc::new(MockQuery::new(|_, _| Ok(Vec::new())));
    let harness = Harness::new(query, |_| {});
    let file = harness.write_rules(
        "g.yml",
        "groups:\n  - name: g\n    rules:\n      - record: r1\n        expr: up\n",
    );
    let interval = Duration::from_secs(10);
    harness
        .manager
        .update(interval, &[file.clone()], Labels::new(), "", None)
        .await
        .unwrap();

    harness.manager.stop().await;
    harness.manager.stop().await;

    // Update after stop is a no-op that reports success.
    harness
        .manager
        .update(interval, &[file], Labels::new(), "", None)
        .await
        .unwrap();
    assert_eq!(harness.manager.rule_groups().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rules_accessors_filter_and_sort() {
    let query = Arc::new(MockQuery::new(|_, _| Ok(Vec::new())));
    let harness = Harness::new(query, |_| {});
    let file_b = harness.write_rules(
        "b.yml",
        "groups:\n  - name: z\n    rules:\n      - record: rz\n        expr: up\n        labels:\n          team: infra\n",
    );
    let file_a = harness.write_rules(
        "a.yml",
        "groups:\n  - name: m\n    rules:\n      - alert: Down\n        expr: up == 0\n        labels:\n          team: web\n",
    );

    harness
        .manager
        .update(
            Duration::from_secs(10),
            &[file_b, file_a],
            Labels::new(),
            "",
            None,
        )
        .await
        .unwrap();

    // Sorted by (file, name): a.yml before b.yml.
    let groups = harness.manager.rule_groups().await;
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].name(), "m");
    assert_eq!(groups[1].name(), "z");

    let all = harness.manager.rules(&[]).await;
    assert_eq!(all.len(), 2);

    let infra = harness
        .manager
        .rules(&[vec![Matcher::eq("team", "infra")]])
        .await;
    assert_eq!(infra.len(), 1);
    assert_eq!(infra[0].name(), "rz");

    let alerting = harness.manager.alerting_rules().await;
    assert_eq!(alerting.len(), 1);
    assert_eq!(alerting[0].kind(), RuleKind::Alerting);
    assert_eq!(alerting[0].name(), "Down");
    harness.manager.stop().await;
}
