use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use kvmodel_core::{
    BackendErrorKind, Command, CommitAction, CommitReport, Connector, Error, FieldInfo, FieldType,
    InstanceState, Model, ModelCatalog, Record, Result, TransactionErrorKind,
};
use kvmodel_memory::{MemoryConfig, MemoryConnector};
use kvmodel_session::{Partition, Session, SessionConfig, TransactionStatus};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_commit_failure<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> CommitReport {
    match outcome {
        Outcome::Err(Error::Commit(failed)) => *failed.report,
        other => panic!("expected commit failure, got {other:?}"),
    }
}

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(f)
}

#[derive(Debug, Clone, Default)]
struct Hero {
    id: Option<i64>,
    name: String,
    team: String,
    handle: Option<String>,
    version: i64,
    state: InstanceState,
}

impl Model for Hero {
    const MODEL_NAME: &'static str = "hero";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", FieldType::Int).primary_key(true).auto(true),
            FieldInfo::new("name", FieldType::Text).max_length(12),
            FieldInfo::new("team", FieldType::Text).index(true),
            FieldInfo::new("handle", FieldType::Text).nullable(true).unique(true),
            FieldInfo::new("version", FieldType::Int).version(true),
        ];
        FIELDS
    }

    fn primary_key(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }

    fn set_primary_key(&mut self, id: &str) -> Result<()> {
        let id = id
            .parse::<i64>()
            .map_err(|e| Error::Custom(format!("bad id {id:?}: {e}")))?;
        self.id = Some(id);
        Ok(())
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("name", self.name.as_str())
            .with("team", self.team.as_str())
            .with("handle", self.handle.clone())
            .with("version", self.version)
    }

    fn from_record(_id: &str, record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.field("id")?,
            name: record.field("name")?,
            team: record.field("team")?,
            handle: record.field("handle")?,
            version: record.field("version")?,
            state: InstanceState::default(),
        })
    }

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

/// Identity chosen by the application.
#[derive(Debug, Clone, Default)]
struct Squad {
    slug: String,
    motto: String,
    state: InstanceState,
}

impl Model for Squad {
    const MODEL_NAME: &'static str = "squad";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("slug", FieldType::Text).primary_key(true),
            FieldInfo::new("motto", FieldType::Text).pattern("^[a-z ]+$"),
        ];
        FIELDS
    }

    fn primary_key(&self) -> Option<String> {
        (!self.slug.is_empty()).then(|| self.slug.clone())
    }

    fn set_primary_key(&mut self, id: &str) -> Result<()> {
        self.slug = id.to_string();
        Ok(())
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("slug", self.slug.as_str())
            .with("motto", self.motto.as_str())
    }

    fn from_record(_id: &str, record: &Record) -> Result<Self> {
        Ok(Self {
            slug: record.field("slug")?,
            motto: record.field("motto")?,
            state: InstanceState::default(),
        })
    }

    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut InstanceState {
        &mut self.state
    }
}

fn hero(name: &str, team: &str, handle: Option<&str>) -> Hero {
    Hero {
        name: name.to_string(),
        team: team.to_string(),
        handle: handle.map(str::to_string),
        ..Hero::default()
    }
}

fn squad(slug: &str, motto: &str) -> Squad {
    Squad {
        slug: slug.to_string(),
        motto: motto.to_string(),
        state: InstanceState::default(),
    }
}

struct Fixture {
    cx: Cx,
    store: MemoryConnector,
    catalog: Arc<ModelCatalog>,
}

impl Fixture {
    fn new() -> Self {
        let catalog = ModelCatalog::default();
        catalog.register::<Hero>().expect("register hero");
        catalog.register::<Squad>().expect("register squad");
        Self {
            cx: Cx::for_testing(),
            store: MemoryConnector::new(MemoryConfig::manual_clock()),
            catalog: Arc::new(catalog),
        }
    }

    fn session(&self) -> Session<MemoryConnector> {
        Session::new(Arc::clone(&self.catalog), self.store.clone())
    }

    async fn stored_heroes(&self) -> u64 {
        let session = self.session();
        unwrap_outcome(session.query::<Hero>().expect("query").count(&self.cx).await)
    }

    /// Commit `heroes` one by one through a throwaway session; returns
    /// their ids in input order.
    async fn seed(&self, heroes: Vec<Hero>) -> Vec<String> {
        let mut session = self.session();
        let mut ids = Vec::with_capacity(heroes.len());
        for hero in heroes {
            session.add(hero).expect("add hero");
            let report = unwrap_outcome(session.commit(&self.cx).await);
            ids.extend(report.outcomes.iter().filter_map(|o| o.id.clone()));
        }
        ids
    }
}

#[test]
fn commit_assigns_ids_and_reloads() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        session.add(hero("Ada", "red", Some("ada"))).unwrap();
        session.add(hero("Brin", "blue", None)).unwrap();
        assert_eq!(session.dirty_count(), 2);

        let report = unwrap_outcome(session.commit(&fx.cx).await);
        assert_eq!(report.committed().count(), 2);
        assert!(report.notification_errors.is_empty());
        assert_eq!(session.dirty_count(), 0);
        assert!(!session.in_transaction());

        let tracked = session.instances::<Hero>();
        assert_eq!(tracked.len(), 2);
        assert!(tracked.iter().all(|h| h.id.is_some() && h.state().is_persistent()));
        assert!(tracked.iter().all(|h| h.version == 1));
        let model = session.model::<Hero>().unwrap();
        assert_eq!(model.partition_len(Partition::Loaded), 2);

        let ada_id = tracked.iter().find(|h| h.name == "Ada").and_then(|h| h.id).unwrap();
        let mut other = fx.session();
        let ada = unwrap_outcome(other.get::<Hero>(&fx.cx, ada_id).await).expect("ada stored");
        assert_eq!(ada.handle.as_deref(), Some("ada"));
        assert_eq!(ada.state().session(), Some(other.id()));
        assert!(unwrap_outcome(other.get::<Hero>(&fx.cx, 404_i64).await).is_none());

        let reds = other.query::<Hero>().unwrap().filter("team", "red");
        assert_eq!(unwrap_outcome(reds.count(&fx.cx).await), 1);
    });
}

#[test]
fn identity_map_serves_tracked_instances() {
    let fx = Fixture::new();
    block_on(async {
        let ids = fx.seed(vec![hero("Ada", "red", None)]).await;
        let mut session = fx.session();
        let mut ada = unwrap_outcome(session.get::<Hero>(&fx.cx, ids[0].as_str()).await).unwrap();
        ada.name = "Ada Prime".to_string();
        session.add(ada).unwrap();

        fx.store.reset_stats();
        let again = unwrap_outcome(session.get::<Hero>(&fx.cx, ids[0].as_str()).await).unwrap();
        assert_eq!(again.name, "Ada Prime");
        assert_eq!(fx.store.stats().round_trips, 0);

        let reds = session.query::<Hero>().unwrap().filter("team", "red");
        let fetched = unwrap_outcome(session.fetch(&fx.cx, &reds).await);
        assert_eq!(fetched[0].name, "Ada Prime");
    });
}

#[test]
fn deleting_removes_from_store_and_session() {
    let fx = Fixture::new();
    block_on(async {
        let ids = fx.seed(vec![hero("Ada", "red", Some("ada")), hero("Brin", "red", None)]).await;
        let mut session = fx.session();
        let ada = unwrap_outcome(session.get::<Hero>(&fx.cx, ids[0].as_str()).await).unwrap();
        assert!(session.delete(&ada).unwrap());
        assert_eq!(session.pending_delete_count(), 1);
        assert!(unwrap_outcome(session.get::<Hero>(&fx.cx, ids[0].as_str()).await).is_none());

        let report = unwrap_outcome(session.commit(&fx.cx).await);
        let deletes: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| o.action == CommitAction::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].id.as_deref(), Some(ids[0].as_str()));
        assert_eq!(session.tracked_count(), 0);
        assert_eq!(fx.stored_heroes().await, 1);

        // The freed unique value can be claimed again.
        fx.seed(vec![hero("Ada II", "red", Some("ada"))]).await;
        assert_eq!(fx.stored_heroes().await, 2);
    });
}

#[test]
fn deleting_unsaved_instance_never_reaches_the_store() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        let draft = hero("Draft", "red", None);
        session.add(draft.clone()).unwrap();
        assert!(!session.delete(&draft).unwrap());
        assert_eq!(session.tracked_count(), 0);

        fx.store.reset_stats();
        let report = unwrap_outcome(session.commit(&fx.cx).await);
        assert!(report.outcomes.is_empty());
        assert_eq!(fx.store.stats().round_trips, 0);
    });
}

#[test]
fn delete_by_key_and_by_query() {
    let fx = Fixture::new();
    block_on(async {
        let ids = fx
            .seed(vec![
                hero("Ada", "red", None),
                hero("Brin", "red", None),
                hero("Cy", "blue", None),
                hero("Dee", "green", None),
            ])
            .await;
        let mut session = fx.session();
        session.delete_key::<Hero>(ids[3].as_str()).unwrap();
        let reds = session.query::<Hero>().unwrap().filter("team", "red");
        session.delete_query(&reds).unwrap();
        assert_eq!(session.pending_delete_count(), 2);

        let before = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&before);
        session.on_before_delete(move |event| {
            seen.fetch_add(event.instances.len(), Ordering::SeqCst);
            Ok(())
        });
        let after = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&after);
        session.on_after_delete(move |event| {
            seen.fetch_add(event.instances.len(), Ordering::SeqCst);
            Ok(())
        });

        let report = unwrap_outcome(session.commit(&fx.cx).await);
        assert_eq!(report.committed().count(), 3);
        // Query-matched ids are unknown until the pipeline runs.
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 3);
        assert_eq!(session.pending_delete_count(), 0);
        assert_eq!(fx.stored_heroes().await, 1);
    });
}

#[test]
fn refused_delete_stays_pending_until_the_store_accepts_it() {
    let fx = Fixture::new();
    block_on(async {
        let ids = fx
            .seed(vec![hero("Ada", "red", None), hero("Brin", "red", None), hero("Cy", "blue", None)])
            .await;
        let red = fx.catalog.meta::<Hero>().unwrap().keys.index("team", "red");
        unwrap_outcome(fx.store.execute(&fx.cx, Command::Set(red.clone(), "x".into())).await);

        let mut session = fx.session();
        let ada = unwrap_outcome(session.get::<Hero>(&fx.cx, ids[0].as_str()).await).unwrap();
        session.delete(&ada).unwrap();
        session.delete_key::<Hero>(ids[1].as_str()).unwrap();
        session.delete_key::<Hero>(ids[2].as_str()).unwrap();

        let report = expect_commit_failure(session.commit(&fx.cx).await);
        assert_eq!(report.committed().count(), 1);
        assert_eq!(report.failure_count(), 2);
        assert!(report.failed().all(|o| {
            o.error.as_ref().and_then(Error::backend_kind) == Some(BackendErrorKind::WrongType)
        }));
        assert_eq!(session.pending_delete_count(), 2);
        assert_eq!(session.model::<Hero>().unwrap().partition_len(Partition::Deleted), 1);
        assert_eq!(fx.stored_heroes().await, 2);

        unwrap_outcome(fx.store.execute(&fx.cx, Command::Del(vec![red])).await);
        let report = unwrap_outcome(session.commit(&fx.cx).await);
        assert_eq!(report.committed().count(), 2);
        assert_eq!(session.pending_delete_count(), 0);
        assert_eq!(fx.stored_heroes().await, 0);
    });
}

#[test]
fn partial_failure_spans_models_and_keeps_failures_pending() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        session.add(hero("Ada", "red", Some("ace"))).unwrap();
        session.add(hero("Brin", "red", Some("ace"))).unwrap();
        session.add(hero("A name far too long", "red", None)).unwrap();
        session.add(squad("alpha", "stand fast")).unwrap();
        session.add(squad("beta", "NOPE!")).unwrap();

        let report = expect_commit_failure(session.commit(&fx.cx).await);
        assert_eq!(report.committed().count(), 2);
        assert_eq!(report.failure_count(), 3);
        let failures: Vec<_> = report.failed().collect();
        assert_eq!(
            failures
                .iter()
                .filter(|o| o.error.as_ref().is_some_and(Error::is_validation))
                .count(),
            2
        );
        assert_eq!(
            failures
                .iter()
                .filter(|o| o.error.as_ref().is_some_and(Error::is_unique_violation))
                .count(),
            1
        );
        assert!(failures.iter().any(|o| o.model == "squad"));

        // Failures stay dirty; successes are persisted and loaded.
        assert_eq!(session.dirty_count(), 3);
        assert!(!session.in_transaction());
        assert_eq!(fx.stored_heroes().await, 1);
        let squads = session.query::<Squad>().unwrap();
        assert_eq!(unwrap_outcome(squads.ids(&fx.cx).await), vec!["alpha".to_string()]);
    });
}

#[test]
fn before_handler_veto_leaves_transaction_open() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        let veto = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&veto);
        session.on_before_commit(move |event| {
            assert!(event.instances.iter().all(|i| i.id.is_none()));
            if flag.load(Ordering::SeqCst) {
                return Err(Error::Custom("not today".to_string()));
            }
            Ok(())
        });
        session.add(hero("Ada", "red", None)).unwrap();

        fx.store.reset_stats();
        match session.commit(&fx.cx).await {
            Outcome::Err(Error::Custom(message)) => assert_eq!(message, "not today"),
            other => panic!("expected veto, got {other:?}"),
        }
        assert_eq!(fx.store.stats().round_trips, 0);
        assert_eq!(session.dirty_count(), 1);
        assert_eq!(
            session.transaction().map(|tx| tx.status()),
            Some(TransactionStatus::Open)
        );

        veto.store(false, Ordering::SeqCst);
        let report = unwrap_outcome(session.commit(&fx.cx).await);
        assert_eq!(report.committed().count(), 1);
    });
}

#[test]
fn before_commit_edits_are_validated_and_written() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        session.on_before_commit(|event| {
            for instance in event.instances.iter_mut() {
                let name: String = instance.record.field("name")?;
                instance.record.set("name", name.trim().to_string());
                instance.record.set("team", "gold");
            }
            Ok(())
        });
        session.add(hero("   Ada   ", "red", None)).unwrap();
        session.add(hero("       Brin      ", "red", None)).unwrap();

        let report = unwrap_outcome(session.commit(&fx.cx).await);
        assert_eq!(report.committed().count(), 2);
        let mut names: Vec<_> = session.instances::<Hero>().into_iter().map(|h| h.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["Ada", "Brin"]);

        let gold = fx.session().query::<Hero>().unwrap().filter("team", "gold");
        assert_eq!(unwrap_outcome(gold.count(&fx.cx).await), 2);
        assert_eq!(fx.stored_heroes().await, 2);
    });
}

#[test]
fn after_handler_errors_are_reported_not_raised() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        let ids = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ids);
        session.on_after_commit(move |event| {
            let mut sink = sink.lock().unwrap();
            sink.extend(event.instances.iter().filter_map(|i| i.id.clone()));
            Ok(())
        });
        session.on_after_commit(|event| Err(Error::Custom(format!("mailer down for {}", event.model.name))));
        session.add(hero("Ada", "red", None)).unwrap();

        let report = unwrap_outcome(session.commit(&fx.cx).await);
        assert!(report.is_success());
        assert_eq!(report.notification_errors.len(), 1);
        assert_eq!(ids.lock().unwrap().len(), 1);
        assert_eq!(fx.stored_heroes().await, 1);
    });
}

#[test]
fn rollback_discards_without_contacting_the_store() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        session.begin().unwrap();
        let err = session.begin().unwrap_err();
        assert_eq!(
            err.transaction_kind(),
            Some(TransactionErrorKind::NestedNotSupported)
        );
        session.add(hero("Ada", "red", None)).unwrap();
        fx.store.reset_stats();
        session.rollback();
        assert!(!session.in_transaction());
        assert_eq!(session.tracked_count(), 0);
        assert_eq!(fx.store.stats().round_trips, 0);
        assert_eq!(fx.stored_heroes().await, 0);
    });
}

#[test]
fn with_transaction_rolls_back_on_error() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = fx.session();
        let outcome = session
            .with_transaction(&fx.cx, |s| {
                s.add(hero("Ada", "red", None))?;
                Err::<(), _>(Error::Custom("changed my mind".to_string()))
            })
            .await;
        assert!(matches!(outcome, Outcome::Err(Error::Custom(_))));
        assert_eq!(session.tracked_count(), 0);

        let (key, report) = unwrap_outcome(
            session
                .with_transaction(&fx.cx, |s| s.add(hero("Brin", "blue", None)))
                .await,
        );
        assert!(key.is_placeholder());
        assert_eq!(report.committed().count(), 1);
        assert_eq!(fx.stored_heroes().await, 1);
    });
}

#[test]
fn commit_without_auto_begin_needs_a_transaction() {
    let fx = Fixture::new();
    block_on(async {
        let mut session = Session::with_config(
            Arc::clone(&fx.catalog),
            fx.store.clone(),
            SessionConfig::new().auto_begin(false),
        );
        session.add(hero("Ada", "red", None)).unwrap();
        match session.commit(&fx.cx).await {
            Outcome::Err(err) => {
                assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::NotOpen));
            }
            other => panic!("expected NotOpen, got {other:?}"),
        }
        session.begin().unwrap();
        unwrap_outcome(session.commit(&fx.cx).await);
        assert_eq!(fx.stored_heroes().await, 1);
    });
}

#[test]
fn instances_belong_to_one_session() {
    let fx = Fixture::new();
    let mut first = fx.session();
    let key = first.add(hero("Ada", "red", None)).unwrap();
    let claimed = first.instance::<Hero>(&key).cloned().unwrap();

    let mut second = fx.session();
    let err = second.add(claimed.clone()).unwrap_err();
    assert_eq!(err.transaction_kind(), Some(TransactionErrorKind::ForeignSession));
    assert!(second.delete(&claimed).is_err());

    let released = first.expunge(&claimed).unwrap().unwrap();
    second.add(released).unwrap();
    assert_eq!(second.dirty_count(), 1);
}

#[test]
fn concurrent_edits_conflict_on_version() {
    let fx = Fixture::new();
    block_on(async {
        let ids = fx.seed(vec![hero("Ada", "red", None)]).await;
        let id = ids[0].as_str();

        let mut left = fx.session();
        let mut right = fx.session();
        let mut a = unwrap_outcome(left.get::<Hero>(&fx.cx, id).await).unwrap();
        let mut b = unwrap_outcome(right.get::<Hero>(&fx.cx, id).await).unwrap();
        assert_eq!((a.version, b.version), (1, 1));

        a.team = "blue".to_string();
        left.add(a).unwrap();
        unwrap_outcome(left.commit(&fx.cx).await);

        b.team = "green".to_string();
        right.add(b).unwrap();
        let report = expect_commit_failure(right.commit(&fx.cx).await);
        let failure = report.failed().next().unwrap();
        assert!(failure.error.as_ref().is_some_and(Error::is_version_conflict));

        let blues = fx.session().query::<Hero>().unwrap().filter("team", "blue");
        assert_eq!(unwrap_outcome(blues.count(&fx.cx).await), 1);
    });
}
