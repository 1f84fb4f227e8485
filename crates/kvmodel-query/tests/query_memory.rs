use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use proptest::prelude::*;

use kvmodel_core::{
    BackendErrorKind, Command, Connector, Error, FieldInfo, FieldType, InstanceState,
    InstanceWrite, Model, ModelCatalog, ModelCommit, QueryErrorKind, Record, Reply, Result,
    Script, Value,
};
use kvmodel_memory::{MemoryConfig, MemoryConnector};
use kvmodel_query::{Query, TermIndex};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Clone, Default)]
struct Star {
    id: Option<i64>,
    name: String,
    group: String,
    color: String,
    code: Option<String>,
    score: i64,
    state: InstanceState,
}

impl Model for Star {
    const MODEL_NAME: &'static str = "star";

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", FieldType::Int).primary_key(true).auto(true),
            FieldInfo::new("name", FieldType::Text),
            FieldInfo::new("group", FieldType::Text).index(true),
            FieldInfo::new("color", FieldType::Text).index(true),
            FieldInfo::new("code", FieldType::Text).nullable(true).unique(true),
            FieldInfo::new("score", FieldType::Int),
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
            .with("group", self.group.as_str())
            .with("color", self.color.as_str())
            .with("code", self.code.clone())
            .with("score", self.score)
    }

    fn from_record(_id: &str, record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.field("id")?,
            name: record.field("name")?,
            group: record.field("group")?,
            color: record.field("color")?,
            code: record.field("code")?,
            score: record.field("score")?,
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

/// Same fields, but stored in `score` order.
#[derive(Debug, Clone, Default)]
struct RankedStar(Star);

impl Model for RankedStar {
    const MODEL_NAME: &'static str = "ranked";
    const ORDERING: Option<&'static str> = Some("score");

    fn fields() -> &'static [FieldInfo] {
        Star::fields()
    }
    fn primary_key(&self) -> Option<String> {
        self.0.primary_key()
    }
    fn set_primary_key(&mut self, id: &str) -> Result<()> {
        self.0.set_primary_key(id)
    }
    fn to_record(&self) -> Record {
        self.0.to_record()
    }
    fn from_record(id: &str, record: &Record) -> Result<Self> {
        Star::from_record(id, record).map(RankedStar)
    }
    fn state(&self) -> &InstanceState {
        self.0.state()
    }
    fn state_mut(&mut self) -> &mut InstanceState {
        self.0.state_mut()
    }
}

const STARS: &[(&str, &str, &str, Option<&str>, i64)] = &[
    ("Mercury", "planet", "grey", Some("ME"), 4),
    ("Venus", "planet", "yellow", Some("VE"), 7),
    ("Earth", "planet", "blue", Some("EA"), 9),
    ("Mars", "planet", "red", None, 6),
    ("Moon", "moon", "grey", Some("MO"), 3),
    ("Phobos", "moon", "grey", None, 1),
    ("Pluto", "dwarf", "brown", None, 2),
    ("Sun", "star", "yellow", Some("SU"), 10),
];

fn star(name: &str, group: &str, color: &str, code: Option<&str>, score: i64) -> Star {
    Star {
        id: None,
        name: name.to_string(),
        group: group.to_string(),
        color: color.to_string(),
        code: code.map(str::to_string),
        score,
        state: InstanceState::default(),
    }
}

struct Fixture {
    cx: Cx,
    store: MemoryConnector,
    catalog: ModelCatalog,
}

impl Fixture {
    fn new() -> Self {
        let catalog = ModelCatalog::default();
        catalog.register::<Star>().expect("register star");
        catalog.register::<RankedStar>().expect("register ranked");
        Self {
            cx: Cx::for_testing(),
            store: MemoryConnector::new(MemoryConfig::manual_clock()),
            catalog,
        }
    }

    async fn seed<M: Model>(&self, models: Vec<M>) {
        let meta = self.catalog.meta::<M>().expect("meta");
        let mut commit = ModelCommit::new(&meta);
        for model in &models {
            commit.writes.push(InstanceWrite::from_record(
                &meta,
                model.identity_key(),
                &model.to_record(),
                None,
            ));
        }
        let reply = unwrap_outcome(
            self.store
                .execute(&self.cx, Command::Eval(Script::Commit(commit)))
                .await,
        );
        let reply = reply.into_commit().expect("commit reply");
        assert!(reply.writes.iter().all(|w| w.result.is_ok()));
    }

    async fn seed_stars(&self) {
        let stars = STARS
            .iter()
            .map(|(n, g, c, code, s)| star(n, g, c, *code, *s))
            .collect::<Vec<_>>();
        self.seed(stars.clone()).await;
        self.seed(stars.into_iter().map(RankedStar).collect()).await;
    }

    fn query<M: Model>(&self) -> Query<M, MemoryConnector> {
        Query::for_model(&self.catalog, self.store.clone()).expect("query")
    }
}

fn names(stars: &[Star]) -> Vec<&str> {
    stars.iter().map(|s| s.name.as_str()).collect()
}

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(f)
}

#[test]
fn repeated_filters_on_one_field_are_an_in_test() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx
            .query::<Star>()
            .filter("group", "planet")
            .filter("group", "moon")
            .filter("color", "grey");
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 3);
        let mut found = names(&unwrap_outcome(q.all(&fx.cx).await))
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        found.sort();
        assert_eq!(found, vec!["Mercury", "Moon", "Phobos"]);

        let q = fx.query::<Star>().filter_in("group__in", ["planet", "dwarf"]);
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 5);
    });
}

#[test]
fn unique_filter_with_missing_value_is_empty_not_an_error() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx.query::<Star>().filter("code", "XX");
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 0);
        let q = fx.query::<Star>().filter_in("code", ["EA", "XX", "SU"]);
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 2);
    });
}

#[test]
fn excludes_and_identity_filters() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx
            .query::<Star>()
            .filter("group", "planet")
            .exclude("color", "grey")
            .exclude("color", "red");
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 2);

        let q = fx.query::<Star>().filter_in("id", [1_i64, 2, 404]);
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 2);
        assert!(unwrap_outcome(q.contains(&fx.cx, 2_i64).await));
        assert!(!unwrap_outcome(q.contains(&fx.cx, 404_i64).await));
    });
}

#[test]
fn empty_value_set_never_contacts_the_backend() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        fx.store.reset_stats();
        let q = fx
            .query::<Star>()
            .filter_in("group", Vec::<Value>::new())
            .filter("color", "grey");
        assert!(q.construct().expect("construct").is_empty());
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 0);
        assert!(unwrap_outcome(q.all(&fx.cx).await).is_empty());
        assert_eq!(fx.store.stats().round_trips, 0);
    });
}

#[test]
fn construction_errors_surface_before_backend_contact() {
    let fx = Fixture::new();
    let cases = [
        (fx.query::<Star>().filter("name", "Sun"), QueryErrorKind::NotIndexed),
        (fx.query::<Star>().filter("mass", 1), QueryErrorKind::UnknownField),
        (fx.query::<Star>().filter("group__gt", "a"), QueryErrorKind::UnsupportedLookup),
        (fx.query::<Star>().sort_by("-mass"), QueryErrorKind::Ordering),
        (fx.query::<Star>().get_field("mass"), QueryErrorKind::NoProjection),
        (fx.query::<Star>().search("red"), QueryErrorKind::NoSearchEngine),
    ];
    for (query, kind) in cases {
        let err = query.construct().expect_err("construction should fail");
        assert_eq!(err.query_kind(), Some(kind), "{err}");
        assert!(err.is_usage());
    }
    assert_eq!(fx.store.stats().round_trips, 0);
}

#[test]
fn projection_changes_rebuild_the_tree() {
    let fx = Fixture::new();
    let q = fx.query::<Star>().filter("group", "moon");
    q.construct().expect("valid query");
    q.backend().expect("backend");

    let err = q.get_field("mass").construct().expect_err("unknown projection");
    assert_eq!(err.query_kind(), Some(QueryErrorKind::NoProjection));

    let built = fx.query::<Star>().filter("group", "moon");
    built.construct().expect("valid query");
    let err = built.load_only(&["name", "mass"]).construct().expect_err("unknown field");
    assert_eq!(err.query_kind(), Some(QueryErrorKind::NoProjection));
}

#[test]
fn construct_is_idempotent_and_reuses_temp_keys() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx.query::<Star>().filter_in("group", ["planet", "moon"]);
        let first = q.backend().expect("backend");
        let second = q.backend().expect("backend");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(std::ptr::eq(q.construct().unwrap(), q.construct().unwrap()));

        fx.store.reset_stats();
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 6);
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 6);
        assert_eq!(fx.store.stats().round_trips, 2);
        // Union-store + expire once, then one SCARD per count.
        assert_eq!(fx.store.stats().commands, 4);
        assert_eq!(fx.store.keys("kvm.star:tmp:").len(), 1);
    });
}

#[test]
fn temp_keys_expire_and_refresh_recreates_them() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx.query::<Star>().filter_in("group", ["planet", "moon"]);
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 6);
        let key = q.backend().unwrap().result_key().unwrap().to_string();
        assert_eq!(fx.store.ttl(&key), Some(Duration::from_secs(30)));

        fx.store.advance(Duration::from_secs(31)).unwrap();
        assert!(fx.store.keys("kvm.star:tmp:").is_empty());
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 0);

        unwrap_outcome(q.backend().unwrap().refresh(&fx.cx).await);
        assert_eq!(unwrap_outcome(q.count(&fx.cx).await), 6);
    });
}

#[test]
fn sorting_and_negative_slices() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx.query::<Star>().filter("group", "planet").sort_by("-score");
        assert_eq!(
            names(&unwrap_outcome(q.all(&fx.cx).await)),
            vec!["Earth", "Venus", "Mars", "Mercury"]
        );
        assert_eq!(
            names(&unwrap_outcome(q.slice(&fx.cx, 1, Some(3)).await)),
            vec!["Venus", "Mars"]
        );
        assert_eq!(
            names(&unwrap_outcome(q.slice(&fx.cx, -2, None).await)),
            vec!["Mars", "Mercury"]
        );
        assert!(unwrap_outcome(q.slice(&fx.cx, 2, Some(0)).await).is_empty());

        let q = fx.query::<Star>().filter("group", "moon").sort_by("name");
        let first = unwrap_outcome(q.first(&fx.cx).await).expect("a moon");
        assert_eq!(first.name, "Moon");
        assert!(first.state.is_persistent());
    });
}

#[test]
fn default_ordering_elides_the_sort_even_when_descending() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx
            .query::<RankedStar>()
            .filter_in("group", ["planet", "moon"])
            .exclude("color", "red")
            .sort_by("-score");
        let backend = q.backend().unwrap();
        assert!(backend.plan().sort_elided);
        assert!(
            backend
                .plan()
                .commands
                .iter()
                .all(|c| !matches!(c, Command::Sort { .. }))
        );
        let found: Vec<_> = unwrap_outcome(q.all(&fx.cx).await)
            .into_iter()
            .map(|s| s.0.name)
            .collect();
        assert_eq!(found, vec!["Earth", "Venus", "Mercury", "Moon", "Phobos"]);

        let ascending = fx.query::<RankedStar>().filter("color", "grey");
        let found: Vec<_> = unwrap_outcome(ascending.all(&fx.cx).await)
            .into_iter()
            .map(|s| s.0.score)
            .collect();
        assert_eq!(found, vec![1, 3, 4]);
        assert!(unwrap_outcome(ascending.contains(&fx.cx, 1_i64).await));
    });
}

#[test]
fn compound_queries_are_generative() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let planets = fx.query::<Star>().filter("group", "planet");
        let grey = fx.query::<Star>().filter("color", "grey");
        let either = planets.union(&[&grey]);
        let both = planets.intersect(&[&grey]);
        assert_eq!(unwrap_outcome(either.count(&fx.cx).await), 6);
        assert_eq!(unwrap_outcome(both.count(&fx.cx).await), 1);
        assert_eq!(unwrap_outcome(planets.count(&fx.cx).await), 4);

        let narrowed = either.filter("color", "yellow");
        assert_eq!(unwrap_outcome(narrowed.count(&fx.cx).await), 1);
    });
}

#[test]
fn projections_records_and_get() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q = fx
            .query::<Star>()
            .filter("group", "moon")
            .sort_by("score")
            .get_field("name");
        assert_eq!(
            unwrap_outcome(q.values(&fx.cx).await),
            vec![Value::from("Phobos"), Value::from("Moon")]
        );

        let q = fx.query::<Star>().filter("group", "dwarf").load_only(&["score"]);
        let records = unwrap_outcome(q.records(&fx.cx).await);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("score"), Some(&Value::Int(2)));
        assert!(!records[0].contains("name"));

        let all = fx.query::<Star>();
        let pluto = unwrap_outcome(all.get(&fx.cx, 7_i64).await).expect("pluto");
        assert_eq!(pluto.name, "Pluto");
        assert!(unwrap_outcome(all.get(&fx.cx, 99_i64).await).is_none());
        let moons = fx.query::<Star>().filter("group", "moon");
        assert!(unwrap_outcome(moons.get(&fx.cx, 7_i64).await).is_none());
    });
}

#[test]
fn search_results_intersect_with_filters() {
    let fx = Fixture::new();
    let index = Arc::new(TermIndex::new());
    index.index("star", "3", "blue ocean world");
    index.index("star", "4", "red desert world");
    index.index("star", "8", "yellow dwarf");
    block_on(async {
        fx.seed_stars().await;
        let q = fx
            .query::<Star>()
            .with_search_engine(index.clone())
            .search("world")
            .exclude("color", "red");
        let found = unwrap_outcome(q.all(&fx.cx).await);
        assert_eq!(names(&found), vec!["Earth"]);
    });
}

/// Answers record fetches with one reply too few.
#[derive(Debug, Clone)]
struct ShortRecordReplies(MemoryConnector);

impl Connector for ShortRecordReplies {
    fn pipeline(
        &self,
        cx: &Cx,
        commands: Vec<Command>,
    ) -> impl std::future::Future<Output = Outcome<Vec<Reply>, Error>> + Send {
        let truncate = commands.iter().all(|c| matches!(c, Command::HGetAll(_)));
        let batch = self.0.pipeline(cx, commands);
        async move {
            match batch.await {
                Outcome::Ok(mut replies) => {
                    if truncate {
                        replies.pop();
                    }
                    Outcome::Ok(replies)
                }
                other => other,
            }
        }
    }
}

#[test]
fn short_record_fetch_is_a_protocol_error() {
    let fx = Fixture::new();
    block_on(async {
        fx.seed_stars().await;
        let q: Query<Star, _> =
            Query::for_model(&fx.catalog, ShortRecordReplies(fx.store.clone())).expect("query");
        let backend = q.backend().expect("backend");
        let ids = vec!["1".to_string(), "2".to_string()];
        match backend.records(&fx.cx, &ids, None).await {
            Outcome::Err(err) => assert_eq!(err.backend_kind(), Some(BackendErrorKind::Protocol)),
            other => panic!("expected a protocol error, got {other:?}"),
        }
    });
}

fn group_and_color() -> impl Strategy<Value = (Vec<&'static str>, Vec<&'static str>)> {
    let groups = prop::sample::subsequence(vec!["planet", "moon", "dwarf", "star"], 1..=4);
    let colors = prop::sample::subsequence(vec!["grey", "yellow", "blue", "red", "brown"], 1..=5);
    (groups, colors)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn intersect_commutes_and_difference_counts((groups, colors) in group_and_color()) {
        let fx = Fixture::new();
        block_on(async {
            fx.seed_stars().await;
            let a = fx.query::<Star>().filter_in("group", groups.clone());
            let b = fx.query::<Star>().filter_in("color", colors.clone());

            let ab: BTreeSet<_> = unwrap_outcome(a.intersect(&[&b]).ids(&fx.cx).await).into_iter().collect();
            let ba: BTreeSet<_> = unwrap_outcome(b.intersect(&[&a]).ids(&fx.cx).await).into_iter().collect();
            assert_eq!(ab, ba);

            let diff = a.clone().exclude_in("color", colors.clone());
            let n_diff = unwrap_outcome(diff.count(&fx.cx).await);
            let n_a = unwrap_outcome(a.count(&fx.cx).await);
            assert_eq!(n_diff, n_a - ab.len() as u64);

            let expected = STARS
                .iter()
                .filter(|(_, g, c, _, _)| groups.contains(g) && colors.contains(c))
                .count();
            assert_eq!(ab.len(), expected);
        });
    }
}
