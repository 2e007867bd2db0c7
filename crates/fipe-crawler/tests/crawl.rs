//! End-to-end crawls against the scripted source.

use fipe_crawler::error::RetryPolicy;
use fipe_crawler::frontier::Frontier;
use fipe_crawler::hierarchy::{Level, Parent, Status};
use fipe_crawler::progress::{self, CrawlEventKind};
use fipe_crawler::recorder::{ObservationRecorder, SnapshotRow};
use fipe_crawler::source::scripted::{Catalog, Operation, ScriptedFactory};
use fipe_crawler::source::SourceFault;
use fipe_crawler::{CrawlConfig, CrawlError, Database, TraversalEngine};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

type Snapshot = Vec<SnapshotRow>;

fn config() -> CrawlConfig {
    CrawlConfig::default().without_delays()
}

fn catalog() -> Catalog {
    Catalog::from_leaves(&[
        ("janeiro/2020", "Volks", "Gol 1.0", "2020 Gasolina", Some(45_000.0)),
        ("janeiro/2020", "Volks", "Gol 1.0", "2019 Gasolina", Some(41_000.0)),
        ("janeiro/2020", "Volks", "Amarok", "2021 Diesel", Some(180_000.0)),
        ("janeiro/2020", "Audi", "A3", "2020 Gasolina", Some(150_000.0)),
        ("janeiro/2020", "Audi", "A3", "32000 Gasolina", None),
        ("fevereiro/2020", "Volks", "Gol 1.0", "2020 Gasolina", Some(45_500.0)),
        ("fevereiro/2020", "Audi", "A3", "2020 Gasolina", Some(149_000.0)),
    ])
}

fn open(path: &Path) -> Database {
    let url = format!("sqlite://{}", path.display());
    Database::open(&url, RetryPolicy::new(Duration::ZERO, 1)).unwrap()
}

async fn crawl(
    db: Database,
    factory: &ScriptedFactory,
    config: &CrawlConfig,
) -> (TraversalEngine, Result<(), CrawlError>) {
    let mut engine = TraversalEngine::new(db, Box::new(factory.clone()), config);
    let result = engine.run().await.map(|_| ());
    (engine, result)
}

fn snapshot(db: &Database) -> Snapshot {
    ObservationRecorder::new(db).snapshot().unwrap()
}

async fn baseline() -> Snapshot {
    let factory = ScriptedFactory::new(catalog());
    let (engine, result) = crawl(Database::in_memory().unwrap(), &factory, &config()).await;
    result.unwrap();
    snapshot(engine.database())
}

fn count(db: &Database, sql: &str) -> i64 {
    db.conn().query_row(sql, [], |row| row.get(0)).unwrap()
}

#[tokio::test]
async fn test_single_leaf_scenario() {
    let catalog = Catalog::from_json(
        r#"{"periods":[{"label":"janeiro/2020","brands":[{"name":"Acme","models":[
            {"name":"X1","code":"001004-9","years":[{"label":"2020 Gasoline","value":45000.00}]}
        ]}]}]}"#,
    )
    .unwrap();
    let factory = ScriptedFactory::new(catalog);
    let (engine, result) = crawl(Database::in_memory().unwrap(), &factory, &config()).await;
    result.unwrap();
    let db = engine.database();

    assert_eq!(
        snapshot(db),
        vec![(
            "janeiro/2020".to_string(),
            "Acme".to_string(),
            "X1".to_string(),
            "2020 Gasoline".to_string(),
            45_000.0
        )]
    );
    let frontier = Frontier::new(db);
    for level in Level::ALL {
        let counts = frontier.counts(level).unwrap();
        assert_eq!((counts.visited, counts.total()), (1, 1), "{level}");
    }
    let (year, variant, code): (String, String, Option<String>) = db
        .conn()
        .query_row(
            "SELECT my.year, my.variant, m.external_code FROM model_year my
             JOIN model m ON m.id = my.model_id",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(year, "2020-01-01");
    assert_eq!(variant, "Gasoline");
    assert_eq!(code.as_deref(), Some("001004-9"));
}

#[tokio::test]
async fn test_absent_leaf_scenario() {
    let factory = ScriptedFactory::new(Catalog::from_leaves(&[(
        "janeiro/2020",
        "Acme",
        "X1",
        "2020 Gasoline",
        None,
    )]));
    let (engine, result) = crawl(Database::in_memory().unwrap(), &factory, &config()).await;
    result.unwrap();
    let db = engine.database();

    assert!(snapshot(db).is_empty());
    assert_eq!(count(db, "SELECT COUNT(*) FROM model_year"), 0);
    let frontier = Frontier::new(db);
    for level in [Level::Period, Level::Brand, Level::Model] {
        let counts = frontier.counts(level).unwrap();
        assert_eq!((counts.visited, counts.total()), (1, 1), "{level}");
    }
}

#[tokio::test]
async fn test_interrupted_crawl_resumes_to_same_result() {
    let expected = baseline().await;
    assert_eq!(expected.len(), catalog().priced_leaves());

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fipe.db");

    // First run dies on the third extraction.
    let mut fragile = config();
    fragile.max_consecutive_faults = 1;
    let factory = ScriptedFactory::new(catalog()).with_fault(
        Operation::ExtractLeaf,
        3,
        SourceFault::Interaction("search button".into()),
    );
    let (engine, result) = crawl(open(&path), &factory, &fragile).await;
    assert!(matches!(
        result,
        Err(CrawlError::FaultBudgetExhausted { .. })
    ));
    assert_eq!(snapshot(engine.database()).len(), 2);
    drop(engine);

    let factory = ScriptedFactory::new(catalog());
    let (engine, result) = crawl(open(&path), &factory, &config()).await;
    result.unwrap();
    assert_eq!(snapshot(engine.database()), expected);
    // Only the leaves left over were extracted.
    assert_eq!(factory.stats().extract_calls, 5);
}

#[tokio::test]
async fn test_abandoned_claim_is_reclaimed_on_start() {
    let expected = baseline().await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fipe.db");

    let mut fragile = config();
    fragile.max_consecutive_faults = 1;
    let factory = ScriptedFactory::new(catalog()).with_fault(
        Operation::ExtractLeaf,
        1,
        SourceFault::Lookup("price cell".into()),
    );
    let (engine, result) = crawl(open(&path), &factory, &fragile).await;
    assert!(result.is_err());
    drop(engine);

    // A crashed worker left a live claim behind.
    {
        let db = open(&path);
        let id: i64 = db
            .conn()
            .query_row(
                "SELECT id FROM model_year WHERE status = 1 ORDER BY id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let frontier = Frontier::new(&db);
        assert!(frontier
            .claim(Level::ModelYear, id, "crashed-run", Duration::from_secs(600))
            .unwrap());
        assert_eq!(
            frontier.status(Level::ModelYear, id).unwrap(),
            Some(Status::Visiting)
        );
    }

    let factory = ScriptedFactory::new(catalog());
    let mut engine = TraversalEngine::new(open(&path), Box::new(factory.clone()), &config());
    let summary = engine.run().await.unwrap();
    assert_eq!(summary.reclaimed, 1);
    assert_eq!(snapshot(engine.database()), expected);
    assert_eq!(
        count(engine.database(), "SELECT COUNT(*) FROM model_year WHERE status = 3"),
        0
    );
}

#[tokio::test]
async fn test_visit_order_is_deterministic() {
    let mut orders = Vec::new();
    for _ in 0..2 {
        let factory = ScriptedFactory::new(catalog());
        let (tx, mut rx) = progress::channel();
        let mut engine =
            TraversalEngine::new(Database::in_memory().unwrap(), Box::new(factory), &config())
                .with_events(tx);
        engine.run().await.unwrap();
        let visited: Vec<(Level, String)> = progress::drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e.event {
                CrawlEventKind::NodeVisited { level, path } => Some((level, path)),
                _ => None,
            })
            .collect();
        orders.push(visited);
    }
    assert_eq!(orders[0], orders[1]);

    let position = |path: &str| {
        orders[0]
            .iter()
            .position(|(_, p)| p == path)
            .unwrap_or_else(|| panic!("{path} not visited"))
    };
    // Periods and brands in listing order, models by name.
    assert!(position("janeiro/2020") < position("fevereiro/2020"));
    assert!(position("janeiro/2020 > Volks") < position("janeiro/2020 > Audi"));
    assert!(position("janeiro/2020 > Volks > Amarok") < position("janeiro/2020 > Volks > Gol 1.0"));
    assert!(
        position("janeiro/2020 > Volks > Gol 1.0 > 2020 Gasolina")
            < position("janeiro/2020 > Volks > Gol 1.0 > 2019 Gasolina")
    );
}

#[tokio::test]
async fn test_faults_are_recovered_in_place() {
    let expected = baseline().await;
    let factory = ScriptedFactory::new(catalog())
        .with_fault(
            Operation::ListChildren,
            2,
            SourceFault::Lookup("brand dropdown".into()),
        )
        .with_fault(
            Operation::SelectPath,
            5,
            SourceFault::Timeout("model options".into()),
        )
        .with_fault(
            Operation::ExtractLeaf,
            2,
            SourceFault::Unclassified("renderer crashed".into()),
        )
        .with_fault(
            Operation::ExtractLeaf,
            4,
            SourceFault::Interaction("search button".into()),
        );
    let mut engine =
        TraversalEngine::new(Database::in_memory().unwrap(), Box::new(factory.clone()), &config());
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.faults, 4);
    // Timeouts keep the session.
    assert_eq!(summary.resets, 3);
    assert_eq!(snapshot(engine.database()), expected);

    let stats = factory.stats();
    assert_eq!(stats.faults_raised, 4);
    assert_eq!(stats.sessions_opened, 4);
    assert_eq!(stats.sessions_closed, 4);
}

#[tokio::test]
async fn test_reruns_never_duplicate_observations() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fipe.db");
    let factory = ScriptedFactory::new(catalog());

    for _ in 0..3 {
        let (_, result) = crawl(open(&path), &factory, &config()).await;
        result.unwrap();
    }

    let db = open(&path);
    assert_eq!(
        count(&db, "SELECT COUNT(*) FROM observation"),
        catalog().priced_leaves() as i64
    );
    assert_eq!(
        count(
            &db,
            "SELECT COUNT(*) FROM (SELECT period_id, model_year_id FROM observation
             GROUP BY period_id, model_year_id HAVING COUNT(*) > 1)"
        ),
        0
    );
    assert_eq!(count(&db, "SELECT COUNT(*) FROM brand"), 2);
    assert_eq!(factory.stats().extract_calls, 7);
}

#[tokio::test]
async fn test_absent_leaf_is_never_recreated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fipe.db");

    let first = Catalog::from_leaves(&[
        ("janeiro/2020", "Audi", "A3", "2020 Gasolina", Some(150_000.0)),
        ("janeiro/2020", "Audi", "A3", "32000 Gasolina", None),
    ]);
    let mut factory = ScriptedFactory::new(first);
    let (_, result) = crawl(open(&path), &factory, &config()).await;
    result.unwrap();

    // The next month no longer lists the absent year.
    factory.republish(Catalog::from_leaves(&[
        ("janeiro/2020", "Audi", "A3", "2020 Gasolina", Some(150_000.0)),
        ("janeiro/2020", "Audi", "A3", "32000 Gasolina", None),
        ("fevereiro/2020", "Audi", "A3", "2020 Gasolina", Some(149_000.0)),
    ]));
    let (engine, result) = crawl(open(&path), &factory, &config()).await;
    result.unwrap();
    let db = engine.database();

    assert_eq!(
        count(db, "SELECT COUNT(*) FROM model_year WHERE label = '32000 Gasolina'"),
        0
    );
    assert_eq!(snapshot(db).len(), 2);
    // Only the new period's leaf was extracted on the second run.
    assert_eq!(factory.stats().extract_calls, 3);
}

#[tokio::test]
async fn test_absent_model_with_history_is_retained() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fipe.db");

    let first = Catalog::from_leaves(&[(
        "janeiro/2020",
        "Acme",
        "X1",
        "2020 Gasolina",
        Some(45_000.0),
    )]);
    let mut factory = ScriptedFactory::new(first);
    let (_, result) = crawl(open(&path), &factory, &config()).await;
    result.unwrap();

    // February lists X1 under Acme, then stops offering it.
    factory.republish(Catalog::from_leaves(&[
        ("janeiro/2020", "Acme", "X1", "2020 Gasolina", Some(45_000.0)),
        ("fevereiro/2020", "Acme", "X2", "2020 Gasolina", Some(61_000.0)),
    ]));
    {
        let db = open(&path);
        let frontier = Frontier::new(&db);
        frontier
            .ensure_populated(Parent::Root, &["fevereiro/2020".to_string()])
            .unwrap();
        let period = frontier.next_unvisited(Parent::Root).unwrap().unwrap().id;
        frontier
            .ensure_populated(Parent::Period(period), &["Acme".to_string()])
            .unwrap();
        let brand = frontier.next_unvisited(Parent::Period(period)).unwrap().unwrap().id;
        frontier
            .ensure_populated(
                Parent::Brand { period, brand },
                &["X1".to_string(), "X2".to_string()],
            )
            .unwrap();
    }

    let (tx, mut rx) = progress::channel();
    let mut engine =
        TraversalEngine::new(open(&path), Box::new(factory.clone()), &config()).with_events(tx);
    let summary = engine.run().await.unwrap();
    let db = engine.database();

    assert_eq!(summary.observations_written, 1);
    assert_eq!(summary.nodes_deleted, 0);
    assert_eq!(
        count(db, "SELECT COUNT(*) FROM model WHERE name = 'X1' AND status = 2"),
        1
    );
    assert_eq!(count(db, "SELECT COUNT(*) FROM model WHERE status <> 2"), 0);
    // January's observation of X1 survives.
    assert_eq!(snapshot(db).len(), 2);
    let events = progress::drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        &e.event,
        CrawlEventKind::NodeAbsent { level: Level::Model, path, deleted: false }
            if path == "fevereiro/2020 > Acme > X1"
    )));
}

#[tokio::test]
async fn test_fixture_catalog_crawls() {
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/catalog.json");
    let catalog = Catalog::load(&fixture).unwrap();
    let priced = catalog.priced_leaves();
    let factory = ScriptedFactory::new(catalog);
    let mut engine =
        TraversalEngine::new(Database::in_memory().unwrap(), Box::new(factory), &config());
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.observations_written as usize, priced);
    assert_eq!(summary.leaves_absent, 1);
    let db = engine.database();
    // Brand-new vehicles take the period's date as their year.
    let year: String = db
        .conn()
        .query_row(
            "SELECT year FROM model_year WHERE label = '32000 Gasolina'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(year, "2020-02-01");
    // A brand with no models is still visited.
    assert_eq!(
        count(db, "SELECT status FROM brand WHERE name = 'Rover'"),
        Status::Visited.code()
    );
}
