mod common;

use std::sync::Arc;

use common::{engine, init_tracing, RecordingExecutor, SessionSpy};
use ormplan::query::options::GraphSemantic;
use ormplan::query::{CacheStats, LockMode, RowTransformer};
use ormplan::tree::{
    DeleteStatement, EntityRoot, Expression, ParameterNode, Predicate, SelectStatement, Statement,
};
use ormplan::types::{Result, Row, Value};
use ormplan::{PlanCacheOptions, PlanError, QueryEngine};

const BY_STATUS: &str = "select o from Order o where o.status = :status";

fn orders_by_status() -> Statement {
    Statement::Select(
        SelectStatement::entity(EntityRoot::new("Order", "o")).with_restriction(Predicate::eq(
            Expression::path("o", "status"),
            Expression::parameter(ParameterNode::named("status")),
        )),
    )
}

fn orders_in_statuses() -> Statement {
    Statement::Select(
        SelectStatement::entity(EntityRoot::new("Order", "o")).with_restriction(Predicate::in_list(
            Expression::path("o", "status"),
            vec![Expression::parameter(
                ParameterNode::named("statuses").multi_valued(),
            )],
        )),
    )
}

fn rows() -> RowTransformer<Row> {
    Arc::new(|row: Row| -> Result<Row> { Ok(row) })
}

fn list_by_status(engine: &QueryEngine, session: &SessionSpy, status: &str) -> Vec<Row> {
    let mut query = engine
        .create_query(Some(BY_STATUS), orders_by_status())
        .expect("query");
    query.set_parameter("status", status);
    query.list(session, rows()).expect("list")
}

#[test]
fn text_queries_share_cached_plans() {
    init_tracing();
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();

    list_by_status(&engine, &session, "NEW");
    list_by_status(&engine, &session, "OLD");

    assert_eq!(
        engine.cache().stats(),
        CacheStats {
            hits: 1,
            misses: 1,
            size: 1,
            capacity: 2048,
        }
    );
    let executed = executor.executed();
    assert_eq!(executed[0].sql, executed[1].sql);
    assert_eq!(executed[1].parameters, vec![Value::from("OLD")]);
}

#[test]
fn result_type_and_lock_mode_separate_cache_entries() {
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();

    list_by_status(&engine, &session, "NEW");

    let mut counted = engine
        .create_query(Some(BY_STATUS), orders_by_status())
        .expect("query");
    counted.set_parameter("status", "NEW");
    let lengths: RowTransformer<usize> = Arc::new(|row: Row| -> Result<usize> { Ok(row.len()) });
    counted.list(&session, lengths).expect("list");

    let mut locked = engine
        .create_query(Some(BY_STATUS), orders_by_status())
        .expect("query");
    locked
        .set_parameter("status", "NEW")
        .set_lock_mode(LockMode::PessimisticWrite);
    locked.list(&session, rows()).expect("list");

    let stats = engine.cache().stats();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.hits, 0);
    assert!(executor.statements()[2].ends_with("for update"));
}

#[test]
fn tree_queries_are_cached_only_with_the_criteria_cache() {
    let executor = RecordingExecutor::new();
    let session = SessionSpy::default();

    let plain = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    for _ in 0..2 {
        let mut query = plain.create_query(None, orders_by_status()).expect("query");
        query.set_parameter("status", "NEW");
        query.list(&session, rows()).expect("list");
    }
    assert_eq!(plain.cache().stats().size, 0);
    assert_eq!(plain.cache().stats().misses, 0);

    let criteria = engine(
        Arc::clone(&executor),
        &PlanCacheOptions::default().with_criteria_plan_cache(true),
    );
    for _ in 0..2 {
        let mut query = criteria.create_query(None, orders_by_status()).expect("query");
        query.set_parameter("status", "NEW");
        query.list(&session, rows()).expect("list");
    }
    let stats = criteria.cache().stats();
    assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
}

#[test]
fn enabled_filters_bypass_the_cache() {
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();
    session.enable_filters(true);

    list_by_status(&engine, &session, "NEW");
    list_by_status(&engine, &session, "NEW");
    assert_eq!(engine.cache().stats().size, 0);
    assert_eq!(executor.statements().len(), 2);
}

#[test]
fn graph_semantics_and_opt_out_bypass_the_cache() {
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();

    let mut graphed = engine
        .create_query(Some(BY_STATUS), orders_by_status())
        .expect("query");
    graphed.set_parameter("status", "NEW");
    graphed.options_mut().applied_graph.semantic = Some(GraphSemantic::Fetch);
    graphed.list(&session, rows()).expect("list");

    let mut opted_out = engine
        .create_query(Some(BY_STATUS), orders_by_status())
        .expect("query");
    opted_out
        .set_parameter("status", "NEW")
        .set_query_plan_cacheable(false);
    opted_out.list(&session, rows()).expect("list");

    assert_eq!(engine.cache().stats(), CacheStats {
        capacity: 2048,
        ..CacheStats::default()
    });
}

#[test]
fn multi_valued_bindings_are_never_cached() {
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();

    for values in [vec!["A", "B"], vec!["A", "B", "C"]] {
        let mut query = engine
            .create_query(
                Some("select o from Order o where o.status in :statuses"),
                orders_in_statuses(),
            )
            .expect("query");
        query.set_parameter_list("statuses", values.into_iter().map(Value::from).collect());
        query.list(&session, rows()).expect("list");
    }

    assert_eq!(engine.cache().stats().size, 0);
    let statements = executor.statements();
    assert!(statements[0].ends_with("where t0.status in (?, ?)"));
    assert!(statements[1].ends_with("where t0.status in (?, ?, ?)"));
}

#[test]
fn fetch_profiles_are_part_of_the_key() {
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();

    list_by_status(&engine, &session, "NEW");
    session.enable_fetch_profile("with-tags");
    list_by_status(&engine, &session, "NEW");
    list_by_status(&engine, &session, "NEW");

    let stats = engine.cache().stats();
    assert_eq!((stats.hits, stats.misses, stats.size), (1, 2, 2));
}

#[test]
fn mutation_plans_are_cached_and_bounded() {
    let executor = RecordingExecutor::new();
    let options = PlanCacheOptions::from_toml_str("[plan_cache]\nmax_entries = 1\n").expect("toml");
    let engine = engine(Arc::clone(&executor), &options);
    let session = SessionSpy::default();

    let delete = |text: &str, entity: &str| {
        let statement = Statement::Delete(DeleteStatement {
            target: EntityRoot::new(entity, "e"),
            restriction: None,
        });
        engine
            .create_query(Some(text), statement)
            .expect("query")
            .execute_update(&session)
            .expect("delete")
    };
    delete("delete from Invoice", "Invoice");
    delete("delete from Invoice", "Invoice");
    delete("delete from Player", "Player");
    delete("delete from Invoice", "Invoice");

    let stats = engine.cache().stats();
    assert_eq!((stats.hits, stats.misses), (1, 3));
    assert_eq!((stats.size, stats.capacity), (1, 1));
    assert_eq!(
        executor.statements(),
        vec![
            "update invoices set deleted = true",
            "update invoices set deleted = true",
            "delete from players",
            "update invoices set deleted = true",
        ]
    );
}

#[test]
fn statement_kind_must_match_the_execution() {
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();

    let select = engine
        .create_query(Some(BY_STATUS), orders_by_status())
        .expect("query");
    assert!(select.execute_update(&session).expect_err("select").is_usage());

    let delete = engine
        .create_query(
            Some("delete from Order e"),
            Statement::Delete(DeleteStatement {
                target: EntityRoot::new("Order", "e"),
                restriction: None,
            }),
        )
        .expect("query");
    assert!(delete.list(&session, rows()).expect_err("delete").is_usage());
    assert!(executor.statements().is_empty());
}

#[test]
fn unknown_entities_are_usage_errors() {
    let executor = RecordingExecutor::new();
    let engine = engine(Arc::clone(&executor), &PlanCacheOptions::default());
    let session = SessionSpy::default();
    let query = engine
        .create_query(
            Some("select s from Ship s"),
            Statement::Select(SelectStatement::entity(EntityRoot::new("Ship", "s"))),
        )
        .expect("query");
    let err = query.list(&session, rows()).expect_err("unknown");
    assert!(matches!(err, PlanError::UnknownEntity { ref entity } if entity == "Ship"));
    assert!(err.is_usage());
}
