#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use ormplan::model::{CollectionTableMapping, EntityDescriptor, InMemoryMappingModel};
use ormplan::query::{
    BulkOperationCleanup, CompiledOperation, InlineIdStrategy, SessionContext, StatementExecutor,
};
use ormplan::types::{PlanError, Result, Row, Value};
use ormplan::{PlanCacheOptions, QueryEngine};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ormplan=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// One statement seen by [`RecordingExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub sql: String,
    pub parameters: Vec<Value>,
}

/// Executor that records statements and answers from scripted results.
#[derive(Default)]
pub struct RecordingExecutor {
    executed: Mutex<Vec<Executed>>,
    // (sql fragment, rows) pairs; the first fragment contained in the SQL wins.
    rows: Mutex<Vec<(String, Vec<Row>)>>,
    counts: Mutex<Vec<(String, u64)>>,
    failing: Mutex<Option<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer_rows(&self, fragment: &str, rows: Vec<Row>) {
        self.rows.lock().push((fragment.to_owned(), rows));
    }

    pub fn answer_count(&self, fragment: &str, count: u64) {
        self.counts.lock().push((fragment.to_owned(), count));
    }

    pub fn fail_on(&self, fragment: &str) {
        *self.failing.lock() = Some(fragment.to_owned());
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed.lock().iter().map(|e| e.sql.clone()).collect()
    }

    pub fn clear(&self) {
        self.executed.lock().clear();
    }

    fn record(&self, operation: &CompiledOperation, parameters: &[Value]) -> Result<()> {
        self.executed.lock().push(Executed {
            sql: operation.sql.to_string(),
            parameters: parameters.to_vec(),
        });
        if let Some(fragment) = self.failing.lock().as_deref() {
            if operation.sql.contains(fragment) {
                return Err(PlanError::execution(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("scripted failure for {}", operation.sql),
                )));
            }
        }
        Ok(())
    }
}

impl StatementExecutor for RecordingExecutor {
    fn execute_update(&self, operation: &CompiledOperation, parameters: &[Value]) -> Result<u64> {
        self.record(operation, parameters)?;
        let counts = self.counts.lock();
        Ok(counts
            .iter()
            .find(|(fragment, _)| operation.sql.contains(fragment.as_str()))
            .map(|(_, count)| *count)
            .unwrap_or(1))
    }

    fn execute_query(
        &self,
        operation: &CompiledOperation,
        parameters: &[Value],
        consumer: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()> {
        self.record(operation, parameters)?;
        let rows = self
            .rows
            .lock()
            .iter()
            .find(|(fragment, _)| operation.sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        for row in rows {
            consumer(row)?;
        }
        Ok(())
    }
}

/// Session recording cleanup requests.
#[derive(Default)]
pub struct SessionSpy {
    cleanups: Mutex<Vec<BulkOperationCleanup>>,
    filters: AtomicBool,
    profiles: Mutex<Vec<Arc<str>>>,
}

impl SessionSpy {
    pub fn cleanups(&self) -> Vec<BulkOperationCleanup> {
        self.cleanups.lock().clone()
    }

    pub fn enable_filters(&self, enabled: bool) {
        self.filters.store(enabled, Ordering::SeqCst);
    }

    pub fn enable_fetch_profile(&self, name: &str) {
        self.profiles.lock().push(Arc::from(name));
    }
}

impl SessionContext for SessionSpy {
    fn schedule_bulk_cleanup(&self, cleanup: BulkOperationCleanup) {
        self.cleanups.lock().push(cleanup);
    }

    fn has_enabled_filters(&self) -> bool {
        self.filters.load(Ordering::SeqCst)
    }

    fn enabled_fetch_profiles(&self) -> Vec<Arc<str>> {
        self.profiles.lock().clone()
    }
}

/// Model used across the integration tests.
///
/// - `Order`: `orders` with tag and note collection tables.
/// - `Invoice`: soft-deleted through `deleted`.
/// - `Account`: `accounts` plus `account_limits`, handled by [`InlineIdStrategy`].
/// - `Wallet`: `wallets` plus `wallet_limits`, soft-deleted through `closed`.
/// - `Profile`: `profiles` plus `profile_details`, with no declared strategy.
/// - `Vehicle`: hierarchy over `Car` and `Truck`.
/// - `Player`: `players`, used for keyed pages.
pub fn model() -> InMemoryMappingModel {
    let order = EntityDescriptor::builder("Order", "orders", &["id"])
        .id("id", "id")
        .attribute("status", 0, "status")
        .attribute("total", 0, "total")
        .collection_table(CollectionTableMapping {
            attribute: Arc::from("tags"),
            table: Arc::from("order_tags"),
            key_columns: vec![Arc::from("order_id")],
            owner_key_columns: vec![Arc::from("id")],
            base_restriction: None,
        })
        .build()
        .expect("order");
    let invoice = EntityDescriptor::builder("Invoice", "invoices", &["id"])
        .id("id", "id")
        .attribute("status", 0, "status")
        .soft_delete("deleted", Value::Bool(true))
        .build()
        .expect("invoice");
    let account = EntityDescriptor::builder("Account", "accounts", &["id"])
        .id("id", "id")
        .attribute("owner", 0, "owner")
        .secondary_table("account_limits", &["account_id"])
        .attribute("daily_limit", 1, "daily_limit")
        .multi_table_strategy(Arc::new(InlineIdStrategy))
        .build()
        .expect("account");
    let wallet = EntityDescriptor::builder("Wallet", "wallets", &["id"])
        .id("id", "id")
        .attribute("owner", 0, "owner")
        .secondary_table("wallet_limits", &["wallet_id"])
        .attribute("daily_limit", 1, "daily_limit")
        .soft_delete("closed", Value::Bool(true))
        .multi_table_strategy(Arc::new(InlineIdStrategy))
        .build()
        .expect("wallet");
    let profile = EntityDescriptor::builder("Profile", "profiles", &["id"])
        .id("id", "id")
        .attribute("owner", 0, "owner")
        .secondary_table("profile_details", &["profile_id"])
        .attribute("bio", 1, "bio")
        .build()
        .expect("profile");
    let car = EntityDescriptor::builder("Car", "cars", &["id"])
        .id("id", "id")
        .attribute("wheels", 0, "wheels")
        .build()
        .expect("car");
    let truck = EntityDescriptor::builder("Truck", "trucks", &["id"])
        .id("id", "id")
        .attribute("wheels", 0, "wheels")
        .build()
        .expect("truck");
    let player = EntityDescriptor::builder("Player", "players", &["id"])
        .id("id", "id")
        .attribute("score", 0, "score")
        .attribute("name", 0, "name")
        .build()
        .expect("player");
    InMemoryMappingModel::new()
        .with_entity(order)
        .with_entity(invoice)
        .with_entity(account)
        .with_entity(wallet)
        .with_entity(profile)
        .with_entity(car)
        .with_entity(truck)
        .with_entity(player)
        .with_hierarchy("Vehicle", &["Car", "Truck"])
}

pub fn engine(executor: Arc<RecordingExecutor>, options: &PlanCacheOptions) -> QueryEngine {
    QueryEngine::standard(Arc::new(model()), executor, options)
}
