/// PostgreSQL store tests
///
/// These verify the loader's guarantees against a real database:
/// 1. Loading the same observation twice leaves one row with a newer update time
/// 2. Concurrent upserts of one key leave one row holding one whole write
/// 3. A bad record in a batch fails alone
/// 4. The duplicate scan finds rows that bypassed the unique constraint
///
/// Prerequisites:
/// - PostgreSQL running and DATABASE_URL set (in the environment or .env)
/// - The role may create and drop tables in its default schema
///
/// Run with: cargo test --test postgres_store -- --ignored --test-threads=1
///
/// Each test works on its own scratch table cloned from
/// `sql/weather_observations.sql`, and drops it afterwards.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use postgres::{Client, NoTls};
use rust_decimal::Decimal;
use uuid::Uuid;

use weather_etl::audit::{self, AuditVerdict};
use weather_etl::model::{Observation, StoreError};
use weather_etl::store::ObservationSink;
use weather_etl::store::postgres::PgStore;

const SCHEMA: &str = include_str!("../sql/weather_observations.sql");
const TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn database_url() -> String {
    dotenv::dotenv().ok();
    std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for PostgreSQL tests")
}

/// Creates `name` shaped like the canonical table. With `unique = false`
/// the natural-key constraint is left off, simulating a weakened schema.
fn scratch_table(name: &str, unique: bool) -> Client {
    let mut client =
        Client::connect(&database_url(), NoTls).expect("Failed to connect to test database");
    client.batch_execute(SCHEMA).expect("canonical schema applies");

    let including = if unique { "INCLUDING ALL" } else { "INCLUDING DEFAULTS" };
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {name}; CREATE TABLE {name} (LIKE weather_observations {including});"
        ))
        .expect("scratch table created");
    client
}

fn drop_table(client: &mut Client, name: &str) {
    let _ = client.batch_execute(&format!("DROP TABLE IF EXISTS {}", name));
}

fn observation_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 1, 12, 0, 0).unwrap()
}

fn observation(site: &str, humidity: i16) -> Observation {
    Observation {
        site_id: site.to_string(),
        source: "open-meteo-archive".to_string(),
        observation_time: observation_time(),
        fetch_time: Utc::now(),
        temp_c: Some(Decimal::new(1842, 2)),
        humidity_pct: Some(humidity),
        pressure_hpa: Some(1013),
        weather_description: Some("Clear sky".to_string()),
        raw_payload: Arc::new(serde_json::json!({"hourly": {"time": ["2025-10-01T12:00"]}})),
        ingestion_run_id: Uuid::new_v4(),
        flags: Vec::new(),
    }
}

fn row_count(client: &mut Client, table: &str) -> i64 {
    client
        .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .expect("count query")
        .get(0)
}

fn updated_at(client: &mut Client, table: &str, site: &str) -> DateTime<Utc> {
    client
        .query_one(
            &format!("SELECT audit_updated_dttm FROM {} WHERE site_id = $1", table),
            &[&site],
        )
        .expect("row exists")
        .get(0)
}

// ---------------------------------------------------------------------------
// Upsert guarantees
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn test_repeat_load_updates_in_place() {
    let table = "test_obs_idempotence";
    let mut client = scratch_table(table, true);
    let store = PgStore::connect(&database_url(), table, "etl_test", 2, TIMEOUT)
        .expect("store connects");

    let record = observation("ba-01", 60);
    assert_eq!(store.write_batch(std::slice::from_ref(&record)).written, 1);
    let first = updated_at(&mut client, table, "ba-01");

    let mut again = record.clone();
    again.ingestion_run_id = Uuid::new_v4();
    assert_eq!(store.write_batch(&[again.clone()]).written, 1);
    let second = updated_at(&mut client, table, "ba-01");

    assert_eq!(row_count(&mut client, table), 1);
    assert!(second > first, "audit_updated_dttm must strictly increase");

    let row = client
        .query_one(
            &format!(
                "SELECT ingestion_run_id, audit_created_dttm <= audit_updated_dttm FROM {}",
                table
            ),
            &[],
        )
        .unwrap();
    let run_id: String = row.get(0);
    let ordered: bool = row.get(1);
    assert_eq!(run_id, again.ingestion_run_id.to_string());
    assert!(ordered);

    drop_table(&mut client, table);
}

#[test]
#[ignore]
fn test_concurrent_upserts_leave_one_row() {
    let table = "test_obs_concurrent";
    let mut client = scratch_table(table, true);
    let store = PgStore::connect(&database_url(), table, "etl_test", 8, TIMEOUT)
        .expect("store connects");
    let store = Arc::new(store);

    thread::scope(|scope| {
        for i in 0..8i16 {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                let mut record = observation("cba-01", 10 + i);
                record.pressure_hpa = Some(1000 + i as i32);
                let write = store.write_batch(&[record]);
                assert!(write.failures.is_empty(), "upsert failed: {:?}", write.failures);
            });
        }
    });

    assert_eq!(row_count(&mut client, table), 1);
    let row = client
        .query_one(&format!("SELECT humidity_pct, pressure_hpa FROM {}", table), &[])
        .unwrap();
    let humidity: i16 = row.get(0);
    let pressure: i32 = row.get(1);
    assert_eq!(pressure - 1000, (humidity - 10) as i32, "fields must come from a single write");

    drop_table(&mut client, table);
}

#[test]
#[ignore]
fn test_bad_record_fails_alone() {
    let table = "test_obs_fallback";
    let mut client = scratch_table(table, true);
    let store = PgStore::connect(&database_url(), table, "etl_test", 2, TIMEOUT)
        .expect("store connects");

    let good_a = observation("a", 50);
    let bad = observation("b", 150); // violates the humidity CHECK
    let good_c = observation("c", 55);

    let write = store.write_batch(&[good_a, bad, good_c]);

    assert_eq!(write.written, 2);
    assert_eq!(write.failures.len(), 1);
    assert_eq!(write.failures[0].key.site_id, "b");
    assert!(matches!(write.failures[0].error, StoreError::Constraint(_)));
    assert_eq!(row_count(&mut client, table), 2);

    drop_table(&mut client, table);
}

#[test]
#[ignore]
fn test_connect_rejects_missing_table() {
    let missing = "test_obs_does_not_exist";
    let result = PgStore::connect(&database_url(), missing, "etl_test", 1, TIMEOUT);
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Duplicate scan
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn test_auditor_finds_rows_that_bypassed_the_constraint() {
    let table = "test_obs_no_unique";
    let mut client = scratch_table(table, false);

    let clean = PgStore::connect(&database_url(), table, "etl_test", 1, TIMEOUT)
        .expect("store connects");
    assert_eq!(audit::audit(&clean).unwrap(), AuditVerdict::Pass);

    let insert = format!(
        "INSERT INTO {} (site_id, source, observation_time, fetch_time, raw_payload,
                         ingestion_run_id, audit_created_by, audit_updated_by)
         VALUES ('1', 'x', $1, now(), '{{}}'::jsonb, 'manual', 'test', 'test')",
        table
    );
    let when = observation_time();
    client.execute(&insert, &[&when]).unwrap();
    client.execute(&insert, &[&when]).unwrap();

    let verdict = audit::audit(&clean).unwrap();
    match &verdict {
        AuditVerdict::Fail(groups) => {
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].site_id, "1");
            assert_eq!(groups[0].source, "x");
            assert_eq!(groups[0].observation_time, when);
            assert_eq!(groups[0].count, 2);
        }
        AuditVerdict::Pass => panic!("duplicates not detected"),
    }
    assert_eq!(verdict.exit_code(), 2);

    drop_table(&mut client, table);
}
