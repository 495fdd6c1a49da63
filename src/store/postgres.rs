/// PostgreSQL observation store.
///
/// Writes go through a single `INSERT ... ON CONFLICT DO UPDATE` keyed on
/// `(site_id, source, observation_time)`, so a re-run of the same window
/// updates rows in place and concurrent writers of one key leave one row.
/// The table must carry the matching unique constraint; see
/// `sql/weather_observations.sql`.
///
/// Each batch is one transaction on a pooled connection. If the
/// transaction fails, the batch is replayed record by record in autocommit
/// so one bad row only costs itself.
///
/// Every connection carries the run's request timeout: opening one gives up
/// after it, and the server cancels any statement that runs longer.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use postgres::error::SqlState;
use postgres::{Client, Config, GenericClient, NoTls, ToStatement};

use crate::logging::{self, Component};
use crate::model::{Observation, StoreError};
use crate::store::{BatchWrite, DuplicateGroup, DuplicateScan, ObservationSink, RecordFailure};

pub struct PgStore {
    connection: Config,
    timeout: Duration,
    table: String,
    actor: String,
    pool_size: usize,
    idle: Mutex<Vec<Client>>,
    upsert_sql: String,
}

impl PgStore {
    /// Connect and verify the target table is reachable. A failure here is
    /// a setup error for the caller: no run starts against a missing store.
    pub fn connect(
        url: &str,
        table: &str,
        actor: &str,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        validate_table_name(table)?;

        let connection = connection_config(url, timeout)?;
        let mut client = open_connection(&connection, timeout)?;
        client
            .batch_execute(&format!("SELECT 1 FROM {} LIMIT 0", table))
            .map_err(|e| match classify_pg_error(&e) {
                StoreError::Query(reason) => {
                    StoreError::Query(format!("table {} not usable: {}", table, reason))
                }
                other => other,
            })?;

        logging::info(
            Component::System,
            None,
            &format!("Connected to store, table {} verified", table),
        );

        Ok(PgStore {
            connection,
            timeout,
            table: table.to_string(),
            actor: actor.to_string(),
            pool_size: pool_size.max(1),
            idle: Mutex::new(vec![client]),
            upsert_sql: upsert_sql(table),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Client>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take an idle connection, or open a new one.
    fn checkout(&self) -> Result<Client, StoreError> {
        loop {
            let candidate = self.idle().pop();
            match candidate {
                Some(client) if !client.is_closed() => return Ok(client),
                Some(_) => continue,
                None => break,
            }
        }
        open_connection(&self.connection, self.timeout)
    }

    fn checkin(&self, client: Client) {
        if client.is_closed() {
            return;
        }
        let mut idle = self.idle();
        if idle.len() < self.pool_size {
            idle.push(client);
        }
    }

    fn write_record_by_record(&self, mut client: Client, batch: &[Observation]) -> BatchWrite {
        let mut result = BatchWrite::default();

        for (i, observation) in batch.iter().enumerate() {
            if client.is_closed() {
                match self.checkout() {
                    Ok(fresh) => client = fresh,
                    Err(error) => {
                        result.merge(BatchWrite::all_failed(&batch[i..], error));
                        return result;
                    }
                }
            }

            match upsert_one(&mut client, self.upsert_sql.as_str(), &self.actor, observation) {
                Ok(_) => result.written += 1,
                Err(e) => result.failures.push(RecordFailure {
                    key: observation.natural_key(),
                    error: classify_pg_error(&e),
                }),
            }
        }

        self.checkin(client);
        result
    }
}

impl ObservationSink for PgStore {
    fn write_batch(&self, batch: &[Observation]) -> BatchWrite {
        let Some(first) = batch.first() else {
            return BatchWrite::default();
        };

        let mut client = match self.checkout() {
            Ok(client) => client,
            Err(error) => return BatchWrite::all_failed(batch, error),
        };

        match upsert_in_transaction(&mut client, &self.upsert_sql, &self.actor, batch) {
            Ok(()) => {
                self.checkin(client);
                BatchWrite {
                    written: batch.len(),
                    failures: Vec::new(),
                }
            }
            Err(e) => {
                logging::warn(
                    Component::Load,
                    Some(&first.site_id),
                    &format!(
                        "Batch of {} rolled back ({}), retrying record by record",
                        batch.len(),
                        classify_pg_error(&e)
                    ),
                );
                self.write_record_by_record(client, batch)
            }
        }
    }
}

impl DuplicateScan for PgStore {
    fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>, StoreError> {
        let mut client = self.checkout()?;
        let rows = client
            .query(&duplicate_scan_sql(&self.table), &[])
            .map_err(|e| classify_pg_error(&e))?;
        self.checkin(client);

        Ok(rows
            .iter()
            .map(|row| DuplicateGroup {
                site_id: row.get("site_id"),
                source: row.get("source"),
                observation_time: row.get("observation_time"),
                count: row.get("cnt"),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Parse the database URL and attach the timeouts. Options already present
/// in the URL are kept.
fn connection_config(url: &str, timeout: Duration) -> Result<Config, StoreError> {
    let mut config: Config = url
        .parse()
        .map_err(|e| StoreError::Connection(format!("invalid database url: {}", e)))?;

    let statement_timeout = format!("-c statement_timeout={}", timeout.as_millis());
    let options = match config.get_options() {
        Some(existing) if !existing.trim().is_empty() => {
            format!("{} {}", existing, statement_timeout)
        }
        _ => statement_timeout,
    };
    config.connect_timeout(timeout).options(&options);
    Ok(config)
}

/// Open one connection, giving up after `timeout`.
///
/// The driver's connect timeout stops at the TCP handshake, so a server that
/// accepts and then goes silent would block forever. The connect runs on its
/// own thread and is abandoned on timeout; that thread ends when the peer
/// closes.
fn open_connection(config: &Config, timeout: Duration) -> Result<Client, StoreError> {
    let (tx, rx) = mpsc::channel();
    let config = config.clone();
    thread::Builder::new()
        .name("pg-connect".to_string())
        .spawn(move || {
            let _ = tx.send(config.connect(NoTls));
        })
        .map_err(|e| StoreError::Connection(format!("could not start connect thread: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result.map_err(|e| classify_pg_error(&e)),
        Err(RecvTimeoutError::Timeout) => Err(StoreError::Connection(format!(
            "no answer from database within {}ms",
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(StoreError::Connection("connect thread exited without a result".to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {t} (
            site_id, source, observation_time, fetch_time,
            temp_c, humidity_pct, pressure_hpa, weather_description,
            raw_payload, ingestion_run_id,
            audit_created_by, audit_created_dttm, audit_updated_by, audit_updated_dttm
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, clock_timestamp(), $11, clock_timestamp())
        ON CONFLICT (site_id, source, observation_time) DO UPDATE SET
            fetch_time = EXCLUDED.fetch_time,
            temp_c = EXCLUDED.temp_c,
            humidity_pct = EXCLUDED.humidity_pct,
            pressure_hpa = EXCLUDED.pressure_hpa,
            weather_description = EXCLUDED.weather_description,
            raw_payload = EXCLUDED.raw_payload,
            ingestion_run_id = EXCLUDED.ingestion_run_id,
            audit_updated_by = EXCLUDED.audit_updated_by,
            audit_updated_dttm = GREATEST(
                clock_timestamp(),
                {t}.audit_updated_dttm + INTERVAL '1 microsecond'
            )",
        t = table
    )
}

fn duplicate_scan_sql(table: &str) -> String {
    format!(
        "SELECT site_id, source, observation_time, COUNT(*) AS cnt
         FROM {}
         GROUP BY site_id, source, observation_time
         HAVING COUNT(*) > 1
         ORDER BY cnt DESC, site_id, observation_time",
        table
    )
}

fn upsert_one<C, S>(
    client: &mut C,
    statement: &S,
    actor: &str,
    obs: &Observation,
) -> Result<u64, postgres::Error>
where
    C: GenericClient,
    S: ToStatement + ?Sized,
{
    let run_id = obs.ingestion_run_id.to_string();
    client.execute(
        statement,
        &[
            &obs.site_id,
            &obs.source,
            &obs.observation_time,
            &obs.fetch_time,
            &obs.temp_c,
            &obs.humidity_pct,
            &obs.pressure_hpa,
            &obs.weather_description,
            &*obs.raw_payload,
            &run_id,
            &actor,
        ],
    )
}

fn upsert_in_transaction(
    client: &mut Client,
    sql: &str,
    actor: &str,
    batch: &[Observation],
) -> Result<(), postgres::Error> {
    // Rows are locked in key order so overlapping batches cannot deadlock.
    let mut ordered: Vec<&Observation> = batch.iter().collect();
    ordered.sort_by(|a, b| {
        (&a.site_id, &a.source, a.observation_time)
            .cmp(&(&b.site_id, &b.source, b.observation_time))
    });

    let mut tx = client.transaction()?;
    let statement = tx.prepare(sql)?;
    for obs in ordered {
        upsert_one(&mut tx, &statement, actor, obs)?;
    }
    tx.commit()
}

/// Table names are interpolated into SQL, so only plain (optionally
/// schema-qualified) identifiers are accepted.
pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(StoreError::Query(format!("invalid table name '{}'", table)))
    }
}

/// Map a driver error onto the store failure taxonomy.
pub fn classify_pg_error(err: &postgres::Error) -> StoreError {
    let message = err.to_string();

    if let Some(code) = err.code() {
        if *code == SqlState::T_R_SERIALIZATION_FAILURE
            || *code == SqlState::T_R_DEADLOCK_DETECTED
        {
            return StoreError::Serialization(message);
        }
        return match code.code().get(..2) {
            Some("23") => StoreError::Constraint(message),
            Some("08") | Some("57") => StoreError::Connection(message),
            _ => StoreError::Query(message),
        };
    }

    if err.is_closed() {
        return StoreError::Connection(message);
    }

    let io_source = std::error::Error::source(err).is_some_and(|s| s.is::<std::io::Error>());
    if io_source {
        StoreError::Connection(message)
    } else {
        // No server code and no socket failure: a parameter failed to encode.
        StoreError::Serialization(message)
    }
}
