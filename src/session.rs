//! Transactional sessions
//!
//! A [`TransactionalSession`] wraps one open transaction. Statements issued
//! through it run immediately inside that transaction; the first failure
//! poisons the session so that `commit` rolls back and reports it. `commit`
//! and `abort` consume the session, so it is finished exactly once.

use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StorageError, has_code};
use crate::transform::{SqlValue, bind_all};

/// An open transaction shared by every operation that receives it
pub struct TransactionalSession {
    state: Mutex<SessionState>,
}

struct SessionState {
    tx: Option<Transaction<'static, Postgres>>,
    failure: Option<String>,
}

impl TransactionalSession {
    pub(crate) async fn begin(pool: &PgPool) -> Result<Self> {
        let tx = pool.begin().await?;
        debug!("Transactional session started");
        Ok(Self {
            state: Mutex::new(SessionState {
                tx: Some(tx),
                failure: None,
            }),
        })
    }

    /// Whether a statement inside this session has failed
    pub async fn is_poisoned(&self) -> bool {
        self.state.lock().await.failure.is_some()
    }

    /// Commit every statement issued through the session.
    ///
    /// A poisoned session is rolled back instead and the original failure
    /// is reported.
    pub async fn commit(self) -> Result<()> {
        let mut state = self.state.into_inner();
        let tx = state.tx.take().ok_or(StorageError::SessionClosed)?;
        if let Some(failure) = state.failure.take() {
            tx.rollback().await?;
            warn!(error = %failure, "Rolled back poisoned session");
            return Err(StorageError::internal(format!(
                "transaction rolled back: {}",
                failure
            )));
        }
        tx.commit().await?;
        debug!("Transactional session committed");
        Ok(())
    }

    /// Roll back every statement issued through the session
    pub async fn abort(self) -> Result<()> {
        let mut state = self.state.into_inner();
        let tx = state.tx.take().ok_or(StorageError::SessionClosed)?;
        tx.rollback().await?;
        debug!("Transactional session aborted");
        Ok(())
    }
}

impl SessionState {
    fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        if let Some(failure) = &self.failure {
            return Err(StorageError::internal(format!(
                "transaction already failed: {}",
                failure
            )));
        }
        self.tx.as_mut().ok_or(StorageError::SessionClosed)
    }

    /// Poison the session on failure
    fn record<T>(&mut self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|e| {
            self.failure = Some(e.to_string());
            e.into()
        })
    }
}

/// Where a statement runs: straight on the pool, or inside a session
#[derive(Clone, Copy)]
pub(crate) enum Executor<'a> {
    Pool(&'a PgPool),
    Session(&'a TransactionalSession),
}

impl<'a> Executor<'a> {
    pub(crate) fn new(pool: &'a PgPool, session: Option<&'a TransactionalSession>) -> Self {
        match session {
            Some(session) => Executor::Session(session),
            None => Executor::Pool(pool),
        }
    }

    pub(crate) async fn fetch_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<PgRow>> {
        match self {
            Executor::Pool(pool) => Ok(bind_all(sqlx::query(sql), params).fetch_all(*pool).await?),
            Executor::Session(session) => {
                let mut state = session.state.lock().await;
                let tx = state.transaction()?;
                let result = bind_all(sqlx::query(sql), params).fetch_all(&mut **tx).await;
                state.record(result)
            }
        }
    }

    /// Like [`Executor::fetch_all`], but a failure carrying one of
    /// `tolerated` codes leaves a session usable. Inside a session the
    /// statement runs in a savepoint that is rolled back on failure.
    pub(crate) async fn fetch_all_tolerating(
        &self,
        sql: &str,
        params: &[SqlValue],
        tolerated: &[&str],
    ) -> Result<Vec<PgRow>> {
        match self {
            Executor::Pool(_) => self.fetch_all(sql, params).await,
            Executor::Session(session) => {
                let mut state = session.state.lock().await;
                let tx = state.transaction()?;
                match fetch_in_savepoint(&mut **tx, sql, params).await {
                    Err(e) if tolerated.iter().any(|code| has_code(&e, code)) => {
                        debug!(error = %e, "Tolerated failure rolled back to savepoint");
                        Err(e.into())
                    }
                    result => state.record(result),
                }
            }
        }
    }

    pub(crate) async fn fetch_optional(&self, sql: &str, params: &[SqlValue]) -> Result<Option<PgRow>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    /// Run a statement, returning the number of affected rows
    pub(crate) async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self {
            Executor::Pool(pool) => Ok(bind_all(sqlx::query(sql), params)
                .execute(*pool)
                .await?
                .rows_affected()),
            Executor::Session(session) => {
                let mut state = session.state.lock().await;
                let tx = state.transaction()?;
                let result = bind_all(sqlx::query(sql), params)
                    .execute(&mut **tx)
                    .await
                    .map(|done| done.rows_affected());
                state.record(result)
            }
        }
    }
}

async fn fetch_in_savepoint(
    conn: &mut PgConnection,
    sql: &str,
    params: &[SqlValue],
) -> std::result::Result<Vec<PgRow>, sqlx::Error> {
    let mut savepoint = Connection::begin(conn).await?;
    match bind_all(sqlx::query(sql), params).fetch_all(&mut *savepoint).await {
        Ok(rows) => {
            savepoint.commit().await?;
            Ok(rows)
        }
        Err(e) => {
            savepoint.rollback().await?;
            Err(e)
        }
    }
}
