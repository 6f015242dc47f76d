use super::entity::{iface_stats, quota_state, to_db, uid_sim_stats, uid_stats};
use super::{PersistenceGateway, RowFilter, StatsTable};
use crate::error::{Result, StatsError};
use crate::model::{ClassificationFlag, TrafficSample};
use crate::quota::NotifyState;
use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Expr, OnConflict};
use sea_orm::*;
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};

const SCHEMA_VERSION: i64 = 1;

/// Rows per INSERT, kept well under SQLite's bound-variable limit.
const INSERT_CHUNK: usize = 500;

const CREATE_VERSION_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS version (
        id INTEGER PRIMARY KEY NOT NULL,
        version INTEGER NOT NULL
    )
"#;

const CREATE_TABLES_SQL: [&str; 7] = [
    r#"
    CREATE TABLE IF NOT EXISTS uid_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid INTEGER NOT NULL,
        iface TEXT NOT NULL,
        ident TEXT NOT NULL DEFAULT '',
        date INTEGER NOT NULL,
        rx_bytes INTEGER NOT NULL,
        rx_packets INTEGER NOT NULL,
        tx_bytes INTEGER NOT NULL,
        tx_packets INTEGER NOT NULL,
        flag INTEGER NOT NULL DEFAULT 0,
        user_id INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS uid_sim_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid INTEGER NOT NULL,
        iface TEXT NOT NULL,
        ident TEXT NOT NULL DEFAULT '',
        date INTEGER NOT NULL,
        rx_bytes INTEGER NOT NULL,
        rx_packets INTEGER NOT NULL,
        tx_bytes INTEGER NOT NULL,
        tx_packets INTEGER NOT NULL,
        flag INTEGER NOT NULL DEFAULT 0,
        user_id INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS iface_stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        iface TEXT NOT NULL,
        ident TEXT NOT NULL DEFAULT '',
        date INTEGER NOT NULL,
        rx_bytes INTEGER NOT NULL,
        rx_packets INTEGER NOT NULL,
        tx_bytes INTEGER NOT NULL,
        tx_packets INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS quota_state (
        sim_id INTEGER PRIMARY KEY NOT NULL,
        last_alert_time INTEGER NOT NULL DEFAULT 0,
        last_monthly_notify_time INTEGER NOT NULL DEFAULT 0,
        last_daily_notify_time INTEGER NOT NULL DEFAULT 0,
        limit_armed BOOLEAN NOT NULL DEFAULT 0,
        monthly_mark_armed BOOLEAN NOT NULL DEFAULT 0,
        daily_mark_armed BOOLEAN NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_uid_stats_uid_date ON uid_stats (uid, date)",
    "CREATE INDEX IF NOT EXISTS idx_uid_sim_stats_uid_date ON uid_sim_stats (uid, date)",
    "CREATE INDEX IF NOT EXISTS idx_iface_stats_iface_date ON iface_stats (iface, date)",
];

/// Expands `$body` for the entity module of `$table`, bound to `$entity`.
macro_rules! per_table {
    ($table:expr, $entity:ident => $body:expr) => {
        match $table {
            StatsTable::Uid => {
                use uid_stats as $entity;
                $body
            }
            StatsTable::UidSim => {
                use uid_sim_stats as $entity;
                $body
            }
            StatsTable::Iface => {
                use iface_stats as $entity;
                $body
            }
        }
    };
}

/// Row store on a SQLite file, with a crash-recovery copy next to it.
pub struct SqliteGateway {
    db: DatabaseConnection,
    path: PathBuf,
}

impl SqliteGateway {
    /// Opens `database_path`, falling back to the backup copy when the primary
    /// cannot be opened or fails its integrity check.
    #[instrument(skip(database_path, backup_path))]
    pub async fn open<P: AsRef<Path>>(database_path: P, backup_path: P) -> Result<Self> {
        let database_path = database_path.as_ref();
        let backup_path = backup_path.as_ref();

        let db = match Self::connect(database_path).await {
            Ok(db) => db,
            Err(err) if backup_path.exists() => {
                warn!(
                    "Primary database {} unusable ({}), restoring from {}",
                    database_path.display(),
                    err,
                    backup_path.display()
                );
                remove_journal_files(database_path).await;
                tokio::fs::copy(backup_path, database_path).await?;
                Self::connect(database_path).await?
            }
            Err(err) => return Err(err),
        };

        info!("Connected to SQLite database: {}", database_path.display());
        Ok(Self {
            db,
            path: database_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(self) -> Result<()> {
        self.db.close().await?;
        Ok(())
    }

    async fn connect(database_path: &Path) -> Result<DatabaseConnection> {
        if let Some(parent) = database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", database_path.display());
        let db = Database::connect(&database_url).await?;
        let backend = db.get_database_backend();

        let check = db
            .query_one(Statement::from_string(backend, "PRAGMA quick_check".to_string()))
            .await?;
        let status: String = match check {
            Some(row) => row.try_get_by_index(0).map_err(DbErr::from)?,
            None => String::new(),
        };
        if status != "ok" {
            return Err(StatsError::Io(format!(
                "integrity check of {} failed: {}",
                database_path.display(),
                status
            )));
        }

        Self::init_schema(&db).await?;
        Ok(db)
    }

    async fn init_schema(db: &DatabaseConnection) -> Result<()> {
        let backend = db.get_database_backend();
        db.execute(Statement::from_string(backend, CREATE_VERSION_SQL.to_string()))
            .await?;

        let stored = db
            .query_one(Statement::from_string(
                backend,
                "SELECT version FROM version WHERE id = 1".to_string(),
            ))
            .await?
            .map(|row| row.try_get_by_index::<i64>(0))
            .transpose()
            .map_err(DbErr::from)?;

        for sql in CREATE_TABLES_SQL {
            db.execute(Statement::from_string(backend, sql.to_string())).await?;
        }

        if let Some(version) = stored
            && version > SCHEMA_VERSION
        {
            return Err(StatsError::state(format!(
                "database schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        db.execute(Statement::from_sql_and_values(
            backend,
            "INSERT INTO version (id, version) VALUES (1, ?) ON CONFLICT(id) DO UPDATE SET version = excluded.version",
            [SCHEMA_VERSION.into()],
        ))
        .await?;
        Ok(())
    }
}

async fn remove_journal_files(database_path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut journal = database_path.as_os_str().to_owned();
        journal.push(suffix);
        let _ = tokio::fs::remove_file(PathBuf::from(journal)).await;
    }
}

async fn copy_atomically(source: &Path, backup: &Path) -> std::io::Result<()> {
    if let Some(parent) = backup.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = backup.with_extension("tmp");
    tokio::fs::copy(source, &staging).await?;
    tokio::fs::rename(&staging, backup).await
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    #[instrument(skip(self, rows), fields(table = table.name(), rows = rows.len()))]
    async fn write_rows(&self, table: StatsTable, rows: &[TrafficSample]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin().await?;
        per_table!(table, stats => {
            for chunk in rows.chunks(INSERT_CHUNK) {
                stats::Entity::insert_many(chunk.iter().map(stats::ActiveModel::from))
                    .exec(&txn)
                    .await?;
            }
        });
        txn.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(table = table.name()))]
    async fn delete_older_than(&self, table: StatsTable, cutoff: u64) -> Result<()> {
        let result = per_table!(table, stats => {
            stats::Entity::delete_many()
                .filter(stats::Column::Date.lt(to_db(cutoff)))
                .exec(&self.db)
                .await?
        });
        if result.rows_affected > 0 {
            info!("Deleted {} expired rows from {}", result.rows_affected, table.name());
        }
        Ok(())
    }

    async fn backup(&self, source: &Path, backup: &Path) -> bool {
        if let Err(err) = self
            .db
            .execute(Statement::from_string(
                self.db.get_database_backend(),
                "PRAGMA wal_checkpoint(TRUNCATE)".to_string(),
            ))
            .await
        {
            warn!("WAL checkpoint before backup failed: {}", err);
        }

        match copy_atomically(source, backup).await {
            Ok(()) => {
                info!("Backed up {} to {}", source.display(), backup.display());
                true
            }
            Err(err) => {
                error!(
                    "Backup of {} to {} failed: {}",
                    source.display(),
                    backup.display(),
                    err
                );
                false
            }
        }
    }

    async fn query_rows(&self, table: StatsTable, filter: &RowFilter) -> Result<Vec<TrafficSample>> {
        let uid = filter.uid.filter(|_| table != StatsTable::Iface);
        let rows: Vec<TrafficSample> = per_table!(table, stats => {
            stats::Entity::find()
                .filter(stats::Column::Date.gte(to_db(filter.start)))
                .filter(stats::Column::Date.lte(to_db(filter.end)))
                .apply_if(uid, |query, uid| {
                    query.filter(Expr::col(Alias::new("uid")).eq(i64::from(uid)))
                })
                .apply_if(filter.iface.clone(), |query, iface| {
                    query.filter(stats::Column::Iface.eq(iface))
                })
                .apply_if(filter.ident.clone(), |query, ident| {
                    query.filter(stats::Column::Ident.eq(ident))
                })
                .order_by_asc(stats::Column::Date)
                .all(&self.db)
                .await?
                .into_iter()
                .map(TrafficSample::from)
                .collect()
        });
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn update_uid_flag(&self, uid: u32, flag: ClassificationFlag) -> Result<()> {
        uid_stats::Entity::update_many()
            .col_expr(uid_stats::Column::Flag, Expr::value(flag.as_i32()))
            .filter(uid_stats::Column::Uid.eq(i64::from(uid)))
            .exec(&self.db)
            .await?;
        uid_sim_stats::Entity::update_many()
            .col_expr(uid_sim_stats::Column::Flag, Expr::value(flag.as_i32()))
            .filter(uid_sim_stats::Column::Uid.eq(i64::from(uid)))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_flag(&self, from: ClassificationFlag, to: ClassificationFlag) -> Result<()> {
        uid_sim_stats::Entity::update_many()
            .col_expr(uid_sim_stats::Column::Flag, Expr::value(to.as_i32()))
            .filter(uid_sim_stats::Column::Flag.eq(from.as_i32()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear_all(&self) -> Result<()> {
        for table in StatsTable::ALL {
            per_table!(table, stats => {
                stats::Entity::delete_many().exec(&self.db).await?;
            });
        }
        quota_state::Entity::delete_many().exec(&self.db).await?;
        info!("Cleared all stats tables");
        Ok(())
    }

    async fn load_notify_state(&self, sim_id: u32) -> Result<Option<NotifyState>> {
        let model = quota_state::Entity::find_by_id(i64::from(sim_id))
            .one(&self.db)
            .await?;
        Ok(model.map(NotifyState::from))
    }

    async fn save_notify_state(&self, state: &NotifyState) -> Result<()> {
        let model = quota_state::ActiveModel {
            sim_id: Set(i64::from(state.sim_id)),
            last_alert_time: Set(to_db(state.last_alert_time)),
            last_monthly_notify_time: Set(to_db(state.last_monthly_notify_time)),
            last_daily_notify_time: Set(to_db(state.last_daily_notify_time)),
            limit_armed: Set(state.limit_armed),
            monthly_mark_armed: Set(state.monthly_mark_armed),
            daily_mark_armed: Set(state.daily_mark_armed),
        };
        quota_state::Entity::insert(model)
            .on_conflict(
                OnConflict::column(quota_state::Column::SimId)
                    .update_columns([
                        quota_state::Column::LastAlertTime,
                        quota_state::Column::LastMonthlyNotifyTime,
                        quota_state::Column::LastDailyNotifyTime,
                        quota_state::Column::LimitArmed,
                        quota_state::Column::MonthlyMarkArmed,
                        quota_state::Column::DailyMarkArmed,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
