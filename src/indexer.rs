//! Per-day index lifecycle: creates today's indices synchronously at
//! startup, paces tomorrow's index creation 10s apart in the background,
//! and creates per-database indices on demand as processors are created
//! (spec.md section 4.6).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use mongodb::bson::{doc, Document};
use mongodb::options::IndexOptions;
use mongodb::IndexModel;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::messages::IndexerNotice;
use crate::processor::database_name;
use crate::storage::{with_retry, RetryPolicy, ShardClients};
use crate::stream_registry::StreamRegistry;

pub struct Indexer {
    shards: ShardClients,
    streams: Arc<StreamRegistry>,
    inbox: mpsc::Receiver<IndexerNotice>,
    known_databases: HashSet<String>,
    today: NaiveDate,
    tomorrow: NaiveDate,
    ticks: u64,
}

impl Indexer {
    pub fn new(
        shards: ShardClients,
        streams: Arc<StreamRegistry>,
        inbox: mpsc::Receiver<IndexerNotice>,
    ) -> Self {
        let today = Utc::now().date_naive();
        Self {
            shards,
            streams,
            inbox,
            known_databases: HashSet::new(),
            today,
            tomorrow: today + ChronoDuration::days(1),
            ticks: 0,
        }
    }

    /// Synchronously creates today's indices for every configured stream
    /// before the caller signals readiness, then spawns the background
    /// worker that pre-creates tomorrow's.
    pub async fn startup(&mut self) {
        let today = self.today.format("%Y-%m-%d").to_string();
        let streams = self.streams.clone();
        for stream in streams.iter() {
            let db_name = database_name(&stream.app, &stream.env, &today);
            self.ensure_indices(&db_name, stream.db_shard_index).await;
        }
        self.spawn_day_worker(self.tomorrow);
    }

    fn spawn_day_worker(&self, date: NaiveDate) {
        let shards = self.shards.clone();
        let streams = self.streams.clone();
        tokio::spawn(async move {
            let date_str = date.format("%Y-%m-%d").to_string();
            for stream in streams.iter() {
                let db_name = database_name(&stream.app, &stream.env, &date_str);
                create_indices(&shards, stream.db_shard_index, &db_name).await;
                sleep(Duration::from_secs(10)).await;
            }
        });
    }

    /// Drives the indexer's event loop: inbound per-request notices and the
    /// controller's once-a-second tick.
    pub async fn run(mut self, mut tick_rx: mpsc::Receiver<()>) {
        self.startup().await;
        loop {
            tokio::select! {
                notice = self.inbox.recv() => match notice {
                    Some(notice) => self.handle_notice(notice).await,
                    None => break,
                },
                tick = tick_rx.recv() => match tick {
                    Some(()) => self.on_tick(),
                    None => break,
                },
            }
        }
    }

    async fn handle_notice(&mut self, notice: IndexerNotice) {
        let is_new = !self.known_databases.contains(&notice.db_name);
        self.ensure_indices(&notice.db_name, notice.stream.db_shard_index).await;
        if is_new {
            let today_name = database_name(
                &notice.stream.app,
                &notice.stream.env,
                &self.today.format("%Y-%m-%d").to_string(),
            );
            if notice.db_name == today_name {
                self.register_global(&notice.db_name).await;
            }
        }
    }

    async fn ensure_indices(&mut self, db_name: &str, shard_index: usize) {
        if self.known_databases.contains(db_name) {
            return;
        }
        create_indices(&self.shards, shard_index, db_name).await;
        self.known_databases.insert(db_name.to_string());
    }

    async fn register_global(&self, db_name: &str) {
        let coll = self.shards.global_database().collection::<Document>("metadata");
        let db_name = db_name.to_string();
        let result = with_retry(RetryPolicy::METADATA_WRITE, || {
            let coll = coll.clone();
            let db_name = db_name.clone();
            async move {
                coll.update_one(doc! {"name": "databases"}, doc! {"$addToSet": {"value": db_name}})
                    .upsert(true)
                    .await
            }
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, db_name, "failed to register database in global metadata");
        }
    }

    /// Advances the date window on rollover, pings every 5 ticks, and drops
    /// the known-databases cache every 3600 ticks (spec.md section 4.6).
    fn on_tick(&mut self) {
        self.ticks += 1;
        let today = Utc::now().date_naive();
        if today != self.today {
            info!(%today, "date rollover, scheduling next day's indices");
            self.today = today;
            self.tomorrow = today + ChronoDuration::days(1);
            self.spawn_day_worker(self.tomorrow);
        }
        if self.ticks % 5 == 0 {
            let shards = self.shards.clone();
            tokio::spawn(async move { shards.ping_all().await });
        }
        if self.ticks % 3600 == 0 {
            self.known_databases.clear();
        }
    }
}

async fn create_indices(shards: &ShardClients, shard_index: usize, db_name: &str) {
    let db = shards.database_for(shard_index, db_name);

    let background = IndexOptions::builder().background(true).build();
    let sparse = IndexOptions::builder().background(true).sparse(true).build();

    let totals = db.collection::<Document>("totals");
    if let Err(e) = totals
        .create_index(
            IndexModel::builder()
                .keys(doc! {"page": 1})
                .options(background.clone())
                .build(),
        )
        .await
    {
        warn!(error = %e, db_name, "failed to create totals index");
    }

    let minutes = db.collection::<Document>("minutes");
    if let Err(e) = minutes
        .create_index(
            IndexModel::builder()
                .keys(doc! {"page": 1, "minutes": 1})
                .options(background.clone())
                .build(),
        )
        .await
    {
        warn!(error = %e, db_name, "failed to create minutes index");
    }

    let quants = db.collection::<Document>("quants");
    if let Err(e) = quants
        .create_index(
            IndexModel::builder()
                .keys(doc! {"page": 1, "kind": 1, "quant": 1})
                .options(background.clone())
                .build(),
        )
        .await
    {
        warn!(error = %e, db_name, "failed to create quants index");
    }

    let requests = db.collection::<Document>("requests");
    let mut request_indices = vec![
        IndexModel::builder()
            .keys(doc! {"metrics.n": 1, "metrics.v": -1})
            .options(background.clone())
            .build(),
        IndexModel::builder()
            .keys(doc! {"page": 1, "metrics.n": 1, "metrics.v": -1})
            .options(background.clone())
            .build(),
    ];
    for field in ["response_code", "severity", "minute", "exceptions"] {
        request_indices.push(
            IndexModel::builder()
                .keys(doc! {field: 1})
                .options(sparse.clone())
                .build(),
        );
        request_indices.push(
            IndexModel::builder()
                .keys(doc! {"page": 1, field: 1})
                .options(background.clone())
                .build(),
        );
    }
    if let Err(e) = requests.create_indexes(request_indices).await {
        warn!(error = %e, db_name, "failed to create requests indices");
    }

    let js_exceptions = db.collection::<Document>("js_exceptions");
    let js_exception_indices = vec![
        IndexModel::builder()
            .keys(doc! {"logjam_request_id": 1})
            .options(background.clone())
            .build(),
        IndexModel::builder()
            .keys(doc! {"description": 1})
            .options(background.clone())
            .build(),
    ];
    if let Err(e) = js_exceptions.create_indexes(js_exception_indices).await {
        warn!(error = %e, db_name, "failed to create js_exceptions indices");
    }
}
