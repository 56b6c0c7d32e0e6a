//! Engine facade (§6): directory layout, config/logging bootstrap, and the
//! `Engine` handle a caller opens once per node process. Plays the role
//! the teacher's root `openethereum` package plays over `crates/*` — a
//! package with both path `[dependencies]` and a `[workspace]` table, not
//! a binary in its own right.

pub mod rng;
pub mod shutdown;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use hashfs_blockstore::{BlockSize, BlockStore, SHARD_COUNT as BLOCK_SHARD_COUNT};
use hashfs_catalog::Catalog;
use hashfs_gc::{self, SweepReport};
use hashfs_jobqueue::JobQueue;
use hashfs_metastore::{MetaShard, SHARD_COUNT as META_SHARD_COUNT};
use hashfs_stats::{EngineMetrics, PrometheusMetrics, PrometheusRegistry};
use hashfs_upload::UploadStore;
use hashfs_util::{fail_einit, Result};

pub use rng::EngineRng;
pub use shutdown::ShutdownFlag;

/// Every tunable named in §4/§6, with `Default` covering the values the
/// original engine hardcodes.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub cluster_uuid: Option<[u8; 16]>,
    pub node_uuid: [u8; 16],
    /// Upper bound on blocks reclaimed per [`Engine::run_gc_pass`] call per
    /// shard, so one pass never holds a shard's write lock indefinitely.
    pub gc_max_batch: usize,
    /// Grace period (§4.6) between a reservation's block being written and
    /// the block-age sweep considering it abandoned.
    pub reservation_age_grace_secs: i64,
    pub min_upload_speed_bytes_per_sec: u64,
    pub token_hmac_key: Vec<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from("."),
            cluster_uuid: None,
            node_uuid: [0u8; 16],
            gc_max_batch: 1024,
            reservation_age_grace_secs: 86_400,
            min_upload_speed_bytes_per_sec: 1024,
            token_hmac_key: Vec::new(),
        }
    }
}

/// File naming for the 16 metadata shards and 48 block-store shards (§6).
fn meta_shard_file(shard: usize) -> String {
    format!("f0000000{shard:x}.db")
}

/// One open node process's worth of storage: the catalog, 16 metadata
/// shards, 48 block-store shards (3 size classes x 16), the upload token
/// store, and the job queue. All seven files + 96 block-store files live
/// directly under `Config::root`.
pub struct Engine {
    root: PathBuf,
    config: Config,
    catalog: Catalog,
    meta_shards: Vec<MetaShard>,
    block_stores: Vec<BlockStore>,
    uploads: UploadStore,
    jobs: JobQueue,
    /// Running total of blocks reclaimed by [`Engine::run_gc_pass`] over
    /// this process's lifetime — a Prometheus counter, so it only grows
    /// and resets with the process, same as `job_lock`'s in-memory state.
    blocks_reclaimed_total: AtomicI64,
}

fn block_store_index(size: BlockSize, shard: usize) -> usize {
    let class = match size {
        BlockSize::Small => 0,
        BlockSize::Medium => 1,
        BlockSize::Large => 2,
    };
    class * BLOCK_SHARD_COUNT + shard
}

impl Engine {
    /// Creates `Config::root` if absent and opens (or initializes) every
    /// database named in §6's directory layout.
    pub fn open(config: Config) -> Result<Engine> {
        fs::create_dir_all(&config.root)
            .map_err(|e| fail_einit(format!("cannot create engine root {}: {e}", config.root.display())))?;

        let catalog = Catalog::open(&config.root.join("hashfs.db"))?;
        if catalog.identity().is_err() {
            catalog.init_bare(config.node_uuid)?;
        }
        if let Some(cluster_uuid) = config.cluster_uuid {
            let identity = catalog.identity()?;
            if identity.is_bare() {
                catalog.activate(cluster_uuid)?;
            }
        }

        let mut meta_shards = Vec::with_capacity(META_SHARD_COUNT);
        for shard in 0..META_SHARD_COUNT {
            meta_shards.push(MetaShard::open(&config.root.join(meta_shard_file(shard)))?);
        }

        let cluster_uuid = config.cluster_uuid.unwrap_or(config.node_uuid);
        let mut block_stores = Vec::with_capacity(3 * BLOCK_SHARD_COUNT);
        for size in [BlockSize::Small, BlockSize::Medium, BlockSize::Large] {
            for shard in 0..BLOCK_SHARD_COUNT {
                block_stores.push(BlockStore::open(&config.root, size, shard, cluster_uuid)?);
            }
        }

        let uploads = UploadStore::open(&config.root.join("temp.db"))?;
        let jobs = JobQueue::open(&config.root.join("events.db"))?;

        Ok(Engine {
            root: config.root.clone(),
            config,
            catalog,
            meta_shards,
            block_stores,
            uploads,
            jobs,
            blocks_reclaimed_total: AtomicI64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn meta_shard(&self, shard: usize) -> &MetaShard {
        &self.meta_shards[shard]
    }

    pub fn block_store(&self, size: BlockSize, shard: usize) -> &BlockStore {
        &self.block_stores[block_store_index(size, shard)]
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// Runs the bounded sweeps of §4.6 across every block shard plus the
    /// upload-token expiry sweep, and returns the summed tallies. Intended
    /// to be called periodically by whatever scheduler owns this `Engine`
    /// — this method itself has no timer.
    pub fn run_gc_pass(&self, now: i64) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        for store in &self.block_stores {
            let report = hashfs_gc::run_block_sweep(store, now, self.config.reservation_age_grace_secs)?;
            total.reservations_expired_by_ttl += report.reservations_expired_by_ttl;
            total.reservations_expired_by_age += report.reservations_expired_by_age;
            total.operations_expired += report.operations_expired;
            total.blocks_reclaimed += report.blocks_reclaimed;
        }
        hashfs_gc::sweep_expired_tokens(&self.uploads, now, self.config.gc_max_batch)?;
        self.blocks_reclaimed_total
            .fetch_add(total.blocks_reclaimed as i64, Ordering::SeqCst);
        Ok(total)
    }

    /// Snapshot gauges for `/metrics`-style exposition (left to whatever
    /// front-end a caller layers on top, per §E's Non-goals). Every series
    /// is a live query or this process's running tally — none are
    /// placeholders.
    pub fn metrics(&self, registry: &mut PrometheusRegistry) -> Result<()> {
        let mut blocks_stored = 0i64;
        let mut reservations_open = 0i64;
        for store in &self.block_stores {
            blocks_stored += store.all_block_hashes()?.len() as i64;
            reservations_open += store.reservation_count()?;
        }
        let metrics = EngineMetrics {
            blocks_stored,
            blocks_reclaimed_total: self.blocks_reclaimed_total.load(Ordering::SeqCst),
            reservations_open,
            jobs_pending: self.jobs.pending_job_count()?,
            upload_tokens_open: self.uploads.open_token_count()?,
        };
        metrics.prometheus_metrics(registry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path) -> Config {
        Config {
            root: root.to_path_buf(),
            node_uuid: [1u8; 16],
            ..Config::default()
        }
    }

    #[test]
    fn open_creates_every_layout_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert!(dir.path().join("hashfs.db").exists());
        assert!(dir.path().join("temp.db").exists());
        assert!(dir.path().join("events.db").exists());
        for shard in 0..META_SHARD_COUNT {
            assert!(dir.path().join(meta_shard_file(shard)).exists());
        }
        assert!(engine.catalog().identity().unwrap().is_bare());
    }

    #[test]
    fn reopen_preserves_node_identity() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _engine = Engine::open(test_config(dir.path())).unwrap();
        }
        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.catalog().identity().unwrap().node_uuid, [1u8; 16]);
    }

    #[test]
    fn gc_pass_runs_without_error_on_a_fresh_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let report = engine.run_gc_pass(0).unwrap();
        assert_eq!(report.blocks_reclaimed, 0);
    }

    #[test]
    fn metrics_snapshot_is_zero_on_a_fresh_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let mut registry = PrometheusRegistry::new("hashfs_".to_string());
        engine.metrics(&mut registry).unwrap();
        let families = registry.registry().gather();
        assert_eq!(families.len(), 5);
        for family in &families {
            for metric in family.get_metric() {
                let value = metric.get_gauge().get_value() + metric.get_counter().get_value();
                assert_eq!(value, 0.0, "{} should start at zero", family.get_name());
            }
        }
    }

    #[test]
    fn metrics_snapshot_reflects_a_populated_store() {
        use hashfs_blockstore::HashOp;
        use rand::SeedableRng;

        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();

        // A block with a live reference, and a second, unreferenced one
        // on another shard that the GC pass below will reclaim.
        let stored = engine.block_store(BlockSize::Small, 0);
        stored.block_put(&[7u8; 20], b"payload", 0).unwrap();
        stored
            .hashop(HashOp::InUse, &[7u8; 20], &[2u8; 20], 1, 0, 1_000_000)
            .unwrap();
        let reclaimable = engine.block_store(BlockSize::Small, 1);
        reclaimable.block_put(&[8u8; 20], b"stale", 0).unwrap();

        // An open reservation on a third shard.
        let reserved = engine.block_store(BlockSize::Small, 2);
        reserved
            .hashop(HashOp::Reserve, &[9u8; 20], &[1u8; 20], 1, 0, 1_000_000)
            .unwrap();

        // A pending job.
        engine
            .jobs()
            .new_job(None, hashfs_jobqueue::JobType::FlushFile, 1, None, &["node-a".to_string()], 60, 0)
            .unwrap();

        // An open upload token.
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        engine.uploads().putfile_begin(1, "f.bin", 1, &mut rng, 0).unwrap();

        let report = engine.run_gc_pass(1).unwrap();
        assert_eq!(report.blocks_reclaimed, 1);

        let mut registry = PrometheusRegistry::new("hashfs_".to_string());
        engine.metrics(&mut registry).unwrap();
        let families = registry.registry().gather();
        let value_of = |name: &str| -> f64 {
            families
                .iter()
                .find(|f| f.get_name() == name)
                .map(|f| {
                    let m = &f.get_metric()[0];
                    m.get_gauge().get_value() + m.get_counter().get_value()
                })
                .unwrap_or_else(|| panic!("no such series {name}"))
        };

        assert_eq!(value_of("hashfs_blocks_stored"), 1.0);
        assert_eq!(value_of("hashfs_blocks_reclaimed_total"), 1.0);
        assert_eq!(value_of("hashfs_reservations_open"), 1.0);
        assert_eq!(value_of("hashfs_jobs_pending"), 1.0);
        assert_eq!(value_of("hashfs_upload_tokens_open"), 1.0);
    }
}
