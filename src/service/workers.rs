//! Periodic maintenance workers.
//!
//! Two tasks are registered when the service starts: a recurring
//! validator that reconciles orphans and checks subscribed objects
//! against the filesystem, and a one-shot cleaner that prunes empty
//! dir-type subdirectories shortly after startup.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::WorkersConfig;

use super::FileCacheService;

/// Spawn the maintenance workers for a service.
///
/// The returned handles can be aborted to stop maintenance; dropping them
/// leaves the tasks running for the life of the runtime.
pub fn spawn_workers(service: &FileCacheService, config: &WorkersConfig) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let validator = service.clone();
    let period = Duration::from_secs(config.validate_period_secs.max(1));
    handles.push(tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        // The first tick fires immediately; skip it so startup settles.
        ticks.tick().await;
        loop {
            ticks.tick().await;
            debug!("validator tick");
            validator.run_maintenance().await;
        }
    }));

    let cleaner = service.clone();
    let delay = Duration::from_secs(config.dir_cleanup_delay_secs);
    handles.push(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        debug!("dir-type cleanup tick");
        cleaner.run_dir_cleanup().await;
    }));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSet, CacheSetOptions};
    use crate::service::{AllowListPermissions, AsyncCopier};
    use crate::util::FixedDiskStats;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn service(tmp: &TempDir) -> FileCacheService {
        let set = CacheSet::new(
            tmp.path().join("cache"),
            Arc::new(FixedDiskStats::new(1_000_000, 1_000_000)),
            CacheSetOptions {
                block_size: Some(1),
                orphan_grace: Duration::from_secs(0),
                enforce_reserve: true,
            },
        )
        .await
        .unwrap();
        FileCacheService::with_parts(
            set,
            Arc::new(AllowListPermissions::new(vec![])),
            Arc::new(AsyncCopier::spawn()),
            tmp.path().join("downloads"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_validator_runs_periodically() {
        let tmp = TempDir::new().unwrap();
        let svc = service(&tmp).await;
        svc.define_type(crate::service::DefineTypeParams {
            type_name: "t".to_string(),
            lo_watermark: 1_000,
            hi_watermark: 10_000,
            size: 0,
            cost: 0,
            lifetime: 0,
            dir_type: false,
        })
        .await
        .unwrap();
        let reply = svc
            .insert_cache_object(
                crate::service::InsertParams {
                    type_name: "t".to_string(),
                    file_name: "v.dat".to_string(),
                    size: Some(100),
                    cost: None,
                    lifetime: None,
                    subscribe: true,
                },
                "w",
            )
            .await
            .unwrap();
        tokio::fs::remove_file(&reply.path_name).await.unwrap();

        let handles = spawn_workers(
            &svc,
            &WorkersConfig {
                validate_period_secs: 15,
                dir_cleanup_delay_secs: 120,
            },
        );

        // Jump past one validator period; the missing file is noticed.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(svc.get_cache_object_size(&reply.path_name).await.is_err());

        for handle in handles {
            handle.abort();
        }
    }
}
