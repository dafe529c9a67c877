//! Task container integration tests
//!
//! Run with: cargo test -p rill-server --test container

mod common;

use common::{Harness, HOST};
use pretty_assertions::assert_eq;
use async_trait::async_trait;
use rill_core::DatabaseStorageManager;
use rill_server::{
    DatabaseTask, DefaultTaskBuilder, ErrorCategory, ExecutorState, InstanceTask, RegistryCall,
    ServerError, ServerResult, TaskBuilder, TaskContainer, TaskExecutor,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn register(database: &str) -> RegistryCall {
    RegistryCall::Register {
        host: HOST.to_string(),
        database: database.to_string(),
    }
}

fn unregister(database: &str) -> RegistryCall {
    RegistryCall::Unregister {
        host: HOST.to_string(),
        database: database.to_string(),
    }
}

/// An executor that has already run, so the pool refuses to start it.
#[derive(Debug)]
struct SpentExecutor {
    task: InstanceTask,
}

#[async_trait]
impl TaskExecutor for SpentExecutor {
    fn instance_task(&self) -> &InstanceTask {
        &self.task
    }

    async fn run(&self) -> ServerResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ServerResult<()> {
        Ok(())
    }

    fn state(&self) -> ExecutorState {
        ExecutorState::Stopped
    }

    fn is_merging(&self) -> bool {
        false
    }

    fn set_merging(&self, _merging: bool) {}
}

/// Builds real executors until `fail_start` is set, then executors that
/// cannot be started.
struct UnstartableBuilder {
    inner: DefaultTaskBuilder,
    fail_start: AtomicBool,
}

impl TaskBuilder for UnstartableBuilder {
    fn build(&self, task: InstanceTask) -> ServerResult<Arc<dyn TaskExecutor>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Ok(Arc::new(SpentExecutor { task }));
        }
        self.inner.build(task)
    }
}

/// Stop both executors for merging, the way a catch-up monitor would.
async fn prepare_merge(main: &Arc<dyn TaskExecutor>, temp: &Arc<dyn TaskExecutor>) {
    main.set_merging(true);
    temp.set_merging(true);
    main.stop().await.unwrap();
    temp.stop().await.unwrap();
}

// ============================================================================
// create
// ============================================================================

#[tokio::test]
async fn test_create_first_database_becomes_main() {
    let h = Harness::new().await;

    let executor = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();

    let task = executor.instance_task();
    assert_eq!(task.instance(), "db01");
    assert!(task.is_main());
    assert_eq!(task.databases().collect::<Vec<_>>(), vec!["orders"]);
    assert_eq!(executor.task_name(), "db01");

    let mapped = h.container.executor("orders").unwrap();
    assert!(Arc::ptr_eq(&mapped, &executor));
    assert_eq!(h.container.count("db01"), 1);
    assert_eq!(h.registry.calls(), vec![register("orders")]);
    assert_eq!(h.registry.owner("orders"), Some(HOST.to_string()));
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_create_second_database_becomes_temp() {
    let h = Harness::new().await;
    h.container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();

    let temp = h
        .container
        .create_database(DatabaseTask::new("users"))
        .await
        .unwrap();

    assert!(!temp.instance_task().is_main());
    assert_eq!(temp.task_name(), "db01-tmp-users");
    assert_eq!(h.container.count("db01"), 2);
    assert_eq!(h.container.main_executors().len(), 1);
    assert_eq!(h.container.temp_executors()["db01"].len(), 1);
    assert_eq!(h.registry.calls(), vec![register("orders"), register("users")]);
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_create_instance_registers_every_database() {
    let h = Harness::new().await;
    let task = InstanceTask::main(
        "db01",
        [DatabaseTask::new("orders"), DatabaseTask::new("users")],
    );

    let executor = h.container.create_instance(task).await.unwrap();

    for database in ["orders", "users"] {
        let mapped = h.container.executor(database).unwrap();
        assert!(Arc::ptr_eq(&mapped, &executor));
    }
    assert_eq!(h.container.count("db01"), 1);
    assert_eq!(h.container.database_tasks().len(), 2);
    assert_eq!(h.registry.calls(), vec![register("orders"), register("users")]);
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_create_rejects_served_database() {
    let h = Harness::new().await;
    h.container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();

    let result = h.container.create_database(DatabaseTask::new("orders")).await;
    assert!(matches!(result, Err(ServerError::Conflict(_))));

    let result = h
        .container
        .create_instance(InstanceTask::temp("db01", [DatabaseTask::new("orders")]))
        .await;
    assert!(matches!(result, Err(ServerError::Conflict(_))));

    assert_eq!(h.registry.calls().len(), 1);
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_create_rejects_second_main_task() {
    let h = Harness::new().await;
    h.container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();

    let result = h
        .container
        .create_instance(InstanceTask::main("db01", [DatabaseTask::new("users")]))
        .await;
    assert!(matches!(result, Err(ServerError::Conflict(_))));
    assert!(h.container.executor("users").is_none());
}

#[tokio::test]
async fn test_create_rejects_empty_instance_task() {
    let h = Harness::new().await;
    let result = h
        .container
        .create_instance(InstanceTask::main("db01", Vec::<DatabaseTask>::new()))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, ServerError::ContractViolation(_)));
    assert_eq!(err.category(), ErrorCategory::Contract);
}

#[tokio::test]
async fn test_create_unresolvable_database() {
    let h = Harness::new().await;
    let result = h.container.create_database(DatabaseTask::new("ghost")).await;

    assert!(matches!(result, Err(ServerError::Resolution(_))));
    assert!(h.container.database_tasks().is_empty());
    assert!(h.registry.calls().is_empty());
}

#[tokio::test]
async fn test_pool_exhaustion_leaves_mapping_unchanged() {
    let h = Harness::with_config(|config| config.with_max_executors(1)).await;
    h.container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();

    let result = h.container.create_database(DatabaseTask::new("billing")).await;
    assert!(matches!(result, Err(ServerError::StartupFailure { .. })));

    assert!(h.container.executor("billing").is_none());
    assert_eq!(h.container.count("db02"), 0);
    assert_eq!(h.registry.calls(), vec![register("orders")]);
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_create_rejects_ambiguous_names() {
    let h = Harness::new().await;

    // "a+b" alone would be named like a temporary task for {"a", "b"}
    let result = h
        .container
        .create_instance(InstanceTask::temp("db01", [DatabaseTask::new("a+b")]))
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, ServerError::ContractViolation(_)));

    // Main task x-tmp-y would share its name with x's temporary task for y
    let result = h
        .container
        .create_instance(InstanceTask::main("x-tmp-y", [DatabaseTask::new("z")]))
        .await;
    assert!(matches!(result, Err(ServerError::ContractViolation(_))));

    h.resolver.insert("c+d", "db01");
    let result = h.container.create_database(DatabaseTask::new("c+d")).await;
    assert!(matches!(result, Err(ServerError::ContractViolation(_))));

    assert!(h.container.database_tasks().is_empty());
    assert!(h.registry.calls().is_empty());
}

// ============================================================================
// replication through storage
// ============================================================================

#[tokio::test]
async fn test_events_reach_read_channel() {
    let h = Harness::new().await;
    h.push("db01", "orders", 4);
    h.push("db01", "users", 120);
    h.push("db01", "orders", 300);

    h.container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    h.wait_for_positions("orders", &[4, 300]).await;
    h.wait_for_checkpoint("db01", 300).await;

    h.push("db01", "orders", 480);
    h.wait_for_positions("orders", &[4, 300, 480]).await;
}

#[tokio::test]
async fn test_read_channel_requires_served_database() {
    let h = Harness::new().await;
    let result = h.container.read_channel("orders");
    assert!(matches!(result, Err(ServerError::ContractViolation(_))));
}

// ============================================================================
// remove / update
// ============================================================================

#[tokio::test]
async fn test_remove_last_database_clears_everything() {
    let h = Harness::new().await;
    h.push("db01", "orders", 4);

    let executor = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    h.wait_for_checkpoint("db01", 4).await;
    assert!(h.database_dir("orders").exists());

    h.container.remove("orders").await.unwrap();

    assert!(executor.is_stopped());
    assert!(h.container.executor("orders").is_none());
    assert_eq!(h.container.count("db01"), 0);
    assert!(!h.database_dir("orders").exists());
    assert_eq!(h.position("db01").await, None);
    assert_eq!(h.status.deleted(), vec!["db01".to_string()]);
    assert_eq!(h.registry.calls(), vec![register("orders"), unregister("orders")]);
    assert_eq!(h.registry.owner("orders"), None);
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_remove_rebuilds_remaining_task() {
    let h = Harness::new().await;
    h.push("db01", "orders", 4);
    h.push("db01", "users", 120);

    let old = h
        .container
        .create_instance(InstanceTask::main(
            "db01",
            [DatabaseTask::new("orders"), DatabaseTask::new("users")],
        ))
        .await
        .unwrap();
    h.wait_for_checkpoint("db01", 120).await;

    h.container.remove("orders").await.unwrap();

    assert!(old.is_stopped());
    assert!(h.container.executor("orders").is_none());
    assert!(!h.database_dir("orders").exists());

    let rebuilt = h.container.executor("users").unwrap();
    assert!(!Arc::ptr_eq(&rebuilt, &old));
    assert_eq!(rebuilt.task_name(), "db01");
    assert_eq!(rebuilt.instance_task().databases().collect::<Vec<_>>(), vec!["users"]);
    h.assert_mapping_consistent();

    // The rebuilt task resumes from the kept position
    h.push("db01", "users", 300);
    h.wait_for_positions("users", &[120, 300]).await;
    assert_eq!(h.registry.owner("users"), Some(HOST.to_string()));
}

#[tokio::test]
async fn test_remove_from_temp_task_moves_position_record() {
    let h = Harness::new().await;
    h.push("db01", "orders", 4);
    h.push("db01", "users", 120);
    h.push("db01", "products", 300);

    h.container
        .create_instance(InstanceTask::main("db01", [DatabaseTask::new("orders")]))
        .await
        .unwrap();
    h.container
        .create_instance(InstanceTask::temp(
            "db01",
            [DatabaseTask::new("users"), DatabaseTask::new("products")],
        ))
        .await
        .unwrap();
    h.wait_for_checkpoint("db01-tmp-users+products", 300).await;

    h.container.remove("products").await.unwrap();

    let rebuilt = h.container.executor("users").unwrap();
    assert_eq!(rebuilt.task_name(), "db01-tmp-users");
    assert_eq!(h.position("db01-tmp-users+products").await, None);
    assert!(h.position("db01-tmp-users").await.is_some());

    h.push("db01", "users", 480);
    h.wait_for_positions("users", &[120, 480]).await;
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_remove_unserved_database_is_contract_violation() {
    let h = Harness::new().await;
    let result = h.container.remove("orders").await;
    assert!(matches!(result, Err(ServerError::ContractViolation(_))));
    assert!(h.registry.calls().is_empty());
}

#[tokio::test]
async fn test_failed_rebuild_keeps_position_record() {
    let h = Harness::new().await;
    let builder = Arc::new(UnstartableBuilder {
        inner: DefaultTaskBuilder::new(
            DatabaseStorageManager::new(h.config.storage.clone()),
            h.holder.clone(),
            Arc::new(h.binlog.clone()),
            h.config.executor.clone(),
        ),
        fail_start: AtomicBool::new(false),
    });
    let container = TaskContainer::with_builder(&h.config, h.services(), builder.clone()).unwrap();

    h.push("db01", "users", 120);
    h.push("db01", "products", 300);
    let old = container
        .create_instance(InstanceTask::temp(
            "db01",
            [DatabaseTask::new("users"), DatabaseTask::new("products")],
        ))
        .await
        .unwrap();
    h.wait_for_checkpoint("db01-tmp-users+products", 300).await;
    let saved = h.position("db01-tmp-users+products").await;

    builder.fail_start.store(true, Ordering::SeqCst);
    let result = container.remove("users").await;
    assert!(matches!(result, Err(ServerError::StartupFailure { .. })));

    // The record stays with the task that is still mapped
    assert_eq!(h.position("db01-tmp-users+products").await, saved);
    assert_eq!(h.position("db01-tmp-products").await, None);
    for database in ["users", "products"] {
        let mapped = container.executor(database).unwrap();
        assert!(Arc::ptr_eq(&mapped, &old));
    }
    assert_eq!(container.count("db01"), 1);
}

#[tokio::test]
async fn test_update_replaces_executor() {
    let h = Harness::new().await;
    let old = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();

    let new = h
        .container
        .update(DatabaseTask::new("orders"))
        .await
        .unwrap();

    assert!(old.is_stopped());
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(new.instance_task().is_main());
    let mapped = h.container.executor("orders").unwrap();
    assert!(Arc::ptr_eq(&mapped, &new));
    assert_eq!(
        h.registry.calls(),
        vec![register("orders"), unregister("orders"), register("orders")]
    );
    h.assert_mapping_consistent();
}

// ============================================================================
// merge
// ============================================================================

#[tokio::test]
async fn test_merge_is_noop_until_ready() {
    let h = Harness::new().await;
    let main = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    let temp = h
        .container
        .create_database(DatabaseTask::new("users"))
        .await
        .unwrap();

    // Running and not merging
    assert!(!h.container.merge(&main, &temp).await.unwrap());

    // Merging but still running
    main.set_merging(true);
    temp.set_merging(true);
    assert!(!h.container.merge(&main, &temp).await.unwrap());

    // Only one side stopped
    temp.stop().await.unwrap();
    assert!(!h.container.merge(&main, &temp).await.unwrap());

    assert!(Arc::ptr_eq(&h.container.executor("orders").unwrap(), &main));
    assert!(Arc::ptr_eq(&h.container.executor("users").unwrap(), &temp));
    assert_eq!(h.container.count("db01"), 2);
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_merge_folds_temp_into_main() {
    let h = Harness::new().await;
    h.push("db01", "orders", 4);
    h.push("db01", "users", 120);

    let main = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    let temp = h
        .container
        .create_database(DatabaseTask::new("users"))
        .await
        .unwrap();
    h.wait_for_checkpoint("db01", 120).await;
    h.wait_for_checkpoint("db01-tmp-users", 120).await;

    prepare_merge(&main, &temp).await;
    assert!(h.container.merge(&main, &temp).await.unwrap());

    let merged = h.container.executor("orders").unwrap();
    assert!(Arc::ptr_eq(&merged, &h.container.executor("users").unwrap()));
    assert!(merged.instance_task().is_main());
    assert_eq!(merged.task_name(), "db01");
    assert_eq!(merged.instance_task().size(), 2);
    assert_eq!(h.container.count("db01"), 1);
    assert!(h.container.temp_executors().is_empty());

    assert_eq!(h.position("db01-tmp-users").await, None);
    assert_eq!(h.status.deleted(), vec!["db01-tmp-users".to_string()]);
    // Registry ownership is untouched by a merge
    assert_eq!(h.registry.calls(), vec![register("orders"), register("users")]);
    h.assert_mapping_consistent();

    h.push("db01", "users", 300);
    h.push("db01", "orders", 480);
    h.wait_for_positions("users", &[120, 300]).await;
    h.wait_for_positions("orders", &[4, 480]).await;
}

#[tokio::test]
async fn test_merge_rejects_swapped_roles() {
    let h = Harness::new().await;
    let main = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    let temp = h
        .container
        .create_database(DatabaseTask::new("users"))
        .await
        .unwrap();
    prepare_merge(&main, &temp).await;

    let result = h.container.merge(&temp, &main).await;
    assert!(matches!(result, Err(ServerError::ContractViolation(_))));
    assert_eq!(h.container.count("db01"), 2);
}

#[tokio::test]
async fn test_merge_rejects_stale_main_handle() {
    let h = Harness::new().await;
    let stale = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    // Same task name and databases, different executor
    let current = h
        .container
        .update(DatabaseTask::new("orders"))
        .await
        .unwrap();
    assert_eq!(current.task_name(), stale.task_name());
    assert_eq!(current.instance_task(), stale.instance_task());

    let temp = h
        .container
        .create_database(DatabaseTask::new("products"))
        .await
        .unwrap();
    prepare_merge(&stale, &temp).await;

    let result = h.container.merge(&stale, &temp).await;
    assert!(matches!(result, Err(ServerError::ContractViolation(_))));
    assert!(Arc::ptr_eq(&h.container.executor("orders").unwrap(), &current));
    assert!(Arc::ptr_eq(&h.container.executor("products").unwrap(), &temp));
    h.assert_mapping_consistent();
}

// ============================================================================
// upgrade
// ============================================================================

#[tokio::test]
async fn test_upgrade_preserves_position() {
    let h = Harness::new().await;
    h.push("db01", "orders", 4);
    h.push("db01", "orders", 120);
    h.push("db01", "orders", 300);

    let temp = h
        .container
        .create_instance(InstanceTask::temp("db01", [DatabaseTask::new("orders")]))
        .await
        .unwrap();
    assert_eq!(temp.task_name(), "db01-tmp-orders");
    h.wait_for_positions("orders", &[4, 120, 300]).await;
    h.wait_for_checkpoint("db01-tmp-orders", 300).await;

    assert!(h.container.upgrade(&temp).await.unwrap());

    assert!(temp.is_stopped());
    let upgraded = h.container.executor("orders").unwrap();
    assert!(upgraded.instance_task().is_main());
    assert_eq!(upgraded.task_name(), "db01");
    assert_eq!(h.position("db01-tmp-orders").await, None);
    assert!(h.container.temp_executors().is_empty());
    h.assert_mapping_consistent();

    // No gap and no duplicate across the upgrade
    h.push("db01", "orders", 480);
    h.wait_for_positions("orders", &[4, 120, 300, 480]).await;
    h.wait_for_checkpoint("db01", 480).await;
}

#[tokio::test]
async fn test_upgrade_main_is_noop() {
    let h = Harness::new().await;
    let main = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();

    assert!(!h.container.upgrade(&main).await.unwrap());
    assert!(!main.is_stopped());
    assert!(Arc::ptr_eq(&h.container.executor("orders").unwrap(), &main));
}

#[tokio::test]
async fn test_upgrade_with_existing_main_conflicts() {
    let h = Harness::new().await;
    h.container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    let temp = h
        .container
        .create_database(DatabaseTask::new("users"))
        .await
        .unwrap();

    let result = h.container.upgrade(&temp).await;
    assert!(matches!(result, Err(ServerError::Conflict(_))));
    assert!(!temp.is_stopped());
    h.assert_mapping_consistent();
}

#[tokio::test]
async fn test_upgrade_unregistered_executor_is_contract_violation() {
    let h = Harness::new().await;
    let temp = h
        .container
        .create_instance(InstanceTask::temp("db01", [DatabaseTask::new("orders")]))
        .await
        .unwrap();
    h.container.remove("orders").await.unwrap();

    let result = h.container.upgrade(&temp).await;
    assert!(matches!(result, Err(ServerError::ContractViolation(_))));
}

// ============================================================================
// rebuilds at full capacity
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_rebuilds_into_freed_worker_slot() {
    let h = Harness::with_config(|config| config.with_max_executors(1)).await;

    for round in 0..100 {
        h.container
            .create_instance(InstanceTask::main(
                "db01",
                [DatabaseTask::new("orders"), DatabaseTask::new("users")],
            ))
            .await
            .unwrap_or_else(|e| panic!("create failed in round {}: {}", round, e));

        h.container
            .remove("users")
            .await
            .unwrap_or_else(|e| panic!("rebuild failed in round {}: {}", round, e));
        let rebuilt = h.container.executor("orders").unwrap();
        assert!(!rebuilt.is_stopped());

        h.container
            .remove("orders")
            .await
            .unwrap_or_else(|e| panic!("remove failed in round {}: {}", round, e));
        assert_eq!(h.container.pool().active(), 0);
    }
    h.assert_mapping_consistent();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_merge_and_upgrade_at_full_capacity() {
    let h = Harness::with_config(|config| config.with_max_executors(2)).await;

    for round in 0..20 {
        let main = h
            .container
            .create_database(DatabaseTask::new("orders"))
            .await
            .unwrap();
        let temp = h
            .container
            .create_database(DatabaseTask::new("users"))
            .await
            .unwrap();
        prepare_merge(&main, &temp).await;
        let merged = h.container.merge(&main, &temp).await;
        assert!(
            matches!(merged, Ok(true)),
            "merge failed in round {}: {:?}",
            round,
            merged
        );

        // Upgrade needs the slot of the temporary task it replaces
        let temp = h
            .container
            .create_database(DatabaseTask::new("products"))
            .await
            .unwrap();
        h.container.remove("orders").await.unwrap();
        h.container.remove("users").await.unwrap();
        let upgraded = h.container.upgrade(&temp).await;
        assert!(
            matches!(upgraded, Ok(true)),
            "upgrade failed in round {}: {:?}",
            round,
            upgraded
        );

        h.container.remove("products").await.unwrap();
        assert_eq!(h.container.pool().active(), 0);
    }
}

// ============================================================================
// registry failures
// ============================================================================

#[tokio::test]
async fn test_registry_failure_is_retried() {
    let h = Harness::new().await;
    h.registry.fail_next(2);

    h.container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    assert_eq!(h.registry.calls(), vec![register("orders")]);
}

#[tokio::test]
async fn test_registry_failure_keeps_local_state() {
    let h = Harness::new().await;
    h.registry.fail_next(10);

    let result = h.container.create_database(DatabaseTask::new("orders")).await;
    let err = result.unwrap_err();
    assert!(matches!(err, ServerError::Registry(_)));
    assert!(err.is_retriable());

    // Served locally, announcement left to the caller
    assert!(h.container.executor("orders").is_some());
    assert!(h.registry.calls().is_empty());
    h.assert_mapping_consistent();
}

// ============================================================================
// shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_stops_every_executor() {
    let h = Harness::new().await;
    let main = h
        .container
        .create_database(DatabaseTask::new("orders"))
        .await
        .unwrap();
    let temp = h
        .container
        .create_database(DatabaseTask::new("users"))
        .await
        .unwrap();
    let other = h
        .container
        .create_database(DatabaseTask::new("billing"))
        .await
        .unwrap();

    h.container.shutdown().await.unwrap();

    assert!(main.is_stopped());
    assert!(temp.is_stopped());
    assert!(other.is_stopped());
    assert_eq!(h.container.database_tasks().len(), 3);
}
