use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use test_support::{TempWorkbench, poll_until};
use tokio_util::sync::CancellationToken;
use workbench_core::bus::EventBus;
use workbench_core::catalog::{Catalog, project_id, task_id};
use workbench_core::domain::{Process, ProcessStatus, Project, Task, TaskStatus};
use workbench_core::store::EntityStore;
use workbench_core::task::{TaskError, TaskRunner};

fn runner(tw: &TempWorkbench, catalog: &str) -> (TaskRunner, Arc<EntityStore>) {
  let store = Arc::new(EntityStore::new());
  Catalog::from_toml_str(catalog)
    .unwrap()
    .install(&store, &tw.path())
    .unwrap();
  let runner = TaskRunner::new(Arc::clone(&store), EventBus::new(256), tw.path(), "spawn");
  (runner, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_commands_detach_into_a_group() {
  let tw = TempWorkbench::new();
  let (runner, store) = runner(
    &tw,
    r#"
[[tasks]]
name = "dev"
[[tasks.steps]]
commands = ["spawn sleep 30", "spawn sleep 30", "touch after"]
"#,
  );
  let id = task_id("dev");
  tokio::time::timeout(
    Duration::from_secs(5),
    runner.run(&id, &BTreeMap::new(), &CancellationToken::new()),
  )
  .await
  .expect("detached commands must not block the run")
  .unwrap();
  assert!(tw.path().join("after").exists());
  assert_eq!(store.load::<Task>(&id).unwrap().status, TaskStatus::Stopped);

  let groups = runner.groups_for(&id);
  assert_eq!(groups.len(), 1);
  let group = &groups[0];
  assert_eq!(group.process_ids.len(), 2);
  assert_eq!(runner.group_status(&group.id).unwrap(), ProcessStatus::Running);

  assert_eq!(runner.stop_group(&group.id).await.unwrap(), 2);
  let done = poll_until(Duration::from_secs(5), Duration::from_millis(10), || async {
    runner.group_status(&group.id).ok() == Some(ProcessStatus::Done)
  })
  .await;
  assert!(done);
  for pid in &group.process_ids {
    assert!(store.load::<Process>(pid).unwrap().pid.is_none());
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_detached_process_fails_the_group() {
  let tw = TempWorkbench::new();
  let (runner, _) = runner(
    &tw,
    r#"
[[tasks]]
name = "flaky"
[[tasks.steps]]
commands = ["spawn exit 7", "spawn sleep 30"]
"#,
  );
  let id = task_id("flaky");
  runner.run(&id, &BTreeMap::new(), &CancellationToken::new()).await.unwrap();
  let group = runner.groups_for(&id).remove(0);
  let failed = poll_until(Duration::from_secs(5), Duration::from_millis(10), || async {
    runner.group_status(&group.id).ok() == Some(ProcessStatus::Failed)
  })
  .await;
  assert!(failed);
  assert_eq!(runner.stop_all().await, 1);
}

#[tokio::test]
async fn project_steps_run_in_each_checkout() {
  let tw = TempWorkbench::new();
  let (runner, store) = runner(
    &tw,
    r#"
[[workspaces]]
name = "ws"
path = "ws"
[[workspaces.projects]]
name = "api"
[[workspaces.projects]]
name = "web"

[[tasks]]
name = "where"
[[tasks.steps]]
commands = ["pwd > location", "echo $STAGE > stage"]
projects = ["ws/api", "ws/web"]
"#,
  );
  for name in ["api", "web"] {
    let project: Project = store.load(&project_id("ws", name)).unwrap();
    std::fs::create_dir_all(&project.path).unwrap();
  }
  let mut overrides = BTreeMap::new();
  overrides.insert("STAGE".to_string(), "ci".to_string());
  runner
    .run(&task_id("where"), &overrides, &CancellationToken::new())
    .await
    .unwrap();

  for name in ["api", "web"] {
    let project: Project = store.load(&project_id("ws", name)).unwrap();
    let location = std::fs::read_to_string(project.path.join("location")).unwrap();
    let expected = project.path.canonicalize().unwrap();
    assert_eq!(Path::new(location.trim()).canonicalize().unwrap(), expected);
    assert_eq!(std::fs::read_to_string(project.path.join("stage")).unwrap(), "ci\n");
  }
  assert!(!tw.path().join("location").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_run_is_a_conflict() {
  let tw = TempWorkbench::new();
  let (runner, store) = runner(
    &tw,
    r#"
[[tasks]]
name = "slow"
[[tasks.steps]]
commands = ["sleep 1"]
"#,
  );
  let id = task_id("slow");
  let first = tokio::spawn({
    let runner = runner.clone();
    let id = id.clone();
    async move { runner.run(&id, &BTreeMap::new(), &CancellationToken::new()).await }
  });
  let running = poll_until(Duration::from_secs(5), Duration::from_millis(5), || async {
    store.load::<Task>(&id).map(|t| t.status).ok() == Some(TaskStatus::Running)
  })
  .await;
  assert!(running);

  let err = runner
    .run(&id, &BTreeMap::new(), &CancellationToken::new())
    .await
    .unwrap_err();
  assert!(matches!(err, TaskError::Conflict(_)));
  first.await.unwrap().unwrap();
  assert_eq!(store.load::<Task>(&id).unwrap().status, TaskStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_interrupts_and_fails_the_task() {
  let tw = TempWorkbench::new();
  let (runner, store) = runner(
    &tw,
    r#"
[[tasks]]
name = "long"
[[tasks.steps]]
commands = ["sleep 30"]
[[tasks.steps]]
commands = ["touch unreachable"]
"#,
  );
  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(100)).await;
    trigger.cancel();
  });
  let err = tokio::time::timeout(
    Duration::from_secs(5),
    runner.run(&task_id("long"), &BTreeMap::new(), &cancel),
  )
  .await
  .unwrap()
  .unwrap_err();
  assert!(matches!(err, TaskError::Cancelled(_)));
  assert_eq!(store.load::<Task>(&task_id("long")).unwrap().status, TaskStatus::Failed);
  assert!(!tw.path().join("unreachable").exists());
}
