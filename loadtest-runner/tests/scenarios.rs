use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use loadtest_core::client::ClientFactory;
use loadtest_core::events::Stats;
use loadtest_runner::config::{
    AddPartitionTask, Client, Config, DropDatabaseTask, QueryTimeout, RandomWeights,
    Scenario, SetupDatabase, SetupScript, StressWeights, Wait,
};
use loadtest_runner::scenarios;
use tempfile::TempDir;

fn workload() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("q1.sql"), "-- first\nSELECT 1\n").unwrap();
    std::fs::write(dir.path().join("q2.sql"), "SELECT 2 -- second\n").unwrap();
    dir
}

fn config(users: usize, scenario: Scenario) -> Config {
    Config {
        nodes: vec!["node-1.example.com".into(), "node-2.example.com".into()],
        users,
        seed: Some(42),
        wait_time: Wait {
            min: Duration::from_millis(100),
            max: Duration::from_millis(200),
        },
        client: Client::Simulated {
            p50: Duration::from_millis(20),
            p99: Duration::from_millis(20),
            failure_rate: 0.0,
        },
        scenario: Some(scenario),
        ..Default::default()
    }
}

async fn run(config: &Config) -> (scenarios::RunSummary, ClientFactory, Arc<Stats>) {
    let factory = ClientFactory::new(config.client.to_client_config(config.seed));
    let stats = Arc::new(Stats::new());
    let summary = scenarios::run(config, factory.clone(), Arc::clone(&stats))
        .await
        .unwrap();
    (summary, factory, stats)
}

fn assert_all_succeeded(summary: &scenarios::RunSummary) {
    let failed: Vec<_> = summary.failed_users().collect();
    assert!(failed.is_empty(), "failed users: {failed:?}");
}

fn random(queries: &Path) -> Scenario {
    Scenario::Random {
        queries: queries.to_owned(),
        weights: RandomWeights::default(),
    }
}

#[tokio::test(start_paused = true)]
async fn random_runs_until_duration() {
    let queries = workload();
    let mut config = config(3, random(queries.path()));
    config.duration = Some(Duration::from_secs(10));

    let (summary, _, stats) = run(&config).await;

    assert_all_succeeded(&summary);
    assert_eq!(summary.scenario, "random");
    assert_eq!(summary.results.len(), 3);
    assert!(summary.elapsed >= Duration::from_secs(10));

    let names: Vec<_> = stats.snapshot().into_iter().map(|(name, _)| name).collect();
    assert!(names.iter().all(|name| name == "q1.sql" || name == "q2.sql"));
    let total = stats.total();
    assert!(total.successes > 0);
    assert_eq!(total.failures, 0);
}

#[tokio::test(start_paused = true)]
async fn random_with_failures() {
    let queries = workload();
    let mut config = config(2, random(queries.path()));
    config.duration = Some(Duration::from_secs(5));
    config.client = Client::Simulated {
        p50: Duration::from_millis(20),
        p99: Duration::from_millis(20),
        failure_rate: 1.0,
    };

    let (summary, _, stats) = run(&config).await;

    // Failed queries are reported, but do not end the users.
    assert_all_succeeded(&summary);
    let total = stats.total();
    assert!(total.failures > 0);
    assert_eq!(total.successes, 0);
    assert_eq!(total.errors.keys().collect::<Vec<_>>(), ["query failed: simulated failure"]);
}

#[tokio::test(start_paused = true)]
async fn throughput_warms_up_once() {
    let queries = workload();
    let scenario = Scenario::Throughput {
        queries: queries.path().to_owned(),
        num_iterations: 2,
        warmup: true,
        barrier_timeout: Some(Duration::from_secs(60)),
        settle_delay: Duration::from_millis(10),
    };
    let config = config(3, scenario);

    let (summary, factory, stats) = run(&config).await;

    assert_all_succeeded(&summary);
    // Three users with two iterations each, plus one unmeasured warmup run.
    assert_eq!(factory.cluster().count_of("SELECT 1"), 7);
    assert_eq!(factory.cluster().count_of("SELECT 2"), 7);
    assert_eq!(stats.get("q1.sql").unwrap().successes, 6);
    assert_eq!(stats.get("q2.sql").unwrap().successes, 6);
}

#[tokio::test(start_paused = true)]
async fn throughput_without_warmup() {
    let queries = workload();
    let scenario = Scenario::Throughput {
        queries: queries.path().to_owned(),
        num_iterations: 1,
        warmup: false,
        barrier_timeout: None,
        settle_delay: Duration::ZERO,
    };
    let config = config(2, scenario);

    let (summary, factory, _) = run(&config).await;

    assert_all_succeeded(&summary);
    assert_eq!(factory.cluster().count_of("SELECT 1"), 2);
}

#[tokio::test(start_paused = true)]
async fn throughput_waits_for_slowly_spawned_users() {
    let queries = workload();
    let scenario = Scenario::Throughput {
        queries: queries.path().to_owned(),
        num_iterations: 1,
        warmup: true,
        barrier_timeout: Some(Duration::from_secs(60)),
        settle_delay: Duration::ZERO,
    };
    let mut config = config(3, scenario);
    config.spawn_rate = Some(0.5);
    config.target_db = Some("tpcds".into());

    let (summary, factory, stats) = run(&config).await;

    assert_all_succeeded(&summary);
    // Every user switches to the database during setup. Before the last one did, only the
    // warmup may have run.
    let executed = factory.cluster().executed();
    let last_setup = executed.iter().rposition(|sql| sql == "USE tpcds").unwrap();
    let early = executed[..last_setup]
        .iter()
        .filter(|sql| sql.starts_with("SELECT"))
        .count();
    assert_eq!(early, 2);
    assert_eq!(stats.get("q1.sql").unwrap().successes, 3);
}

#[tokio::test(start_paused = true)]
async fn throughput_continues_after_failed_queries() {
    let queries = workload();
    let scenario = Scenario::Throughput {
        queries: queries.path().to_owned(),
        num_iterations: 2,
        warmup: false,
        barrier_timeout: None,
        settle_delay: Duration::ZERO,
    };
    let mut config = config(2, scenario);
    config.client = Client::Simulated {
        p50: Duration::from_millis(20),
        p99: Duration::from_millis(20),
        failure_rate: 1.0,
    };

    let (summary, _, stats) = run(&config).await;

    assert_all_succeeded(&summary);
    assert_eq!(stats.get("q1.sql").unwrap().failures, 4);
    assert_eq!(stats.get("q2.sql").unwrap().failures, 4);
}

#[tokio::test(start_paused = true)]
async fn stress_cancels_queries() {
    let queries = workload();
    let scenario = Scenario::Stress {
        queries: queries.path().to_owned(),
        weights: StressWeights {
            run_basic_query: 1,
            cancel_query: 1,
        },
        query_timeout: QueryTimeout::default(),
    };
    let mut config = config(2, scenario);
    config.duration = Some(Duration::from_secs(30));

    let (summary, factory, stats) = run(&config).await;

    assert_all_succeeded(&summary);
    assert!(factory.cluster().cancelled() > 0);

    let cancelled: u64 = stats
        .snapshot()
        .iter()
        .filter(|(name, _)| name.ends_with(" (cancelled)"))
        .map(|(_, entry)| entry.successes)
        .sum();
    assert_eq!(cancelled, factory.cluster().cancelled());
}

#[tokio::test(start_paused = true)]
async fn partitions_stop_after_drop() {
    let scenario = Scenario::Partitions {
        partition_limit: 5,
        setup_database: SetupDatabase::default(),
        add_partition_task: AddPartitionTask {
            frequency: 3,
            ..Default::default()
        },
        drop_database_task: DropDatabaseTask::default(),
    };
    let config = config(2, scenario);

    let (summary, factory, stats) = run(&config).await;

    assert_all_succeeded(&summary);
    let cluster = factory.cluster();
    assert!(cluster.count_of("DROP DATABASE loadtest_db CASCADE") >= 1);
    assert_eq!(cluster.partitions("loadtest_db.loadtest_table"), 0);

    // Every user stops at its first failed attempt to add a partition.
    let failed_adds: u64 = stats
        .snapshot()
        .iter()
        .filter(|(name, _)| name.ends_with("ADD PARTITION"))
        .map(|(_, entry)| entry.failures)
        .sum();
    assert_eq!(failed_adds, 2);
}

#[tokio::test(start_paused = true)]
async fn setup_script_runs_first() {
    let queries = workload();
    let script = queries.path().join("setup.sql.in");
    std::fs::write(&script, "CREATE DATABASE IF NOT EXISTS $DB;\nSET MEM_LIMIT=1g;\n").unwrap();

    let mut config = config(1, random(queries.path()));
    config.duration = Some(Duration::from_secs(1));
    config.setup = Some(SetupScript {
        file: script,
        replacements: [("$DB".to_owned(), "tpcds".to_owned())].into(),
    });

    let (summary, factory, stats) = run(&config).await;

    assert_all_succeeded(&summary);
    let executed = factory.cluster().executed();
    assert_eq!(executed[..2], ["CREATE DATABASE IF NOT EXISTS tpcds", "SET MEM_LIMIT=1g"]);
    // Setup statements are not measured.
    assert!(stats.get("SET MEM_LIMIT=1g").is_none());
}

#[tokio::test]
async fn missing_queries_fail() {
    let empty = tempfile::tempdir().unwrap();
    let config = config(1, random(empty.path()));

    let factory = ClientFactory::new(config.client.to_client_config(config.seed));
    let result = scenarios::run(&config, factory, Arc::new(Stats::new())).await;
    assert!(result.is_err());
}

#[test]
fn sample_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("workloads/sample/config.yaml");
    let config = Config::load(Some(&path)).unwrap();
    config.validate().unwrap();

    assert_eq!(config.users, 10);
    assert_eq!(config.target_db.as_deref(), Some("tpcds"));
    assert_eq!(config.scenario().unwrap().name(), "random");
    assert_eq!(config.confirm().unwrap().test.host, "impalad-1.example.com");
}
