use ntest::timeout;
use stargate_client::ResultTable;
use stargate_smoke::{SmokeConfig, run_smoke};

#[tokio::test]
#[ignore] // Requires Docker and pulls the Cassandra and Stargate images
#[timeout(900000)]
async fn test_system_local_through_stargate() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,stargate_smoke=debug,harness=debug")
        .with_test_writer()
        .try_init();

    let config = SmokeConfig::default();
    let result_set = run_smoke(&config).await.expect("smoke run failed");

    assert!(!result_set.rows.is_empty());
    assert!(result_set.columns.iter().any(|column| column.name == "cluster_name"));
    println!("{}", ResultTable(&result_set));
}
