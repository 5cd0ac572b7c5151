mod common;

use assert_cmd::Command;
use common::TestWorkspace;
use predicates::prelude::*;
use predicates::str::contains;

const PRICES: &str = "date,symbol,price,note
2024-01-01,AAPL,150.0,ok
2024-01-02,AAPL,151.2,ok
2024-01-03,AAPL,150.5,ok
2024-01-04,AAPL,152.3,ok
2024-01-05,AAPL,153.1,ok
";

fn series_store(workspace: &TestWorkspace) -> Command {
    let mut cmd = Command::cargo_bin("series-store").expect("binary exists");
    cmd.env_remove("SERIES_STORE_DATABASE")
        .env("RUST_LOG", "off")
        .arg("--database")
        .arg(workspace.database());
    cmd
}

fn upload_prices(workspace: &TestWorkspace, contents: &str, extra: &[&str]) -> assert_cmd::assert::Assert {
    let input = workspace.write("prices.csv", contents);
    series_store(workspace)
        .args(["upload", "--table", "prices", "--input"])
        .arg(&input)
        .args(["--numeric", "price", "--categorical", "note"])
        .args(extra)
        .assert()
}

#[test]
fn type_map_prints_role_defaults() {
    Command::cargo_bin("series-store")
        .expect("binary exists")
        .args(["type-map", "--text-length", "32"])
        .assert()
        .success()
        .stdout(contains("symbol:").and(contains("VARCHAR(32)")));
}

#[test]
fn upload_then_query_round_trip() {
    let workspace = TestWorkspace::new();
    upload_prices(&workspace, PRICES, &[])
        .success()
        .stdout(contains("inserted=5"));

    series_store(&workspace)
        .args(["columns", "prices"])
        .assert()
        .success()
        .stdout(contains("price").and(contains("note")).and(contains("symbol")));

    series_store(&workspace)
        .args(["latest", "--table", "prices", "--symbol", "AAPL"])
        .assert()
        .success()
        .stdout(contains("2024-01-05"));

    series_store(&workspace)
        .arg("tables")
        .assert()
        .success()
        .stdout(contains("prices"));

    series_store(&workspace)
        .args(["symbol", "AAPL"])
        .assert()
        .success()
        .stdout(contains("[prices] 5 row(s)").and(contains("153.1")));

    series_store(&workspace)
        .arg("ping")
        .assert()
        .success()
        .stdout(contains("ok"));
}

#[test]
fn update_latest_rewrites_only_the_last_day() {
    let workspace = TestWorkspace::new();
    upload_prices(&workspace, PRICES, &[]).success();
    let revised = PRICES.replace("153.1", "154.0").replace("150.5", "99.9");
    upload_prices(&workspace, &revised, &["--update-latest"])
        .success()
        .stdout(contains("inserted=0 overwritten=1 unchanged=4"));

    series_store(&workspace)
        .args(["symbol", "AAPL", "--table", "prices"])
        .assert()
        .success()
        .stdout(contains("154").and(contains("150.5")).and(contains("99.9").not()));
}

#[test]
fn symbol_flag_stamps_rows_without_a_symbol_column() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("msft.csv", "date,price\n2024-01-01,400.5\n2024-01-02,401.0\n");
    series_store(&workspace)
        .args(["upload", "-t", "prices", "-i"])
        .arg(&input)
        .args(["--symbol", "MSFT", "--numeric", "price"])
        .assert()
        .success()
        .stdout(contains("inserted=2"));

    series_store(&workspace)
        .args(["latest", "-t", "prices", "--symbol", "MSFT"])
        .assert()
        .success()
        .stdout(contains("2024-01-02"));
}

#[test]
fn rejected_null_keys_fail_the_upload() {
    let workspace = TestWorkspace::new();
    let contents = "date,symbol,price,note\n2024-01-01,AAPL,1.0,ok\n2024-01-02,,2.0,ok\n";
    upload_prices(&workspace, contents, &["--null-keys", "reject"])
        .failure()
        .stderr(contains("error:").and(contains("symbol")));

    series_store(&workspace)
        .args(["latest", "-t", "prices", "--symbol", "AAPL"])
        .assert()
        .success()
        .stdout(contains("none"));
}

#[test]
fn no_alter_refuses_unknown_tables() {
    let workspace = TestWorkspace::new();
    upload_prices(&workspace, PRICES, &["--no-alter"])
        .failure()
        .stderr(contains("error:"));
}

#[test]
fn latest_on_empty_table_prints_none_unless_strict() {
    let workspace = TestWorkspace::new();
    upload_prices(&workspace, PRICES, &[]).success();
    series_store(&workspace)
        .args(["latest", "-t", "prices", "--symbol", "TSLA"])
        .assert()
        .success()
        .stdout(contains("none"));
    series_store(&workspace)
        .args(["latest", "-t", "prices", "--symbol", "TSLA", "--strict"])
        .assert()
        .failure()
        .stderr(contains("error:"));
}

#[test]
fn missing_database_is_reported() {
    Command::cargo_bin("series-store")
        .expect("binary exists")
        .env_remove("SERIES_STORE_DATABASE")
        .env("RUST_LOG", "off")
        .arg("ping")
        .assert()
        .failure()
        .stderr(contains("error:").and(contains("SERIES_STORE_DATABASE")));
}

#[test]
fn config_file_supplies_the_database() {
    let workspace = TestWorkspace::new();
    let database = workspace.database();
    let config = workspace.write(
        "store.yaml",
        &format!("database: {}\npool_size: 2\n", database.display()),
    );
    Command::cargo_bin("series-store")
        .expect("binary exists")
        .env_remove("SERIES_STORE_DATABASE")
        .env("RUST_LOG", "off")
        .arg("--config")
        .arg(&config)
        .arg("ping")
        .assert()
        .success()
        .stdout(contains("ok"));
    assert!(database.exists());
}
