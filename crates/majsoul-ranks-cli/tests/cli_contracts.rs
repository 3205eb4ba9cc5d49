#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use majsoul_ranks_core::{normalize_game, RejectReason};
use majsoul_ranks_store_sqlite::SqliteGameStore;
use serde_json::json;
use ulid::Ulid;

fn binary_path(name: &str) -> PathBuf {
    let var = format!("CARGO_BIN_EXE_{name}");
    match std::env::var(&var) {
        Ok(value) => PathBuf::from(value),
        Err(_) => Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../target/debug")
            .join(name),
    }
}

fn temp_path(extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("majsoul-ranks-{}.{extension}", Ulid::new()))
}

fn run(name: &str, args: &[&str]) -> Output {
    match Command::new(binary_path(name)).args(args).output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run {name} {:?}: {err}", args),
    }
}

fn analyze(db_path: &Path, args: &[&str]) -> Output {
    let mut full = vec!["--db", path_str(db_path)];
    full.extend_from_slice(args);
    run("majsoul-analyze", &full)
}

fn path_str(path: &Path) -> &str {
    match path.to_str() {
        Some(value) => value,
        None => panic!("non-utf8 temp path {}", path.display()),
    }
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

fn read_lines(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => text.lines().map(str::to_string).collect(),
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    }
}

fn seed_games(db_path: &Path) {
    let mut store = match SqliteGameStore::open(db_path) {
        Ok(store) => store,
        Err(err) => panic!("failed to open store: {err:#}"),
    };
    if let Err(err) = store.migrate() {
        panic!("failed to migrate store: {err:#}");
    }

    let mut batch: Vec<Result<_, RejectReason>> = Vec::new();
    for index in 0..10 {
        batch.push(normalize_game(
            &json!({
                "_id": format!("jade-{index}"),
                "modeId": 12,
                "startTime": 1_700_000_000 + index,
                "players": [
                    {"level": 10401, "score": 40_000, "gradingScore": 60},
                    {"level": 10402, "score": 30_000, "gradingScore": 20},
                    {"level": 10403, "score": 20_000, "gradingScore": -20},
                    {"level": 10501, "score": 10_000, "gradingScore": -60}
                ]
            }),
            None,
        ));
    }
    batch.push(normalize_game(
        &json!({
            "_id": "gold-0",
            "modeId": 9,
            "startTime": 1_700_000_100,
            "players": [
                {"level": 10301, "score": 30_000, "gradingScore": 30},
                {"level": 10401, "score": 35_000, "gradingScore": 45},
                {"level": 10302, "score": 20_000, "gradingScore": -10},
                {"level": 10303, "score": 15_000, "gradingScore": -40}
            ]
        }),
        None,
    ));

    if let Err(err) = store.insert_batch(&batch, None) {
        panic!("failed to seed games: {err:#}");
    }
}

#[test]
fn analyze_help_lists_subcommands() {
    let output = run("majsoul-analyze", &["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "summary",
        "export",
        "rank-correlation",
        "compare-levels",
        "compare-all",
    ] {
        assert!(stdout.contains(required), "help is missing {required}:\n{stdout}");
    }
}

#[test]
fn fetch_rejects_inverted_window() {
    let db_path = temp_path("sqlite");
    let output = run(
        "majsoul-fetch",
        &[
            "--db",
            path_str(&db_path),
            "--start-ms",
            "2000",
            "--end-ms",
            "1000",
        ],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("end-ms must be >= start-ms"));
    assert!(!db_path.exists());
}

#[test]
fn fetch_rejects_unknown_mode() {
    let output = run("majsoul-fetch", &["--mode", "7", "--start-ms", "0", "--end-ms", "1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("9, 12, 16"));
}

#[test]
fn summary_for_one_mode() {
    let db_path = temp_path("sqlite");
    seed_games(&db_path);

    let output = analyze(&db_path, &["summary", "--mode", "12"]);
    assert!(output.status.success());
    let lines = stdout_lines(&output);
    assert_eq!(lines[0], "rank,count,percent,avg_score,avg_grade,avg_level");
    assert_eq!(lines[1], "1,10,25.00,40000.00,60.00,10401.00");
    assert_eq!(lines.len(), 5);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn summary_with_window_excluding_everything() {
    let db_path = temp_path("sqlite");
    seed_games(&db_path);

    let output = analyze(&db_path, &["--end-ms", "1000", "summary"]);
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), vec!["No rows match the filter.".to_string()]);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn analyze_refuses_missing_database() {
    let db_path = temp_path("sqlite");

    let output = analyze(&db_path, &["summary"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to open existing sqlite database"));
    assert!(!db_path.exists());
}

#[test]
fn compare_levels_head_to_head() {
    let db_path = temp_path("sqlite");
    let csv_path = temp_path("csv");
    seed_games(&db_path);

    let output = analyze(
        &db_path,
        &[
            "compare-levels",
            "--level-a",
            "10301",
            "--level-b",
            "10401",
            "--mode",
            "9",
            "--csv",
            path_str(&csv_path),
        ],
    );
    assert!(output.status.success());
    let lines = stdout_lines(&output);
    assert_eq!(lines[1], "10301,10401,1,0,1,1.0000,-5000.00,-15.00");

    let instances = read_lines(&csv_path);
    assert_eq!(instances.len(), 2);
    assert_eq!(
        instances[1],
        "gold-0,1700000100,1,10301,2,30000,30,2,10401,1,35000,45,1,-5000,-15"
    );

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&csv_path);
}

#[test]
fn compare_levels_requires_distinct_levels() {
    let db_path = temp_path("sqlite");
    seed_games(&db_path);

    let output = analyze(
        &db_path,
        &["compare-levels", "--level-a", "10401", "--level-b", "10401"],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("must be different"));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn export_writes_four_rows_per_game() {
    let db_path = temp_path("sqlite");
    let csv_path = temp_path("csv");
    seed_games(&db_path);

    let output = analyze(&db_path, &["export", "--csv", path_str(&csv_path), "--mode", "12"]);
    assert!(output.status.success());

    let lines = read_lines(&csv_path);
    assert_eq!(lines[0], "id,mode,startTime,player,rank,level,score,gradingScore");
    assert_eq!(lines.len(), 1 + 10 * 4);
    assert_eq!(lines[1], "jade-0,12,1700000000,1,1,10401,40000,60");

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&csv_path);
}

#[test]
fn compare_all_writes_preset_sweeps() {
    let db_path = temp_path("sqlite");
    let csv_path = temp_path("csv");
    seed_games(&db_path);

    let output = analyze(&db_path, &["compare-all", "--csv", path_str(&csv_path)]);
    assert!(output.status.success());

    let lines = read_lines(&csv_path);
    assert_eq!(
        lines[0],
        "level_a,level_b,mode,instances,a_better,b_better,avg_rank_diff,avg_score_diff,avg_grade_diff"
    );
    assert!(lines.contains(&"10301,10401,9,1,0,1,1.0000,-5000.00,-15.00".to_string()));
    assert!(lines.contains(&"10401,10501,12,10,10,0,-3.0000,30000.00,120.00".to_string()));

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&csv_path);
}

#[test]
fn analyze_migrates_legacy_table_first() {
    let db_path = temp_path("sqlite");
    {
        let store = match SqliteGameStore::open(&db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:#}"),
        };
        let seeded = store.connection().execute_batch(
            "CREATE TABLE games (
                id TEXT PRIMARY KEY, mode INTEGER, endTime INTEGER,
                player1_level INTEGER, player1_score INTEGER, player1_gradingScore INTEGER,
                player2_level INTEGER, player2_score INTEGER, player2_gradingScore INTEGER,
                player3_level INTEGER, player3_score INTEGER, player3_gradingScore INTEGER,
                player4_level INTEGER, player4_score INTEGER, player4_gradingScore INTEGER
             );
             INSERT INTO games VALUES
                ('old-1', 16, 1700000000, 10701, 1000, 1, 10702, 4000, 4, 10703, 3000, 3, 10704, 2000, 2);",
        );
        if let Err(err) = seeded {
            panic!("failed to create legacy table: {err}");
        }
    }

    let output = analyze(&db_path, &["rank-correlation"]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let lines = stdout_lines(&output);
    assert_eq!(lines[0], "level,count,p1%,p2%,p3%,p4%,avg_place,avg_score,avg_grade");
    assert_eq!(lines[1], "10701,1,0.00,0.00,0.00,100.00,4.000,1000.00,1.00");
    assert_eq!(lines[2], "10702,1,100.00,0.00,0.00,0.00,1.000,4000.00,4.00");

    let _ = std::fs::remove_file(&db_path);
}
