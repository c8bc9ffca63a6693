use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use raxs_core::{Content, Key, MutableRefTree, Position, StoreConfig, VersionedStore};

const CI_CONFIG: &[(u64, u64)] = &[(100, 5), (1_000, 1), (10_000, 1)];

const LOCAL_CONFIG: &[(u64, u64)] = &[(10, 1), (100, 1), (1_000, 1), (10_000, 1)];

/// Edits per commit.
const EDITS_PER_COMMIT: u64 = 10;

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Output {
    implementation: &'static str,
    storage: &'static str,
    workload: String,
    timestamp: String,
    name: String,
    total_ops: u64,
    duration_ms: f64,
    ops_per_sec: f64,
    extra: Extra,
    source_file: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Extra {
    count: u64,
    commits: u64,
    commit_ms: f64,
    recall_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    iterations: Option<u64>,
}

fn is_ci() -> bool {
    env::var("CI").map(|v| v == "true").unwrap_or(false)
}

fn document(count: u64) -> String {
    let mut doc = String::from("<?xml version=\"1.0\"?>\n<items>");
    for i in 0..count {
        write!(doc, "<item n=\"{i}\"><label>item {i}</label></item>").expect("format");
    }
    doc.push_str("</items>\n");
    doc
}

/// Returns (commit ms, recall ms, commits).
fn run_benchmark(dir: &Path, count: u64) -> (f64, f64, u64) {
    fs::write(dir.join("content.xml"), document(count)).expect("write document");
    let store = VersionedStore::new(StoreConfig::for_path(dir)).expect("store");
    store.open().expect("open");

    let commits = (count / EDITS_PER_COMMIT).max(1);
    let items = Key::path(vec![0]);
    let start = Instant::now();
    let mut buffer = store.editable_tree().expect("checkout");
    for c in 0..commits {
        for e in 0..EDITS_PER_COMMIT {
            let i = ((c * EDITS_PER_COMMIT + e) % count) as u32;
            let label = Key::path(vec![0, i, 0, 0]);
            buffer
                .update(&label, Content::text(format!("item {i} rev {c}")))
                .expect("update");
        }
        buffer
            .insert(&items, Position::Append, None, Content::element("item"))
            .expect("insert");
        store.commit_edits(&mut buffer, true).expect("commit");
    }
    let commit_ms = start.elapsed().as_secs_f64() * 1000.0;

    let start = Instant::now();
    let oldest = store.oldest_version().expect("oldest");
    let recalled = store.tree_at(oldest).expect("recall");
    let _ = raxs_core::snapshot(&recalled).expect("snapshot");
    let recall_ms = start.elapsed().as_secs_f64() * 1000.0;
    (commit_ms, recall_ms, commits)
}

fn main() {
    let config: &[(u64, u64)] = if is_ci() { CI_CONFIG } else { LOCAL_CONFIG };

    let mut out_dir: Option<PathBuf> = None;
    let mut custom_config: Option<Vec<(u64, u64)>> = None;
    for arg in env::args().skip(1) {
        if let Some(val) = arg.strip_prefix("--count=") {
            let count = val.parse().unwrap_or(500);
            custom_config = Some(vec![(count, 1)]);
        } else if let Some(val) = arg.strip_prefix("--counts=") {
            let parsed: Vec<(u64, u64)> = val
                .split(',')
                .filter_map(|s| s.trim().parse::<u64>().ok())
                .map(|c| (c, 1))
                .collect();
            if !parsed.is_empty() {
                custom_config = Some(parsed);
            }
        } else if let Some(val) = arg.strip_prefix("--out-dir=") {
            out_dir = Some(PathBuf::from(val));
        }
    }

    let config = custom_config.as_deref().unwrap_or(config);
    let out_dir = out_dir.unwrap_or_else(|| PathBuf::from("benchmarks/core"));
    fs::create_dir_all(&out_dir).expect("mkdirs");

    for &(count, iterations) in config {
        let mut runs = Vec::new();
        for _ in 0..iterations {
            let dir = tempfile::tempdir().expect("temp dir");
            runs.push(run_benchmark(dir.path(), count.max(1)));
        }
        let n = runs.len() as f64;
        let commit_ms = runs.iter().map(|r| r.0).sum::<f64>() / n;
        let recall_ms = runs.iter().map(|r| r.1).sum::<f64>() / n;
        let commits = runs.first().map(|r| r.2).unwrap_or(0);
        let duration_ms = commit_ms + recall_ms;
        let total_ops = commits * (EDITS_PER_COMMIT + 1);

        let workload_name = format!("commit-recall-{}", count);
        let out_path = out_dir.join(format!("file-{}.json", workload_name));

        let output = Output {
            implementation: "raxs-core",
            storage: "file",
            workload: workload_name.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            name: workload_name.clone(),
            total_ops,
            duration_ms,
            ops_per_sec: if duration_ms > 0.0 {
                total_ops as f64 / duration_ms * 1000.0
            } else {
                f64::INFINITY
            },
            extra: Extra {
                count,
                commits,
                commit_ms,
                recall_ms,
                iterations: (iterations > 1).then_some(iterations),
            },
            source_file: Some(out_path.display().to_string()),
        };

        let json = serde_json::to_string_pretty(&output).expect("serialize");
        fs::write(&out_path, &json).expect("write output");
        println!("{}", json);
    }
}
