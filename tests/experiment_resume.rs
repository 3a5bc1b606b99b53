//! End-to-end runs against a file-backed transaction log: interruption,
//! resumption, cancellation and chunk-policy equivalence.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::broadcast;

use crossbench::pipes::Stream;
use crossbench::{
    params_from, ChunkBy, Environment, Evaluator, Experiment, ExperimentConfig, Learner,
    Observation, Params, Record, RestoredLog, ResultSet,
};

struct RangeEnv {
    name: &'static str,
    n: usize,
}

impl Environment for RangeEnv {
    fn params(&self) -> Params {
        params_from([("name", json!(self.name)), ("n", json!(self.n))])
    }

    fn read(&self) -> Stream<Observation> {
        let n = self.n;
        let name = self.name;
        Box::new((0..n).map(move |i| json!({ "env": name, "reward": i as f64 })))
    }
}

struct FixedLearner(&'static str);

impl Learner for FixedLearner {
    fn params(&self) -> Params {
        params_from([("family", json!(self.0))])
    }
}

/// Pass-through evaluation with optional per-interaction delay and an
/// optional environment it refuses to evaluate (by panicking).
struct PassThrough {
    refuse_env: Option<&'static str>,
    delay: Option<Duration>,
}

impl PassThrough {
    fn clean() -> Arc<dyn Evaluator> {
        Arc::new(Self {
            refuse_env: None,
            delay: None,
        })
    }
}

impl Evaluator for PassThrough {
    fn params(&self) -> Params {
        // Structurally identical across variants so a resumed run keeps the
        // same evaluator id regardless of test knobs.
        params_from([("eval", json!("pass-through"))])
    }

    fn evaluate(&self, env: &dyn Environment, _: &dyn Learner) -> Stream<Observation> {
        if let Some(refused) = self.refuse_env {
            if env.params().get("name") == Some(&json!(refused)) {
                panic!("refusing environment {refused}");
            }
        }
        let delay = self.delay;
        Box::new(env.read().map(move |obs| {
            if let Some(d) = delay {
                std::thread::sleep(d);
            }
            obs
        }))
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn experiment(evaluator: Arc<dyn Evaluator>, config: ExperimentConfig) -> Experiment {
    init_logging();
    Experiment::new(
        vec![
            Arc::new(RangeEnv { name: "a", n: 3 }),
            Arc::new(RangeEnv { name: "b", n: 4 }),
        ],
        vec![Arc::new(FixedLearner("fixed"))],
        vec![evaluator],
    )
    .with_config(config)
}

fn interaction_lines(path: &Path, env_id: u32) -> usize {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| Record::decode(line).ok())
        .filter(|r| r.work_item_id().map(|(e, _, _)| e) == Some(env_id))
        .count()
}

#[tokio::test]
async fn test_resume_completes_only_unfinished_items() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("log.txt");

    // First run: environment "b" fails, only "a" completes.
    let failing = Arc::new(PassThrough {
        refuse_env: Some("b"),
        delay: None,
    });
    let first = experiment(failing, ExperimentConfig::default())
        .evaluate(Some(&path))
        .await?;
    assert_eq!(first.n_interactions(), 3);
    assert!(first.interactions((1, 0, 0)).is_none());

    // Second run with a working evaluator picks up just the "b" item.
    let second = experiment(PassThrough::clean(), ExperimentConfig::default())
        .evaluate(Some(&path))
        .await?;
    assert_eq!(second.n_interactions(), 7);
    assert_eq!(second.interactions((0, 0, 0)).unwrap().len(), 3);
    assert_eq!(second.interactions((1, 0, 0)).unwrap().len(), 4);

    // The finished item was not re-executed: its records appear once.
    assert_eq!(interaction_lines(&path, 0), 3);
    Ok(())
}

#[tokio::test]
async fn test_failures_mid_chunk_lose_only_unfinished_items() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("log.txt");

    struct GroupedEnv {
        name: &'static str,
    }

    impl Environment for GroupedEnv {
        fn params(&self) -> Params {
            params_from([("name", json!(self.name)), ("n", json!(2))])
        }

        fn read(&self) -> Stream<Observation> {
            let name = self.name;
            Box::new((0..2).map(move |i| json!({ "env": name, "reward": i as f64 })))
        }

        fn source_group(&self) -> String {
            "shared".to_string()
        }
    }

    /// Evaluates only one named environment and dies on every other.
    struct OnlyEnv(&'static str);

    impl Evaluator for OnlyEnv {
        fn params(&self) -> Params {
            params_from([("eval", json!("pass-through"))])
        }

        fn evaluate(&self, env: &dyn Environment, _: &dyn Learner) -> Stream<Observation> {
            if env.params().get("name") != Some(&json!(self.0)) {
                panic!("refusing everything but {}", self.0);
            }
            env.read()
        }
    }

    fn grouped(evaluator: Arc<dyn Evaluator>) -> Experiment {
        Experiment::new(
            vec![
                Arc::new(GroupedEnv { name: "a" }),
                Arc::new(GroupedEnv { name: "b" }),
                Arc::new(GroupedEnv { name: "c" }),
            ],
            vec![Arc::new(FixedLearner("fixed"))],
            vec![evaluator],
        )
        .with_config(ExperimentConfig::default().with_chunk_by(ChunkBy::Source))
    }

    // All three items land in one chunk; the first completes, then every
    // later item in the chunk fails.
    let first = grouped(Arc::new(OnlyEnv("a"))).evaluate(Some(&path)).await?;
    assert_eq!(first.n_interactions(), 2);
    assert!(first.interactions((0, 0, 0)).is_some());

    // Resume re-attempts only the two lost items.
    let resumed = grouped(PassThrough::clean()).evaluate(Some(&path)).await?;
    assert_eq!(resumed.n_interactions(), 6);
    assert_eq!(interaction_lines(&path, 0), 2);
    assert_eq!(interaction_lines(&path, 1), 2);
    assert_eq!(interaction_lines(&path, 2), 2);
    Ok(())
}

#[tokio::test]
async fn test_resume_after_crash_truncated_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("log.txt");

    let failing = Arc::new(PassThrough {
        refuse_env: Some("b"),
        delay: None,
    });
    experiment(failing, ExperimentConfig::default())
        .evaluate(Some(&path))
        .await?;

    // Simulate a crash mid-append: a partial line with no newline.
    let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
    write!(file, "[\"I\",[1,0,0],0,{{\"rew")?;
    drop(file);

    let resumed = experiment(PassThrough::clean(), ExperimentConfig::default())
        .evaluate(Some(&path))
        .await?;
    assert_eq!(resumed.n_interactions(), 7);

    // The repaired log is fully parsable and the partial item was re-run
    // from scratch, not continued from the damaged record.
    let restored = RestoredLog::load(&path)?;
    assert_eq!(restored.finished.len(), 2);
    assert_eq!(interaction_lines(&path, 1), 4);
    Ok(())
}

#[tokio::test]
async fn test_chunk_policy_changes_execution_not_results() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let by_task_path = dir.path().join("by_task.txt");
    let by_source_path = dir.path().join("by_source.txt");

    let by_task = experiment(
        PassThrough::clean(),
        ExperimentConfig::default()
            .with_processes(2)
            .with_chunk_by(ChunkBy::Task),
    )
    .evaluate(Some(&by_task_path))
    .await?;

    let by_source = experiment(
        PassThrough::clean(),
        ExperimentConfig::default()
            .with_processes(2)
            .with_chunk_by(ChunkBy::Source),
    )
    .evaluate(Some(&by_source_path))
    .await?;

    assert_eq!(by_task.n_interactions(), by_source.n_interactions());
    for id in by_task.work_item_ids() {
        assert_eq!(by_task.interactions(id), by_source.interactions(id));
    }
    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_leaves_a_resumable_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("log.txt");

    let slow = Arc::new(PassThrough {
        refuse_env: None,
        delay: Some(Duration::from_millis(50)),
    });
    let config = ExperimentConfig::default().with_grace_period(Duration::from_secs(10));
    let slow_experiment = experiment(slow, config);

    let (shutdown, _) = broadcast::channel(1);
    let trigger = shutdown.clone();
    let cancelling = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(75)).await;
        let _ = trigger.send(());
    });

    let partial = slow_experiment
        .evaluate_with_shutdown(Some(&path), shutdown)
        .await?;
    cancelling.await?;
    assert!(partial.n_interactions() < 7);

    // Whatever was recorded parses cleanly and seeds a resumption.
    RestoredLog::load(&path)?;
    let resumed = experiment(PassThrough::clean(), ExperimentConfig::default())
        .evaluate(Some(&path))
        .await?;
    assert_eq!(resumed.n_interactions(), 7);
    assert_eq!(resumed.interactions((0, 0, 0)).unwrap().len(), 3);
    assert_eq!(resumed.interactions((1, 0, 0)).unwrap().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_result_set_reads_like_the_in_memory_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("log.txt");

    let from_run = experiment(PassThrough::clean(), ExperimentConfig::default())
        .evaluate(Some(&path))
        .await?;
    let from_file = ResultSet::from_file(&path)?;

    assert_eq!(from_run.descriptor(), from_file.descriptor());
    assert_eq!(from_run.n_interactions(), from_file.n_interactions());
    let series = from_file.observation_series((1, 0, 0), "reward");
    assert_eq!(series, vec![0.0, 1.0, 2.0, 3.0]);
    Ok(())
}
