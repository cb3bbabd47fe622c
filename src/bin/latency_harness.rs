//! Latency harness: drives a turn controller wired entirely with in-memory
//! test doubles through repeated text-input turns and reports wall-clock
//! latency from input to turn completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use turn_controller::adapters::test_doubles::{TestLlmAdapter, TestSttAdapter, TestTtsAdapter, TestTransport};
use turn_controller::adapters::vector_sqlite::SqliteVectorStore;
use turn_controller::rag::embedding::TestEmbedder;
use turn_controller::rag::RagRetriever;
use turn_controller::turn::{TurnController, TurnControllerSettingsInit};

const SAMPLES: usize = 200;

fn main() {
    if let Err(e) = run() {
        eprintln!("turn-controller-latency-harness failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let report = runtime.block_on(measure())?;

    let json = serde_json::to_string_pretty(&report)?;
    let output_path = PathBuf::from("latency-baseline.json");
    std::fs::write(&output_path, &json)?;

    println!("{json}");
    println!("saved baseline report: {}", output_path.display());
    Ok(())
}

#[derive(serde::Serialize)]
struct LatencyReport {
    samples: usize,
    min_ms: f64,
    max_ms: f64,
    mean_ms: f64,
    p50_ms: f64,
    p95_ms: f64,
}

async fn measure() -> anyhow::Result<LatencyReport> {
    let vector_store = Arc::new(SqliteVectorStore::open_in_memory()?);
    let embedder = Arc::new(TestEmbedder);
    let retriever = Arc::new(RagRetriever::new(vector_store, embedder, 3, 0.3));

    let mut samples = Vec::with_capacity(SAMPLES);
    for i in 0..SAMPLES {
        let controller = TurnController::new(
            format!("latency-harness-{i}"),
            Arc::new(TestSttAdapter::new()),
            Arc::new(TestLlmAdapter::new("the quick brown fox jumps over the lazy dog.")),
            Arc::new(TestTtsAdapter::new(vec![0u8; 32])),
            Arc::new(TestTransport::new()),
            Arc::clone(&retriever),
            None,
            TurnControllerSettingsInit::default(),
        );
        controller.start().await;

        let started = Instant::now();
        controller.handle_text_input("what time is the meeting tomorrow?").await;
        // Generation and synthesis run on spawned tasks; give them a beat
        // to settle before reading telemetry back out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let elapsed = started.elapsed();

        controller.stop().await;
        samples.push(elapsed.as_secs_f64() * 1000.0);
    }

    samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let min_ms = samples.first().copied().unwrap_or(0.0);
    let max_ms = samples.last().copied().unwrap_or(0.0);
    let mean_ms = samples.iter().sum::<f64>() / samples.len() as f64;
    let p50_ms = percentile(&samples, 0.50);
    let p95_ms = percentile(&samples, 0.95);

    Ok(LatencyReport { samples: samples.len(), min_ms, max_ms, mean_ms, p50_ms, p95_ms })
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx]
}
