//! The `kteval init` command.

use std::path::Path;

use anyhow::Result;

pub fn execute() -> Result<()> {
    if Path::new("kteval.toml").exists() {
        println!("kteval.toml already exists, skipping.");
    } else {
        std::fs::write("kteval.toml", SAMPLE_CONFIG)?;
        println!("Created kteval.toml");
    }

    std::fs::create_dir_all("datasets")?;
    let example_path = Path::new("datasets/example.jsonl");
    if example_path.exists() {
        println!("datasets/example.jsonl already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_DATASET)?;
        println!("Created datasets/example.jsonl");
    }

    println!("\nNext steps:");
    println!("  1. Point [predictors.remote] at your model server, or use the baseline");
    println!("  2. Run: kteval validate --data datasets/example.jsonl");
    println!("  3. Run: kteval run --data datasets/example.jsonl --predictor baseline");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# kteval configuration

default_predictor = "baseline"
mode = "teacher_forced"
max_len = 200
batch_size = 128
lanes_per_batch = 64
max_retries = 3
retry_delay_ms = 1000
output_dir = "./kteval-results"

[predictors.baseline]
type = "concept_rate"
prior = 0.5
strength = 1.0

[predictors.decay]
type = "concept_rate"
half_life_secs = 86400.0

[predictors.constant]
type = "constant"
probability = 0.5

# A served model answering POST {base_url}/v1/predict.
# [predictors.remote]
# type = "http"
# base_url = "${KTEVAL_MODEL_URL}"
# model = "dkt"
# api_key = "${KTEVAL_API_KEY}"
#
# [predictors.remote.requires]
# questions = true
#
# [predictors.remote.early_fusion]
# kind = "linear"
# weights = [0.5, 0.5]
# bias = 0.0
"#;

const EXAMPLE_DATASET: &str = r#"# one learner per line; is_repeat = 1 continues the previous row's question
{"uid": "a", "concepts": [1, 2, 1, 3, 3, 2], "responses": [1, 1, 1, 0, 0, 1], "questions": [10, 10, 11, 12, 12, 13], "timestamps": [0, 0, 60, 120, 120, 300], "is_repeat": [0, 1, 0, 0, 1, 0]}
{"uid": "b", "concepts": [2, 2, 3, 1], "responses": [0, 1, 1, 1], "questions": [13, 14, 15, 11], "timestamps": [0, 40, 90, 200], "is_repeat": [0, 0, 0, 0]}
{"uid": "c", "concepts": [3, 1, 2, 3, 1], "responses": [0, 0, 1, 1, 1], "questions": [12, 12, 13, 15, 16], "timestamps": [0, 0, 30, 80, 95], "is_repeat": [0, 1, 0, 0, 0]}
"#;
