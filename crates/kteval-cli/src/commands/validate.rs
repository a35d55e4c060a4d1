//! The `kteval validate` command.

use std::path::PathBuf;

use anyhow::Result;

use kteval_core::dataset::{load_dataset, validate_dataset};

pub fn execute(data: PathBuf) -> Result<()> {
    let dataset = load_dataset(&data)?;
    let summary = dataset.summary();

    println!(
        "Dataset: {} ({} sequences, {} interactions, {} groups)",
        summary.name, summary.sequences, summary.interactions, summary.groups
    );
    let fields = summary.fields.names();
    if fields.is_empty() {
        println!("Fields: concepts, responses");
    } else {
        println!("Fields: concepts, responses, {}", fields.join(", "));
    }

    let warnings = validate_dataset(&dataset);
    for w in &warnings {
        let prefix = w
            .sequence_id
            .as_ref()
            .map(|id| format!("  [{id}]"))
            .unwrap_or_else(|| "  ".to_string());
        println!("{prefix} WARNING: {}", w.message);
    }

    if warnings.is_empty() {
        println!("Dataset valid.");
    } else {
        println!("\n{} warning(s) found.", warnings.len());
    }

    Ok(())
}
