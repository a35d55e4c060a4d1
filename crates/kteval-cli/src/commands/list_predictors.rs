//! The `kteval list-predictors` command.

use std::path::PathBuf;

use anyhow::Result;

use kteval_predictors::{builtin_predictors, create_predictor, load_config_from};

pub fn execute(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;

    let mut names: Vec<String> = config.predictors.keys().cloned().collect();
    names.sort();
    for (builtin, _) in builtin_predictors() {
        if !config.predictors.contains_key(builtin) {
            names.push(builtin.to_string());
        }
    }

    for name in &names {
        let predictor = create_predictor(name, &config.predictor(name)?)?;
        let info = predictor.info();
        let requires = info.requirements.names();
        let marker = if *name == config.default_predictor {
            " (default)"
        } else {
            ""
        };
        println!("{name}{marker}");
        println!("  kind: {}", info.kind);
        if let Some(model) = &info.model {
            println!("  model: {model}");
        }
        println!(
            "  requires: {}",
            if requires.is_empty() {
                "-".to_string()
            } else {
                requires.join(", ")
            }
        );
        println!(
            "  early fusion: {}",
            if info.early_fusion { "yes" } else { "no" }
        );
    }

    Ok(())
}
