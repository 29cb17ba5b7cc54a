//! Project initialization — `stagehand init`.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use stagehand::pipeline_config::{
    CONFIG_FILE, PipelineConfig, PipelineToml, RunSection, STAGEHAND_DIR,
};

use crate::Cli;

const EXAMPLE_PHASES: &str = r#"
# [[phases]]
# name = "chunk"
# command = "./bin/chunk"
#
# [[phases]]
# name = "synthesize"
# command = "./bin/tts"
# depends_on = ["chunk"]
# engine = { kind = "xtts", voice = { type = "cloned", reference_audio = "voices/narrator.wav" } }
"#;

pub fn cmd_init(cli: &Cli, project_dir: &Path, input_id: Option<&str>) -> Result<()> {
    let stagehand_dir = project_dir.join(STAGEHAND_DIR);
    std::fs::create_dir_all(&stagehand_dir)
        .with_context(|| format!("Failed to create {}", stagehand_dir.display()))?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| stagehand_dir.join(CONFIG_FILE));
    let created_config = !config_path.exists();
    if created_config {
        let starter = PipelineToml {
            run: RunSection {
                input_id: input_id.map(String::from),
                inputs: vec!["input/*.txt".to_string()],
                ..RunSection::default()
            },
            ..PipelineToml::default()
        };
        starter.save(&config_path)?;
        OpenOptions::new()
            .append(true)
            .open(&config_path)
            .and_then(|mut f| f.write_all(EXAMPLE_PHASES.as_bytes()))
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    let config = PipelineConfig::new(project_dir.to_path_buf(), cli.config.clone())?;
    let input_id = input_id
        .map(String::from)
        .unwrap_or_else(|| config.input_id());
    let store = config.open_store();
    let existed = store.exists();
    let doc = store.initialize(&input_id)?;

    if created_config {
        println!("Created {}", config_path.display());
    } else {
        println!("Using existing {}", config_path.display());
    }
    if existed {
        println!(
            "State document already present at {} (input '{}')",
            store.path().display(),
            doc.metadata.input_id
        );
    } else {
        println!(
            "Initialized state document at {} (input '{}')",
            store.path().display(),
            doc.metadata.input_id
        );
        println!();
        println!("Next steps:");
        println!("  1. Add [[phases]] to {}", config_path.display());
        println!("  2. Put source documents under input/");
        println!("  3. Run `stagehand run`");
    }

    Ok(())
}
