//! `tether build`: JSON declaration graph to binary metadata

use std::fs;
use std::path::Path;

use anyhow::Context;
use tether_meta::{BinarySerializer, DeclarationGraph, MetaFileBuilderOptions};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildFlags {
    pub keep_variadic: bool,
    pub no_rename: bool,
    pub keep_duplicates: bool,
}

impl BuildFlags {
    fn options(self) -> MetaFileBuilderOptions {
        MetaFileBuilderOptions {
            drop_variadic_functions: !self.keep_variadic,
            resolve_name_collisions: !self.no_rename,
            remove_duplicate_members: !self.keep_duplicates,
        }
    }
}

pub fn execute(input: &Path, output: &Path, flags: BuildFlags) -> anyhow::Result<()> {
    let source =
        fs::read_to_string(input).with_context(|| format!("Cannot read {}", input.display()))?;
    let graph: DeclarationGraph = serde_json::from_str(&source)
        .with_context(|| format!("Invalid declaration graph in {}", input.display()))?;

    let declarations: usize = graph.modules.iter().map(|m| m.declarations.len()).sum();
    log::debug!("{} modules, {} declarations", graph.modules.len(), declarations);

    let result = BinarySerializer::new(flags.options())
        .serialize(&graph)
        .map_err(|e| anyhow::anyhow!(e.detailed_message()))
        .context("Metadata build failed")?;

    for error in &result.skipped {
        eprintln!("warning: {}", error.detailed_message());
    }

    let bytes = result.file.to_bytes();
    fs::write(output, &bytes).with_context(|| format!("Cannot write {}", output.display()))?;
    println!(
        "Wrote {} ({} bytes, {} skipped)",
        output.display(),
        bytes.len(),
        result.skipped.len()
    );
    Ok(())
}
