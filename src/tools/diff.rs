use crate::DiffArgs;

use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use bindelta_core::binexport::{build_from_artifact, BinExport2};
use bindelta_core::call_graph::basename_no_extension;
use bindelta_core::instruction::Cache;
use bindelta_core::matching::{self, StepControl};
use bindelta_core::store::{self, FileSummary, WriteRequest};

fn load_artifact(path: &std::path::Path) -> Result<BinExport2> {
    let file = File::open(path).with_context(|| format!("opening artifact {}", path.display()))?;
    let artifact: BinExport2 =
        serde_json::from_reader(BufReader::new(file)).with_context(|| format!("decoding artifact {}", path.display()))?;
    Ok(artifact)
}

pub fn run_diff(args: DiffArgs) -> Result<()> {
    let primary_artifact = load_artifact(&args.primary)?;
    let secondary_artifact = load_artifact(&args.secondary)?;

    let mut primary_cache = Cache::new();
    let mut secondary_cache = Cache::new();
    let primary_graph = build_from_artifact(&primary_artifact, &mut primary_cache)
        .map_err(|err| anyhow::anyhow!("building primary call graph: {err}"))?;
    let secondary_graph = build_from_artifact(&secondary_artifact, &mut secondary_cache)
        .map_err(|err| anyhow::anyhow!("building secondary call graph: {err}"))?;

    let fixed_points = matching::run(&primary_graph, &secondary_graph, &[], |step_id| {
        log::info!("matching step: {step_id}");
        StepControl::Continue
    })
    .map_err(|err| anyhow::anyhow!("matching pipeline: {err}"))?;
    log::info!("committed {} fixed points", fixed_points.len());
    let fixed_points = fixed_points.into_vec();

    let mut conn = rusqlite::Connection::open(&args.database)
        .with_context(|| format!("opening result database {}", args.database.display()))?;
    let request = WriteRequest {
        primary: &primary_graph,
        secondary: &secondary_graph,
        primary_file: FileSummary::from_call_graph(
            basename_no_extension(&args.primary.to_string_lossy()),
            args.primary.to_string_lossy(),
            primary_artifact.meta_information.executable_id.clone(),
            &primary_graph,
        ),
        secondary_file: FileSummary::from_call_graph(
            basename_no_extension(&args.secondary.to_string_lossy()),
            args.secondary.to_string_lossy(),
            secondary_artifact.meta_information.executable_id.clone(),
            &secondary_graph,
        ),
        fixed_points: &fixed_points,
        description: args.description,
    };
    store::write_result(&mut conn, &request).map_err(|err| anyhow::anyhow!("writing result: {err}"))?;

    Ok(())
}
