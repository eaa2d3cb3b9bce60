//! C9: tabular result store (spec §4.7/§6.3), persisted to SQLite.
//!
//! Grounded on `original_source/database_writer.cc` (table shapes, the
//! write-everything-in-one-transaction discipline, the algorithm-catalogue
//! rows written once up front) and the transaction-per-write /
//! prepared-statement-read idiom common to the pack's `rusqlite` users.

use std::collections::{BTreeSet, HashMap};

use rusqlite::{params, Connection, Transaction};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::address::Address;
use crate::call_graph::CallGraph;
use crate::classify;
use crate::error::Result;
use crate::fixed_point::{self, FixedPoint};
use crate::invalid_argument;
use crate::matching::{basicblock_steps, function_steps};

const SCHEMA: &str = include_str!("schema.sql");

/// Per-file summary row (the `file` table, spec §4.7).
#[derive(Clone, Debug)]
pub struct FileSummary {
    pub filename: String,
    pub exefilename: String,
    pub hash: String,
    pub functions: i64,
    pub libfunctions: i64,
    pub calls: i64,
    pub basicblocks: i64,
    pub libbasicblocks: i64,
    pub edges: i64,
    pub libedges: i64,
    pub instructions: i64,
    pub libinstructions: i64,
}

impl FileSummary {
    /// Derives a summary row straight from an attached call graph, splitting
    /// every count by the `LIBRARY` vertex flag.
    pub fn from_call_graph(filename: impl Into<String>, exefilename: impl Into<String>, hash: impl Into<String>, call_graph: &CallGraph) -> Self {
        let mut summary = FileSummary {
            filename: filename.into(),
            exefilename: exefilename.into(),
            hash: hash.into(),
            functions: 0,
            libfunctions: 0,
            calls: call_graph.edges().len() as i64,
            basicblocks: 0,
            libbasicblocks: 0,
            edges: 0,
            libedges: 0,
            instructions: 0,
            libinstructions: 0,
        };
        for vertex in 0..call_graph.vertex_count() as u32 {
            let is_library = call_graph.vertex(vertex).flags.is_library();
            if is_library {
                summary.libfunctions += 1;
            } else {
                summary.functions += 1;
            }
            if let Some(flow) = call_graph.flow_graph(vertex) {
                let (bb, e, i) = (flow.vertex_count() as i64, flow.edges().len() as i64, flow.instruction_count() as i64);
                if is_library {
                    summary.libbasicblocks += bb;
                    summary.libedges += e;
                    summary.libinstructions += i;
                } else {
                    summary.basicblocks += bb;
                    summary.edges += e;
                    summary.instructions += i;
                }
            }
        }
        summary
    }
}

/// One full result write: both files' summaries, the committed fixed points,
/// and an optional free-text description (spec §4.7 `metadata.description`).
pub struct WriteRequest<'a> {
    pub primary: &'a CallGraph,
    pub secondary: &'a CallGraph,
    pub primary_file: FileSummary,
    pub secondary_file: FileSummary,
    pub fixed_points: &'a [FixedPoint],
    pub description: Option<String>,
}

fn address_to_sql(address: Address) -> i64 {
    u64::from(address) as i64
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| crate::error::DiffError::Internal(err.to_string()))
}

fn function_algorithm_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = function_steps::catalogue().into_iter().map(|s| s.id).collect();
    names.push(fixed_point::FUNCTION_MANUAL);
    names.push(fixed_point::FUNCTION_CALL_REFERENCE);
    names
}

fn basicblock_algorithm_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = basicblock_steps::catalogue().into_iter().map(|s| s.id).collect();
    names.push(fixed_point::BASICBLOCK_PROPAGATION);
    names.push(fixed_point::BASICBLOCK_MANUAL);
    names
}

/// Creates the seven tables (and the optional `commentsported` side table)
/// if they do not already exist.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn write_file_row(tx: &Transaction, file: &FileSummary) -> Result<i64> {
    tx.execute(
        "INSERT INTO file (filename, exefilename, hash, functions, libfunctions, calls, basicblocks, \
         libbasicblocks, edges, libedges, instructions, libinstructions) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            file.filename,
            file.exefilename,
            file.hash,
            file.functions,
            file.libfunctions,
            file.calls,
            file.basicblocks,
            file.libbasicblocks,
            file.edges,
            file.libedges,
            file.instructions,
            file.libinstructions,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn write_metadata(tx: &Transaction, file1: i64, file2: i64, description: Option<&str>, similarity: f64, confidence: f64) -> Result<()> {
    let now = now_rfc3339()?;
    tx.execute(
        "INSERT INTO metadata (version, file1, file2, description, created, modified, similarity, confidence) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![env!("CARGO_PKG_VERSION"), file1, file2, description, now, now, similarity, confidence],
    )?;
    Ok(())
}

/// Writes `names` into `table` in order, once each, and returns the
/// name-to-rowid map later writes key off of. The full catalogue (every
/// declared step plus the reserved manual/propagation ids) is always written
/// in full, regardless of which steps the fixed points on hand actually used
/// (spec §6.3: "the algorithm-id catalogue must be written exactly once per
/// result and include every step id actually used plus reserved ids" — the
/// simplest way to guarantee that is to never write a partial catalogue).
fn write_algorithm_catalogue(tx: &Transaction, table: &str, names: &[&str]) -> Result<HashMap<String, i64>> {
    let sql = format!("INSERT INTO {table} (name) VALUES (?1)");
    let mut ids = HashMap::new();
    for name in names {
        tx.execute(&sql, params![name])?;
        ids.insert((*name).to_string(), tx.last_insert_rowid());
    }
    Ok(ids)
}

fn write_fixed_point(
    tx: &Transaction,
    primary: &CallGraph,
    secondary: &CallGraph,
    fp: &FixedPoint,
    function_ids: &HashMap<String, i64>,
    basicblock_ids: &HashMap<String, i64>,
) -> Result<()> {
    let algorithm_id = *function_ids
        .get(&fp.step_id)
        .ok_or_else(|| invalid_argument!("unregistered function step id {}", fp.step_id))?;
    let basicblock_count = fp.basic_block_fixed_points.len() as i64;
    let instruction_count: i64 = fp.basic_block_fixed_points.iter().map(|bb| bb.instruction_matches.len() as i64).sum();

    tx.execute(
        "INSERT INTO function (address1, name1, address2, name2, similarity, confidence, flags, algorithm, \
         evaluate, commentsported, basicblocks, edges, instructions) \
         VALUES (?1, NULL, ?2, NULL, ?3, ?4, ?5, ?6, 1, ?7, ?8, 0, ?9)",
        params![
            address_to_sql(fp.primary_address),
            address_to_sql(fp.secondary_address),
            fp.similarity,
            fp.confidence,
            fp.flags.into_raw() as i64,
            algorithm_id,
            fp.comments_ported as i64,
            basicblock_count,
            instruction_count,
        ],
    )?;
    let function_id = tx.last_insert_rowid();

    let primary_flow = primary
        .flow_graph(fp.primary_vertex)
        .ok_or_else(|| invalid_argument!("no flow graph attached at primary vertex {}", fp.primary_vertex))?;
    let secondary_flow = secondary
        .flow_graph(fp.secondary_vertex)
        .ok_or_else(|| invalid_argument!("no flow graph attached at secondary vertex {}", fp.secondary_vertex))?;

    for bb in &fp.basic_block_fixed_points {
        let bb_algorithm_id = *basicblock_ids
            .get(&bb.step_id)
            .ok_or_else(|| invalid_argument!("unregistered basic block step id {}", bb.step_id))?;
        tx.execute(
            "INSERT INTO basicblock (functionid, address1, address2, algorithm, evaluate) VALUES (?1, ?2, ?3, ?4, 1)",
            params![
                function_id,
                address_to_sql(primary_flow.vertex_address(bb.primary_vertex)),
                address_to_sql(secondary_flow.vertex_address(bb.secondary_vertex)),
                bb_algorithm_id,
            ],
        )?;
        let basicblock_id = tx.last_insert_rowid();

        for instr in &bb.instruction_matches {
            let a1 = primary_flow.instructions()[instr.primary_instruction].address();
            let a2 = secondary_flow.instructions()[instr.secondary_instruction].address();
            tx.execute(
                "INSERT INTO instruction (basicblockid, address1, address2) VALUES (?1, ?2, ?3)",
                params![basicblock_id, address_to_sql(a1), address_to_sql(a2)],
            )?;
        }
    }
    Ok(())
}

/// Writes a complete result: schema (idempotent), both file rows, the full
/// algorithm catalogues, the overall metadata row, and one row tree per
/// committed fixed point — all inside a single transaction, rolled back
/// whole on any failure (spec §7: "result-store write failures roll back
/// the transaction").
pub fn write_result(conn: &mut Connection, request: &WriteRequest) -> Result<()> {
    create_schema(conn)?;
    let tx = conn.transaction()?;

    let file1 = write_file_row(&tx, &request.primary_file)?;
    let file2 = write_file_row(&tx, &request.secondary_file)?;

    let function_ids = write_algorithm_catalogue(&tx, "functionalgorithm", &function_algorithm_names())?;
    let basicblock_ids = write_algorithm_catalogue(&tx, "basicblockalgorithm", &basicblock_algorithm_names())?;

    let scorer = classify::Scorer::new(request.fixed_points, request.primary, request.secondary);
    let confidences: HashMap<&'static str, f64> = function_steps::catalogue().into_iter().map(|s| (s.id, s.confidence)).collect();
    let similarity = scorer.similarity();
    let confidence = scorer.confidence(|id| if id == fixed_point::FUNCTION_MANUAL { 1.0 } else { *confidences.get(id).unwrap_or(&0.0) });

    write_metadata(&tx, file1, file2, request.description.as_deref(), similarity, confidence)?;

    for fp in request.fixed_points {
        write_fixed_point(&tx, request.primary, request.secondary, fp, &function_ids, &basicblock_ids)?;
    }

    tx.commit()?;
    Ok(())
}

fn read_algorithm_ids(tx: &Transaction, table: &str) -> Result<HashMap<String, i64>> {
    let sql = format!("SELECT id, name FROM {table}");
    let mut stmt = tx.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut ids = HashMap::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let name: String = row.get(1)?;
        ids.insert(name, id);
    }
    Ok(ids)
}

/// Reconciles a persisted result with a freshly recomputed fixed-point set
/// (spec §4.7 "transmute"): `function` rows whose `(address1, address2)`
/// pair no longer appears in `fixed_points` are deleted, cascading to their
/// `basicblock`/`instruction` rows; pairs present in `fixed_points` but
/// absent from the store are inserted as new rows; fixed points committed
/// through the manual step have their stored `algorithm` rewritten to the
/// manual catalogue id and `confidence` forced to `1.0` even when already
/// present (re-running a diff must never downgrade a user's manual match).
/// `metadata.modified` is refreshed to the current time either way.
pub fn transmute(conn: &mut Connection, primary: &CallGraph, secondary: &CallGraph, fixed_points: &[FixedPoint]) -> Result<()> {
    let tx = conn.transaction()?;

    let function_ids = read_algorithm_ids(&tx, "functionalgorithm")?;
    let basicblock_ids = read_algorithm_ids(&tx, "basicblockalgorithm")?;

    let live: BTreeSet<(i64, i64)> =
        fixed_points.iter().map(|fp| (address_to_sql(fp.primary_address), address_to_sql(fp.secondary_address))).collect();

    let mut stale_ids = Vec::new();
    {
        let mut stmt = tx.prepare("SELECT id, address1, address2 FROM function")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let a1: i64 = row.get(1)?;
            let a2: i64 = row.get(2)?;
            if !live.contains(&(a1, a2)) {
                stale_ids.push(id);
            }
        }
    }
    for id in stale_ids {
        tx.execute(
            "DELETE FROM instruction WHERE basicblockid IN (SELECT id FROM basicblock WHERE functionid = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM basicblock WHERE functionid = ?1", params![id])?;
        tx.execute("DELETE FROM function WHERE id = ?1", params![id])?;
    }

    let present: BTreeSet<(i64, i64)> = {
        let mut stmt = tx.prepare("SELECT address1, address2 FROM function")?;
        let mut rows = stmt.query([])?;
        let mut set = BTreeSet::new();
        while let Some(row) = rows.next()? {
            let a1: i64 = row.get(0)?;
            let a2: i64 = row.get(1)?;
            set.insert((a1, a2));
        }
        set
    };

    for fp in fixed_points {
        let key = (address_to_sql(fp.primary_address), address_to_sql(fp.secondary_address));
        if !present.contains(&key) {
            write_fixed_point(&tx, primary, secondary, fp, &function_ids, &basicblock_ids)?;
        } else if fp.step_id == fixed_point::FUNCTION_MANUAL {
            let manual_id = *function_ids
                .get(fixed_point::FUNCTION_MANUAL)
                .ok_or_else(|| invalid_argument!("manual function algorithm id missing from store"))?;
            tx.execute(
                "UPDATE function SET algorithm = ?1, confidence = 1.0 WHERE address1 = ?2 AND address2 = ?3",
                params![manual_id, key.0, key.1],
            )?;
        }
    }

    let now = now_rfc3339()?;
    tx.execute("UPDATE metadata SET modified = ?1", params![now])?;

    tx.commit()?;
    Ok(())
}
