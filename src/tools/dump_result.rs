use crate::DumpResultArgs;

use anyhow::{Context, Result};
use bindelta_core::classify::{self, ChangeFlags};
use rusqlite::Connection;

pub fn dump_result(args: DumpResultArgs) -> Result<()> {
    let conn = Connection::open(&args.database).with_context(|| format!("opening result database {}", args.database.display()))?;

    let (file1, file2, description, similarity, confidence): (String, String, Option<String>, f64, f64) = conn.query_row(
        "SELECT f1.filename, f2.filename, m.description, m.similarity, m.confidence \
         FROM metadata m JOIN file f1 ON f1.id = m.file1 JOIN file f2 ON f2.id = m.file2",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )?;
    println!("{file1} vs {file2}");
    if let Some(description) = description {
        println!("  {description}");
    }
    println!("  overall similarity {similarity:.4}, confidence {confidence:.4}");
    println!();

    let mut stmt = conn.prepare(
        "SELECT address1, address2, similarity, confidence, flags, basicblocks, instructions \
         FROM function ORDER BY address1",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let address1: i64 = row.get(0)?;
        let address2: i64 = row.get(1)?;
        let similarity: f64 = row.get(2)?;
        let confidence: f64 = row.get(3)?;
        let flags: i64 = row.get(4)?;
        let basicblocks: i64 = row.get(5)?;
        let instructions: i64 = row.get(6)?;
        let flags = ChangeFlags::from_raw(flags as u8).map_err(|err| anyhow::anyhow!("corrupt change flags in result database: {err}"))?;
        println!(
            "  0x{address1:x} <-> 0x{address2:x}  sim={similarity:.3} conf={confidence:.3} \
             [{}]  {basicblocks} basic blocks, {instructions} instructions",
            classify::change_description(flags)
        );
    }
    Ok(())
}
