//! Strata stress driver
//!
//! Usage:
//!   strata-stress --threads 8 --rows 100000 --block-rows 4096 --budget 67108864 [--dir /tmp/strata]
//!
//! Writer threads append disjoint key ranges in small transactions and update
//! earlier keys while a compactor thread rewrites sealed blocks. Counters are
//! printed at the end.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use clap::Parser;

use strata::data::build_array;
use strata::tasks::TaskKind;
use strata::{DataType, Db, Schema, StrataConfig, Value};

/// Rows per append transaction
const BATCH_ROWS: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "strata-stress")]
#[command(about = "Concurrent append/update/compaction workload against a strata engine")]
#[command(version)]
struct Args {
    /// Writer threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Rows appended by each writer
    #[arg(short, long, default_value_t = 10_000)]
    rows: usize,

    /// Row capacity of a block
    #[arg(long, default_value_t = 40_000)]
    block_rows: u32,

    /// Buffer pool budget in bytes
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    budget: u64,

    /// Keep block files and the log under this directory instead of memory
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    updated: AtomicU64,
    conflicts: AtomicU64,
    compacted: AtomicU64,
}

fn schema() -> strata::Result<Schema> {
    Schema::new("stress")
        .column("id", DataType::Int64)
        .column("writer", DataType::Int64)
        .column("payload", DataType::String)
        .primary_key("id")
}

fn make_batch(schema: &Schema, writer: usize, keys: std::ops::Range<i64>) -> strata::Result<RecordBatch> {
    let ids: Vec<Value> = keys.clone().map(Value::Int64).collect();
    let writers: Vec<Value> = keys.clone().map(|_| Value::Int64(writer as i64)).collect();
    let payloads: Vec<Value> = keys.map(|k| Value::String(format!("row-{}", k))).collect();
    Ok(RecordBatch::try_new(
        schema.arrow_schema(),
        vec![
            build_array(DataType::Int64, &ids)?,
            build_array(DataType::Int64, &writers)?,
            build_array(DataType::String, &payloads)?,
        ],
    )?)
}

fn writer(db: &Db, table: u64, schema: &Schema, id: usize, rows: usize, counters: &Counters) -> strata::Result<()> {
    let base = (id * rows) as i64;
    let mut written = 0usize;
    while written < rows {
        let n = BATCH_ROWS.min(rows - written);
        let start = base + written as i64;
        let batch = make_batch(schema, id, start..start + n as i64)?;

        let txn = db.begin();
        if let Err(e) = db.append(&txn, table, &batch) {
            db.rollback(&txn)?;
            return Err(e);
        }
        db.commit(&txn)?;
        written += n;
        counters.appended.fetch_add(n as u64, Ordering::Relaxed);

        // touch a key written a few batches ago
        let key = base + (written as i64 * 7 / 11);
        let txn = db.begin();
        let updated = db
            .update(&txn, table, &Value::Int64(key), "payload", Value::String(format!("upd-{}", written)))
            .and_then(|_| db.commit(&txn).map(|_| ()));
        match updated {
            Ok(()) => {
                counters.updated.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                counters.conflicts.fetch_add(1, Ordering::Relaxed);
                if txn.is_active() {
                    db.rollback(&txn)?;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn compactor(db: &Db, table: u64, done: &AtomicBool, counters: &Counters) -> strata::Result<()> {
    loop {
        let finished = done.load(Ordering::Acquire);
        for block in db.sealed_blocks(table)? {
            let txn = db.begin();
            let result = db.compact_block(&txn, block).and_then(|_| db.commit(&txn).map(|_| ()));
            match result {
                Ok(()) => {
                    counters.compacted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_conflict() => {
                    log::debug!("compaction of block {} lost to a writer: {}", block, e);
                    if txn.is_active() {
                        db.rollback(&txn)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        if finished {
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

fn run(args: Args) -> strata::Result<()> {
    let mut config = StrataConfig::default()
        .with_block_max_rows(args.block_rows)
        .with_memory_budget(args.budget);
    if let Some(dir) = &args.dir {
        config = config.with_data_dir(dir);
    }
    let db = Db::open(config)?;
    let database = db.create_database("stress")?;
    let schema = schema()?;
    let table = db.create_table(database, schema.clone())?;

    let counters = Counters::default();
    let done = AtomicBool::new(false);
    let started = Instant::now();

    std::thread::scope(|s| -> strata::Result<()> {
        let compaction = s.spawn(|| compactor(&db, table, &done, &counters));
        let writers: Vec<_> = (0..args.threads)
            .map(|id| {
                let (db, schema, counters) = (&db, &schema, &counters);
                s.spawn(move || writer(db, table, schema, id, args.rows, counters))
            })
            .collect();

        let mut first_err = None;
        for handle in writers {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => log::error!("writer thread panicked"),
            }
        }
        done.store(true, Ordering::Release);
        match compaction.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(_) => log::error!("compactor thread panicked"),
        }
        first_err.map_or(Ok(()), Err)
    })?;
    let elapsed = started.elapsed();

    let flushed = db.flush()?;
    let reader = db.begin();
    let visible: usize = db.scan(&reader, table)?.iter().map(|b| b.num_rows()).sum();
    db.commit(&reader)?;
    db.close();

    let stats = db.stats();
    println!("elapsed          {:.2?}", elapsed);
    println!("rows appended    {}", counters.appended.load(Ordering::Relaxed));
    println!("rows visible     {}", visible);
    println!("updates          {}", counters.updated.load(Ordering::Relaxed));
    println!("update conflicts {}", counters.conflicts.load(Ordering::Relaxed));
    println!("compactions      {}", counters.compacted.load(Ordering::Relaxed));
    println!("blocks flushed   {}", flushed);
    println!("txns committed   {} / aborted {}", stats.committed, stats.aborted);
    println!(
        "buffer           resident {} B, peak {} B, loads {}, evictions {}, exhausted {}",
        stats.resident_bytes,
        stats.buffer.peak_resident,
        stats.buffer.loads,
        stats.buffer.evictions,
        stats.buffer.exhausted
    );
    for kind in TaskKind::ALL {
        let t = db.scheduler().stats(kind);
        if t.scheduled > 0 {
            println!("tasks {:<10} scheduled {}, completed {}, failed {}", format!("{:?}", kind), t.scheduled, t.completed, t.failed);
        }
    }

    if visible != counters.appended.load(Ordering::Relaxed) as usize {
        return Err(strata::StrataError::Invariant(format!(
            "{} rows visible after appending {}",
            visible,
            counters.appended.load(Ordering::Relaxed)
        )));
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Stress run failed: {}", e);
        std::process::exit(1);
    }
}
