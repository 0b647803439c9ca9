//! Built-in demo programs. The entry point of a job is compiled in, so the
//! launcher exposes a registry of named SPMD programs.

use pcj::{from_bytes, to_bytes, Ctx, Job, Result};

const STORAGE: &str = "shared";

pub fn lookup(name: &str) -> Option<Job> {
    match name {
        "hello" => Some(Job::new(hello)),
        "allreduce" => Some(Job::new(allreduce).op("sum_i64", sum_i64)),
        "pingpong" => Some(Job::new(pingpong)),
        _ => None,
    }
}

pub fn names() -> Vec<&'static str> {
    vec!["hello", "allreduce", "pingpong"]
}

fn sum_i64(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    let (a, b) = (from_bytes::<i64>(a)?, from_bytes::<i64>(b)?);
    Ok(to_bytes(&(a + b)))
}

/// Every thread introduces itself, fenced by barriers so the output is not
/// interleaved with the bootstrap logging.
fn hello(ctx: &mut Ctx) -> Result<()> {
    ctx.barrier()?;
    println!("Hello from thread {} of {}", ctx.my_id(), ctx.thread_count());
    ctx.barrier()?;
    Ok(())
}

/// Each thread contributes its id; thread 0 reduces the sum over the
/// global group and prints it.
fn allreduce(ctx: &mut Ctx) -> Result<()> {
    ctx.register(STORAGE, &["value"])?;
    ctx.put_local(STORAGE, "value", &(ctx.my_id() as i64))?;
    ctx.barrier()?;

    if ctx.my_id() == 0 {
        let global = ctx.global();
        let sum: i64 = ctx.reduce(&global, STORAGE, "value", "sum_i64")?.get()?;
        println!("Sum of thread ids: {}", sum);
    }

    ctx.barrier()?;
    Ok(())
}

/// Thread 0 puts a counter into thread N-1's storage, which bounces it
/// back, exercising the one-sided path in both directions.
fn pingpong(ctx: &mut Ctx) -> Result<()> {
    if ctx.thread_count() < 2 {
        return Ok(());
    }

    ctx.register(STORAGE, &["ping", "pong"])?;
    ctx.barrier()?;

    let last = ctx.thread_count() - 1;

    if ctx.my_id() == 0 {
        ctx.put(last, STORAGE, "ping", &7i64)?.get()?;
        ctx.monitor(STORAGE, "pong")?;

        let answer: i64 = ctx.get_local(STORAGE, "pong")?;
        println!("Pong received: {}", answer);
    } else if ctx.my_id() == last {
        ctx.monitor(STORAGE, "ping")?;

        let value: i64 = ctx.get_local(STORAGE, "ping")?;
        ctx.put(0, STORAGE, "pong", &(value + 1))?.get()?;
    }

    ctx.barrier()?;
    Ok(())
}
