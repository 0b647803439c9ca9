//! Whole-cluster tests: several nodes run as threads of this process and
//! talk over localhost TCP, exercising the full bootstrap, collective and
//! shutdown paths.

use lazy_static::lazy_static;
use pcj::{from_bytes, to_bytes, Ctx, ErrorKind, Job, Properties, Settings, TaskCtx};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

const STORAGE: &str = "shared";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Error probing for a free port")
        .local_addr()
        .unwrap()
        .port()
}

fn test_props() -> Properties {
    let mut props = Properties::default();
    props.workers_count = 4;
    props.chunk_size = 64;
    props
}

/// Runs one job across several in-process nodes and returns each node's
/// `start` outcome, in node order.
fn launch(threads_per_node: &[&[u32]], total: u32, job: Job) -> Vec<pcj::Result<()>> {
    let node0_port = free_port();
    let node0 = format!("127.0.0.1:{}", node0_port);

    let handles: Vec<_> = threads_per_node
        .iter()
        .enumerate()
        .map(|(index, &local)| {
            let settings = Settings {
                host: "127.0.0.1".to_string(),
                port: if index == 0 { node0_port } else { 0 },
                node0: node0.clone(),
                coordinator: index == 0,
                total_threads: total,
                local_threads: local.to_vec(),
                props: test_props(),
                logger: None,
            };
            let job = job.clone();

            thread::Builder::new()
                .name(format!("node-{}", index))
                .spawn(move || pcj::start(settings, job))
                .unwrap()
        })
        .collect();

    handles
        .into_iter()
        .map(|handle| handle.join().expect("Node thread panicked"))
        .collect()
}

fn assert_all_ok(results: Vec<pcj::Result<()>>) {
    for (node, result) in results.iter().enumerate() {
        assert!(result.is_ok(), "node {} failed: {:?}", node, result);
    }
}

fn sum_i64(a: &[u8], b: &[u8]) -> pcj::Result<Vec<u8>> {
    let (a, b) = (from_bytes::<i64>(a)?, from_bytes::<i64>(b)?);
    Ok(to_bytes(&(a + b)))
}

// --- barrier -------------------------------------------------------------

static BARRIER_ENTERED: AtomicUsize = AtomicUsize::new(0);

fn barrier_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    BARRIER_ENTERED.fetch_add(1, Ordering::SeqCst);
    ctx.barrier()?;

    // No future resolves before all four threads have entered.
    assert_eq!(BARRIER_ENTERED.load(Ordering::SeqCst), 4);
    Ok(())
}

#[test]
fn barrier_releases_only_when_everyone_entered() {
    let results = launch(&[&[0, 1], &[2, 3]], 4, Job::new(barrier_entry));
    assert_all_ok(results);
}

// --- broadcast -----------------------------------------------------------

fn broadcast_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    ctx.register(STORAGE, &["x"])?;
    ctx.barrier()?;

    if ctx.my_id() == 0 {
        let global = ctx.global();
        ctx.broadcast(&global, STORAGE, "x", &42i64)?.get()?;
    }

    ctx.barrier()?;

    let x: i64 = ctx.get_local(STORAGE, "x")?;
    assert_eq!(x, 42);
    Ok(())
}

#[test]
fn broadcast_is_visible_before_the_next_barrier() {
    let results = launch(&[&[0], &[1], &[2, 3]], 4, Job::new(broadcast_entry));
    assert_all_ok(results);
}

lazy_static! {
    static ref RACED_VALUES: Mutex<Vec<i64>> = Mutex::new(Vec::new());
}

fn broadcast_race_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    ctx.register(STORAGE, &["x"])?;
    ctx.barrier()?;

    let global = ctx.global();
    if ctx.my_id() == 0 {
        ctx.broadcast(&global, STORAGE, "x", &42i64)?.get()?;
    } else if ctx.my_id() == 1 {
        ctx.broadcast(&global, STORAGE, "x", &7i64)?.get()?;
    }

    ctx.barrier()?;

    let x: i64 = ctx.get_local(STORAGE, "x")?;
    RACED_VALUES.lock().unwrap().push(x);
    Ok(())
}

#[test]
fn concurrent_broadcasts_agree_everywhere() {
    let results = launch(&[&[0, 1], &[2], &[3]], 4, Job::new(broadcast_race_entry));
    assert_all_ok(results);

    let values = RACED_VALUES.lock().unwrap();
    assert_eq!(values.len(), 4);
    assert!(values[0] == 42 || values[0] == 7);
    assert!(values.iter().all(|&v| v == values[0]), "mixed values: {:?}", *values);
}

// --- reduce and collect --------------------------------------------------

fn reduce_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    ctx.register(STORAGE, &["value"])?;
    ctx.put_local(STORAGE, "value", &(ctx.my_id() as i64))?;
    ctx.barrier()?;

    let global = ctx.global();

    if ctx.my_id() == 2 {
        let sum: i64 = ctx.reduce(&global, STORAGE, "value", "sum_i64")?.get()?;
        assert_eq!(sum, 0 + 1 + 2 + 3);
    }

    if ctx.my_id() == 1 {
        let values: Vec<i64> = ctx.collect(&global, STORAGE, "value")?.get()?;
        assert_eq!(values, vec![0, 1, 2, 3]);
    }

    ctx.barrier()?;
    Ok(())
}

#[test]
fn reduce_sums_and_collect_orders() {
    let job = Job::new(reduce_entry).op("sum_i64", sum_i64);
    let results = launch(&[&[0, 3], &[1], &[2]], 4, job);
    assert_all_ok(results);
}

fn reduce_unknown_op_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    ctx.register(STORAGE, &["value"])?;
    ctx.put_local(STORAGE, "value", &1i64)?;
    ctx.barrier()?;

    if ctx.my_id() == 0 {
        let global = ctx.global();
        let err = ctx
            .reduce::<i64>(&global, STORAGE, "value", "no_such_op")?
            .get()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserException);
    }

    ctx.barrier()?;
    Ok(())
}

#[test]
fn reduce_with_unknown_operator_fails_cleanly() {
    let results = launch(&[&[0], &[1]], 2, Job::new(reduce_unknown_op_entry));
    assert_all_ok(results);
}

// --- get / put / accumulate / async-at -----------------------------------

fn bump(_ctx: &TaskCtx, arg: &[u8]) -> pcj::Result<Vec<u8>> {
    let value: i64 = from_bytes(arg)?;
    Ok(to_bytes(&(value + 1)))
}

fn getput_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    ctx.register(STORAGE, &["y", "acc"])?;

    if ctx.my_id() == 0 {
        ctx.put_local(STORAGE, "y", &vec![1i64, 2, 3])?;
    }

    ctx.barrier()?;

    if ctx.my_id() == 3 {
        // Remote get of a value another thread put.
        let y: Vec<i64> = ctx.get(0, STORAGE, "y")?.get()?;
        assert_eq!(y, vec![1, 2, 3]);

        // Unwritten variable.
        let err = ctx.get::<i64>(0, STORAGE, "missing")?.get().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchVariable);

        // Unregistered storage.
        let err = ctx.get::<i64>(0, "nope", "y")?.get().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchStorage);

        // Remote put, read back through a remote get.
        ctx.put(1, STORAGE, "y", &vec![9i64])?.get()?;
        let y: Vec<i64> = ctx.get(1, STORAGE, "y")?.get()?;
        assert_eq!(y, vec![9]);

        // Accumulate twice onto thread 2.
        ctx.accumulate(2, STORAGE, "acc", "sum_i64", &10i64)?.get()?;
        ctx.accumulate(2, STORAGE, "acc", "sum_i64", &5i64)?.get()?;
        let acc: i64 = ctx.get(2, STORAGE, "acc")?.get()?;
        assert_eq!(acc, 15);

        // A registered task runs against the remote thread.
        let bumped: i64 = ctx.async_at(1, "bump", &41i64)?.get()?;
        assert_eq!(bumped, 42);

        // Unknown tasks surface as user exceptions.
        let err = ctx.async_at::<i64, i64>(1, "no_such_task", &0i64)?.get().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserException);
    }

    ctx.barrier()?;
    Ok(())
}

#[test]
fn one_sided_operations() {
    let job = Job::new(getput_entry).op("sum_i64", sum_i64).task("bump", bump);
    let results = launch(&[&[0, 1], &[2, 3]], 4, job);
    assert_all_ok(results);
}

// --- group join ----------------------------------------------------------

lazy_static! {
    static ref JOINED: Mutex<HashMap<u32, u32>> = Mutex::new(HashMap::new());
}

fn join_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    // All ten threads race to join.
    let group = ctx.join_group("G")?;

    ctx.barrier()?;

    let group_thread_id = ctx.group_thread_id(&group)?;
    assert_eq!(ctx.group_size(&group)?, 10);

    JOINED.lock().unwrap().insert(ctx.my_id(), group_thread_id);

    // The joined group carries collectives of its own.
    ctx.barrier_on(&group)?;
    Ok(())
}

#[test]
fn ten_threads_join_one_group() {
    let results = launch(&[&[0, 1, 2, 3], &[4, 5, 6], &[7, 8, 9]], 10, Job::new(join_entry));
    assert_all_ok(results);

    let joined = JOINED.lock().unwrap();
    assert_eq!(joined.len(), 10);

    // Group thread ids are exactly 0..9, with no duplicates.
    let mut ids: Vec<u32> = joined.values().cloned().collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..10).collect::<Vec<u32>>());
}

// --- shutdown and failures -----------------------------------------------

fn trivial_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    ctx.barrier()?;
    Ok(())
}

#[test]
fn five_nodes_shut_down_cleanly() {
    let results = launch(&[&[0], &[1], &[2], &[3], &[4]], 5, Job::new(trivial_entry));
    assert_all_ok(results);
}

fn failing_entry(ctx: &mut Ctx) -> pcj::Result<()> {
    ctx.barrier()?;

    if ctx.my_id() == 2 {
        return Err(pcj::Error::with_detail(
            ErrorKind::UserException,
            "deliberate failure",
        ));
    }

    Ok(())
}

#[test]
fn user_error_is_reported_on_its_node() {
    let results = launch(&[&[0, 1], &[2, 3]], 4, Job::new(failing_entry));

    assert!(results[0].is_ok());
    let err = results[1].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserException);
    assert_eq!(err.detail(), "deliberate failure");
}

#[test]
fn single_node_job_runs_without_peers() {
    let results = launch(&[&[0, 1, 2]], 3, Job::new(trivial_entry));
    assert_all_ok(results);
}
