use std::io::Write;
use std::time::Duration;

use isoworker::{
    Global, PoolConfig, TransferMode, WaitForMultiple, Worker, WorkerConfig, WorkerPool,
};

#[derive(Debug, Clone)]
struct Singleton {
    age: u32,
}

isoworker::impl_transfer_by_clone!(Singleton);

static GLOBAL_INT: Global<i32> = Global::new("global_int", 10);
static SINGLETON: Global<Singleton> = Global::new("singleton", Singleton { age: 20 });

fn sleep_secs(secs: u64) {
    std::thread::sleep(Duration::from_secs(secs));
}

/// One job on one worker, consumed after the caller has done its own work.
async fn standard_sample() -> anyhow::Result<()> {
    let worker = Worker::start(WorkerConfig::default())?;

    let future = worker.schedule(TransferMode::Checked, || 18782, |input: i32| {
        sleep_secs(2);
        println!("worker done!");
        input + input
    });

    println!("process 1 done!");
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("process 2 done!");
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("process 3 done!");

    future.consume(|sum| println!("sync result = {sum}")).await?;
    worker.request_termination().result().await?;
    Ok(())
}

/// A job sees the global as it was when scheduled and its writes stay local.
async fn global_var_sample() -> anyhow::Result<()> {
    GLOBAL_INT.set(20);
    println!("main1: global_int = {}", GLOBAL_INT.get());

    let worker = Worker::start(WorkerConfig::default())?;
    let future = worker.schedule(TransferMode::Checked, || 18782, |input: i32| {
        sleep_secs(1);
        println!("worker: global_int = {}", GLOBAL_INT.get());
        GLOBAL_INT.set(-1);
        input + input
    });

    println!("main2: global_int = {}", GLOBAL_INT.get());
    future.consume(|sum| println!("sync result = {sum}")).await?;
    println!("main3: global_int = {}", GLOBAL_INT.get());

    worker.request_termination().result().await?;
    Ok(())
}

async fn singleton_sample() -> anyhow::Result<()> {
    SINGLETON.update(|s| s.age = 30);
    println!("main1: singleton.age = {}", SINGLETON.with(|s| s.age));

    let worker = Worker::start(WorkerConfig::default())?;
    let future = worker.schedule(TransferMode::Checked, || 18782, |input: i32| {
        sleep_secs(1);
        println!("worker: singleton.age = {}", SINGLETON.with(|s| s.age));
        input + input
    });

    println!("main2: singleton.age = {}", SINGLETON.with(|s| s.age));
    future.consume(|sum| println!("sync result = {sum}")).await?;

    worker.request_termination().result().await?;
    Ok(())
}

/// Ten workers sleeping 0..9 seconds, collected by a polling loop that never
/// blocks longer than the poll interval.
async fn non_blocking_sample(config: &PoolConfig) -> anyhow::Result<()> {
    let pool = WorkerPool::start(&PoolConfig {
        size: 10,
        ..config.clone()
    })?;

    let futures: Vec<_> = (0..pool.len())
        .map(|index| {
            pool.schedule_on(index, TransferMode::Checked, move || index as u64, |secs: u64| {
                sleep_secs(secs);
                println!("\ndone1![{secs}]");
                format!("done2![{secs}]")
            })
        })
        .collect();

    let mut consumed = 0;
    while consumed < futures.len() {
        let ready = futures.wait_for_multiple(config.poll_interval).await;
        for future in &ready {
            println!("{}", future.result().await?);
            consumed += 1;
        }
        if ready.is_empty() {
            tokio::time::sleep(config.poll_interval).await;
        }
        // a dot per iteration shows the loop is not blocked
        print!(".");
        std::io::stdout().flush()?;
    }
    println!();

    pool.terminate_all().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PoolConfig::from_env()?;

    println!("-- standard ------------------------------------->\n");
    standard_sample().await?;
    println!("\n-- global value ------------------------------------->\n");
    global_var_sample().await?;
    println!("\n-- global object ------------------------------------->\n");
    singleton_sample().await?;
    println!("\n-- non blocking ------------------------------------->\n");
    non_blocking_sample(&config).await?;

    Ok(())
}
