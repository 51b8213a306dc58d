// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tcpframe::service::{setup_local_tracing_with_level, BenchConfig, PingConfig};
use tcpframe::{handler_fn, AppConfig, AppError, AppResult, Client, Handler, Server};
use tokio::runtime;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, error, info};

const DEFAULT_CONFIG_FILE: &str = "conf.toml";
const DEFAULT_ADDR: &str = "127.0.0.1:9001";
const ECHO_PREFIX: &[u8] = b"echo:";
const BENCH_BUFFER_SIZE: usize = 1024;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run an echo server until Ctrl-C
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
    /// Load test an in-process echo server
    Bench {
        #[arg(long)]
        workers: Option<usize>,
        /// seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Probe a server until Ctrl-C
    Ping {
        #[arg(long)]
        addr: Option<String>,
    },
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_local_tracing_with_level(level)?;

    let mut config = load_config(commandline.conf.as_deref())?;
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command.unwrap_or(Command::Serve { addr: None }) {
        Command::Serve { addr } => {
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            if config.server.addr.is_empty() {
                config.server.addr = DEFAULT_ADDR.to_string();
            }
            rt.block_on(serve(config))
        }
        Command::Bench { workers, duration } => {
            if let Some(workers) = workers {
                config.bench.workers = workers;
            }
            if let Some(duration) = duration {
                config.bench.duration_secs = duration;
            }
            rt.block_on(bench(config))
        }
        Command::Ping { addr } => {
            if let Some(addr) = addr {
                config.client.remote_addr = addr;
            }
            if config.client.remote_addr.is_empty() {
                config.client.remote_addr = DEFAULT_ADDR.to_string();
            }
            rt.block_on(ping(config))
        }
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

fn load_config(conf: Option<&str>) -> AppResult<AppConfig> {
    match conf {
        Some(path) => AppConfig::set_up_config(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            AppConfig::set_up_config(DEFAULT_CONFIG_FILE)
        }
        None => Ok(AppConfig::default()),
    }
}

/// Replies `"echo:" + payload` to every packet.
fn echo_handler() -> impl Handler {
    handler_fn(|writer, packet| {
        Box::pin(async move {
            let mut response = Vec::with_capacity(ECHO_PREFIX.len() + packet.data.len());
            response.extend_from_slice(ECHO_PREFIX);
            response.extend_from_slice(&packet.data);
            if let Err(e) = writer.reply(&response).await {
                debug!("reply to {} failed: {}", packet.remote_addr, e);
            }
        })
    })
}

fn task_result<T>(result: Result<AppResult<T>, JoinError>, task: &str) -> AppResult<T> {
    result.map_err(|e| AppError::IllegalStateError(format!("{} task: {}", task, e)))?
}

async fn serve(config: AppConfig) -> AppResult<()> {
    let server = Arc::new(Server::new(config.server, echo_handler())?);
    let addr = server.listen().await?;
    println!("echo server listening on {}", addr);

    let serving = server.clone();
    let mut server_task = tokio::spawn(async move { serving.listen_and_serve().await });
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("received ctrl-c, closing server");
            server.close();
        }
        result = &mut server_task => return task_result(result, "server"),
    }
    match task_result(server_task.await, "server") {
        Err(AppError::ServerClosed) => Ok(()),
        other => other,
    }
}

async fn ping(config: AppConfig) -> AppResult<()> {
    let PingConfig {
        payload,
        max_retry,
        interval_ms,
        timeout_ms,
    } = config.ping;
    let client = Client::connect(config.client)?;
    println!("pinging {}", client.config().remote_addr);

    let probe = client.clone();
    let mut probing = tokio::spawn(async move {
        probe
            .ping(
                payload.as_bytes(),
                max_retry,
                Duration::from_millis(interval_ms),
                Duration::from_millis(timeout_ms),
            )
            .await
    });
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("received ctrl-c, closing client");
            client.close();
        }
        result = &mut probing => return task_result(result, "ping"),
    }
    task_result(probing.await, "ping")
}

async fn bench(config: AppConfig) -> AppResult<()> {
    let bench = config.bench;
    let workers = bench.workers.max(1);

    let server = Arc::new(Server::new(
        tcpframe::ServerConfig::new("127.0.0.1:0"),
        echo_handler(),
    )?);
    let addr = server.listen().await?;
    let serving = server.clone();
    tokio::spawn(async move { serving.listen_and_serve().await });

    let mut client_config = config.client;
    client_config.remote_addr = addr.to_string();
    if client_config.max_conn_count <= 0 {
        client_config.max_conn_count = i32::try_from(workers).unwrap_or(i32::MAX);
    }
    let client = Client::connect(client_config)?;

    let bounds = latency_bounds(&bench);
    let request_timeout = Duration::from_millis(bench.request_timeout_ms);
    let payload: Arc<[u8]> = Arc::from(bench.payload.into_bytes());
    println!(
        "benchmark write_read: {} workers, {} connections, {}s",
        workers,
        client.pool().max_size(),
        bench.duration_secs
    );

    let started = Instant::now();
    let end = started + Duration::from_secs(bench.duration_secs);
    let mut tasks = Vec::with_capacity(workers);
    for _ in 0..workers {
        let client = client.clone();
        let bounds = bounds.clone();
        let payload = payload.clone();
        tasks.push(tokio::spawn(async move {
            let mut stats = BenchStats::new(bounds.len());
            let mut buf = vec![0u8; BENCH_BUFFER_SIZE];
            while Instant::now() < end {
                let begin = Instant::now();
                let result = client
                    .write_read(begin + request_timeout, &payload, &mut buf)
                    .await;
                stats.record(&bounds, begin.elapsed(), result);
            }
            stats
        }));
    }

    let mut total = BenchStats::new(bounds.len());
    for task in tasks {
        match task.await {
            Ok(stats) => total.merge(stats),
            Err(e) => error!("bench worker failed: {}", e),
        }
    }
    let elapsed = started.elapsed();
    client.close();
    server.close();

    total.report(&bounds, elapsed);
    Ok(())
}

/// Upper bounds of the latency buckets: `start`, `2 * start`, `4 * start`, ...
fn latency_bounds(bench: &BenchConfig) -> Vec<Duration> {
    let start = Duration::from_millis(bench.latency_start_ms);
    (0..bench.latency_buckets)
        .map(|i| start.saturating_mul(2u32.saturating_pow(i as u32)))
        .collect()
}

#[derive(Debug)]
struct BenchStats {
    requests: u64,
    failures: u64,
    total_latency: Duration,
    /// one count per bound, plus one for everything slower
    buckets: Vec<u64>,
    errors: HashMap<String, u64>,
}

impl BenchStats {
    fn new(bound_count: usize) -> Self {
        BenchStats {
            requests: 0,
            failures: 0,
            total_latency: Duration::ZERO,
            buckets: vec![0; bound_count + 1],
            errors: HashMap::new(),
        }
    }

    fn record(&mut self, bounds: &[Duration], latency: Duration, result: AppResult<usize>) {
        self.requests += 1;
        self.total_latency += latency;
        let bucket = bounds
            .iter()
            .position(|bound| latency < *bound)
            .unwrap_or(bounds.len());
        self.buckets[bucket] += 1;
        if let Err(e) = result {
            self.failures += 1;
            *self.errors.entry(e.to_string()).or_default() += 1;
        }
    }

    fn merge(&mut self, other: BenchStats) {
        self.requests += other.requests;
        self.failures += other.failures;
        self.total_latency += other.total_latency;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets) {
            *mine += theirs;
        }
        for (error, count) in other.errors {
            *self.errors.entry(error).or_default() += count;
        }
    }

    fn report(&self, bounds: &[Duration], elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let average = match self.requests {
            0 => Duration::ZERO,
            n => self.total_latency / u32::try_from(n).unwrap_or(u32::MAX),
        };
        println!("requests:   {}", self.requests);
        println!("failures:   {}", self.failures);
        println!("throughput: {:.1} req/s", self.requests as f64 / secs);
        println!("average:    {:?}", average);
        println!("latency:");
        let mut lower = Duration::ZERO;
        for (i, count) in self.buckets.iter().enumerate() {
            let percent = match self.requests {
                0 => 0.0,
                n => *count as f64 * 100.0 / n as f64,
            };
            match bounds.get(i) {
                Some(upper) => {
                    println!("  {:>8?} - {:<8?} {:>10} {:>6.2}%", lower, upper, count, percent);
                    lower = *upper;
                }
                None => println!("  {:>8?} +          {:>10} {:>6.2}%", lower, count, percent),
            }
        }
        let mut errors: Vec<_> = self.errors.iter().collect();
        errors.sort_by(|a, b| b.1.cmp(a.1));
        if !errors.is_empty() {
            println!("errors:");
            for (error, count) in errors.into_iter().take(10) {
                println!("  {:>10} {}", count, error);
            }
        }
    }
}
