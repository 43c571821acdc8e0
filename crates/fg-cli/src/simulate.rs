use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Args;
use rand::Rng;
use tracing::info;

use fg_config::Config;
use fg_core::{DegradeReason, Governance, LlmProvider};
use fg_db::{Database, KeyRepository};
use fg_types::{ApiKey, ChatMessage, LlmRequest, LlmResponse, QueuedItem, UpstreamError};

const SAMPLE_MESSAGES: &[&str] = &[
    "hi, are you open today?",
    "how much is the blue jacket?",
    "is size M available?",
    "I'd like to book an appointment for friday",
    "my payment failed at checkout",
    "I want a refund, this is unacceptable",
    "thanks!",
    "where is my delivery?",
];

/// Longest time to wait for the queue to drain.
const DRAIN_TIMEOUT_SECS: u64 = 120;

/// `Retry-After` value sent with simulated 429s.
const RETRY_AFTER_HEADER: &str = "0.2";

#[derive(Args)]
pub struct SimulateArgs {
    /// Number of inbound messages
    #[arg(long, default_value_t = 50)]
    messages: usize,
    /// Distinct senders the messages are spread over
    #[arg(long, default_value_t = 20)]
    senders: usize,
    /// Probability of a 5xx from the simulated provider
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,
    /// Probability of a 429 from the simulated provider
    #[arg(long, default_value_t = 0.05)]
    rate_limit_rate: f64,
    /// Pause between arrivals, in milliseconds
    #[arg(long, default_value_t = 20)]
    arrival_ms: u64,
}

/// Provider stand-in with random latency and failures.
struct SimulatedProvider {
    name: String,
    failure_rate: f64,
    rate_limit_rate: f64,
}

#[async_trait]
impl LlmProvider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &LlmRequest, _api_key: &str) -> Result<LlmResponse, UpstreamError> {
        let (latency_ms, roll) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(20..150), rng.gen::<f64>())
        };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        if roll < self.rate_limit_rate {
            return Err(UpstreamError::http(429, "rate_limit_error")
                .with_retry_after_header(RETRY_AFTER_HEADER));
        }
        if roll < self.rate_limit_rate + self.failure_rate {
            return Err(UpstreamError::http(503, "overloaded"));
        }

        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(LlmResponse {
            text: format!("Thanks for your message: {prompt}"),
        })
    }
}

pub async fn run(config: &Config, args: SimulateArgs) -> anyhow::Result<()> {
    for (name, p) in [("failure-rate", args.failure_rate), ("rate-limit-rate", args.rate_limit_rate)] {
        if !(0.0..=1.0).contains(&p) {
            bail!("--{name} must be between 0 and 1");
        }
    }

    let db = Arc::new(Database::in_memory().await.context("Failed to open database")?);
    db.initialize().await.context("Failed to initialize database")?;
    let provider_name = config.default_provider.clone();
    let repo = KeyRepository::new(&db);
    for (id, priority) in [("sim-a", 0), ("sim-b", 0), ("sim-c", 2)] {
        repo.upsert_key(&ApiKey::new(id, &provider_name, format!("sk-{id}"), priority))
            .await
            .context("Failed to seed keys")?;
    }

    let provider = Arc::new(SimulatedProvider {
        name: provider_name.clone(),
        failure_rate: args.failure_rate,
        rate_limit_rate: args.rate_limit_rate,
    });
    let gov = Governance::start(config, db.clone(), provider).await;

    let served = Arc::new(AtomicUsize::new(0));
    let degraded = Arc::new(AtomicUsize::new(0));
    let handler = {
        let client = gov.client.clone();
        let model = config.default_model.clone();
        let served = served.clone();
        let degraded = degraded.clone();
        Arc::new(move |item: QueuedItem| {
            let client = client.clone();
            let model = model.clone();
            let served = served.clone();
            let degraded = degraded.clone();
            async move {
                let request = LlmRequest {
                    messages: vec![ChatMessage::user(item.payload)],
                    model,
                    streaming: false,
                };
                let reply = client.call_or_degrade(&request, None).await?;
                if reply.degraded.is_some() {
                    degraded.fetch_add(1, Ordering::Relaxed);
                } else {
                    served.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
        })
    };
    let mut worker = gov.queue.start_workers(handler);

    info!(messages = args.messages, "Simulation started");
    let senders = args.senders.max(1);
    let mut rejected = 0;
    for i in 0..args.messages {
        let text = SAMPLE_MESSAGES[i % SAMPLE_MESSAGES.len()];
        let sender = format!("sender-{}", i % senders);
        if gov.queue.enqueue(&sender, text, None, None).await.is_none() {
            gov.client.degrade(DegradeReason::QueueFull);
            rejected += 1;
        }
        tokio::time::sleep(Duration::from_millis(args.arrival_ms)).await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(DRAIN_TIMEOUT_SECS);
    loop {
        let stats = gov.queue.stats().await;
        if stats.queued == 0 && stats.in_flight == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            println!("Queue did not drain within {DRAIN_TIMEOUT_SECS}s");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    worker.stop();

    print_report(&gov, &provider_name, served.load(Ordering::Relaxed), degraded.load(Ordering::Relaxed), rejected)
        .await;
    gov.shutdown().await;
    db.close().await;
    Ok(())
}

async fn print_report(gov: &Governance, provider: &str, served: usize, degraded: usize, rejected: usize) {
    println!("== replies");
    println!("served {served}, degraded {degraded}, rejected at admission {rejected}");
    for (reason, count) in gov.client.degraded_counts() {
        println!("  degraded {reason}: {count}");
    }

    let q = gov.queue.stats().await;
    println!("== queue");
    println!(
        "enqueued {}, duplicates {}, dropped {}, completed {}, failed {}, timed out {}, avg wait {:.0}ms",
        q.enqueued_total,
        q.duplicates_total,
        q.dropped_total,
        q.completed_total,
        q.failed_total,
        q.timed_out_total,
        q.avg_wait_ms
    );

    println!("== circuit");
    for status in gov.breakers.snapshot().await {
        println!(
            "{}: {} (failures {}, probe successes {})",
            status.provider, status.state, status.failures, status.successes
        );
    }

    let r = gov.rate.stats(provider).await;
    println!("== rate");
    println!(
        "{:.1} req/min, {} errors ({:.0}%), {} rate limited, latency avg {:.0}ms",
        r.requests_last_minute,
        r.errors,
        r.error_rate * 100.0,
        r.rate_limit_hits,
        r.avg_latency_ms
    );

    println!("== keys");
    for k in gov.keys.pool_status(provider).await {
        let cooldown = k
            .cooldown_remaining
            .map_or("-".to_string(), |d| format!("{}s", d.as_secs()));
        println!(
            "{} weight {} today {} 429s {} cooldown {}",
            k.id, k.weight, k.requests_today, k.rate_limit_hits, cooldown
        );
    }
}
