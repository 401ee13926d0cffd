use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use msgqueue_core::domain::HandlerError;
use msgqueue_core::{Handler, Message, QueueBuilder, QueueConfig, QueueRegistry};

/// Pretty output in debug builds, JSON in release. Level from `RUST_LOG`,
/// default `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    }
}

/// Config from the path given as the first argument, defaults otherwise.
fn load_config() -> Result<QueueConfig, Box<dyn std::error::Error>> {
    let Some(path) = std::env::args().nth(1) else {
        info!("no config file given, using defaults");
        return Ok(QueueConfig {
            name: "greetings".to_string(),
            retry_limit: 3,
            min_backoff_ms: 200,
            ..QueueConfig::default()
        });
    };
    let raw = std::fs::read_to_string(Path::new(&path))?;
    let config = QueueConfig::from_json(&raw)?;
    info!(path = %path, queue = %config.name, "loaded configuration");
    Ok(config)
}

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

/// Fails while `remaining_failures` is non-zero, then greets.
struct FlakyGreeter {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler for FlakyGreeter {
    async fn handle_message(&self, msg: &Message) -> Result<(), HandlerError> {
        let Some(arg) = msg.args.first() else {
            return Err(HandlerError::ArgumentMismatch {
                got: 0,
                expected: 1,
            });
        };
        let greeting: Greeting =
            serde_json::from_value(arg.clone()).map_err(|e| HandlerError::InvalidArgument {
                index: 0,
                reason: e.to_string(),
            })?;

        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(HandlerError::failed(format!(
                "intentional failure (left={left})"
            )));
        }

        info!(message_id = %msg.id, retry_count = msg.retry_count, "hello, {}!", greeting.name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = load_config()?;

    let mut registry = QueueRegistry::new();
    let greetings = registry.register(
        QueueBuilder::from_config(config)
            .handler(FlakyGreeter {
                remaining_failures: AtomicU32::new(2),
            })
            .build()?,
    )?;
    let echo = registry.register(
        QueueBuilder::new("echo")
            .handler_fn(|word: String, times: usize| async move {
                info!("{}", word.repeat(times));
            })
            .worker_limit(1)
            .build()?,
    )?;

    greetings.call((serde_json::json!({ "name": "world" }),)).await?;
    greetings
        .add(
            Message::from_args(vec![serde_json::json!({ "name": "later" })])
                .with_delay(Duration::from_millis(500)),
        )
        .await?;

    for _ in 0..3 {
        let outcome = echo.call_once(Duration::from_millis(100), ("ab", 3)).await?;
        if outcome.is_duplicate() {
            info!(message_id = %outcome.id(), "collapsed into pending call");
        }
    }
    // Wrong arity: dead-lettered without running the function.
    echo.call(("only one",)).await?;

    for (name, err) in registry.close_all().await {
        warn!(queue = %name, error = %err, "queue did not close cleanly");
    }

    for name in registry.names() {
        let Some(queue) = registry.get(&name) else {
            continue;
        };
        let status = queue.status().await?;
        info!(status = %serde_json::to_string(&status)?, "final status");
        for dead in queue.dead_letters().await? {
            warn!(queue = %name, message_id = %dead.id, error = ?dead.last_error, "dead letter");
        }
    }

    Ok(())
}
