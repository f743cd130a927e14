use anvilq::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    pub name: String,
    pub message: String,
}

struct HelloHandler;

#[async_trait]
impl TaskHandler for HelloHandler {
    async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> AnvilResult<Value> {
        let greeting: Greeting = serde_json::from_value(args.into_iter().next().unwrap_or_default())
            .map_err(|e| AnvilError::permanent(format!("bad greeting: {e}")))?;

        println!("👋 Hello {}: {}", greeting.name, greeting.message);
        tokio::time::sleep(Duration::from_millis(200)).await;
        println!("✅ Task {} completed for {}", ctx.task_id, greeting.name);
        Ok(json!({ "greeted": greeting.name }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AnvilConfig::development()
        .with_rate_limit("greetings", CategoryRateLimit::delay(20, 5, 5_000));
    anvilq::telemetry::init_tracing(&config.logging);

    println!("🚀 anvilq local example");

    let anvil = Anvil::new(config).await?;
    anvil.register("hello", HelloHandler).await;
    anvil
        .register_fn("flaky", |ctx, _args| async move {
            if ctx.attempt < 3 {
                Err(AnvilError::transient(format!("attempt {} failed", ctx.attempt)))
            } else {
                Ok(json!("finally"))
            }
        })
        .await;

    anvil.start().await?;
    println!("🔨 anvilq started in memory mode");

    let names = ["Alice", "Bob", "Charlie", "Dave", "Eve"];
    let mut batch: Vec<TaskDescriptor> = names
        .iter()
        .map(|name| {
            TaskDescriptor::new("hello")
                .category("greetings")
                .worker_type("IO_INTENSIVE")
                .args(vec![json!({ "name": name, "message": "Welcome to anvilq" })])
        })
        .collect();
    batch.push(TaskDescriptor::new("hello").priority("SUPER_URGENT"));
    batch.push(TaskDescriptor::new("flaky").priority("HIGH").max_retries(3));

    let report = anvil.submit_batch(batch, BatchMode::Sequential).await;
    println!(
        "📥 Batch: {} submitted, {} rejected",
        report.total_submitted, report.total_errors
    );
    for error in &report.errors {
        println!("   ❌ #{}: {}", error.index, error.error);
    }

    tokio::time::sleep(Duration::from_secs(8)).await;

    let metrics = anvil.get_metrics().await?;
    println!("📊 {}", serde_json::to_string_pretty(&metrics)?);

    anvil.stop().await?;
    println!("🔨 anvilq stopped");
    Ok(())
}
