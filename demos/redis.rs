use anvilq::prelude::*;
use serde_json::{Value, json};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let nodes = std::env::var("ANVILQ_REDIS_NODES")
        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let nodes: Vec<String> = nodes.split(',').map(str::to_string).collect();

    println!("🚀 anvilq Redis example");
    println!("🔗 Connecting to Redis at {:?}", nodes);

    let config = AnvilConfig {
        queue: QueueConfig::redis(nodes)
            .with_visibility_timeout(120)
            .with_memory_fallback(true),
        ..AnvilConfig::development()
    };
    anvilq::telemetry::init_tracing(&config.logging);

    // With the fallback enabled, an unreachable store yields memory mode.
    let anvil = Anvil::new(config).await?;
    println!("⚙️ Queue store: {}", anvil.queue().kind());

    anvil
        .register_fn("report", |ctx, args: Vec<Value>| async move {
            let guard = ctx
                .locks()
                .acquire_timeout("nightly-report", Duration::from_secs(30), Duration::from_secs(5))
                .await?;
            println!("📝 Task {} building report {:?}", ctx.task_id, args);
            tokio::time::sleep(Duration::from_millis(500)).await;
            guard.release().await?;
            Ok::<_, AnvilError>(json!("report ready"))
        })
        .await;

    anvil.start().await?;
    println!("✅ anvilq started, press Ctrl+C to stop");

    for (i, priority) in ["LOW", "NORMAL", "CRITICAL"].iter().enumerate() {
        let receipt = anvil
            .submit(
                TaskDescriptor::new("report")
                    .priority(*priority)
                    .worker_type("GENERAL_PURPOSE")
                    .category("reports")
                    .args(vec![json!(i)]),
            )
            .await?;
        println!(
            "📥 Task {} ({}) queued on partition {}",
            receipt.task_id, priority, receipt.partition
        );
    }

    anvil.wait_for_shutdown().await?;
    Ok(())
}
