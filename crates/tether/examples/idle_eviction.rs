//! Idle eviction example.
//!
//! Registers a few simulated remote shells, keeps one busy, and lets the
//! janitor evict the rest.
//!
//! Run with: `RUST_LOG=debug cargo run -p tether --example idle_eviction`

use std::time::Duration;

use async_trait::async_trait;
use tether::{Connection, Handle, HandleError, RegistryConfig, SequentialGenerator, SessionRegistry};
use tracing_subscriber::EnvFilter;

/// A pretend remote shell.
struct Shell {
    host: String,
}

struct Transfer {
    host: String,
}

#[async_trait]
impl Handle for Shell {
    async fn close(&mut self) -> Result<(), HandleError> {
        println!("  [{}] shell closed", self.host);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "shell"
    }
}

#[async_trait]
impl Connection for Shell {
    type Channel = Transfer;

    async fn open_channel(&mut self) -> Result<Transfer, HandleError> {
        println!("  [{}] transfer channel opened", self.host);
        Ok(Transfer {
            host: self.host.clone(),
        })
    }
}

#[async_trait]
impl Handle for Transfer {
    async fn close(&mut self) -> Result<(), HandleError> {
        println!("  [{}] transfer channel closed", self.host);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "transfer"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = RegistryConfig::default()
        .with_idle_timeout(Duration::from_millis(300))
        .with_sweep_interval(Duration::from_millis(50));
    let registry = std::sync::Arc::new(
        SessionRegistry::new(config)?.with_id_generator(SequentialGenerator::new("shell")),
    );
    registry.start_janitor();

    let mut ids = Vec::new();
    for host in ["alpha", "bravo", "charlie"] {
        let shell = Shell {
            host: host.to_string(),
        };
        ids.push(registry.create_labeled(shell, Some(format!("ops@{host}")))?);
    }
    let busy = ids[0].clone();

    if let Some(session) = registry.get(&busy) {
        session.handles().await.channel().await?;
    }

    for tick in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.touch(&busy);
        println!("t+{}ms:", (tick + 1) * 100);
        for info in registry.list() {
            println!(
                "  {} {:<14} idle {}",
                info.id,
                info.label.unwrap_or_default(),
                info.idle_display
            );
        }
    }

    let stats = registry.stats();
    println!(
        "live={} evicted={} created={}",
        stats.live, stats.evicted_total, stats.created_total
    );

    registry.shutdown().await;
    Ok(())
}
