use std::time::Duration;

use log::{error, info};
use throttle::{Json, Rate, Throttle, ThrottleConfig};
use tokio_util::sync::CancellationToken;

// number of concurrent callers
const CALLERS: usize = 8;
// requests made by each caller
const REQUESTS_PER_CALLER: usize = 4;

// Usage: throttle_demo [config.json] [period-secs]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize env logger
    let _ = env_logger::builder().is_test(false).try_init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ThrottleConfig::from_file(path)?,
        None => ThrottleConfig {
            num_tokens: 2.0,
            capacity: 4.0,
            delay_ms: 5,
            ..Default::default()
        },
    };
    let period: f64 = match args.next() {
        Some(s) => s.parse()?,
        None => 0.05,
    };
    let rate = Rate::from_period_secs(period)?;
    info!("config: {}, rate: {rate}", config.to_json()?);

    let cancel = CancellationToken::new();
    let throttle = Throttle::new(cancel.clone(), config)?;

    // ctrl-c stops the throttle, abandoning whatever is still queued
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut callers = Vec::with_capacity(CALLERS);
    for caller in 0..CALLERS {
        let throttle = throttle.clone();
        callers.push(tokio::spawn(async move {
            for i in 0..REQUESTS_PER_CALLER {
                // odd callers use the default cost
                let cost = if caller % 2 == 0 { Some(0.5 + i as f64) } else { None };
                let ticket = match throttle.submit(rate, cost).await {
                    Ok(ticket) => ticket,
                    Err(e) => {
                        error!("caller {caller}: submit failed: {e}");
                        return;
                    }
                };
                match ticket.receipt().await {
                    Ok(receipt) => info!(
                        "caller {caller}: admitted #{} (cost {}) after {:?}",
                        receipt.order, receipt.cost, receipt.waited
                    ),
                    Err(e) => {
                        error!("caller {caller}: {e}");
                        return;
                    }
                }
            }
        }));
    }

    for caller in callers {
        caller.await?;
    }

    match throttle.snapshot().await {
        Ok(snapshot) => info!("final bucket: {}", snapshot.to_json()?),
        Err(e) => error!("no snapshot: {e}"),
    }
    throttle.stop();
    while throttle.is_running() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(())
}
