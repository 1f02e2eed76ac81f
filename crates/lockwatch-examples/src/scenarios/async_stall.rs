use lockwatch::AsyncRwMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::logging_and;

pub async fn run(timeout: Duration) -> Result<(), String> {
    let cache = Arc::new(AsyncRwMutex::with_name("demo.cache", 0u64));
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    cache.set_lock_timeout(
        timeout,
        Some(logging_and(move |report| {
            let _ = report_tx.send(report);
        })),
    );

    let (held_tx, held_rx) = oneshot::channel();
    let holder = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut guard = cache.write().await;
            let _ = held_tx.send(());
            println!("holder: refreshing demo.cache slowly");
            tokio::time::sleep(timeout * 2).await;
            *guard += 1;
        })
    };
    held_rx
        .await
        .map_err(|_| "holder task exited early".to_string())?;

    let reader = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let value = *cache.read().await;
            println!("reader: finally saw demo.cache = {value}");
        })
    };

    let report = tokio::time::timeout(timeout * 2, report_rx.recv())
        .await
        .map_err(|_| "no stall reported".to_string())?
        .ok_or_else(|| "stall handler dropped".to_string())?;
    println!("stall: {report}");

    holder.await.map_err(|e| e.to_string())?;
    reader.await.map_err(|e| e.to_string())?;
    Ok(())
}
