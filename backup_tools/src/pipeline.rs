//! The streaming pipeline: one producer, one destination, a bounded chunk
//! channel between them, and a shared failure signal.
//!
//! The chunk channel is the sole backpressure mechanism; with capacity 1 it
//! is a rendezvous in all but name, so the producer never runs ahead of
//! what the destination can take. The failure signal is level-triggered and
//! idempotent: whichever side errors fires it, the other side observes it
//! at its next suspension point and unwinds. There is no wall-clock
//! timeout; peer failure is the only cancellation source.

use std::future::Future;

use bytes::Bytes;
use remote_storage::ChunkStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::producer::ChunkSender;

const CHUNK_CHANNEL_CAPACITY: usize = 1;

/// Runs `produce` and `consume` concurrently until both finish. Succeeds
/// only if both sides completed clean, and then returns the byte count the
/// destination reported, which equals what the producer emitted since
/// chunks travel in production order over the channel.
pub async fn run<P, C, PFut, CFut>(produce: P, consume: C) -> anyhow::Result<u64>
where
    P: FnOnce(ChunkSender, CancellationToken) -> PFut,
    PFut: Future<Output = anyhow::Result<()>>,
    C: FnOnce(ChunkStream, CancellationToken) -> CFut,
    CFut: Future<Output = anyhow::Result<u64>>,
{
    let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(CHUNK_CHANNEL_CAPACITY);
    let failure = CancellationToken::new();

    let producer_task = async {
        let res = produce(chunk_tx, failure.clone()).await;
        if let Err(e) = &res {
            // wake the destination so it can discard its partial state
            failure.cancel();
            tracing::warn!("pipeline producer failed: {e:#}");
        }
        res
    };
    let consumer_task = async {
        let res = consume(chunk_rx, failure.clone()).await;
        if let Err(e) = &res {
            failure.cancel();
            tracing::warn!("pipeline destination failed: {e:#}");
        }
        res
    };

    let (producer_res, consumer_res) = tokio::join!(producer_task, consumer_task);

    match (producer_res, consumer_res) {
        (Ok(()), Ok(bytes)) => Ok(bytes),
        (Err(producer_err), Ok(_)) => Err(producer_err.context("the backup producer failed")),
        (Ok(()), Err(destination_err)) => {
            Err(destination_err.context("the backup destination failed"))
        }
        (Err(producer_err), Err(destination_err)) => Err(anyhow::anyhow!(
            "backup pipeline failed on both sides; producer: {producer_err:#}; destination: {destination_err:#}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn moves_all_bytes_in_production_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let res = run(
            |tx, _failure| async move {
                for chunk in [&b"create "[..], b"table ", b"t;"] {
                    tx.send(Bytes::copy_from_slice(chunk)).await?;
                }
                Ok(())
            },
            |mut rx, _failure| async move {
                let mut total = 0u64;
                while let Some(chunk) = rx.recv().await {
                    total += chunk.len() as u64;
                    sink.lock().unwrap().extend_from_slice(&chunk);
                }
                Ok(total)
            },
        )
        .await;

        assert_eq!(res.unwrap(), 15);
        assert_eq!(seen.lock().unwrap().as_slice(), b"create table t;");
    }

    #[tokio::test]
    async fn destination_failure_aborts_the_producer() {
        let res = run(
            |tx, failure| async move {
                let mut chunks_sent = 0u32;
                loop {
                    tokio::select! {
                        sent = tx.send(Bytes::from_static(b"xxxx")) => {
                            if sent.is_err() {
                                anyhow::bail!("dump canceled: destination went away");
                            }
                            chunks_sent += 1;
                            anyhow::ensure!(chunks_sent < 1000, "destination never aborted us");
                        }
                        _ = failure.cancelled() => anyhow::bail!("dump canceled on peer failure"),
                    }
                }
            },
            |mut rx, _failure| async move {
                let _ = rx.recv().await;
                anyhow::bail!("append denied")
            },
        )
        .await;

        let message = format!("{:#}", res.unwrap_err());
        assert!(message.contains("append denied"), "got: {message}");
        assert!(message.contains("canceled"), "got: {message}");
    }

    #[tokio::test]
    async fn producer_failure_aborts_the_destination() {
        let res = run(
            |tx, _failure| async move {
                tx.send(Bytes::from_static(b"partial")).await?;
                anyhow::bail!("dump tool exited with 2")
            },
            |mut rx, failure| async move {
                let mut total = 0u64;
                loop {
                    tokio::select! {
                        chunk = rx.recv() => match chunk {
                            Some(chunk) => total += chunk.len() as u64,
                            None => return Ok(total),
                        },
                        _ = failure.cancelled() => anyhow::bail!("partial upload discarded"),
                    }
                }
            },
        )
        .await;

        let message = format!("{:#}", res.unwrap_err());
        assert!(message.contains("exited with 2"), "got: {message}");
    }
}
