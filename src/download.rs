use crate::{
    error::{Result, StrapError},
    storage::make_historical_data_dump,
    types::{HistoricalDataDump, HistoricalDataPacket},
};
use futures::{Stream, StreamExt};
use std::future::Future;
use tracing::{error, info};

/// Drain a historical sample stream into dumps of `buffer_size` samples.
///
/// Every full buffer becomes a [`HistoricalDataDump`] dated by its last
/// sample, is passed to `save`, and is collected into the returned list. A
/// trailing partial buffer is flushed only when the stream ends cleanly.
///
/// # Errors
///
/// Returns [`StrapError::Protocol`] for a zero `buffer_size`, the first
/// error yielded by the stream (partial buffer discarded, earlier dumps
/// already saved), or the first error returned by `save`.
pub async fn download_historical_data<S, F, Fut>(
    device_id: &str,
    device_name: &str,
    stream: S,
    mut save: F,
    buffer_size: usize,
) -> Result<Vec<HistoricalDataDump>>
where
    S: Stream<Item = Result<HistoricalDataPacket>>,
    F: FnMut(HistoricalDataDump) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if buffer_size == 0 {
        return Err(StrapError::Protocol(
            "Download buffer size must be at least 1".to_string(),
        ));
    }

    let mut stream = std::pin::pin!(stream);
    let mut saved = Vec::new();
    let mut buffer = Vec::with_capacity(buffer_size.min(4096));

    while let Some(item) = stream.next().await {
        match item {
            Ok(packet) => buffer.push(packet),
            Err(e) => {
                error!(
                    "Error downloading historical data for {}, dropping {} buffered samples: {}",
                    device_id,
                    buffer.len(),
                    e
                );
                return Err(e);
            }
        }

        if buffer.len() == buffer_size {
            let packets = std::mem::take(&mut buffer);
            info!("Saving {} buffered samples for {}", packets.len(), device_id);
            flush(device_name, packets, &mut save, &mut saved).await?;
        }
    }

    if !buffer.is_empty() {
        info!("Saving final {} samples for {}", buffer.len(), device_id);
        flush(device_name, buffer, &mut save, &mut saved).await?;
    }

    info!(
        "Historical data download completed for {}: {} dumps",
        device_id,
        saved.len()
    );
    Ok(saved)
}

async fn flush<F, Fut>(
    device_name: &str,
    packets: Vec<HistoricalDataPacket>,
    save: &mut F,
    saved: &mut Vec<HistoricalDataDump>,
) -> Result<()>
where
    F: FnMut(HistoricalDataDump) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if let Some(dump) = make_historical_data_dump(device_name, packets) {
        save(dump.clone()).await?;
        saved.push(dump);
    }
    Ok(())
}
