use anyhow::Context;
use log::debug;

use crate::metrics::{bump, EngineMetrics};
use crate::packet::{DecodeError, Packet};
use crate::parallel::ParallelFlowTable;

/// Reads capture files in order and dispatches every decodable packet.
/// Returns the largest timestamp seen, which becomes the final time for
/// `eof`. Packets larger than `max_packet` are counted as skipped;
/// decode and key failures are counted and dropped before sharding.
pub async fn read_capture_files(
    paths: &[String],
    max_packet: u32,
    table: &ParallelFlowTable,
    metrics: &EngineMetrics,
) -> anyhow::Result<i64> {
    let mut final_time = 0i64;
    for path in paths {
        debug!("reading capture file {path}");
        let mut capture = pcap::Capture::from_file(path)
            .with_context(|| format!("cannot open capture file {path}"))?;
        while let Ok(captured) = capture.next_packet() {
            bump(&metrics.source.packets);
            let timestamp_ns = captured.header.ts.tv_sec as i64 * 1_000_000_000
                + captured.header.ts.tv_usec as i64 * 1_000;
            final_time = final_time.max(timestamp_ns);
            if captured.header.len > max_packet {
                bump(&metrics.source.skipped);
                continue;
            }
            match Packet::from_ethernet(captured.data, timestamp_ns) {
                Ok(packet) => table.dispatch(packet).await?,
                Err(DecodeError::Decode) => bump(&metrics.source.decode_errors),
                Err(DecodeError::Key) => bump(&metrics.source.key_errors),
            }
        }
        debug!("finished capture file {path}");
    }
    Ok(final_time)
}
