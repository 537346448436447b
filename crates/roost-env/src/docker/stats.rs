//! Resource statistics streaming.

use std::sync::Arc;

use bollard::container::StatsOptions;
use futures::StreamExt;
use roost_events::topic;

use super::DockerEnvironment;
use crate::Stats;

/// Spawns the stats consumer for a started container. Each sample updates
/// the environment's cached record and is published on the bus; EOF is not
/// an error, it simply means the container is no longer running.
pub(crate) fn spawn_poller(env: &Arc<DockerEnvironment>) {
    let env = Arc::clone(env);
    tokio::spawn(async move {
        let mut stream = env.client.stats(
            &env.uuid,
            Some(StatsOptions {
                stream: true,
                one_shot: false,
            }),
        );

        while let Some(item) = stream.next().await {
            match item {
                Ok(sample) => {
                    let stats = convert(&sample);
                    env.record_stats(stats);
                    env.bus.publish_json(topic::STATS, &stats);
                }
                Err(err) => {
                    tracing::debug!(server = %env.uuid, error = %err, "stats stream closed");
                    break;
                }
            }
        }
    });
}

/// Maps a raw engine sample onto the daemon's resource record. CPU is
/// reported as an absolute percentage across all cores, matching what the
/// scheduler configures (100 = one full core).
fn convert(sample: &bollard::container::Stats) -> Stats {
    let memory = sample
        .memory_stats
        .usage
        .unwrap_or(0);
    let memory_limit = sample.memory_stats.limit.unwrap_or(0);

    let cpu_delta = sample.cpu_stats.cpu_usage.total_usage as f64
        - sample.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = sample.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
        - sample.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
    let online = sample
        .cpu_stats
        .online_cpus
        .unwrap_or_else(|| {
            sample
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u64)
                .unwrap_or(1)
        }) as f64;

    let cpu_absolute = if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * online * 100.0
    } else {
        0.0
    };

    let (rx, tx) = sample
        .networks
        .as_ref()
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |(rx, tx), n| {
                (rx + n.rx_bytes, tx + n.tx_bytes)
            })
        })
        .unwrap_or((0, 0));

    Stats {
        memory_bytes: memory,
        memory_limit_bytes: memory_limit,
        cpu_absolute: (cpu_absolute * 1000.0).round() / 1000.0,
        network_rx_bytes: rx,
        network_tx_bytes: tx,
    }
}
