//! Resource statistics collection
//!
//! The math here is unchanged from the original per-game-server poller:
//! only the entry point changed, from publishing onto an event bus to
//! yielding a channel the caller owns.

use bollard::container::StatsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::traits::{DockerError, DockerResult, ResourceSample};

const CHANNEL_CAPACITY: usize = 16;

/// Starts streaming resource samples for `container_id`. The stream ends
/// (channel closes) once the container stops or sends a malformed final
/// frame — both are normal shutdown, not failures worth surfacing.
pub fn start_stats_stream(
    docker: Docker,
    container_id: String,
) -> mpsc::Receiver<DockerResult<ResourceSample>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };

        let mut stream = docker.stats(&container_id, Some(options));

        let mut prev_cpu: Option<u64> = None;
        let mut prev_system: Option<u64> = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(docker_stats) => {
                    let memory_used = calculate_memory(&docker_stats.memory_stats);
                    let memory_limit = docker_stats.memory_stats.limit.unwrap_or(0);

                    let cpu_percent = calculate_cpu(&docker_stats.cpu_stats, &prev_cpu, &prev_system);

                    prev_cpu = Some(docker_stats.cpu_stats.cpu_usage.total_usage);
                    prev_system = docker_stats.cpu_stats.system_cpu_usage;

                    let (rx_bytes, tx_bytes) = calculate_network(&docker_stats.networks);

                    let sample = ResourceSample {
                        cpu_percent,
                        memory_used_bytes: memory_used,
                        memory_limit_bytes: memory_limit,
                        network_rx_bytes: rx_bytes,
                        network_tx_bytes: tx_bytes,
                    };

                    if tx.send(Ok(sample)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if is_graceful_stop(&e) {
                        debug!("container {} stopped, ending stats stream", container_id);
                        break;
                    }
                    warn!("error reading stats from {}: {}", container_id, e);
                    let _ = tx.send(Err(DockerError::from(e))).await;
                    break;
                }
            }
        }
    });

    rx
}

fn is_graceful_stop(e: &bollard::errors::Error) -> bool {
    let error_str = e.to_string();

    let is_stopped = matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
            | bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }
    ) || error_str.contains("container is stopped")
        || error_str.contains("not running")
        || error_str.contains("No such container");

    // JSON deserialization errors typically happen when Docker sends incomplete
    // stats as the container is exiting.
    let is_json_error = matches!(e, bollard::errors::Error::JsonDataError { .. })
        || error_str.contains("missing field")
        || error_str.contains("Failed to deserialize");

    is_stopped || is_json_error
}

fn calculate_memory(stats: &bollard::container::MemoryStats) -> u64 {
    stats.usage.unwrap_or(0)
}

/// (container_cpu_delta / system_cpu_delta) * num_cpus * 100
fn calculate_cpu(
    stats: &bollard::container::CPUStats,
    prev_cpu: &Option<u64>,
    prev_system: &Option<u64>,
) -> f64 {
    let current_cpu = stats.cpu_usage.total_usage;
    let current_system = stats.system_cpu_usage.unwrap_or(0);

    if let (Some(prev_c), Some(prev_s)) = (prev_cpu, prev_system) {
        let cpu_delta = current_cpu.saturating_sub(*prev_c);
        let system_delta = current_system.saturating_sub(*prev_s);
        let cpus = stats.online_cpus.unwrap_or(1) as f64;

        if system_delta > 0 && cpu_delta > 0 {
            let raw_cpu = (cpu_delta as f64 / system_delta as f64) * 100.0 * cpus;
            raw_cpu.min(100.0 * cpus)
        } else {
            0.0
        }
    } else {
        0.0
    }
}

fn calculate_network(
    networks: &Option<std::collections::HashMap<String, bollard::container::NetworkStats>>,
) -> (u64, u64) {
    let mut rx_bytes = 0u64;
    let mut tx_bytes = 0u64;

    if let Some(nets) = networks {
        for stats in nets.values() {
            rx_bytes += stats.rx_bytes;
            tx_bytes += stats.tx_bytes;
        }
    }

    (rx_bytes, tx_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_calculate_memory() {
        let mut stats = bollard::container::MemoryStats::default();
        stats.usage = Some(100_000_000);

        assert_eq!(calculate_memory(&stats), 100_000_000);
    }

    #[test]
    fn test_calculate_cpu() {
        let mut stats = bollard::container::CPUStats::default();
        stats.cpu_usage.total_usage = 200_000_000;
        stats.system_cpu_usage = Some(1_000_000_000);
        stats.online_cpus = Some(4);

        let cpu = calculate_cpu(&stats, &None, &None);
        assert_eq!(cpu, 0.0);

        let prev_cpu = Some(100_000_000u64);
        let prev_system = Some(500_000_000u64);

        let cpu = calculate_cpu(&stats, &prev_cpu, &prev_system);

        // (100M / 500M) * 4 * 100 = 80%
        assert!((cpu - 80.0).abs() < 0.1);
    }

    #[test]
    fn test_calculate_network() {
        let mut networks = HashMap::new();

        let mut eth0 = bollard::container::NetworkStats::default();
        eth0.rx_bytes = 1000;
        eth0.tx_bytes = 2000;
        networks.insert("eth0".to_string(), eth0);

        let mut eth1 = bollard::container::NetworkStats::default();
        eth1.rx_bytes = 500;
        eth1.tx_bytes = 1000;
        networks.insert("eth1".to_string(), eth1);

        let (rx, tx) = calculate_network(&Some(networks));
        assert_eq!(rx, 1500);
        assert_eq!(tx, 3000);
    }
}
