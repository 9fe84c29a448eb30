//! Tunnel planning.
//!
//! Every service in the tunnelled set rides a stable per-slot port inside
//! the parent's network namespace: `base(service) + index - 1`. Traffic for
//! a remote slot leaves through an encrypting forwarder bound to that port;
//! traffic for the local slot arrives through a decrypting forwarder bound
//! on the public side. The managed product can therefore use one static
//! connection string no matter which physical node holds which slot.

use std::collections::HashMap;

use crate::config::Config;
use crate::runtime::{ContainerSpec, TUNNEL_LABEL};
use crate::store::{default_port, Member, SERVICE_PORTS};

#[derive(Debug, Clone)]
pub enum TunnelOp {
    Ensure(ContainerSpec),
    Remove(String),
}

/// Derive the tunnel containers required for the given membership view.
/// Empty slots turn into removals so a departed peer's tunnels do not
/// linger.
pub fn plan(cfg: &Config, local_index: i32, by_index: &HashMap<i32, Member>) -> Vec<TunnelOp> {
    let mut ops = Vec::new();

    for index in 1..=cfg.cluster_size {
        for service in SERVICE_PORTS {
            match by_index.get(&index) {
                None => ops.push(TunnelOp::Remove(tunnel_name(service, index))),
                Some(peer) => {
                    // Don't encrypt back to yourself; a peer sharing this
                    // host's ip gets a decryptor so single-host clusters
                    // work.
                    let outgoing = index != local_index && peer.ip != cfg.cluster_ip;
                    let spec = if outgoing {
                        encrypting(service, index, peer)
                    } else {
                        decrypting(service, index, peer)
                    };
                    ops.push(TunnelOp::Ensure(spec));
                }
            }
        }
    }

    ops
}

fn tunnel_name(service: &str, index: i32) -> String {
    format!("tunnel-{service}-{index}")
}

fn tunnel_spec(service: &str, index: i32, command: Vec<String>) -> ContainerSpec {
    ContainerSpec {
        command,
        labels: HashMap::from([(
            TUNNEL_LABEL.to_string(),
            format!("{service}-{index}"),
        )]),
        restart_always: true,
        ..ContainerSpec::named(&tunnel_name(service, index))
    }
}

/// Outbound side: listen on the slot's internal port, forward encrypted to
/// the peer's public service port.
fn encrypting(service: &str, index: i32, peer: &Member) -> ContainerSpec {
    let from = default_port(service) + index - 1;
    let source = format!("[127.0.0.1]:{from}");
    let target = format!("[{}]:{}", peer.ip, peer.port_by_service(service));
    tunnel_spec(
        service,
        index,
        vec![
            "tunnel".to_string(),
            "-e".to_string(),
            "-s".to_string(),
            source,
            "-t".to_string(),
            target,
        ],
    )
}

/// Inbound side: listen where the parent publishes the service, forward
/// decrypted to the slot's internal port.
fn decrypting(service: &str, index: i32, peer: &Member) -> ContainerSpec {
    let to = default_port(service) + index - 1;
    let source = format!("[0.0.0.0]:{}", peer.port_by_service(service) + 10000);
    let target = format!("[127.0.0.1]:{to}");
    tunnel_spec(
        service,
        index,
        vec![
            "tunnel".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            source,
            "-t".to_string(),
            target,
        ],
    )
}
