//! Bind-time port negotiation.
//!
//! Implements `server.autoPortSwitch` (increment / random / port-range
//! candidates) and the best-effort `autoKillConflict`, which walks
//! `/proc/net/tcp*` for the listener inode and `/proc/*/fd` for its owner
//! before sending SIGTERM.

use janus_rs::models::settings::{PortSwitchStrategy, ServerSettings};
use log::{info, warn};
use std::net::TcpListener;

/// Produces the ordered list of ports to try.
pub fn candidates(server: &ServerSettings) -> Vec<u16> {
    let base = server.port;
    if !server.auto_port_switch.enabled {
        return vec![base];
    }
    let attempts = server.auto_port_switch.max_attempts as usize;
    let mut ports = vec![base];
    match server.auto_port_switch.strategy {
        PortSwitchStrategy::Increment => {
            for i in 1..=attempts as u16 {
                ports.push(base.saturating_add(i));
            }
        }
        PortSwitchStrategy::Random => {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            for _ in 0..attempts {
                ports.push(rng.gen_range(49152..=65535));
            }
        }
        PortSwitchStrategy::PortRange => {
            if let Some((low, high)) = server.auto_port_switch.port_range {
                for port in low..=high {
                    if ports.len() > attempts {
                        break;
                    }
                    if port != base {
                        ports.push(port);
                    }
                }
            }
        }
    }
    ports
}

/// Finds a bindable port from the candidate list. When `autoKillConflict`
/// is set, the process holding the first choice gets a SIGTERM and one
/// more chance is taken on that port.
pub fn resolve(server: &ServerSettings) -> Option<u16> {
    for (i, port) in candidates(server).iter().copied().enumerate() {
        if bindable(&server.host, port) {
            if i > 0 {
                info!("Port {} taken, switched to {}", server.port, port);
            }
            return Some(port);
        }
        if i == 0 && server.auto_kill_conflict {
            if let Some(pid) = holder_of(port) {
                warn!("Killing pid {} holding port {}", pid, port);
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                std::thread::sleep(std::time::Duration::from_millis(500));
                if bindable(&server.host, port) {
                    return Some(port);
                }
            }
        }
    }
    None
}

fn bindable(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Owner pid of the LISTEN socket on `port`, via procfs.
fn holder_of(port: u16) -> Option<u32> {
    let inode = listen_inode(port)?;
    let needle = format!("socket:[{}]", inode);

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(target) = std::fs::read_link(fd.path()) {
                if target.to_string_lossy() == needle {
                    return Some(pid);
                }
            }
        }
    }
    None
}

fn listen_inode(port: u16) -> Option<u64> {
    const TCP_LISTEN: &str = "0A";
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let local = fields[1];
            let state = fields[3];
            if state != TCP_LISTEN {
                continue;
            }
            let Some((_, port_hex)) = local.rsplit_once(':') else {
                continue;
            };
            if u16::from_str_radix(port_hex, 16) == Ok(port) {
                return fields[9].parse().ok();
            }
        }
    }
    None
}
