//! Host-scope advisory lock preventing two driver processes from opening
//! the same set of EtherCAN gateways (spec §9 Open Question (b)).
//!
//! The original has no equivalent — gateway exclusivity was left to
//! operational discipline. This crate derives a lock-file path from the
//! sorted gateway address list and takes an exclusive `flock(2)` on it via
//! the `fs2` crate, released automatically when the `DeviceLock` drops.

use std::fs::{File, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use fs2::FileExt;

pub struct DeviceLock {
    file: File,
    path: PathBuf,
}

impl DeviceLock {
    pub fn acquire(gateway_addresses: &[SocketAddr]) -> io::Result<Self> {
        let path = lock_path(gateway_addresses);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "another ethercan-driver process already holds the gateway set at {}",
                    path.display()
                ),
            )
        })?;
        tracing::info!(path = %path.display(), "acquired device lock");
        Ok(Self { file, path })
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "released device lock");
    }
}

fn lock_path(gateway_addresses: &[SocketAddr]) -> PathBuf {
    let mut addrs: Vec<String> = gateway_addresses.iter().map(|a| a.to_string()).collect();
    addrs.sort();
    let digest = addrs.join(",");
    let mut hasher_state: u64 = 0xcbf29ce484222325;
    for byte in digest.as_bytes() {
        hasher_state ^= *byte as u64;
        hasher_state = hasher_state.wrapping_mul(0x100000001b3);
    }
    std::env::temp_dir().join(format!("ethercand-{hasher_state:016x}.lock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquiring_twice_from_same_process_fails_on_second_attempt() {
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:4700".parse().unwrap()];
        let first = DeviceLock::acquire(&addrs).unwrap();
        let second = DeviceLock::acquire(&addrs);
        assert!(second.is_err());
        drop(first);
        assert!(DeviceLock::acquire(&addrs).is_ok());
    }

    #[test]
    fn lock_path_is_stable_regardless_of_address_order() {
        let a: Vec<SocketAddr> = vec!["127.0.0.1:4700".parse().unwrap(), "127.0.0.1:4701".parse().unwrap()];
        let b: Vec<SocketAddr> = vec!["127.0.0.1:4701".parse().unwrap(), "127.0.0.1:4700".parse().unwrap()];
        assert_eq!(lock_path(&a), lock_path(&b));
    }
}
