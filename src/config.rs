//! Mount options (spec.md §6's configuration table), parsed from the
//! command line with `clap` in place of the original's `fuse_opt` table.

use clap::Parser;

/// Default write-back cache budget, in online blocks (`ZDBFS_BLOCKS_CACHE_LIMIT`).
pub const DEFAULT_CACHE_SIZE: usize = 32;

/// Default virtual filesystem size, in bytes, when `--size` is omitted (10 GiB).
pub const DEFAULT_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Kernel attribute/entry cache lifetime handed to `fuser` (`ZDBFS_KERNEL_CACHE_TIME`).
pub const KERNEL_CACHE_TIME_SECS: u64 = 5;

/// Host/port or Unix-socket address of one backend namespace, with an
/// optional password. Three of these (meta/data/temp) make up a full
/// backend configuration.
#[derive(Debug, Clone)]
pub struct NamespaceAddr {
    pub host: String,
    pub port: u16,
    pub unix: Option<String>,
    pub namespace: Option<String>,
    pub password: Option<String>,
}

impl NamespaceAddr {
    /// Falls back to `default_host`/`default_port` for any field left unset
    /// on the triad, mirroring the original's `zdbfs_setif_str`/
    /// `zdbfs_setif_int` cascade (namespace-specific option, else the
    /// top-level `--host`/`--port`, else the built-in default).
    fn resolve(
        host: Option<String>,
        port: Option<u16>,
        unix: Option<String>,
        namespace: Option<String>,
        password: Option<String>,
        default_host: &str,
        default_port: u16,
        default_unix: Option<&str>,
    ) -> Self {
        Self {
            host: host.unwrap_or_else(|| default_host.to_string()),
            port: port.unwrap_or(default_port),
            unix: unix.or_else(|| default_unix.map(str::to_string)),
            namespace,
            // The original accepts an empty string as "no password", which
            // silently defeats authentication; a password must be either
            // absent or genuinely non-empty.
            password: password.filter(|p| !p.is_empty()),
        }
    }
}

/// Resolved options for a full run: three namespace addresses plus the
/// filesystem-wide knobs.
#[derive(Debug, Clone)]
pub struct Options {
    pub meta: NamespaceAddr,
    pub data: NamespaceAddr,
    pub temp: NamespaceAddr,
    pub size: u64,
    pub nocache: bool,
    pub autons: bool,
    pub background: bool,
    pub logfile: Option<String>,
    pub cachesize: usize,
    pub mountpoint: String,
}

impl Options {
    pub fn from_cli(cli: Cli) -> Self {
        let default_host = cli.host.clone().unwrap_or_else(|| "localhost".to_string());
        let default_port = cli.port.unwrap_or(9900);
        let default_unix = cli.unix.as_deref();

        let meta = NamespaceAddr::resolve(
            cli.mh,
            cli.mp,
            cli.mu,
            cli.mn,
            cli.ms,
            &default_host,
            default_port,
            default_unix,
        );
        let data = NamespaceAddr::resolve(
            cli.dh,
            cli.dp,
            cli.du,
            cli.dn,
            cli.ds,
            &default_host,
            default_port,
            default_unix,
        );
        let temp = NamespaceAddr::resolve(
            cli.th,
            cli.tp,
            cli.tu,
            cli.tn,
            cli.ts,
            &default_host,
            default_port,
            default_unix,
        );

        Self {
            meta,
            data,
            temp,
            size: cli.size.unwrap_or(DEFAULT_SIZE),
            nocache: cli.nocache,
            autons: cli.autons,
            background: cli.background,
            logfile: cli.logfile,
            cachesize: cli.cachesize.unwrap_or(DEFAULT_CACHE_SIZE),
            mountpoint: cli.mountpoint,
        }
    }
}

/// Command-line surface of the daemon; one field per spec.md §6 option.
#[derive(Debug, Parser)]
#[command(name = "zdbfs-rs", about = "FUSE filesystem backed by a remote KV store")]
pub struct Cli {
    /// Default backend host, used by any namespace that doesn't override it.
    #[arg(long)]
    pub host: Option<String>,

    /// Default backend port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Default backend Unix socket path, used instead of host/port.
    #[arg(long)]
    pub unix: Option<String>,

    /// Meta namespace host.
    #[arg(long)]
    pub mh: Option<String>,
    /// Meta namespace port.
    #[arg(long)]
    pub mp: Option<u16>,
    /// Meta namespace unix socket.
    #[arg(long)]
    pub mu: Option<String>,
    /// Meta namespace name.
    #[arg(long)]
    pub mn: Option<String>,
    /// Meta namespace secret.
    #[arg(long)]
    pub ms: Option<String>,

    /// Data namespace host.
    #[arg(long)]
    pub dh: Option<String>,
    /// Data namespace port.
    #[arg(long)]
    pub dp: Option<u16>,
    /// Data namespace unix socket.
    #[arg(long)]
    pub du: Option<String>,
    /// Data namespace name.
    #[arg(long)]
    pub dn: Option<String>,
    /// Data namespace secret.
    #[arg(long)]
    pub ds: Option<String>,

    /// Temporary namespace host.
    #[arg(long)]
    pub th: Option<String>,
    /// Temporary namespace port.
    #[arg(long)]
    pub tp: Option<u16>,
    /// Temporary namespace unix socket.
    #[arg(long)]
    pub tu: Option<String>,
    /// Temporary namespace name.
    #[arg(long)]
    pub tn: Option<String>,
    /// Temporary namespace secret.
    #[arg(long)]
    pub ts: Option<String>,

    /// Virtual filesystem size in bytes, reported by `statfs`.
    #[arg(long)]
    pub size: Option<u64>,

    /// Disable the write-back block cache entirely (every block goes
    /// straight to the backend).
    #[arg(long, default_value_t = false)]
    pub nocache: bool,

    /// Create the meta/data/temp namespaces on the backend if missing.
    #[arg(long, default_value_t = false)]
    pub autons: bool,

    /// Fork into the background after mounting.
    #[arg(long, default_value_t = false)]
    pub background: bool,

    /// Redirect log output to this file instead of stderr.
    #[arg(long)]
    pub logfile: Option<String>,

    /// Maximum number of online (non-evicted) blocks held in cache.
    #[arg(long)]
    pub cachesize: Option<usize>,

    /// Directory to mount the filesystem at.
    pub mountpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_is_treated_as_absent() {
        let addr = NamespaceAddr::resolve(
            None,
            None,
            None,
            None,
            Some(String::new()),
            "localhost",
            9900,
            None,
        );
        assert_eq!(addr.password, None);
    }

    #[test]
    fn namespace_falls_back_to_default_host_and_port() {
        let addr =
            NamespaceAddr::resolve(None, None, None, None, None, "backend.local", 1234, None);
        assert_eq!(addr.host, "backend.local");
        assert_eq!(addr.port, 1234);
    }

    #[test]
    fn namespace_override_wins_over_default() {
        let addr = NamespaceAddr::resolve(
            Some("meta.local".to_string()),
            Some(7000),
            None,
            None,
            None,
            "backend.local",
            1234,
            None,
        );
        assert_eq!(addr.host, "meta.local");
        assert_eq!(addr.port, 7000);
    }
}
