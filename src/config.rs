//! Command-line surface (SPEC_FULL §6) and the `MemSize` K/M/G value parser.

use clap::Parser;

pub const MAX_VCPUS: u32 = 8;

#[derive(Parser, Debug)]
#[command(name = "aperture")]
#[command(about = "A minimal virtual machine monitor for KVM and Apple Hypervisor.framework")]
pub struct Args {
    /// Path to a Linux-style kernel image (bzImage)
    #[arg(long)]
    pub kernel: Option<String>,

    /// Path to an initial RAM disk, loaded alongside --kernel
    #[arg(long)]
    pub initrd: Option<String>,

    /// Kernel command line
    #[arg(long, default_value = "console=ttyS0")]
    pub cmdline: String,

    /// Total guest RAM, with an optional K/M/G suffix
    #[arg(long, default_value = "512M", value_parser = parse_mem_size)]
    pub mem: u64,

    /// Number of vCPUs
    #[arg(long, default_value_t = 1)]
    pub cpus: u32,

    /// Path to a raw disk image backing a virtio-blk device
    #[arg(long)]
    pub disk: Option<String>,

    /// Attach a virtio-net device backed by a host TAP interface, as tap=<name>
    #[arg(long, value_parser = parse_net_config)]
    pub net: Option<NetConfig>,

    /// Pass through a PCI device by bus:device.function (Linux only; not implemented)
    #[arg(long)]
    pub vfio: Option<String>,

    /// Enable the MMIO console device
    #[arg(long, default_value_t = false)]
    pub console: bool,

    /// Load a raw flat binary image instead of a Linux kernel
    #[arg(long)]
    pub binary: Option<String>,

    /// Initial program counter for --binary, as a hex address (e.g. 0x100000)
    #[arg(long, value_parser = parse_hex_u64)]
    pub entry: Option<u64>,

    /// Log verbosity: 0=off, 1=error, 2=warn, 3=info, 4=debug
    #[arg(long, default_value_t = 3)]
    pub log: u8,
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub tap_name: String,
}

fn parse_net_config(s: &str) -> Result<NetConfig, String> {
    let tap_name = s
        .strip_prefix("tap=")
        .ok_or_else(|| format!("unrecognized --net value {s:?}; expected tap=<name>"))?;
    if tap_name.is_empty() {
        return Err("--net tap=<name> requires a non-empty interface name".to_string());
    }
    Ok(NetConfig {
        tap_name: tap_name.to_string(),
    })
}

fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| format!("invalid hex address {s:?}: {e}"))
}

/// Parses a byte count with an optional `K`/`M`/`G` suffix (binary multiples,
/// case-insensitive). A bare number is taken as bytes.
fn parse_mem_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&s[..s.len() - 1], 1024),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&s[..s.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("invalid memory size {s:?}: {e}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory size {s:?} overflows"))
}

/// Map the CLI's `--log 0..4` scale onto `log::LevelFilter`.
pub fn level_filter(log: u8) -> log::LevelFilter {
    match log {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_mem_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_mem_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_mem_size("1024").unwrap(), 1024);
        assert_eq!(parse_mem_size("4k").unwrap(), 4096);
    }

    #[test]
    fn rejects_garbage_sizes() {
        assert!(parse_mem_size("five").is_err());
    }

    #[test]
    fn net_config_requires_tap_prefix() {
        assert!(parse_net_config("tap=tap0").is_ok());
        assert!(parse_net_config("tap0").is_err());
        assert!(parse_net_config("tap=").is_err());
    }
}
