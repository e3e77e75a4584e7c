use anyhow::{anyhow, Result};

/// Parse a human-readable size string (e.g. "1G", "512k") into bytes.
pub fn parse_human_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| anyhow!("invalid size: {}", s))?;

    let shift = match suffix.trim() {
        "" | "B" | "b" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        _ => return Err(anyhow!("invalid size: {}", s)),
    };
    Ok(n << shift)
}

/// Scale `v` down by `base` into the largest unit it fills, keeping one
/// decimal digit from the remainder. Values below the first scaled unit are
/// printed exact.
fn fmt_scaled(v: u128, base: u128, units: &[&str]) -> String {
    let mut idx = 0;
    let mut whole = v;
    while whole >= base && idx + 1 < units.len() {
        whole /= base;
        idx += 1;
    }

    let unit = units[idx];
    if idx == 0 {
        return if unit.is_empty() {
            format!("{}", v)
        } else {
            format!("{} {}", v, unit)
        };
    }

    let scale = base.pow(idx as u32);
    format!("{}.{} {}", v / scale, (v * 10 / scale) % 10, unit)
}

/// Render a sector count as bytes. The accounting layer tracks all data
/// sizes in 512-byte sectors; reports show them binary-scaled.
pub fn fmt_sectors_human(sectors: u64) -> String {
    fmt_scaled((sectors as u128) << 9, 1024, &["B", "KiB", "MiB", "GiB", "TiB", "PiB"])
}

/// Render a plain count (inodes, keys), decimal-scaled.
pub fn fmt_count_human(n: u64) -> String {
    fmt_scaled(n as u128, 1000, &["", "k", "M", "G"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_human_size("512").unwrap(), 512);
        assert_eq!(parse_human_size("4k").unwrap(), 4096);
        assert_eq!(parse_human_size("1G").unwrap(), 1 << 30);
        assert!(parse_human_size("12q").is_err());
        assert!(parse_human_size("big").is_err());
    }

    #[test]
    fn sector_counts_render_as_bytes() {
        assert_eq!(fmt_sectors_human(0), "0 B");
        assert_eq!(fmt_sectors_human(1), "512 B");
        assert_eq!(fmt_sectors_human(2), "1.0 KiB");
        assert_eq!(fmt_sectors_human(3), "1.5 KiB");
        assert_eq!(fmt_sectors_human(2048), "1.0 MiB");
        assert_eq!(fmt_sectors_human(1 << 41), "1.0 PiB");
    }

    #[test]
    fn plain_counts_scale_decimally() {
        assert_eq!(fmt_count_human(0), "0");
        assert_eq!(fmt_count_human(999), "999");
        assert_eq!(fmt_count_human(1500), "1.5 k");
        assert_eq!(fmt_count_human(2_000_000), "2.0 M");
    }
}
