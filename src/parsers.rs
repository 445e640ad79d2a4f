//! Pure Rust parsers for device shell output (no transport deps).
//! Used by the device and companion server modules, and by tests on host.

use std::collections::HashMap;

use crate::device::NetInterface;

/// Parse a property line from getprop output
/// Format: [key]: [value]
pub fn parse_property_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if !line.starts_with('[') {
        return None;
    }

    let (key, value) = line.split_once("]: [")?;
    let key = key.trim_start_matches('[').to_string();
    let value = value.strip_suffix(']')?.to_string();

    Some((key, value))
}

/// Parse full getprop output. Multi-line values are skipped.
pub fn parse_properties(output: &str) -> HashMap<String, String> {
    output.lines().filter_map(parse_property_line).collect()
}

/// Parse `ip -4 -f inet -o a` output into interfaces with a global address.
/// Format: "30: wlan0    inet 192.168.1.31/24 brd 192.168.1.255 scope global wlan0\ ..."
pub fn parse_interfaces(output: &str) -> Vec<NetInterface> {
    output
        .lines()
        .filter(|line| line.contains("scope global"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _index = fields.next()?;
            let name = fields.next()?.trim_end_matches(':');
            if fields.next()? != "inet" {
                return None;
            }
            let address = fields.next()?;
            let ipv4 = address.split('/').next()?;
            // Names like "wlan0@if3" carry the peer index
            let name = name.split('@').next()?;
            Some(NetInterface {
                name: name.to_string(),
                ipv4: ipv4.to_string(),
            })
        })
        .collect()
}

/// Parse `pidof` output: whitespace separated PIDs
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|pid| pid.parse().ok())
        .collect()
}

/// Parse `ps` rows whose last column equals `name`; PID is the second column.
pub fn parse_ps_pids(output: &str, name: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 || fields.last() != Some(&name) {
                return None;
            }
            fields[1].parse().ok()
        })
        .collect()
}

/// Parse `grep -l` output listing `/proc/<pid>/cmdline` paths
pub fn parse_proc_cmdline_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| {
            line.trim()
                .strip_prefix("/proc/")?
                .strip_suffix("/cmdline")?
                .parse()
                .ok()
        })
        .collect()
}

/// Extract the version argument that follows `package` in a NUL-separated
/// command line whose first argument is `process_name`.
pub fn parse_cmdline_version(cmdline: &str, process_name: &str, package: &str) -> Option<String> {
    let mut args = cmdline.split('\0');
    if args.next()? != process_name {
        return None;
    }
    let mut args = args.skip_while(|arg| *arg != package);
    let _package = args.next()?;
    let version = args.next()?;
    // At least one more argument follows the version on a real launch
    args.next()?;
    Some(version.to_string())
}
