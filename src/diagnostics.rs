//! Process introspection for long-running captures: memory pages from
//! `/proc/self/statm`, `Vm*` lines from `/proc/self/status` and our row of
//! `ps aux`. Nothing here is fatal; unreadable sources are logged and skipped.

use std::process::Command;

use tracing::{debug, info};

/// Page counts from `/proc/self/statm`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemUsage {
    pub size: u64,
    pub resident: u64,
    pub shared: u64,
    pub text: u64,
    pub data: u64,
}

impl MemUsage {
    pub fn parse(statm: &str) -> Option<Self> {
        let fields: Vec<u64> = statm
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if fields.len() < 6 {
            return None;
        }
        Some(Self {
            size: fields[0],
            resident: fields[1],
            shared: fields[2],
            text: fields[3],
            // fields[4] (lib) is always 0 since Linux 2.6
            data: fields[5],
        })
    }

    pub fn read() -> Option<Self> {
        let statm = std::fs::read_to_string("/proc/self/statm")
            .map_err(|e| debug!("cannot read /proc/self/statm: {e}"))
            .ok()?;
        Self::parse(&statm)
    }
}

/// `VmPeak`, `VmRSS`, ... lines of a `/proc/<pid>/status` dump.
pub fn vm_lines(status: &str) -> Vec<&str> {
    status.lines().filter(|l| l.starts_with("Vm")).collect()
}

/// The `ps aux` row whose PID column equals `pid`.
pub fn find_ps_row(ps_output: &str, pid: u32) -> Option<&str> {
    let pid = pid.to_string();
    ps_output
        .lines()
        .find(|line| line.split_whitespace().nth(1) == Some(pid.as_str()))
}

fn ps_row(pid: u32) -> Option<String> {
    let output = Command::new("ps")
        .arg("aux")
        .output()
        .map_err(|e| debug!("cannot run ps: {e}"))
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    find_ps_row(&stdout, pid).map(|row| row.trim().to_string())
}

/// Log a full process report.
pub fn report(frames: u64) {
    match MemUsage::read() {
        Some(mem) => info!(
            frames,
            size = mem.size,
            resident = mem.resident,
            shared = mem.shared,
            text = mem.text,
            data = mem.data,
            "memory usage (pages)"
        ),
        None => debug!("memory usage unavailable"),
    }

    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => {
            for line in vm_lines(&status) {
                info!("{}", line.split_whitespace().collect::<Vec<_>>().join(" "));
            }
        }
        Err(e) => debug!("cannot read /proc/self/status: {e}"),
    }

    if let Some(row) = ps_row(std::process::id()) {
        info!("ps: {row}");
    }
}

/// Reports process status every `every` frames.
#[derive(Clone, Copy, Debug)]
pub struct ProcessProbe {
    every: u64,
}

impl ProcessProbe {
    pub fn new(every: u64) -> Self {
        Self { every }
    }

    /// Whether the `frames`-th frame triggers a report.
    pub fn is_due(&self, frames: u64) -> bool {
        self.every > 0 && frames > 0 && frames % self.every == 0
    }

    pub fn on_frame(&self, frames: u64) {
        if self.is_due(frames) {
            report(frames);
        }
    }
}

/// Human readable host description for the startup banner.
pub fn os_description() -> String {
    #[cfg(windows)]
    {
        Command::new("cmd")
            .args(["/C", "ver"])
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|ver| !ver.is_empty())
            .unwrap_or_else(|| "Windows (version unknown)".to_string())
    }

    #[cfg(target_os = "linux")]
    {
        let distro = std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| pretty_name(&content))
            .unwrap_or_else(|| "Linux".to_string());

        let kernel = Command::new("uname")
            .arg("-r")
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();

        if kernel.is_empty() {
            distro
        } else {
            format!("{distro} (kernel {kernel})")
        }
    }

    #[cfg(not(any(windows, target_os = "linux")))]
    {
        std::env::consts::OS.to_string()
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find(|l| l.starts_with("PRETTY_NAME="))
        .map(|l| {
            l.trim_start_matches("PRETTY_NAME=")
                .trim_matches('"')
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_statm() {
        let mem = MemUsage::parse("10422 1830 1503 6 0 472 0\n").unwrap();
        assert_eq!(
            mem,
            MemUsage {
                size: 10422,
                resident: 1830,
                shared: 1503,
                text: 6,
                data: 472,
            }
        );
    }

    #[test]
    fn rejects_short_or_garbled_statm() {
        assert_eq!(MemUsage::parse("1 2 3"), None);
        assert_eq!(MemUsage::parse("1 2 x 4 5 6 7"), None);
        assert_eq!(MemUsage::parse(""), None);
    }

    #[test]
    fn filters_vm_lines() {
        let status = "Name:\tstream2img\nVmPeak:\t  20000 kB\nThreads:\t1\nVmRSS:\t   5000 kB\n";
        assert_eq!(
            vm_lines(status),
            vec!["VmPeak:\t  20000 kB", "VmRSS:\t   5000 kB"]
        );
    }

    #[test]
    fn finds_ps_row_by_pid_column() {
        let ps = "\
USER  PID %CPU %MEM    VSZ   RSS TTY STAT START TIME COMMAND
root    1  0.0  0.1 168000 11000 ?   Ss   10:00 0:01 /sbin/init
root  412  2.5  0.4  90000 40000 ?   Sl   10:01 0:30 ./stream2img 1
root 1412  0.0  0.0   5000  1000 ?   S    10:02 0:00 sleep 412
";
        let row = find_ps_row(ps, 412).unwrap();
        assert!(row.contains("./stream2img"));
        assert_eq!(find_ps_row(ps, 41), None);
    }

    #[test]
    fn probe_fires_every_n_frames() {
        let probe = ProcessProbe::new(3);
        let due: Vec<u64> = (0..10).filter(|&n| probe.is_due(n)).collect();
        assert_eq!(due, vec![3, 6, 9]);
        assert!(!ProcessProbe::new(0).is_due(5));
    }

    #[test]
    fn reads_pretty_name() {
        let release = "NAME=\"Debian\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        assert_eq!(
            pretty_name(release).as_deref(),
            Some("Debian GNU/Linux 12 (bookworm)")
        );
        assert_eq!(pretty_name("ID=alpine\n"), None);
    }
}
