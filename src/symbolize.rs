//! Address to name resolution for the target process.
//!
//! The memory map is snapshotted once per session; modules loaded or
//! unloaded afterwards degrade resolution accuracy, which is accepted.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

use regex::Regex;

/// Name returned whenever an address cannot be resolved.
pub const UNKNOWN_SYMBOL: &str = "unknown";

/// One executable, file-backed mapping of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub executable: bool,
    pub path: String,
}

/// External collaborator that names a (module, relative offset) pair.
pub trait NameSource {
    fn name_for(&self, module: &Path, offset: u64) -> Option<String>;
}

/// Shells out to addr2line. The first stdout line is the best-effort name;
/// a non-zero exit or empty output is a miss.
pub struct Addr2LineSource;

impl NameSource for Addr2LineSource {
    fn name_for(&self, module: &Path, offset: u64) -> Option<String> {
        let output = Command::new("addr2line")
            .arg("-e")
            .arg(module)
            .arg("-f")
            .arg(format!("{offset:#x}"))
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next()?.trim();
        if first.is_empty() {
            None
        } else {
            Some(first.to_string())
        }
    }
}

pub struct SymbolResolver<S = Addr2LineSource> {
    regions: Vec<MemoryRegion>,
    source: S,
    cache: HashMap<u64, String>,
}

impl SymbolResolver<Addr2LineSource> {
    /// Snapshot the executable, file-backed mappings of `pid`.
    pub fn load_regions(pid: i32) -> io::Result<Self> {
        let maps = fs::read_to_string(format!("/proc/{pid}/maps"))?;
        Ok(Self::from_regions(parse_maps(&maps), Addr2LineSource))
    }
}

impl<S: NameSource> SymbolResolver<S> {
    pub fn from_regions(mut regions: Vec<MemoryRegion>, source: S) -> Self {
        // Regions are non-overlapping, so sorting by start enables a
        // partition-point containment lookup.
        regions.sort_by_key(|region| region.start);
        SymbolResolver {
            regions,
            source,
            cache: HashMap::new(),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_for(&self, addr: u64) -> Option<&MemoryRegion> {
        let idx = self.regions.partition_point(|region| region.start <= addr);
        let region = &self.regions[idx.checked_sub(1)?];
        (addr < region.end).then_some(region)
    }

    /// Resolve one sampled address. Results are cached by address so the
    /// external collaborator is spawned once per distinct instruction
    /// pointer, not once per raw sample. Every failure degrades to
    /// [`UNKNOWN_SYMBOL`].
    pub fn resolve(&mut self, addr: u64) -> String {
        if let Some(name) = self.cache.get(&addr) {
            return name.clone();
        }
        let name = match self.region_for(addr) {
            Some(region) => self
                .source
                .name_for(Path::new(&region.path), addr - region.start)
                .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string()),
            None => UNKNOWN_SYMBOL.to_string(),
        };
        self.cache.insert(addr, name.clone());
        name
    }
}

/// Parse a /proc/<pid>/maps listing, retaining only executable segments
/// backed by a named file. Anonymous mappings carry no path and pseudo
/// segments ([stack], [heap], [vdso], ...) are not symbolication targets.
fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    let line_re =
        Regex::new(r"^([0-9a-f]+)-([0-9a-f]+) (\S{4}) \S+ \S+ \S+ +(.+)$").unwrap();
    let mut regions = Vec::new();
    for line in content.lines() {
        let Some(caps) = line_re.captures(line) else {
            continue;
        };
        if !caps[3].contains('x') {
            continue;
        }
        let path = caps[4].trim();
        if path.is_empty() || path.starts_with('[') {
            continue;
        }
        let (Ok(start), Ok(end)) = (
            u64::from_str_radix(&caps[1], 16),
            u64::from_str_radix(&caps[2], 16),
        ) else {
            continue;
        };
        regions.push(MemoryRegion {
            start,
            end,
            executable: true,
            path: path.to_string(),
        });
    }
    regions
}
