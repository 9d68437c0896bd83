use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// DeviceContext — Where a buffer lives and where a graph partition runs
//
// A context is a (device kind, device index) pair. The executor uses one as
// the primary placement of a bound graph and a map of them to override the
// placement of named subgraph groups.
//
// Contexts render as `kind(index)`, e.g. `cpu(0)`, `gpu(1)`, `cpu_pinned(0)`,
// and parse back from the same text.

/// Kind of device a context refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    CpuPinned,
    CpuShared,
}

impl DeviceKind {
    /// Native device-type id.
    pub fn type_id(&self) -> u32 {
        match self {
            DeviceKind::Cpu => 1,
            DeviceKind::Gpu => 2,
            DeviceKind::CpuPinned => 3,
            DeviceKind::CpuShared => 5,
        }
    }

    /// Whether buffers of this kind are host-addressable.
    pub fn is_host(&self) -> bool {
        !matches!(self, DeviceKind::Gpu)
    }

    fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::CpuPinned => "cpu_pinned",
            DeviceKind::CpuShared => "cpu_shared",
        }
    }
}

/// A (device kind, device index) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceContext {
    pub kind: DeviceKind,
    pub index: u32,
}

impl DeviceContext {
    pub fn new(kind: DeviceKind, index: u32) -> Self {
        DeviceContext { kind, index }
    }

    pub fn cpu(index: u32) -> Self {
        DeviceContext::new(DeviceKind::Cpu, index)
    }

    pub fn gpu(index: u32) -> Self {
        DeviceContext::new(DeviceKind::Gpu, index)
    }

    pub fn cpu_pinned(index: u32) -> Self {
        DeviceContext::new(DeviceKind::CpuPinned, index)
    }

    pub fn cpu_shared(index: u32) -> Self {
        DeviceContext::new(DeviceKind::CpuShared, index)
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        DeviceContext::cpu(0)
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.as_str(), self.index)
    }
}

impl FromStr for DeviceContext {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (kind, rest) = s
            .split_once('(')
            .ok_or_else(|| Error::msg(format!("malformed device context '{s}'")))?;
        let index = rest
            .strip_suffix(')')
            .and_then(|i| i.trim().parse::<u32>().ok())
            .ok_or_else(|| Error::msg(format!("malformed device index in '{s}'")))?;
        let kind = match kind.trim() {
            "cpu" => DeviceKind::Cpu,
            "gpu" => DeviceKind::Gpu,
            "cpu_pinned" => DeviceKind::CpuPinned,
            "cpu_shared" => DeviceKind::CpuShared,
            other => return Err(Error::msg(format!("unknown device kind '{other}'"))),
        };
        Ok(DeviceContext { kind, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        for ctx in [
            DeviceContext::cpu(0),
            DeviceContext::gpu(3),
            DeviceContext::cpu_pinned(1),
            DeviceContext::cpu_shared(0),
        ] {
            let text = ctx.to_string();
            assert_eq!(text.parse::<DeviceContext>().unwrap(), ctx);
        }
        assert_eq!(DeviceContext::gpu(1).to_string(), "gpu(1)");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("tpu(0)".parse::<DeviceContext>().is_err());
        assert!("cpu".parse::<DeviceContext>().is_err());
        assert!("cpu(x)".parse::<DeviceContext>().is_err());
    }

    #[test]
    fn test_host_kinds() {
        assert!(DeviceKind::CpuPinned.is_host());
        assert!(!DeviceKind::Gpu.is_host());
        assert_eq!(DeviceContext::default(), DeviceContext::cpu(0));
    }
}
